use std::{fmt, path::Path};

use crate::{AnchoredSystemPathBuf, RelativeUnixPathBuf};

/// A borrowed path anchored at the repository root.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct AnchoredSystemPath(Path);

impl AnchoredSystemPath {
    pub(crate) unsafe fn new_unchecked(path: &Path) -> &Self {
        &*(path as *const Path as *const Self)
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }

    pub fn to_owned(&self) -> AnchoredSystemPathBuf {
        AnchoredSystemPathBuf(self.0.to_path_buf())
    }

    pub fn parent(&self) -> Option<&AnchoredSystemPath> {
        self.0
            .parent()
            .map(|p| unsafe { AnchoredSystemPath::new_unchecked(p) })
    }

    /// The canonical forward-slash form, used for identity and persisted keys.
    pub fn to_unix(&self) -> RelativeUnixPathBuf {
        let unix = self
            .0
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        RelativeUnixPathBuf::new_unchecked(unix)
    }
}

impl fmt::Display for AnchoredSystemPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_unix())
    }
}

impl AsRef<AnchoredSystemPath> for AnchoredSystemPath {
    fn as_ref(&self) -> &AnchoredSystemPath {
        self
    }
}
