use std::{
    borrow::Borrow,
    fmt,
    ops::Deref,
    path::{Path, PathBuf},
};

use crate::{AbsoluteSystemPath, PathError};

/// An owned absolute path using the system separator.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AbsoluteSystemPathBuf(pub(crate) PathBuf);

impl AbsoluteSystemPathBuf {
    pub fn new(value: impl Into<PathBuf>) -> Result<Self, PathError> {
        let path: PathBuf = value.into();
        if !path.is_absolute() {
            return Err(PathError::NotAbsolute(path.display().to_string()));
        }
        Ok(Self(path))
    }

    pub fn as_absolute_path(&self) -> &AbsoluteSystemPath {
        self.borrow()
    }

    pub fn as_path(&self) -> &Path {
        self.0.as_path()
    }

    pub fn into_path_buf(self) -> PathBuf {
        self.0
    }
}

impl Borrow<AbsoluteSystemPath> for AbsoluteSystemPathBuf {
    fn borrow(&self) -> &AbsoluteSystemPath {
        unsafe { AbsoluteSystemPath::new_unchecked(self.0.as_path()) }
    }
}

impl AsRef<AbsoluteSystemPath> for AbsoluteSystemPathBuf {
    fn as_ref(&self) -> &AbsoluteSystemPath {
        self.borrow()
    }
}

impl Deref for AbsoluteSystemPathBuf {
    type Target = AbsoluteSystemPath;

    fn deref(&self) -> &Self::Target {
        self.borrow()
    }
}

impl TryFrom<&Path> for AbsoluteSystemPathBuf {
    type Error = PathError;

    fn try_from(path: &Path) -> Result<Self, Self::Error> {
        Self::new(path.to_path_buf())
    }
}

impl TryFrom<&str> for AbsoluteSystemPathBuf {
    type Error = PathError;

    fn try_from(path: &str) -> Result<Self, Self::Error> {
        Self::new(PathBuf::from(path))
    }
}

impl fmt::Display for AbsoluteSystemPathBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.display().fmt(f)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_deref_to_borrowed_path() {
        let root = if cfg!(windows) { r"C:\repo" } else { "/repo" };
        let buf = AbsoluteSystemPathBuf::try_from(root).unwrap();
        let joined = buf.join_component("package.json");
        assert!(joined.as_path().ends_with("package.json"));
    }
}
