use std::{
    borrow::Borrow,
    fmt,
    ops::Deref,
    path::{Component, Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::{AbsoluteSystemPath, AnchoredSystemPath, PathError};

/// An owned path anchored at the repository root. This is the stable
/// identity of a package within a repository; two checkouts of the same
/// repo agree on it regardless of where they live on disk.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct AnchoredSystemPathBuf(pub(crate) PathBuf);

impl AnchoredSystemPathBuf {
    pub fn new(
        root: impl AsRef<AbsoluteSystemPath>,
        path: impl AsRef<AbsoluteSystemPath>,
    ) -> Result<Self, PathError> {
        let root = root.as_ref();
        let path = path.as_ref();
        let stripped = path
            .as_path()
            .strip_prefix(root.as_path())
            .map_err(|_| PathError::NotParent(root.to_string(), path.to_string()))?
            .to_path_buf();
        Ok(Self(stripped))
    }

    pub fn from_raw(raw: impl AsRef<Path>) -> Result<Self, PathError> {
        let path = raw.as_ref();
        if path.is_absolute() {
            return Err(PathError::NotRelative(path.display().to_string()));
        }
        // Accept unix separators in raw input on every platform.
        let components = path
            .to_str()
            .ok_or_else(|| PathError::InvalidUnicode(path.display().to_string()))?
            .split('/')
            .collect::<PathBuf>();
        Ok(Self(components))
    }

    /// Produces a path from `start` to `end`. Both roots are expected to be
    /// on the same filesystem prefix.
    pub fn relative_path_between(start: &AbsoluteSystemPath, end: &AbsoluteSystemPath) -> Self {
        let start_components = start
            .as_path()
            .components()
            .skip_while(|&c| matches!(c, Component::RootDir | Component::Prefix(_)))
            .collect::<Vec<_>>();
        let end_components = end
            .as_path()
            .components()
            .skip_while(|&c| matches!(c, Component::RootDir | Component::Prefix(_)))
            .collect::<Vec<_>>();
        let prefix_len = start_components
            .iter()
            .zip(end_components.iter())
            .take_while(|(a, b)| a == b)
            .count();
        let path = std::iter::repeat(Component::ParentDir)
            .take(start_components.len() - prefix_len)
            .chain(end_components.into_iter().skip(prefix_len))
            .collect::<PathBuf>();
        Self(path)
    }

    pub fn as_anchored_path(&self) -> &AnchoredSystemPath {
        self.borrow()
    }

    pub fn as_path(&self) -> &Path {
        self.0.as_path()
    }
}

impl Borrow<AnchoredSystemPath> for AnchoredSystemPathBuf {
    fn borrow(&self) -> &AnchoredSystemPath {
        unsafe { AnchoredSystemPath::new_unchecked(self.0.as_path()) }
    }
}

impl AsRef<AnchoredSystemPath> for AnchoredSystemPathBuf {
    fn as_ref(&self) -> &AnchoredSystemPath {
        self.borrow()
    }
}

impl Deref for AnchoredSystemPathBuf {
    type Target = AnchoredSystemPath;

    fn deref(&self) -> &Self::Target {
        self.borrow()
    }
}

impl fmt::Display for AnchoredSystemPathBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.as_anchored_path().fmt(f)
    }
}

// Anchored paths round-trip through the unix form so persisted data is
// identical across platforms.
impl Serialize for AnchoredSystemPathBuf {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_unix())
    }
}

impl<'de> Deserialize<'de> for AnchoredSystemPathBuf {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        AnchoredSystemPathBuf::from_raw(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn abs(path: &str) -> AbsoluteSystemPathBuf {
        let path = if cfg!(windows) {
            format!(r"C:{}", path.replace('/', "\\"))
        } else {
            path.to_string()
        };
        AbsoluteSystemPathBuf::new(path).unwrap()
    }

    use crate::AbsoluteSystemPathBuf;

    #[test]
    fn test_anchor_strips_root() {
        let root = abs("/repo");
        let pkg = abs("/repo/packages/pkg-a");
        let anchored = AnchoredSystemPathBuf::new(&root, &pkg).unwrap();
        assert_eq!(anchored.to_unix().as_str(), "packages/pkg-a");
    }

    #[test]
    fn test_anchor_rejects_stranger() {
        let root = abs("/repo");
        let other = abs("/elsewhere/pkg");
        assert!(AnchoredSystemPathBuf::new(&root, &other).is_err());
    }

    #[test]
    fn test_from_raw_accepts_unix_separators() {
        let anchored = AnchoredSystemPathBuf::from_raw("packages/pkg-a").unwrap();
        assert_eq!(anchored.to_unix().as_str(), "packages/pkg-a");
    }

    #[test]
    fn test_serde_round_trip() {
        let anchored = AnchoredSystemPathBuf::from_raw("packages/pkg-a").unwrap();
        let json = serde_json::to_string(&anchored).unwrap();
        assert_eq!(json, "\"packages/pkg-a\"");
        let back: AnchoredSystemPathBuf = serde_json::from_str(&json).unwrap();
        assert_eq!(back, anchored);
    }

    #[test]
    fn test_relative_path_between() {
        let from = abs("/repo");
        let to = abs("/repo/packages/pkg-a");
        let rel = AnchoredSystemPathBuf::relative_path_between(&from, &to);
        assert_eq!(rel.to_unix().as_str(), "packages/pkg-a");
    }
}
