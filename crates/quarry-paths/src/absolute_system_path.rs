use std::{
    fmt, fs,
    io::{self, Write},
    path::{Path, PathBuf},
};

use crate::{AbsoluteSystemPathBuf, AnchoredSystemPath, AnchoredSystemPathBuf, PathError};

/// A borrowed absolute path using the system separator.
#[derive(Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct AbsoluteSystemPath(Path);

impl AbsoluteSystemPath {
    /// Validates that the path is absolute.
    pub fn new<P: AsRef<Path> + ?Sized>(value: &P) -> Result<&Self, PathError> {
        let path = value.as_ref();
        if !path.is_absolute() {
            return Err(PathError::NotAbsolute(path.display().to_string()));
        }
        Ok(unsafe { Self::new_unchecked(path) })
    }

    pub fn from_std_path(path: &Path) -> Result<&Self, PathError> {
        Self::new(path)
    }

    /// The caller is responsible for ensuring the path is absolute.
    pub(crate) unsafe fn new_unchecked(path: &Path) -> &Self {
        &*(path as *const Path as *const Self)
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }

    pub fn as_str(&self) -> &str {
        // Absolute paths we construct are valid unicode; fall back to lossless
        // debug formatting only in Display.
        self.0.to_str().unwrap_or_default()
    }

    pub fn to_owned(&self) -> AbsoluteSystemPathBuf {
        AbsoluteSystemPathBuf(self.0.to_path_buf())
    }

    pub fn parent(&self) -> Option<&AbsoluteSystemPath> {
        // The parent of an absolute path is still absolute.
        self.0
            .parent()
            .map(|p| unsafe { AbsoluteSystemPath::new_unchecked(p) })
    }

    pub fn join_component(&self, segment: &str) -> AbsoluteSystemPathBuf {
        debug_assert!(!segment.contains(std::path::MAIN_SEPARATOR));
        AbsoluteSystemPathBuf(self.0.join(segment))
    }

    pub fn join_components(&self, segments: &[&str]) -> AbsoluteSystemPathBuf {
        let mut path = self.0.to_path_buf();
        for segment in segments {
            debug_assert!(!segment.contains(std::path::MAIN_SEPARATOR));
            path.push(segment);
        }
        AbsoluteSystemPathBuf(path)
    }

    /// Resolves an anchored path against this path.
    pub fn resolve(&self, anchored: &AnchoredSystemPath) -> AbsoluteSystemPathBuf {
        AbsoluteSystemPathBuf(self.0.join(anchored.as_path()))
    }

    /// Joins a forward-slash relative path, converting separators as needed.
    pub fn join_unix_path(&self, unix: &crate::RelativeUnixPathBuf) -> AbsoluteSystemPathBuf {
        let mut path = self.0.to_path_buf();
        for segment in unix.as_str().split('/').filter(|s| !s.is_empty()) {
            path.push(segment);
        }
        AbsoluteSystemPathBuf(path)
    }

    pub fn anchor(&self, path: &AbsoluteSystemPath) -> Result<AnchoredSystemPathBuf, PathError> {
        AnchoredSystemPathBuf::new(self, path)
    }

    pub fn file_name(&self) -> Option<&str> {
        self.0.file_name().and_then(|name| name.to_str())
    }

    pub fn extension(&self) -> Option<&str> {
        self.0.extension().and_then(|ext| ext.to_str())
    }

    pub fn exists(&self) -> bool {
        self.0.exists()
    }

    pub fn is_dir(&self) -> bool {
        self.0.is_dir()
    }

    pub fn create_dir_all(&self) -> Result<(), io::Error> {
        fs::create_dir_all(&self.0)
    }

    /// Creates the parent directories as needed and writes `contents`.
    pub fn create_with_contents(&self, contents: impl AsRef<[u8]>) -> Result<(), io::Error> {
        if let Some(parent) = self.parent() {
            parent.create_dir_all()?;
        }
        let mut f = fs::File::create(&self.0)?;
        f.write_all(contents.as_ref())?;
        Ok(())
    }

    pub fn read(&self) -> Result<Vec<u8>, io::Error> {
        fs::read(&self.0)
    }

    pub fn read_to_string(&self) -> Result<String, io::Error> {
        fs::read_to_string(&self.0)
    }

    /// Reads the file if it exists; a missing file is not an error.
    pub fn read_existing_to_string(&self) -> Result<Option<String>, io::Error> {
        match fs::read_to_string(&self.0) {
            Ok(contents) => Ok(Some(contents)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn remove_file(&self) -> Result<(), io::Error> {
        fs::remove_file(&self.0)
    }

    pub fn read_dir(&self) -> Result<fs::ReadDir, io::Error> {
        fs::read_dir(&self.0)
    }

    pub fn copy_to(&self, to: &AbsoluteSystemPath) -> Result<u64, io::Error> {
        if let Some(parent) = to.parent() {
            parent.create_dir_all()?;
        }
        fs::copy(&self.0, to.as_path())
    }
}

impl fmt::Display for AbsoluteSystemPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.display().fmt(f)
    }
}

impl AsRef<AbsoluteSystemPath> for AbsoluteSystemPath {
    fn as_ref(&self) -> &AbsoluteSystemPath {
        self
    }
}

impl AsRef<Path> for AbsoluteSystemPath {
    fn as_ref(&self) -> &Path {
        &self.0
    }
}

impl From<&AbsoluteSystemPath> for PathBuf {
    fn from(path: &AbsoluteSystemPath) -> Self {
        path.0.to_path_buf()
    }
}
