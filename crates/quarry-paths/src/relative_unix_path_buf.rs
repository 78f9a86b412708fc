use std::{fmt, ops::Deref};

use serde::{Deserialize, Serialize};

use crate::PathError;

/// A relative path that always uses forward slashes. Backed by a plain
/// string so it can serve as a JSON object key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RelativeUnixPathBuf(String);

impl RelativeUnixPathBuf {
    pub fn new(value: impl Into<String>) -> Result<Self, PathError> {
        let value = value.into();
        if value.starts_with('/') {
            return Err(PathError::NotRelative(value));
        }
        if value.contains('\\') {
            return Err(PathError::NotRelative(value));
        }
        Ok(Self(value))
    }

    pub(crate) fn new_unchecked(value: String) -> Self {
        Self(value)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }

    /// The extension including the leading dot, or an empty string.
    pub fn dotted_extension(&self) -> &str {
        let file_name = self.0.rsplit('/').next().unwrap_or(&self.0);
        match file_name.rfind('.') {
            // A leading dot names a hidden file, not an extension.
            Some(0) | None => "",
            Some(idx) => &file_name[idx..],
        }
    }
}

impl Deref for RelativeUnixPathBuf {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl fmt::Display for RelativeUnixPathBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for RelativeUnixPathBuf {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod test {
    use test_case::test_case;

    use super::*;

    #[test]
    fn test_rejects_absolute() {
        assert!(RelativeUnixPathBuf::new("/etc/passwd").is_err());
        assert!(RelativeUnixPathBuf::new(r"windows\style").is_err());
    }

    #[test_case("src/index.ts", ".ts" ; "nested file")]
    #[test_case("Makefile", "" ; "no extension")]
    #[test_case(".npmrc", "" ; "hidden file")]
    #[test_case("dist/bundle.min.js", ".js" ; "multi dot")]
    fn test_dotted_extension(path: &str, expected: &str) {
        let path = RelativeUnixPathBuf::new(path).unwrap();
        assert_eq!(path.dotted_extension(), expected);
    }
}
