//! Typed paths for quarry.
//!
//! Two families of paths exist in a repository session: absolute system
//! paths (where the repo actually lives on disk) and anchored system paths
//! (a location relative to the repo root). Keeping them as separate types
//! means a package's identity can never silently absorb a machine-specific
//! prefix. `RelativeUnixPathBuf` is the canonical forward-slash form used
//! for persisted keys and identifiers.

mod absolute_system_path;
mod absolute_system_path_buf;
mod anchored_system_path;
mod anchored_system_path_buf;
mod relative_unix_path_buf;

pub use absolute_system_path::AbsoluteSystemPath;
pub use absolute_system_path_buf::AbsoluteSystemPathBuf;
pub use anchored_system_path::AnchoredSystemPath;
pub use anchored_system_path_buf::AnchoredSystemPathBuf;
pub use relative_unix_path_buf::RelativeUnixPathBuf;

#[derive(Debug, thiserror::Error)]
pub enum PathError {
    #[error("path is not absolute: {0}")]
    NotAbsolute(String),
    #[error("path is not relative: {0}")]
    NotRelative(String),
    #[error("path {1} is not a child of {0}")]
    NotParent(String, String),
    #[error("path is not valid unicode: {0}")]
    InvalidUnicode(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
