//! The content-addressed file pool. Files are stored once, named by their
//! content hash plus the original extension, and shared by every
//! package/version whose outputs contain those bytes.

use quarry_paths::{AbsoluteSystemPath, AbsoluteSystemPathBuf, RelativeUnixPathBuf};

use crate::CacheError;

pub struct CachePool {
    pool_dir: AbsoluteSystemPathBuf,
}

/// Pool file name for a cached file: content hash plus the original
/// extension, so restored files keep a recognizable suffix.
pub fn pool_file_name(rel: &RelativeUnixPathBuf, content_hash: &str) -> String {
    format!("{}{}", content_hash, rel.dotted_extension())
}

impl CachePool {
    pub fn new(pool_dir: AbsoluteSystemPathBuf) -> Result<Self, CacheError> {
        pool_dir.create_dir_all()?;
        Ok(Self { pool_dir })
    }

    pub fn path_for(&self, name: &str) -> AbsoluteSystemPathBuf {
        self.pool_dir.join_component(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.path_for(name).exists()
    }

    /// Copies `src` into the pool. Already-present entries are left alone:
    /// same hash implies same bytes, so a racing writer is harmless.
    pub fn store(&self, name: &str, src: &AbsoluteSystemPath) -> Result<(), CacheError> {
        let target = self.path_for(name);
        if target.exists() {
            return Ok(());
        }
        src.copy_to(&target)?;
        Ok(())
    }

    pub fn store_bytes(&self, name: &str, bytes: &[u8]) -> Result<(), CacheError> {
        let target = self.path_for(name);
        if target.exists() {
            return Ok(());
        }
        target.create_with_contents(bytes)?;
        Ok(())
    }

    pub fn read(&self, name: &str) -> Result<Vec<u8>, CacheError> {
        let source = self.path_for(name);
        if !source.exists() {
            return Err(CacheError::CacheMiss);
        }
        Ok(source.read()?)
    }

    /// Copies a pooled file back out to `dst`, creating parent directories.
    pub fn restore(&self, name: &str, dst: &AbsoluteSystemPath) -> Result<(), CacheError> {
        let source = self.path_for(name);
        if !source.exists() {
            return Err(CacheError::CacheMiss);
        }
        source.copy_to(dst)?;
        Ok(())
    }

    pub fn remove(&self, name: &str) -> Result<(), CacheError> {
        let target = self.path_for(name);
        if target.exists() {
            target.remove_file()?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_pool_file_name_keeps_extension() {
        let rel = RelativeUnixPathBuf::new("dist/bundle.js").unwrap();
        assert_eq!(pool_file_name(&rel, "abc123"), "abc123.js");
        let rel = RelativeUnixPathBuf::new("bin/tool").unwrap();
        assert_eq!(pool_file_name(&rel, "abc123"), "abc123");
    }

    #[test]
    fn test_store_and_restore_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let root = AbsoluteSystemPathBuf::try_from(dir.path()).unwrap();
        let pool = CachePool::new(root.join_component("pool")).unwrap();

        let src = root.join_component("original.txt");
        src.create_with_contents("hello").unwrap();
        pool.store("h1.txt", &src).unwrap();
        assert!(pool.contains("h1.txt"));

        // Storing again is a no-op, not an error.
        pool.store("h1.txt", &src).unwrap();

        let dst = root.join_components(&["restored", "copy.txt"]);
        pool.restore("h1.txt", &dst).unwrap();
        assert_eq!(dst.read_to_string().unwrap(), "hello");

        assert!(matches!(
            pool.restore("missing", &dst),
            Err(CacheError::CacheMiss)
        ));
    }
}
