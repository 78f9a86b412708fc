//! Access-recency eviction for the meta store and the content pool.
//!
//! Pool files are shared across packages and versions, so deletion uses a
//! recomputed reference set: a file goes only when no surviving output meta
//! anywhere in the store still names its hash.

use std::collections::BTreeSet;

use tracing::debug;

use crate::{
    fs::{pool_file_name, CachePool},
    meta::CacheMetaStore,
    CacheError,
};

#[derive(Debug, Default, PartialEq, Eq)]
pub struct PruneStats {
    pub removed_metas: usize,
    pub removed_files: usize,
}

pub(crate) fn clean_cache_files(
    store: &CacheMetaStore,
    pool: &CachePool,
    high_water: usize,
    keep: usize,
) -> Result<PruneStats, CacheError> {
    let mut stats = PruneStats::default();
    let mut candidates: BTreeSet<String> = BTreeSet::new();

    for package_dir in store.list_package_dirs()? {
        let mut outputs = CacheMetaStore::list_outputs_in(&package_dir)?;
        if outputs.len() <= high_water {
            continue;
        }
        // Most recently used first; everything past `keep` goes.
        outputs.sort_by(|a, b| b.1.access.cmp(&a.1.access));
        for (file, meta) in outputs.split_off(keep) {
            for (rel, hash) in &meta.data.file_hashes {
                candidates.insert(pool_file_name(rel, hash));
            }
            file.remove_file()?;
            stats.removed_metas += 1;
        }
    }

    if candidates.is_empty() {
        return Ok(stats);
    }

    // Recompute what the surviving metas still reference.
    let mut referenced: BTreeSet<String> = BTreeSet::new();
    for package_dir in store.list_package_dirs()? {
        for (_, meta) in CacheMetaStore::list_outputs_in(&package_dir)? {
            for (rel, hash) in &meta.data.file_hashes {
                referenced.insert(pool_file_name(rel, hash));
            }
        }
    }

    for name in candidates.difference(&referenced) {
        pool.remove(name)?;
        stats.removed_files += 1;
    }

    debug!(
        "pruned {} cache metas and {} pool files",
        stats.removed_metas, stats.removed_files
    );
    Ok(stats)
}

#[cfg(test)]
mod test {
    use quarry_paths::{AbsoluteSystemPathBuf, AnchoredSystemPathBuf, RelativeUnixPathBuf};

    use super::*;
    use crate::meta::{OutputData, OutputMeta};

    fn meta_with(input_hash: &str, file: &str, content_hash: &str, access: i64) -> OutputMeta {
        let data = OutputData {
            input_hash: input_hash.to_string(),
            file_hashes: [(
                RelativeUnixPathBuf::new(file).unwrap(),
                content_hash.to_string(),
            )]
            .into_iter()
            .collect(),
        };
        let mut meta = OutputMeta::new(data).unwrap();
        meta.access = access;
        meta
    }

    #[test]
    fn test_prune_keeps_recent_and_shared_content() {
        let dir = tempfile::tempdir().unwrap();
        let root = AbsoluteSystemPathBuf::try_from(dir.path()).unwrap();
        let store = CacheMetaStore::new(root.join_component("meta")).unwrap();
        let pool = CachePool::new(root.join_component("pool")).unwrap();
        let package = AnchoredSystemPathBuf::from_raw("packages/a").unwrap();
        let other = AnchoredSystemPathBuf::from_raw("packages/b").unwrap();

        // Three generations for `a`; the oldest two exceed the high-water
        // mark. The oldest's content is still referenced by `b`.
        store
            .write_output(&package, &meta_with("h1", "dist/x.js", "shared", 100))
            .unwrap();
        store
            .write_output(&package, &meta_with("h2", "dist/x.js", "stale", 200))
            .unwrap();
        store
            .write_output(&package, &meta_with("h3", "dist/x.js", "fresh", 300))
            .unwrap();
        store
            .write_output(&other, &meta_with("hb", "dist/y.js", "shared", 50))
            .unwrap();
        pool.store_bytes("shared.js", b"shared").unwrap();
        pool.store_bytes("stale.js", b"stale").unwrap();
        pool.store_bytes("fresh.js", b"fresh").unwrap();

        let stats = clean_cache_files(&store, &pool, 2, 1).unwrap();
        assert_eq!(
            stats,
            PruneStats {
                removed_metas: 2,
                removed_files: 1,
            }
        );

        // Only the unshared stale file went away.
        assert!(pool.contains("shared.js"));
        assert!(pool.contains("fresh.js"));
        assert!(!pool.contains("stale.js"));

        // The newest meta survived.
        assert!(store.read_output(&package, "h3").unwrap().is_some());
        assert!(store.read_output(&package, "h2").unwrap().is_none());
        assert!(store.read_output(&package, "h1").unwrap().is_none());
    }

    #[test]
    fn test_under_high_water_is_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let root = AbsoluteSystemPathBuf::try_from(dir.path()).unwrap();
        let store = CacheMetaStore::new(root.join_component("meta")).unwrap();
        let pool = CachePool::new(root.join_component("pool")).unwrap();
        let package = AnchoredSystemPathBuf::from_raw("packages/a").unwrap();

        store
            .write_output(&package, &meta_with("h1", "dist/x.js", "only", 100))
            .unwrap();
        pool.store_bytes("only.js", b"only").unwrap();

        let stats = clean_cache_files(&store, &pool, 2, 1).unwrap();
        assert_eq!(stats, PruneStats::default());
        assert!(pool.contains("only.js"));
    }
}
