//! Input fingerprinting. A package's fingerprint covers its matched source
//! files (content hashes, never mtimes), allow-listed environment
//! variables, script bodies, pinned tool versions, and the recorded output
//! hashes of its local dependencies.

use std::collections::BTreeMap;

use globset::GlobSet;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use quarry_paths::{AbsoluteSystemPath, AnchoredSystemPathBuf, RelativeUnixPathBuf};

use crate::CacheError;

/// Everything the fingerprint hash is computed over.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InputData {
    pub env: BTreeMap<String, String>,
    pub npm_scripts: BTreeMap<String, String>,
    pub versions: BTreeMap<String, String>,
    pub file_hashes: BTreeMap<RelativeUnixPathBuf, String>,
    /// Recorded output hashes of local dependencies, sorted. This is what
    /// makes the fingerprint dependency-aware.
    pub extra: Vec<String>,
}

/// A computed fingerprint: the matched file list, the hashable data, and
/// the digest used as the cache key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheInput {
    pub files: Vec<RelativeUnixPathBuf>,
    pub data: InputData,
    pub hash: String,
}

impl CacheInput {
    pub fn from_data(data: InputData) -> Result<Self, CacheError> {
        let hash = hash_serializable(&data)?;
        Ok(Self {
            files: data.file_hashes.keys().cloned().collect(),
            data,
            hash,
        })
    }
}

pub(crate) fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

pub(crate) fn hash_file(path: &AbsoluteSystemPath) -> Result<String, CacheError> {
    Ok(hash_bytes(&path.read()?))
}

pub(crate) fn hash_serializable<T: Serialize>(value: &T) -> Result<String, CacheError> {
    Ok(hash_bytes(&serde_json::to_vec(value)?))
}

// Never fingerprint material under these, regardless of globs.
const SKIPPED_DIRS: [&str; 2] = ["node_modules", ".git"];

/// Walks `package_dir` and content-hashes every file matching the rule
/// sets. `include` of `None` admits everything not excluded.
pub(crate) fn collect_file_hashes(
    repo_root: &AbsoluteSystemPath,
    package_path: &AnchoredSystemPathBuf,
    include: Option<&GlobSet>,
    exclude: Option<&GlobSet>,
) -> Result<BTreeMap<RelativeUnixPathBuf, String>, CacheError> {
    let package_dir = repo_root.resolve(package_path);
    let mut hashes = BTreeMap::new();
    if !package_dir.exists() {
        return Ok(hashes);
    }

    let walker = walkdir::WalkDir::new(package_dir.as_path())
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| {
            let name = entry.file_name().to_string_lossy();
            !(entry.file_type().is_dir() && SKIPPED_DIRS.contains(&name.as_ref()))
        });

    for entry in walker {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }
        let file = AbsoluteSystemPath::from_std_path(entry.path())?;
        let rel = entry
            .path()
            .strip_prefix(package_dir.as_path())
            .expect("walked entries live under the package dir");
        let rel = unix_rel(rel)?;
        if let Some(include) = include {
            if !include.is_match(rel.as_str()) {
                continue;
            }
        }
        if let Some(exclude) = exclude {
            if exclude.is_match(rel.as_str()) {
                continue;
            }
        }
        hashes.insert(rel, hash_file(file)?);
    }

    Ok(hashes)
}

fn unix_rel(path: &std::path::Path) -> Result<RelativeUnixPathBuf, CacheError> {
    let joined = path
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    Ok(RelativeUnixPathBuf::new(joined)?)
}

#[cfg(test)]
mod test {
    use globset::{Glob, GlobSetBuilder};
    use quarry_paths::AbsoluteSystemPathBuf;

    use super::*;

    fn glob_set(patterns: &[&str]) -> GlobSet {
        let mut builder = GlobSetBuilder::new();
        for pattern in patterns {
            builder.add(Glob::new(pattern).unwrap());
        }
        builder.build().unwrap()
    }

    fn pkg(root: &AbsoluteSystemPathBuf) -> AnchoredSystemPathBuf {
        root.join_components(&["packages", "a", "src", "index.ts"])
            .create_with_contents("export {}")
            .unwrap();
        root.join_components(&["packages", "a", "README.md"])
            .create_with_contents("# a")
            .unwrap();
        root.join_components(&["packages", "a", "dist", "index.js"])
            .create_with_contents("compiled")
            .unwrap();
        root.join_components(&["packages", "a", "node_modules", "x", "index.js"])
            .create_with_contents("vendored")
            .unwrap();
        AnchoredSystemPathBuf::from_raw("packages/a").unwrap()
    }

    #[test]
    fn test_collects_content_hashes() {
        let dir = tempfile::tempdir().unwrap();
        let root = AbsoluteSystemPathBuf::try_from(dir.path()).unwrap();
        let package = pkg(&root);

        let hashes = collect_file_hashes(&root, &package, None, None).unwrap();
        let files: Vec<_> = hashes.keys().map(|k| k.as_str()).collect();
        // node_modules never contributes; everything else does.
        assert_eq!(files, vec!["README.md", "dist/index.js", "src/index.ts"]);
        assert_eq!(
            hashes[&RelativeUnixPathBuf::new("src/index.ts").unwrap()],
            hash_bytes(b"export {}")
        );
    }

    #[test]
    fn test_exclude_rules_drop_files() {
        let dir = tempfile::tempdir().unwrap();
        let root = AbsoluteSystemPathBuf::try_from(dir.path()).unwrap();
        let package = pkg(&root);

        let exclude = glob_set(&["dist/**"]);
        let hashes = collect_file_hashes(&root, &package, None, Some(&exclude)).unwrap();
        let files: Vec<_> = hashes.keys().map(|k| k.as_str()).collect();
        assert_eq!(files, vec!["README.md", "src/index.ts"]);
    }

    #[test]
    fn test_include_rules_select_files() {
        let dir = tempfile::tempdir().unwrap();
        let root = AbsoluteSystemPathBuf::try_from(dir.path()).unwrap();
        let package = pkg(&root);

        let include = glob_set(&["src/**"]);
        let hashes = collect_file_hashes(&root, &package, Some(&include), None).unwrap();
        let files: Vec<_> = hashes.keys().map(|k| k.as_str()).collect();
        assert_eq!(files, vec!["src/index.ts"]);
    }

    #[test]
    fn test_input_hash_is_over_data_only() {
        let data = InputData {
            env: [("CI".to_string(), "true".to_string())].into_iter().collect(),
            ..Default::default()
        };
        let a = CacheInput::from_data(data.clone()).unwrap();
        let b = CacheInput::from_data(data).unwrap();
        assert_eq!(a.hash, b.hash);

        let changed = InputData {
            env: [("CI".to_string(), "false".to_string())].into_iter().collect(),
            ..Default::default()
        };
        let c = CacheInput::from_data(changed).unwrap();
        assert_ne!(a.hash, c.hash);
    }
}
