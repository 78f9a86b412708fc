//! Repository configuration. Read from `.quarryrc.json` at the repo root
//! when present; every field has a default so an empty file (or none at
//! all) is a working setup.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use quarry_paths::AbsoluteSystemPath;

use crate::Error;

pub const CONFIG_FILE: &str = ".quarryrc.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RepoConfig {
    /// Globs locating package manifests, relative to the repo root.
    pub package_globs: Vec<String>,
    /// Cache location, relative to the repo root.
    pub cache_dir: String,
    pub remote_cache_url: Option<String>,
    pub remote_cache_token: Option<String>,
    pub concurrency: usize,
    /// Fingerprint include/exclude rules, relative to each package dir.
    pub cache_include: Vec<String>,
    pub cache_exclude: Vec<String>,
    /// Which produced files are cached per package.
    pub output_globs: Vec<String>,
    /// Env var name patterns folded into fingerprints.
    pub env_allowlist: Vec<String>,
    /// Tool versions pinned into every fingerprint.
    pub tool_versions: BTreeMap<String, String>,
    pub meta_high_water: usize,
    pub meta_keep: usize,
    /// Package-name filters applied to scheduling.
    pub ignore: Vec<String>,
    pub only: Vec<String>,
    pub scope: Option<String>,
}

impl Default for RepoConfig {
    fn default() -> Self {
        Self {
            package_globs: vec!["packages/*/package.json".to_string()],
            cache_dir: ".quarry/cache".to_string(),
            remote_cache_url: None,
            remote_cache_token: None,
            concurrency: 10,
            cache_include: vec![],
            cache_exclude: vec!["dist/**".to_string()],
            output_globs: vec!["dist/**".to_string()],
            env_allowlist: vec!["NODE_ENV".to_string()],
            tool_versions: BTreeMap::new(),
            meta_high_water: 20,
            meta_keep: 10,
            ignore: vec![],
            only: vec![],
            scope: None,
        }
    }
}

impl RepoConfig {
    pub fn load(repo_root: &AbsoluteSystemPath) -> Result<Self, Error> {
        match repo_root
            .join_component(CONFIG_FILE)
            .read_existing_to_string()?
        {
            Some(contents) => Ok(serde_json::from_str(&contents)?),
            None => Ok(Self::default()),
        }
    }
}
