//! The build cache: input fingerprinting, a local content-addressed store,
//! and a best-effort remote HTTP store.
//!
//! Lookup order is local first, then remote. The first remote failure
//! disables remote traffic for the rest of the session; local IO failures
//! degrade to a miss and a rebuild, never a failed run.

#![deny(clippy::all)]

pub mod fingerprint;
mod fs;
mod http;
mod meta;
mod miss;
mod prune;

use std::{
    collections::{BTreeMap, BTreeSet},
    sync::atomic::{AtomicBool, Ordering},
};

use globset::{Glob, GlobSet, GlobSetBuilder};
use tracing::{debug, warn};

use quarry_env::EnvironmentVariableMap;
use quarry_paths::{
    AbsoluteSystemPathBuf, AnchoredSystemPath, AnchoredSystemPathBuf, PathError,
    RelativeUnixPathBuf,
};

pub use fingerprint::{CacheInput, InputData};
pub use fs::pool_file_name;
pub use meta::{escape_package_path, InputMeta, OutputData, OutputMeta};
pub use prune::PruneStats;

use crate::{fs::CachePool, http::HttpCache, meta::CacheMetaStore};

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid cache metadata: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Path(#[from] PathError),
    #[error("invalid fingerprint pattern: {0}")]
    Glob(#[from] globset::Error),
    #[error(transparent)]
    Env(#[from] quarry_env::Error),
    #[error("unable to walk package directory: {0}")]
    Walk(#[from] walkdir::Error),
    #[error("cache miss")]
    CacheMiss,
    #[error("no cache meta recorded for dependency {0}")]
    MissingDependencyMeta(String),
    #[error("remote cache error: {0}")]
    Remote(#[from] reqwest::Error),
    #[error("remote artifact contains unexpected entry: {0}")]
    InvalidArtifact(String),
}

/// Where a cache check was satisfied, if anywhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Absent,
    LocalHit,
    RemoteHit,
}

impl CacheStatus {
    pub fn is_hit(&self) -> bool {
        !matches!(self, CacheStatus::Absent)
    }
}

#[derive(Debug, Clone)]
pub struct RemoteOpts {
    pub base_url: String,
    pub token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct CacheOpts {
    pub cache_dir: AbsoluteSystemPathBuf,
    pub remote: Option<RemoteOpts>,
    /// Fingerprint include rules, relative to the package dir. Empty means
    /// every file not excluded.
    pub include_globs: Vec<String>,
    pub exclude_globs: Vec<String>,
    /// Which produced files get cached, relative to the package dir.
    pub output_globs: Vec<String>,
    /// Env var name patterns admitted into the fingerprint.
    pub env_allowlist: Vec<String>,
    /// Tool versions pinned into every fingerprint (node, package manager).
    pub tool_versions: BTreeMap<String, String>,
    pub meta_high_water: usize,
    pub meta_keep: usize,
}

/// The per-package slice of state the cache needs to fingerprint and
/// restore it.
#[derive(Debug, Clone, Copy)]
pub struct PackageCacheContext<'a> {
    pub package_path: &'a AnchoredSystemPath,
    pub npm_scripts: &'a BTreeMap<String, String>,
}

#[derive(Debug)]
pub struct CacheCheck {
    pub status: CacheStatus,
    /// The computed fingerprint. `None` when a dependency had no recorded
    /// output meta, which makes any fingerprint untrustworthy.
    pub input: Option<CacheInput>,
}

pub struct CacheClient {
    repo_root: AbsoluteSystemPathBuf,
    opts: CacheOpts,
    store: CacheMetaStore,
    pool: CachePool,
    http: Option<HttpCache>,
    // Flipped on the first remote failure; a dead remote should cost one
    // timeout per session, not one per package.
    remote_enabled: AtomicBool,
    env: EnvironmentVariableMap,
    include: Option<GlobSet>,
    exclude: Option<GlobSet>,
    outputs: GlobSet,
}

fn build_glob_set(patterns: &[String]) -> Result<Option<GlobSet>, CacheError> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern)?);
    }
    Ok(Some(builder.build()?))
}

impl CacheClient {
    pub fn new(repo_root: AbsoluteSystemPathBuf, opts: CacheOpts) -> Result<Self, CacheError> {
        let store = CacheMetaStore::new(opts.cache_dir.join_component("meta"))?;
        let pool = CachePool::new(opts.cache_dir.join_component("pool"))?;
        let http = opts
            .remote
            .as_ref()
            .map(|remote| HttpCache::new(remote.base_url.clone(), remote.token.clone()));
        let include = build_glob_set(&opts.include_globs)?;
        let exclude = build_glob_set(&opts.exclude_globs)?;
        let outputs =
            build_glob_set(&opts.output_globs)?.unwrap_or_else(|| GlobSet::empty());
        Ok(Self {
            repo_root,
            remote_enabled: AtomicBool::new(http.is_some()),
            http,
            store,
            pool,
            env: EnvironmentVariableMap::infer(),
            include,
            exclude,
            outputs,
            opts,
        })
    }

    /// Replaces the captured environment snapshot. Test hook.
    pub fn with_env(mut self, env: EnvironmentVariableMap) -> Self {
        self.env = env;
        self
    }

    fn remote(&self) -> Option<&HttpCache> {
        if self.remote_enabled.load(Ordering::Relaxed) {
            self.http.as_ref()
        } else {
            None
        }
    }

    fn disable_remote(&self, err: &CacheError) {
        if self.remote_enabled.swap(false, Ordering::Relaxed) {
            warn!("remote cache disabled for this session: {err}");
        }
    }

    /// Computes the package's fingerprint, or `None` when some local
    /// dependency has no recorded output meta yet.
    pub fn compute_input(
        &self,
        ctx: &PackageCacheContext<'_>,
        dep_paths: &[AnchoredSystemPathBuf],
    ) -> Result<Option<CacheInput>, CacheError> {
        let mut extra = BTreeSet::new();
        for dep in dep_paths {
            match self.store.read_latest_output(dep)? {
                Some(meta) => {
                    extra.insert(meta.hash);
                }
                None => {
                    debug!(
                        "{}: dependency {} has no cache meta, fingerprint unavailable",
                        ctx.package_path, dep
                    );
                    return Ok(None);
                }
            }
        }

        let file_hashes = fingerprint::collect_file_hashes(
            &self.repo_root,
            &ctx.package_path.to_owned(),
            self.include.as_ref(),
            self.exclude.as_ref(),
        )?;
        let env = self.env.from_wildcards(&self.opts.env_allowlist)?.into_inner();
        let data = InputData {
            env,
            npm_scripts: ctx.npm_scripts.clone(),
            versions: self.opts.tool_versions.clone(),
            file_hashes,
            extra: extra.into_iter().collect(),
        };
        Ok(Some(CacheInput::from_data(data)?))
    }

    /// The cache protocol's first half: fingerprint, then look up local
    /// store and (best-effort) remote store. A remote hit is written
    /// through to the local store so the restore path is uniform.
    pub async fn check_cache(
        &self,
        ctx: &PackageCacheContext<'_>,
        dep_paths: &[AnchoredSystemPathBuf],
    ) -> Result<CacheCheck, CacheError> {
        let Some(input) = self.compute_input(ctx, dep_paths)? else {
            return Ok(CacheCheck {
                status: CacheStatus::Absent,
                input: None,
            });
        };

        if self.store.read_output(ctx.package_path, &input.hash)?.is_some() {
            return Ok(CacheCheck {
                status: CacheStatus::LocalHit,
                input: Some(input),
            });
        }

        if let Some(http) = self.remote() {
            match http.fetch(&input.hash).await {
                Ok(Some(artifact)) => {
                    for (name, bytes) in &artifact.files {
                        self.pool.store_bytes(name, bytes)?;
                    }
                    self.store.write_output(ctx.package_path, &artifact.meta)?;
                    return Ok(CacheCheck {
                        status: CacheStatus::RemoteHit,
                        input: Some(input),
                    });
                }
                Ok(None) => {}
                Err(err) => self.disable_remote(&err),
            }
        }

        Ok(CacheCheck {
            status: CacheStatus::Absent,
            input: Some(input),
        })
    }

    /// Restores the cached output files for a fingerprint into the package
    /// tree and bumps the entry's access time.
    pub fn restore_from_cache(
        &self,
        ctx: &PackageCacheContext<'_>,
        input: &CacheInput,
    ) -> Result<Vec<RelativeUnixPathBuf>, CacheError> {
        let meta = self
            .store
            .touch_output(ctx.package_path, &input.hash)?
            .ok_or(CacheError::CacheMiss)?;
        let package_dir = self.repo_root.resolve(ctx.package_path);

        let mut restored = Vec::with_capacity(meta.data.file_hashes.len());
        for (rel, content_hash) in &meta.data.file_hashes {
            let name = pool_file_name(rel, content_hash);
            let dst = package_dir.join_unix_path(rel);
            self.pool.restore(&name, &dst)?;
            restored.push(rel.clone());
        }

        self.store.write_input(
            ctx.package_path,
            &InputMeta {
                data: input.data.clone(),
                hash: input.hash.clone(),
            },
        )?;
        Ok(restored)
    }

    /// Stores the package's freshly produced outputs under its fingerprint:
    /// content-addressed pool entries, an output meta, the input baseline,
    /// and a best-effort remote upload.
    pub async fn copy_to_cache(
        &self,
        ctx: &PackageCacheContext<'_>,
        input: Option<CacheInput>,
        dep_paths: &[AnchoredSystemPathBuf],
    ) -> Result<OutputMeta, CacheError> {
        let input = match input {
            Some(input) => input,
            // The pre-build fingerprint was unavailable; by now every
            // dependency has run, so it can be computed.
            None => self
                .compute_input(ctx, dep_paths)?
                .ok_or_else(|| {
                    CacheError::MissingDependencyMeta(ctx.package_path.to_unix().into_string())
                })?,
        };

        let package_dir = self.repo_root.resolve(ctx.package_path);
        let output_hashes = fingerprint::collect_file_hashes(
            &self.repo_root,
            &ctx.package_path.to_owned(),
            Some(&self.outputs),
            None,
        )?;

        let mut remote_files = Vec::with_capacity(output_hashes.len());
        for (rel, content_hash) in &output_hashes {
            let name = pool_file_name(rel, content_hash);
            let src = package_dir.join_unix_path(rel);
            self.pool.store(&name, &src)?;
            remote_files.push(name);
        }

        let meta = OutputMeta::new(OutputData {
            input_hash: input.hash.clone(),
            file_hashes: output_hashes,
        })?;
        self.store.write_output(ctx.package_path, &meta)?;
        self.store.write_input(
            ctx.package_path,
            &InputMeta {
                data: input.data.clone(),
                hash: input.hash.clone(),
            },
        )?;

        if let Some(http) = self.remote() {
            match self.collect_remote_files(&remote_files) {
                Ok(files) => {
                    if let Err(err) = http.put(&input.hash, &meta, &files).await {
                        self.disable_remote(&err);
                    }
                }
                Err(err) => warn!("skipping remote upload: {err}"),
            }
        }

        Ok(meta)
    }

    fn collect_remote_files(
        &self,
        names: &[String],
    ) -> Result<Vec<(String, Vec<u8>)>, CacheError> {
        names
            .iter()
            .map(|name| Ok((name.clone(), self.pool.read(name)?)))
            .collect()
    }

    /// Writes a human-readable report of why this fingerprint missed,
    /// diffed against the previous one. Diagnostics only.
    pub fn save_cache_miss_details(
        &self,
        ctx: &PackageCacheContext<'_>,
        next: &CacheInput,
    ) -> Result<AbsoluteSystemPathBuf, CacheError> {
        let previous = self.store.read_input(ctx.package_path)?;
        let report = miss::render_miss_report(
            ctx.package_path.to_unix().as_str(),
            previous.as_ref().map(|meta| &meta.data),
            &next.data,
        );
        let report_path = self
            .opts
            .cache_dir
            .join_component("diagnostics")
            .join_component(&format!("{}.txt", escape_package_path(ctx.package_path)));
        report_path.create_with_contents(&report)?;
        debug!("{}", report.trim_end());
        Ok(report_path)
    }

    /// Evicts stale cache entries by access recency; see the prune module.
    pub fn clean_cache_files(&self) -> Result<PruneStats, CacheError> {
        prune::clean_cache_files(
            &self.store,
            &self.pool,
            self.opts.meta_high_water,
            self.opts.meta_keep,
        )
    }
}
