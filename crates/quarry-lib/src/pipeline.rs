//! The pipeline session: graph resolution, recorded-edge seeding, and the
//! cache-or-build wrapper around the caller's per-package operation.

use std::{
    collections::{BTreeMap, HashMap},
    future::Future,
    sync::{Arc, Mutex},
};

use tracing::{debug, warn};

use quarry_cache::{
    CacheCheck, CacheClient, CacheOpts, CacheStatus, PackageCacheContext, RemoteOpts,
};
use quarry_paths::{AbsoluteSystemPathBuf, AnchoredSystemPath, AnchoredSystemPathBuf};
use quarry_repository::{
    discovery::LocalPackageDiscovery,
    manifest::DepSection,
    package_graph::{self, PackageGraph, TopoSort},
};
use quarry_scheduler::{OperationError, RunOpts, Scheduler};

use crate::{config::RepoConfig, filter::PackageFilter, record::IndirectDepRecord, Error};

pub struct Pipeline {
    repo_root: AbsoluteSystemPathBuf,
    config: RepoConfig,
    filter: PackageFilter,
    graph: Option<PackageGraph>,
}

/// The outcome of one pipeline run: per-package failures plus how each
/// package's cache check went.
#[derive(Debug)]
pub struct PipelineRun {
    pub result: quarry_scheduler::RunResult,
    pub cache_statuses: HashMap<AnchoredSystemPathBuf, CacheStatus>,
}

impl PipelineRun {
    pub fn is_success(&self) -> bool {
        self.result.is_success()
    }
}

struct PackageRunData {
    name: String,
    scripts: BTreeMap<String, String>,
    deps: Vec<AnchoredSystemPathBuf>,
}

impl Pipeline {
    pub fn new(repo_root: AbsoluteSystemPathBuf, config: RepoConfig) -> Result<Self, Error> {
        let filter = PackageFilter::new(
            &config.only,
            &config.ignore,
            config.scope.as_deref(),
        )?;
        Ok(Self {
            repo_root,
            config,
            filter,
            graph: None,
        })
    }

    /// Loads config from the repo root and builds the pipeline around it.
    pub fn for_repo(repo_root: AbsoluteSystemPathBuf) -> Result<Self, Error> {
        let config = RepoConfig::load(&repo_root)?;
        Self::new(repo_root, config)
    }

    pub fn with_filter(mut self, filter: PackageFilter) -> Self {
        self.filter = filter;
        self
    }

    pub fn graph(&self) -> Option<&PackageGraph> {
        self.graph.as_ref()
    }

    pub fn topo_sort(&self) -> Option<TopoSort> {
        self.graph.as_ref().map(PackageGraph::topo_sort)
    }

    fn record_path(&self) -> AbsoluteSystemPathBuf {
        self.repo_root
            .join_components(&[".quarry", "indirect-deps.json"])
    }

    /// Builds the dependency graph: discovery, manifest parsing, direct and
    /// transitive resolution, then replay of the persisted
    /// indirect-dependency record (with an idempotent re-resolve). The
    /// fresh record is written back afterwards.
    pub async fn resolve(&mut self) -> Result<&PackageGraph, Error> {
        let discovery = LocalPackageDiscovery::new(
            self.repo_root.clone(),
            self.config.package_globs.clone(),
        );
        let mut graph = PackageGraph::builder()
            .with_package_discovery(discovery)
            .build(&self.repo_root)
            .await?;

        let record_path = self.record_path();
        if let Some(record) = IndirectDepRecord::load(&record_path)? {
            for (from, deps) in &record.0 {
                for to in deps {
                    match graph.add_dep_by_path(from, to, DepSection::Dep) {
                        Ok(_) => {}
                        Err(package_graph::Error::UnknownPackage(package)) => {
                            debug!("recorded edge names unknown package {package}, dropping");
                        }
                        Err(err) => return Err(err.into()),
                    }
                }
            }
            graph.resolve()?;
        }
        IndirectDepRecord::from_graph(&graph).save(&record_path)?;

        self.graph = Some(graph);
        Ok(self.graph.as_ref().expect("graph was just stored"))
    }

    fn cache_opts(&self) -> CacheOpts {
        let cache_rel = quarry_paths::RelativeUnixPathBuf::new(self.config.cache_dir.clone())
            .unwrap_or_else(|_| {
                warn!(
                    "cacheDir {:?} is not repo-relative, using the default",
                    self.config.cache_dir
                );
                quarry_paths::RelativeUnixPathBuf::new(".quarry/cache")
                    .expect("default cache dir is relative")
            });
        let cache_dir = self.repo_root.join_unix_path(&cache_rel);
        CacheOpts {
            cache_dir,
            remote: self.config.remote_cache_url.as_ref().map(|url| RemoteOpts {
                base_url: url.clone(),
                token: self.config.remote_cache_token.clone(),
            }),
            include_globs: self.config.cache_include.clone(),
            exclude_globs: self.config.cache_exclude.clone(),
            output_globs: self.config.output_globs.clone(),
            env_allowlist: self.config.env_allowlist.clone(),
            tool_versions: self.config.tool_versions.clone(),
            meta_high_water: self.config.meta_high_water,
            meta_keep: self.config.meta_keep,
        }
    }

    /// Runs `operation` once per in-scope package, dependency-ordered,
    /// wrapped in the cache protocol: a hit restores the recorded outputs
    /// instead of running the operation; a miss records a diagnostic diff,
    /// runs the operation, and stores the fresh outputs.
    pub async fn start<F, Fut>(&self, opts: RunOpts, operation: F) -> Result<PipelineRun, Error>
    where
        F: Fn(AnchoredSystemPathBuf) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), OperationError>> + Send + 'static,
    {
        let graph = self.graph.as_ref().ok_or(Error::GraphNotResolved)?;
        let scheduler = Scheduler::new(graph)?;
        let cache = Arc::new(CacheClient::new(self.repo_root.clone(), self.cache_opts())?);

        let run_data: Arc<HashMap<AnchoredSystemPathBuf, PackageRunData>> = Arc::new(
            graph
                .dep_map()
                .iter()
                .map(|(path, record)| {
                    let info = graph
                        .package_info(path)
                        .expect("dep map only contains known packages");
                    (
                        path.clone(),
                        PackageRunData {
                            name: info.name().to_string(),
                            scripts: info.manifest.scripts.clone(),
                            deps: record.local_deps.keys().cloned().collect(),
                        },
                    )
                })
                .collect(),
        );
        let statuses: Arc<Mutex<HashMap<AnchoredSystemPathBuf, CacheStatus>>> =
            Arc::new(Mutex::new(HashMap::new()));

        let include_data = run_data.clone();
        let filter = &self.filter;
        let include = move |path: &AnchoredSystemPath| {
            include_data
                .get(&path.to_owned())
                .map(|data| filter.matches(&data.name))
                .unwrap_or(true)
        };

        let operation = Arc::new(operation);
        let op_cache = cache.clone();
        let op_statuses = statuses.clone();
        let wrapped = move |path: AnchoredSystemPathBuf| {
            let cache = op_cache.clone();
            let run_data = run_data.clone();
            let statuses = op_statuses.clone();
            let operation = operation.clone();
            async move {
                let data = run_data
                    .get(&path)
                    .expect("scheduler only emits known packages");
                let ctx = PackageCacheContext {
                    package_path: &path,
                    npm_scripts: &data.scripts,
                };

                // A cache IO failure is a miss, never a failed run.
                let check = match cache.check_cache(&ctx, &data.deps).await {
                    Ok(check) => check,
                    Err(err) => {
                        warn!("{path}: cache check failed, rebuilding: {err}");
                        CacheCheck {
                            status: CacheStatus::Absent,
                            input: None,
                        }
                    }
                };

                if check.status.is_hit() {
                    if let Some(input) = &check.input {
                        match cache.restore_from_cache(&ctx, input) {
                            Ok(restored) => {
                                debug!("{path}: restored {} cached files", restored.len());
                                statuses.lock().unwrap().insert(path.clone(), check.status);
                                return Ok(());
                            }
                            Err(err) => warn!("{path}: restore failed, rebuilding: {err}"),
                        }
                    }
                }

                if let Some(input) = &check.input {
                    if let Err(err) = cache.save_cache_miss_details(&ctx, input) {
                        debug!("{path}: unable to write miss diagnostics: {err}");
                    }
                }

                operation(path.clone()).await?;

                if let Err(err) = cache.copy_to_cache(&ctx, check.input, &data.deps).await {
                    warn!("{path}: unable to store build outputs: {err}");
                }
                statuses
                    .lock()
                    .unwrap()
                    .insert(path.clone(), CacheStatus::Absent);
                Ok(())
            }
        };

        let result = scheduler.start(opts, include, wrapped).await;

        let cache_statuses = match Arc::try_unwrap(statuses) {
            Ok(mutex) => mutex.into_inner().unwrap_or_else(|poison| poison.into_inner()),
            Err(shared) => shared.lock().unwrap().clone(),
        };
        Ok(PipelineRun {
            result,
            cache_statuses,
        })
    }

    /// Evicts stale cache entries; safe to run between builds.
    pub fn clean_cache(&self) -> Result<quarry_cache::PruneStats, Error> {
        let cache = CacheClient::new(self.repo_root.clone(), self.cache_opts())?;
        Ok(cache.clean_cache_files()?)
    }
}
