//! Strategies for discovering package manifests on the filesystem.
//!
//! The graph builder only consumes the `PackageDiscovery` trait, so callers
//! can substitute a daemon-backed or fully mocked strategy; the local
//! strategy walks the repository with the configured manifest globs.

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use quarry_paths::{AbsoluteSystemPathBuf, AnchoredSystemPathBuf, PathError};

#[derive(Debug, Clone)]
pub struct DiscoveryResponse {
    pub manifests: Vec<AbsoluteSystemPathBuf>,
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid manifest glob: {0}")]
    Glob(#[from] globset::Error),
    #[error("unable to walk repository: {0}")]
    Walk(#[from] walkdir::Error),
    #[error(transparent)]
    Path(#[from] PathError),
}

/// Defines a strategy for discovering packages on the filesystem.
pub trait PackageDiscovery {
    fn discover_packages(
        &self,
    ) -> impl std::future::Future<Output = Result<DiscoveryResponse, Error>> + Send;
}

/// Walks the repository and matches manifest paths against the configured
/// glob patterns, e.g. `packages/*/package.json`.
pub struct LocalPackageDiscovery {
    repo_root: AbsoluteSystemPathBuf,
    manifest_globs: Vec<String>,
}

// Directories that never contain workspace manifests.
const SKIPPED_DIRS: [&str; 2] = ["node_modules", ".git"];

impl LocalPackageDiscovery {
    pub fn new(repo_root: AbsoluteSystemPathBuf, manifest_globs: Vec<String>) -> Self {
        Self {
            repo_root,
            manifest_globs,
        }
    }

    fn glob_set(&self) -> Result<GlobSet, Error> {
        let mut builder = GlobSetBuilder::new();
        for pattern in &self.manifest_globs {
            // `*` must not cross directory boundaries; `packages/*` means
            // direct children only.
            builder.add(GlobBuilder::new(pattern).literal_separator(true).build()?);
        }
        Ok(builder.build()?)
    }
}

impl PackageDiscovery for LocalPackageDiscovery {
    async fn discover_packages(&self) -> Result<DiscoveryResponse, Error> {
        tracing::debug!("discovering packages using local strategy");
        let globs = self.glob_set()?;

        let mut manifests = Vec::new();
        let walker = walkdir::WalkDir::new(self.repo_root.as_path())
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
            let path = AbsoluteSystemPathBuf::try_from(entry.path())?;
            let anchored = AnchoredSystemPathBuf::new(&self.repo_root, &path)?;
            if globs.is_match(anchored.to_unix().as_str()) {
                manifests.push(path);
            }
        }

        // Walk order is filesystem dependent; callers get a stable view.
        manifests.sort();
        Ok(DiscoveryResponse { manifests })
    }
}
