use miette::Diagnostic;
use semver::Version;
use tracing::warn;

use quarry_paths::{
    AbsoluteSystemPath, AnchoredSystemPathBuf, PathError,
};

use super::{PackageGraph, PackageInfo, PackageRef};
use crate::{
    discovery::{self, PackageDiscovery},
    manifest::{self, PackageManifest},
};

#[derive(Debug, Diagnostic, thiserror::Error)]
pub enum Error {
    #[error("manifest must have a name field: {0}")]
    ManifestMissingName(String),
    #[error("two manifests resolve to the same package path: {0}")]
    DuplicatePackagePath(String),
    #[error(transparent)]
    Manifest(#[from] manifest::Error),
    #[error(transparent)]
    Discovery(#[from] discovery::Error),
    #[error("path error: {0}")]
    Path(#[from] PathError),
    #[error("unknown package: {0}")]
    UnknownPackage(String),
    #[error("transitive resolution failed to settle within {0} passes")]
    RunawayResolution(usize),
}

/// Marker for a builder that has not been handed a discovery strategy; it
/// must be given manifests directly or a strategy via
/// `with_package_discovery`.
#[derive(Debug, Default)]
pub struct NoDiscovery;

pub struct PackageGraphBuilder<T> {
    manifests: Option<Vec<(AnchoredSystemPathBuf, PackageManifest)>>,
    package_discovery: T,
}

impl Default for PackageGraphBuilder<NoDiscovery> {
    fn default() -> Self {
        Self {
            manifests: None,
            package_discovery: NoDiscovery,
        }
    }
}

impl PackageGraphBuilder<NoDiscovery> {
    pub fn new() -> Self {
        Self::default()
    }
}

impl<T> PackageGraphBuilder<T> {
    /// Inject manifests directly, keyed by package path. Discovery is
    /// skipped. Mostly useful for testing.
    pub fn with_manifests(
        mut self,
        manifests: Vec<(AnchoredSystemPathBuf, PackageManifest)>,
    ) -> Self {
        self.manifests = Some(manifests);
        self
    }

    /// Set the discovery strategy used to locate manifests on disk.
    pub fn with_package_discovery<D: PackageDiscovery>(
        self,
        discovery: D,
    ) -> PackageGraphBuilder<WithRoot<D>> {
        PackageGraphBuilder {
            manifests: self.manifests,
            package_discovery: WithRoot(discovery),
        }
    }
}

/// A discovery strategy paired with the repo root needed to anchor the
/// paths it yields.
pub struct WithRoot<D>(D);

impl PackageGraphBuilder<NoDiscovery> {
    pub async fn build(self) -> Result<PackageGraph, Error> {
        let manifests = self.manifests.unwrap_or_default();
        build_from_manifests(manifests)
    }
}

impl<D: PackageDiscovery> PackageGraphBuilder<WithRoot<D>> {
    pub async fn build(self, repo_root: &AbsoluteSystemPath) -> Result<PackageGraph, Error> {
        let manifests = match self.manifests {
            Some(manifests) => manifests,
            None => {
                let response = self.package_discovery.0.discover_packages().await?;
                let mut manifests = Vec::with_capacity(response.manifests.len());
                for manifest_path in response.manifests {
                    let manifest = PackageManifest::load(&manifest_path)?;
                    let package_dir = manifest_path
                        .parent()
                        .unwrap_or_else(|| repo_root.as_ref());
                    let anchored = AnchoredSystemPathBuf::new(repo_root, package_dir)?;
                    manifests.push((anchored, manifest));
                }
                manifests
            }
        };
        build_from_manifests(manifests)
    }
}

fn build_from_manifests(
    manifests: Vec<(AnchoredSystemPathBuf, PackageManifest)>,
) -> Result<PackageGraph, Error> {
    let mut graph = PackageGraph::default();

    for (path, manifest) in manifests {
        let name = match manifest.name.as_deref() {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => {
                return Err(Error::ManifestMissingName(path.to_unix().into_string()));
            }
        };
        if graph.by_path.contains_key(&path) {
            return Err(Error::DuplicatePackagePath(path.to_unix().into_string()));
        }
        let version = parse_version(&name, manifest.version.as_deref());
        graph.insert_package(PackageInfo {
            package_ref: PackageRef {
                name,
                version,
                path,
            },
            manifest,
        });
    }

    graph.finish_inserts();
    graph.resolve()?;
    Ok(graph)
}

fn parse_version(name: &str, version: Option<&str>) -> Version {
    let Some(raw) = version else {
        return Version::new(0, 0, 0);
    };
    match Version::parse(raw) {
        Ok(version) => version,
        Err(_) => {
            warn!("{} has unparseable version {:?}, treating as 0.0.0", name, raw);
            Version::new(0, 0, 0)
        }
    }
}

#[cfg(test)]
mod test {
    use serde_json::json;

    use super::*;
    use crate::discovery::{DiscoveryResponse, LocalPackageDiscovery};
    use quarry_paths::AbsoluteSystemPathBuf;

    fn path(raw: &str) -> AnchoredSystemPathBuf {
        AnchoredSystemPathBuf::from_raw(raw).unwrap()
    }

    #[tokio::test]
    async fn test_missing_name_is_fatal() {
        let result = PackageGraph::builder()
            .with_manifests(vec![(
                path("packages/anon"),
                PackageManifest::from_value(json!({ "version": "1.0.0" })).unwrap(),
            )])
            .build()
            .await;
        assert!(matches!(result, Err(Error::ManifestMissingName(_))));
    }

    #[tokio::test]
    async fn test_duplicate_path_is_fatal() {
        let result = PackageGraph::builder()
            .with_manifests(vec![
                (
                    path("packages/a"),
                    PackageManifest::from_value(json!({ "name": "a" })).unwrap(),
                ),
                (
                    path("packages/a"),
                    PackageManifest::from_value(json!({ "name": "a-again" })).unwrap(),
                ),
            ])
            .build()
            .await;
        assert!(matches!(result, Err(Error::DuplicatePackagePath(_))));
    }

    #[tokio::test]
    async fn test_missing_version_defaults_to_zero() {
        let graph = PackageGraph::builder()
            .with_manifests(vec![(
                path("packages/a"),
                PackageManifest::from_value(json!({ "name": "a" })).unwrap(),
            )])
            .build()
            .await
            .unwrap();
        let info = graph.package_info(&path("packages/a")).unwrap();
        assert_eq!(info.package_ref.version, Version::new(0, 0, 0));
        assert_eq!(info.package_ref.id(), "a@0.0.0");
    }

    struct MockDiscovery(Vec<AbsoluteSystemPathBuf>);
    impl PackageDiscovery for MockDiscovery {
        async fn discover_packages(&self) -> Result<DiscoveryResponse, discovery::Error> {
            Ok(DiscoveryResponse {
                manifests: self.0.clone(),
            })
        }
    }

    #[tokio::test]
    async fn test_build_from_discovered_manifests() {
        let dir = tempfile::tempdir().unwrap();
        let root = AbsoluteSystemPathBuf::try_from(dir.path()).unwrap();
        let a = root.join_components(&["packages", "a", "package.json"]);
        a.create_with_contents(
            serde_json::to_string(&json!({
                "name": "a", "version": "1.0.0",
                "dependencies": { "b": "*" },
            }))
            .unwrap(),
        )
        .unwrap();
        let b = root.join_components(&["packages", "b", "package.json"]);
        b.create_with_contents(serde_json::to_string(&json!({ "name": "b", "version": "2.1.0" })).unwrap())
            .unwrap();

        let graph = PackageGraph::builder()
            .with_package_discovery(MockDiscovery(vec![a, b]))
            .build(&root)
            .await
            .unwrap();

        assert_eq!(graph.len(), 2);
        let a_record = graph.dep_record(&path("packages/a")).unwrap();
        assert_eq!(
            a_record.local_deps.keys().cloned().collect::<Vec<_>>(),
            vec![path("packages/b")]
        );
    }

    #[tokio::test]
    async fn test_build_with_local_discovery() {
        let dir = tempfile::tempdir().unwrap();
        let root = AbsoluteSystemPathBuf::try_from(dir.path()).unwrap();
        root.join_components(&["packages", "a", "package.json"])
            .create_with_contents(r#"{"name": "a", "version": "1.0.0"}"#)
            .unwrap();

        let graph = PackageGraph::builder()
            .with_package_discovery(LocalPackageDiscovery::new(
                root.clone(),
                vec!["packages/*/package.json".to_string()],
            ))
            .build(&root)
            .await
            .unwrap();
        assert_eq!(graph.len(), 1);
        assert!(graph.package_by_id("a@1.0.0").is_some());
    }
}
