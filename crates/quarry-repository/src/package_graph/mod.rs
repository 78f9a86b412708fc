//! The local dependency graph.
//!
//! Packages are addressed by their repo-root-relative path, the one
//! identifier that stays unique when a repository carries several versions
//! of the same package name. Each package owns a record of forward edges
//! (`local_deps`) and backward edges (`dependents`); the two maps are
//! mirror images and are only ever updated together.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use semver::{Version, VersionReq};
use tracing::debug;

use quarry_paths::{AnchoredSystemPath, AnchoredSystemPathBuf};

use crate::manifest::{DepSection, PackageManifest};

pub mod builder;

pub use builder::{Error, PackageGraphBuilder};

/// Relaxation passes allowed before transitive resolution is declared
/// runaway. Ordinary cycles are contained pairwise and converge well below
/// this; hitting the bound means the graph state itself is inconsistent.
pub const MAX_RESOLUTION_PASSES: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageRef {
    pub name: String,
    pub version: Version,
    pub path: AnchoredSystemPathBuf,
}

impl PackageRef {
    /// `name@version`. Not unique when one version is checked in twice;
    /// `path` is the identity.
    pub fn id(&self) -> String {
        format!("{}@{}", self.name, self.version)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageInfo {
    pub package_ref: PackageRef,
    pub manifest: PackageManifest,
}

impl PackageInfo {
    pub fn name(&self) -> &str {
        &self.package_ref.name
    }

    pub fn path(&self) -> &AnchoredSystemPath {
        &self.package_ref.path
    }
}

/// A resolved edge to a local package. `indirect_steps` is present only on
/// edges discovered through transitive resolution and records the
/// intermediate hops as `name@version(section)` for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DepEdge {
    pub name: String,
    pub version: Version,
    pub path: AnchoredSystemPathBuf,
    pub section: DepSection,
    pub indirect_steps: Option<Vec<String>>,
}

impl DepEdge {
    pub fn is_direct(&self) -> bool {
        self.indirect_steps.is_none()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PackageDepRecord {
    /// Packages this one depends on, keyed by their path.
    pub local_deps: BTreeMap<AnchoredSystemPathBuf, DepEdge>,
    /// Packages that depend on this one, keyed by their path.
    pub dependents: BTreeMap<AnchoredSystemPathBuf, DepEdge>,
    /// Peers this package forms a dependency cycle with.
    pub circular_with: BTreeSet<AnchoredSystemPathBuf>,
}

/// Outcome of an `add_dep` request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdgeAddition {
    Added,
    /// The edge was already present; nothing changed.
    Exists,
    /// Both endpoints are the same package; nothing is recorded.
    SelfDependency,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TopoSort {
    /// Dependency-ordered package paths: a dependency always precedes its
    /// dependents.
    pub sorted: Vec<AnchoredSystemPathBuf>,
    /// Packages stuck in a cycle (or downstream of one); they have no
    /// position in `sorted`.
    pub circulars: Vec<AnchoredSystemPathBuf>,
}

#[derive(Debug, Default)]
pub struct PackageGraph {
    /// Same-name packages, newest version first.
    by_name: HashMap<String, Vec<AnchoredSystemPathBuf>>,
    /// `name@version` lookup. First checked-in path wins on collision.
    by_id: HashMap<String, AnchoredSystemPathBuf>,
    by_path: HashMap<AnchoredSystemPathBuf, PackageInfo>,
    dep_map: BTreeMap<AnchoredSystemPathBuf, PackageDepRecord>,
    /// `(name, range)` to the chosen path, so one range always resolves to
    /// one package within a session.
    resolution_memo: HashMap<(String, String), AnchoredSystemPathBuf>,
}

impl PackageGraph {
    pub fn builder() -> PackageGraphBuilder<builder::NoDiscovery> {
        PackageGraphBuilder::default()
    }

    pub fn len(&self) -> usize {
        self.by_path.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_path.is_empty()
    }

    pub fn package_info(&self, path: &AnchoredSystemPath) -> Option<&PackageInfo> {
        self.by_path.get(&path.to_owned())
    }

    pub fn package_by_id(&self, id: &str) -> Option<&PackageInfo> {
        self.by_id.get(id).and_then(|path| self.by_path.get(path))
    }

    /// Paths of every package sharing `name`, newest version first.
    pub fn packages_by_name(&self, name: &str) -> &[AnchoredSystemPathBuf] {
        self.by_name.get(name).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn packages(&self) -> impl Iterator<Item = (&AnchoredSystemPathBuf, &PackageInfo)> {
        self.by_path.iter()
    }

    pub fn dep_map(&self) -> &BTreeMap<AnchoredSystemPathBuf, PackageDepRecord> {
        &self.dep_map
    }

    pub fn dep_record(&self, path: &AnchoredSystemPath) -> Option<&PackageDepRecord> {
        self.dep_map.get(&path.to_owned())
    }

    /// Resolves manifest dependencies into graph edges: direct edges first,
    /// then the transitive closure. Idempotent; safe to call again after
    /// mutating the graph with `add_dep_by_path`/`add_dep_by_id`.
    pub fn resolve(&mut self) -> Result<(), Error> {
        self.resolve_direct_deps();
        self.resolve_indirect_deps()
    }

    fn resolve_direct_deps(&mut self) {
        // (from, name, range, section) tuples collected up front; resolution
        // mutates the memo and the dep map.
        let wanted: Vec<(AnchoredSystemPathBuf, String, String, DepSection)> = self
            .dep_map
            .keys()
            .cloned()
            .collect::<Vec<_>>()
            .into_iter()
            .filter_map(|path| self.by_path.get(&path).map(|info| (path, info)))
            .flat_map(|(path, info)| {
                info.manifest
                    .all_dependencies()
                    .map(|(name, range, section)| {
                        (path.clone(), name.clone(), range.clone(), section)
                    })
                    .collect::<Vec<_>>()
            })
            .collect();

        for (from, name, range, section) in wanted {
            if !self.by_name.contains_key(&name) {
                // External dependency; not this component's concern.
                continue;
            }
            let to = self.select_local(&name, &range);
            if to == from {
                debug!("{} declares a dependency on itself, skipping", name);
                continue;
            }
            let target = self
                .by_path
                .get(&to)
                .expect("resolution chose a known path");
            let edge = DepEdge {
                name: target.package_ref.name.clone(),
                version: target.package_ref.version.clone(),
                path: to,
                section,
                indirect_steps: None,
            };
            self.add_dep(&from, edge);
        }
    }

    /// Chooses the local package satisfying `range`, falling back to the
    /// highest known version when nothing satisfies (or the range does not
    /// parse). Memoized so repeated references resolve identically.
    fn select_local(&mut self, name: &str, range: &str) -> AnchoredSystemPathBuf {
        let memo_key = (name.to_string(), range.to_string());
        if let Some(path) = self.resolution_memo.get(&memo_key) {
            return path.clone();
        }

        let candidates = self
            .by_name
            .get(name)
            .expect("select_local called for a known name");
        let chosen = match VersionReq::parse(range) {
            Ok(req) => candidates
                .iter()
                .find(|path| {
                    self.by_path
                        .get(*path)
                        .map(|info| req.matches(&info.package_ref.version))
                        .unwrap_or(false)
                })
                .unwrap_or_else(|| {
                    debug!(
                        "no local {} satisfies {}, falling back to highest version",
                        name, range
                    );
                    &candidates[0]
                }),
            Err(_) => {
                debug!(
                    "unparseable range {} for {}, falling back to highest version",
                    range, name
                );
                &candidates[0]
            }
        }
        .clone();

        self.resolution_memo.insert(memo_key, chosen.clone());
        chosen
    }

    /// Computes the transitive closure by repeated relaxation: every pass
    /// extends each package's edges through its dependencies' edges, until a
    /// pass adds nothing. An edge that would point back at a package already
    /// reachable from its target is a cycle; both ends are marked circular
    /// and the edge is dropped.
    fn resolve_indirect_deps(&mut self) -> Result<(), Error> {
        let paths: Vec<AnchoredSystemPathBuf> = self.dep_map.keys().cloned().collect();
        for _pass in 0..MAX_RESOLUTION_PASSES {
            let mut added = 0usize;
            for p in &paths {
                let direct: Vec<(AnchoredSystemPathBuf, DepEdge)> = self
                    .dep_map[p]
                    .local_deps
                    .iter()
                    .map(|(path, edge)| (path.clone(), edge.clone()))
                    .collect();
                for (q, p_to_q) in direct {
                    let next_hops: Vec<DepEdge> =
                        self.dep_map[&q].local_deps.values().cloned().collect();
                    for q_to_r in next_hops {
                        let r = q_to_r.path.clone();
                        if &r == p {
                            // p reaches itself through q.
                            self.mark_circular(p, &q);
                            continue;
                        }
                        if self.dep_map[p].local_deps.contains_key(&r) {
                            continue;
                        }
                        if self.dep_map[&r].local_deps.contains_key(p) {
                            self.mark_circular(p, &r);
                            continue;
                        }
                        let mut steps = p_to_q.indirect_steps.clone().unwrap_or_default();
                        steps.push(format!(
                            "{}@{}({})",
                            p_to_q.name, p_to_q.version, q_to_r.section
                        ));
                        let edge = DepEdge {
                            name: q_to_r.name,
                            version: q_to_r.version,
                            path: r,
                            section: q_to_r.section,
                            indirect_steps: Some(steps),
                        };
                        if self.add_dep(p, edge) == EdgeAddition::Added {
                            added += 1;
                        }
                    }
                }
            }
            if added == 0 {
                return Ok(());
            }
        }
        Err(Error::RunawayResolution(MAX_RESOLUTION_PASSES))
    }

    /// Records `from` depending on `edge.path`. Forward and backward maps
    /// are updated together, then circularity is re-checked for the pair.
    pub fn add_dep(&mut self, from: &AnchoredSystemPath, edge: DepEdge) -> EdgeAddition {
        let from = from.to_owned();
        let to = edge.path.clone();
        if from == to {
            return EdgeAddition::SelfDependency;
        }
        if self.dep_map[&from].local_deps.contains_key(&to) {
            return EdgeAddition::Exists;
        }

        let from_info = &self.by_path[&from].package_ref;
        let mirror = DepEdge {
            name: from_info.name.clone(),
            version: from_info.version.clone(),
            path: from.clone(),
            section: edge.section,
            indirect_steps: edge.indirect_steps.clone(),
        };

        self.dep_map
            .get_mut(&from)
            .expect("add_dep endpoints are known")
            .local_deps
            .insert(to.clone(), edge);
        self.dep_map
            .get_mut(&to)
            .expect("add_dep endpoints are known")
            .dependents
            .insert(from.clone(), mirror);

        if self.dep_map[&to].local_deps.contains_key(&from) {
            self.mark_circular(&from, &to);
        }

        EdgeAddition::Added
    }

    /// Adds an edge between two known package paths, e.g. one recorded by a
    /// previous run. Unknown endpoints are an error.
    pub fn add_dep_by_path(
        &mut self,
        from: &AnchoredSystemPath,
        to: &AnchoredSystemPath,
        section: DepSection,
    ) -> Result<EdgeAddition, Error> {
        if !self.by_path.contains_key(&from.to_owned()) {
            return Err(Error::UnknownPackage(from.to_unix().into_string()));
        }
        let target = self
            .by_path
            .get(&to.to_owned())
            .ok_or_else(|| Error::UnknownPackage(to.to_unix().into_string()))?;
        let edge = DepEdge {
            name: target.package_ref.name.clone(),
            version: target.package_ref.version.clone(),
            path: to.to_owned(),
            section,
            indirect_steps: None,
        };
        Ok(self.add_dep(from, edge))
    }

    pub fn add_dep_by_id(
        &mut self,
        from_id: &str,
        to_id: &str,
        section: DepSection,
    ) -> Result<EdgeAddition, Error> {
        let from = self
            .by_id
            .get(from_id)
            .ok_or_else(|| Error::UnknownPackage(from_id.to_string()))?
            .clone();
        let to = self
            .by_id
            .get(to_id)
            .ok_or_else(|| Error::UnknownPackage(to_id.to_string()))?
            .clone();
        self.add_dep_by_path(&from, &to, section)
    }

    fn mark_circular(&mut self, a: &AnchoredSystemPath, b: &AnchoredSystemPath) {
        let (a, b) = (a.to_owned(), b.to_owned());
        self.dep_map
            .get_mut(&a)
            .expect("circular endpoints are known")
            .circular_with
            .insert(b.clone());
        self.dep_map
            .get_mut(&b)
            .expect("circular endpoints are known")
            .circular_with
            .insert(a);
    }

    /// Kahn's algorithm over local dependency counts. Packages whose count
    /// never reaches zero are stuck behind a cycle and come back in
    /// `circulars` instead of `sorted`.
    pub fn topo_sort(&self) -> TopoSort {
        let mut pending: BTreeMap<&AnchoredSystemPathBuf, usize> = self
            .dep_map
            .iter()
            .map(|(path, record)| (path, record.local_deps.len()))
            .collect();

        let mut queue: VecDeque<&AnchoredSystemPathBuf> = pending
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(path, _)| *path)
            .collect();

        let mut sorted = Vec::with_capacity(self.dep_map.len());
        while let Some(path) = queue.pop_front() {
            sorted.push(path.clone());
            for dependent in self.dep_map[path].dependents.keys() {
                let count = pending
                    .get_mut(dependent)
                    .expect("dependents mirror known packages");
                *count -= 1;
                if *count == 0 {
                    queue.push_back(dependent);
                }
            }
        }

        let circulars = pending
            .into_iter()
            .filter(|(_, count)| *count > 0)
            .map(|(path, _)| path.clone())
            .collect();

        TopoSort { sorted, circulars }
    }

    pub(crate) fn insert_package(&mut self, info: PackageInfo) {
        let path = info.package_ref.path.clone();
        self.by_name
            .entry(info.package_ref.name.clone())
            .or_default()
            .push(path.clone());
        self.by_id.entry(info.package_ref.id()).or_insert_with(|| {
            path.clone()
        });
        self.dep_map.entry(path.clone()).or_default();
        self.by_path.insert(path, info);
    }

    /// Re-sorts `by_name` buckets newest-version-first; run after the last
    /// `insert_package`.
    pub(crate) fn finish_inserts(&mut self) {
        let by_path = &self.by_path;
        for paths in self.by_name.values_mut() {
            paths.sort_by(|a, b| {
                let va = &by_path[a].package_ref.version;
                let vb = &by_path[b].package_ref.version;
                vb.cmp(va).then_with(|| a.cmp(b))
            });
        }
    }
}
