//! Runs one asynchronous operation per package, respecting the local
//! dependency graph under a bounded concurrency limit. A package starts
//! only after every local dependency has settled; packages not connected
//! by a dependency path run in no particular order.

#![deny(clippy::all)]

mod walker;

use std::{collections::HashMap, future::Future, sync::Arc};

use petgraph::graph::Graph;
use thiserror::Error;
use tokio::{sync::oneshot, sync::Semaphore, task::JoinSet};

use quarry_paths::{AnchoredSystemPath, AnchoredSystemPathBuf};
use quarry_repository::package_graph::PackageGraph;

pub use walker::{WalkMessage, Walker};

#[derive(Debug, Error)]
pub enum Error {
    #[error("package graph contains an unbroken cycle")]
    CyclicGraph,
}

pub type OperationError = Box<dyn std::error::Error + Send + Sync>;

/// A failed package operation, attributed to the package that ran it.
#[derive(Debug, Error)]
#[error("{path}: {source}")]
pub struct PackageError {
    pub path: AnchoredSystemPathBuf,
    #[source]
    pub source: OperationError,
}

#[derive(Debug, Default)]
pub struct RunResult {
    pub errors: Vec<PackageError>,
}

impl RunResult {
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RunOpts {
    /// Maximum package operations in flight at once.
    pub concurrency: usize,
    /// Stop admitting new packages after the first failure. Work already
    /// in flight always drains.
    pub stop_on_error: bool,
}

impl Default for RunOpts {
    fn default() -> Self {
        Self {
            concurrency: 10,
            stop_on_error: false,
        }
    }
}

pub struct Scheduler {
    dag: Graph<AnchoredSystemPathBuf, ()>,
}

impl Scheduler {
    /// Builds the execution DAG from the graph's dependency records. Edges
    /// between mutually-circular packages are dropped, so both sides of a
    /// cycle still run, just without a relative order.
    pub fn new(graph: &PackageGraph) -> Result<Self, Error> {
        let mut dag = Graph::new();
        let mut lookup = HashMap::new();
        for path in graph.dep_map().keys() {
            lookup.insert(path.clone(), dag.add_node(path.clone()));
        }
        for (path, record) in graph.dep_map() {
            for dep in record.local_deps.keys() {
                if record.circular_with.contains(dep) {
                    continue;
                }
                dag.add_edge(lookup[path], lookup[dep], ());
            }
        }
        // Cycle containment happens at edge-insertion time; anything left
        // over here is an internal inconsistency, not user input.
        if petgraph::algo::is_cyclic_directed(&dag) {
            return Err(Error::CyclicGraph);
        }
        Ok(Self { dag })
    }

    pub fn len(&self) -> usize {
        self.dag.node_count()
    }

    pub fn is_empty(&self) -> bool {
        self.dag.node_count() == 0
    }

    /// Drives the walk. `include` is the consolidated ignore/only/scope
    /// predicate: an excluded package is marked done without running, so
    /// exclusion never blocks the packages behind it.
    pub async fn start<I, F, Fut>(&self, opts: RunOpts, include: I, operation: F) -> RunResult
    where
        I: Fn(&AnchoredSystemPath) -> bool,
        F: Fn(AnchoredSystemPathBuf) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), OperationError>> + Send + 'static,
    {
        type Settled = (
            AnchoredSystemPathBuf,
            oneshot::Sender<()>,
            Result<(), OperationError>,
        );

        let walker = Walker::new(&self.dag);
        let (mut walker, mut ready) = walker.walk();
        let semaphore = Arc::new(Semaphore::new(opts.concurrency.max(1)));
        let operation = Arc::new(operation);
        let mut running: JoinSet<Settled> = JoinSet::new();
        let mut errors = Vec::new();
        let mut stopping = false;

        loop {
            tokio::select! {
                Some(joined) = running.join_next(), if !running.is_empty() => {
                    match joined {
                        Ok((path, done, result)) => {
                            if let Err(source) = result {
                                if opts.stop_on_error && !stopping {
                                    stopping = true;
                                    // Cancel before signalling done so the
                                    // failed package's dependents are never
                                    // emitted.
                                    walker.cancel().ok();
                                }
                                errors.push(PackageError { path, source });
                            }
                            done.send(()).ok();
                        }
                        Err(join_error) => {
                            tracing::error!("package operation panicked: {join_error}");
                        }
                    }
                }
                message = ready.recv() => {
                    let Some((index, done)) = message else { break };
                    let path = self.dag[index].clone();
                    if stopping || !include(&path) {
                        done.send(()).ok();
                        continue;
                    }
                    let semaphore = semaphore.clone();
                    let operation = operation.clone();
                    running.spawn(async move {
                        let _permit = semaphore
                            .acquire_owned()
                            .await
                            .expect("semaphore is never closed");
                        let result = operation(path.clone()).await;
                        (path, done, result)
                    });
                }
            }
        }

        // The ready stream closed (walk finished or cancelled); drain
        // whatever is still in flight.
        while let Some(joined) = running.join_next().await {
            match joined {
                Ok((path, done, result)) => {
                    if let Err(source) = result {
                        errors.push(PackageError { path, source });
                    }
                    done.send(()).ok();
                }
                Err(join_error) => {
                    tracing::error!("package operation panicked: {join_error}");
                }
            }
        }
        if let Err(join_error) = walker.wait().await {
            tracing::error!("walker task failed: {join_error}");
        }

        RunResult { errors }
    }
}

#[cfg(test)]
mod test {
    use std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    };

    use serde_json::json;

    use quarry_repository::manifest::PackageManifest;

    use super::*;

    fn path(raw: &str) -> AnchoredSystemPathBuf {
        AnchoredSystemPathBuf::from_raw(raw).unwrap()
    }

    /// a has no deps, b depends on a, c depends on b.
    async fn chain_graph() -> PackageGraph {
        PackageGraph::builder()
            .with_manifests(vec![
                (
                    path("packages/a"),
                    PackageManifest::from_value(json!({ "name": "a", "version": "1.0.0" }))
                        .unwrap(),
                ),
                (
                    path("packages/b"),
                    PackageManifest::from_value(json!({
                        "name": "b", "version": "1.0.0",
                        "dependencies": { "a": "*" },
                    }))
                    .unwrap(),
                ),
                (
                    path("packages/c"),
                    PackageManifest::from_value(json!({
                        "name": "c", "version": "1.0.0",
                        "dependencies": { "b": "*" },
                    }))
                    .unwrap(),
                ),
            ])
            .build()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_chain_runs_in_dependency_order() {
        let graph = chain_graph().await;
        let scheduler = Scheduler::new(&graph).unwrap();
        let order = Arc::new(Mutex::new(Vec::new()));
        let recorded = order.clone();
        let result = scheduler
            .start(RunOpts::default(), |_| true, move |package| {
                let order = recorded.clone();
                async move {
                    order.lock().unwrap().push(package.to_unix().into_string());
                    Ok(())
                }
            })
            .await;
        assert!(result.is_success());
        assert_eq!(
            order.lock().unwrap().as_slice(),
            &["packages/a", "packages/b", "packages/c"]
        );
    }

    #[tokio::test]
    async fn test_initial_ready_set_is_only_the_root() {
        let graph = chain_graph().await;
        let scheduler = Scheduler::new(&graph).unwrap();
        let walker = Walker::new(&scheduler.dag);
        let (walker, mut ready) = walker.walk();

        let (first, done) = ready.recv().await.unwrap();
        assert_eq!(scheduler.dag[first], path("packages/a"));
        // Nothing else is runnable until a is marked done.
        assert!(matches!(
            ready.try_recv(),
            Err(tokio::sync::mpsc::error::TryRecvError::Empty)
        ));
        done.send(()).unwrap();

        let (second, done) = ready.recv().await.unwrap();
        assert_eq!(scheduler.dag[second], path("packages/b"));
        done.send(()).unwrap();
        let (third, done) = ready.recv().await.unwrap();
        assert_eq!(scheduler.dag[third], path("packages/c"));
        done.send(()).unwrap();
        walker.wait().await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrency_limit_is_respected() {
        let graph = PackageGraph::builder()
            .with_manifests(
                (0..6)
                    .map(|i| {
                        (
                            path(&format!("packages/p{i}")),
                            PackageManifest::from_value(
                                json!({ "name": format!("p{i}"), "version": "1.0.0" }),
                            )
                            .unwrap(),
                        )
                    })
                    .collect(),
            )
            .build()
            .await
            .unwrap();
        let scheduler = Scheduler::new(&graph).unwrap();

        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));
        let (in_flight_op, max_seen_op) = (in_flight.clone(), max_seen.clone());
        let opts = RunOpts {
            concurrency: 2,
            stop_on_error: false,
        };
        let result = scheduler
            .start(opts, |_| true, move |_| {
                let in_flight = in_flight_op.clone();
                let max_seen = max_seen_op.clone();
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    max_seen.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;
        assert!(result.is_success());
        assert!(max_seen.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_stop_on_error_skips_dependents() {
        let graph = chain_graph().await;
        let scheduler = Scheduler::new(&graph).unwrap();
        let ran = Arc::new(Mutex::new(Vec::new()));
        let recorded = ran.clone();
        let opts = RunOpts {
            concurrency: 4,
            stop_on_error: true,
        };
        let result = scheduler
            .start(opts, |_| true, move |package| {
                let ran = recorded.clone();
                async move {
                    let name = package.to_unix().into_string();
                    ran.lock().unwrap().push(name.clone());
                    if name == "packages/b" {
                        return Err("build failed".into());
                    }
                    Ok(())
                }
            })
            .await;
        assert!(!result.is_success());
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].path, path("packages/b"));
        // c depends on the failed b and must never start.
        assert_eq!(
            ran.lock().unwrap().as_slice(),
            &["packages/a", "packages/b"]
        );
    }

    #[tokio::test]
    async fn test_errors_accumulate_without_stop_on_error() {
        let graph = chain_graph().await;
        let scheduler = Scheduler::new(&graph).unwrap();
        let result = scheduler
            .start(RunOpts::default(), |_| true, move |package| async move {
                if package.to_unix().as_str() == "packages/c" {
                    return Err("c failed".into());
                }
                if package.to_unix().as_str() == "packages/a" {
                    return Err("a failed".into());
                }
                Ok(())
            })
            .await;
        assert_eq!(result.errors.len(), 2);
    }

    #[tokio::test]
    async fn test_filtered_package_does_not_block_dependents() {
        let graph = chain_graph().await;
        let scheduler = Scheduler::new(&graph).unwrap();
        let ran = Arc::new(Mutex::new(Vec::new()));
        let recorded = ran.clone();
        // Exclude b; a and c still run, and c is not stuck behind b.
        let result = scheduler
            .start(
                RunOpts::default(),
                |package| package.to_unix().as_str() != "packages/b",
                move |package| {
                    let ran = recorded.clone();
                    async move {
                        ran.lock().unwrap().push(package.to_unix().into_string());
                        Ok(())
                    }
                },
            )
            .await;
        assert!(result.is_success());
        assert_eq!(
            ran.lock().unwrap().as_slice(),
            &["packages/a", "packages/c"]
        );
    }

    #[tokio::test]
    async fn test_circular_packages_still_run() {
        let graph = PackageGraph::builder()
            .with_manifests(vec![
                (
                    path("packages/x"),
                    PackageManifest::from_value(json!({
                        "name": "x", "version": "1.0.0",
                        "dependencies": { "y": "*" },
                    }))
                    .unwrap(),
                ),
                (
                    path("packages/y"),
                    PackageManifest::from_value(json!({
                        "name": "y", "version": "1.0.0",
                        "dependencies": { "x": "*" },
                    }))
                    .unwrap(),
                ),
            ])
            .build()
            .await
            .unwrap();
        let scheduler = Scheduler::new(&graph).unwrap();
        let count = Arc::new(AtomicUsize::new(0));
        let counted = count.clone();
        let result = scheduler
            .start(RunOpts::default(), |_| true, move |_| {
                let count = counted.clone();
                async move {
                    count.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .await;
        assert!(result.is_success());
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
