use std::{collections::HashMap, hash::Hash};

use futures::{future::join_all, stream::FuturesUnordered, StreamExt};
use petgraph::{
    visit::{IntoNeighborsDirected, IntoNodeIdentifiers},
    Direction,
};
use tokio::{
    sync::{broadcast, mpsc, oneshot, watch},
    task::JoinHandle,
};
use tracing::trace;

/// Emits the nodes of a DAG as they become unblocked: a node is sent only
/// once every node it points at (its dependencies) has been marked done via
/// the paired oneshot sender.
///
/// The graph must not change once a walker exists; emitted ids are only
/// meaningful against the graph the walker was built from.
pub struct Walker<N, S> {
    state: std::marker::PhantomData<S>,
    cancel: watch::Sender<bool>,
    ready: Option<mpsc::Receiver<WalkMessage<N>>>,
    node_tasks: FuturesUnordered<JoinHandle<()>>,
}

/// A walker that has been built but not started.
pub struct Built;
/// A walker whose nodes are being emitted.
pub struct Walking;

pub type WalkMessage<N> = (N, oneshot::Sender<()>);

// Petgraph node ids are small copyable integers, so requiring
// Copy + Eq + Hash + Send costs callers nothing.
impl<N: Eq + Hash + Copy + Send + 'static> Walker<N, Built> {
    pub fn new<G: IntoNodeIdentifiers<NodeId = N> + IntoNeighborsDirected>(graph: G) -> Self {
        let (cancel, cancel_rx) = watch::channel(false);

        // One single-shot broadcast channel per node; a node's task completes
        // the walk handshake and then broadcasts to whoever depends on it.
        let mut finished_txs = HashMap::new();
        let mut finished_rxs = HashMap::new();
        for node in graph.node_identifiers() {
            let (tx, rx) = broadcast::channel::<()>(1);
            finished_txs.insert(node, tx);
            finished_rxs.insert(node, rx);
        }

        // Every node is emitted at most once, so a buffer the size of the
        // node count means emission can never block. Zero-node graphs still
        // need a positive capacity.
        let (ready_tx, ready_rx) = mpsc::channel(finished_txs.len().max(1));

        let node_tasks = FuturesUnordered::new();
        for node in graph.node_identifiers() {
            let finished_tx = finished_txs
                .remove(&node)
                .expect("every node was given a finished channel");
            let mut cancel_rx = cancel_rx.clone();
            let ready_tx = ready_tx.clone();
            let mut dep_rxs = graph
                .neighbors_directed(node, Direction::Outgoing)
                .map(|dep| {
                    finished_rxs
                        .get(&dep)
                        .expect("neighbor is a graph node")
                        .resubscribe()
                })
                .collect::<Vec<_>>();

            node_tasks.push(tokio::spawn(async move {
                let deps_done = join_all(dep_rxs.iter_mut().map(|rx| rx.recv()));

                tokio::select! {
                    // When a cancel and the last dependency land together,
                    // take the cancel; emitting one more node after a cancel
                    // is the thing this ordering exists to prevent.
                    biased;
                    _ = cancel_rx.changed() => {
                        // Either an explicit cancel, or the walker itself was
                        // dropped. Both mean this node should never run.
                    }
                    results = deps_done => {
                        for result in results {
                            match result {
                                Ok(()) => (),
                                // A dependency task exited without
                                // broadcasting. That only happens when a
                                // cancel raced us; treat it as one.
                                Err(broadcast::error::RecvError::Closed) => return,
                                Err(broadcast::error::RecvError::Lagged(n)) => {
                                    // Single-shot channels cannot lag.
                                    trace!("dependency signalled done {n} extra times");
                                }
                            }
                        }

                        let (done_tx, done_rx) = oneshot::channel::<()>();
                        if ready_tx.send((node, done_tx)).await.is_err() {
                            // The consumer hung up without cancelling; there
                            // is nobody left to mark this node done.
                            trace!("walk consumer dropped before the walk finished");
                            return;
                        }
                        if done_rx.await.is_err() {
                            // A dropped done-sender counts as done; the
                            // consumer has moved on.
                            trace!("done signal dropped without being sent");
                        }
                        // No receivers just means no dependents.
                        finished_tx.send(()).ok();
                    }
                }
            }));
        }

        debug_assert!(
            finished_txs.is_empty(),
            "every finished sender belongs to a node task"
        );

        Self {
            state: std::marker::PhantomData,
            cancel,
            ready: Some(ready_rx),
            node_tasks,
        }
    }

    /// Starts the walk. The caller must answer each message's oneshot to
    /// mark that node done, which is what unblocks its dependents.
    pub fn walk(self) -> (Walker<N, Walking>, mpsc::Receiver<WalkMessage<N>>) {
        let Self {
            cancel,
            mut ready,
            node_tasks,
            ..
        } = self;
        let ready = ready.take().expect("built walker owns the ready channel");
        (
            Walker {
                state: std::marker::PhantomData,
                cancel,
                ready: None,
                node_tasks,
            },
            ready,
        )
    }
}

impl<N> Walker<N, Walking> {
    /// Stops emitting new nodes. Nodes already queued are still delivered;
    /// nothing behind them will be.
    pub fn cancel(&mut self) -> Result<(), watch::error::SendError<bool>> {
        self.cancel.send(true)
    }

    /// Waits for every node task to wind down, after completion or cancel.
    pub async fn wait(self) -> Result<(), tokio::task::JoinError> {
        let Self { mut node_tasks, .. } = self;
        while let Some(result) = node_tasks.next().await {
            result?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::{
        sync::{Arc, Mutex},
        time::Duration,
    };

    use petgraph::Graph;

    use super::*;

    #[tokio::test]
    async fn test_walk_follows_dependency_order() {
        // a -> b -> c
        let mut g = Graph::new();
        let a = g.add_node("a");
        let b = g.add_node("b");
        let c = g.add_node("c");
        g.add_edge(a, b, ());
        g.add_edge(b, c, ());

        let walker = Walker::new(&g);
        let (walker, mut ready) = walker.walk();
        let mut visited = Vec::new();
        while let Some((index, done)) = ready.recv().await {
            visited.push(index);
            done.send(()).unwrap();
        }
        walker.wait().await.unwrap();
        assert_eq!(visited, vec![c, b, a]);
    }

    #[tokio::test]
    async fn test_cancel_stops_emission() {
        // a -> b -> c
        let mut g = Graph::new();
        let a = g.add_node("a");
        let b = g.add_node("b");
        let c = g.add_node("c");
        g.add_edge(a, b, ());
        g.add_edge(b, c, ());

        let walker = Walker::new(&g);
        let (mut walker, mut ready) = walker.walk();
        let mut visited = Vec::new();
        while let Some((index, done)) = ready.recv().await {
            walker.cancel().unwrap();
            visited.push(index);
            done.send(()).unwrap();
        }
        assert_eq!(visited, vec![c]);

        // Give the node tasks a beat to observe the cancel.
        tokio::time::sleep(Duration::from_millis(1)).await;
        let Walker { node_tasks, .. } = walker;
        for task in node_tasks {
            assert!(task.is_finished());
        }
    }

    #[tokio::test]
    async fn test_slow_dependency_blocks_only_its_branch() {
        // a -- b -- c
        //   \
        //    - d -- e
        let mut g = Graph::new();
        let a = g.add_node("a");
        let b = g.add_node("b");
        let c = g.add_node("c");
        let d = g.add_node("d");
        let e = g.add_node("e");
        g.add_edge(a, b, ());
        g.add_edge(a, d, ());
        g.add_edge(b, c, ());
        g.add_edge(d, e, ());

        // Hold e open until b completes; the b branch must keep moving.
        let walker = Walker::new(&g);
        let visited = Arc::new(Mutex::new(Vec::new()));
        let (walker, mut ready) = walker.walk();
        let (b_done_tx, b_done_rx) = oneshot::channel::<()>();
        let mut b_done_tx = Some(b_done_tx);
        let mut b_done_rx = Some(b_done_rx);
        while let Some((index, done)) = ready.recv().await {
            if index == e {
                let b_done_rx = b_done_rx.take().unwrap();
                let visited = visited.clone();
                tokio::spawn(async move {
                    b_done_rx.await.unwrap();
                    visited.lock().unwrap().push(index);
                    done.send(()).unwrap();
                });
            } else {
                visited.lock().unwrap().push(index);
                done.send(()).unwrap();
                if index == b {
                    b_done_tx.take().unwrap().send(()).unwrap();
                }
            }
        }
        walker.wait().await.unwrap();
        assert_eq!(visited.lock().unwrap().as_slice(), &[c, b, e, d, a]);
    }
}
