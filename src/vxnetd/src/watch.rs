//! Node watch
//!
//! Turns the raw watch stream over Node objects into a queue of typed
//! membership events, each carrying immutable snapshots. The local node
//! is filtered out.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Node;
use kube::runtime::watcher;
use kube::Api;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::node::NodeSnapshot;

/// Pause before re-establishing a failed watch
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// A change in cluster membership or node metadata
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    Added(NodeSnapshot),
    Updated { old: NodeSnapshot, new: NodeSnapshot },
    Removed(NodeSnapshot),
}

impl NodeEvent {
    pub fn node(&self) -> &str {
        match self {
            Self::Added(s) | Self::Removed(s) => &s.name,
            Self::Updated { new, .. } => &new.name,
        }
    }
}

/// Tracks the last snapshot of every remote node
///
/// A watch restart re-lists all nodes; nodes that do not reappear in the
/// re-list were deleted while the watch was down and are reported as
/// removed.
pub struct Translator {
    local: String,
    known: HashMap<String, NodeSnapshot>,
    relisted: Option<HashSet<String>>,
}

impl Translator {
    pub fn new(local: impl Into<String>) -> Self {
        Self {
            local: local.into(),
            known: HashMap::new(),
            relisted: None,
        }
    }

    pub fn translate(&mut self, event: watcher::Event<Node>) -> Vec<NodeEvent> {
        match event {
            watcher::Event::Init => {
                self.relisted = Some(HashSet::new());
                Vec::new()
            }
            watcher::Event::InitApply(node) => {
                let snapshot = NodeSnapshot::from_node(&node);
                if let Some(seen) = self.relisted.as_mut() {
                    seen.insert(snapshot.name.clone());
                }
                self.apply(snapshot).into_iter().collect()
            }
            watcher::Event::InitDone => {
                let seen = self.relisted.take().unwrap_or_default();
                let gone: Vec<String> = self
                    .known
                    .keys()
                    .filter(|name| !seen.contains(*name))
                    .cloned()
                    .collect();
                gone.into_iter()
                    .filter_map(|name| self.known.remove(&name))
                    .map(NodeEvent::Removed)
                    .collect()
            }
            watcher::Event::Apply(node) => self
                .apply(NodeSnapshot::from_node(&node))
                .into_iter()
                .collect(),
            watcher::Event::Delete(node) => {
                let snapshot = NodeSnapshot::from_node(&node);
                if snapshot.name == self.local {
                    return Vec::new();
                }
                let last = self.known.remove(&snapshot.name).unwrap_or(snapshot);
                vec![NodeEvent::Removed(last)]
            }
        }
    }

    fn apply(&mut self, snapshot: NodeSnapshot) -> Option<NodeEvent> {
        if snapshot.name == self.local {
            return None;
        }
        match self.known.insert(snapshot.name.clone(), snapshot.clone()) {
            Some(old) if old == snapshot => None,
            Some(old) => Some(NodeEvent::Updated { old, new: snapshot }),
            None => Some(NodeEvent::Added(snapshot)),
        }
    }
}

/// Feed node events into `tx` until cancelled or the receiver goes away
pub async fn watch_nodes(
    nodes: Api<Node>,
    local: String,
    tx: mpsc::Sender<NodeEvent>,
    cancel: CancellationToken,
) {
    let mut translator = Translator::new(local);

    loop {
        debug!(event.name = "node.watch.starting", "starting node watch");
        let mut stream = watcher(nodes.clone(), watcher::Config::default()).boxed();

        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return,
                next = stream.next() => next,
            };
            match next {
                Some(Ok(event)) => {
                    for node_event in translator.translate(event) {
                        if tx.send(node_event).await.is_err() {
                            warn!(
                                event.name = "node.watch.channel_closed",
                                "node event queue closed, stopping watch"
                            );
                            return;
                        }
                    }
                }
                Some(Err(e)) => {
                    error!(
                        event.name = "node.watch.error",
                        error.message = %e,
                        "node watch failed, will retry"
                    );
                    break;
                }
                None => break,
            }
        }

        warn!(
            event.name = "node.watch.reconnecting",
            "node watch disconnected, reconnecting in 5s"
        );
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
        }
    }
}
