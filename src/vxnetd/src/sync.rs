//! Node directory sync
//!
//! Keeps one forwarding plan installed per remote node: an ARP entry for
//! the node's overlay next hop, an FDB entry telling the overlay device
//! which host owns that hardware address, and an onlink route to the
//! node's pod range. Events are handled one at a time; a failing event is
//! logged and counted and the loop carries on.

use std::collections::HashMap;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use vxnet_link::reconcile::{self, KernelObject};
use vxnet_link::{LinkFabric, NeighbourEntry, RouteEntry};

use crate::error::DaemonError;
use crate::node::{NodeSnapshot, RemoteVtep};
use crate::watch::NodeEvent;

/// Kernel objects that route traffic for `vtep`'s pods through `device`
pub fn forwarding_plan(device: &str, vtep: &RemoteVtep) -> Vec<KernelObject> {
    let next_hop = vtep.pod_cidr.network();
    vec![
        KernelObject::Neighbour(NeighbourEntry::arp(device, next_hop, vtep.mac)),
        KernelObject::Neighbour(NeighbourEntry::fdb(device, vtep.host_ip, vtep.mac)),
        KernelObject::host_route(RouteEntry::via(vtep.pod_cidr, next_hop, device).onlink()),
    ]
}

/// Counters for handled events
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncStats {
    pub applied: u64,
    pub removed: u64,
    pub unchanged: u64,
    pub failed: u64,
}

pub struct DirectorySync<'a> {
    fabric: &'a dyn LinkFabric,
    device: String,
    installed: HashMap<String, Vec<KernelObject>>,
    stats: SyncStats,
}

impl<'a> DirectorySync<'a> {
    pub fn new(fabric: &'a dyn LinkFabric, device: impl Into<String>) -> Self {
        Self {
            fabric,
            device: device.into(),
            installed: HashMap::new(),
            stats: SyncStats::default(),
        }
    }

    pub fn stats(&self) -> SyncStats {
        self.stats
    }

    /// Consume events until the queue closes or `cancel` fires
    pub async fn run(mut self, mut rx: mpsc::Receiver<NodeEvent>, cancel: CancellationToken) -> SyncStats {
        info!(event.name = "directory.sync.started", device = %self.device, "directory sync running");
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = rx.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            self.handle(event).await;
        }
        info!(
            event.name = "directory.sync.stopped",
            applied = self.stats.applied,
            removed = self.stats.removed,
            unchanged = self.stats.unchanged,
            failed = self.stats.failed,
            "directory sync stopped"
        );
        self.stats
    }

    /// Reconcile one event, isolating its failure
    pub async fn handle(&mut self, event: NodeEvent) {
        let node = event.node().to_string();
        if let Err(e) = self.reconcile(event).await {
            self.stats.failed += 1;
            error!(
                event.name = "directory.sync.failed",
                node = %node,
                error.message = %e,
                "failed to reconcile node, skipping"
            );
        }
    }

    async fn reconcile(&mut self, event: NodeEvent) -> Result<(), DaemonError> {
        match event {
            NodeEvent::Added(snapshot) => self.install(&snapshot, None).await,
            NodeEvent::Updated { old, new } => {
                if old.vtep_mac == new.vtep_mac && self.installed.contains_key(&new.name) {
                    self.stats.unchanged += 1;
                    debug!(
                        event.name = "directory.sync.unchanged",
                        node = %new.name,
                        "overlay address unchanged"
                    );
                    return Ok(());
                }
                self.install(&new, Some(&old)).await
            }
            NodeEvent::Removed(snapshot) => self.uninstall(&snapshot).await,
        }
    }

    /// Converge the node's entries to the plan for `snapshot`
    async fn install(
        &mut self,
        snapshot: &NodeSnapshot,
        old: Option<&NodeSnapshot>,
    ) -> Result<(), DaemonError> {
        let vtep = snapshot.vtep()?;
        let desired = forwarding_plan(&self.device, &vtep);
        let previous = self
            .installed
            .get(&snapshot.name)
            .cloned()
            .or_else(|| self.plan_for(old?))
            .unwrap_or_default();

        let outcome = reconcile::converge(self.fabric, &previous, &desired)
            .await
            .map_err(DaemonError::link(format!("install forwarding for {}", snapshot.name)))?;
        self.installed.insert(snapshot.name.clone(), desired);
        self.stats.applied += 1;
        info!(
            event.name = "directory.sync.applied",
            node = %vtep.node,
            pod_cidr = %vtep.pod_cidr,
            mac = %vtep.mac,
            host_ip = %vtep.host_ip,
            stale_removed = outcome.removed,
            "installed forwarding entries"
        );
        Ok(())
    }

    async fn uninstall(&mut self, snapshot: &NodeSnapshot) -> Result<(), DaemonError> {
        let Some(objects) = self
            .installed
            .remove(&snapshot.name)
            .or_else(|| self.plan_for(snapshot))
        else {
            debug!(node = %snapshot.name, "nothing installed for removed node");
            return Ok(());
        };

        let removed = reconcile::remove_all(self.fabric, &objects)
            .await
            .map_err(DaemonError::link(format!("remove forwarding for {}", snapshot.name)))?;
        self.stats.removed += 1;
        info!(
            event.name = "directory.sync.removed",
            node = %snapshot.name,
            entries = removed,
            "removed forwarding entries"
        );
        Ok(())
    }

    /// Plan derived from a snapshot, for entries a previous run installed
    fn plan_for(&self, snapshot: &NodeSnapshot) -> Option<Vec<KernelObject>> {
        snapshot
            .vtep()
            .ok()
            .map(|vtep| forwarding_plan(&self.device, &vtep))
    }
}

#[cfg(test)]
mod tests {
    use std::net::Ipv4Addr;

    use vxnet_link::fake::{FakeFabric, FakeOp};
    use vxnet_link::{MacAddr, NeighbourKind, Netns, RouteScope};

    use super::*;
    use crate::node::testing::node;

    fn snapshot(mac: &str) -> NodeSnapshot {
        NodeSnapshot::from_node(&node(
            "node-b",
            Some("10.244.1.0/24"),
            Some(mac),
            Some("10.0.0.5"),
        ))
    }

    fn fabric() -> FakeFabric {
        let fabric = FakeFabric::new();
        fabric.add_host_vxlan("vxlan.1");
        fabric
    }

    fn installed_state(fabric: &FakeFabric) -> (Vec<NeighbourEntry>, Vec<RouteEntry>) {
        let mut neighbours = fabric.neighbours();
        neighbours.sort_by_key(|n| n.to_string());
        (neighbours, fabric.routes(&Netns::Host))
    }

    #[tokio::test]
    async fn test_remote_node_scenario() {
        let fabric = fabric();
        let mut sync = DirectorySync::new(&fabric, "vxlan.1");
        sync.handle(NodeEvent::Added(snapshot("aa:bb:cc:dd:ee:ff"))).await;

        let routes = fabric.routes(&Netns::Host);
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].destination, "10.244.1.0/24".parse().unwrap());
        assert_eq!(routes[0].gateway, Some(Ipv4Addr::new(10, 244, 1, 0)));
        assert_eq!(routes[0].scope, RouteScope::Universe);
        assert!(routes[0].onlink);
        assert_eq!(routes[0].device, "vxlan.1");

        let mac: MacAddr = "aa:bb:cc:dd:ee:ff".parse().unwrap();
        let neighbours = fabric.neighbours();
        assert!(neighbours.contains(&NeighbourEntry::fdb("vxlan.1", Ipv4Addr::new(10, 0, 0, 5), mac)));
        assert!(neighbours.contains(&NeighbourEntry::arp("vxlan.1", Ipv4Addr::new(10, 244, 1, 0), mac)));
        assert_eq!(sync.stats().applied, 1);
    }

    #[tokio::test]
    async fn test_event_sequence_converges_to_final_add() {
        let replayed = fabric();
        let mut sync = DirectorySync::new(&replayed, "vxlan.1");
        sync.handle(NodeEvent::Added(snapshot("aa:aa:aa:aa:aa:aa"))).await;
        sync.handle(NodeEvent::Updated {
            old: snapshot("aa:aa:aa:aa:aa:aa"),
            new: snapshot("bb:bb:bb:bb:bb:bb"),
        })
        .await;
        sync.handle(NodeEvent::Updated {
            old: snapshot("bb:bb:bb:bb:bb:bb"),
            new: snapshot("cc:cc:cc:cc:cc:cc"),
        })
        .await;

        let direct = fabric();
        DirectorySync::new(&direct, "vxlan.1")
            .handle(NodeEvent::Added(snapshot("cc:cc:cc:cc:cc:cc")))
            .await;

        assert_eq!(installed_state(&replayed), installed_state(&direct));
        let fdb: Vec<_> = replayed
            .neighbours()
            .into_iter()
            .filter(|n| n.kind == NeighbourKind::Fdb)
            .collect();
        assert_eq!(fdb.len(), 1);
    }

    #[tokio::test]
    async fn test_unchanged_address_is_a_noop() {
        let fabric = fabric();
        let mut sync = DirectorySync::new(&fabric, "vxlan.1");
        sync.handle(NodeEvent::Added(snapshot("aa:aa:aa:aa:aa:aa"))).await;

        let mutations = fabric.mutations();
        sync.handle(NodeEvent::Updated {
            old: snapshot("aa:aa:aa:aa:aa:aa"),
            new: snapshot("aa:aa:aa:aa:aa:aa"),
        })
        .await;

        assert_eq!(fabric.mutations(), mutations);
        assert_eq!(sync.stats().unchanged, 1);
    }

    #[tokio::test]
    async fn test_remove_clears_entries() {
        let fabric = fabric();
        let mut sync = DirectorySync::new(&fabric, "vxlan.1");
        sync.handle(NodeEvent::Added(snapshot("aa:aa:aa:aa:aa:aa"))).await;
        sync.handle(NodeEvent::Removed(snapshot("aa:aa:aa:aa:aa:aa"))).await;

        assert!(fabric.neighbours().is_empty());
        assert!(fabric.routes(&Netns::Host).is_empty());

        // entries removed out of band are tolerated
        sync.handle(NodeEvent::Removed(snapshot("aa:aa:aa:aa:aa:aa"))).await;
        assert_eq!(sync.stats().failed, 0);
    }

    #[tokio::test]
    async fn test_incomplete_metadata_is_skipped() {
        let fabric = fabric();
        let mut sync = DirectorySync::new(&fabric, "vxlan.1");
        let bare = NodeSnapshot::from_node(&node("node-c", Some("10.244.2.0/24"), None, None));
        sync.handle(NodeEvent::Added(bare.clone())).await;
        assert_eq!(sync.stats().failed, 1);
        assert_eq!(fabric.mutations(), 0);

        // annotations arrive later
        let mut complete = bare.clone();
        complete.vtep_mac = Some("aa:aa:aa:aa:aa:aa".into());
        complete.host_ip = Some("10.0.0.6".into());
        sync.handle(NodeEvent::Updated { old: bare, new: complete }).await;
        assert_eq!(fabric.routes(&Netns::Host).len(), 1);
    }

    #[tokio::test]
    async fn test_kernel_failure_does_not_stop_loop() {
        let fabric = fabric();
        fabric.fail_on(FakeOp::ReplaceRoute);
        let (tx, rx) = mpsc::channel(4);
        tx.send(NodeEvent::Added(snapshot("aa:aa:aa:aa:aa:aa"))).await.unwrap();
        tx.send(NodeEvent::Removed(snapshot("aa:aa:aa:aa:aa:aa"))).await.unwrap();
        drop(tx);

        let stats = DirectorySync::new(&fabric, "vxlan.1")
            .run(rx, CancellationToken::new())
            .await;
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.removed, 1);
        assert!(fabric.neighbours().is_empty());
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let fabric = fabric();
        let (_tx, rx) = mpsc::channel(1);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let stats = DirectorySync::new(&fabric, "vxlan.1").run(rx, cancel).await;
        assert_eq!(stats, SyncStats::default());
    }
}
