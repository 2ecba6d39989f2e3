//! In-memory link fabric for tests
//!
//! Models just enough kernel behaviour to make idempotence observable:
//! deleting one side of a veth pair deletes its peer, moving a link to
//! another namespace flushes its addresses and routes and takes it down,
//! and creating something that exists fails with `EEXIST`.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::io;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use ipnet::Ipv4Net;

use crate::{
    Link, LinkError, LinkFabric, LinkKind, MacAddr, NeighbourEntry, NeighbourKind, Netns,
    RouteEntry, VxlanSpec,
};

/// Operations that can be made to fail with [`FakeFabric::fail_on`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FakeOp {
    AddVeth,
    AddVxlan,
    DeleteLink,
    SetMac,
    SetUp,
    MoveLink,
    AddAddress,
    RemoveAddress,
    AddRoute,
    ReplaceRoute,
    DeleteRoute,
    SetNeighbour,
    DeleteNeighbour,
    ProxyArp,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakeLink {
    pub index: u32,
    pub kind: LinkKind,
    pub mtu: u32,
    pub mac: MacAddr,
    pub up: bool,
    pub addresses: Vec<Ipv4Net>,
    /// VXLAN source-address learning
    pub learning: bool,
    peer: Option<u32>,
}

#[derive(Default)]
struct State {
    next_index: u32,
    links: HashMap<Netns, BTreeMap<String, FakeLink>>,
    routes: Vec<(Netns, RouteEntry)>,
    neighbours: Vec<NeighbourEntry>,
    proxy_arp: BTreeSet<String>,
    default_route: Option<String>,
    failures: HashSet<FakeOp>,
    mutations: usize,
}

impl State {
    fn check(&self, op: FakeOp) -> Result<(), LinkError> {
        if self.failures.contains(&op) {
            return Err(LinkError::io(
                format!("{:?}", op),
                io::Error::new(io::ErrorKind::Other, "injected failure"),
            ));
        }
        Ok(())
    }

    fn alloc_index(&mut self) -> u32 {
        self.next_index += 1;
        self.next_index
    }

    fn get(&self, ns: &Netns, name: &str) -> Option<&FakeLink> {
        self.links.get(ns).and_then(|links| links.get(name))
    }

    fn get_mut(&mut self, ns: &Netns, name: &str) -> Result<&mut FakeLink, LinkError> {
        self.links
            .get_mut(ns)
            .and_then(|links| links.get_mut(name))
            .ok_or_else(|| LinkError::not_found(format!("link {} in {}", name, ns)))
    }

    fn insert(&mut self, ns: &Netns, name: &str, link: FakeLink) {
        self.links
            .entry(ns.clone())
            .or_default()
            .insert(name.to_string(), link);
    }

    fn take(&mut self, ns: &Netns, name: &str) -> Option<FakeLink> {
        let link = self.links.get_mut(ns)?.remove(name)?;
        self.forget_device(ns, name);
        Some(link)
    }

    fn take_by_index(&mut self, index: u32) {
        let found = self.links.iter().find_map(|(ns, links)| {
            links
                .iter()
                .find(|(_, l)| l.index == index)
                .map(|(name, _)| (ns.clone(), name.clone()))
        });
        if let Some((ns, name)) = found {
            self.take(&ns, &name);
        }
    }

    fn forget_device(&mut self, ns: &Netns, name: &str) {
        self.routes
            .retain(|(route_ns, route)| !(route_ns == ns && route.device == name));
        if *ns == Netns::Host {
            self.neighbours.retain(|n| n.device != name);
            self.proxy_arp.remove(name);
        }
    }

    fn same_neighbour_key(a: &NeighbourEntry, b: &NeighbourEntry) -> bool {
        if a.kind != b.kind || a.device != b.device {
            return false;
        }
        match a.kind {
            NeighbourKind::Arp => a.ip == b.ip,
            NeighbourKind::Fdb => a.mac == b.mac,
        }
    }
}

fn exists(what: String) -> LinkError {
    LinkError::io(what, io::Error::from_raw_os_error(libc::EEXIST))
}

fn fake_mac(index: u32) -> MacAddr {
    let b = index.to_be_bytes();
    MacAddr::new([0x02, 0x00, b[0], b[1], b[2], b[3]])
}

/// Link fabric backed by in-process state
#[derive(Default)]
pub struct FakeFabric {
    state: Mutex<State>,
}

impl FakeFabric {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Add a plain device in the host namespace
    pub fn add_host_link(&self, name: &str, mtu: u32, addresses: &[Ipv4Net]) {
        let mut state = self.state();
        let index = state.alloc_index();
        state.insert(
            &Netns::Host,
            name,
            FakeLink {
                index,
                kind: LinkKind::Other("device".into()),
                mtu,
                mac: fake_mac(index),
                up: true,
                addresses: addresses.to_vec(),
                learning: false,
                peer: None,
            },
        );
    }

    /// Add a host device and make it the default route's output device
    pub fn with_default_route(self, name: &str, mtu: u32, addresses: &[Ipv4Net]) -> Self {
        self.add_host_link(name, mtu, addresses);
        self.state().default_route = Some(name.to_string());
        self
    }

    /// Add a VXLAN device in the host namespace, bypassing `add_vxlan`
    pub fn add_host_vxlan(&self, name: &str) {
        let mut state = self.state();
        let index = state.alloc_index();
        state.insert(
            &Netns::Host,
            name,
            FakeLink {
                index,
                kind: LinkKind::Vxlan,
                mtu: 1450,
                mac: fake_mac(index),
                up: true,
                addresses: Vec::new(),
                learning: false,
                peer: None,
            },
        );
    }

    pub fn fail_on(&self, op: FakeOp) {
        self.state().failures.insert(op);
    }

    pub fn clear_failures(&self) {
        self.state().failures.clear();
    }

    /// Names of the links in `ns`, sorted
    pub fn links(&self, ns: &Netns) -> Vec<String> {
        self.state()
            .links
            .get(ns)
            .map(|links| links.keys().cloned().collect())
            .unwrap_or_default()
    }

    pub fn fake_link(&self, ns: &Netns, name: &str) -> Option<FakeLink> {
        self.state().get(ns, name).cloned()
    }

    pub fn routes(&self, ns: &Netns) -> Vec<RouteEntry> {
        self.state()
            .routes
            .iter()
            .filter(|(route_ns, _)| route_ns == ns)
            .map(|(_, route)| route.clone())
            .collect()
    }

    pub fn neighbours(&self) -> Vec<NeighbourEntry> {
        self.state().neighbours.clone()
    }

    pub fn proxy_arp_enabled(&self, name: &str) -> bool {
        self.state().proxy_arp.contains(name)
    }

    /// Number of successful mutating calls so far
    pub fn mutations(&self) -> usize {
        self.state().mutations
    }
}

#[async_trait]
impl LinkFabric for FakeFabric {
    async fn link(&self, ns: &Netns, name: &str) -> Result<Option<Link>, LinkError> {
        Ok(self.state().get(ns, name).map(|l| Link {
            index: l.index,
            name: name.to_string(),
            kind: Some(l.kind.clone()),
            mtu: Some(l.mtu),
            mac: Some(l.mac),
        }))
    }

    async fn add_veth(
        &self,
        ns: &Netns,
        name: &str,
        peer: &str,
        mtu: u32,
    ) -> Result<(), LinkError> {
        let mut state = self.state();
        state.check(FakeOp::AddVeth)?;
        for side in [name, peer] {
            if state.get(ns, side).is_some() {
                return Err(exists(format!("add veth {}", side)));
            }
        }

        let a = state.alloc_index();
        let b = state.alloc_index();
        for (side, index, peer_index) in [(name, a, b), (peer, b, a)] {
            state.insert(
                ns,
                side,
                FakeLink {
                    index,
                    kind: LinkKind::Veth,
                    mtu,
                    mac: fake_mac(index),
                    up: false,
                    addresses: Vec::new(),
                    learning: false,
                    peer: Some(peer_index),
                },
            );
        }
        state.mutations += 1;
        Ok(())
    }

    async fn add_vxlan(&self, spec: &VxlanSpec) -> Result<(), LinkError> {
        let mut state = self.state();
        state.check(FakeOp::AddVxlan)?;
        if state.get(&Netns::Host, &spec.name).is_some() {
            return Err(exists(format!("add vxlan {}", spec.name)));
        }
        let index = state.alloc_index();
        state.insert(
            &Netns::Host,
            &spec.name,
            FakeLink {
                index,
                kind: LinkKind::Vxlan,
                mtu: spec.mtu,
                mac: spec.mac,
                up: false,
                addresses: Vec::new(),
                learning: spec.learning,
                peer: None,
            },
        );
        state.mutations += 1;
        Ok(())
    }

    async fn delete_link(&self, ns: &Netns, name: &str) -> Result<(), LinkError> {
        let mut state = self.state();
        state.check(FakeOp::DeleteLink)?;
        let link = state
            .take(ns, name)
            .ok_or_else(|| LinkError::not_found(format!("link {} in {}", name, ns)))?;
        if let Some(peer) = link.peer {
            state.take_by_index(peer);
        }
        state.mutations += 1;
        Ok(())
    }

    async fn set_mac(&self, ns: &Netns, name: &str, mac: MacAddr) -> Result<(), LinkError> {
        let mut state = self.state();
        state.check(FakeOp::SetMac)?;
        state.get_mut(ns, name)?.mac = mac;
        state.mutations += 1;
        Ok(())
    }

    async fn set_up(&self, ns: &Netns, name: &str) -> Result<(), LinkError> {
        let mut state = self.state();
        state.check(FakeOp::SetUp)?;
        state.get_mut(ns, name)?.up = true;
        state.mutations += 1;
        Ok(())
    }

    async fn move_link(&self, from: &Netns, name: &str, to: &Netns) -> Result<(), LinkError> {
        let mut state = self.state();
        state.check(FakeOp::MoveLink)?;
        if state.get(from, name).is_none() {
            return Err(LinkError::not_found(format!("link {} in {}", name, from)));
        }
        if state.get(to, name).is_some() {
            return Err(exists(format!("move {} to {}", name, to)));
        }
        if let Some(mut link) = state.take(from, name) {
            link.up = false;
            link.addresses.clear();
            state.insert(to, name, link);
        }
        state.mutations += 1;
        Ok(())
    }

    async fn addresses(&self, ns: &Netns, name: &str) -> Result<Vec<Ipv4Net>, LinkError> {
        self.state()
            .get(ns, name)
            .map(|l| l.addresses.clone())
            .ok_or_else(|| LinkError::not_found(format!("link {} in {}", name, ns)))
    }

    async fn add_address(&self, ns: &Netns, name: &str, addr: Ipv4Net) -> Result<(), LinkError> {
        let mut state = self.state();
        state.check(FakeOp::AddAddress)?;
        let link = state.get_mut(ns, name)?;
        if link.addresses.contains(&addr) {
            return Err(exists(format!("add address {} on {}", addr, name)));
        }
        link.addresses.push(addr);
        state.mutations += 1;
        Ok(())
    }

    async fn remove_address(
        &self,
        ns: &Netns,
        name: &str,
        addr: Ipv4Net,
    ) -> Result<(), LinkError> {
        let mut state = self.state();
        state.check(FakeOp::RemoveAddress)?;
        let link = state.get_mut(ns, name)?;
        let before = link.addresses.len();
        link.addresses.retain(|a| *a != addr);
        if link.addresses.len() == before {
            return Err(LinkError::not_found(format!("address {} on {}", addr, name)));
        }
        state.mutations += 1;
        Ok(())
    }

    async fn add_route(&self, ns: &Netns, route: &RouteEntry) -> Result<(), LinkError> {
        let mut state = self.state();
        state.check(FakeOp::AddRoute)?;
        state.get_mut(ns, &route.device)?;
        if state
            .routes
            .iter()
            .any(|(n, r)| n == ns && r.destination == route.destination)
        {
            return Err(exists(format!("add route {}", route)));
        }
        state.routes.push((ns.clone(), route.clone()));
        state.mutations += 1;
        Ok(())
    }

    async fn replace_route(&self, ns: &Netns, route: &RouteEntry) -> Result<(), LinkError> {
        let mut state = self.state();
        state.check(FakeOp::ReplaceRoute)?;
        state.get_mut(ns, &route.device)?;
        state
            .routes
            .retain(|(n, r)| !(n == ns && r.destination == route.destination));
        state.routes.push((ns.clone(), route.clone()));
        state.mutations += 1;
        Ok(())
    }

    async fn delete_route(&self, ns: &Netns, route: &RouteEntry) -> Result<(), LinkError> {
        let mut state = self.state();
        state.check(FakeOp::DeleteRoute)?;
        let before = state.routes.len();
        state.routes.retain(|(n, r)| {
            !(n == ns && r.destination == route.destination && r.device == route.device)
        });
        if state.routes.len() == before {
            return Err(LinkError::not_found(format!("route {}", route)));
        }
        state.mutations += 1;
        Ok(())
    }

    async fn default_route_link(&self, ns: &Netns) -> Result<Option<Link>, LinkError> {
        if *ns != Netns::Host {
            return Ok(None);
        }
        let name = self.state().default_route.clone();
        match name {
            Some(name) => self.link(ns, &name).await,
            None => Ok(None),
        }
    }

    async fn set_neighbour(&self, entry: &NeighbourEntry) -> Result<(), LinkError> {
        let mut state = self.state();
        state.check(FakeOp::SetNeighbour)?;
        state.get_mut(&Netns::Host, &entry.device)?;
        state
            .neighbours
            .retain(|n| !State::same_neighbour_key(n, entry));
        state.neighbours.push(entry.clone());
        state.mutations += 1;
        Ok(())
    }

    async fn delete_neighbour(&self, entry: &NeighbourEntry) -> Result<(), LinkError> {
        let mut state = self.state();
        state.check(FakeOp::DeleteNeighbour)?;
        let before = state.neighbours.len();
        state
            .neighbours
            .retain(|n| !State::same_neighbour_key(n, entry));
        if state.neighbours.len() == before {
            return Err(LinkError::not_found(format!("{}", entry)));
        }
        state.mutations += 1;
        Ok(())
    }

    async fn enable_proxy_arp(&self, name: &str) -> Result<(), LinkError> {
        let mut state = self.state();
        state.check(FakeOp::ProxyArp)?;
        if state.get(&Netns::Host, name).is_none() {
            return Err(LinkError::io(
                format!("write proxy_arp for {}", name),
                io::Error::from(io::ErrorKind::NotFound),
            ));
        }
        state.proxy_arp.insert(name.to_string());
        state.mutations += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_deleting_one_side_removes_peer() {
        let fabric = FakeFabric::new();
        let pod = Netns::at("/var/run/netns/pod");
        fabric.add_veth(&pod, "eth0", "vethabc", 1500).await.unwrap();
        fabric.move_link(&pod, "vethabc", &Netns::Host).await.unwrap();

        fabric.delete_link(&Netns::Host, "vethabc").await.unwrap();
        assert!(fabric.links(&Netns::Host).is_empty());
        assert!(fabric.links(&pod).is_empty());
    }

    #[tokio::test]
    async fn test_move_flushes_addresses_and_routes() {
        let fabric = FakeFabric::new();
        let pod = Netns::at("/var/run/netns/pod");
        fabric.add_veth(&pod, "eth0", "vethabc", 1500).await.unwrap();
        fabric
            .add_address(&pod, "vethabc", "10.0.0.1/32".parse().unwrap())
            .await
            .unwrap();
        fabric
            .add_route(&pod, &RouteEntry::link_scoped("10.0.0.2/32".parse().unwrap(), "vethabc"))
            .await
            .unwrap();

        fabric.move_link(&pod, "vethabc", &Netns::Host).await.unwrap();
        let moved = fabric.fake_link(&Netns::Host, "vethabc").unwrap();
        assert!(moved.addresses.is_empty());
        assert!(!moved.up);
        assert!(fabric.routes(&pod).is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_creation_reports_exists() {
        let fabric = FakeFabric::new();
        fabric.add_veth(&Netns::Host, "a", "b", 1500).await.unwrap();
        let err = fabric.add_veth(&Netns::Host, "a", "c", 1500).await.unwrap_err();
        assert!(err.already_exists());
    }

    #[tokio::test]
    async fn test_injected_failure_is_not_counted() {
        let fabric = FakeFabric::new();
        fabric.add_host_link("eth0", 1500, &[]);
        fabric.fail_on(FakeOp::SetUp);
        assert!(fabric.set_up(&Netns::Host, "eth0").await.is_err());
        assert_eq!(fabric.mutations(), 0);

        fabric.clear_failures();
        fabric.set_up(&Netns::Host, "eth0").await.unwrap();
        assert_eq!(fabric.mutations(), 1);
    }
}
