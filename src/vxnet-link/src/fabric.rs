//! The link fabric seam

use async_trait::async_trait;
use ipnet::Ipv4Net;

use crate::{Link, LinkError, MacAddr, NeighbourEntry, Netns, RouteEntry, VxlanSpec};

/// Primitive operations on links, addresses, routes and neighbour tables
///
/// Every operation is addressed by device name and, where it matters, by
/// namespace. Failures are reported as the kernel reported them: a missing
/// object yields an error for which [`LinkError::is_not_found`] holds, so
/// callers decide whether absence is acceptable.
#[async_trait]
pub trait LinkFabric: Send + Sync {
    /// Look up a link by name. `Ok(None)` when it does not exist.
    async fn link(&self, ns: &Netns, name: &str) -> Result<Option<Link>, LinkError>;

    /// Create a veth pair with both ends in `ns`
    async fn add_veth(&self, ns: &Netns, name: &str, peer: &str, mtu: u32)
        -> Result<(), LinkError>;

    /// Create a VXLAN device in the host namespace
    async fn add_vxlan(&self, spec: &VxlanSpec) -> Result<(), LinkError>;

    async fn delete_link(&self, ns: &Netns, name: &str) -> Result<(), LinkError>;

    async fn set_mac(&self, ns: &Netns, name: &str, mac: MacAddr) -> Result<(), LinkError>;

    async fn set_up(&self, ns: &Netns, name: &str) -> Result<(), LinkError>;

    /// Move a link from `from` into `to`
    async fn move_link(&self, from: &Netns, name: &str, to: &Netns) -> Result<(), LinkError>;

    /// IPv4 addresses configured on a link
    async fn addresses(&self, ns: &Netns, name: &str) -> Result<Vec<Ipv4Net>, LinkError>;

    async fn add_address(&self, ns: &Netns, name: &str, addr: Ipv4Net) -> Result<(), LinkError>;

    async fn remove_address(&self, ns: &Netns, name: &str, addr: Ipv4Net)
        -> Result<(), LinkError>;

    async fn add_route(&self, ns: &Netns, route: &RouteEntry) -> Result<(), LinkError>;

    /// Create the route, or replace one with the same destination
    async fn replace_route(&self, ns: &Netns, route: &RouteEntry) -> Result<(), LinkError>;

    async fn delete_route(&self, ns: &Netns, route: &RouteEntry) -> Result<(), LinkError>;

    /// Output device of the IPv4 default route, if there is one
    async fn default_route_link(&self, ns: &Netns) -> Result<Option<Link>, LinkError>;

    /// Create or replace a neighbour entry in the host namespace
    async fn set_neighbour(&self, entry: &NeighbourEntry) -> Result<(), LinkError>;

    async fn delete_neighbour(&self, entry: &NeighbourEntry) -> Result<(), LinkError>;

    /// Enable proxy ARP on a host-namespace link
    async fn enable_proxy_arp(&self, name: &str) -> Result<(), LinkError>;
}
