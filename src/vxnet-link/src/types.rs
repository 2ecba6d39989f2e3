//! Value types describing kernel networking objects

use std::fmt;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use ipnet::Ipv4Net;

use crate::MacAddr;

/// Network namespace an operation is scoped to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Netns {
    /// The namespace the current process was started in
    Host,
    /// A namespace identified by its bind-mount or procfs path
    Path(PathBuf),
}

impl Netns {
    pub fn at(path: impl AsRef<Path>) -> Self {
        Self::Path(path.as_ref().to_path_buf())
    }
}

impl fmt::Display for Netns {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Host => f.write_str("host"),
            Self::Path(p) => write!(f, "{}", p.display()),
        }
    }
}

/// Device kind as reported by the kernel's link info
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkKind {
    Veth,
    Vxlan,
    Other(String),
}

/// A network device as observed in one namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub index: u32,
    pub name: String,
    pub kind: Option<LinkKind>,
    pub mtu: Option<u32>,
    pub mac: Option<MacAddr>,
}

/// Parameters for creating a VXLAN tunnel endpoint device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VxlanSpec {
    pub name: String,
    pub vni: u32,
    pub port: u16,
    pub mac: MacAddr,
    pub mtu: u32,
    /// Outer source address
    pub local: Ipv4Addr,
    /// Index of the underlay device carrying encapsulated traffic
    pub underlay_index: u32,
    /// Learn remote addresses from received traffic. Off when the FDB is
    /// programmed explicitly.
    pub learning: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteScope {
    Universe,
    Link,
}

/// An IPv4 route bound to an output device
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RouteEntry {
    pub destination: Ipv4Net,
    pub gateway: Option<Ipv4Addr>,
    pub device: String,
    pub scope: RouteScope,
    /// Next hop is reachable without resolving it through another route
    pub onlink: bool,
}

impl RouteEntry {
    /// Directly connected route: `<dst> dev <device> scope link`
    pub fn link_scoped(destination: Ipv4Net, device: impl Into<String>) -> Self {
        Self {
            destination,
            gateway: None,
            device: device.into(),
            scope: RouteScope::Link,
            onlink: false,
        }
    }

    /// Gatewayed route: `<dst> via <gw> dev <device>`
    pub fn via(destination: Ipv4Net, gateway: Ipv4Addr, device: impl Into<String>) -> Self {
        Self {
            destination,
            gateway: Some(gateway),
            device: device.into(),
            scope: RouteScope::Universe,
            onlink: false,
        }
    }

    pub fn onlink(mut self) -> Self {
        self.onlink = true;
        self
    }
}

impl fmt::Display for RouteEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.destination)?;
        if let Some(gw) = self.gateway {
            write!(f, " via {}", gw)?;
        }
        write!(f, " dev {}", self.device)?;
        if self.onlink {
            f.write_str(" onlink")?;
        }
        Ok(())
    }
}

/// Which neighbour table an entry lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NeighbourKind {
    /// Permanent unicast ARP entry (IPv4 family)
    Arp,
    /// Permanent bridge forwarding entry with the self flag
    Fdb,
}

/// A permanent neighbour entry on a device in the host namespace
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NeighbourEntry {
    pub kind: NeighbourKind,
    pub device: String,
    pub ip: Ipv4Addr,
    pub mac: MacAddr,
}

impl NeighbourEntry {
    pub fn arp(device: impl Into<String>, ip: Ipv4Addr, mac: MacAddr) -> Self {
        Self {
            kind: NeighbourKind::Arp,
            device: device.into(),
            ip,
            mac,
        }
    }

    pub fn fdb(device: impl Into<String>, ip: Ipv4Addr, mac: MacAddr) -> Self {
        Self {
            kind: NeighbourKind::Fdb,
            device: device.into(),
            ip,
            mac,
        }
    }
}

impl fmt::Display for NeighbourEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let table = match self.kind {
            NeighbourKind::Arp => "arp",
            NeighbourKind::Fdb => "fdb",
        };
        write!(f, "{} {} lladdr {} dev {}", table, self.ip, self.mac, self.device)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_route_display() {
        let route = RouteEntry::via(
            "10.244.1.0/24".parse().unwrap(),
            Ipv4Addr::new(10, 244, 1, 0),
            "vxlan.1",
        )
        .onlink();
        assert_eq!(route.to_string(), "10.244.1.0/24 via 10.244.1.0 dev vxlan.1 onlink");

        let route = RouteEntry::link_scoped("169.254.1.1/32".parse().unwrap(), "eth0");
        assert_eq!(route.scope, RouteScope::Link);
        assert_eq!(route.to_string(), "169.254.1.1/32 dev eth0");
    }

    #[test]
    fn test_netns_display() {
        assert_eq!(Netns::Host.to_string(), "host");
        assert_eq!(Netns::at("/var/run/netns/ctr").to_string(), "/var/run/netns/ctr");
    }
}
