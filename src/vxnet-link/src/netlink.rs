//! rtnetlink-backed link fabric

use std::collections::HashMap;
use std::fs::File;
use std::net::IpAddr;
use std::os::unix::io::AsRawFd;
use std::path::PathBuf;
use std::sync::Mutex;

use async_trait::async_trait;
use futures::TryStreamExt;
use ipnet::Ipv4Net;
use netlink_packet_route::address::{AddressAttribute, AddressMessage};
use netlink_packet_route::link::{InfoKind, LinkAttribute, LinkInfo, LinkMessage};
use netlink_packet_route::neighbour::{NeighbourFlag, NeighbourState};
use netlink_packet_route::route::{
    RouteAttribute, RouteFlag, RouteScope as NlRouteScope, RouteType,
};
use netlink_packet_route::AddressFamily;
use rtnetlink::{new_connection, Handle, IpVersion};
use tracing::debug;

use crate::netns;
use crate::{
    Link, LinkError, LinkFabric, LinkKind, MacAddr, NeighbourEntry, NeighbourKind, Netns,
    RouteEntry, RouteScope, VxlanSpec,
};

const PROC_SYS_IPV4_CONF: &str = "/proc/sys/net/ipv4/conf";

/// Link fabric talking to the kernel over rtnetlink
///
/// Sockets for other namespaces are opened from inside the target
/// namespace and stay bound to it, so no request ever runs with the thread
/// switched away from the host namespace.
pub struct NetlinkFabric {
    host: Handle,
    host_ns: File,
    namespaces: Mutex<HashMap<PathBuf, Handle>>,
}

impl NetlinkFabric {
    /// Open the host connection. Must be called within a tokio runtime.
    pub fn new() -> Result<Self, LinkError> {
        let host_ns = netns::current_netns()?;
        let host = spawn_connection()?;
        Ok(Self {
            host,
            host_ns,
            namespaces: Mutex::new(HashMap::new()),
        })
    }

    fn handle(&self, ns: &Netns) -> Result<Handle, LinkError> {
        let path = match ns {
            Netns::Host => return Ok(self.host.clone()),
            Netns::Path(path) => path,
        };

        let mut namespaces = self
            .namespaces
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(handle) = namespaces.get(path) {
            return Ok(handle.clone());
        }

        let handle = netns::with_netns(path, spawn_connection)?;
        debug!(netns = %path.display(), "opened netlink connection in namespace");
        namespaces.insert(path.clone(), handle.clone());
        Ok(handle)
    }

    async fn index(&self, handle: &Handle, ns: &Netns, name: &str) -> Result<u32, LinkError> {
        get_link(handle, name)
            .await?
            .map(|msg| msg.header.index)
            .ok_or_else(|| LinkError::not_found(format!("link {} in {}", name, ns)))
    }

    async fn route_request(
        &self,
        ns: &Netns,
        route: &RouteEntry,
    ) -> Result<(Handle, rtnetlink::RouteAddRequest<std::net::Ipv4Addr>), LinkError> {
        let handle = self.handle(ns)?;
        let index = self.index(&handle, ns, &route.device).await?;

        let scope = match route.scope {
            RouteScope::Universe => NlRouteScope::Universe,
            RouteScope::Link => NlRouteScope::Link,
        };
        let mut request = handle
            .route()
            .add()
            .v4()
            .destination_prefix(route.destination.network(), route.destination.prefix_len())
            .output_interface(index)
            .scope(scope);
        if let Some(gateway) = route.gateway {
            request = request.gateway(gateway);
        }
        if route.onlink {
            request.message_mut().header.flags.push(RouteFlag::Onlink);
        }
        Ok((handle, request))
    }

    async fn neighbour_request(
        &self,
        entry: &NeighbourEntry,
    ) -> Result<rtnetlink::NeighbourAddRequest, LinkError> {
        let index = self.index(&self.host, &Netns::Host, &entry.device).await?;

        let mut request = self
            .host
            .neighbours()
            .add(index, IpAddr::V4(entry.ip))
            .link_local_address(&entry.mac.octets())
            .state(NeighbourState::Permanent);

        match entry.kind {
            NeighbourKind::Arp => {
                request = request.kind(RouteType::Unicast);
            }
            NeighbourKind::Fdb => {
                // NTF_SELF: the entry belongs to the vxlan device itself
                request = request.flags(vec![NeighbourFlag::Own]);
                request.message_mut().header.family = AddressFamily::Bridge;
            }
        }
        Ok(request)
    }
}

fn spawn_connection() -> Result<Handle, LinkError> {
    let (connection, handle, _) =
        new_connection().map_err(|e| LinkError::io("open netlink socket", e))?;
    tokio::spawn(connection);
    Ok(handle)
}

async fn get_link(handle: &Handle, name: &str) -> Result<Option<LinkMessage>, LinkError> {
    let mut links = handle.link().get().match_name(name.to_string()).execute();

    match links.try_next().await {
        Ok(link) => Ok(link),
        Err(rtnetlink::Error::NetlinkError(e)) if e.raw_code() == -libc::ENODEV => Ok(None),
        Err(e) => Err(LinkError::netlink(format!("get link {}", name), e)),
    }
}

fn to_link(msg: LinkMessage) -> Link {
    let mut link = Link {
        index: msg.header.index,
        name: String::new(),
        kind: None,
        mtu: None,
        mac: None,
    };

    for attr in msg.attributes {
        match attr {
            LinkAttribute::IfName(name) => link.name = name,
            LinkAttribute::Mtu(mtu) => link.mtu = Some(mtu),
            LinkAttribute::Address(addr) => link.mac = MacAddr::from_slice(&addr),
            LinkAttribute::LinkInfo(infos) => {
                for info in infos {
                    if let LinkInfo::Kind(kind) = info {
                        link.kind = Some(match kind {
                            InfoKind::Veth => LinkKind::Veth,
                            InfoKind::Vxlan => LinkKind::Vxlan,
                            other => LinkKind::Other(format!("{:?}", other).to_lowercase()),
                        });
                    }
                }
            }
            _ => {}
        }
    }
    link
}

fn ipv4_address(msg: &AddressMessage) -> Option<Ipv4Net> {
    msg.attributes.iter().find_map(|attr| match attr {
        AddressAttribute::Address(IpAddr::V4(ip)) => Ipv4Net::new(*ip, msg.header.prefix_len).ok(),
        _ => None,
    })
}

#[async_trait]
impl LinkFabric for NetlinkFabric {
    async fn link(&self, ns: &Netns, name: &str) -> Result<Option<Link>, LinkError> {
        let handle = self.handle(ns)?;
        Ok(get_link(&handle, name).await?.map(to_link))
    }

    async fn add_veth(
        &self,
        ns: &Netns,
        name: &str,
        peer: &str,
        mtu: u32,
    ) -> Result<(), LinkError> {
        let handle = self.handle(ns)?;
        handle
            .link()
            .add()
            .veth(name.to_string(), peer.to_string())
            .execute()
            .await
            .map_err(|e| LinkError::netlink(format!("add veth {} <-> {}", name, peer), e))?;

        for side in [name, peer] {
            let index = self.index(&handle, ns, side).await?;
            handle
                .link()
                .set(index)
                .mtu(mtu)
                .execute()
                .await
                .map_err(|e| LinkError::netlink(format!("set mtu {} on {}", mtu, side), e))?;
        }
        Ok(())
    }

    async fn add_vxlan(&self, spec: &VxlanSpec) -> Result<(), LinkError> {
        self.host
            .link()
            .add()
            .vxlan(spec.name.clone(), spec.vni)
            .link(spec.underlay_index)
            .local(spec.local)
            .port(spec.port)
            .learning(spec.learning)
            .execute()
            .await
            .map_err(|e| LinkError::netlink(format!("add vxlan {}", spec.name), e))?;

        let index = self.index(&self.host, &Netns::Host, &spec.name).await?;
        self.host
            .link()
            .set(index)
            .mtu(spec.mtu)
            .address(spec.mac.octets().to_vec())
            .execute()
            .await
            .map_err(|e| LinkError::netlink(format!("configure vxlan {}", spec.name), e))
    }

    async fn delete_link(&self, ns: &Netns, name: &str) -> Result<(), LinkError> {
        let handle = self.handle(ns)?;
        let index = self.index(&handle, ns, name).await?;
        handle
            .link()
            .del(index)
            .execute()
            .await
            .map_err(|e| LinkError::netlink(format!("delete link {}", name), e))
    }

    async fn set_mac(&self, ns: &Netns, name: &str, mac: MacAddr) -> Result<(), LinkError> {
        let handle = self.handle(ns)?;
        let index = self.index(&handle, ns, name).await?;
        handle
            .link()
            .set(index)
            .address(mac.octets().to_vec())
            .execute()
            .await
            .map_err(|e| LinkError::netlink(format!("set address {} on {}", mac, name), e))
    }

    async fn set_up(&self, ns: &Netns, name: &str) -> Result<(), LinkError> {
        let handle = self.handle(ns)?;
        let index = self.index(&handle, ns, name).await?;
        handle
            .link()
            .set(index)
            .up()
            .execute()
            .await
            .map_err(|e| LinkError::netlink(format!("set {} up", name), e))
    }

    async fn move_link(&self, from: &Netns, name: &str, to: &Netns) -> Result<(), LinkError> {
        let handle = self.handle(from)?;
        let index = self.index(&handle, from, name).await?;

        // Keep the target file open until the request has been sent
        let target = match to {
            Netns::Host => self
                .host_ns
                .try_clone()
                .map_err(|e| LinkError::io("duplicate host namespace handle", e))?,
            Netns::Path(path) => netns::open_netns(path)?,
        };

        handle
            .link()
            .set(index)
            .setns_by_fd(target.as_raw_fd())
            .execute()
            .await
            .map_err(|e| LinkError::netlink(format!("move {} to {}", name, to), e))
    }

    async fn addresses(&self, ns: &Netns, name: &str) -> Result<Vec<Ipv4Net>, LinkError> {
        let handle = self.handle(ns)?;
        let index = self.index(&handle, ns, name).await?;

        let mut stream = handle
            .address()
            .get()
            .set_link_index_filter(index)
            .execute();
        let mut addrs = Vec::new();
        while let Some(msg) = stream
            .try_next()
            .await
            .map_err(|e| LinkError::netlink(format!("list addresses on {}", name), e))?
        {
            if let Some(addr) = ipv4_address(&msg) {
                if !addrs.contains(&addr) {
                    addrs.push(addr);
                }
            }
        }
        Ok(addrs)
    }

    async fn add_address(&self, ns: &Netns, name: &str, addr: Ipv4Net) -> Result<(), LinkError> {
        let handle = self.handle(ns)?;
        let index = self.index(&handle, ns, name).await?;
        handle
            .address()
            .add(index, IpAddr::V4(addr.addr()), addr.prefix_len())
            .execute()
            .await
            .map_err(|e| LinkError::netlink(format!("add address {} on {}", addr, name), e))
    }

    async fn remove_address(
        &self,
        ns: &Netns,
        name: &str,
        addr: Ipv4Net,
    ) -> Result<(), LinkError> {
        let handle = self.handle(ns)?;
        let index = self.index(&handle, ns, name).await?;

        let mut stream = handle
            .address()
            .get()
            .set_link_index_filter(index)
            .execute();
        while let Some(msg) = stream
            .try_next()
            .await
            .map_err(|e| LinkError::netlink(format!("list addresses on {}", name), e))?
        {
            if ipv4_address(&msg) == Some(addr) {
                return handle.address().del(msg).execute().await.map_err(|e| {
                    LinkError::netlink(format!("remove address {} from {}", addr, name), e)
                });
            }
        }
        Err(LinkError::not_found(format!("address {} on {}", addr, name)))
    }

    async fn add_route(&self, ns: &Netns, route: &RouteEntry) -> Result<(), LinkError> {
        let (_, request) = self.route_request(ns, route).await?;
        request
            .execute()
            .await
            .map_err(|e| LinkError::netlink(format!("add route {}", route), e))
    }

    async fn replace_route(&self, ns: &Netns, route: &RouteEntry) -> Result<(), LinkError> {
        let (_, request) = self.route_request(ns, route).await?;
        request
            .replace()
            .execute()
            .await
            .map_err(|e| LinkError::netlink(format!("replace route {}", route), e))
    }

    async fn delete_route(&self, ns: &Netns, route: &RouteEntry) -> Result<(), LinkError> {
        let (handle, mut request) = self.route_request(ns, route).await?;
        let message = request.message_mut().clone();
        handle
            .route()
            .del(message)
            .execute()
            .await
            .map_err(|e| LinkError::netlink(format!("delete route {}", route), e))
    }

    async fn default_route_link(&self, ns: &Netns) -> Result<Option<Link>, LinkError> {
        let handle = self.handle(ns)?;

        let mut routes = handle.route().get(IpVersion::V4).execute();
        let mut oif = None;
        while let Some(route) = routes
            .try_next()
            .await
            .map_err(|e| LinkError::netlink("list ipv4 routes", e))?
        {
            if route.header.destination_prefix_length != 0 {
                continue;
            }
            oif = route.attributes.iter().find_map(|attr| match attr {
                RouteAttribute::Oif(index) => Some(*index),
                _ => None,
            });
            if oif.is_some() {
                break;
            }
        }

        let Some(index) = oif else {
            return Ok(None);
        };
        let mut links = handle.link().get().match_index(index).execute();
        let link = links
            .try_next()
            .await
            .map_err(|e| LinkError::netlink(format!("get link #{}", index), e))?;
        Ok(link.map(to_link))
    }

    async fn set_neighbour(&self, entry: &NeighbourEntry) -> Result<(), LinkError> {
        let request = self.neighbour_request(entry).await?;
        request
            .replace()
            .execute()
            .await
            .map_err(|e| LinkError::netlink(format!("set {}", entry), e))
    }

    async fn delete_neighbour(&self, entry: &NeighbourEntry) -> Result<(), LinkError> {
        let mut request = self.neighbour_request(entry).await?;
        let message = request.message_mut().clone();
        self.host
            .neighbours()
            .del(message)
            .execute()
            .await
            .map_err(|e| LinkError::netlink(format!("delete {}", entry), e))
    }

    async fn enable_proxy_arp(&self, name: &str) -> Result<(), LinkError> {
        let path = format!("{}/{}/proxy_arp", PROC_SYS_IPV4_CONF, name);
        std::fs::write(&path, "1").map_err(|e| LinkError::io(format!("write {}", path), e))
    }
}
