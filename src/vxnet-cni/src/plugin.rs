//! The collaborators a plugin invocation works through

use std::net::Ipv4Addr;

use vxnet_link::{LinkFabric, MacAddr};

use crate::firewall::Firewall;
use crate::ipam::AddressCoordinator;

/// Link-local next hop every pod routes through. Proxy ARP on the host
/// link answers for it.
pub const POD_GATEWAY: Ipv4Addr = Ipv4Addr::new(169, 254, 1, 1);

/// Hardware address given to every host-side link
pub const HOST_LINK_MAC: MacAddr = MacAddr::new([0xee; 6]);

pub struct Plugin<'a> {
    pub fabric: &'a dyn LinkFabric,
    pub addresses: &'a dyn AddressCoordinator,
    pub firewall: &'a dyn Firewall,
}
