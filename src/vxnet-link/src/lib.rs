//! Kernel networking primitives for vxnet
//!
//! This crate is the only place that talks to the live kernel networking
//! stack. Everything else programs against [`LinkFabric`] so it can be
//! exercised with an in-memory fabric.

mod error;
mod fabric;
mod mac;
mod netlink;
mod types;

pub mod netns;
pub mod reconcile;

#[cfg(any(test, feature = "testing"))]
pub mod fake;

pub use error::LinkError;
pub use fabric::LinkFabric;
pub use mac::MacAddr;
pub use netlink::NetlinkFabric;
pub use types::{Link, LinkKind, NeighbourEntry, NeighbourKind, Netns, RouteEntry, RouteScope, VxlanSpec};
