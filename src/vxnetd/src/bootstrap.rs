//! Overlay bootstrap
//!
//! Creates the node's VXLAN device, or adopts the one a previous run left
//! behind, and anchors it at the network address of the node's pod range.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use tracing::{debug, info, warn};
use vxnet_link::{LinkFabric, LinkKind, MacAddr, Netns, VxlanSpec};

use crate::config::OverlayConfig;
use crate::error::DaemonError;

/// MTU assumed for an egress interface that does not report one
const FALLBACK_MTU: u32 = 1500;

/// The node's tunnel endpoint, ready for use
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Overlay {
    pub device: String,
    pub mac: MacAddr,
    /// Outer source address, published to the other nodes
    pub local: Ipv4Addr,
    pub mtu: u32,
    pub egress: String,
    pub anchor: Ipv4Net,
}

/// Bring up the overlay device for a node owning `pod_cidr`
pub async fn bootstrap(
    fabric: &dyn LinkFabric,
    settings: &OverlayConfig,
    pod_cidr: Ipv4Net,
) -> Result<Overlay, DaemonError> {
    let egress = fabric
        .default_route_link(&Netns::Host)
        .await
        .map_err(DaemonError::link("look up default route"))?
        .ok_or(DaemonError::NoDefaultRoute)?;
    let local = fabric
        .addresses(&Netns::Host, &egress.name)
        .await
        .map_err(DaemonError::link(format!("list addresses of {}", egress.name)))?
        .first()
        .map(|addr| addr.addr())
        .ok_or_else(|| DaemonError::NoEgressAddress(egress.name.clone()))?;
    let egress_mtu = egress.mtu.unwrap_or(FALLBACK_MTU);
    let mtu = egress_mtu.saturating_sub(settings.encap_overhead);

    let device = settings.device.as_str();
    let (mac, mtu) = match fabric
        .link(&Netns::Host, device)
        .await
        .map_err(DaemonError::link(format!("look up {}", device)))?
    {
        Some(existing) => match existing.kind {
            Some(LinkKind::Vxlan) => {
                info!(device, "reusing existing overlay device");
                (
                    existing.mac.unwrap_or_else(MacAddr::random_local),
                    existing.mtu.unwrap_or(mtu),
                )
            }
            other => {
                return Err(DaemonError::OverlayConflict {
                    name: device.to_string(),
                    kind: other.map(|k| format!("{:?}", k)).unwrap_or_else(|| "unknown".into()),
                })
            }
        },
        None => {
            let spec = VxlanSpec {
                name: device.to_string(),
                vni: settings.vni,
                port: settings.port,
                mac: MacAddr::random_local(),
                mtu,
                local,
                underlay_index: egress.index,
                // every FDB entry is installed by directory sync
                learning: false,
            };
            fabric
                .add_vxlan(&spec)
                .await
                .map_err(DaemonError::link(format!("create {}", device)))?;
            info!(
                device,
                vni = spec.vni,
                port = spec.port,
                mac = %spec.mac,
                mtu,
                local = %local,
                egress = %egress.name,
                "created overlay device"
            );
            (spec.mac, mtu)
        }
    };

    let anchor = Ipv4Net::from(pod_cidr.network());
    ensure_anchor(fabric, device, anchor).await?;

    fabric
        .set_up(&Netns::Host, device)
        .await
        .map_err(DaemonError::link(format!("bring up {}", device)))?;

    Ok(Overlay {
        device: device.to_string(),
        mac,
        local,
        mtu,
        egress: egress.name,
        anchor,
    })
}

/// Assign `anchor` unless the device already carries an address
async fn ensure_anchor(
    fabric: &dyn LinkFabric,
    device: &str,
    anchor: Ipv4Net,
) -> Result<(), DaemonError> {
    let current = fabric
        .addresses(&Netns::Host, device)
        .await
        .map_err(DaemonError::link(format!("list addresses of {}", device)))?;
    if !current.is_empty() {
        if current.contains(&anchor) {
            debug!(device, %anchor, "overlay anchor already assigned");
        } else {
            warn!(
                device,
                %anchor,
                existing = ?current,
                "overlay device already addressed, leaving it untouched"
            );
        }
        return Ok(());
    }

    fabric
        .add_address(&Netns::Host, device, anchor)
        .await
        .map_err(DaemonError::link(format!("assign {} to {}", anchor, device)))?;
    info!(device, %anchor, "assigned overlay anchor");
    Ok(())
}

#[cfg(test)]
mod tests {
    use vxnet_link::fake::{FakeFabric, FakeOp};

    use super::*;

    fn node_fabric() -> FakeFabric {
        FakeFabric::new().with_default_route("ens3", 1500, &["10.0.0.4/24".parse().unwrap()])
    }

    fn cidr() -> Ipv4Net {
        "10.244.0.0/24".parse().unwrap()
    }

    #[tokio::test]
    async fn test_creates_device() {
        let fabric = node_fabric();
        let overlay = bootstrap(&fabric, &OverlayConfig::default(), cidr()).await.unwrap();

        assert_eq!(overlay.device, "vxlan.1");
        assert_eq!(overlay.local, Ipv4Addr::new(10, 0, 0, 4));
        assert_eq!(overlay.mtu, 1450);
        assert_eq!(overlay.egress, "ens3");
        assert!(overlay.mac.is_unicast() && overlay.mac.is_local());

        let link = fabric.fake_link(&Netns::Host, "vxlan.1").unwrap();
        assert_eq!(link.kind, LinkKind::Vxlan);
        assert_eq!(link.mac, overlay.mac);
        assert!(link.up);
        assert!(!link.learning);
        assert_eq!(link.addresses, vec!["10.244.0.0/32".parse::<Ipv4Net>().unwrap()]);
    }

    #[tokio::test]
    async fn test_restart_reuses_device() {
        let fabric = node_fabric();
        let first = bootstrap(&fabric, &OverlayConfig::default(), cidr()).await.unwrap();

        fabric.fail_on(FakeOp::AddVxlan);
        let mutations = fabric.mutations();
        let second = bootstrap(&fabric, &OverlayConfig::default(), cidr()).await.unwrap();

        assert_eq!(first, second);
        // only the idempotent set_up
        assert_eq!(fabric.mutations(), mutations + 1);
    }

    #[tokio::test]
    async fn test_existing_address_is_preserved() {
        let fabric = node_fabric();
        bootstrap(&fabric, &OverlayConfig::default(), cidr()).await.unwrap();
        fabric.fail_on(FakeOp::AddAddress);
        fabric.fail_on(FakeOp::RemoveAddress);
        bootstrap(&fabric, &OverlayConfig::default(), "10.244.7.0/24".parse().unwrap())
            .await
            .unwrap();

        let link = fabric.fake_link(&Netns::Host, "vxlan.1").unwrap();
        assert_eq!(link.addresses, vec!["10.244.0.0/32".parse::<Ipv4Net>().unwrap()]);
    }

    #[tokio::test]
    async fn test_name_taken_by_other_kind() {
        let fabric = node_fabric();
        fabric.add_host_link("vxlan.1", 1500, &[]);
        let err = bootstrap(&fabric, &OverlayConfig::default(), cidr()).await.unwrap_err();
        assert!(matches!(err, DaemonError::OverlayConflict { .. }));
    }

    #[tokio::test]
    async fn test_requires_default_route() {
        let fabric = FakeFabric::new();
        let err = bootstrap(&fabric, &OverlayConfig::default(), cidr()).await.unwrap_err();
        assert!(matches!(err, DaemonError::NoDefaultRoute));
        assert_eq!(fabric.mutations(), 0);
    }

    #[tokio::test]
    async fn test_requires_egress_address() {
        let fabric = FakeFabric::new().with_default_route("ens3", 1500, &[]);
        let err = bootstrap(&fabric, &OverlayConfig::default(), cidr()).await.unwrap_err();
        assert!(matches!(err, DaemonError::NoEgressAddress(name) if name == "ens3"));
    }
}
