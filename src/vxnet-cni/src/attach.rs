//! Attach state machine
//!
//! Every step is safe to repeat: stale links from an earlier attempt are
//! removed up front, so a failed attach is retried from scratch.

use ipnet::Ipv4Net;
use tracing::{debug, info, warn};
use vxnet_link::reconcile::{self, KernelObject};
use vxnet_link::{Netns, RouteEntry};

use crate::args::CmdArgs;
use crate::config::Network;
use crate::error::{CniError, CniErrorCode};
use crate::firewall;
use crate::ipam;
use crate::naming;
use crate::plugin::{Plugin, HOST_LINK_MAC, POD_GATEWAY};
use crate::result::CniResult;

impl Plugin<'_> {
    /// Wire one pod into the node network
    pub async fn attach(&self, args: &CmdArgs, network: &Network) -> Result<CniResult, CniError> {
        let netns = args
            .netns
            .as_ref()
            .ok_or_else(|| CniError::env_error("CNI_NETNS not set"))?;
        let pod_ns = Netns::at(netns);
        let host_link = naming::host_link_name(&args.pod, &args.container_id);
        info!(
            container = %args.container_id,
            link = %host_link,
            netns = %pod_ns,
            naming = naming::NAMING_VERSION,
            "attaching pod"
        );

        let mut result = self.addresses.allocate(&network.delegate_config()).await?;
        let addresses: Vec<Ipv4Net> = ipam::ipv4_addresses(&result)?
            .into_iter()
            .map(|addr| Ipv4Net::from(addr.addr()))
            .collect();

        let stale = [
            KernelObject::host_link(&host_link),
            KernelObject::Link {
                ns: pod_ns.clone(),
                name: host_link.clone(),
            },
        ];
        let removed = reconcile::remove_all(self.fabric, &stale)
            .await
            .map_err(|e| {
                CniError::caused_by(
                    CniErrorCode::LinkFailure,
                    &format!("failed to remove stale link {}", host_link),
                    e,
                )
            })?;
        if removed > 0 {
            warn!(link = %host_link, "removed link left by an earlier attempt");
        }

        self.setup_pod_namespace(&pod_ns, &args.ifname, &host_link, &addresses, network.mtu)
            .await?;

        self.fabric
            .enable_proxy_arp(&host_link)
            .await
            .map_err(|e| {
                CniError::caused_by(
                    CniErrorCode::LinkFailure,
                    &format!("failed to enable proxy ARP on {}", host_link),
                    e,
                )
            })?;
        self.fabric
            .set_up(&Netns::Host, &host_link)
            .await
            .map_err(|e| {
                CniError::caused_by(
                    CniErrorCode::LinkFailure,
                    &format!("failed to bring up {}", host_link),
                    e,
                )
            })?;

        let rules = firewall::pod_rules(&host_link, &network.egress_interface, network.subnet);
        firewall::install(self.firewall, &rules).await?;

        for addr in &addresses {
            let route = RouteEntry::link_scoped(*addr, host_link.as_str());
            self.fabric
                .replace_route(&Netns::Host, &route)
                .await
                .map_err(|e| {
                    CniError::caused_by(
                        CniErrorCode::RouteFailure,
                        &format!("failed to add host route {}", route),
                        e,
                    )
                })?;
        }

        let interior_mac = self.link_mac(&pod_ns, &args.ifname).await?;
        let host_mac = self.link_mac(&Netns::Host, &host_link).await?;

        result.cni_version = network.cni_version.clone();
        result.interfaces = None;
        let interior = result.push_interface(
            args.ifname.clone(),
            interior_mac,
            Some(netns.display().to_string()),
        );
        result.push_interface(host_link.clone(), host_mac, None);

        let mut ips = result.ips.take().unwrap_or_default();
        ips.retain(|ip| ip.version.as_deref() != Some("6") && !ip.address.contains(':'));
        for (ip, addr) in ips.iter_mut().zip(&addresses) {
            ip.address = addr.to_string();
            ip.gateway = None;
            ip.interface = Some(interior);
        }
        result.ips = Some(ips);

        info!(link = %host_link, addresses = ?addresses, "pod attached");
        Ok(result)
    }

    /// Create the veth pair inside the pod namespace and configure the
    /// interior side, then hand the host side over to the host namespace
    async fn setup_pod_namespace(
        &self,
        pod_ns: &Netns,
        ifname: &str,
        host_link: &str,
        addresses: &[Ipv4Net],
        mtu: u32,
    ) -> Result<(), CniError> {
        let ns_error = |step: String| {
            move |e: vxnet_link::LinkError| {
                CniError::caused_by(CniErrorCode::NamespaceFailure, &step, e)
            }
        };

        self.fabric
            .add_veth(pod_ns, ifname, host_link, mtu)
            .await
            .map_err(ns_error(format!(
                "failed to create veth pair {} <-> {}",
                ifname, host_link
            )))?;

        if let Err(e) = self.fabric.set_mac(pod_ns, host_link, HOST_LINK_MAC).await {
            warn!(link = %host_link, error = %e, "failed to set host link MAC, keeping kernel-assigned address");
        }

        for name in [ifname, host_link] {
            self.fabric
                .set_up(pod_ns, name)
                .await
                .map_err(ns_error(format!("failed to bring up {}", name)))?;
        }

        let gateway = RouteEntry::link_scoped(Ipv4Net::from(POD_GATEWAY), ifname);
        let default = RouteEntry::via(Ipv4Net::default(), POD_GATEWAY, ifname);
        for route in [&gateway, &default] {
            self.fabric
                .add_route(pod_ns, route)
                .await
                .map_err(ns_error(format!("failed to add route {}", route)))?;
        }

        for addr in addresses {
            self.fabric
                .add_address(pod_ns, ifname, *addr)
                .await
                .map_err(ns_error(format!("failed to add address {} to {}", addr, ifname)))?;
        }

        self.fabric
            .move_link(pod_ns, host_link, &Netns::Host)
            .await
            .map_err(ns_error(format!("failed to move {} to host namespace", host_link)))?;
        debug!(link = %host_link, "moved host link out of pod namespace");
        Ok(())
    }

    async fn link_mac(&self, ns: &Netns, name: &str) -> Result<String, CniError> {
        let link = self
            .fabric
            .link(ns, name)
            .await
            .map_err(|e| {
                CniError::caused_by(
                    CniErrorCode::LinkFailure,
                    &format!("failed to look up {}", name),
                    e,
                )
            })?
            .ok_or_else(|| {
                CniError::new(
                    CniErrorCode::LinkFailure,
                    &format!("link {} vanished during attach", name),
                )
            })?;
        Ok(link.mac.map(|m| m.to_string()).unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use sha1::{Digest, Sha1};
    use vxnet_link::fake::FakeOp;
    use vxnet_link::LinkFabric;

    use super::*;
    use crate::plugin::testing::{cmd_args, network, Fixture, NETNS};

    #[tokio::test]
    async fn test_attach_scenario() {
        let fixture = Fixture::default();
        let args = cmd_args("default", "web-1");
        let result = fixture.plugin().attach(&args, &network()).await.unwrap();

        let digest = hex::encode(Sha1::digest(b"default.web-1"));
        let host_link = format!("veth{}", &digest[..11]);

        let interfaces = result.interfaces.unwrap();
        assert_eq!(interfaces.len(), 2);
        assert_eq!(interfaces[0].name, "eth0");
        assert_eq!(interfaces[0].sandbox.as_deref(), Some(NETNS));
        assert_eq!(interfaces[1].name, host_link);
        assert_eq!(interfaces[1].mac, "ee:ee:ee:ee:ee:ee");

        let ips = result.ips.unwrap();
        assert_eq!(ips.len(), 1);
        assert_eq!(ips[0].gateway, None);
        assert_eq!(ips[0].interface, Some(0));
        let addr: Ipv4Net = ips[0].address.parse().unwrap();
        let subnet: Ipv4Net = "10.244.0.0/24".parse().unwrap();
        assert!(subnet.contains(&addr.addr()));

        assert_eq!(fixture.fabric.links(&Netns::Host), vec![host_link.clone()]);
        assert_eq!(fixture.fabric.links(&Fixture::pod_ns()), vec!["eth0".to_string()]);
        assert!(fixture.fabric.proxy_arp_enabled(&host_link));
        assert!(fixture.fabric.fake_link(&Netns::Host, &host_link).unwrap().up);
        assert_eq!(fixture.firewall.len(), 3);
    }

    #[tokio::test]
    async fn test_pod_namespace_wiring() {
        let fixture = Fixture::default();
        let args = cmd_args("default", "web-1");
        fixture.plugin().attach(&args, &network()).await.unwrap();

        let pod_ns = Fixture::pod_ns();
        let eth0 = fixture.fabric.fake_link(&pod_ns, "eth0").unwrap();
        assert!(eth0.up);
        assert_eq!(eth0.addresses.len(), 1);
        assert_eq!(eth0.addresses[0].prefix_len(), 32);

        let routes = fixture.fabric.routes(&pod_ns);
        assert!(routes.contains(&RouteEntry::link_scoped(
            "169.254.1.1/32".parse().unwrap(),
            "eth0"
        )));
        assert!(routes.contains(&RouteEntry::via(
            "0.0.0.0/0".parse().unwrap(),
            POD_GATEWAY,
            "eth0"
        )));

        let host_routes = fixture.fabric.routes(&Netns::Host);
        assert_eq!(host_routes.len(), 1);
        assert_eq!(host_routes[0].destination, eth0.addresses[0]);
    }

    #[tokio::test]
    async fn test_attach_twice_is_idempotent() {
        let fixture = Fixture::default();
        let args = cmd_args("default", "web-1");
        fixture.plugin().attach(&args, &network()).await.unwrap();
        fixture.plugin().attach(&args, &network()).await.unwrap();

        let host_link = naming::host_link_name(&args.pod, &args.container_id);
        assert_eq!(fixture.fabric.links(&Netns::Host), vec![host_link]);
        assert_eq!(fixture.fabric.links(&Fixture::pod_ns()), vec!["eth0".to_string()]);
        assert_eq!(fixture.fabric.routes(&Netns::Host).len(), 1);
        assert_eq!(fixture.firewall.len(), 3);
    }

    #[tokio::test]
    async fn test_attach_recovers_link_stranded_in_pod_namespace() {
        let fixture = Fixture::default();
        let args = cmd_args("default", "web-1");
        let host_link = naming::host_link_name(&args.pod, &args.container_id);
        fixture
            .fabric
            .add_veth(&Fixture::pod_ns(), "eth0", &host_link, 1500)
            .await
            .unwrap();

        fixture.plugin().attach(&args, &network()).await.unwrap();
        assert_eq!(fixture.fabric.links(&Netns::Host), vec![host_link]);
        assert_eq!(fixture.fabric.links(&Fixture::pod_ns()), vec!["eth0".to_string()]);
    }

    #[tokio::test]
    async fn test_mac_failure_is_tolerated() {
        let fixture = Fixture::default();
        fixture.fabric.fail_on(FakeOp::SetMac);
        let result = fixture
            .plugin()
            .attach(&cmd_args("default", "web-1"), &network())
            .await
            .unwrap();
        assert_ne!(result.interfaces.unwrap()[1].mac, "ee:ee:ee:ee:ee:ee");
    }

    #[tokio::test]
    async fn test_proxy_arp_failure_is_fatal_and_retryable() {
        let fixture = Fixture::default();
        let args = cmd_args("default", "web-1");
        fixture.fabric.fail_on(FakeOp::ProxyArp);
        let err = fixture.plugin().attach(&args, &network()).await.unwrap_err();
        assert_eq!(err.code(), CniErrorCode::LinkFailure);
        assert_eq!(fixture.firewall.len(), 0);

        fixture.fabric.clear_failures();
        fixture.plugin().attach(&args, &network()).await.unwrap();
        assert_eq!(fixture.fabric.links(&Netns::Host).len(), 1);
    }

    #[tokio::test]
    async fn test_namespace_failure() {
        let fixture = Fixture::default();
        fixture.fabric.fail_on(FakeOp::AddAddress);
        let err = fixture
            .plugin()
            .attach(&cmd_args("default", "web-1"), &network())
            .await
            .unwrap_err();
        assert_eq!(err.code(), CniErrorCode::NamespaceFailure);
        assert!(err.message().contains("eth0"));
    }

    #[tokio::test]
    async fn test_veth_creation_failure_is_a_namespace_failure() {
        let fixture = Fixture::default();
        fixture.fabric.fail_on(FakeOp::AddVeth);
        let err = fixture
            .plugin()
            .attach(&cmd_args("default", "web-1"), &network())
            .await
            .unwrap_err();
        assert_eq!(err.code(), CniErrorCode::NamespaceFailure);
        assert!(err.message().contains("veth pair"));
        assert!(fixture.fabric.links(&Netns::Host).is_empty());
    }

    #[tokio::test]
    async fn test_allocation_failure_touches_nothing() {
        let fixture = Fixture::default();
        *fixture.addresses.fail_allocate.lock().unwrap() = true;
        let err = fixture
            .plugin()
            .attach(&cmd_args("default", "web-1"), &network())
            .await
            .unwrap_err();
        assert_eq!(err.code(), CniErrorCode::IpamFailure);
        assert_eq!(fixture.fabric.mutations(), 0);
        assert_eq!(fixture.firewall.len(), 0);
    }
}
