//! CHECK: verify an attached pod is still wired

use tracing::debug;
use vxnet_link::{LinkKind, Netns};

use crate::args::CmdArgs;
use crate::config::Network;
use crate::error::{CniError, CniErrorCode};
use crate::firewall;
use crate::naming;
use crate::plugin::Plugin;

impl Plugin<'_> {
    pub async fn check(&self, args: &CmdArgs, network: &Network) -> Result<(), CniError> {
        let netns = args
            .netns
            .as_ref()
            .ok_or_else(|| CniError::env_error("CNI_NETNS not set"))?;
        let host_link = naming::host_link_name(&args.pod, &args.container_id);

        self.expect_veth(&Netns::Host, &host_link).await?;
        self.expect_veth(&Netns::at(netns), &args.ifname).await?;

        let rules = firewall::pod_rules(&host_link, &network.egress_interface, network.subnet);
        for rule in &rules {
            if !self.firewall.exists(rule).await? {
                return Err(CniError::new(
                    CniErrorCode::FirewallFailure,
                    &format!("rule missing: {}", rule),
                ));
            }
        }

        debug!(link = %host_link, "pod wiring intact");
        Ok(())
    }

    async fn expect_veth(&self, ns: &Netns, name: &str) -> Result<(), CniError> {
        let link = self.fabric.link(ns, name).await.map_err(|e| {
            CniError::caused_by(
                CniErrorCode::LinkFailure,
                &format!("failed to look up {} in {}", name, ns),
                e,
            )
        })?;
        match link.and_then(|l| l.kind) {
            Some(LinkKind::Veth) => Ok(()),
            Some(kind) => Err(CniError::new(
                CniErrorCode::LinkFailure,
                &format!("{} in {} is a {:?} link, expected veth", name, ns, kind),
            )),
            None => Err(CniError::new(
                CniErrorCode::LinkFailure,
                &format!("link {} missing in {}", name, ns),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use vxnet_link::LinkFabric;

    use super::*;
    use crate::plugin::testing::{cmd_args, network, Fixture};

    #[tokio::test]
    async fn test_check_after_attach() {
        let fixture = Fixture::default();
        let args = cmd_args("default", "web-1");
        fixture.plugin().attach(&args, &network()).await.unwrap();
        fixture.plugin().check(&args, &network()).await.unwrap();
    }

    #[tokio::test]
    async fn test_check_reports_missing_host_link() {
        let fixture = Fixture::default();
        let args = cmd_args("default", "web-1");
        fixture.plugin().attach(&args, &network()).await.unwrap();

        let host_link = naming::host_link_name(&args.pod, &args.container_id);
        fixture.fabric.delete_link(&Netns::Host, &host_link).await.unwrap();

        let err = fixture.plugin().check(&args, &network()).await.unwrap_err();
        assert_eq!(err.code(), CniErrorCode::LinkFailure);
        assert!(err.message().contains(&host_link));
    }

    #[tokio::test]
    async fn test_check_reports_missing_rule() {
        let fixture = Fixture::default();
        let args = cmd_args("default", "web-1");
        fixture.plugin().attach(&args, &network()).await.unwrap();
        fixture.firewall.rules.lock().unwrap().clear();

        let err = fixture.plugin().check(&args, &network()).await.unwrap_err();
        assert_eq!(err.code(), CniErrorCode::FirewallFailure);
    }
}
