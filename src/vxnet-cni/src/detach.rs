//! Detach state machine
//!
//! Cleanup is best-effort: every step runs even if an earlier one failed,
//! and the first failure is reported once everything has been attempted.

use tracing::{debug, info, warn};
use vxnet_link::reconcile::{self, KernelObject};

use crate::args::CmdArgs;
use crate::config::Network;
use crate::error::{CniError, CniErrorCode};
use crate::firewall;
use crate::naming;
use crate::plugin::Plugin;

impl Plugin<'_> {
    /// Release the pod's addresses and remove its host-side state
    pub async fn detach(&self, args: &CmdArgs, network: &Network) -> Result<(), CniError> {
        let host_link = naming::host_link_name(&args.pod, &args.container_id);
        info!(container = %args.container_id, link = %host_link, "detaching pod");

        let mut failure: Option<CniError> = None;

        if let Err(e) = self.addresses.release(&network.delegate_config()).await {
            warn!(error = %e, details = e.details().unwrap_or_default(), "address release failed, continuing cleanup");
            failure = Some(e);
        }

        match reconcile::remove_all(self.fabric, &[KernelObject::host_link(&host_link)]).await {
            Ok(0) => debug!(link = %host_link, "host link already gone"),
            Ok(_) => debug!(link = %host_link, "deleted host link"),
            Err(e) => {
                warn!(link = %host_link, error = %e, "failed to delete host link");
                failure = failure.or(Some(CniError::caused_by(
                    CniErrorCode::LinkFailure,
                    &format!("failed to delete {}", host_link),
                    e,
                )));
            }
        }

        let rules = firewall::pod_rules(&host_link, &network.egress_interface, network.subnet);
        if let Err(e) = firewall::remove(self.firewall, &rules).await {
            warn!(link = %host_link, error = %e, "failed to remove firewall rules");
            failure = failure.or(Some(e));
        }

        match failure {
            Some(e) => Err(e),
            None => {
                info!(link = %host_link, "pod detached");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use vxnet_link::fake::FakeOp;
    use vxnet_link::Netns;

    use super::*;
    use crate::plugin::testing::{cmd_args, network, Fixture};

    #[tokio::test]
    async fn test_attach_detach_round_trip() {
        let fixture = Fixture::default();
        let args = cmd_args("default", "web-1");
        fixture.plugin().attach(&args, &network()).await.unwrap();
        fixture.plugin().detach(&args, &network()).await.unwrap();

        assert!(fixture.fabric.links(&Netns::Host).is_empty());
        assert!(fixture.fabric.links(&Fixture::pod_ns()).is_empty());
        assert!(fixture.fabric.routes(&Netns::Host).is_empty());
        assert_eq!(fixture.firewall.len(), 0);
        assert!(fixture.addresses.held.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_detach_leaves_other_pods() {
        let fixture = Fixture::default();
        let web1 = cmd_args("default", "web-1");
        let web2 = cmd_args("default", "web-2");
        fixture.plugin().attach(&web1, &network()).await.unwrap();
        fixture.plugin().attach(&web2, &network()).await.unwrap();

        fixture.plugin().detach(&web1, &network()).await.unwrap();
        assert_eq!(
            fixture.fabric.links(&Netns::Host),
            vec![naming::host_link_name(&web2.pod, &web2.container_id)]
        );
        assert_eq!(fixture.firewall.len(), 3);
    }

    #[tokio::test]
    async fn test_detach_of_absent_pod_succeeds() {
        let fixture = Fixture::default();
        let args = cmd_args("default", "web-1");
        fixture.plugin().detach(&args, &network()).await.unwrap();
        fixture.plugin().detach(&args, &network()).await.unwrap();
        assert_eq!(fixture.fabric.mutations(), 0);
    }

    #[tokio::test]
    async fn test_release_failure_does_not_block_cleanup() {
        let fixture = Fixture::default();
        let args = cmd_args("default", "web-1");
        fixture.plugin().attach(&args, &network()).await.unwrap();

        *fixture.addresses.fail_release.lock().unwrap() = true;
        let err = fixture.plugin().detach(&args, &network()).await.unwrap_err();
        assert_eq!(err.code(), CniErrorCode::IpamFailure);
        assert!(fixture.fabric.links(&Netns::Host).is_empty());
        assert_eq!(fixture.firewall.len(), 0);
    }

    #[tokio::test]
    async fn test_link_failure_still_removes_rules() {
        let fixture = Fixture::default();
        let args = cmd_args("default", "web-1");
        fixture.plugin().attach(&args, &network()).await.unwrap();

        fixture.fabric.fail_on(FakeOp::DeleteLink);
        let err = fixture.plugin().detach(&args, &network()).await.unwrap_err();
        assert_eq!(err.code(), CniErrorCode::LinkFailure);
        assert_eq!(fixture.firewall.len(), 0);
    }
}
