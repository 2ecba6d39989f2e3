//! NAT and forwarding rules
//!
//! Each attached pod gets three rules: forwarding in both directions
//! between its host link and the egress interface, and masquerading of
//! the pod subnet leaving through the egress interface. The masquerade
//! rule carries the host link name as a comment so every pod owns an
//! exact copy that its detach removes without affecting other pods.

use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use ipnet::Ipv4Net;
use tokio::process::Command;
use tracing::debug;

use crate::error::{CniError, CniErrorCode};

/// One firewall rule, addressed by table and chain
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Rule {
    pub table: &'static str,
    pub chain: &'static str,
    pub spec: Vec<String>,
}

impl Rule {
    fn new(table: &'static str, chain: &'static str, spec: &[&str]) -> Self {
        Self {
            table,
            chain,
            spec: spec.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl fmt::Display for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "-t {} {} {}", self.table, self.chain, self.spec.join(" "))
    }
}

/// The rules installed for one pod
pub fn pod_rules(host_link: &str, egress: &str, subnet: Ipv4Net) -> Vec<Rule> {
    let subnet = subnet.trunc().to_string();
    let comment = format!("vxnet:{}", host_link);
    vec![
        Rule::new(
            "filter",
            "FORWARD",
            &["-i", host_link, "-o", egress, "-j", "ACCEPT"],
        ),
        Rule::new(
            "filter",
            "FORWARD",
            &["-i", egress, "-o", host_link, "-j", "ACCEPT"],
        ),
        Rule::new(
            "nat",
            "POSTROUTING",
            &[
                "-s", &subnet, "-o", egress, "-m", "comment", "--comment", &comment, "-j",
                "MASQUERADE",
            ],
        ),
    ]
}

/// Host packet filter
#[async_trait]
pub trait Firewall: Send + Sync {
    async fn exists(&self, rule: &Rule) -> Result<bool, CniError>;

    async fn append(&self, rule: &Rule) -> Result<(), CniError>;

    async fn delete(&self, rule: &Rule) -> Result<(), CniError>;
}

/// Append every rule that is not already present
pub async fn install(firewall: &dyn Firewall, rules: &[Rule]) -> Result<(), CniError> {
    for rule in rules {
        if !firewall.exists(rule).await? {
            firewall.append(rule).await?;
            debug!(rule = %rule, "appended rule");
        }
    }
    Ok(())
}

/// Delete every rule that is present. Absent rules are not an error.
pub async fn remove(firewall: &dyn Firewall, rules: &[Rule]) -> Result<(), CniError> {
    for rule in rules {
        if firewall.exists(rule).await? {
            firewall.delete(rule).await?;
            debug!(rule = %rule, "deleted rule");
        }
    }
    Ok(())
}

/// Firewall driven through the `iptables` command
pub struct Iptables {
    binary: PathBuf,
}

impl Iptables {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Run iptables for `rule`, returning the exit code
    async fn run(&self, op: &str, rule: &Rule) -> Result<(i32, String), CniError> {
        let output = Command::new(&self.binary)
            .arg("-w")
            .args(["-t", rule.table, op, rule.chain])
            .args(&rule.spec)
            .output()
            .await
            .map_err(|e| {
                CniError::caused_by(
                    CniErrorCode::FirewallFailure,
                    &format!("failed to run {}", self.binary.display()),
                    e,
                )
            })?;
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        Ok((output.status.code().unwrap_or(-1), stderr))
    }

    async fn mutate(&self, op: &str, rule: &Rule) -> Result<(), CniError> {
        match self.run(op, rule).await? {
            (0, _) => Ok(()),
            (code, stderr) => Err(CniError::new(
                CniErrorCode::FirewallFailure,
                &format!("iptables {} {} failed with exit code {}", op, rule, code),
            )
            .with_details(&stderr)),
        }
    }
}

#[async_trait]
impl Firewall for Iptables {
    async fn exists(&self, rule: &Rule) -> Result<bool, CniError> {
        // -C exits 1 when the rule is missing, other codes are real failures
        match self.run("-C", rule).await? {
            (0, _) => Ok(true),
            (1, _) => Ok(false),
            (code, stderr) => Err(CniError::new(
                CniErrorCode::FirewallFailure,
                &format!("iptables -C {} failed with exit code {}", rule, code),
            )
            .with_details(&stderr)),
        }
    }

    async fn append(&self, rule: &Rule) -> Result<(), CniError> {
        self.mutate("-A", rule).await
    }

    async fn delete(&self, rule: &Rule) -> Result<(), CniError> {
        self.mutate("-D", rule).await
    }
}


#[cfg(test)]
mod tests {
    use super::testing::MemoryFirewall;
    use super::*;

    fn rules(host: &str) -> Vec<Rule> {
        pod_rules(host, "eth0", "10.244.0.0/24".parse().unwrap())
    }

    #[test]
    fn test_pod_rules() {
        let rules = rules("veth0123456789a");
        assert_eq!(
            rules[0].to_string(),
            "-t filter FORWARD -i veth0123456789a -o eth0 -j ACCEPT"
        );
        assert_eq!(
            rules[1].to_string(),
            "-t filter FORWARD -i eth0 -o veth0123456789a -j ACCEPT"
        );
        assert_eq!(
            rules[2].to_string(),
            "-t nat POSTROUTING -s 10.244.0.0/24 -o eth0 -m comment --comment vxnet:veth0123456789a -j MASQUERADE"
        );
    }

    #[tokio::test]
    async fn test_install_is_idempotent() {
        let firewall = MemoryFirewall::default();
        install(&firewall, &rules("veth-a")).await.unwrap();
        install(&firewall, &rules("veth-a")).await.unwrap();
        assert_eq!(firewall.len(), 3);
    }

    #[tokio::test]
    async fn test_remove_leaves_other_pods() {
        let firewall = MemoryFirewall::default();
        install(&firewall, &rules("veth-a")).await.unwrap();
        install(&firewall, &rules("veth-b")).await.unwrap();

        remove(&firewall, &rules("veth-a")).await.unwrap();
        remove(&firewall, &rules("veth-a")).await.unwrap();
        assert_eq!(firewall.len(), 3);
        assert!(firewall.rules.lock().unwrap().iter().all(|r| r.spec.iter().any(|s| s.contains("veth-b"))));
    }
}
