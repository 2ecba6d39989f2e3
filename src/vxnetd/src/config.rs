//! Configuration management
//!
//! Handles loading configuration from the TOML file, environment variables
//! and command-line flags.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::cli::Cli;

/// Default configuration file
pub const DEFAULT_CONFIG_PATH: &str = "/etc/vxnet/vxnetd.toml";

/// Configuration for the node daemon
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Identity of the node this daemon runs on
    #[serde(default)]
    pub node: NodeConfig,

    /// API server access
    #[serde(default)]
    pub kube: KubeConfig,

    /// Overlay device parameters
    #[serde(default)]
    pub overlay: OverlayConfig,

    /// Generated CNI network configuration
    #[serde(default)]
    pub cni: CniConfig,
}

/// Node identity
///
/// The node name is taken as-is when set; otherwise it is looked up from
/// the daemon's own pod.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    pub name: Option<String>,
    pub pod_name: Option<String>,
    pub pod_namespace: Option<String>,
}

/// API server access
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KubeConfig {
    /// Kubeconfig used when present, in-cluster inference otherwise
    #[serde(default = "default_kubeconfig")]
    pub kubeconfig: PathBuf,
}

fn default_kubeconfig() -> PathBuf {
    PathBuf::from("/etc/kubernetes/kubelet.conf")
}

impl Default for KubeConfig {
    fn default() -> Self {
        Self {
            kubeconfig: default_kubeconfig(),
        }
    }
}

/// Overlay device parameters, identical on every node
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverlayConfig {
    #[serde(default = "default_device")]
    pub device: String,

    /// VXLAN network identifier
    #[serde(default = "default_vni")]
    pub vni: u32,

    /// VXLAN UDP port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Bytes of outer headers subtracted from the egress MTU
    #[serde(default = "default_encap_overhead")]
    pub encap_overhead: u32,
}

fn default_device() -> String {
    "vxlan.1".to_string()
}

fn default_vni() -> u32 {
    1
}

fn default_port() -> u16 {
    8472
}

fn default_encap_overhead() -> u32 {
    50
}

impl Default for OverlayConfig {
    fn default() -> Self {
        Self {
            device: default_device(),
            vni: default_vni(),
            port: default_port(),
            encap_overhead: default_encap_overhead(),
        }
    }
}

/// Generated CNI network configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CniConfig {
    #[serde(default = "default_conf_path")]
    pub conf_path: PathBuf,

    #[serde(default = "default_network_name")]
    pub network_name: String,

    #[serde(default = "default_cni_version")]
    pub cni_version: String,

    #[serde(default = "default_plugin_type")]
    pub plugin_type: String,

    #[serde(default = "default_ipam_type")]
    pub ipam_type: String,
}

fn default_conf_path() -> PathBuf {
    PathBuf::from("/etc/cni/net.d/00-vxnet.conf")
}

fn default_network_name() -> String {
    "vxnet0".to_string()
}

fn default_cni_version() -> String {
    "0.3.1".to_string()
}

fn default_plugin_type() -> String {
    "vxnet-cni".to_string()
}

fn default_ipam_type() -> String {
    "host-local".to_string()
}

impl Default for CniConfig {
    fn default() -> Self {
        Self {
            conf_path: default_conf_path(),
            network_name: default_network_name(),
            cni_version: default_cni_version(),
            plugin_type: default_plugin_type(),
            ipam_type: default_ipam_type(),
        }
    }
}

impl Config {
    /// Load configuration
    ///
    /// Priority (highest to lowest):
    /// 1. Command-line flags
    /// 2. Environment variables (NODE_NAME, POD_NAME, POD_NAMESPACE,
    ///    VXNET_KUBECONFIG, VXNET_CNI_CONF)
    /// 3. Configuration file (/etc/vxnet/vxnetd.toml, or --config)
    /// 4. Default values
    pub fn load(cli: &Cli) -> Result<Self> {
        let mut config = match &cli.config {
            Some(path) => Self::load_from_file(path)?,
            None => {
                let path = Path::new(DEFAULT_CONFIG_PATH);
                if path.exists() {
                    Self::load_from_file(path)?
                } else {
                    Self::default()
                }
            }
        };

        config.apply_env_overrides(|key| env::var(key).ok());
        config.apply_cli_overrides(cli);
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a file, which must exist
    fn load_from_file(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Apply environment variable overrides
    fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = |key: &str| lookup(key).filter(|v| !v.is_empty());

        if let Some(name) = lookup("NODE_NAME") {
            self.node.name = Some(name);
        }

        if let Some(pod) = lookup("POD_NAME") {
            self.node.pod_name = Some(pod);
        }

        if let Some(namespace) = lookup("POD_NAMESPACE") {
            self.node.pod_namespace = Some(namespace);
        }

        if let Some(path) = lookup("VXNET_KUBECONFIG") {
            self.kube.kubeconfig = PathBuf::from(path);
        }

        if let Some(path) = lookup("VXNET_CNI_CONF") {
            self.cni.conf_path = PathBuf::from(path);
        }
    }

    fn apply_cli_overrides(&mut self, cli: &Cli) {
        if let Some(name) = &cli.node_name {
            self.node.name = Some(name.clone());
        }

        if let Some(path) = &cli.kubeconfig {
            self.kube.kubeconfig = path.clone();
        }
    }

    fn validate(&self) -> Result<()> {
        if self.overlay.vni == 0 || self.overlay.vni >= 1 << 24 {
            anyhow::bail!("overlay.vni must be between 1 and 16777215");
        }
        if self.overlay.device.is_empty() || self.overlay.device.len() > 15 {
            anyhow::bail!("overlay.device must be 1 to 15 characters");
        }
        Ok(())
    }
}
