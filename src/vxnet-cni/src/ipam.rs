//! Address coordinator client
//!
//! Address allocation is delegated to an IPAM plugin (host-local by
//! default) invoked the way the runtime invokes us: the plugin binary is
//! looked up on `CNI_PATH`, gets the delegate configuration on stdin and the
//! request's `CNI_*` variables in its environment.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use ipnet::Ipv4Net;
use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::args::CmdArgs;
use crate::config::DelegateConfig;
use crate::error::CniError;
use crate::result::CniResult;

/// Allocates and releases pod addresses
#[async_trait]
pub trait AddressCoordinator: Send + Sync {
    async fn allocate(&self, config: &DelegateConfig) -> Result<CniResult, CniError>;

    async fn release(&self, config: &DelegateConfig) -> Result<(), CniError>;
}

/// IPv4 addresses of an allocation result
///
/// Non-IPv4 entries are skipped; an allocation without any usable IPv4
/// address is an error.
pub fn ipv4_addresses(result: &CniResult) -> Result<Vec<Ipv4Net>, CniError> {
    let mut addresses = Vec::new();
    for ip in result.ips.iter().flatten() {
        if ip.version.as_deref() == Some("6") || ip.address.contains(':') {
            warn!(address = %ip.address, "ignoring non-IPv4 allocation");
            continue;
        }
        let addr: Ipv4Net = ip.address.parse().map_err(|e: ipnet::AddrParseError| {
            CniError::ipam_error(&format!("IPAM returned invalid address {:?}", ip.address))
                .with_details(&e.to_string())
        })?;
        addresses.push(addr);
    }
    if addresses.is_empty() {
        return Err(CniError::ipam_error("IPAM returned no IPv4 address"));
    }
    Ok(addresses)
}

/// Error body printed by a failing plugin
#[derive(Debug, Deserialize)]
struct PluginError {
    #[serde(default)]
    code: u32,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    details: Option<String>,
}

/// Invokes the IPAM plugin binary
pub struct ExecCoordinator {
    search_path: Vec<PathBuf>,
    env: Vec<(&'static str, String)>,
}

impl ExecCoordinator {
    pub fn new(args: &CmdArgs) -> Self {
        let netns = args
            .netns
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_default();
        let cni_path = std::env::join_paths(&args.plugin_path)
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_default();

        Self {
            search_path: args.plugin_path.clone(),
            env: vec![
                ("CNI_CONTAINERID", args.container_id.clone()),
                ("CNI_NETNS", netns),
                ("CNI_IFNAME", args.ifname.clone()),
                ("CNI_ARGS", args.raw_args.clone()),
                ("CNI_PATH", cni_path),
            ],
        }
    }

    fn find_plugin(&self, name: &str) -> Result<PathBuf, CniError> {
        if name.is_empty() || name.contains('/') {
            return Err(CniError::config_error(&format!(
                "invalid IPAM plugin type {:?}",
                name
            )));
        }
        self.search_path
            .iter()
            .map(|dir| dir.join(name))
            .find(|candidate| candidate.is_file())
            .ok_or_else(|| {
                CniError::ipam_error(&format!("IPAM plugin {:?} not found in CNI_PATH", name))
            })
    }

    async fn exec(&self, command: &str, config: &DelegateConfig) -> Result<Vec<u8>, CniError> {
        let plugin = self.find_plugin(&config.ipam.plugin_type)?;
        let input = serde_json::to_vec(config).map_err(|e| {
            CniError::io_error("failed to serialize IPAM config").with_details(&e.to_string())
        })?;
        debug!(plugin = %plugin.display(), command, "invoking IPAM plugin");

        let output = run_plugin(&plugin, command, &self.env, &input)
            .await
            .map_err(|e| {
                CniError::ipam_error(&format!("failed to run IPAM plugin {}", plugin.display()))
                    .with_details(&e.to_string())
            })?;

        if !output.status.success() {
            let err = match serde_json::from_slice::<PluginError>(&output.stdout) {
                Ok(body) => CniError::ipam_error(&format!(
                    "IPAM {} failed: {} (code {})",
                    command, body.msg, body.code
                ))
                .with_details(body.details.as_deref().unwrap_or_default()),
                Err(_) => CniError::ipam_error(&format!("IPAM {} failed", command))
                    .with_details(String::from_utf8_lossy(&output.stderr).trim()),
            };
            return Err(err);
        }
        Ok(output.stdout)
    }
}

async fn run_plugin(
    plugin: &Path,
    command: &str,
    env: &[(&'static str, String)],
    input: &[u8],
) -> std::io::Result<std::process::Output> {
    let mut child = Command::new(plugin)
        .env("CNI_COMMAND", command)
        .envs(env.iter().map(|(k, v)| (*k, v.as_str())))
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(input).await?;
    }
    child.wait_with_output().await
}

#[async_trait]
impl AddressCoordinator for ExecCoordinator {
    async fn allocate(&self, config: &DelegateConfig) -> Result<CniResult, CniError> {
        let stdout = self.exec("ADD", config).await?;
        serde_json::from_slice(&stdout).map_err(|e| {
            CniError::ipam_error("failed to decode IPAM result").with_details(&e.to_string())
        })
    }

    async fn release(&self, config: &DelegateConfig) -> Result<(), CniError> {
        self.exec("DEL", config).await.map(|_| ())
    }
}
