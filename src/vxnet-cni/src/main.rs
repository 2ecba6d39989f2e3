//! vxnet CNI plugin
//!
//! Attaches pods to the node network: a veth pair per pod with the host
//! side proxy-ARPing for a link-local gateway, addresses from the
//! configured IPAM plugin, and forwarding/masquerade rules for egress.

mod args;
mod attach;
mod check;
mod config;
mod detach;
mod error;
mod firewall;
mod ipam;
mod logging;
mod naming;
mod plugin;
mod result;

use std::env;
use std::io::{self, Read};

use tracing::{debug, error};
use vxnet_link::NetlinkFabric;

use args::CmdArgs;
use config::Network;
use error::{CniError, CniErrorCode};
use firewall::Iptables;
use ipam::ExecCoordinator;
use plugin::Plugin;
use result::VersionResult;

/// Maximum size of network config input (1 MB should be more than enough)
const MAX_INPUT_SIZE: u64 = 1024 * 1024;

/// CNI Spec version used when the request does not name one
const CNI_VERSION: &str = "1.0.0";

/// Supported CNI versions
const SUPPORTED_VERSIONS: &[&str] = &["0.3.0", "0.3.1", "0.4.0", "1.0.0"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Add,
    Del,
    Check,
    Version,
}

impl Command {
    fn parse(command: &str) -> Result<Self, CniError> {
        match command {
            "ADD" => Ok(Self::Add),
            "DEL" => Ok(Self::Del),
            "CHECK" => Ok(Self::Check),
            "VERSION" => Ok(Self::Version),
            _ => {
                // Truncate command for safety in error message (avoid log injection)
                let safe_command: String = command
                    .chars()
                    .take(32)
                    .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
                    .collect();
                Err(CniError::env_error(&format!(
                    "unknown CNI_COMMAND: {}",
                    safe_command
                )))
            }
        }
    }
}

fn main() {
    logging::init();

    let mut input = String::new();
    let outcome = read_input(&mut input).and_then(|()| run(&input));
    match outcome {
        Ok(Some(output)) => println!("{}", output),
        Ok(None) => {}
        Err(e) => {
            error!(
                code = e.code() as u32,
                msg = e.message(),
                details = e.details().unwrap_or_default(),
                "request failed"
            );
            let version = request_version(&input);
            let body = e.to_body(&version);
            // Use compact JSON for CNI spec compliance; format by hand if that fails
            println!(
                "{}",
                serde_json::to_string(&body).unwrap_or_else(|_| {
                    format!(
                        r#"{{"cniVersion":"{}","code":{},"msg":"{}"}}"#,
                        version, body.code, body.msg
                    )
                })
            );
            std::process::exit(1);
        }
    }
}

/// Read network config from stdin (with size limit to prevent OOM)
fn read_input(input: &mut String) -> Result<(), CniError> {
    io::stdin()
        .take(MAX_INPUT_SIZE)
        .read_to_string(input)
        .map(|_| ())
        .map_err(|e| CniError::io_error("failed to read stdin").with_details(&e.to_string()))
}

fn run(input: &str) -> Result<Option<String>, CniError> {
    let command = env::var("CNI_COMMAND")
        .map_err(|_| CniError::env_error("CNI_COMMAND not set"))
        .and_then(|c| Command::parse(&c))?;

    if command == Command::Version {
        return version_result(input).map(Some);
    }

    let args = CmdArgs::from_env(command != Command::Del)?;
    debug!(
        ?command,
        container = %args.container_id,
        infra_container = ?args.pod.infra_container_id,
        "handling request"
    );

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|e| {
            CniError::io_error("failed to create tokio runtime").with_details(&e.to_string())
        })?;

    runtime.block_on(async {
        let fabric = NetlinkFabric::new().map_err(|e| {
            CniError::caused_by(
                CniErrorCode::LinkFailure,
                "failed to open netlink connection",
                e,
            )
        })?;
        let addresses = ExecCoordinator::new(&args);
        let firewall = Iptables::new("iptables");
        let plugin = Plugin {
            fabric: &fabric,
            addresses: &addresses,
            firewall: &firewall,
        };
        execute(&plugin, command, input, &args).await
    })
}

/// Validate the configuration, then dispatch the command
async fn execute(
    plugin: &Plugin<'_>,
    command: Command,
    input: &str,
    args: &CmdArgs,
) -> Result<Option<String>, CniError> {
    let network = Network::parse(input)?;

    match command {
        Command::Add => {
            let result = plugin.attach(args, &network).await?;
            serde_json::to_string(&result).map(Some).map_err(|e| {
                CniError::io_error("failed to serialize result").with_details(&e.to_string())
            })
        }
        // DEL and CHECK output nothing on success
        Command::Del => plugin.detach(args, &network).await.map(|()| None),
        Command::Check => plugin.check(args, &network).await.map(|()| None),
        Command::Version => version_result(input).map(Some),
    }
}

/// `cniVersion` of the request, even when the rest does not validate
fn request_version(input: &str) -> String {
    serde_json::from_str::<serde_json::Value>(input)
        .ok()
        .and_then(|v| v.get("cniVersion")?.as_str().map(str::to_string))
        .unwrap_or_else(|| CNI_VERSION.to_string())
}

/// Handle VERSION command - report supported CNI versions
fn version_result(input: &str) -> Result<String, CniError> {
    let result = VersionResult {
        cni_version: request_version(input),
        supported_versions: SUPPORTED_VERSIONS.iter().map(|s| s.to_string()).collect(),
    };

    serde_json::to_string(&result).map_err(|e| {
        CniError::io_error("failed to serialize version").with_details(&e.to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::testing::{cmd_args, Fixture};

    #[test]
    fn test_parse_command() {
        assert_eq!(Command::parse("ADD").unwrap(), Command::Add);
        assert_eq!(Command::parse("VERSION").unwrap(), Command::Version);

        let err = Command::parse("ADD;rm -rf /").unwrap_err();
        assert_eq!(err.code(), CniErrorCode::InvalidEnvironmentVariables);
        assert_eq!(err.message(), "unknown CNI_COMMAND: ADDrm-rf");
    }

    #[test]
    fn test_version_result() {
        let json = version_result(r#"{"cniVersion":"0.3.1"}"#).unwrap();
        let value: serde_json::Value = serde_json::from_str(&json).unwrap();
        assert_eq!(value["cniVersion"], "0.3.1");
        assert_eq!(value["supportedVersions"].as_array().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_malformed_subnet_rejected_before_any_call() {
        let fixture = Fixture::default();
        let input = r#"{
            "cniVersion": "0.3.1",
            "name": "vxnet0",
            "type": "vxnet-cni",
            "ipam": {"type": "host-local", "subnet": "10.244.0/24"}
        }"#;

        let err = execute(&fixture.plugin(), Command::Add, input, &cmd_args("default", "web-1"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), CniErrorCode::InvalidNetworkConfig);
        assert_eq!(*fixture.addresses.issued.lock().unwrap(), 0);
        assert_eq!(fixture.fabric.mutations(), 0);
    }

    #[tokio::test]
    async fn test_add_emits_result_json() {
        let fixture = Fixture::default();
        let input = r#"{
            "cniVersion": "0.3.1",
            "name": "vxnet0",
            "type": "vxnet-cni",
            "ipam": {"type": "host-local", "subnet": "10.244.0.0/24", "rangeStart": "", "rangeEnd": ""}
        }"#;

        let output = execute(&fixture.plugin(), Command::Add, input, &cmd_args("default", "web-1"))
            .await
            .unwrap()
            .unwrap();
        let value: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(value["cniVersion"], "0.3.1");
        assert_eq!(value["interfaces"][0]["name"], "eth0");
        assert!(value["ips"][0].get("gateway").is_none());

        let output = execute(&fixture.plugin(), Command::Del, input, &cmd_args("default", "web-1"))
            .await
            .unwrap();
        assert!(output.is_none());
    }
}
