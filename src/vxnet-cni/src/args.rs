//! CNI request parameters
//!
//! Everything but the network configuration arrives through `CNI_*`
//! environment variables.

use std::env;
use std::path::PathBuf;

use crate::error::CniError;

/// Orchestrator arguments recognised in `CNI_ARGS`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PodArgs {
    pub namespace: Option<String>,
    pub name: Option<String>,
    pub infra_container_id: Option<String>,
}

impl PodArgs {
    /// Parse `K1=V1;K2=V2`. Keys are matched case-insensitively and
    /// unknown keys are ignored.
    pub fn parse(raw: &str) -> Result<Self, CniError> {
        let mut args = Self::default();
        for pair in raw.split(';').filter(|p| !p.is_empty()) {
            let (key, value) = pair.split_once('=').ok_or_else(|| {
                CniError::env_error("invalid CNI_ARGS").with_details(&format!(
                    "expected KEY=VALUE, got {:?}",
                    pair
                ))
            })?;
            let value = Some(value.to_string()).filter(|v| !v.is_empty());
            match key.to_ascii_uppercase().as_str() {
                "K8S_POD_NAMESPACE" => args.namespace = value,
                "K8S_POD_NAME" => args.name = value,
                "K8S_POD_INFRA_CONTAINER_ID" => args.infra_container_id = value,
                _ => {}
            }
        }
        Ok(args)
    }
}

/// Parameters of one plugin invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CmdArgs {
    pub container_id: String,
    /// Pod network namespace path. DEL may be invoked without one.
    pub netns: Option<PathBuf>,
    pub ifname: String,
    pub raw_args: String,
    pub pod: PodArgs,
    /// Directories searched for the IPAM plugin
    pub plugin_path: Vec<PathBuf>,
}

impl CmdArgs {
    pub fn from_env(require_netns: bool) -> Result<Self, CniError> {
        Self::from_lookup(|key| env::var(key).ok(), require_netns)
    }

    pub fn from_lookup<F>(lookup: F, require_netns: bool) -> Result<Self, CniError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| {
            lookup(key)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| CniError::env_error(&format!("{} not set", key)))
        };

        let container_id = required("CNI_CONTAINERID")?;
        let ifname = required("CNI_IFNAME")?;
        let netns = match lookup("CNI_NETNS").filter(|v| !v.is_empty()) {
            Some(path) => Some(PathBuf::from(path)),
            None if require_netns => return Err(CniError::env_error("CNI_NETNS not set")),
            None => None,
        };

        let raw_args = lookup("CNI_ARGS").unwrap_or_default();
        let pod = PodArgs::parse(&raw_args)?;

        let plugin_path = lookup("CNI_PATH")
            .map(|p| env::split_paths(&p).collect())
            .unwrap_or_default();

        Ok(Self {
            container_id,
            netns,
            ifname,
            raw_args,
            pod,
            plugin_path,
        })
    }
}
