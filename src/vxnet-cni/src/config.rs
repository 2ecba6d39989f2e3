//! CNI network configuration parsing
//!
//! Handles parsing of the network configuration JSON passed via stdin and
//! validates it before anything touches the allocator or the kernel.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use serde::{Deserialize, Serialize};

use crate::error::CniError;

/// MTU used when the configuration does not carry one
pub const DEFAULT_MTU: u32 = 1500;

/// Interface named in the forwarding and masquerade rules by default
pub const DEFAULT_EGRESS_INTERFACE: &str = "eth0";

/// Network configuration passed to the CNI plugin
///
/// See: https://github.com/containernetworking/cni/blob/spec-v1.0.0/SPEC.md#network-configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkConfig {
    /// CNI specification version
    pub cni_version: String,

    /// Network name (must be unique on the host)
    pub name: String,

    /// CNI plugin type (matches binary name)
    #[serde(rename = "type")]
    pub plugin_type: String,

    /// Previous result from chain (for CHECK/DEL)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev_result: Option<serde_json::Value>,

    /// MTU for both ends of the veth pair
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,

    /// Host interface pod traffic leaves through
    #[serde(skip_serializing_if = "Option::is_none")]
    pub egress_interface: Option<String>,

    /// IPAM configuration
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ipam: Option<IpamConfig>,
}

/// IPAM (IP Address Management) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpamConfig {
    /// IPAM plugin type (e.g., "host-local")
    #[serde(rename = "type")]
    pub plugin_type: String,

    /// Subnet in CIDR notation
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subnet: Option<String>,

    /// Start of IP range
    #[serde(skip_serializing_if = "Option::is_none")]
    pub range_start: Option<String>,

    /// End of IP range
    #[serde(skip_serializing_if = "Option::is_none")]
    pub range_end: Option<String>,
}

/// IP address range handed to the IPAM plugin
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpRange {
    /// Subnet in CIDR notation
    pub subnet: String,

    /// Start of IP range
    #[serde(skip_serializing_if = "Option::is_none")]
    pub range_start: Option<String>,

    /// End of IP range
    #[serde(skip_serializing_if = "Option::is_none")]
    pub range_end: Option<String>,
}

/// Configuration the IPAM plugin is invoked with
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DelegateConfig {
    pub name: String,
    pub cni_version: String,
    pub ipam: DelegateIpam,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegateIpam {
    #[serde(rename = "type")]
    pub plugin_type: String,
    pub ranges: Vec<Vec<IpRange>>,
}

/// A validated network configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Network {
    pub cni_version: String,
    pub name: String,
    pub ipam_type: String,
    pub subnet: Ipv4Net,
    pub range_start: Option<Ipv4Addr>,
    pub range_end: Option<Ipv4Addr>,
    pub mtu: u32,
    pub egress_interface: String,
}

impl Network {
    /// Parse and validate the configuration read from stdin
    pub fn parse(input: &str) -> Result<Self, CniError> {
        let config: NetworkConfig = serde_json::from_str(input).map_err(|e| {
            CniError::decode_error("failed to parse network config").with_details(&e.to_string())
        })?;
        Self::from_config(config)
    }

    pub fn from_config(config: NetworkConfig) -> Result<Self, CniError> {
        let ipam = config
            .ipam
            .ok_or_else(|| CniError::config_error("ipam section is required"))?;

        let subnet = non_empty(ipam.subnet.as_deref())
            .ok_or_else(|| CniError::config_error("ipam subnet is required"))?;
        let subnet: Ipv4Net = subnet.parse().map_err(|e: ipnet::AddrParseError| {
            CniError::config_error(&format!("invalid ipam subnet {:?}", subnet))
                .with_details(&e.to_string())
        })?;

        let range_start = parse_bound("rangeStart", ipam.range_start.as_deref())?;
        let range_end = parse_bound("rangeEnd", ipam.range_end.as_deref())?;

        let mtu = config.mtu.unwrap_or(DEFAULT_MTU);
        if mtu == 0 {
            return Err(CniError::config_error("mtu must be greater than zero"));
        }

        let egress_interface = non_empty(config.egress_interface.as_deref())
            .unwrap_or(DEFAULT_EGRESS_INTERFACE)
            .to_string();

        Ok(Self {
            cni_version: config.cni_version,
            name: config.name,
            ipam_type: ipam.plugin_type,
            subnet,
            range_start,
            range_end,
            mtu,
            egress_interface,
        })
    }

    /// Configuration for the IPAM plugin, a single range over the subnet
    pub fn delegate_config(&self) -> DelegateConfig {
        DelegateConfig {
            name: self.name.clone(),
            cni_version: self.cni_version.clone(),
            ipam: DelegateIpam {
                plugin_type: self.ipam_type.clone(),
                ranges: vec![vec![IpRange {
                    subnet: self.subnet.to_string(),
                    range_start: self.range_start.map(|ip| ip.to_string()),
                    range_end: self.range_end.map(|ip| ip.to_string()),
                }]],
            },
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

fn parse_bound(field: &str, value: Option<&str>) -> Result<Option<Ipv4Addr>, CniError> {
    non_empty(value)
        .map(|v| {
            v.parse().map_err(|e: std::net::AddrParseError| {
                CniError::config_error(&format!("invalid ipam {} {:?}", field, v))
                    .with_details(&e.to_string())
            })
        })
        .transpose()
}
