//! CNI result encoding
//!
//! The same types decode the result returned by the IPAM plugin, which
//! attach then completes with interfaces and re-emits.

use serde::{Deserialize, Serialize};

/// Success body of ADD, see
/// https://github.com/containernetworking/cni/blob/spec-v1.0.0/SPEC.md#success
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CniResult {
    pub cni_version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interfaces: Option<Vec<Interface>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ips: Option<Vec<IpConfig>>,
    /// Passed through from IPAM untouched
    #[serde(skip_serializing_if = "Option::is_none")]
    pub routes: Option<Vec<RouteConfig>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dns: Option<DnsResult>,
}

impl CniResult {
    pub fn new(cni_version: String) -> Self {
        Self {
            cni_version,
            interfaces: None,
            ips: None,
            routes: None,
            dns: None,
        }
    }

    /// Append an interface, returning the index addresses refer to it by
    pub fn push_interface(&mut self, name: String, mac: String, sandbox: Option<String>) -> usize {
        let interfaces = self.interfaces.get_or_insert_with(Vec::new);
        interfaces.push(Interface { name, mac, sandbox });
        interfaces.len() - 1
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Interface {
    pub name: String,
    #[serde(default)]
    pub mac: String,
    /// Namespace path, set for interfaces inside the pod
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IpConfig {
    /// "4" or "6"; only sent by pre-1.0.0 plugins
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// CIDR notation
    pub address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gateway: Option<String>,
    /// Index into `interfaces`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    pub dst: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub gw: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DnsResult {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nameservers: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<Vec<String>>,
}

/// Body of VERSION
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VersionResult {
    pub cni_version: String,
    pub supported_versions: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_interface_returns_index() {
        let mut result = CniResult::new("0.3.1".to_string());
        assert_eq!(result.push_interface("eth0".into(), String::new(), None), 0);
        assert_eq!(result.push_interface("veth0".into(), String::new(), None), 1);
    }

    #[test]
    fn test_decode_ipam_result() {
        let json = r#"{
            "cniVersion": "0.3.1",
            "ips": [{"version": "4", "address": "10.244.0.2/24", "gateway": "10.244.0.1"}],
            "dns": {}
        }"#;

        let result: CniResult = serde_json::from_str(json).unwrap();
        let ip = &result.ips.unwrap()[0];
        assert_eq!(ip.version.as_deref(), Some("4"));
        assert_eq!(ip.gateway.as_deref(), Some("10.244.0.1"));
        assert!(result.interfaces.is_none());
    }

    #[test]
    fn test_result_serialization_omits_empty_fields() {
        let mut result = CniResult::new("0.3.1".to_string());
        result.ips = Some(vec![IpConfig {
            version: None,
            address: "10.244.0.2/32".to_string(),
            gateway: None,
            interface: Some(0),
        }]);

        let json = serde_json::to_string(&result).unwrap();
        assert_eq!(
            json,
            r#"{"cniVersion":"0.3.1","ips":[{"address":"10.244.0.2/32","interface":0}]}"#
        );
    }

    #[test]
    fn test_version_result() {
        let result = VersionResult {
            cni_version: "1.0.0".to_string(),
            supported_versions: vec!["0.3.1".to_string(), "1.0.0".to_string()],
        };

        let json = serde_json::to_string(&result).unwrap();
        assert!(json.contains("\"cniVersion\":\"1.0.0\""));
        assert!(json.contains("\"supportedVersions\""));
    }
}
