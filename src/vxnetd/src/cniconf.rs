//! Local CNI network configuration
//!
//! Written once at startup so the plugin picks up this node's pod range,
//! the overlay MTU and the egress interface.

use std::path::Path;

use ipnet::Ipv4Net;
use serde::Serialize;
use tokio::fs;
use tracing::info;

use crate::config::CniConfig;
use crate::error::DaemonError;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetConf {
    pub cni_version: String,
    pub name: String,
    #[serde(rename = "type")]
    pub plugin_type: String,
    pub mtu: u32,
    pub egress_interface: String,
    pub ipam: Ipam,
}

#[derive(Debug, Serialize)]
pub struct Ipam {
    #[serde(rename = "type")]
    pub plugin_type: String,
    pub subnet: String,
}

pub fn render(cni: &CniConfig, pod_cidr: Ipv4Net, mtu: u32, egress: &str) -> NetConf {
    NetConf {
        cni_version: cni.cni_version.clone(),
        name: cni.network_name.clone(),
        plugin_type: cni.plugin_type.clone(),
        mtu,
        egress_interface: egress.to_string(),
        ipam: Ipam {
            plugin_type: cni.ipam_type.clone(),
            subnet: pod_cidr.trunc().to_string(),
        },
    }
}

/// Write `conf` to `path` through a temporary file and a rename, so the
/// runtime never reads a partial document
pub async fn write(path: &Path, conf: &NetConf) -> Result<(), DaemonError> {
    let json = serde_json::to_vec_pretty(conf)
        .map_err(|e| DaemonError::Config(format!("failed to serialize CNI config: {}", e)))?;

    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).await.map_err(DaemonError::io(dir))?;
    }

    let tmp = path.with_extension("tmp");
    fs::write(&tmp, &json).await.map_err(DaemonError::io(&tmp))?;
    fs::rename(&tmp, path).await.map_err(DaemonError::io(path))?;

    info!(path = %path.display(), subnet = %conf.ipam.subnet, "wrote CNI config");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render() {
        let conf = render(&CniConfig::default(), "10.244.3.0/24".parse().unwrap(), 1450, "ens3");
        let value = serde_json::to_value(&conf).unwrap();
        assert_eq!(
            value,
            serde_json::json!({
                "cniVersion": "0.3.1",
                "name": "vxnet0",
                "type": "vxnet-cni",
                "mtu": 1450,
                "egressInterface": "ens3",
                "ipam": {"type": "host-local", "subnet": "10.244.3.0/24"}
            })
        );
    }

    #[tokio::test]
    async fn test_write_replaces_existing() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("net.d").join("00-vxnet.conf");

        let first = render(&CniConfig::default(), "10.244.3.0/24".parse().unwrap(), 1450, "ens3");
        write(&path, &first).await.unwrap();
        let second = render(&CniConfig::default(), "10.244.4.0/24".parse().unwrap(), 1450, "ens3");
        write(&path, &second).await.unwrap();

        let written: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(written["ipam"]["subnet"], "10.244.4.0/24");
        assert!(!path.with_extension("tmp").exists());
    }
}
