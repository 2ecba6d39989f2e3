//! Cluster node metadata
//!
//! Every node advertises its tunnel endpoint through two annotations on its
//! own Node object and reads everyone else's.

use std::net::Ipv4Addr;

use ipnet::Ipv4Net;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, ResourceExt};
use serde_json::{Map, Value};
use tracing::{debug, info};
use vxnet_link::MacAddr;

use crate::bootstrap::Overlay;
use crate::config::NodeConfig;
use crate::error::DaemonError;

/// Hardware address of the node's overlay device
pub const VTEP_MAC_ANNOTATION: &str = "overlay.vtep.mac";

/// Outer source address of the node's overlay device
pub const HOST_IP_ANNOTATION: &str = "overlay.host.ip";

/// The parts of a Node the overlay cares about
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeSnapshot {
    pub name: String,
    pub pod_cidr: Option<String>,
    pub vtep_mac: Option<String>,
    pub host_ip: Option<String>,
}

impl NodeSnapshot {
    pub fn from_node(node: &Node) -> Self {
        let annotation = |key: &str| node.annotations().get(key).cloned();
        Self {
            name: node.name_any(),
            pod_cidr: node.spec.as_ref().and_then(|s| s.pod_cidr.clone()),
            vtep_mac: annotation(VTEP_MAC_ANNOTATION),
            host_ip: annotation(HOST_IP_ANNOTATION),
        }
    }

    /// The node's endpoint, if its metadata is complete and well-formed
    pub fn vtep(&self) -> Result<RemoteVtep, DaemonError> {
        let pod_cidr = parse_pod_cidr(&self.name, self.pod_cidr.as_deref())?;

        let mac = self
            .vtep_mac
            .as_deref()
            .ok_or_else(|| DaemonError::missing(&self.name, VTEP_MAC_ANNOTATION))?;
        let mac: MacAddr = mac
            .parse()
            .map_err(|e| DaemonError::invalid(&self.name, VTEP_MAC_ANNOTATION, mac, e))?;

        let host_ip = self
            .host_ip
            .as_deref()
            .ok_or_else(|| DaemonError::missing(&self.name, HOST_IP_ANNOTATION))?;
        let host_ip: Ipv4Addr = host_ip
            .parse()
            .map_err(|e| DaemonError::invalid(&self.name, HOST_IP_ANNOTATION, host_ip, e))?;

        Ok(RemoteVtep {
            node: self.name.clone(),
            pod_cidr,
            mac,
            host_ip,
        })
    }
}

/// Another node's tunnel endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteVtep {
    pub node: String,
    pub pod_cidr: Ipv4Net,
    pub mac: MacAddr,
    pub host_ip: Ipv4Addr,
}

fn parse_pod_cidr(node: &str, value: Option<&str>) -> Result<Ipv4Net, DaemonError> {
    let value = value
        .filter(|v| !v.is_empty())
        .ok_or_else(|| DaemonError::missing(node, "pod CIDR"))?;
    value
        .parse::<Ipv4Net>()
        .map(|net| net.trunc())
        .map_err(|e| DaemonError::invalid(node, "pod CIDR", value, e))
}

/// The pod range assigned to `node`
pub fn pod_cidr(node: &Node) -> Result<Ipv4Net, DaemonError> {
    let name = node.name_any();
    parse_pod_cidr(&name, node.spec.as_ref().and_then(|s| s.pod_cidr.as_deref()))
}

/// Name of the node this daemon runs on
///
/// Taken from configuration when set, otherwise from the daemon's own pod.
pub async fn resolve_node_name(client: &Client, config: &NodeConfig) -> Result<String, DaemonError> {
    if let Some(name) = &config.name {
        return Ok(name.clone());
    }

    let (Some(pod_name), Some(namespace)) = (&config.pod_name, &config.pod_namespace) else {
        return Err(DaemonError::UnknownNodeName);
    };
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    let pod = pods.get(pod_name).await?;
    let name = pod
        .spec
        .and_then(|s| s.node_name)
        .ok_or(DaemonError::UnknownNodeName)?;
    debug!(pod = %pod_name, namespace = %namespace, node = %name, "resolved node name from pod");
    Ok(name)
}

/// Annotate the local node with its overlay endpoint
pub async fn publish(nodes: &Api<Node>, node: &Node, overlay: &Overlay) -> Result<(), DaemonError> {
    let patch = annotation_patch(node, overlay)?;
    if patch.as_object().map_or(true, Map::is_empty) {
        debug!(node = %node.name_any(), "overlay metadata already published");
        return Ok(());
    }

    nodes
        .patch(&node.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
        .await?;
    info!(
        node = %node.name_any(),
        mac = %overlay.mac,
        host_ip = %overlay.local,
        "published overlay metadata"
    );
    Ok(())
}

/// Merge patch taking `node` to a copy carrying the overlay annotations
pub fn annotation_patch(node: &Node, overlay: &Overlay) -> Result<Value, DaemonError> {
    let to_json = |n: &Node| {
        serde_json::to_value(n)
            .map_err(|e| DaemonError::Config(format!("failed to encode node: {}", e)))
    };

    let mut modified = node.clone();
    let annotations = modified.annotations_mut();
    annotations.insert(VTEP_MAC_ANNOTATION.to_string(), overlay.mac.to_string());
    annotations.insert(HOST_IP_ANNOTATION.to_string(), overlay.local.to_string());

    Ok(merge_patch(&to_json(node)?, &to_json(&modified)?))
}

/// Two-way JSON merge patch (RFC 7386) turning `original` into `modified`
pub fn merge_patch(original: &Value, modified: &Value) -> Value {
    match (original, modified) {
        (Value::Object(from), Value::Object(to)) => {
            let mut patch = Map::new();
            for (key, new) in to {
                match from.get(key) {
                    Some(old) if old == new => {}
                    Some(old @ Value::Object(_)) if new.is_object() => {
                        patch.insert(key.clone(), merge_patch(old, new));
                    }
                    _ => {
                        patch.insert(key.clone(), new.clone());
                    }
                }
            }
            for key in from.keys().filter(|k| !to.contains_key(*k)) {
                patch.insert(key.clone(), Value::Null);
            }
            Value::Object(patch)
        }
        _ => modified.clone(),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::BTreeMap;

    use k8s_openapi::api::core::v1::NodeSpec;
    use kube::api::ObjectMeta;

    use super::*;

    pub fn node(name: &str, pod_cidr: Option<&str>, mac: Option<&str>, ip: Option<&str>) -> Node {
        let mut annotations = BTreeMap::new();
        if let Some(mac) = mac {
            annotations.insert(VTEP_MAC_ANNOTATION.to_string(), mac.to_string());
        }
        if let Some(ip) = ip {
            annotations.insert(HOST_IP_ANNOTATION.to_string(), ip.to_string());
        }
        Node {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                annotations: Some(annotations),
                ..ObjectMeta::default()
            },
            spec: Some(NodeSpec {
                pod_cidr: pod_cidr.map(str::to_string),
                ..NodeSpec::default()
            }),
            status: None,
        }
    }
}
