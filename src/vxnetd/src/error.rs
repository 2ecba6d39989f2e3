//! Daemon errors

use std::path::PathBuf;

use thiserror::Error;
use vxnet_link::LinkError;

#[derive(Debug, Error)]
pub enum DaemonError {
    /// A node lacks metadata the overlay needs
    #[error("node {node}: missing {field}")]
    MissingMetadata { node: String, field: &'static str },

    /// A node carries metadata that does not parse
    #[error("node {node}: invalid {field} {value:?}: {reason}")]
    InvalidMetadata {
        node: String,
        field: &'static str,
        value: String,
        reason: String,
    },

    /// Neither a node name nor the daemon's own pod identity was configured
    #[error("cannot determine node name: set NODE_NAME, or POD_NAME and POD_NAMESPACE")]
    UnknownNodeName,

    #[error("no IPv4 default route")]
    NoDefaultRoute,

    #[error("egress interface {0} has no IPv4 address")]
    NoEgressAddress(String),

    /// The overlay device name is taken by a device of another kind
    #[error("{name} exists but is not a vxlan device ({kind})")]
    OverlayConflict { name: String, kind: String },

    #[error("{op}: {source}")]
    Link {
        op: String,
        #[source]
        source: LinkError,
    },

    #[error("kubeconfig {path}: {details}")]
    Kubeconfig { path: PathBuf, details: String },

    #[error(transparent)]
    Kube(#[from] kube::Error),

    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(String),
}

impl DaemonError {
    pub fn link(op: impl Into<String>) -> impl FnOnce(LinkError) -> Self {
        let op = op.into();
        move |source| Self::Link { op, source }
    }

    pub fn io(path: impl Into<PathBuf>) -> impl FnOnce(std::io::Error) -> Self {
        let path = path.into();
        move |source| Self::Io { path, source }
    }

    pub fn missing(node: &str, field: &'static str) -> Self {
        Self::MissingMetadata {
            node: node.to_string(),
            field,
        }
    }

    pub fn invalid(node: &str, field: &'static str, value: &str, reason: impl ToString) -> Self {
        Self::InvalidMetadata {
            node: node.to_string(),
            field,
            value: value.to_string(),
            reason: reason.to_string(),
        }
    }
}
