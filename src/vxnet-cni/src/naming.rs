//! Host-side link naming
//!
//! Naming contract v1: `"veth"` followed by the first 11 hex characters of
//! the SHA-1 digest of `"<pod namespace>.<pod name>"`, 15 characters in
//! total so it fits IFNAMSIZ. When the orchestrator supplies neither pod
//! namespace nor pod name the container id is hashed instead.
//!
//! Links created under one contract version are only found again by the
//! same version, so changing any of this requires a new version.

use sha1::{Digest, Sha1};

use crate::args::PodArgs;

pub const NAMING_VERSION: u32 = 1;

const PREFIX: &str = "veth";
const DIGEST_CHARS: usize = 11;

/// Derive the host-side link name for a pod
pub fn host_link_name(pod: &PodArgs, container_id: &str) -> String {
    let key = match (pod.namespace.as_deref(), pod.name.as_deref()) {
        (None, None) => container_id.to_string(),
        (namespace, name) => format!("{}.{}", namespace.unwrap_or(""), name.unwrap_or("")),
    };
    link_name_for(&key)
}

fn link_name_for(key: &str) -> String {
    let digest = hex::encode(Sha1::digest(key.as_bytes()));
    format!("{}{}", PREFIX, &digest[..DIGEST_CHARS])
}
