//! CNI error types
//!
//! Error codes and the error body printed on failure, as defined by the
//! CNI specification.

use std::fmt::Display;

use serde::Serialize;
use thiserror::Error;

/// Codes reported in the error body. 1-11 are the well-known codes from
/// https://github.com/containernetworking/cni/blob/spec-v1.0.0/SPEC.md#error,
/// 100 and up are plugin specific.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
#[allow(dead_code)] // not every well-known code has a failure path here
pub enum CniErrorCode {
    IncompatibleVersion = 1,
    UnsupportedField = 2,
    UnknownContainer = 3,
    InvalidEnvironmentVariables = 4,
    IoFailure = 5,
    DecodingFailure = 6,
    InvalidNetworkConfig = 7,
    TryAgainLater = 11,

    /// Host link lookup, proxy ARP or link state change
    LinkFailure = 100,
    /// The delegated address plugin failed or returned nothing usable
    IpamFailure = 102,
    /// A step inside the pod namespace, veth creation included
    NamespaceFailure = 103,
    RouteFailure = 104,
    FirewallFailure = 105,
}

/// CNI error with code, message, and optional details
#[derive(Debug, Error)]
#[error("{msg}")]
pub struct CniError {
    code: CniErrorCode,
    msg: String,
    details: Option<String>,
}

impl CniError {
    pub fn new(code: CniErrorCode, msg: &str) -> Self {
        Self {
            code,
            msg: msg.to_string(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: &str) -> Self {
        self.details = Some(details.to_string());
        self
    }

    /// Error for a failed step, carrying the underlying cause as details
    pub fn caused_by(code: CniErrorCode, msg: &str, cause: impl Display) -> Self {
        Self::new(code, msg).with_details(&cause.to_string())
    }

    pub fn code(&self) -> CniErrorCode {
        self.code
    }

    pub fn message(&self) -> &str {
        &self.msg
    }

    pub fn details(&self) -> Option<&str> {
        self.details.as_deref()
    }

    /// Error body printed to stdout
    pub fn to_body(&self, cni_version: &str) -> ErrorBody {
        ErrorBody {
            cni_version: cni_version.to_string(),
            code: self.code as u32,
            msg: self.msg.clone(),
            details: self.details.clone(),
        }
    }
}

// Convenience constructors for common errors

impl CniError {
    /// Create an IO error
    pub fn io_error(msg: &str) -> Self {
        Self::new(CniErrorCode::IoFailure, msg)
    }

    /// Create a decoding error
    pub fn decode_error(msg: &str) -> Self {
        Self::new(CniErrorCode::DecodingFailure, msg)
    }

    /// Create an invalid config error
    pub fn config_error(msg: &str) -> Self {
        Self::new(CniErrorCode::InvalidNetworkConfig, msg)
    }

    /// Create a missing environment variable error
    pub fn env_error(msg: &str) -> Self {
        Self::new(CniErrorCode::InvalidEnvironmentVariables, msg)
    }

    /// Create an IPAM error
    pub fn ipam_error(msg: &str) -> Self {
        Self::new(CniErrorCode::IpamFailure, msg)
    }
}

/// Failure output in the CNI error format
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub cni_version: String,
    pub code: u32,
    pub msg: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}
