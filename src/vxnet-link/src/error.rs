//! Link fabric errors
//!
//! Kernel errors are carried unmodified so callers can match on the
//! errno to implement idempotent sequences.

use thiserror::Error;

/// Error returned by every [`crate::LinkFabric`] operation
#[derive(Debug, Error)]
pub enum LinkError {
    /// The kernel rejected a netlink request
    #[error("{op}: {source}")]
    Netlink {
        op: String,
        #[source]
        source: rtnetlink::Error,
    },

    /// The addressed object does not exist
    #[error("{what} not found")]
    NotFound { what: String },

    /// Entering or opening a network namespace failed
    #[error("network namespace {path}: {details}")]
    Namespace { path: String, details: String },

    /// Filesystem interaction (procfs, namespace files) failed
    #[error("{op}: {source}")]
    Io {
        op: String,
        #[source]
        source: std::io::Error,
    },

    /// The operation is not meaningful for the given object
    #[error("unsupported: {0}")]
    Unsupported(String),
}

impl LinkError {
    pub fn netlink(op: impl Into<String>, source: rtnetlink::Error) -> Self {
        Self::Netlink {
            op: op.into(),
            source,
        }
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    pub fn io(op: impl Into<String>, source: std::io::Error) -> Self {
        Self::Io {
            op: op.into(),
            source,
        }
    }

    pub fn namespace(path: impl Into<String>, details: impl ToString) -> Self {
        Self::Namespace {
            path: path.into(),
            details: details.to_string(),
        }
    }

    /// Negative errno reported by the kernel, if this is a kernel error
    pub fn raw_code(&self) -> Option<i32> {
        match self {
            Self::Netlink {
                source: rtnetlink::Error::NetlinkError(msg),
                ..
            } => Some(msg.raw_code()),
            Self::Io { source, .. } => source.raw_os_error().map(|c| -c),
            _ => None,
        }
    }

    /// True when the object addressed by the request does not exist
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound { .. } => true,
            Self::Io { source, .. } => source.kind() == std::io::ErrorKind::NotFound,
            _ => matches!(
                self.raw_code(),
                Some(c) if c == -libc::ENODEV || c == -libc::ENOENT || c == -libc::ESRCH
            ),
        }
    }

    /// True when the kernel refused to create an object that already exists
    pub fn already_exists(&self) -> bool {
        self.raw_code() == Some(-libc::EEXIST)
    }
}
