//! Network namespace switching
//!
//! `setns(2)` changes the namespace of the calling thread only, so callers
//! must not yield to the async runtime while a guard is held.

use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::path::Path;

use nix::sched::{setns, CloneFlags};

use crate::LinkError;

const SELF_NETNS: &str = "/proc/self/ns/net";

/// Saves the current network namespace and restores it on drop
pub struct NetnsGuard {
    original_ns: File,
}

impl NetnsGuard {
    /// Enter the namespace at `netns_path`, remembering the current one
    pub fn enter(netns_path: &Path) -> Result<Self, LinkError> {
        let original_ns = open_netns(Path::new(SELF_NETNS))?;
        let target_ns = open_netns(netns_path)?;

        setns(target_ns.as_raw_fd(), CloneFlags::CLONE_NEWNET)
            .map_err(|e| LinkError::namespace(netns_path.display().to_string(), e))?;

        Ok(Self { original_ns })
    }

    /// Restore the original namespace, reporting failure
    pub fn restore(self) -> Result<(), LinkError> {
        setns(self.original_ns.as_raw_fd(), CloneFlags::CLONE_NEWNET)
            .map_err(|e| LinkError::namespace(SELF_NETNS, e))?;
        // Already restored; skip Drop
        std::mem::forget(self);
        Ok(())
    }
}

impl Drop for NetnsGuard {
    fn drop(&mut self) {
        let _ = setns(self.original_ns.as_raw_fd(), CloneFlags::CLONE_NEWNET);
    }
}

/// Run `f` with the calling thread switched into `netns_path`
pub fn with_netns<T, F>(netns_path: &Path, f: F) -> Result<T, LinkError>
where
    F: FnOnce() -> Result<T, LinkError>,
{
    let guard = NetnsGuard::enter(netns_path)?;
    let result = f();
    guard.restore()?;
    result
}

/// Open a namespace file, yielding a handle usable with `setns` or
/// `IFLA_NET_NS_FD`
pub fn open_netns(netns_path: &Path) -> Result<File, LinkError> {
    File::open(netns_path)
        .map_err(|e| LinkError::namespace(netns_path.display().to_string(), e))
}

/// Handle on the namespace this process currently runs in
pub fn current_netns() -> Result<File, LinkError> {
    open_netns(Path::new(SELF_NETNS))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_current_netns_readable() {
        assert!(current_netns().is_ok());
    }

    #[test]
    fn test_invalid_netns_path() {
        let err = open_netns(Path::new("/nonexistent/path/ns/net")).unwrap_err();
        assert!(matches!(err, LinkError::Namespace { .. }));
    }

    #[test]
    fn test_with_netns_missing_namespace_does_not_run_closure() {
        let mut ran = false;
        let result = with_netns(Path::new("/nonexistent/ns"), || {
            ran = true;
            Ok(())
        });
        assert!(result.is_err());
        assert!(!ran);
    }
}
