//! Kernel state reconciliation
//!
//! The kernel is the only source of truth: nothing is persisted locally.
//! Owners describe the objects they are responsible for as
//! [`KernelObject`]s and converge the kernel towards a desired set,
//! removing whatever a previous (possibly interrupted) run left behind.

use std::fmt;

use tracing::debug;

use crate::{LinkError, LinkFabric, NeighbourEntry, Netns, RouteEntry};

/// A kernel object owned by vxnet
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum KernelObject {
    /// Remove-only: [`KernelObject::apply`] rejects it, owners create
    /// links themselves and use this variant to clean them up
    Link { ns: Netns, name: String },
    Neighbour(NeighbourEntry),
    Route { ns: Netns, route: RouteEntry },
}

impl KernelObject {
    pub fn host_link(name: impl Into<String>) -> Self {
        Self::Link {
            ns: Netns::Host,
            name: name.into(),
        }
    }

    pub fn host_route(route: RouteEntry) -> Self {
        Self::Route {
            ns: Netns::Host,
            route,
        }
    }

    /// Create or overwrite the object in place
    ///
    /// Links carry too much configuration to be expressed here and are
    /// created by their owners; only their removal is reconciled.
    pub async fn apply(&self, fabric: &dyn LinkFabric) -> Result<(), LinkError> {
        match self {
            Self::Link { name, .. } => Err(LinkError::Unsupported(format!(
                "link {} must be created by its owner",
                name
            ))),
            Self::Neighbour(entry) => fabric.set_neighbour(entry).await,
            Self::Route { ns, route } => fabric.replace_route(ns, route).await,
        }
    }

    /// Remove the object. Returns `false` if it was already gone.
    pub async fn remove(&self, fabric: &dyn LinkFabric) -> Result<bool, LinkError> {
        let result = match self {
            Self::Link { ns, name } => fabric.delete_link(ns, name).await,
            Self::Neighbour(entry) => fabric.delete_neighbour(entry).await,
            Self::Route { ns, route } => fabric.delete_route(ns, route).await,
        };
        absent_ok(result)
    }
}

impl fmt::Display for KernelObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Link { ns, name } => write!(f, "link {} ({})", name, ns),
            Self::Neighbour(entry) => write!(f, "{}", entry),
            Self::Route { ns, route } => write!(f, "route {} ({})", route, ns),
        }
    }
}

/// Map "not found" to `Ok(false)`, success to `Ok(true)`
pub fn absent_ok(result: Result<(), LinkError>) -> Result<bool, LinkError> {
    match result {
        Ok(()) => Ok(true),
        Err(e) if e.is_not_found() => Ok(false),
        Err(e) => Err(e),
    }
}

/// What a [`converge`] call changed
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Convergence {
    pub removed: usize,
    pub applied: usize,
}

/// Move the kernel from `previous` to `desired`
///
/// Objects in `previous` that are not part of `desired` are removed first
/// (absence tolerated), then every desired object is applied. Applying is
/// an overwrite, so running this again with the same input is harmless.
pub async fn converge(
    fabric: &dyn LinkFabric,
    previous: &[KernelObject],
    desired: &[KernelObject],
) -> Result<Convergence, LinkError> {
    let mut outcome = Convergence::default();

    for stale in previous.iter().filter(|obj| !desired.contains(obj)) {
        if stale.remove(fabric).await? {
            debug!(object = %stale, "removed stale object");
            outcome.removed += 1;
        }
    }

    for obj in desired {
        obj.apply(fabric).await?;
        outcome.applied += 1;
    }
    Ok(outcome)
}

/// Remove every object, tolerating those already gone
pub async fn remove_all(
    fabric: &dyn LinkFabric,
    objects: &[KernelObject],
) -> Result<usize, LinkError> {
    let mut removed = 0;
    for obj in objects {
        if obj.remove(fabric).await? {
            removed += 1;
        }
    }
    Ok(removed)
}
