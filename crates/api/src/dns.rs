//! DNS resolution seam.

use crate::{BoxFut, HieroResult};
use std::net::IpAddr;
use std::sync::Arc;

/// Non-blocking hostname resolution.
///
/// The resolver is a collaborator; the core treats an error or an empty
/// answer as "host unknown" and makes no state changes of its own.
pub trait Resolver: 'static + Send + Sync + std::fmt::Debug {
    /// Resolve a hostname to its addresses, in preference order.
    fn lookup(&self, host: &str) -> BoxFut<'_, HieroResult<Vec<IpAddr>>>;

    /// Return a cached address for the host without performing a
    /// lookup. Implementations without a cache return `None`.
    fn cached(&self, _host: &str) -> Option<IpAddr> {
        None
    }
}

/// Trait-object [Resolver].
pub type DynResolver = Arc<dyn Resolver>;
