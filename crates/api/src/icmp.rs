//! ICMP measurement daemon seam.
//!
//! The daemon that emits echo requests is a collaborator; the core only
//! schedules domain pings through it and later receives the results via
//! the NetDB ping-reply entry point.

use std::net::IpAddr;
use std::sync::Arc;

/// Sink for outgoing domain-ping requests.
pub trait Pinger: 'static + Send + Sync + std::fmt::Debug {
    /// Ask the measurement daemon to ping `addr`, attributing the
    /// result to `host`. Fire and forget.
    fn domain_ping(&self, addr: IpAddr, host: &str);
}

/// Trait-object [Pinger].
pub type DynPinger = Arc<dyn Pinger>;
