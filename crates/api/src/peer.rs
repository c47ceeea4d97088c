//! Neighbor cache descriptors.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

/// The relationship with a configured neighbor.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    serde::Serialize,
    serde::Deserialize,
)]
#[serde(rename_all = "camelCase")]
pub enum PeerType {
    /// A parent serves our misses.
    Parent,
    /// A sibling only serves its own hits.
    Sibling,
}

/// Per-neighbor behavior switches.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PeerOptions {
    /// Never use this parent as a first-miss fallback; only as the
    /// closest parent by measured RTT.
    pub closest_only: bool,
    /// Outgoing connections to this peer must not spoof the client
    /// address.
    pub no_tproxy: bool,
    /// This parent is the fallback of last resort.
    pub default_parent: bool,
    /// Participate in plain round-robin parent selection.
    pub round_robin: bool,
    /// Participate in weighted round-robin parent selection.
    pub weighted_round_robin: bool,
    /// Participate in cache-array (CARP) parent selection.
    pub carp: bool,
    /// Participate in client-address-hash parent selection.
    pub sourcehash: bool,
    /// Participate in user-name-hash parent selection.
    pub userhash: bool,
    /// Never send probe queries to this peer.
    pub no_query: bool,
}

/// The operator-facing description of one neighbor.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerConfig {
    /// The neighbor's hostname.
    pub host: String,
    /// The neighbor's HTTP port.
    pub http_port: u16,
    /// The neighbor's probe (ICP/HTCP) port; zero disables probing.
    #[serde(default)]
    pub icp_port: u16,
    /// Parent or sibling.
    pub peer_type: PeerType,
    /// Load weight for weighted selection methods.
    #[serde(default = "default_weight")]
    pub weight: u32,
    /// Milliseconds subtracted from probe round-trips before weighting,
    /// to favor a nearby cluster over a distant one.
    #[serde(default)]
    pub basetime: u32,
    /// Behavior switches.
    #[serde(default)]
    pub options: PeerOptions,
    /// Credentials forwarded to this peer, if any.
    #[serde(default)]
    pub login: Option<String>,
    /// Whether the HTTP leg to this peer is encrypted.
    #[serde(default)]
    pub encrypt_transport: bool,
}

fn default_weight() -> u32 {
    1
}

/// Mutable runtime state of one neighbor.
#[derive(Debug, Clone)]
pub struct PeerStats {
    /// Whether the neighbor is considered reachable.
    pub alive: bool,
    /// Monotonic counter for the round-robin selection methods.
    pub rr_count: u64,
    /// The probe socket address most recently observed for this peer.
    pub in_addr: Option<SocketAddr>,
    /// Smoothed probe round-trip time in milliseconds, zero when
    /// unmeasured.
    pub probe_rtt_ms: u32,
}

impl Default for PeerStats {
    fn default() -> Self {
        Self {
            alive: true,
            rr_count: 0,
            in_addr: None,
            probe_rtt_ms: 0,
        }
    }
}

/// One configured neighbor: static configuration plus runtime state.
#[derive(Debug)]
pub struct CachePeer {
    /// The operator-facing configuration.
    pub config: PeerConfig,
    stats: Mutex<PeerStats>,
}

impl CachePeer {
    /// Wrap a configuration into a live peer.
    pub fn new(config: PeerConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            stats: Mutex::new(PeerStats::default()),
        })
    }

    /// The neighbor's hostname.
    pub fn host(&self) -> &str {
        &self.config.host
    }

    /// Snapshot the runtime state.
    pub fn stats(&self) -> PeerStats {
        self.stats.lock().unwrap().clone()
    }

    /// Mutate the runtime state under the lock.
    pub fn update_stats(&self, f: impl FnOnce(&mut PeerStats)) {
        f(&mut self.stats.lock().unwrap());
    }

    /// Whether the neighbor is considered reachable.
    pub fn alive(&self) -> bool {
        self.stats.lock().unwrap().alive
    }

    /// The probe socket address most recently observed for this peer.
    pub fn in_addr(&self) -> Option<SocketAddr> {
        self.stats.lock().unwrap().in_addr
    }
}
