//! Runtime configuration consumed by the hiero core.
//!
//! The structs here mirror the operator-facing directives of the
//! classic configuration surface; parsing the configuration file itself
//! is a collaborator concern. All sections deserialize leniently,
//! filling missing properties with the shipped defaults.

/// Network Measurement Database tuning.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct NetdbConfig {
    /// High water mark: exceeding this entry count triggers an LRU purge.
    ///
    /// Default: 1000.
    pub high: usize,

    /// Low water mark: an LRU purge releases entries down to this count.
    ///
    /// Default: 900.
    pub low: usize,

    /// Seconds between ICMP pings of the same network.
    ///
    /// Default: 300s.
    pub period_s: u32,

    /// Seconds between periodic state saves.
    ///
    /// Default: 3600s.
    pub save_interval_s: u32,

    /// Persistence file path. The special value `"none"` disables
    /// persistence entirely.
    ///
    /// Default: "netdb.state".
    pub filename: String,
}

impl Default for NetdbConfig {
    fn default() -> Self {
        Self {
            high: 1000,
            low: 900,
            period_s: 300,
            save_interval_s: 3600,
            filename: "netdb.state".into(),
        }
    }
}

impl NetdbConfig {
    /// Get the ping re-arm period as a [std::time::Duration].
    pub fn period(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.period_s as u64)
    }

    /// Get the save interval as a [std::time::Duration].
    pub fn save_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.save_interval_s as u64)
    }

    /// Whether persistence is enabled at all.
    pub fn persistence_enabled(&self) -> bool {
        self.filename != "none"
    }
}

/// Boolean feature toggles.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OnOffConfig {
    /// Prefer going direct over parent caches when both are permitted.
    ///
    /// Default: false.
    pub prefer_direct: bool,

    /// Allow direct fetches for non-hierarchical requests even when
    /// parents exist.
    ///
    /// Default: true.
    pub nonhierarchical_direct: bool,

    /// Feed probe-reply RTT measurements into NetDB.
    ///
    /// Default: false.
    pub query_icmp: bool,

    /// Always use the client's original destination address for
    /// intercepted traffic that goes direct.
    ///
    /// Default: false.
    pub client_dst_passthru: bool,

    /// Permit probing neighbors for entries stored under private keys.
    ///
    /// Default: false.
    pub neighbors_do_private_keys: bool,
}

impl Default for OnOffConfig {
    fn default() -> Self {
        Self {
            prefer_direct: false,
            nonhierarchical_direct: true,
            query_icmp: false,
            client_dst_passthru: false,
            neighbors_do_private_keys: false,
        }
    }
}

/// Response-adaptation limits.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AdaptationConfig {
    /// Largest declared virgin body size the adaptation path accepts,
    /// in bytes. Zero means unlimited.
    ///
    /// Default: 0 (unlimited).
    pub max_virgin_body_size: u64,
}

impl Default for AdaptationConfig {
    fn default() -> Self {
        Self {
            max_virgin_body_size: 0,
        }
    }
}

/// Neighbor probe (ICP/HTCP) timing.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProbeConfig {
    /// Fixed probe window in milliseconds. Zero lets the neighbor layer
    /// derive the window from measured neighbor round-trip times.
    ///
    /// Default: 0 (computed).
    pub query_timeout_ms: u32,

    /// Lower clamp for a computed probe window.
    ///
    /// Default: 5ms.
    pub min_timeout_ms: u32,

    /// Upper clamp for a computed probe window.
    ///
    /// Default: 2000ms.
    pub max_timeout_ms: u32,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            query_timeout_ms: 0,
            min_timeout_ms: 5,
            max_timeout_ms: 2000,
        }
    }
}

/// Top-level configuration for the hiero core.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CoreConfig {
    /// Network Measurement Database tuning.
    pub netdb: NetdbConfig,

    /// Origins measured at or below this RTT (ms) are fetched direct.
    /// Zero disables the RTT heuristic.
    ///
    /// Default: 400.
    pub min_direct_rtt: u32,

    /// Origins measured at or below this hop count are fetched direct.
    /// Zero disables the hop heuristic.
    ///
    /// Default: 4.
    pub min_direct_hops: u32,

    /// Cap on the number of destination paths handed to the forwarder
    /// per request.
    ///
    /// Default: 25.
    pub forward_max_tries: usize,

    /// Boolean feature toggles.
    pub onoff: OnOffConfig,

    /// Response-adaptation limits.
    pub adaptation: AdaptationConfig,

    /// Neighbor probe timing.
    pub probe: ProbeConfig,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            netdb: NetdbConfig::default(),
            min_direct_rtt: 400,
            min_direct_hops: 4,
            forward_max_tries: 25,
            onoff: OnOffConfig::default(),
            adaptation: AdaptationConfig::default(),
            probe: ProbeConfig::default(),
        }
    }
}
