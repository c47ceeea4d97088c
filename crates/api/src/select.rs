//! Peer-selection artifacts and the initiator seam.

use crate::error::ForwardError;
use crate::http::HttpRequest;
use crate::peer::CachePeer;
use crate::Timestamp;
use std::net::SocketAddr;
use std::sync::Arc;

/// Why a destination was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HierCode {
    /// No decision yet.
    None,
    /// The client session is pinned to this upstream.
    Pinned,
    /// A cache digest predicted a hit at a parent.
    CdParentHit,
    /// A cache digest predicted a hit at a sibling.
    CdSiblingHit,
    /// NetDB measured this parent closest to the origin.
    ClosestParent,
    /// NetDB measured us closer to the origin than any parent miss.
    ClosestDirect,
    /// A parent answered our probe with a hit.
    ParentHit,
    /// A sibling answered our probe with a hit.
    SiblingHit,
    /// The parent miss with the smallest peer-to-origin RTT.
    ClosestParentMiss,
    /// The parent miss with the smallest weighted proxy-to-parent RTT.
    FirstParentMiss,
    /// Plain direct fetch from the origin.
    HierDirect,
    /// Direct fetch forced to the client's original destination
    /// address (intercepted, unverified traffic).
    OriginalDst,
    /// Parent chosen by client-address hash.
    SourcehashParent,
    /// Parent chosen by user-name hash.
    UserhashParent,
    /// Parent chosen by the cache-array routing protocol.
    CarpParent,
    /// Parent chosen round-robin.
    RoundRobinParent,
    /// First alive parent in configuration order.
    FirstUpParent,
    /// The configured default parent.
    DefaultParent,
    /// Any alive parent, as a last resort.
    AnyOldParent,
}

impl HierCode {
    /// The classic log token for this code.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "NONE",
            Self::Pinned => "PINNED",
            Self::CdParentHit => "CD_PARENT_HIT",
            Self::CdSiblingHit => "CD_SIBLING_HIT",
            Self::ClosestParent => "CLOSEST_PARENT",
            Self::ClosestDirect => "CLOSEST_DIRECT",
            Self::ParentHit => "PARENT_HIT",
            Self::SiblingHit => "SIBLING_HIT",
            Self::ClosestParentMiss => "CLOSEST_PARENT_MISS",
            Self::FirstParentMiss => "FIRST_PARENT_MISS",
            Self::HierDirect => "HIER_DIRECT",
            Self::OriginalDst => "ORIGINAL_DST",
            Self::SourcehashParent => "SOURCEHASH_PARENT",
            Self::UserhashParent => "USERHASH_PARENT",
            Self::CarpParent => "CARP",
            Self::RoundRobinParent => "ROUNDROBIN_PARENT",
            Self::FirstUpParent => "FIRSTUP_PARENT",
            Self::DefaultParent => "DEFAULT_PARENT",
            Self::AnyOldParent => "ANY_OLD_PARENT",
        }
    }
}

impl std::fmt::Display for HierCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One resolved destination path handed to the forwarder.
#[derive(Debug, Clone)]
pub struct Destination {
    /// The remote address to connect to.
    pub addr: SocketAddr,
    /// The neighbor behind the address; `None` for the origin.
    pub peer: Option<Arc<CachePeer>>,
    /// Why this destination was chosen.
    pub code: HierCode,
}

/// Probe accounting for one selection run.
#[derive(Debug, Clone, Default)]
pub struct PingData {
    /// When the probe window opened.
    pub start: Option<Timestamp>,
    /// When the selection run finished.
    pub stop: Option<Timestamp>,
    /// Queries sent.
    pub n_sent: usize,
    /// Replies received.
    pub n_recv: usize,
    /// Replies expected from alive neighbors.
    pub n_replies_expected: usize,
    /// The probe window in milliseconds.
    pub timeout_ms: u32,
    /// Whether the window closed before all expected replies arrived.
    pub timedout: bool,
    /// Smallest weighted proxy-to-parent RTT observed (first miss).
    pub w_rtt: u32,
    /// Smallest peer-to-origin RTT observed (closest miss).
    pub p_rtt: u32,
}

/// The ping state of a store entry, gating neighbor probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PingStatus {
    /// No probe attempted yet.
    #[default]
    None,
    /// A probe window is open.
    Waiting,
    /// Probing is finished for this entry.
    Done,
}

/// The party that asked for destinations.
///
/// Selectors hold this as a `Weak` reference: an initiator that was
/// dropped, or that stops being [subscribed](Self::subscribed), cancels
/// the selection run at its next suspension point.
pub trait PeerSelectionInitiator: 'static + Send + Sync {
    /// One destination path became available.
    fn note_destination(&self, path: Destination);

    /// No more destinations will be delivered. Called exactly once,
    /// with the error to present when no path was found.
    fn note_destinations_end(&self, error: Option<ForwardError>);

    /// Whether the initiator still wants destinations.
    fn subscribed(&self) -> bool {
        true
    }
}

/// Trait-object [PeerSelectionInitiator].
pub type DynSelectionInitiator = Arc<dyn PeerSelectionInitiator>;

/// Cache-digest lookup seam.
///
/// Digests are maintained outside the core; the selector only asks
/// which neighbor, if any, predicts a hit for a request.
pub trait DigestLookup: 'static + Send + Sync + std::fmt::Debug {
    /// The neighbor whose digest predicts a hit, if any.
    fn lookup(&self, request: &HttpRequest) -> Option<Arc<CachePeer>>;
}

/// Trait-object [DigestLookup].
pub type DynDigestLookup = Arc<dyn DigestLookup>;
