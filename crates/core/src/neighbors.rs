//! The configured-neighbor registry and parent-selection methods.

use hiero_api::http::HttpRequest;
use hiero_api::peer::{CachePeer, PeerConfig, PeerType};
use hiero_api::select::HierCode;
use std::net::SocketAddr;
use std::sync::Arc;

/// All neighbors configured for this proxy instance.
#[derive(Debug)]
pub struct Neighbors {
    peers: Vec<Arc<CachePeer>>,
}

impl Neighbors {
    /// Wrap the configured peer list into a live registry.
    pub fn new(configs: Vec<PeerConfig>) -> Arc<Self> {
        Arc::new(Self {
            peers: configs.into_iter().map(CachePeer::new).collect(),
        })
    }

    /// All configured peers in configuration order.
    pub fn peers(&self) -> &[Arc<CachePeer>] {
        &self.peers
    }

    /// Our relationship with a peer for the given request.
    pub fn neighbor_type(&self, peer: &CachePeer) -> PeerType {
        peer.config.peer_type
    }

    /// Whether this peer may serve HTTP for this request right now.
    pub fn peer_http_okay(
        &self,
        peer: &CachePeer,
        _request: &HttpRequest,
    ) -> bool {
        peer.alive()
    }

    /// The peer whose probe address matches, if any.
    pub fn which_peer(&self, addr: SocketAddr) -> Option<Arc<CachePeer>> {
        self.peers
            .iter()
            .find(|p| p.in_addr() == Some(addr))
            .cloned()
    }

    /// The first usable parent configured at `hostname`.
    //
    // Both sides should be lowercase hostnames, but nothing enforces
    // that, so compare case-insensitively.
    pub fn find_usable_parent_at(
        &self,
        hostname: &str,
        request: &HttpRequest,
    ) -> Option<Arc<CachePeer>> {
        self.peers
            .iter()
            .find(|p| {
                p.host().eq_ignore_ascii_case(hostname)
                    && p.config.peer_type == PeerType::Parent
                    && self.peer_http_okay(p, request)
            })
            .cloned()
    }

    /// The neighbors a probe broadcast would query for this request.
    pub fn probeable(&self, request: &HttpRequest) -> Vec<Arc<CachePeer>> {
        self.peers
            .iter()
            .filter(|p| {
                p.config.icp_port != 0
                    && !p.config.options.no_query
                    && self.peer_http_okay(p, request)
            })
            .cloned()
            .collect()
    }

    /// All alive parents usable for this request, in configuration
    /// order.
    pub fn alive_parents(
        &self,
        request: &HttpRequest,
    ) -> Vec<Arc<CachePeer>> {
        self.peers
            .iter()
            .filter(|p| {
                p.config.peer_type == PeerType::Parent
                    && self.peer_http_okay(p, request)
            })
            .cloned()
            .collect()
    }

    /// The configured fallback parent, if any is usable.
    pub fn default_parent(
        &self,
        request: &HttpRequest,
    ) -> Option<Arc<CachePeer>> {
        self.peers
            .iter()
            .find(|p| {
                p.config.options.default_parent
                    && p.config.peer_type == PeerType::Parent
                    && self.peer_http_okay(p, request)
            })
            .cloned()
    }

    fn hash_parents(
        &self,
        request: &HttpRequest,
        participates: impl Fn(&CachePeer) -> bool,
    ) -> Vec<Arc<CachePeer>> {
        self.peers
            .iter()
            .filter(|p| {
                p.config.peer_type == PeerType::Parent
                    && participates(p)
                    && self.peer_http_okay(p, request)
            })
            .cloned()
            .collect()
    }
}

/// One interchangeable parent-selection method.
///
/// The selector walks [PARENT_STRATEGY_ORDER] and takes the first
/// method that yields a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParentStrategy {
    /// Hash of the client address.
    SourceHash,
    /// Hash of the authenticated user name.
    UserHash,
    /// Cache-array routing over the request URL.
    Carp,
    /// Plain round robin.
    RoundRobin,
    /// Round robin normalized by configured weight.
    WeightedRoundRobin,
    /// First alive parent in configuration order.
    FirstUp,
    /// The configured fallback parent.
    DefaultParent,
}

/// The order in which parent-selection methods are tried.
pub const PARENT_STRATEGY_ORDER: [ParentStrategy; 7] = [
    ParentStrategy::SourceHash,
    ParentStrategy::UserHash,
    ParentStrategy::Carp,
    ParentStrategy::RoundRobin,
    ParentStrategy::WeightedRoundRobin,
    ParentStrategy::FirstUp,
    ParentStrategy::DefaultParent,
];

impl ParentStrategy {
    /// The hierarchy code reported for a destination this method chose.
    pub fn hier_code(&self) -> HierCode {
        match self {
            Self::SourceHash => HierCode::SourcehashParent,
            Self::UserHash => HierCode::UserhashParent,
            Self::Carp => HierCode::CarpParent,
            Self::RoundRobin | Self::WeightedRoundRobin => {
                HierCode::RoundRobinParent
            }
            Self::FirstUp => HierCode::FirstUpParent,
            Self::DefaultParent => HierCode::DefaultParent,
        }
    }

    /// Apply this method to a request.
    pub fn select(
        &self,
        neighbors: &Neighbors,
        request: &HttpRequest,
    ) -> Option<Arc<CachePeer>> {
        match self {
            Self::SourceHash => {
                let key = request.client_addr?.to_string();
                let pool = neighbors
                    .hash_parents(request, |p| p.config.options.sourcehash);
                hash_select(&key, &pool)
            }
            Self::UserHash => {
                let key = request.auth_user.clone()?;
                let pool = neighbors
                    .hash_parents(request, |p| p.config.options.userhash);
                hash_select(&key, &pool)
            }
            Self::Carp => {
                let pool = neighbors
                    .hash_parents(request, |p| p.config.options.carp);
                hash_select(request.url.as_str(), &pool)
            }
            Self::RoundRobin => {
                let pool = neighbors
                    .hash_parents(request, |p| p.config.options.round_robin);
                let chosen = pool
                    .into_iter()
                    .min_by_key(|p| p.stats().rr_count)?;
                chosen.update_stats(|s| s.rr_count += 1);
                Some(chosen)
            }
            Self::WeightedRoundRobin => {
                let pool = neighbors.hash_parents(request, |p| {
                    p.config.options.weighted_round_robin
                });
                let chosen = pool.into_iter().min_by(|a, b| {
                    let an = a.stats().rr_count as f64
                        / a.config.weight.max(1) as f64;
                    let bn = b.stats().rr_count as f64
                        / b.config.weight.max(1) as f64;
                    an.total_cmp(&bn)
                })?;
                chosen.update_stats(|s| s.rr_count += 1);
                Some(chosen)
            }
            Self::FirstUp => neighbors
                .alive_parents(request)
                .into_iter()
                .next(),
            Self::DefaultParent => neighbors.default_parent(request),
        }
    }
}

/// The classic rotate-and-add key hash shared by the hash-based
/// selection methods.
fn rotate_hash(key: &str) -> u32 {
    key.bytes()
        .fold(0u32, |h, c| h.rotate_left(19).wrapping_add(c as u32))
}

/// Combine a request key with each candidate's host hash and pick the
/// highest weighted score. Deterministic for a given key and pool.
fn hash_select(
    key: &str,
    pool: &[Arc<CachePeer>],
) -> Option<Arc<CachePeer>> {
    if pool.is_empty() {
        return None;
    }
    let key_hash = rotate_hash(key);
    let total_weight: u64 = pool
        .iter()
        .map(|p| p.config.weight.max(1) as u64)
        .sum();

    pool.iter()
        .map(|p| {
            let peer_hash = rotate_hash(p.host());
            let mut combined = key_hash ^ peer_hash;
            combined =
                combined.wrapping_add(combined.wrapping_mul(0x62531965));
            combined = combined.rotate_left(21);
            let load = p.config.weight.max(1) as f64 / total_weight as f64;
            (combined as f64 * load, p.clone())
        })
        .max_by(|a, b| a.0.total_cmp(&b.0))
        .map(|(_, p)| p)
}
