//! Neighbor-probe (ICP/HTCP) reply surface and transport seam.
//!
//! Encoding the UDP/TCP queries and parsing raw datagrams belongs to
//! the transport collaborator; the core consumes the decoded replies
//! defined here.

use crate::http::HttpRequest;
use crate::peer::{CachePeer, PeerType};
use crate::{BoxFut, HieroResult};
use std::sync::Arc;

/// ICP opcodes the selection logic reacts to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IcpOpcode {
    /// The neighbor has the object.
    Hit,
    /// The neighbor does not have the object.
    Miss,
    /// A dumb-echo reply from a non-cache.
    Decho,
}

/// The ICP flag announcing that the `pad` field carries the
/// neighbor-measured RTT and hop count to the origin.
pub const ICP_FLAG_SRC_RTT: u32 = 0x4000_0000;

/// A decoded ICP reply.
#[derive(Debug, Clone, Copy)]
pub struct IcpReplyData {
    /// The reply opcode.
    pub opcode: IcpOpcode,
    /// Raw reply flags.
    pub flags: u32,
    /// The pad field; with [ICP_FLAG_SRC_RTT] set it packs
    /// `rtt = pad & 0xFFFF` and `hops = (pad >> 16) & 0xFFFF`.
    pub pad: u32,
}

impl IcpReplyData {
    /// The neighbor-to-origin RTT in milliseconds, when announced.
    pub fn src_rtt(&self) -> Option<(u32, u32)> {
        if self.flags & ICP_FLAG_SRC_RTT == 0 {
            return None;
        }
        Some((self.pad & 0xFFFF, (self.pad >> 16) & 0xFFFF))
    }
}

/// A decoded HTCP reply.
#[derive(Debug, Clone, Copy)]
pub struct HtcpReplyData {
    /// Whether the neighbor has the object.
    pub hit: bool,
    /// Neighbor-to-origin RTT in seconds from the cache-to-origin
    /// detail, zero when not announced.
    pub cto_rtt: f64,
    /// Neighbor-to-origin hop count from the cache-to-origin detail.
    pub cto_hops: f64,
}

/// A decoded probe reply from one neighbor.
#[derive(Debug, Clone)]
pub struct ProbeReply {
    /// The answering neighbor.
    pub peer: Arc<CachePeer>,
    /// Our relationship with the answering neighbor.
    pub peer_type: PeerType,
    /// The protocol-specific payload.
    pub payload: ProbePayload,
}

/// The protocol-specific part of a probe reply.
#[derive(Debug, Clone)]
pub enum ProbePayload {
    /// An ICP reply.
    Icp(IcpReplyData),
    /// An HTCP reply.
    Htcp(HtcpReplyData),
}

/// Query transmission seam.
///
/// The implementation owns the probe sockets. Decoded replies for the
/// request are pushed into the supplied channel until it is dropped;
/// replies arriving later are discarded by the channel itself.
pub trait ProbeTransport: 'static + Send + Sync + std::fmt::Debug {
    /// Send one query per peer, reporting how many were actually sent.
    fn broadcast(
        &self,
        peers: &[Arc<CachePeer>],
        request: &HttpRequest,
        replies: tokio::sync::mpsc::Sender<ProbeReply>,
    ) -> BoxFut<'_, HieroResult<usize>>;
}

/// Trait-object [ProbeTransport].
pub type DynProbeTransport = Arc<dyn ProbeTransport>;
