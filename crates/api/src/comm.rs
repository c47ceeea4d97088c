//! Transport-facing parameter blocks and the upstream connection seam.
//!
//! Socket ownership, I/O timeouts, and TLS live in the transport
//! collaborator. The core sees a [ServerConnection] plus the
//! [CommIoParams] each operation reports, reconciled against the
//! connection state just before the result is acted upon.

use crate::http::HttpReply;
use crate::select::Destination;
use crate::{BoxFut, HieroResult};
use std::sync::Arc;

/// The outcome class of one transport operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CommFlag {
    /// The operation succeeded.
    #[default]
    Ok,
    /// The connection is closing; the operation result is void but
    /// benign.
    ErrClosing,
    /// The operation failed with the carried OS error.
    Err(i32),
}

/// Parameters reported for one transport read or write.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommIoParams {
    /// Bytes transferred before the outcome was determined.
    pub size: usize,
    /// The outcome class.
    pub flag: CommFlag,
}

impl CommIoParams {
    /// Reconcile a possibly-stale result with the connection it was
    /// reported for. A close can race the delivery of a completion;
    /// whoever handles this result must observe `ErrClosing` in that
    /// case, never a stale success or failure.
    pub fn sync_with_comm(&mut self, conn: &dyn ServerConnection) {
        if conn.is_closing() && self.flag != CommFlag::ErrClosing {
            tracing::debug!("converting late I/O result to ErrClosing");
            self.flag = CommFlag::ErrClosing;
        }
    }
}

/// One established upstream connection.
///
/// A read returning zero bytes with an `Ok` flag is end-of-stream.
pub trait ServerConnection: 'static + Send + Sync + std::fmt::Debug {
    /// Write bytes to the upstream.
    fn write(&self, data: bytes::Bytes) -> BoxFut<'_, CommIoParams>;

    /// Read and parse the reply status line and headers. The parser
    /// behind this seam is a collaborator.
    fn read_reply_head(&self) -> BoxFut<'_, HieroResult<Arc<HttpReply>>>;

    /// Read at most `max` reply body bytes.
    fn read_body(
        &self,
        max: usize,
    ) -> BoxFut<'_, (bytes::Bytes, CommIoParams)>;

    /// Close the connection. Idempotent.
    fn close(&self) -> BoxFut<'_, ()>;

    /// Whether a close has been requested or completed.
    fn is_closing(&self) -> bool;
}

/// Trait-object [ServerConnection].
pub type DynServerConnection = Arc<dyn ServerConnection>;

/// Connection establishment seam.
pub trait Connector: 'static + Send + Sync + std::fmt::Debug {
    /// Open a connection to the given destination.
    fn connect(
        &self,
        dest: &Destination,
    ) -> BoxFut<'_, HieroResult<DynServerConnection>>;
}

/// Trait-object [Connector].
pub type DynConnector = Arc<dyn Connector>;
