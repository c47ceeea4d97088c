//! The upstream forwarding lifecycle.
//!
//! A [Forwarder] owns the fate of one request: it subscribes to peer
//! selection, walks the resulting destination paths in order, runs one
//! [exchange::Exchange] per attempt, fails over on retryable errors
//! while the entry is still empty, and on terminal failure synthesizes
//! an error reply into the store entry.

use crate::context::CoreContext;
use crate::selector::PeerSelector;
use hiero_api::error::{ForwardError, ForwardErrorKind};
use hiero_api::http::{HttpReply, HttpRequest};
use hiero_api::select::{
    Destination, DynSelectionInitiator, PeerSelectionInitiator,
};
use hiero_api::store::StoreEntry;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Notify};

pub mod exchange;

#[cfg(test)]
mod test;

/// What the selection task feeds the forwarder.
#[derive(Debug)]
enum SelectionEvent {
    Path(Destination),
    End(Option<ForwardError>),
}

/// Bridges the selector's initiator seam onto a queue the forwarder
/// drains at its own pace.
#[derive(Debug)]
struct SelectionQueue {
    tx: mpsc::UnboundedSender<SelectionEvent>,
    subscribed: AtomicBool,
}

impl PeerSelectionInitiator for SelectionQueue {
    fn note_destination(&self, path: Destination) {
        let _ = self.tx.send(SelectionEvent::Path(path));
    }

    fn note_destinations_end(&self, error: Option<ForwardError>) {
        let _ = self.tx.send(SelectionEvent::End(error));
    }

    fn subscribed(&self) -> bool {
        self.subscribed.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Default)]
struct FwdInner {
    n_tries: usize,
    dont_retry: bool,
    err: Option<ForwardError>,
    completed: bool,
    finished: bool,
}

/// Drives one request through upstream destinations until a reply is
/// stored or the attempt list is exhausted.
#[derive(Debug)]
pub struct Forwarder {
    ctx: Arc<CoreContext>,
    request: Arc<HttpRequest>,
    entry: Arc<StoreEntry>,
    inner: Mutex<FwdInner>,
    finished: Notify,
}

impl Forwarder {
    /// Start forwarding; returns a handle the caller can await.
    pub fn start(
        ctx: Arc<CoreContext>,
        request: Arc<HttpRequest>,
        entry: Arc<StoreEntry>,
    ) -> Arc<Self> {
        let fwd = Arc::new(Self {
            ctx,
            request,
            entry,
            inner: Mutex::new(FwdInner::default()),
            finished: Notify::new(),
        });
        tokio::spawn(fwd.clone().run());
        fwd
    }

    /// Park until the forwarding run finished, successfully or not.
    pub async fn await_finished(&self) {
        loop {
            let notified = self.finished.notified();
            if self.inner.lock().unwrap().finished {
                return;
            }
            notified.await;
        }
    }

    /// Whether the run ended with a stored reply.
    pub fn succeeded(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.finished && inner.completed
    }

    /// The terminal error, when the run failed.
    pub fn last_error(&self) -> Option<ForwardError> {
        self.inner.lock().unwrap().err.clone()
    }

    async fn run(self: Arc<Self>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let queue = Arc::new(SelectionQueue {
            tx,
            subscribed: AtomicBool::new(true),
        });
        let initiator: DynSelectionInitiator = queue.clone();
        PeerSelector::start_selecting_destinations(
            self.ctx.clone(),
            self.request.clone(),
            Some(self.entry.clone()),
            &initiator,
        );

        let mut selection_error = None;
        let mut succeeded = false;
        while let Some(event) = rx.recv().await {
            match event {
                SelectionEvent::Path(dest) => {
                    self.inner.lock().unwrap().n_tries += 1;
                    if self.attempt(dest).await {
                        succeeded = true;
                        break;
                    }
                    if !self.may_retry() {
                        break;
                    }
                }
                SelectionEvent::End(error) => {
                    selection_error = error;
                    break;
                }
            }
        }

        // stop the selector from resolving paths nobody will use
        queue.subscribed.store(false, Ordering::SeqCst);

        if !succeeded {
            self.fail_terminal(selection_error);
        }

        self.inner.lock().unwrap().finished = true;
        self.finished.notify_waiters();
    }

    async fn attempt(self: &Arc<Self>, dest: Destination) -> bool {
        tracing::debug!(
            addr = %dest.addr,
            code = %dest.code,
            tries = self.inner.lock().unwrap().n_tries,
            "trying destination",
        );

        let conn = match self.ctx.connector.connect(&dest).await {
            Ok(conn) => conn,
            Err(err) => {
                tracing::debug!(?err, addr = %dest.addr, "connect failed");
                self.fail(ForwardError::new(
                    ForwardErrorKind::ConnectFail,
                ));
                return false;
            }
        };

        exchange::Exchange::new(
            self.ctx.clone(),
            self.clone(),
            self.request.clone(),
            self.entry.clone(),
            conn,
            dest,
        )
        .run()
        .await
    }

    fn may_retry(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        if inner.dont_retry {
            return false;
        }
        if !self.entry.is_empty() || !self.entry.is_accepting() {
            return false;
        }
        if inner.n_tries >= self.ctx.config.forward_max_tries {
            return false;
        }
        inner
            .err
            .as_ref()
            .map(|e| e.kind.retryable())
            .unwrap_or(true)
    }

    /// Record the error to present if every destination fails.
    pub(crate) fn fail(&self, err: ForwardError) {
        tracing::debug!(%err, "forwarding attempt failed");
        self.inner.lock().unwrap().err = Some(err);
    }

    /// Forbid failover to further destinations.
    pub(crate) fn dont_retry(&self, value: bool) {
        self.inner.lock().unwrap().dont_retry = value;
    }

    /// The stored reply is provably complete.
    pub(crate) fn mark_stored_reply_as_whole(&self, reason: &'static str) {
        self.entry.mark_whole(reason);
    }

    /// The exchange finished and the reply is fully stored.
    pub(crate) fn complete(&self) {
        self.inner.lock().unwrap().completed = true;
        self.entry.complete();
    }

    /// The exchange went away without completing the entry.
    pub(crate) fn handle_unregistered_server_end(&self) {
        tracing::debug!("server exchange ended unannounced");
    }

    fn fail_terminal(&self, selection_error: Option<ForwardError>) {
        let err = {
            let mut inner = self.inner.lock().unwrap();
            inner
                .err
                .take()
                .or(selection_error)
                .unwrap_or_else(|| {
                    ForwardError::new(ForwardErrorKind::ReadError)
                })
        };

        if let Some(detail) = err.detail {
            self.request.detail_error(err.kind.clone(), detail);
        }

        if self.entry.is_empty() && self.entry.is_accepting() {
            // nothing was streamed yet: the client gets an error reply
            let (reply, body) = error_reply(&err);
            self.entry.replace_reply(reply);
            self.entry.start_writing();
            self.entry.write(0, body.as_bytes());
            self.entry.mark_whole("error reply synthesized");
            self.entry.complete();
        } else {
            // too late for an error page; the client sees a truncated
            // response
            self.entry.abort();
        }

        tracing::debug!(%err, "forwarding failed");
        self.inner.lock().unwrap().err = Some(err);
    }
}

/// Render a terminal failure as an HTTP reply. Stands in for the error
/// page subsystem, which owns the real templates.
fn error_reply(err: &ForwardError) -> (Arc<HttpReply>, String) {
    let title = match &err.kind {
        ForwardErrorKind::DnsFail => "Unable to determine IP address",
        ForwardErrorKind::ConnectFail => "Connection to upstream failed",
        ForwardErrorKind::WriteError | ForwardErrorKind::ReadError => {
            "Communication with upstream failed"
        }
        ForwardErrorKind::TooBig => "Reply too large",
        ForwardErrorKind::AdaptationFailure => {
            "Content adaptation failed"
        }
        ForwardErrorKind::AccessDenied { .. } => "Access Denied",
    };
    let page = match &err.kind {
        ForwardErrorKind::AccessDenied { page_id: Some(id) } => id.as_str(),
        _ => "ERR_GENERIC",
    };
    let body = format!(
        "<html><head><title>{title}</title></head>\n\
         <body><h1>{title}</h1>\n\
         <p>{err}</p>\n\
         <!-- page: {page} -->\n\
         </body></html>\n",
    );

    let mut reply = HttpReply::new(err.http_status());
    reply.headers.append("Content-Type", "text/html");
    reply.body_size = Some(body.len() as u64);
    (Arc::new(reply), body)
}
