//! The in-core HTTP message surface.
//!
//! Parsing and serializing HTTP/1 belongs to collaborators behind the
//! transport seam. The core only carries the parsed artifacts defined
//! here: enough of a request to select destinations and forward it, and
//! enough of a reply to store, adapt, and complete it.

use crate::body_pipe::BodyPipe;
use crate::error::ForwardErrorKind;
use crate::peer::CachePeer;
use crate::select::PingData;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use url::Url;

/// HTTP request method.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(missing_docs)]
pub enum Method {
    Get,
    Head,
    Post,
    Put,
    Delete,
    Connect,
    Options,
    Trace,
}

impl Method {
    /// Whether a successful response to this method invalidates cached
    /// entries for related URLs.
    pub fn purges_others(&self) -> bool {
        matches!(self, Self::Put | Self::Post | Self::Delete)
    }

    /// Canonical token for the request line.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Connect => "CONNECT",
            Self::Options => "OPTIONS",
            Self::Trace => "TRACE",
        }
    }
}

impl std::fmt::Display for Method {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An ordered name/value header list with case-insensitive lookup.
#[derive(Debug, Clone, Default)]
pub struct Headers(Vec<(String, String)>);

impl Headers {
    /// Append a header, keeping insertion order.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.0.push((name.into(), value.into()));
    }

    /// The first value of the named header, if present.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    /// Iterate all headers in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }
}

/// Request properties that steer selection and forwarding.
#[derive(Debug, Clone, Copy)]
pub struct RequestFlags {
    /// The request may consult neighbor caches.
    pub hierarchical: bool,
    /// Direct fetching is not an option (accelerator setups).
    pub no_direct: bool,
    /// A forwarding loop was detected; the request must go direct.
    pub loop_detected: bool,
    /// The request was intercepted rather than explicitly proxied.
    pub intercepted: bool,
    /// The request was intercepted with TPROXY client-address spoofing.
    pub intercept_tproxy: bool,
    /// The request was rewritten by a redirector.
    pub redirected: bool,
    /// The Host header was verified against the intercepted destination.
    pub host_verified: bool,
    /// The outgoing connection must spoof the client address.
    pub spoof_client_ip: bool,
}

impl Default for RequestFlags {
    fn default() -> Self {
        Self {
            hierarchical: true,
            no_direct: false,
            loop_detected: false,
            intercepted: false,
            intercept_tproxy: false,
            redirected: false,
            host_verified: true,
            spoof_client_ip: false,
        }
    }
}

/// An upstream connection pinned to the client session (NTLM, client
/// certificates, ...). Carried by the request so the selector can
/// short-circuit to it.
#[derive(Debug, Clone)]
pub struct PinnedConnection {
    /// The peer the connection is pinned to; `None` for the origin.
    pub peer: Option<Arc<CachePeer>>,
    /// Whether the pinned connection is still usable.
    pub valid: bool,
}

/// A terminal-failure annotation recorded on the request for logging.
#[derive(Debug, Clone)]
pub struct ErrorDetail {
    /// The failure class.
    pub kind: ForwardErrorKind,
    /// The named detail.
    pub detail: &'static str,
}

/// Hierarchy bookkeeping written by the selector and the forwarder.
#[derive(Debug, Clone, Default)]
pub struct HierarchyNote {
    /// The final probe snapshot of the selection run.
    pub ping: Option<PingData>,
    /// Reply body bytes read from the last upstream, `-1` when no
    /// upstream was contacted.
    pub body_bytes_read: Option<i64>,
}

/// One client request as seen by the core.
#[derive(Debug)]
pub struct HttpRequest {
    /// Request method.
    pub method: Method,
    /// Absolute request URL.
    pub url: Url,
    /// Selection/forwarding flags.
    pub flags: RequestFlags,
    /// Address of the requesting client, for source-hash selection and
    /// TPROXY spoofing checks.
    pub client_addr: Option<IpAddr>,
    /// The local address of the client's original (pre-interception)
    /// connection, used for the intercepted-direct substitution.
    pub client_original_dst: Option<SocketAddr>,
    /// Authenticated user name, for user-hash selection.
    pub auth_user: Option<String>,
    body_pipe: Mutex<Option<Arc<BodyPipe>>>,
    pinned: Mutex<Option<PinnedConnection>>,
    hier: Mutex<HierarchyNote>,
    error_details: Mutex<Vec<ErrorDetail>>,
}

impl HttpRequest {
    /// Construct a request with default flags and no body.
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            flags: RequestFlags::default(),
            client_addr: None,
            client_original_dst: None,
            auth_user: None,
            body_pipe: Mutex::new(None),
            pinned: Mutex::new(None),
            hier: Mutex::new(HierarchyNote::default()),
            error_details: Mutex::new(Vec::new()),
        }
    }

    /// The request-URL host, or an empty string for URLs without one.
    pub fn host(&self) -> &str {
        self.url.host_str().unwrap_or("")
    }

    /// The request-URL port, defaulting per scheme.
    pub fn port(&self) -> u16 {
        self.url.port_or_known_default().unwrap_or(80)
    }

    /// The request body pipe, when the client is sending a body.
    pub fn body_pipe(&self) -> Option<Arc<BodyPipe>> {
        self.body_pipe.lock().unwrap().clone()
    }

    /// Attach the request body pipe.
    pub fn set_body_pipe(&self, pipe: Arc<BodyPipe>) {
        *self.body_pipe.lock().unwrap() = Some(pipe);
    }

    /// The pinned upstream connection, if any.
    pub fn pinned(&self) -> Option<PinnedConnection> {
        self.pinned.lock().unwrap().clone()
    }

    /// Pin the upstream leg of this request's session.
    pub fn set_pinned(&self, pinned: PinnedConnection) {
        *self.pinned.lock().unwrap() = Some(pinned);
    }

    /// Record a terminal-failure annotation for logging.
    pub fn detail_error(&self, kind: ForwardErrorKind, detail: &'static str) {
        self.error_details
            .lock()
            .unwrap()
            .push(ErrorDetail { kind, detail });
    }

    /// All failure annotations recorded so far.
    pub fn error_details(&self) -> Vec<ErrorDetail> {
        self.error_details.lock().unwrap().clone()
    }

    /// Store the final probe snapshot of the selection run.
    pub fn note_ping(&self, ping: PingData) {
        self.hier.lock().unwrap().ping = Some(ping);
    }

    /// The hierarchy bookkeeping recorded so far.
    pub fn hier(&self) -> HierarchyNote {
        self.hier.lock().unwrap().clone()
    }

    /// Apply a delta to the reply-body byte count. The first call
    /// switches the count from "no upstream" to zero.
    pub fn add_body_bytes_read(&self, delta: i64) {
        let mut hier = self.hier.lock().unwrap();
        let count = hier.body_bytes_read.get_or_insert(0);
        *count += delta;
        debug_assert!(*count >= 0);
    }
}

/// One upstream reply as seen by the core.
#[derive(Debug)]
pub struct HttpReply {
    /// Status code.
    pub status: u16,
    /// Reply headers.
    pub headers: Headers,
    /// Declared body size, when the message framing announces one.
    pub body_size: Option<u64>,
    /// Offset of a partial-content body within the full representation.
    pub content_range_offset: Option<u64>,
    body_pipe: Mutex<Option<Arc<BodyPipe>>>,
}

impl HttpReply {
    /// Construct a reply with no headers and no body.
    pub fn new(status: u16) -> Self {
        Self {
            status,
            headers: Headers::default(),
            body_size: None,
            content_range_offset: None,
            body_pipe: Mutex::new(None),
        }
    }

    /// Whether a reply to `method` with this status carries a body.
    pub fn expects_body(&self, method: Method) -> bool {
        if method == Method::Head {
            return false;
        }
        !matches!(self.status, 100..=199 | 204 | 304)
    }

    /// The reply body pipe, when one is attached.
    pub fn body_pipe(&self) -> Option<Arc<BodyPipe>> {
        self.body_pipe.lock().unwrap().clone()
    }

    /// Attach the reply body pipe.
    pub fn set_body_pipe(&self, pipe: Arc<BodyPipe>) {
        *self.body_pipe.lock().unwrap() = Some(pipe);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn purging_methods() {
        assert!(Method::Put.purges_others());
        assert!(Method::Post.purges_others());
        assert!(Method::Delete.purges_others());
        assert!(!Method::Get.purges_others());
        assert!(!Method::Head.purges_others());
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let mut headers = Headers::default();
        headers.append("Content-Location", "/elsewhere");
        assert_eq!(Some("/elsewhere"), headers.get("content-location"));
        assert_eq!(None, headers.get("location"));
    }

    #[test]
    fn body_expectations() {
        assert!(!HttpReply::new(204).expects_body(Method::Get));
        assert!(!HttpReply::new(304).expects_body(Method::Get));
        assert!(!HttpReply::new(200).expects_body(Method::Head));
        assert!(HttpReply::new(200).expects_body(Method::Get));
    }

    #[test]
    fn body_bytes_read_starts_at_zero() {
        let req = HttpRequest::new(
            Method::Get,
            Url::parse("http://origin.example/x").unwrap(),
        );
        assert_eq!(None, req.hier().body_bytes_read);
        req.add_body_bytes_read(0);
        assert_eq!(Some(0), req.hier().body_bytes_read);
        req.add_body_bytes_read(17);
        assert_eq!(Some(17), req.hier().body_bytes_read);
    }
}
