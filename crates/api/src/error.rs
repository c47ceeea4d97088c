//! hiero error types.

use std::sync::Arc;

/// A clonable trait-object inner error.
#[derive(Clone, Default)]
pub struct SrcError(
    pub Option<Arc<dyn std::error::Error + 'static + Send + Sync>>,
);

impl std::fmt::Debug for SrcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl std::fmt::Display for SrcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.0.as_ref() {
            None => f.write_str("None"),
            Some(s) => s.fmt(f),
        }
    }
}

impl std::error::Error for SrcError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.0.as_ref().map(|s| {
            let out: &(dyn std::error::Error + 'static) = &**s;
            out
        })
    }
}

impl SrcError {
    /// Construct a new SrcError from a source error.
    pub fn new<E: std::error::Error + 'static + Send + Sync>(e: E) -> Self {
        Self(Some(Arc::new(e)))
    }
}

/// The core hiero error type, used for internal plumbing failures
/// (I/O, persistence, wire parsing). Terminal failures that must reach
/// an HTTP client are expressed as [ForwardError] instead.
///
/// This type implements `Clone` so results can travel through shared
/// futures and be replayed to multiple waiters.
#[derive(Debug, Clone, thiserror::Error)]
pub enum HieroError {
    /// Generic hiero internal error.
    #[error("{ctx} (src: {src})")]
    Other {
        /// Any context associated with this error.
        ctx: Arc<str>,

        /// The inner error (if any).
        #[source]
        src: SrcError,
    },
}

impl HieroError {
    /// Construct an "other" error with an inner source error.
    pub fn other_src<
        C: std::fmt::Display,
        S: std::error::Error + 'static + Send + Sync,
    >(
        ctx: C,
        src: S,
    ) -> Self {
        Self::Other {
            ctx: ctx.to_string().into_boxed_str().into(),
            src: SrcError::new(src),
        }
    }

    /// Construct an "other" error.
    pub fn other<C: std::fmt::Display>(ctx: C) -> Self {
        Self::Other {
            ctx: ctx.to_string().into_boxed_str().into(),
            src: SrcError::default(),
        }
    }
}

/// The core hiero result type.
pub type HieroResult<T> = Result<T, HieroError>;

/// The class of a terminal forwarding failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ForwardErrorKind {
    /// No IP address could be found for the destination hostname.
    DnsFail,
    /// Connecting to the upstream destination failed.
    ConnectFail,
    /// Sending the request to the upstream failed.
    WriteError,
    /// Reading the reply from the upstream failed.
    ReadError,
    /// The declared virgin reply body exceeds the configured maximum.
    TooBig,
    /// The response-adaptation service failed with an empty entry.
    AdaptationFailure,
    /// The adaptation service denied access to this response.
    /// Carries the deny-info page id chosen by the service, if any.
    AccessDenied {
        /// Deny-info page id, `None` for the stock access-denied page.
        page_id: Option<String>,
    },
}

impl ForwardErrorKind {
    /// The HTTP status a synthesized error reply carries for this kind.
    pub fn http_status(&self) -> u16 {
        match self {
            Self::DnsFail => 503,
            Self::ConnectFail | Self::WriteError | Self::ReadError => 502,
            Self::TooBig => 403,
            Self::AdaptationFailure => 500,
            Self::AccessDenied { .. } => 403,
        }
    }

    /// Whether a failure of this kind permits failover to the next
    /// destination in the selection list.
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            Self::DnsFail | Self::ConnectFail | Self::WriteError
        )
    }
}

/// A user-visible terminal forwarding failure.
///
/// When this error surfaces before any reply bytes were committed, the
/// forwarder renders it as a synthesized error reply; later failures are
/// only recorded on the request for logging.
#[derive(Debug, Clone)]
pub struct ForwardError {
    /// The failure class.
    pub kind: ForwardErrorKind,
    /// A named detail for logging (e.g. `ICAP_RESPMOD_EARLY`).
    pub detail: Option<&'static str>,
    /// The OS error that triggered the failure, if any.
    pub os_errno: Option<i32>,
}

impl ForwardError {
    /// Construct an error of the given kind with no further detail.
    pub fn new(kind: ForwardErrorKind) -> Self {
        Self {
            kind,
            detail: None,
            os_errno: None,
        }
    }

    /// Attach a named detail.
    pub fn with_detail(mut self, detail: &'static str) -> Self {
        self.detail = Some(detail);
        self
    }

    /// Attach the triggering OS error.
    pub fn with_errno(mut self, errno: i32) -> Self {
        self.os_errno = Some(errno);
        self
    }

    /// The HTTP status of the synthesized error reply.
    pub fn http_status(&self) -> u16 {
        self.kind.http_status()
    }
}

impl std::fmt::Display for ForwardError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}/{}", self.kind, self.http_status())?;
        if let Some(detail) = self.detail {
            write!(f, " ({detail})")?;
        }
        if let Some(errno) = self.os_errno {
            write!(f, " errno={errno}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn error_display() {
        assert_eq!(
            "bla (src: None)",
            HieroError::other("bla").to_string().as_str(),
        );
        assert_eq!(
            "foo (src: bar)",
            HieroError::other_src("foo", std::io::Error::other("bar"))
                .to_string()
                .as_str(),
        );
    }

    #[test]
    fn forward_error_statuses() {
        assert_eq!(503, ForwardError::new(ForwardErrorKind::DnsFail).http_status());
        assert_eq!(
            502,
            ForwardError::new(ForwardErrorKind::WriteError).http_status()
        );
        assert_eq!(
            403,
            ForwardError::new(ForwardErrorKind::AccessDenied { page_id: None })
                .http_status()
        );
        assert_eq!(500, ForwardErrorKind::AdaptationFailure.http_status());
    }

    #[test]
    fn retry_policy() {
        assert!(ForwardErrorKind::ConnectFail.retryable());
        assert!(ForwardErrorKind::WriteError.retryable());
        assert!(!ForwardErrorKind::TooBig.retryable());
        assert!(!ForwardErrorKind::AdaptationFailure.retryable());
    }

    #[test]
    fn ensure_error_types_are_send_and_sync() {
        fn ensure<T: std::fmt::Display + Send + Sync>(_t: T) {}
        ensure(HieroError::other("bla"));
        ensure(ForwardError::new(ForwardErrorKind::DnsFail));
    }
}
