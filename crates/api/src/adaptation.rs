//! Response-adaptation seams.
//!
//! The external modification service (e.g. an ICAP respmod chain) is a
//! collaborator. The core asks an access check which service group, if
//! any, should see a virgin reply, then routes the reply through the
//! service and merges the adapted result back into the forwarding
//! lifecycle.

use crate::body_pipe::BodyPipe;
use crate::http::{HttpReply, HttpRequest};
use crate::BoxFut;
use std::sync::Arc;

/// A named group of adaptation services applied in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceGroup {
    /// The group identifier from the adaptation configuration.
    pub name: String,
}

/// The outcome of one adaptation pass.
#[derive(Debug)]
pub enum AdaptationAnswer {
    /// The adapted message replaces the virgin reply. When the adapted
    /// reply carries a body, it arrives through the reply's body pipe.
    Forward(Arc<HttpReply>),
    /// The service denies client access to this response. Carries the
    /// deny-info page id configured for the matching rule, if any.
    Block {
        /// Deny-info page id, `None` for the stock page.
        page_id: Option<String>,
    },
    /// The adaptation attempt failed.
    Error {
        /// Whether retrying with another service could still succeed.
        final_: bool,
    },
}

/// The pre-cache respmod access check.
pub trait AccessCheck: 'static + Send + Sync + std::fmt::Debug {
    /// Decide which service group should adapt this reply, `None` for
    /// no adaptation.
    fn start(
        &self,
        request: &HttpRequest,
        virgin_reply: &HttpReply,
    ) -> BoxFut<'_, Option<ServiceGroup>>;
}

/// Trait-object [AccessCheck].
pub type DynAccessCheck = Arc<dyn AccessCheck>;

/// One adaptation service chain.
///
/// The implementation consumes the virgin body from `virgin_body` (when
/// present) and resolves with its answer. A
/// [Forward](AdaptationAnswer::Forward) answer whose reply has a body
/// pipe keeps producing into that pipe after the answer resolves.
pub trait AdaptationService: 'static + Send + Sync + std::fmt::Debug {
    /// Run the service group over a virgin reply.
    fn adapt(
        &self,
        group: ServiceGroup,
        request: Arc<HttpRequest>,
        virgin_reply: Arc<HttpReply>,
        virgin_body: Option<Arc<BodyPipe>>,
    ) -> BoxFut<'static, AdaptationAnswer>;
}

/// Trait-object [AdaptationService].
pub type DynAdaptationService = Arc<dyn AdaptationService>;
