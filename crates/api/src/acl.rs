//! Access-control seam.
//!
//! ACL evaluation itself is a collaborator; the core only consumes the
//! four-valued answer of a non-blocking check.

use crate::http::HttpRequest;
use crate::BoxFut;
use std::sync::Arc;

/// The answer of an access-control check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AclAnswer {
    /// The check has not produced an answer yet.
    Dunno,
    /// The request matched an allow rule.
    Allowed,
    /// The request matched a deny rule.
    Denied,
    /// The check could not conclude without user credentials.
    AuthRequired,
}

/// A non-blocking access-control check.
pub trait AclCheck: 'static + Send + Sync + std::fmt::Debug {
    /// Evaluate the named access list against a request.
    fn check(&self, request: &HttpRequest) -> BoxFut<'_, AclAnswer>;
}

/// Trait-object [AclCheck].
pub type DynAclCheck = Arc<dyn AclCheck>;

/// An [AclCheck] that always returns the same answer. Useful for
/// deployments that pin a directive to a constant and for tests.
#[derive(Debug)]
pub struct ConstAclCheck(pub AclAnswer);

impl AclCheck for ConstAclCheck {
    fn check(&self, _request: &HttpRequest) -> BoxFut<'_, AclAnswer> {
        let answer = self.0;
        Box::pin(async move { answer })
    }
}
