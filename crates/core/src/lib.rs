#![deny(missing_docs)]
//! The hiero caching proxy core.
//!
//! Three tightly coupled subsystems: the per-request peer selector,
//! the upstream forwarding lifecycle (with optional response
//! adaptation), and the Network Measurement Database the selector
//! consults for closest-parent and go-direct decisions. Everything
//! else (parsing, storage, TLS, ACL evaluation, the ICMP daemon, the
//! event loop) enters through the seams defined in `hiero_api`.

mod context;
pub use context::*;

pub mod forward;
pub mod neighbors;
pub mod netdb;
pub mod probe;
pub mod selector;
