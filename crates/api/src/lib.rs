#![deny(missing_docs)]
//! Contracts and shared data types for the hiero caching proxy core.
//!
//! This crate defines the seams between the proxy core and its
//! collaborators (DNS, ACL evaluation, transport, adaptation services,
//! the ICMP measurement daemon) together with the concrete data types
//! that cross those seams. The working modules live in the
//! `hiero_core` crate.

/// Boxed future type.
pub type BoxFut<'a, T> =
    std::pin::Pin<Box<dyn std::future::Future<Output = T> + Send + Sync + 'a>>;

pub mod error;
pub use error::*;

mod timestamp;
pub use timestamp::*;

pub mod config;
pub use config::CoreConfig;

pub mod acl;
pub mod adaptation;
pub mod body_pipe;
pub mod comm;
pub mod dns;
pub mod http;
pub mod icmp;
pub mod peer;
pub mod probe;
pub mod select;
pub mod store;
