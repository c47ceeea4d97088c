//! The process-wide collaborator set, threaded explicitly.

use crate::neighbors::Neighbors;
use crate::netdb::NetDb;
use hiero_api::acl::DynAclCheck;
use hiero_api::adaptation::{DynAccessCheck, DynAdaptationService};
use hiero_api::comm::DynConnector;
use hiero_api::dns::DynResolver;
use hiero_api::icmp::DynPinger;
use hiero_api::peer::PeerConfig;
use hiero_api::probe::DynProbeTransport;
use hiero_api::select::DynDigestLookup;
use hiero_api::store::DynPurger;
use hiero_api::CoreConfig;
use std::sync::Arc;

/// Everything the core modules share for one proxy instance.
///
/// The original keeps these as process globals; carrying them in one
/// value lets tests run isolated instances side by side.
#[derive(Debug)]
pub struct CoreContext {
    /// Runtime configuration.
    pub config: CoreConfig,
    /// The Network Measurement Database.
    pub netdb: Arc<NetDb>,
    /// The configured neighbor registry.
    pub neighbors: Arc<Neighbors>,
    /// DNS resolution.
    pub resolver: DynResolver,
    /// Upstream connection establishment.
    pub connector: DynConnector,
    /// The `always_direct` access list, when configured.
    pub always_direct: Option<DynAclCheck>,
    /// The `never_direct` access list, when configured.
    pub never_direct: Option<DynAclCheck>,
    /// The `store_miss` access list, when configured.
    pub store_miss: Option<DynAclCheck>,
    /// The respmod pre-cache access check, when adaptation is on.
    pub access_check: Option<DynAccessCheck>,
    /// The adaptation service chain, when adaptation is on.
    pub adaptation: Option<DynAdaptationService>,
    /// The probe (ICP/HTCP) query transport, when probing is on.
    pub probe_transport: Option<DynProbeTransport>,
    /// Cache-digest lookups, when digests are exchanged.
    pub digests: Option<DynDigestLookup>,
    /// Cache-index invalidation for purge-others.
    pub purger: Option<DynPurger>,
}

impl CoreContext {
    /// Assemble a context from the mandatory collaborators. Optional
    /// seams start absent; wire them with the `with_*` builders.
    pub fn new(
        config: CoreConfig,
        peers: Vec<PeerConfig>,
        resolver: DynResolver,
        connector: DynConnector,
        pinger: Option<DynPinger>,
    ) -> Arc<Self> {
        let netdb = NetDb::new(
            config.netdb.clone(),
            resolver.clone(),
            pinger,
        );
        let neighbors = Neighbors::new(peers);
        Arc::new(Self {
            config,
            netdb,
            neighbors,
            resolver,
            connector,
            always_direct: None,
            never_direct: None,
            store_miss: None,
            access_check: None,
            adaptation: None,
            probe_transport: None,
            digests: None,
            purger: None,
        })
    }
}

/// Optional collaborator seams, wired at assembly time.
#[derive(Debug, Default)]
pub struct ContextOptions {
    /// See [CoreContext::always_direct].
    pub always_direct: Option<DynAclCheck>,
    /// See [CoreContext::never_direct].
    pub never_direct: Option<DynAclCheck>,
    /// See [CoreContext::store_miss].
    pub store_miss: Option<DynAclCheck>,
    /// See [CoreContext::access_check].
    pub access_check: Option<DynAccessCheck>,
    /// See [CoreContext::adaptation].
    pub adaptation: Option<DynAdaptationService>,
    /// See [CoreContext::probe_transport].
    pub probe_transport: Option<DynProbeTransport>,
    /// See [CoreContext::digests].
    pub digests: Option<DynDigestLookup>,
    /// See [CoreContext::purger].
    pub purger: Option<DynPurger>,
}

impl CoreContext {
    /// Assemble a context with optional seams wired in one go.
    pub fn with_options(
        config: CoreConfig,
        peers: Vec<PeerConfig>,
        resolver: DynResolver,
        connector: DynConnector,
        pinger: Option<DynPinger>,
        options: ContextOptions,
    ) -> Arc<Self> {
        let netdb = NetDb::new(
            config.netdb.clone(),
            resolver.clone(),
            pinger,
        );
        let neighbors = Neighbors::new(peers);
        Arc::new(Self {
            config,
            netdb,
            neighbors,
            resolver,
            connector,
            always_direct: options.always_direct,
            never_direct: options.never_direct,
            store_miss: options.store_miss,
            access_check: options.access_check,
            adaptation: options.adaptation,
            probe_transport: options.probe_transport,
            digests: options.digests,
            purger: options.purger,
        })
    }
}
