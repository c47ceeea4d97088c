//! The per-request peer selection state machine.
//!
//! One selector instance decides the ordered set of destinations for
//! one request: it resolves whether going direct is permitted (ACL
//! seams), short-circuits to a pinned connection, consults cache
//! digests and NetDB, optionally opens an ICP/HTCP probe window, emits
//! candidate servers in hierarchy order, and finally resolves each
//! candidate to concrete address paths for the initiator.
//!
//! The original re-entered one big dispatch function from every
//! callback; here the suspension points (ACL answers, the probe
//! window, DNS) are awaited inline by a single driver task. The
//! initiator is held weakly: dropping it or unsubscribing cancels the
//! run at its next re-entry.

use crate::context::CoreContext;
use crate::probe::{PingStarted, Prober};
use hiero_api::acl::AclAnswer;
use hiero_api::error::{ForwardError, ForwardErrorKind};
use hiero_api::http::HttpRequest;
use hiero_api::peer::{CachePeer, PeerType};
use hiero_api::probe::{HtcpReplyData, IcpOpcode, IcpReplyData, ProbePayload, ProbeReply};
use hiero_api::select::{
    Destination, DynSelectionInitiator, HierCode, PeerSelectionInitiator,
    PingData, PingStatus,
};
use hiero_api::store::StoreEntry;
use hiero_api::Timestamp;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

static PING_TIMEOUTS: AtomicU64 = AtomicU64::new(0);

/// Process-wide count of probe windows that closed on timeout.
pub fn ping_timeout_count() -> u64 {
    PING_TIMEOUTS.load(Ordering::Relaxed)
}

/// Whether fetching directly from the origin is permitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectDisposition {
    /// Not decided yet.
    Unknown,
    /// Forbidden.
    No,
    /// Permitted alongside parents.
    Maybe,
    /// Required.
    Yes,
}

/// A candidate destination before DNS resolution.
#[derive(Debug)]
struct FwdServer {
    peer: Option<Arc<CachePeer>>,
    code: HierCode,
}

/// The per-request selection state.
pub struct PeerSelector {
    ctx: Arc<CoreContext>,
    request: Arc<HttpRequest>,
    entry: Option<Arc<StoreEntry>>,
    initiator: Weak<dyn PeerSelectionInitiator>,
    direct: DirectDisposition,
    always_direct: AclAnswer,
    never_direct: AclAnswer,
    servers: VecDeque<FwdServer>,
    ping: PingData,
    ping_opened: Option<tokio::time::Instant>,
    hit: Option<(Arc<CachePeer>, PeerType)>,
    closest_parent_miss: Option<Arc<CachePeer>>,
    first_parent_miss: Option<Arc<CachePeer>>,
    found_paths: usize,
    last_error: Option<ForwardError>,
}

impl PeerSelector {
    /// Start selecting destinations for a request. Destinations and
    /// the final end-note arrive through the initiator, which may
    /// cancel at any time by dropping or unsubscribing.
    pub fn start_selecting_destinations(
        ctx: Arc<CoreContext>,
        request: Arc<HttpRequest>,
        entry: Option<Arc<StoreEntry>>,
        initiator: &DynSelectionInitiator,
    ) {
        let selector = PeerSelector {
            always_direct: if ctx.always_direct.is_some() {
                AclAnswer::Dunno
            } else {
                AclAnswer::Denied
            },
            never_direct: if ctx.never_direct.is_some() {
                AclAnswer::Dunno
            } else {
                AclAnswer::Denied
            },
            ctx,
            request,
            entry,
            initiator: Arc::downgrade(initiator),
            direct: DirectDisposition::Unknown,
            servers: VecDeque::new(),
            ping: PingData::default(),
            ping_opened: None,
            hit: None,
            closest_parent_miss: None,
            first_parent_miss: None,
            found_paths: 0,
            last_error: None,
        };
        tokio::spawn(selector.run());
    }

    /// The still-interested initiator, or `None` when the run should
    /// abort.
    fn interested(&self) -> Option<DynSelectionInitiator> {
        self.initiator.upgrade().filter(|i| i.subscribed())
    }

    async fn run(mut self) {
        tracing::debug!(
            method = %self.request.method,
            host = self.request.host(),
            "selecting destinations",
        );

        self.determine_direct().await;
        if self.interested().is_none() {
            return self.abort();
        }

        if self
            .entry
            .as_ref()
            .map(|e| e.ping_status() == PingStatus::None)
            .unwrap_or(true)
        {
            self.select_pinned();
        }

        if let Some(entry) = self.entry.clone() {
            if entry.ping_status() == PingStatus::None {
                self.acquire_neighbor(&entry).await;
                if self.interested().is_none() {
                    return self.abort();
                }
            }
        }

        match self.direct {
            DirectDisposition::Yes => self.get_some_direct(),
            DirectDisposition::No => {
                self.get_some_parent();
                self.get_all_parents();
            }
            DirectDisposition::Unknown | DirectDisposition::Maybe => {
                if self.ctx.config.onoff.prefer_direct {
                    self.get_some_direct();
                }
                if self.request.flags.hierarchical
                    || !self.ctx.config.onoff.nonhierarchical_direct
                {
                    self.get_some_parent();
                    self.get_all_parents();
                }
                if !self.ctx.config.onoff.prefer_direct {
                    self.get_some_direct();
                }
            }
        }

        self.resolve_paths().await;
    }

    fn abort(&mut self) {
        tracing::debug!("aborting peer selection, initiator gone");
        if let Some(entry) = &self.entry {
            if entry.ping_status() == PingStatus::Waiting {
                entry.set_ping_status(PingStatus::Done);
            }
        }
    }

    // --- directness ---------------------------------------------------

    async fn determine_direct(&mut self) {
        while self.direct == DirectDisposition::Unknown {
            if self.interested().is_none() {
                return;
            }
            if self.always_direct == AclAnswer::Dunno {
                let check = self
                    .ctx
                    .always_direct
                    .clone()
                    .expect("dunno implies a configured check");
                let answer = check.check(&self.request).await;
                self.always_direct = settle(answer);
                match answer {
                    AclAnswer::Allowed => {
                        self.direct = DirectDisposition::Yes;
                        tracing::debug!("direct = Yes (always_direct allow)");
                    }
                    AclAnswer::AuthRequired => {
                        tracing::warn!(
                            "always_direct needs credentials; user ACLs \
                             are not reliable here",
                        );
                    }
                    _ => {}
                }
            } else if self.never_direct == AclAnswer::Dunno {
                let check = self
                    .ctx
                    .never_direct
                    .clone()
                    .expect("dunno implies a configured check");
                let answer = check.check(&self.request).await;
                self.never_direct = settle(answer);
                match answer {
                    AclAnswer::Allowed => {
                        self.direct = DirectDisposition::No;
                        tracing::debug!("direct = No (never_direct allow)");
                    }
                    AclAnswer::AuthRequired => {
                        tracing::warn!(
                            "never_direct needs credentials; user ACLs \
                             are not reliable here",
                        );
                    }
                    _ => {}
                }
            } else if self.request.flags.no_direct {
                // accelerating: direct is not an option
                self.direct = DirectDisposition::No;
                tracing::debug!("direct = No (forced non-direct)");
            } else if self.request.flags.loop_detected {
                // in a forwarding loop: only direct can break it
                self.direct = DirectDisposition::Yes;
                tracing::debug!("direct = Yes (forwarding loop)");
            } else if self.check_netdb_direct() {
                self.direct = DirectDisposition::Yes;
                tracing::debug!("direct = Yes (netdb heuristic)");
            } else {
                self.direct = DirectDisposition::Maybe;
                tracing::debug!("direct = Maybe (default)");
            }
        }
    }

    /// Go direct when our own measurements beat the thresholds, or
    /// beat the best parent miss once the probe window produced one.
    fn check_netdb_direct(&self) -> bool {
        if self.direct == DirectDisposition::No {
            return false;
        }

        let host = self.request.host();
        let my_rtt = self.ctx.netdb.host_rtt(host);
        if my_rtt > 0 && my_rtt <= self.ctx.config.min_direct_rtt {
            return true;
        }

        let my_hops = self.ctx.netdb.host_hops(host);
        if my_hops > 0 && my_hops <= self.ctx.config.min_direct_hops {
            return true;
        }

        if self.closest_parent_miss.is_some()
            && my_rtt > 0
            && my_rtt <= self.ping.p_rtt
        {
            return true;
        }

        false
    }

    // --- pinned connections -------------------------------------------

    fn select_pinned(&mut self) {
        let Some(pinned) = self.request.pinned() else { return };
        if !pinned.valid {
            return;
        }
        match pinned.peer {
            Some(peer) => {
                if self.ctx.neighbors.peer_http_okay(&peer, &self.request)
                {
                    self.add_server(Some(peer), HierCode::Pinned);
                    self.skip_pinging();
                }
            }
            None => {
                if self.direct != DirectDisposition::No {
                    self.add_server(None, HierCode::Pinned);
                    self.skip_pinging();
                }
            }
        }
    }

    fn skip_pinging(&self) {
        if let Some(entry) = &self.entry {
            entry.set_ping_status(PingStatus::Done);
        }
    }

    // --- neighbor acquisition -----------------------------------------

    async fn acquire_neighbor(&mut self, entry: &Arc<StoreEntry>) {
        if self.direct == DirectDisposition::Yes {
            entry.set_ping_status(PingStatus::Done);
            return;
        }

        if let Some(digests) = &self.ctx.digests {
            if let Some(peer) = digests.lookup(&self.request) {
                let code = match self.ctx.neighbors.neighbor_type(&peer) {
                    PeerType::Parent => HierCode::CdParentHit,
                    PeerType::Sibling => HierCode::CdSiblingHit,
                };
                self.add_server(Some(peer), code);
                entry.set_ping_status(PingStatus::Done);
                return;
            }
        }

        if let Some(peer) = self
            .ctx
            .netdb
            .closest_parent(&self.request, &self.ctx.neighbors)
        {
            self.add_server(Some(peer), HierCode::ClosestParent);
            entry.set_ping_status(PingStatus::Done);
            return;
        }

        if self.ping_eligible(entry) {
            if let Some(prober) = self.prober() {
                if let Some(started) = prober.ping(&self.request).await {
                    self.ping.start = Some(Timestamp::now());
                    self.ping_opened = Some(tokio::time::Instant::now());
                    self.ping.n_sent = started.n_sent;
                    self.ping.n_replies_expected =
                        started.n_replies_expected;
                    self.ping.timeout_ms =
                        started.timeout.as_millis() as u32;
                    tracing::debug!(
                        expected = self.ping.n_replies_expected,
                        timeout_ms = self.ping.timeout_ms,
                        "probe replies expected",
                    );

                    if started.n_replies_expected > 0 {
                        entry.set_ping_status(PingStatus::Waiting);
                        self.await_ping_replies(started).await;
                        entry.set_ping_status(PingStatus::Done);
                        self.get_some_neighbor_replies();
                        return;
                    }
                }
            }
        }

        entry.set_ping_status(PingStatus::Done);
    }

    fn prober(&self) -> Option<Prober> {
        self.ctx.probe_transport.as_ref().map(|transport| {
            Prober::new(
                self.ctx.neighbors.clone(),
                transport.clone(),
                self.ctx.config.probe.clone(),
            )
        })
    }

    /// Whether a probe broadcast makes sense for this request.
    fn ping_eligible(&self, entry: &StoreEntry) -> bool {
        if !self.request.flags.hierarchical
            && self.direct != DirectDisposition::No
        {
            return false;
        }
        if entry.is_private()
            && !self.ctx.config.onoff.neighbors_do_private_keys
            && self.direct != DirectDisposition::No
        {
            return false;
        }
        !self.ctx.neighbors.probeable(&self.request).is_empty()
    }

    async fn await_ping_replies(&mut self, mut started: PingStarted) {
        let window = tokio::time::sleep(started.timeout);
        tokio::pin!(window);

        loop {
            tokio::select! {
                _ = &mut window => {
                    PING_TIMEOUTS.fetch_add(1, Ordering::Relaxed);
                    self.ping.timedout = true;
                    tracing::debug!("probe window timed out");
                    return;
                }
                reply = started.replies.recv() => {
                    let Some(reply) = reply else { return };
                    if self.handle_ping_reply(reply) {
                        return; // first hit wins
                    }
                    if self.ping.n_recv >= self.ping.n_replies_expected {
                        return;
                    }
                }
            }
        }
    }

    /// Account one probe reply; returns true on the first hit.
    fn handle_ping_reply(&mut self, reply: ProbeReply) -> bool {
        self.ping.n_recv += 1;
        match reply.payload {
            ProbePayload::Icp(icp) => {
                tracing::debug!(
                    peer = reply.peer.host(),
                    ?icp.opcode,
                    "icp reply",
                );
                match icp.opcode {
                    IcpOpcode::Hit => {
                        self.hit = Some((reply.peer, reply.peer_type));
                        true
                    }
                    IcpOpcode::Miss | IcpOpcode::Decho => {
                        if reply.peer_type == PeerType::Parent {
                            self.icp_parent_miss(&reply.peer, icp);
                        }
                        false
                    }
                }
            }
            ProbePayload::Htcp(htcp) => {
                tracing::debug!(
                    peer = reply.peer.host(),
                    hit = htcp.hit,
                    "htcp reply",
                );
                if htcp.hit {
                    self.hit = Some((reply.peer, reply.peer_type));
                    true
                } else {
                    if reply.peer_type == PeerType::Parent {
                        self.htcp_parent_miss(&reply.peer, htcp);
                    }
                    false
                }
            }
        }
    }

    fn icp_parent_miss(&mut self, peer: &Arc<CachePeer>, icp: IcpReplyData) {
        if self.ctx.config.onoff.query_icmp {
            if let Some((rtt, hops)) = icp.src_rtt() {
                if rtt > 0 && rtt < 0xFFFF {
                    self.ctx.netdb.update_peer(
                        &self.request.url,
                        peer,
                        rtt,
                        hops,
                    );
                }
                if rtt > 0
                    && (self.ping.p_rtt == 0 || rtt < self.ping.p_rtt)
                {
                    self.closest_parent_miss = Some(peer.clone());
                    self.ping.p_rtt = rtt;
                }
            }
        }
        self.track_first_parent_miss(peer);
    }

    fn htcp_parent_miss(
        &mut self,
        peer: &Arc<CachePeer>,
        htcp: HtcpReplyData,
    ) {
        if self.ctx.config.onoff.query_icmp && htcp.cto_rtt > 0.0 {
            let rtt = (htcp.cto_rtt * 1000.0) as u32;
            let hops = (htcp.cto_hops * 1000.0) as u32;
            self.ctx
                .netdb
                .update_peer(&self.request.url, peer, rtt, hops);

            if rtt > 0 && (self.ping.p_rtt == 0 || rtt < self.ping.p_rtt)
            {
                self.closest_parent_miss = Some(peer.clone());
                self.ping.p_rtt = rtt;
            }
        }
        self.track_first_parent_miss(peer);
    }

    fn track_first_parent_miss(&mut self, peer: &Arc<CachePeer>) {
        // closest-only parents never compete on proxy-to-parent time
        if peer.config.options.closest_only {
            return;
        }
        // and the weighted track only matters while no closest parent
        // emerged
        if self.closest_parent_miss.is_some() {
            return;
        }

        let elapsed_ms = self
            .ping_opened
            .map(|t| t.elapsed().as_millis() as i64)
            .unwrap_or(0);
        let weighted = (elapsed_ms - peer.config.basetime as i64)
            / peer.config.weight.max(1) as i64;
        let weighted = weighted.max(1) as u32;

        if self.first_parent_miss.is_none() || weighted < self.ping.w_rtt
        {
            self.first_parent_miss = Some(peer.clone());
            self.ping.w_rtt = weighted;
        }
    }

    /// Pick a destination from what the probe window produced.
    fn get_some_neighbor_replies(&mut self) {
        debug_assert_ne!(DirectDisposition::Yes, self.direct);

        if self.check_netdb_direct() {
            self.add_server(None, HierCode::ClosestDirect);
            return;
        }

        if let Some((peer, peer_type)) = self.hit.take() {
            let code = match peer_type {
                PeerType::Parent => HierCode::ParentHit,
                PeerType::Sibling => HierCode::SiblingHit,
            };
            self.add_server(Some(peer), code);
            return;
        }

        if let Some(peer) = self.closest_parent_miss.clone() {
            self.add_server(Some(peer), HierCode::ClosestParentMiss);
        } else if let Some(peer) = self.first_parent_miss.clone() {
            self.add_server(Some(peer), HierCode::FirstParentMiss);
        }
    }

    // --- emission ------------------------------------------------------

    fn get_some_direct(&mut self) {
        if self.direct == DirectDisposition::No {
            return;
        }
        self.add_server(None, HierCode::HierDirect);
    }

    fn get_some_parent(&mut self) {
        if self.direct == DirectDisposition::Yes {
            return;
        }
        for strategy in crate::neighbors::PARENT_STRATEGY_ORDER {
            if let Some(peer) =
                strategy.select(&self.ctx.neighbors, &self.request)
            {
                self.add_server(Some(peer), strategy.hier_code());
                return;
            }
        }
    }

    /// Alive parents as a last resort, then the default parent.
    fn get_all_parents(&mut self) {
        for peer in self.ctx.neighbors.alive_parents(&self.request) {
            self.add_server(Some(peer), HierCode::AnyOldParent);
        }
        if let Some(peer) = self.ctx.neighbors.default_parent(&self.request)
        {
            self.add_server(Some(peer), HierCode::DefaultParent);
        }
    }

    fn add_server(&mut self, peer: Option<Arc<CachePeer>>, code: HierCode) {
        tracing::debug!(
            code = %code,
            peer = peer.as_ref().map(|p| p.host()).unwrap_or("DIRECT"),
            "adding candidate",
        );
        self.servers.push_back(FwdServer { peer, code });
    }

    // --- path resolution ----------------------------------------------

    fn wants_more(&self) -> bool {
        self.found_paths < self.ctx.config.forward_max_tries
    }

    async fn resolve_paths(mut self) {
        while let Some(fs) = self.servers.pop_front() {
            if self.interested().is_none() {
                return self.abort();
            }

            // Intercepted traffic that failed Host verification must
            // go to the address the client actually dialed; resolving
            // the forged Host header would let a hostile page reach
            // origins the browser never agreed to (CVE-2009-0801).
            let is_intercepted = !self.request.flags.redirected
                && (self.request.flags.intercepted
                    || self.request.flags.intercept_tproxy);
            let use_original_dst =
                self.ctx.config.onoff.client_dst_passthru
                    || !self.request.flags.host_verified;
            if is_intercepted
                && use_original_dst
                && fs.code == HierCode::HierDirect
            {
                if let Some(addr) = self.request.client_original_dst {
                    self.handle_path(Destination {
                        addr,
                        peer: None,
                        code: HierCode::OriginalDst,
                    });
                }
                continue;
            }

            if !self.wants_more() {
                // surplus candidates past the path cap
                self.servers.clear();
                break;
            }

            let host = fs
                .peer
                .as_ref()
                .map(|p| p.host().to_string())
                .unwrap_or_else(|| self.request.host().to_string());
            tracing::debug!(host, code = %fs.code, "resolving candidate");

            match self.ctx.resolver.lookup(&host).await {
                Ok(addrs) if !addrs.is_empty() => {
                    for ip in addrs {
                        if !self.wants_more() {
                            break;
                        }
                        if self.skip_for_spoofing(&fs, ip) {
                            continue;
                        }
                        let port = fs
                            .peer
                            .as_ref()
                            .map(|p| p.config.http_port)
                            .unwrap_or_else(|| self.request.port());
                        self.handle_path(Destination {
                            addr: SocketAddr::new(ip, port),
                            peer: fs.peer.clone(),
                            code: fs.code,
                        });
                    }
                }
                _ => {
                    tracing::debug!(host, "unknown host");
                    self.last_error = None;
                    if fs.code == HierCode::HierDirect {
                        self.last_error = Some(ForwardError::new(
                            ForwardErrorKind::DnsFail,
                        ));
                    }
                }
            }
        }

        self.finish();
    }

    /// When spoofing the client address, an address family the client
    /// connection does not speak is unusable.
    fn skip_for_spoofing(
        &self,
        fs: &FwdServer,
        ip: std::net::IpAddr,
    ) -> bool {
        if !self.request.flags.spoof_client_ip {
            return false;
        }
        if fs
            .peer
            .as_ref()
            .map(|p| p.config.options.no_tproxy)
            .unwrap_or(false)
        {
            return false;
        }
        match self.request.client_addr {
            Some(client) => client.is_ipv4() != ip.is_ipv4(),
            None => false,
        }
    }

    fn handle_path(&mut self, path: Destination) {
        self.found_paths += 1;
        self.request.note_ping(self.ping.clone());
        tracing::debug!(
            addr = %path.addr,
            code = %path.code,
            n = self.found_paths,
            "found destination",
        );
        if let Some(initiator) = self.interested() {
            initiator.note_destination(path);
        }
    }

    fn finish(mut self) {
        self.ping.stop = Some(Timestamp::now());
        self.request.note_ping(self.ping.clone());

        if self.last_error.is_some() && self.found_paths > 0 {
            // nobody cares about errors once destinations were found
            self.last_error = None;
        }

        tracing::debug!(
            found = self.found_paths,
            timedout = self.ping.timedout,
            "destination selection finished",
        );

        if let Some(initiator) = self.interested() {
            initiator.note_destinations_end(self.last_error.take());
        }
    }
}

/// Checks never report Dunno as their final answer; treat a misbehaving
/// one as a deny so the state machine cannot spin.
fn settle(answer: AclAnswer) -> AclAnswer {
    match answer {
        AclAnswer::Dunno => AclAnswer::Denied,
        other => other,
    }
}
