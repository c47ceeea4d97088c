//! The Network Measurement Database.
//!
//! Aggregates ICMP round-trip and hop measurements per IP network
//! (IPv4 /24, IPv6 /64), remembers which hostnames resolved into each
//! network, and keeps per-peer measurements so the selector can pick
//! the parent closest to an origin. State survives restarts through a
//! text file ([persist]) and is exchanged with sibling caches over a
//! binary record stream ([exchange]).

use crate::neighbors::Neighbors;
use hiero_api::config::NetdbConfig;
use hiero_api::dns::DynResolver;
use hiero_api::http::HttpRequest;
use hiero_api::icmp::DynPinger;
use hiero_api::peer::CachePeer;
use hiero_api::Timestamp;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};

pub mod exchange;
pub mod persist;

/// Measurements a peer reported for one network.
#[derive(Debug, Clone)]
pub struct NetdbPeer {
    /// Interned peer hostname. Names are interned once and never
    /// freed, so this pointer stays stable across reconfigures.
    pub peername: Arc<str>,
    /// The peer's RTT to the network, milliseconds.
    pub rtt: f64,
    /// The peer's hop count to the network.
    pub hops: f64,
    /// Soft expiry hint; slots are only dropped on peer departure or
    /// network eviction.
    pub expires: Timestamp,
}

/// Aggregated measurements for one network.
#[derive(Debug, Clone)]
pub struct NetdbEntry {
    /// The network address string (the map key).
    pub network: String,
    /// Echo requests sent.
    pub pings_sent: u32,
    /// Echo replies received.
    pub pings_recv: u32,
    /// Smoothed hop count.
    pub hops: f64,
    /// Smoothed round-trip time, milliseconds.
    pub rtt: f64,
    /// Do not ping this network again before this time.
    pub next_ping_time: Timestamp,
    /// Recency for LRU eviction.
    pub last_use_time: Timestamp,
    /// Hostnames currently resolved into this network, newest first.
    pub hosts: Vec<String>,
    /// Per-peer measurements, ascending by RTT.
    pub peers: Vec<NetdbPeer>,
}

impl NetdbEntry {
    fn new(network: String, now: Timestamp) -> Self {
        Self {
            network,
            pings_sent: 0,
            pings_recv: 0,
            hops: 0.0,
            rtt: 0.0,
            next_ping_time: Timestamp::from_secs(0),
            last_use_time: now,
            hosts: Vec::new(),
            peers: Vec::new(),
        }
    }
}

/// Mask an address down to its measurement network.
pub fn network_from_addr(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            IpAddr::from([o[0], o[1], o[2], 0])
        }
        IpAddr::V6(v6) => {
            // the /64 routing part
            let o = v6.octets();
            let mut masked = [0u8; 16];
            masked[..8].copy_from_slice(&o[..8]);
            IpAddr::from(masked)
        }
    }
}

fn network_key(addr: IpAddr) -> String {
    network_from_addr(addr).to_string()
}

#[derive(Debug, Default)]
pub(crate) struct Inner {
    entries: HashMap<String, NetdbEntry>,
    hosts: HashMap<String, String>,
    peer_names: Vec<Arc<str>>,
}

/// The measurement database for one proxy instance.
#[derive(Debug)]
pub struct NetDb {
    pub(crate) config: NetdbConfig,
    resolver: DynResolver,
    pinger: Option<DynPinger>,
    pub(crate) inner: Mutex<Inner>,
}

impl NetDb {
    /// Construct an empty database.
    pub fn new(
        config: NetdbConfig,
        resolver: DynResolver,
        pinger: Option<DynPinger>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            resolver,
            pinger,
            inner: Mutex::new(Inner::default()),
        })
    }

    /// Number of networks currently tracked.
    pub fn entry_count(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    /// Number of hostnames currently bound to a network.
    pub fn host_count(&self) -> usize {
        self.inner.lock().unwrap().hosts.len()
    }

    /// Clone the entry tracking `addr`'s network, if any.
    pub fn entry_for_addr(&self, addr: IpAddr) -> Option<NetdbEntry> {
        self.inner
            .lock()
            .unwrap()
            .entries
            .get(&network_key(addr))
            .cloned()
    }

    /// Clone the entry the hostname is bound to, if any.
    pub fn entry_for_host(&self, host: &str) -> Option<NetdbEntry> {
        let inner = self.inner.lock().unwrap();
        inner
            .hosts
            .get(host)
            .and_then(|key| inner.entries.get(key))
            .cloned()
    }

    /// Consider pinging the network `hostname` resolves into.
    ///
    /// A resolution failure makes no state changes. A hostname that
    /// moved to a different network since the last resolution is
    /// relinked atomically.
    pub async fn ping_site(&self, hostname: &str) {
        {
            let inner = self.inner.lock().unwrap();
            if let Some(entry) = inner
                .hosts
                .get(hostname)
                .and_then(|key| inner.entries.get(key))
            {
                if entry.next_ping_time > Timestamp::now() {
                    return;
                }
            }
        }

        let addr = match self.resolver.lookup(hostname).await {
            Ok(addrs) => match addrs.first() {
                Some(addr) => *addr,
                None => return,
            },
            Err(err) => {
                tracing::debug!(hostname, ?err, "ping skipped, no address");
                return;
            }
        };

        self.send_ping(hostname, addr, Timestamp::now());
    }

    pub(crate) fn send_ping(
        &self,
        hostname: &str,
        addr: IpAddr,
        now: Timestamp,
    ) {
        let mut inner = self.inner.lock().unwrap();
        let key = inner.bind_host(
            hostname,
            addr,
            now,
            self.config.high,
            self.config.low,
        );

        let entry = inner.entries.get_mut(&key).expect("entry just bound");
        if entry.next_ping_time <= now {
            tracing::debug!(hostname, network = %entry.network, "pinging");
            if let Some(pinger) = &self.pinger {
                pinger.domain_ping(addr, hostname);
            }
            entry.pings_sent += 1;
            entry.next_ping_time = now + self.config.period();
            entry.last_use_time = now;
        }
    }

    /// Fold one echo reply into the network the reply came from.
    /// Replies for unknown networks are ignored.
    pub fn handle_ping_reply(&self, from: IpAddr, hops: i32, rtt_ms: i32) {
        let mut inner = self.inner.lock().unwrap();
        let Some(entry) = inner.entries.get_mut(&network_key(from)) else {
            return;
        };

        entry.pings_recv += 1;
        let n = entry.pings_recv.min(5) as f64;
        let rtt = rtt_ms.max(1) as f64;

        entry.hops = (entry.hops * (n - 1.0) + hops as f64) / n;
        entry.rtt = (entry.rtt * (n - 1.0) + rtt) / n;

        tracing::debug!(
            network = %entry.network,
            rtt = entry.rtt,
            hops = entry.hops,
            "ping reply folded in",
        );
    }

    /// Integer RTT estimate for a host, 0 when unknown.
    pub fn host_rtt(&self, host: &str) -> u32 {
        self.touch_host(host)
            .map(|e| (e.rtt + 0.5) as u32)
            .unwrap_or(0)
    }

    /// Integer hop estimate for a host, 0 when unknown.
    pub fn host_hops(&self, host: &str) -> u32 {
        self.touch_host(host)
            .map(|e| (e.hops + 0.5) as u32)
            .unwrap_or(0)
    }

    /// Bulk accessor: (samples, rtt, hops) for a host.
    pub fn host_data(&self, host: &str) -> Option<(u32, u32, u32)> {
        self.touch_host(host)
            .map(|e| (e.pings_recv, (e.rtt + 0.5) as u32, (e.hops + 0.5) as u32))
    }

    fn touch_host(&self, host: &str) -> Option<NetdbEntry> {
        let mut inner = self.inner.lock().unwrap();
        let key = inner.hosts.get(host)?.clone();
        let entry = inner.entries.get_mut(&key)?;
        entry.last_use_time = Timestamp::now();
        Some(entry.clone())
    }

    /// Record a peer's own measurement of the network behind a request
    /// URL, as announced in a probe reply. Unknown hosts are ignored.
    pub fn update_peer(
        &self,
        url: &url::Url,
        peer: &CachePeer,
        rtt_ms: u32,
        hops: u32,
    ) {
        let Some(host) = url.host_str() else { return };
        let mut inner = self.inner.lock().unwrap();
        let Some(key) = inner.hosts.get(host).cloned() else {
            tracing::debug!(host, "peer measurement for unknown host");
            return;
        };
        inner.record_peer_measurement(
            &key,
            peer.host(),
            rtt_ms as f64,
            hops as f64,
            Timestamp::now(),
        );
    }

    /// Record a peer measurement learned through the binary exchange.
    /// Creates the network entry when needed; only IPv4 networks are
    /// ever exchanged.
    pub fn update_peer_from_exchange(
        &self,
        addr: IpAddr,
        peer: &CachePeer,
        rtt_ms: f64,
        hops: f64,
    ) {
        if !addr.is_ipv4() {
            tracing::debug!(%addr, "exchange update skipped, not IPv4");
            return;
        }
        let now = Timestamp::now();
        let mut inner = self.inner.lock().unwrap();
        let key = inner.find_or_add(
            addr,
            now,
            self.config.high,
            self.config.low,
        );
        inner.record_peer_measurement(&key, peer.host(), rtt_ms, hops, now);
    }

    /// The usable parent measured closest to the request's origin.
    ///
    /// Walks the entry's peer measurements in ascending-RTT order and
    /// stops as soon as our own RTT to the origin beats the remaining
    /// peers.
    pub fn closest_parent(
        &self,
        request: &HttpRequest,
        neighbors: &Neighbors,
    ) -> Option<Arc<CachePeer>> {
        let host = request.host();
        let candidates = {
            let mut inner = self.inner.lock().unwrap();
            let key = match inner.hosts.get(host).cloned() {
                Some(key) => Some(key),
                None => self
                    .resolver
                    .cached(host)
                    .map(network_key)
                    .filter(|key| inner.entries.contains_key(key)),
            }?;
            let entry = inner.entries.get_mut(&key)?;
            if entry.peers.is_empty() {
                return None;
            }
            entry.last_use_time = Timestamp::now();

            let own_rtt = entry.rtt;
            entry
                .peers
                .iter()
                .take_while(|p| !(own_rtt > 0.0 && own_rtt < p.rtt))
                .map(|p| p.peername.clone())
                .collect::<Vec<_>>()
        };

        candidates.iter().find_map(|name| {
            neighbors.find_usable_parent_at(name, request)
        })
    }

    /// Drop the entry tracking `addr`'s network, unbinding its hosts.
    pub fn delete_addr_network(&self, addr: IpAddr) {
        let mut inner = self.inner.lock().unwrap();
        let key = network_key(addr);
        tracing::debug!(network = %key, "releasing network entry");
        inner.release(&key);
    }

    /// Render the database for the cache manager, sorted by RTT.
    pub fn dump(&self) -> String {
        use std::fmt::Write;

        let inner = self.inner.lock().unwrap();
        let mut list: Vec<&NetdbEntry> = inner.entries.values().collect();
        list.sort_by(|a, b| a.rtt.total_cmp(&b.rtt));

        let mut out = String::new();
        out.push_str("Network DB Statistics:\n");
        let _ = writeln!(
            out,
            "{:<46} {:>9} {:>7} {:>5} {}",
            "Network", "recv/sent", "RTT", "Hops", "Hostnames",
        );
        for entry in list {
            let _ = write!(
                out,
                "{:<46} {:>4}/{:<4} {:7.1} {:5.1}",
                entry.network,
                entry.pings_recv,
                entry.pings_sent,
                entry.rtt,
                entry.hops,
            );
            for host in &entry.hosts {
                let _ = write!(out, " {host}");
            }
            out.push('\n');
            for peer in &entry.peers {
                let _ = writeln!(
                    out,
                    "    {:<22} {:7.1} {:5.1}",
                    peer.peername, peer.rtt, peer.hops,
                );
            }
        }
        out
    }
}

impl Inner {
    fn find_or_add(
        &mut self,
        addr: IpAddr,
        now: Timestamp,
        high: usize,
        low: usize,
    ) -> String {
        if self.entries.len() > high {
            self.purge_lru(low);
        }
        let key = network_key(addr);
        self.entries
            .entry(key.clone())
            .or_insert_with(|| NetdbEntry::new(key.clone(), now));
        key
    }

    /// Bind a hostname to the network of its freshly resolved address,
    /// relinking when the host moved networks. Returns the network key.
    fn bind_host(
        &mut self,
        hostname: &str,
        addr: IpAddr,
        now: Timestamp,
        high: usize,
        low: usize,
    ) -> String {
        let new_key = network_key(addr);
        match self.hosts.get(hostname).cloned() {
            None => {
                let key = self.find_or_add(addr, now, high, low);
                let entry = self.entries.get_mut(&key).expect("just added");
                entry.hosts.insert(0, hostname.to_string());
                self.hosts.insert(hostname.to_string(), key.clone());
                key
            }
            Some(old_key) if old_key != new_key => {
                tracing::debug!(
                    hostname,
                    from = %old_key,
                    to = %new_key,
                    "hostname moved networks",
                );
                let key = self.find_or_add(addr, now, high, low);
                if let Some(old) = self.entries.get_mut(&old_key) {
                    old.hosts.retain(|h| h != hostname);
                }
                let entry = self.entries.get_mut(&key).expect("just added");
                entry.hosts.insert(0, hostname.to_string());
                self.hosts.insert(hostname.to_string(), key.clone());
                key
            }
            Some(key) => key,
        }
    }

    fn intern_peer_name(&mut self, name: &str) -> Arc<str> {
        if let Some(existing) =
            self.peer_names.iter().find(|n| n.as_ref() == name)
        {
            return existing.clone();
        }
        let interned: Arc<str> = name.into();
        self.peer_names.push(interned.clone());
        interned
    }

    fn record_peer_measurement(
        &mut self,
        key: &str,
        peer_host: &str,
        rtt: f64,
        hops: f64,
        now: Timestamp,
    ) {
        let interned = self.intern_peer_name(peer_host);
        let entry = match self.entries.get_mut(key) {
            Some(entry) => entry,
            None => return,
        };

        let slot = match entry
            .peers
            .iter_mut()
            .find(|p| p.peername.as_ref() == peer_host)
        {
            Some(slot) => slot,
            None => {
                entry.peers.push(NetdbPeer {
                    peername: interned,
                    rtt: 0.0,
                    hops: 0.0,
                    expires: now,
                });
                entry.peers.last_mut().expect("just pushed")
            }
        };

        slot.rtt = rtt;
        slot.hops = hops;
        slot.expires = now + std::time::Duration::from_secs(3600);

        if entry.peers.len() >= 2 {
            entry.peers.sort_by(|a, b| a.rtt.total_cmp(&b.rtt));
        }
    }

    fn release(&mut self, key: &str) {
        if let Some(entry) = self.entries.remove(key) {
            for host in &entry.hosts {
                self.hosts.remove(host);
            }
        }
    }

    fn purge_lru(&mut self, low: usize) {
        let mut keys: Vec<(Timestamp, String)> = self
            .entries
            .values()
            .map(|e| (e.last_use_time, e.network.clone()))
            .collect();
        keys.sort();

        for (_, key) in keys {
            if self.entries.len() < low {
                break;
            }
            self.release(&key);
        }
    }

    #[cfg(test)]
    pub(crate) fn link_counts_consistent(&self) -> bool {
        let linked: usize =
            self.entries.values().map(|e| e.hosts.len()).sum();
        linked == self.hosts.len()
    }
}

#[cfg(test)]
mod test;
