use super::*;
use crate::neighbors::Neighbors;
use hiero_api::dns::Resolver;
use hiero_api::http::Method;
use hiero_api::peer::{PeerConfig, PeerOptions, PeerType};
use hiero_api::{BoxFut, HieroResult};
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Default)]
struct MapResolver {
    map: HashMap<String, IpAddr>,
}

impl MapResolver {
    fn with(mut self, host: &str, addr: &str) -> Self {
        self.map.insert(host.into(), addr.parse().unwrap());
        self
    }
}

impl Resolver for MapResolver {
    fn lookup(&self, host: &str) -> BoxFut<'_, HieroResult<Vec<IpAddr>>> {
        let found = self.map.get(host).copied();
        Box::pin(async move { Ok(found.into_iter().collect()) })
    }

    fn cached(&self, host: &str) -> Option<IpAddr> {
        self.map.get(host).copied()
    }
}

fn netdb_with(resolver: MapResolver) -> Arc<NetDb> {
    NetDb::new(NetdbConfig::default(), Arc::new(resolver), None)
}

fn netdb() -> Arc<NetDb> {
    netdb_with(MapResolver::default())
}

fn small_netdb(high: usize, low: usize) -> Arc<NetDb> {
    let config = NetdbConfig {
        high,
        low,
        ..Default::default()
    };
    NetDb::new(config, Arc::new(MapResolver::default()), None)
}

fn parent_config(host: &str) -> PeerConfig {
    PeerConfig {
        host: host.into(),
        http_port: 3128,
        icp_port: 3130,
        peer_type: PeerType::Parent,
        weight: 1,
        basetime: 0,
        options: PeerOptions::default(),
        login: None,
        encrypt_transport: false,
    }
}

fn request(url: &str) -> HttpRequest {
    HttpRequest::new(Method::Get, url::Url::parse(url).unwrap())
}

#[test]
fn networks_are_masked() {
    assert_eq!(
        "10.1.2.0",
        network_from_addr("10.1.2.3".parse().unwrap()).to_string()
    );
    assert_eq!(
        "2001:db8:1:2::",
        network_from_addr("2001:db8:1:2:3:4:5:6".parse().unwrap())
            .to_string()
    );
}

#[test]
fn hosts_in_one_network_share_an_entry() {
    let db = netdb();
    let now = Timestamp::now();
    db.send_ping("a.example", "10.0.0.1".parse().unwrap(), now);
    db.send_ping("b.example", "10.0.0.2".parse().unwrap(), now);

    assert_eq!(1, db.entry_count());
    assert_eq!(2, db.host_count());
    let entry = db.entry_for_host("a.example").unwrap();
    assert_eq!(vec!["b.example", "a.example"], entry.hosts);
    assert!(db.inner.lock().unwrap().link_counts_consistent());
}

#[test]
fn smoothing_uses_window_of_five() {
    let db = netdb();
    let net: IpAddr = "10.0.0.1".parse().unwrap();
    db.send_ping("a.example", net, Timestamp::now());

    db.handle_ping_reply(net, 4, 100);
    let entry = db.entry_for_addr(net).unwrap();
    assert_eq!(100.0, entry.rtt);
    assert_eq!(4.0, entry.hops);

    db.handle_ping_reply(net, 4, 50);
    let entry = db.entry_for_addr(net).unwrap();
    assert_eq!(75.0, entry.rtt);

    // many more replies: the window clamps at 5
    for _ in 0..40 {
        db.handle_ping_reply(net, 4, 50);
    }
    let entry = db.entry_for_addr(net).unwrap();
    assert!((entry.rtt - 50.0).abs() < 0.5);
    assert_eq!(42, entry.pings_recv);
}

#[test]
fn rtt_floor_is_one() {
    let db = netdb();
    let net: IpAddr = "10.0.0.1".parse().unwrap();
    db.send_ping("a.example", net, Timestamp::now());
    db.handle_ping_reply(net, 1, 0);
    assert_eq!(1.0, db.entry_for_addr(net).unwrap().rtt);
}

#[test]
fn replies_for_unknown_networks_are_ignored() {
    let db = netdb();
    db.handle_ping_reply("172.16.0.1".parse().unwrap(), 3, 25);
    assert_eq!(0, db.entry_count());
}

#[test]
fn moved_host_is_relinked() {
    let db = netdb();
    let now = Timestamp::now();
    db.send_ping("mobile.example", "10.0.0.1".parse().unwrap(), now);
    assert_eq!("10.0.0.0", db.entry_for_host("mobile.example").unwrap().network);

    db.send_ping("mobile.example", "192.168.5.9".parse().unwrap(), now);
    let entry = db.entry_for_host("mobile.example").unwrap();
    assert_eq!("192.168.5.0", entry.network);
    assert_eq!(vec!["mobile.example"], entry.hosts);

    // the old entry survives without the host
    let old = db.entry_for_addr("10.0.0.1".parse().unwrap()).unwrap();
    assert!(old.hosts.is_empty());
    assert_eq!(1, db.host_count());
    assert!(db.inner.lock().unwrap().link_counts_consistent());
}

#[test]
fn ping_rearms_on_period() {
    let db = netdb();
    let net: IpAddr = "10.0.0.1".parse().unwrap();
    let now = Timestamp::now();
    db.send_ping("a.example", net, now);
    assert_eq!(1, db.entry_for_addr(net).unwrap().pings_sent);

    // within the period: no new ping
    db.send_ping("a.example", net, now + std::time::Duration::from_secs(1));
    assert_eq!(1, db.entry_for_addr(net).unwrap().pings_sent);

    // after the period: ping again
    db.send_ping(
        "a.example",
        net,
        now + std::time::Duration::from_secs(301),
    );
    assert_eq!(2, db.entry_for_addr(net).unwrap().pings_sent);
}

#[tokio::test]
async fn ping_site_is_a_noop_on_resolution_failure() {
    let db = netdb();
    db.ping_site("unresolvable.example").await;
    assert_eq!(0, db.entry_count());
    assert_eq!(0, db.host_count());
}

#[tokio::test]
async fn ping_site_resolves_and_binds() {
    let db = netdb_with(
        MapResolver::default().with("origin.example", "10.9.8.7"),
    );
    db.ping_site("origin.example").await;
    let entry = db.entry_for_host("origin.example").unwrap();
    assert_eq!("10.9.8.0", entry.network);
    assert_eq!(1, entry.pings_sent);
}

#[test]
fn host_estimates_round_and_default_to_zero() {
    let db = netdb();
    let net: IpAddr = "10.0.0.1".parse().unwrap();
    db.send_ping("a.example", net, Timestamp::now());
    db.handle_ping_reply(net, 4, 100);
    db.handle_ping_reply(net, 5, 101);

    assert_eq!(101, db.host_rtt("a.example")); // 100.5 rounds up
    assert_eq!(5, db.host_hops("a.example")); // 4.5 rounds up
    assert_eq!(0, db.host_rtt("unknown.example"));
    assert_eq!(0, db.host_hops("unknown.example"));
    assert_eq!(Some((2, 101, 5)), db.host_data("a.example"));
    assert_eq!(None, db.host_data("unknown.example"));
}

#[test]
fn update_peer_requires_known_host_and_sorts() {
    let db = netdb();
    let near = CachePeer::new(parent_config("near.example"));
    let far = CachePeer::new(parent_config("far.example"));
    let url = url::Url::parse("http://origin.example/x").unwrap();

    // unknown host: no entry is created
    db.update_peer(&url, &near, 30, 2);
    assert_eq!(0, db.entry_count());

    db.send_ping("origin.example", "10.0.0.1".parse().unwrap(), Timestamp::now());
    db.update_peer(&url, &far, 50, 4);
    db.update_peer(&url, &near, 30, 2);

    let entry = db.entry_for_host("origin.example").unwrap();
    assert_eq!(2, entry.peers.len());
    assert_eq!("near.example", entry.peers[0].peername.as_ref());
    assert_eq!("far.example", entry.peers[1].peername.as_ref());

    // re-measuring an existing slot updates in place
    db.update_peer(&url, &far, 10, 4);
    let entry = db.entry_for_host("origin.example").unwrap();
    assert_eq!("far.example", entry.peers[0].peername.as_ref());
}

#[test]
fn closest_parent_prefers_nearest_usable() {
    let resolver = MapResolver::default();
    let db = netdb_with(resolver);
    let neighbors = Neighbors::new(vec![
        parent_config("near.example"),
        parent_config("far.example"),
    ]);
    let req = request("http://origin.example/x");

    db.send_ping("origin.example", "10.0.0.1".parse().unwrap(), Timestamp::now());
    let url = url::Url::parse("http://origin.example/x").unwrap();
    db.update_peer(&url, &neighbors.peers()[1], 50, 4);
    db.update_peer(&url, &neighbors.peers()[0], 30, 2);

    let chosen = db.closest_parent(&req, &neighbors).unwrap();
    assert_eq!("near.example", chosen.host());

    // a dead nearest parent falls through to the next one
    neighbors.peers()[0].update_stats(|s| s.alive = false);
    let chosen = db.closest_parent(&req, &neighbors).unwrap();
    assert_eq!("far.example", chosen.host());
}

#[test]
fn closest_parent_stops_when_we_are_closer() {
    let db = netdb();
    let neighbors = Neighbors::new(vec![parent_config("far.example")]);
    let req = request("http://origin.example/x");

    let net: IpAddr = "10.0.0.1".parse().unwrap();
    db.send_ping("origin.example", net, Timestamp::now());
    // our own rtt to the origin: 20ms
    db.handle_ping_reply(net, 2, 20);
    let url = url::Url::parse("http://origin.example/x").unwrap();
    db.update_peer(&url, &neighbors.peers()[0], 50, 4);

    assert!(db.closest_parent(&req, &neighbors).is_none());
}

#[test]
fn closest_parent_falls_back_to_cached_address() {
    let resolver =
        MapResolver::default().with("alias.example", "10.0.0.77");
    let db = netdb_with(resolver);
    let neighbors = Neighbors::new(vec![parent_config("near.example")]);

    // the entry is bound to a different hostname in the same network
    db.send_ping("origin.example", "10.0.0.1".parse().unwrap(), Timestamp::now());
    let url = url::Url::parse("http://origin.example/x").unwrap();
    db.update_peer(&url, &neighbors.peers()[0], 30, 2);

    let req = request("http://alias.example/x");
    let chosen = db.closest_parent(&req, &neighbors).unwrap();
    assert_eq!("near.example", chosen.host());
}

#[test]
fn lru_purge_releases_oldest_down_to_low_water() {
    let db = small_netdb(4, 2);
    let base = Timestamp::from_secs(1_000_000);
    for i in 0..5u8 {
        let host = format!("h{i}.example");
        let addr: IpAddr = format!("10.{i}.0.1").parse().unwrap();
        db.send_ping(&host, addr, base + std::time::Duration::from_secs(i as u64));
    }
    assert_eq!(5, db.entry_count());

    // the sixth network overflows the high water mark
    db.send_ping(
        "h5.example",
        "10.5.0.1".parse().unwrap(),
        base + std::time::Duration::from_secs(60),
    );

    // purged down to low, then the new entry was added
    assert_eq!(2, db.entry_count());
    assert!(db.entry_for_host("h5.example").is_some());
    assert!(db.entry_for_host("h0.example").is_none());
    assert!(db.inner.lock().unwrap().link_counts_consistent());
}

#[test]
fn delete_addr_network_unbinds_hosts() {
    let db = netdb();
    db.send_ping("a.example", "10.0.0.1".parse().unwrap(), Timestamp::now());
    db.delete_addr_network("10.0.0.200".parse().unwrap());
    assert_eq!(0, db.entry_count());
    assert_eq!(0, db.host_count());
}

#[test]
fn save_then_reload_round_trips_measured_entries() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("netdb.state");

    let db = netdb();
    let measured: IpAddr = "10.0.0.1".parse().unwrap();
    let now = Timestamp::from_secs(1_700_000_000);
    db.send_ping("origin.example", measured, now);
    db.send_ping("alias.example", "10.0.0.2".parse().unwrap(), now);
    for _ in 0..3 {
        db.handle_ping_reply(measured, 3, 42);
    }
    // an unmeasured network must not be persisted
    db.send_ping("quiet.example", "10.7.0.1".parse().unwrap(), now);

    assert_eq!(1, db.save_state_to(&path).unwrap());

    let restored = netdb();
    assert_eq!(1, restored.reload_state_from(&path));

    let entry = restored.entry_for_host("origin.example").unwrap();
    let original = db.entry_for_host("origin.example").unwrap();
    assert_eq!(original.network, entry.network);
    assert_eq!(original.next_ping_time.as_secs(), entry.next_ping_time.as_secs());
    assert_eq!(original.last_use_time.as_secs(), entry.last_use_time.as_secs());
    assert!((original.rtt - entry.rtt).abs() < 0.001);
    assert!((original.hops - entry.hops).abs() < 0.001);
    // reloaded history carries low weight
    assert_eq!(1, entry.pings_sent);
    assert_eq!(1, entry.pings_recv);
    assert_eq!(2, restored.host_count());
    assert!(restored.entry_for_host("quiet.example").is_none());
}

#[test]
fn reload_skips_malformed_and_duplicate_lines() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("netdb.state");
    std::fs::write(
        &path,
        "not-an-address 1 1 3.0 42.0 0 0 a.example\n\
         10.0.0.0 5 0 3.0 42.0 0 0 b.example\n\
         10.0.0.0 5 4 3.00000 42.00000 100 200 c.example\n\
         10.0.0.0 9 9 9.0 99.0 0 0 dup.example\n\
         10.1.0.0 2 2\n",
    )
    .unwrap();

    let db = netdb();
    assert_eq!(1, db.reload_state_from(&path));
    let entry = db.entry_for_host("c.example").unwrap();
    assert_eq!(42.0, entry.rtt);
    assert_eq!(100, entry.next_ping_time.as_secs());
    assert!(db.entry_for_host("dup.example").is_none());
}

#[test]
fn reload_ignores_missing_file() {
    let db = netdb();
    assert_eq!(
        0,
        db.reload_state_from(Path::new("/nonexistent/netdb.state"))
    );
}

#[test]
fn disabled_persistence_writes_nothing() {
    let config = NetdbConfig {
        filename: "none".into(),
        ..Default::default()
    };
    let db = NetDb::new(config, Arc::new(MapResolver::default()), None);
    db.send_ping("a.example", "10.0.0.1".parse().unwrap(), Timestamp::now());
    db.handle_ping_reply("10.0.0.1".parse().unwrap(), 1, 10);
    assert_eq!(0, db.save_state().unwrap());
}

#[test]
fn dump_lists_entries_and_peers() {
    let db = netdb();
    let net: IpAddr = "10.0.0.1".parse().unwrap();
    db.send_ping("origin.example", net, Timestamp::now());
    db.handle_ping_reply(net, 3, 42);
    let peer = CachePeer::new(parent_config("parent.example"));
    let url = url::Url::parse("http://origin.example/x").unwrap();
    db.update_peer(&url, &peer, 30, 2);

    let dump = db.dump();
    assert!(dump.starts_with("Network DB Statistics:"));
    assert!(dump.contains("10.0.0.0"));
    assert!(dump.contains("origin.example"));
    assert!(dump.contains("parent.example"));
}
