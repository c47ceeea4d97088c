//! Parallel ICP/HTCP neighbor probing.
//!
//! On a miss the selector may ask every probeable neighbor whether it
//! holds the object. Queries go out through the probe transport seam;
//! decoded replies stream back to the selector, which accounts for
//! them against the expected count until the window closes.

use crate::neighbors::Neighbors;
use hiero_api::config::ProbeConfig;
use hiero_api::http::HttpRequest;
use hiero_api::probe::{DynProbeTransport, ProbeReply};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// The outcome of starting one probe broadcast.
#[derive(Debug)]
pub struct PingStarted {
    /// Queries actually sent.
    pub n_sent: usize,
    /// Replies the selector should wait for.
    pub n_replies_expected: usize,
    /// The reply window.
    pub timeout: Duration,
    /// Decoded replies as they arrive.
    pub replies: mpsc::Receiver<ProbeReply>,
}

/// Broadcasts probe queries for one proxy instance.
#[derive(Debug)]
pub struct Prober {
    neighbors: Arc<Neighbors>,
    transport: DynProbeTransport,
    config: ProbeConfig,
}

impl Prober {
    /// Construct a prober over the given registry and transport.
    pub fn new(
        neighbors: Arc<Neighbors>,
        transport: DynProbeTransport,
        config: ProbeConfig,
    ) -> Self {
        Self {
            neighbors,
            transport,
            config,
        }
    }

    /// How many neighbors a broadcast for this request would query.
    pub fn eligible_count(&self, request: &HttpRequest) -> usize {
        self.neighbors.probeable(request).len()
    }

    /// Query all probeable neighbors in parallel. Returns `None` when
    /// there is nobody to ask or the transport refused the broadcast.
    pub async fn ping(
        &self,
        request: &HttpRequest,
    ) -> Option<PingStarted> {
        let peers = self.neighbors.probeable(request);
        if peers.is_empty() {
            return None;
        }

        let (tx, rx) = mpsc::channel(peers.len().max(1));
        let n_sent =
            match self.transport.broadcast(&peers, request, tx).await {
                Ok(n) => n,
                Err(err) => {
                    tracing::warn!(?err, "probe broadcast failed");
                    return None;
                }
            };
        if n_sent == 0 {
            tracing::warn!("probe broadcast sent no queries");
        }

        Some(PingStarted {
            n_sent,
            n_replies_expected: n_sent,
            timeout: self.query_timeout(&peers),
            replies: rx,
        })
    }

    /// The reply window: the configured fixed value, or double the
    /// mean measured neighbor RTT clamped to the configured bounds.
    fn query_timeout(
        &self,
        peers: &[Arc<hiero_api::peer::CachePeer>],
    ) -> Duration {
        if self.config.query_timeout_ms != 0 {
            return Duration::from_millis(
                self.config.query_timeout_ms as u64,
            );
        }

        let measured: Vec<u32> = peers
            .iter()
            .map(|p| p.stats().probe_rtt_ms)
            .filter(|&rtt| rtt > 0)
            .collect();
        if measured.is_empty() {
            return Duration::from_millis(
                self.config.max_timeout_ms as u64,
            );
        }

        let mean = measured.iter().sum::<u32>() / measured.len() as u32;
        let window = (2 * mean)
            .clamp(self.config.min_timeout_ms, self.config.max_timeout_ms);
        Duration::from_millis(window as u64)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use hiero_api::http::Method;
    use hiero_api::peer::{
        CachePeer, PeerConfig, PeerOptions, PeerType,
    };
    use hiero_api::probe::{
        IcpOpcode, IcpReplyData, ProbePayload, ProbeTransport,
    };
    use hiero_api::{BoxFut, HieroResult};
    use std::sync::Mutex;

    fn peer_config(host: &str) -> PeerConfig {
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

    fn request() -> HttpRequest {
        HttpRequest::new(
            Method::Get,
            url::Url::parse("http://origin.example/x").unwrap(),
        )
    }

    /// Echoes one MISS per queried peer, remembering who was asked.
    #[derive(Debug, Default)]
    struct EchoTransport {
        asked: Mutex<Vec<String>>,
    }

    impl ProbeTransport for EchoTransport {
        fn broadcast(
            &self,
            peers: &[Arc<CachePeer>],
            _request: &HttpRequest,
            replies: mpsc::Sender<ProbeReply>,
        ) -> BoxFut<'_, HieroResult<usize>> {
            let peers = peers.to_vec();
            Box::pin(async move {
                for peer in &peers {
                    self.asked
                        .lock()
                        .unwrap()
                        .push(peer.host().to_string());
                    let _ = replies
                        .send(ProbeReply {
                            peer: peer.clone(),
                            peer_type: peer.config.peer_type,
                            payload: ProbePayload::Icp(IcpReplyData {
                                opcode: IcpOpcode::Miss,
                                flags: 0,
                                pad: 0,
                            }),
                        })
                        .await;
                }
                Ok(peers.len())
            })
        }
    }

    #[tokio::test]
    async fn broadcast_reaches_all_probeable_peers() {
        let mut quiet = peer_config("quiet.example");
        quiet.options.no_query = true;
        let neighbors = Neighbors::new(vec![
            peer_config("p1.example"),
            peer_config("p2.example"),
            quiet,
        ]);
        let transport = Arc::new(EchoTransport::default());
        let prober = Prober::new(
            neighbors,
            transport.clone(),
            ProbeConfig::default(),
        );

        let req = request();
        assert_eq!(2, prober.eligible_count(&req));
        let mut started = prober.ping(&req).await.unwrap();
        assert_eq!(2, started.n_sent);
        assert_eq!(2, started.n_replies_expected);

        let mut received = 0;
        while started.replies.recv().await.is_some() {
            received += 1;
        }
        assert_eq!(2, received);
        assert_eq!(
            vec!["p1.example".to_string(), "p2.example".to_string()],
            *transport.asked.lock().unwrap(),
        );
    }

    #[tokio::test]
    async fn no_probeable_peers_means_no_ping() {
        let neighbors = Neighbors::new(vec![]);
        let prober = Prober::new(
            neighbors,
            Arc::new(EchoTransport::default()),
            ProbeConfig::default(),
        );
        assert!(prober.ping(&request()).await.is_none());
    }

    #[tokio::test]
    async fn fixed_timeout_wins_over_measurements() {
        let neighbors = Neighbors::new(vec![peer_config("p1.example")]);
        neighbors.peers()[0].update_stats(|s| s.probe_rtt_ms = 40);
        let config = ProbeConfig {
            query_timeout_ms: 150,
            ..Default::default()
        };
        let prober = Prober::new(
            neighbors,
            Arc::new(EchoTransport::default()),
            config,
        );

        let started = prober.ping(&request()).await.unwrap();
        assert_eq!(Duration::from_millis(150), started.timeout);
    }

    #[tokio::test]
    async fn computed_timeout_doubles_mean_rtt_with_clamps() {
        let neighbors = Neighbors::new(vec![
            peer_config("p1.example"),
            peer_config("p2.example"),
        ]);
        neighbors.peers()[0].update_stats(|s| s.probe_rtt_ms = 30);
        neighbors.peers()[1].update_stats(|s| s.probe_rtt_ms = 50);
        let prober = Prober::new(
            neighbors.clone(),
            Arc::new(EchoTransport::default()),
            ProbeConfig::default(),
        );
        let started = prober.ping(&request()).await.unwrap();
        assert_eq!(Duration::from_millis(80), started.timeout);

        // unmeasured peers fall back to the upper clamp
        neighbors.peers()[0].update_stats(|s| s.probe_rtt_ms = 0);
        neighbors.peers()[1].update_stats(|s| s.probe_rtt_ms = 0);
        let started = prober.ping(&request()).await.unwrap();
        assert_eq!(Duration::from_millis(2000), started.timeout);
    }
}
