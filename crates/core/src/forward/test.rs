use super::*;
use crate::context::ContextOptions;
use hiero_api::acl::{AclAnswer, ConstAclCheck};
use hiero_api::adaptation::{
    AccessCheck, AdaptationAnswer, AdaptationService, ServiceGroup,
};
use hiero_api::body_pipe::{BodyPipe, ConsumerEvent, ProducerEvent};
use hiero_api::comm::{
    CommFlag, CommIoParams, Connector, ServerConnection,
};
use hiero_api::dns::Resolver;
use hiero_api::http::{HttpReply, Method};
use hiero_api::store::Purger;
use hiero_api::{BoxFut, CoreConfig, HieroError, HieroResult};
use bytes::Bytes;
use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::atomic::AtomicUsize;
use url::Url;

#[derive(Debug, Default)]
struct MapResolver {
    map: HashMap<String, Vec<IpAddr>>,
}

impl MapResolver {
    fn with(mut self, host: &str, addrs: &[&str]) -> Self {
        self.map.insert(
            host.into(),
            addrs.iter().map(|a| a.parse().unwrap()).collect(),
        );
        self
    }
}

impl Resolver for MapResolver {
    fn lookup(&self, host: &str) -> BoxFut<'_, HieroResult<Vec<IpAddr>>> {
        let found = self.map.get(host).cloned().unwrap_or_default();
        Box::pin(async move { Ok(found) })
    }
}

/// One upstream conversation, fully scripted.
#[derive(Debug)]
struct ScriptedConnection {
    reply: Mutex<Option<HieroResult<Arc<HttpReply>>>>,
    body: Mutex<VecDeque<Bytes>>,
    writes: Mutex<Vec<Bytes>>,
    write_results: Mutex<VecDeque<CommIoParams>>,
    closes: AtomicUsize,
    closing: AtomicBool,
}

impl ScriptedConnection {
    fn new(reply: Arc<HttpReply>, body: Vec<Bytes>) -> Arc<Self> {
        Arc::new(Self {
            reply: Mutex::new(Some(Ok(reply))),
            body: Mutex::new(body.into()),
            writes: Mutex::new(Vec::new()),
            write_results: Mutex::new(VecDeque::new()),
            closes: AtomicUsize::new(0),
            closing: AtomicBool::new(false),
        })
    }

    fn failing_write_on(
        self: Arc<Self>,
        nth: usize,
        errno: i32,
    ) -> Arc<Self> {
        let mut results = self.write_results.lock().unwrap();
        for _ in 0..nth {
            results.push_back(CommIoParams::default());
        }
        results.push_back(CommIoParams {
            size: 0,
            flag: CommFlag::Err(errno),
        });
        drop(results);
        self
    }

    fn write_count(&self) -> usize {
        self.writes.lock().unwrap().len()
    }

    fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

impl ServerConnection for ScriptedConnection {
    fn write(&self, data: Bytes) -> BoxFut<'_, CommIoParams> {
        let size = data.len();
        self.writes.lock().unwrap().push(data);
        let scripted = self.write_results.lock().unwrap().pop_front();
        Box::pin(async move {
            scripted.unwrap_or(CommIoParams {
                size,
                flag: CommFlag::Ok,
            })
        })
    }

    fn read_reply_head(&self) -> BoxFut<'_, HieroResult<Arc<HttpReply>>> {
        let reply = self
            .reply
            .lock()
            .unwrap()
            .take()
            .unwrap_or_else(|| Err(HieroError::other("no reply scripted")));
        Box::pin(async move { reply })
    }

    fn read_body(
        &self,
        max: usize,
    ) -> BoxFut<'_, (Bytes, CommIoParams)> {
        let mut body = self.body.lock().unwrap();
        let chunk = match body.pop_front() {
            Some(mut chunk) => {
                if chunk.len() > max {
                    let rest = chunk.split_off(max);
                    body.push_front(rest);
                }
                chunk
            }
            None => Bytes::new(),
        };
        drop(body);
        Box::pin(async move {
            let size = chunk.len();
            (
                chunk,
                CommIoParams {
                    size,
                    flag: CommFlag::Ok,
                },
            )
        })
    }

    fn close(&self) -> BoxFut<'_, ()> {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.closing.store(true, Ordering::SeqCst);
        Box::pin(async {})
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }
}

/// Hands out scripted connections in order; refuses once empty.
#[derive(Debug)]
struct ScriptedConnector {
    conns: Mutex<VecDeque<Arc<ScriptedConnection>>>,
}

impl ScriptedConnector {
    fn new(conns: Vec<Arc<ScriptedConnection>>) -> Arc<Self> {
        Arc::new(Self {
            conns: Mutex::new(conns.into()),
        })
    }
}

impl Connector for ScriptedConnector {
    fn connect(
        &self,
        _dest: &Destination,
    ) -> BoxFut<'_, HieroResult<hiero_api::comm::DynServerConnection>>
    {
        let conn = self.conns.lock().unwrap().pop_front();
        Box::pin(async move {
            match conn {
                Some(conn) => {
                    Ok(conn as hiero_api::comm::DynServerConnection)
                }
                None => Err(HieroError::other("connection refused")),
            }
        })
    }
}

#[derive(Debug)]
struct AlwaysAdapt;

impl AccessCheck for AlwaysAdapt {
    fn start(
        &self,
        _request: &HttpRequest,
        _virgin_reply: &HttpReply,
    ) -> BoxFut<'_, Option<ServiceGroup>> {
        Box::pin(async {
            Some(ServiceGroup {
                name: "respmod".into(),
            })
        })
    }
}

#[derive(Debug)]
struct NeverAdapt;

impl AccessCheck for NeverAdapt {
    fn start(
        &self,
        _request: &HttpRequest,
        _virgin_reply: &HttpReply,
    ) -> BoxFut<'_, Option<ServiceGroup>> {
        Box::pin(async { None })
    }
}

/// Denies every response with a custom deny-info page.
#[derive(Debug)]
struct BlockingService;

impl AdaptationService for BlockingService {
    fn adapt(
        &self,
        _group: ServiceGroup,
        _request: Arc<HttpRequest>,
        _virgin_reply: Arc<HttpReply>,
        virgin_body: Option<Arc<BodyPipe>>,
    ) -> BoxFut<'static, AdaptationAnswer> {
        Box::pin(async move {
            if let Some(pipe) = virgin_body {
                pipe.expect_no_consumption();
            }
            AdaptationAnswer::Block {
                page_id: Some("ERR_CUSTOM".into()),
            }
        })
    }
}

/// Re-emits the virgin body uppercased through an adapted reply.
#[derive(Debug)]
struct UppercaseService;

impl AdaptationService for UppercaseService {
    fn adapt(
        &self,
        _group: ServiceGroup,
        _request: Arc<HttpRequest>,
        _virgin_reply: Arc<HttpReply>,
        virgin_body: Option<Arc<BodyPipe>>,
    ) -> BoxFut<'static, AdaptationAnswer> {
        Box::pin(async move {
            let reply = Arc::new(HttpReply::new(200));
            let out = Arc::new(BodyPipe::new());
            reply.set_body_pipe(out.clone());

            tokio::spawn(async move {
                let mut collected = Vec::new();
                if let Some(virgin) = virgin_body {
                    assert!(virgin.attach_consumer_if_not_late());
                    loop {
                        match virgin.next_data_event().await {
                            ConsumerEvent::Data => {
                                let chunk = virgin.content();
                                virgin.consume(chunk.len());
                                collected.extend_from_slice(&chunk);
                            }
                            ConsumerEvent::Ended => break,
                            ConsumerEvent::ProducerAborted => {
                                out.abort_production();
                                return;
                            }
                        }
                    }
                }

                let mut adapted = collected.to_ascii_uppercase();
                while !adapted.is_empty() {
                    let taken = out.put_more_data(&adapted);
                    adapted.drain(..taken);
                    if !adapted.is_empty() {
                        if out.next_space_event().await
                            == ProducerEvent::ConsumerAborted
                        {
                            return;
                        }
                    }
                }
                out.stop_producing(true);
            });

            AdaptationAnswer::Forward(reply)
        })
    }
}

#[derive(Debug, Default)]
struct RecordingPurger {
    urls: Mutex<Vec<String>>,
}

impl Purger for RecordingPurger {
    fn purge(&self, url: &str) {
        self.urls.lock().unwrap().push(url.to_string());
    }
}

fn context(
    conns: Vec<Arc<ScriptedConnection>>,
    options: ContextOptions,
    config: CoreConfig,
) -> Arc<CoreContext> {
    let mut options = options;
    if options.always_direct.is_none() {
        options.always_direct =
            Some(Arc::new(ConstAclCheck(AclAnswer::Allowed)));
    }
    CoreContext::with_options(
        config,
        vec![],
        Arc::new(
            MapResolver::default()
                .with("origin.example", &["198.51.100.10"]),
        ),
        ScriptedConnector::new(conns),
        None,
        options,
    )
}

fn get_request(url: &str) -> Arc<HttpRequest> {
    Arc::new(HttpRequest::new(Method::Get, Url::parse(url).unwrap()))
}

fn reply_with_body(status: u16, size: u64) -> Arc<HttpReply> {
    let mut reply = HttpReply::new(status);
    reply.body_size = Some(size);
    Arc::new(reply)
}

#[tokio::test(start_paused = true)]
async fn direct_miss_stores_whole_reply() {
    let conn =
        ScriptedConnection::new(
        reply_with_body(200, 5),
        vec![Bytes::from_static(b"hello")],
    );
    let ctx = context(
        vec![conn.clone()],
        ContextOptions::default(),
        CoreConfig::default(),
    );

    let request = get_request("http://origin.example/x");
    let entry = StoreEntry::new();
    let fwd = Forwarder::start(ctx, request, entry.clone());
    fwd.await_finished().await;

    assert!(fwd.succeeded());
    assert_eq!(Bytes::from_static(b"hello"), entry.body());
    assert!(entry.completed());
    assert_eq!(
        Some("entire declared body received"),
        entry.whole_reason()
    );
    assert_eq!(200, entry.reply().unwrap().status);
    assert!(entry.writing_started());

    // request head went out in one write
    assert_eq!(1, conn.write_count());
    let head =
        String::from_utf8(conn.writes.lock().unwrap()[0].to_vec())
            .unwrap();
    assert!(head.starts_with("GET /x HTTP/1.1\r\n"));
    assert!(head.contains("Host: origin.example\r\n"));
    assert!(conn.close_count() >= 1);
}

#[tokio::test(start_paused = true)]
async fn unsized_reply_is_whole_at_eof() {
    let conn = ScriptedConnection::new(
        Arc::new(HttpReply::new(200)),
        vec![Bytes::from_static(b"he"), Bytes::from_static(b"llo")],
    );
    let ctx = context(
        vec![conn],
        ContextOptions::default(),
        CoreConfig::default(),
    );

    let entry = StoreEntry::new();
    let fwd = Forwarder::start(
        ctx,
        get_request("http://origin.example/x"),
        entry.clone(),
    );
    fwd.await_finished().await;

    assert!(fwd.succeeded());
    assert_eq!(Bytes::from_static(b"hello"), entry.body());
    assert_eq!(
        Some("connection closed at end of reply"),
        entry.whole_reason()
    );
}

#[tokio::test(start_paused = true)]
async fn late_write_error_synthesizes_bad_gateway() {
    let conn = ScriptedConnection::new(reply_with_body(200, 5), vec![])
        // the head write succeeds, the first body write fails
        .failing_write_on(1, 104);
    let ctx = context(
        vec![conn.clone()],
        ContextOptions::default(),
        CoreConfig::default(),
    );

    let request = get_request("http://origin.example/x");
    let body = Arc::new(BodyPipe::new());
    body.put_more_data(&[0u8; 1024]);
    request.set_body_pipe(body.clone());

    let entry = StoreEntry::new();
    let fwd = Forwarder::start(ctx, request, entry.clone());
    fwd.await_finished().await;

    assert!(!fwd.succeeded());
    let err = fwd.last_error().unwrap();
    assert_eq!(ForwardErrorKind::WriteError, err.kind);
    assert_eq!(Some(104), err.os_errno);

    // the error reply replaced any upstream content
    assert_eq!(502, entry.reply().unwrap().status);
    assert!(entry.completed());

    // head + one failed body write, nothing after
    assert_eq!(2, conn.write_count());
    // the client-side producer learned that nobody consumes
    assert!(body.consumer_aborted());
}

#[tokio::test(start_paused = true)]
async fn write_errors_fail_over_to_the_next_path() {
    let failing = ScriptedConnection::new(reply_with_body(200, 2), vec![])
        .failing_write_on(0, 111);
    let healthy =
        ScriptedConnection::new(reply_with_body(200, 2), vec![Bytes::from_static(b"ok")]);
    let mut config = CoreConfig::default();
    config.forward_max_tries = 5;
    let mut ctx_options = ContextOptions::default();
    ctx_options.always_direct =
        Some(Arc::new(ConstAclCheck(AclAnswer::Allowed)));
    let ctx = CoreContext::with_options(
        config,
        vec![],
        Arc::new(MapResolver::default().with(
            "origin.example",
            &["198.51.100.10", "198.51.100.11"],
        )),
        ScriptedConnector::new(vec![failing, healthy.clone()]),
        None,
        ctx_options,
    );

    let entry = StoreEntry::new();
    let fwd = Forwarder::start(
        ctx,
        get_request("http://origin.example/x"),
        entry.clone(),
    );
    fwd.await_finished().await;

    assert!(fwd.succeeded());
    assert_eq!(Bytes::from_static(b"ok"), entry.body());
    assert_eq!(1, healthy.write_count());
}

#[tokio::test(start_paused = true)]
async fn connect_failures_exhaust_into_an_error_reply() {
    // the connector has nothing to hand out
    let ctx = context(
        vec![],
        ContextOptions::default(),
        CoreConfig::default(),
    );

    let entry = StoreEntry::new();
    let fwd = Forwarder::start(
        ctx,
        get_request("http://origin.example/x"),
        entry.clone(),
    );
    fwd.await_finished().await;

    assert!(!fwd.succeeded());
    assert_eq!(
        ForwardErrorKind::ConnectFail,
        fwd.last_error().unwrap().kind
    );
    assert_eq!(502, entry.reply().unwrap().status);
    assert!(entry.completed());
}

#[tokio::test(start_paused = true)]
async fn adaptation_block_on_empty_entry_denies_access() {
    let conn =
        ScriptedConnection::new(
        reply_with_body(200, 5),
        vec![Bytes::from_static(b"hello")],
    );
    let mut options = ContextOptions::default();
    options.access_check = Some(Arc::new(AlwaysAdapt));
    options.adaptation = Some(Arc::new(BlockingService));
    let ctx =
        context(vec![conn.clone()], options, CoreConfig::default());

    let request = get_request("http://origin.example/x");
    let entry = StoreEntry::new();
    let fwd = Forwarder::start(ctx, request.clone(), entry.clone());
    fwd.await_finished().await;

    assert!(!fwd.succeeded());
    let err = fwd.last_error().unwrap();
    assert_eq!(
        ForwardErrorKind::AccessDenied {
            page_id: Some("ERR_CUSTOM".into())
        },
        err.kind
    );
    assert_eq!(Some("RESPMOD_BLOCK_EARLY"), err.detail);

    // the deny reply was synthesized into the entry
    let reply = entry.reply().unwrap();
    assert_eq!(403, reply.status);
    assert!(String::from_utf8(entry.body().to_vec())
        .unwrap()
        .contains("ERR_CUSTOM"));
    assert!(entry.completed());

    // not retried, and the origin connection was closed
    assert!(conn.close_count() >= 1);
    let details = request.error_details();
    assert_eq!(1, details.len());
    assert_eq!("RESPMOD_BLOCK_EARLY", details[0].detail);
}

#[tokio::test(start_paused = true)]
async fn adapted_reply_replaces_virgin_body() {
    let conn = ScriptedConnection::new(
        reply_with_body(200, 5),
        vec![Bytes::from_static(b"he"), Bytes::from_static(b"llo")],
    );
    let mut options = ContextOptions::default();
    options.access_check = Some(Arc::new(AlwaysAdapt));
    options.adaptation = Some(Arc::new(UppercaseService));
    let ctx =
        context(vec![conn.clone()], options, CoreConfig::default());

    let entry = StoreEntry::new();
    let fwd = Forwarder::start(
        ctx,
        get_request("http://origin.example/x"),
        entry.clone(),
    );
    fwd.await_finished().await;

    assert!(fwd.succeeded());
    assert_eq!(Bytes::from_static(b"HELLO"), entry.body());
    assert_eq!(
        Some("receivedWholeAdaptedReply"),
        entry.whole_reason()
    );
    assert!(entry.completed());
}

#[tokio::test(start_paused = true)]
async fn no_adaptation_group_forwards_the_virgin_reply() {
    let conn =
        ScriptedConnection::new(
        reply_with_body(200, 5),
        vec![Bytes::from_static(b"hello")],
    );
    let mut options = ContextOptions::default();
    options.access_check = Some(Arc::new(NeverAdapt));
    options.adaptation = Some(Arc::new(BlockingService));
    let ctx = context(vec![conn], options, CoreConfig::default());

    let entry = StoreEntry::new();
    let fwd = Forwarder::start(
        ctx,
        get_request("http://origin.example/x"),
        entry.clone(),
    );
    fwd.await_finished().await;

    assert!(fwd.succeeded());
    assert_eq!(Bytes::from_static(b"hello"), entry.body());
}

#[tokio::test(start_paused = true)]
async fn oversized_virgin_body_is_rejected_before_adaptation() {
    let conn = ScriptedConnection::new(
        reply_with_body(200, 1_000_000),
        vec![Bytes::from_static(b"never read")],
    );
    let mut options = ContextOptions::default();
    options.access_check = Some(Arc::new(AlwaysAdapt));
    options.adaptation = Some(Arc::new(UppercaseService));
    let mut config = CoreConfig::default();
    config.adaptation.max_virgin_body_size = 1024;
    let ctx = context(vec![conn], options, config);

    let entry = StoreEntry::new();
    let fwd = Forwarder::start(
        ctx,
        get_request("http://origin.example/x"),
        entry.clone(),
    );
    fwd.await_finished().await;

    assert!(!fwd.succeeded());
    assert_eq!(
        ForwardErrorKind::TooBig,
        fwd.last_error().unwrap().kind
    );
    assert_eq!(403, entry.reply().unwrap().status);
}

#[tokio::test(start_paused = true)]
async fn purging_methods_invalidate_related_urls() {
    let mut reply = HttpReply::new(200);
    reply.body_size = Some(2);
    reply
        .headers
        .append("Location", "http://origin.example/moved");
    reply.headers.append("Content-Location", "/content");
    let conn = ScriptedConnection::new(Arc::new(reply), vec![Bytes::from_static(b"ok")]);

    let purger = Arc::new(RecordingPurger::default());
    let mut options = ContextOptions::default();
    options.purger = Some(purger.clone());
    let ctx = context(vec![conn], options, CoreConfig::default());

    let request = Arc::new(HttpRequest::new(
        Method::Put,
        Url::parse("http://origin.example/x").unwrap(),
    ));
    let entry = StoreEntry::new();
    let fwd = Forwarder::start(ctx, request, entry.clone());
    fwd.await_finished().await;

    assert!(fwd.succeeded());
    let urls = purger.urls.lock().unwrap().clone();
    assert_eq!(
        vec![
            "http://origin.example/x".to_string(),
            "http://origin.example/moved".to_string(),
            "http://origin.example/content".to_string(),
        ],
        urls
    );
}

#[tokio::test(start_paused = true)]
async fn purges_skip_foreign_absolute_urls() {
    let mut reply = HttpReply::new(201);
    reply.body_size = Some(2);
    reply
        .headers
        .append("Location", "http://evil.example/steal");
    let conn = ScriptedConnection::new(Arc::new(reply), vec![Bytes::from_static(b"ok")]);

    let purger = Arc::new(RecordingPurger::default());
    let mut options = ContextOptions::default();
    options.purger = Some(purger.clone());
    let ctx = context(vec![conn], options, CoreConfig::default());

    let request = Arc::new(HttpRequest::new(
        Method::Delete,
        Url::parse("http://origin.example/x").unwrap(),
    ));
    let fwd = Forwarder::start(ctx, request, StoreEntry::new());
    fwd.await_finished().await;

    let urls = purger.urls.lock().unwrap().clone();
    assert_eq!(vec!["http://origin.example/x".to_string()], urls);
}

#[tokio::test(start_paused = true)]
async fn get_requests_never_purge() {
    let conn =
        ScriptedConnection::new(reply_with_body(200, 2), vec![Bytes::from_static(b"ok")]);
    let purger = Arc::new(RecordingPurger::default());
    let mut options = ContextOptions::default();
    options.purger = Some(purger.clone());
    let ctx = context(vec![conn], options, CoreConfig::default());

    let fwd = Forwarder::start(
        ctx,
        get_request("http://origin.example/x"),
        StoreEntry::new(),
    );
    fwd.await_finished().await;

    assert!(purger.urls.lock().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn request_body_is_pumped_before_the_reply() {
    let conn =
        ScriptedConnection::new(
        reply_with_body(200, 4),
        vec![Bytes::from_static(b"done")],
    );
    let ctx = context(
        vec![conn.clone()],
        ContextOptions::default(),
        CoreConfig::default(),
    );

    let request = get_request("http://origin.example/upload");
    let body = Arc::new(BodyPipe::new());
    body.set_body_size(8);
    body.put_more_data(b"payload!");
    request.set_body_pipe(body);

    let entry = StoreEntry::new();
    let fwd = Forwarder::start(ctx, request, entry.clone());
    fwd.await_finished().await;

    assert!(fwd.succeeded());
    assert_eq!(Bytes::from_static(b"done"), entry.body());

    let writes = conn.writes.lock().unwrap();
    assert_eq!(2, writes.len());
    let head = String::from_utf8(writes[0].to_vec()).unwrap();
    assert!(head.contains("Content-Length: 8\r\n"));
    assert_eq!(Bytes::from_static(b"payload!"), writes[1]);
}

#[tokio::test(start_paused = true)]
async fn store_miss_acl_blocks_caching() {
    let conn =
        ScriptedConnection::new(
        reply_with_body(200, 5),
        vec![Bytes::from_static(b"hello")],
    );
    let mut options = ContextOptions::default();
    options.store_miss =
        Some(Arc::new(ConstAclCheck(AclAnswer::Denied)));
    let ctx = context(vec![conn], options, CoreConfig::default());

    let entry = StoreEntry::new();
    let fwd = Forwarder::start(
        ctx,
        get_request("http://origin.example/x"),
        entry.clone(),
    );
    fwd.await_finished().await;

    assert!(fwd.succeeded());
    assert!(entry.release_requested());
    // the reply still streams to the waiting client
    assert_eq!(Bytes::from_static(b"hello"), entry.body());
}
