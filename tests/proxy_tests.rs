//! End-to-end tests: client -> proxy -> local origin, over real sockets

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use axum::{Router, extract::State, http::StatusCode, routing::get};
use hproxy::cache::{Clock, ComputationCache, ManualClock};
use hproxy::client::ProxyClient;
use hproxy::config::Config;
use hproxy::forward::ProxyResponse;
use hproxy::gateway::ProxyServer;
use hproxy::key::derive_key;
use hproxy::request::ProxyRequest;
use hproxy::store::MemoryStore;
use pretty_assertions::assert_eq;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;

const HOUR: Duration = Duration::from_secs(3600);

struct Harness {
    proxy: String,
    origin: String,
    client: ProxyClient,
    hits: Arc<AtomicUsize>,
    clock: Arc<ManualClock>,
    store: Arc<MemoryStore>,
    cache: ComputationCache,
    server: JoinHandle<hproxy::Result<()>>,
}

impl Harness {
    async fn start() -> Self {
        Self::start_with(|_| {}).await
    }

    async fn start_with(configure: impl FnOnce(&mut Config)) -> Self {
        let hits = Arc::new(AtomicUsize::new(0));
        let origin = spawn_origin(Arc::clone(&hits)).await;

        let mut config = Config::default();
        config.forward.timeout = Duration::from_secs(5);
        config.server.shutdown_timeout = Duration::from_secs(2);
        configure(&mut config);

        let clock = Arc::new(ManualClock::default());
        let store = Arc::new(MemoryStore::new());
        let server = ProxyServer::new(
            config,
            Arc::clone(&store) as _,
            Arc::clone(&clock) as Arc<dyn Clock>,
        )
        .unwrap();
        let cache = server.cache().clone();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let proxy = format!("http://{}", listener.local_addr().unwrap());
        let server = tokio::spawn(server.serve(listener, std::future::pending()));

        Self {
            client: ProxyClient::new(&proxy).unwrap(),
            proxy,
            origin,
            hits,
            clock,
            store,
            cache,
            server,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.origin)
    }

    fn hits(&self) -> usize {
        self.hits.load(Ordering::SeqCst)
    }

    async fn fetch(&self, path: &str) -> ProxyResponse {
        let reply = self.client.fetch(&self.url(path), HOUR, 24 * HOUR).await.unwrap();
        serde_json::from_value(reply.clone()).unwrap_or_else(|e| panic!("{e}: {reply}"))
    }

    async fn post_raw(&self, query: &str, body: Vec<u8>) -> (StatusCode, Value) {
        let response = reqwest::Client::new()
            .post(format!("{}/proxy?{query}", self.proxy))
            .body(body)
            .send()
            .await
            .unwrap();
        let status = StatusCode::from_u16(response.status().as_u16()).unwrap();
        (status, response.json().await.unwrap())
    }

    async fn wait_for_refresh(&self, path: &str, hits: usize) {
        let key = derive_key(&ProxyRequest::get(self.url(path)));
        for _ in 0..500 {
            if self.hits() >= hits && !self.cache.is_computing(&key) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("refresh of {path} did not finish");
    }
}

async fn spawn_origin(hits: Arc<AtomicUsize>) -> String {
    async fn data(State(hits): State<Arc<AtomicUsize>>) -> String {
        let n = hits.fetch_add(1, Ordering::SeqCst) + 1;
        format!("hit {n}")
    }

    async fn slow(State(hits): State<Arc<AtomicUsize>>) -> String {
        tokio::time::sleep(Duration::from_millis(200)).await;
        let n = hits.fetch_add(1, Ordering::SeqCst) + 1;
        format!("slow {n}")
    }

    async fn teapot(State(hits): State<Arc<AtomicUsize>>) -> (StatusCode, &'static str) {
        hits.fetch_add(1, Ordering::SeqCst);
        (StatusCode::IM_A_TEAPOT, "short and stout")
    }

    let app = Router::new()
        .route("/data", get(data))
        .route("/slow", get(slow))
        .route("/teapot", get(teapot))
        .with_state(hits);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

#[tokio::test]
async fn test_second_request_is_served_from_cache() {
    // GIVEN: a proxy in front of a counting origin
    let h = Harness::start().await;

    // WHEN: the same URL is fetched twice within min_ttl
    let first = h.fetch("/data").await;
    h.clock.advance(Duration::from_secs(60));
    let second = h.fetch("/data").await;

    // THEN: the origin saw one call and both replies are identical
    assert_eq!(h.hits(), 1);
    assert_eq!(first, second);
    assert_eq!(first.status, "200 OK");
    assert_eq!(first.status_code, 200);
    assert_eq!(first.body, "hit 1");
    assert!(h.store.contains(&derive_key(&ProxyRequest::get(h.url("/data")))));
}

#[tokio::test]
async fn test_stale_response_is_served_then_refreshed() {
    // GIVEN: a cached response that is now between min_ttl and max_ttl
    let h = Harness::start().await;
    let original = h.fetch("/data").await;
    h.clock.advance(2 * HOUR);

    // WHEN: it is requested again
    let stale = h.fetch("/data").await;

    // THEN: the old response comes back immediately and a refresh runs behind it
    assert_eq!(stale, original);
    h.wait_for_refresh("/data", 2).await;

    let refreshed = h.fetch("/data").await;
    assert_eq!(refreshed.body, "hit 2");
    assert!(refreshed.refreshed > original.refreshed);
    assert_eq!(h.hits(), 2);
}

#[tokio::test]
async fn test_expired_response_is_refetched() {
    // GIVEN: a cached response older than max_ttl
    let h = Harness::start().await;
    let original = h.fetch("/data").await;
    h.clock.advance(25 * HOUR);

    // WHEN: it is requested again
    let next = h.fetch("/data").await;

    // THEN: the caller waits for a new origin response
    assert_eq!(next.body, "hit 2");
    assert!(next.refreshed > original.refreshed);
    assert_eq!(h.hits(), 2);
}

#[tokio::test]
async fn test_unreachable_origin_returns_502_and_caches_nothing() {
    // GIVEN: a URL nothing listens on
    let h = Harness::start().await;
    let dead = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let url = format!("http://{}/gone", dead.local_addr().unwrap());
    drop(dead);
    let body = ProxyRequest::get(&url).encode().unwrap().to_vec();

    // WHEN: it is fetched twice
    let (first, reply) = h.post_raw("", body.clone()).await;
    let (second, _) = h.post_raw("", body).await;

    // THEN: both fail, and nothing was stored in between
    assert_eq!(first, StatusCode::BAD_GATEWAY);
    assert_eq!(second, StatusCode::BAD_GATEWAY);
    assert!(reply["error"].as_str().is_some_and(|m| !m.is_empty()));
    assert!(h.store.is_empty());
    assert_eq!(h.cache.stats().failures, 2);
}

#[tokio::test]
async fn test_unparsable_ttl_falls_back_to_defaults() {
    // GIVEN: a request with min_ttl=bogus, so the 1h default applies
    let h = Harness::start().await;
    let body = ProxyRequest::get(h.url("/data")).encode().unwrap().to_vec();
    let query = "min_ttl=bogus&max_ttl=24h";

    let (status, first) = h.post_raw(query, body.clone()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(first["body"], "hit 1");

    // WHEN: 30 minutes pass, the entry is still fresh
    h.clock.advance(Duration::from_secs(30 * 60));
    let (_, again) = h.post_raw(query, body.clone()).await;
    assert_eq!(again, first);
    assert_eq!(h.hits(), 1);

    // THEN: past one hour it is stale and gets refreshed
    h.clock.advance(HOUR);
    let (_, stale) = h.post_raw(query, body).await;
    assert_eq!(stale, first);
    h.wait_for_refresh("/data", 2).await;
}

#[tokio::test]
async fn test_inverted_ttls_are_rejected() {
    // GIVEN: min_ttl larger than max_ttl
    let h = Harness::start().await;
    let body = ProxyRequest::get(h.url("/data")).encode().unwrap().to_vec();

    // WHEN: the request is sent
    let (status, reply) = h.post_raw("min_ttl=2h&max_ttl=1h", body).await;

    // THEN: 400 without touching the origin
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(reply["error"].as_str().is_some());
    assert_eq!(h.hits(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_misses_share_one_origin_call() {
    // GIVEN: a slow origin and no cached entry
    let h = Harness::start().await;

    // WHEN: ten clients ask for the same URL at once
    let fetches = (0..10).map(|_| h.fetch("/slow"));
    let replies = futures::future::join_all(fetches).await;

    // THEN: the origin ran once and every client got its response
    assert_eq!(h.hits(), 1);
    for reply in &replies {
        assert_eq!(reply, &replies[0]);
        assert_eq!(reply.body, "slow 1");
    }
}

#[tokio::test]
async fn test_non_success_status_is_cached() {
    let h = Harness::start().await;

    let first = h.fetch("/teapot").await;
    let second = h.fetch("/teapot").await;

    assert_eq!(first.status_code, 418);
    assert_eq!(first.status, "418 I'm a teapot");
    assert_eq!(first, second);
    assert_eq!(h.hits(), 1);
}

#[tokio::test]
async fn test_malformed_body_is_rejected() {
    let h = Harness::start().await;

    let (status, reply) = h.post_raw("", b"definitely not a request".to_vec()).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(reply["error"].as_str().is_some_and(|m| m.contains("magic")));
}

#[tokio::test]
async fn test_oversized_body_gets_json_error() {
    // GIVEN: a proxy that accepts at most 256 body bytes
    let h = Harness::start_with(|config| config.server.max_body_size = 256).await;
    let request = ProxyRequest::get(h.url("/data")).with_body(vec![b'x'; 1024]);

    // WHEN: a larger request is sent, raw and through the client
    let (status, reply) = h.post_raw("", request.encode().unwrap().to_vec()).await;
    let via_client = h.client.send(&request, HOUR, 24 * HOUR).await.unwrap();

    // THEN: both get a 400 with the JSON error envelope, and the origin is untouched
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(reply["error"].as_str().is_some_and(|m| m.contains("body")));
    assert!(via_client["error"].is_string());
    assert_eq!(h.hits(), 0);
}

#[tokio::test]
async fn test_unreachable_store_is_fatal_at_startup() {
    // GIVEN: a store URL nothing listens on
    let dead = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = dead.local_addr().unwrap();
    drop(dead);
    let mut config = Config::default();
    config.store.url = Some(format!("redis://{addr}"));

    // WHEN: the proxy is started against it
    let result = ProxyServer::connect(config).await;

    // THEN: startup fails with a store error
    assert!(matches!(result, Err(hproxy::Error::Store(_))));
}

#[tokio::test]
async fn test_non_read_method_is_rejected() {
    let h = Harness::start().await;
    let body = ProxyRequest::new("POST", h.url("/data")).encode().unwrap().to_vec();

    let (status, reply) = h.post_raw("", body).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(reply["error"].as_str().is_some_and(|m| m.contains("POST")));
    assert_eq!(h.hits(), 0);
}

#[tokio::test]
async fn test_health_and_stats_endpoints() {
    let h = Harness::start().await;
    h.fetch("/data").await;
    h.fetch("/data").await;

    let health: Value = reqwest::get(format!("{}/health", h.proxy))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], "healthy");
    assert_eq!(health["version"], env!("CARGO_PKG_VERSION"));
    assert_eq!(health["store"], "memory");

    let stats: Value = reqwest::get(format!("{}/stats", h.proxy))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(stats["misses"], 1);
    assert_eq!(stats["fresh_hits"], 1);
    assert_eq!(stats["computations"], 1);
    assert_eq!(stats["in_flight"], 0);
}

#[tokio::test]
async fn test_shutdown_token_stops_server() {
    // GIVEN: a running proxy
    let h = Harness::start().await;
    h.fetch("/data").await;

    // WHEN: the shared shutdown token is cancelled
    h.cache.shutdown_token().cancel();

    // THEN: the server drains and returns cleanly
    let result = tokio::time::timeout(Duration::from_secs(5), h.server)
        .await
        .expect("server did not stop")
        .unwrap();
    assert!(result.is_ok());
}
