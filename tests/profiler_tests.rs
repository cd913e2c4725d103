use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Once};
use std::time::Duration;

use axum::{
    Extension, Router,
    body::Body,
    extract::Path,
    middleware,
    response::{IntoResponse, Redirect, Response},
    routing::get,
};
use futures::StreamExt;
use mini_profiler::profiler::{
    ConfigPolicy, LogService, MemoryStore, ProfilerLayer, ProfilerState, ProfilingMode,
    RequestContext, RequestLogInfo, create_profiler_router, profiler_middleware,
};
use mini_profiler::rpc::DEFAULT_LOCK_TTL;
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

static INIT: Once = Once::new();

fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::registry()
            .with(ProfilerLayer::new())
            .try_init();
    });
}

struct TestServer {
    addr: SocketAddr,
    store: Arc<MemoryStore>,
    client: reqwest::Client,
    _handle: JoinHandle<()>,
}

impl TestServer {
    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    async fn get(&self, path: &str) -> reqwest::Response {
        self.client
            .get(self.url(path))
            .send()
            .await
            .expect("request should succeed")
    }

    async fn profiles(&self, ids: &str) -> Vec<Value> {
        let response = self
            .get(&format!("/mini_profiler/request?request_ids={ids}"))
            .await;
        response.json::<Vec<Value>>().await.expect("profiles json")
    }
}

fn profiler_id(response: &reqwest::Response) -> String {
    response
        .headers()
        .get("x-miniprofiler-id")
        .expect("profiler id header")
        .to_str()
        .unwrap()
        .to_string()
}

fn app() -> Router {
    Router::new()
        .route(
            "/",
            get(|| async {
                tracing::info!("index handler");
                "index"
            }),
        )
        .route("/go", get(|| async { Redirect::to("/next?x=1") }))
        .route(
            "/ctx",
            get(|Extension(context): Extension<RequestContext>| async move { context.request_id }),
        )
        .route(
            "/log/{name}",
            get(|Path(name): Path<String>| async move {
                tokio::time::sleep(Duration::from_millis(20)).await;
                tracing::info!("hello from {}", name);
                tokio::time::sleep(Duration::from_millis(20)).await;
                name
            }),
        )
        .route("/stream", get(stream))
}

async fn stream() -> Response {
    let chunks = futures::stream::iter(0..3).map(|i| {
        let _span = tracing::info_span!("render_chunk").entered();
        tracing::debug!(chunk = i, "render");
        Ok::<_, Infallible>(format!("chunk{i};"))
    });
    Body::from_stream(chunks).into_response()
}

async fn spawn_with(state_fn: impl FnOnce(Arc<MemoryStore>) -> ProfilerState) -> TestServer {
    init_tracing();

    let store = Arc::new(MemoryStore::default());
    let state = state_fn(store.clone());
    let app = app()
        .merge(create_profiler_router(state.clone()))
        .layer(middleware::from_fn_with_state(state, profiler_middleware));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("listener should bind");
    let addr = listener.local_addr().expect("listener should have addr");
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.expect("server should run");
    });

    let client = reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .build()
        .unwrap();

    TestServer {
        addr,
        store,
        client,
        _handle: handle,
    }
}

async fn spawn_server(enabled: bool) -> TestServer {
    spawn_with(|store| {
        ProfilerState::new(
            Arc::new(ConfigPolicy::new(enabled, ProfilingMode::default())),
            store,
            DEFAULT_LOCK_TTL,
        )
    })
    .await
}

#[tokio::test]
async fn profiled_request_gets_headers_and_stored_profile() {
    let server = spawn_server(true).await;

    let response = server.get("/?a=1").await;
    let id = profiler_id(&response);
    assert_eq!(response.headers().get("x-miniprofiler-qs").unwrap(), "a=1");
    assert_eq!(
        response.headers().get("set-cookie").unwrap(),
        "g-m-p-mode=rpc-instrumented; Path=/"
    );
    assert_eq!(response.text().await.unwrap(), "index");

    let profiles = server.profiles(&id).await;
    assert_eq!(profiles.len(), 1);
    let profile = &profiles[0];
    assert_eq!(profile["request_id"], id.as_str());
    assert_eq!(profile["method"], "GET");
    assert_eq!(profile["url"], "/?a=1");
    assert_eq!(profile["mode"], "rpc-instrumented");
    assert_eq!(profile["temporary_redirect"], false);
    assert!(profile.get("disabled").is_none());
    assert!(profile["profiler_results"]["total_time"].is_number());

    let logs = profile["logs"].as_array().unwrap();
    assert!(
        logs.iter()
            .any(|line| line[0] == "20" && line[5] == "index handler")
    );

    // 非重定向结果可以重复读取
    assert_eq!(server.profiles(&id).await.len(), 1);
}

#[tokio::test]
async fn profiler_endpoints_are_never_profiled() {
    let server = spawn_server(true).await;

    let response = server.get("/mini_profiler/request?request_ids=missing").await;
    assert!(response.headers().get("x-miniprofiler-id").is_none());
    assert_eq!(response.text().await.unwrap(), "[]");

    let response = server.get("/mini_profiler").await;
    assert!(response.headers().get("x-miniprofiler-id").is_none());
    response.bytes().await.unwrap();
    assert!(server.store.is_empty());
}

#[tokio::test]
async fn disabled_profiling_passes_through() {
    let server = spawn_server(false).await;

    let response = server.get("/").await;
    assert!(response.headers().get("x-miniprofiler-id").is_none());
    assert!(response.headers().get("set-cookie").is_none());
    assert_eq!(response.text().await.unwrap(), "index");
    assert!(server.store.is_empty());
}

#[tokio::test]
async fn mode_cookie_selects_mode() {
    let server = spawn_server(true).await;

    let response = server
        .client
        .get(server.url("/"))
        .header("cookie", "g-m-p-mode=simple")
        .send()
        .await
        .unwrap();
    let id = profiler_id(&response);
    assert_eq!(
        response.headers().get("set-cookie").unwrap(),
        "g-m-p-mode=simple; Path=/"
    );
    assert_eq!(response.text().await.unwrap(), "index");

    let profiles = server.profiles(&id).await;
    assert_eq!(profiles[0]["mode"], "simple");
    assert!(profiles[0]["logs"].as_array().unwrap().is_empty());

    let response = server
        .client
        .get(server.url("/"))
        .header("cookie", "g-m-p-mode=disabled")
        .send()
        .await
        .unwrap();
    assert!(response.headers().get("x-miniprofiler-id").is_none());
}

#[tokio::test]
async fn redirect_chains_ids_and_is_shown_once() {
    let server = spawn_server(true).await;

    let response = server.get("/go?mp-r-id=abc").await;
    assert!(response.status().is_redirection());
    let id = profiler_id(&response);
    assert_eq!(
        response.headers().get("location").unwrap().to_str().unwrap(),
        format!("/next?x=1&mp-r-id=abc,{id}")
    );
    response.bytes().await.unwrap();

    let profiles = server.profiles(&id).await;
    assert_eq!(profiles.len(), 1);
    assert_eq!(profiles[0]["temporary_redirect"], true);

    assert!(server.profiles(&id).await.is_empty());
}

#[tokio::test]
async fn request_context_is_available_to_handlers() {
    let server = spawn_server(true).await;

    let response = server.get("/ctx").await;
    let id = profiler_id(&response);
    assert_eq!(response.text().await.unwrap(), id);
}

#[tokio::test]
async fn streamed_body_is_profiled_after_completion() {
    let server = spawn_server(true).await;

    let response = server.get("/stream").await;
    let id = profiler_id(&response);
    assert_eq!(response.text().await.unwrap(), "chunk0;chunk1;chunk2;");

    let profiles = server.profiles(&id).await;
    assert_eq!(profiles.len(), 1);
    let results = &profiles[0]["profiler_results"];
    assert!(results["wall_time"].is_number());
    let calls = results["calls"].as_array().unwrap();
    let render = calls
        .iter()
        .find(|c| c["function"].as_str().unwrap().ends_with("render_chunk"))
        .expect("render_chunk span recorded");
    assert_eq!(render["calls"], 3);

    let logs = profiles[0]["logs"].as_array().unwrap();
    assert_eq!(
        logs.iter().filter(|line| line[2] == "render_chunk").count(),
        3
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn concurrent_requests_capture_only_their_own_logs() {
    let server = spawn_server(true).await;

    let (first, second) = tokio::join!(server.get("/log/first"), server.get("/log/second"));
    let first_id = profiler_id(&first);
    let second_id = profiler_id(&second);
    assert_ne!(first_id, second_id);
    first.text().await.unwrap();
    second.text().await.unwrap();

    let profiles = server.profiles(&format!("{first_id},{second_id}")).await;
    assert_eq!(profiles.len(), 2);
    assert_eq!(profiles[0]["request_id"], first_id.as_str());

    for (profile, name) in profiles.iter().zip(["first", "second"]) {
        let messages: Vec<&str> = profile["logs"]
            .as_array()
            .unwrap()
            .iter()
            .map(|line| line[5].as_str().unwrap())
            .filter(|message| message.starts_with("hello from"))
            .collect();
        assert_eq!(messages, vec![format!("hello from {name}")]);
    }
}

#[tokio::test]
async fn request_log_endpoint_returns_stub_on_dev_server() {
    let server = spawn_with(|store| {
        ProfilerState::new(
            Arc::new(ConfigPolicy::new(true, ProfilingMode::default())),
            store,
            DEFAULT_LOCK_TTL,
        )
        .with_dev_server(true)
    })
    .await;

    let response = server
        .get("/mini_profiler/request/log?logging_request_id=L1")
        .await;
    let body: Value = response.json().await.unwrap();
    assert_eq!(
        body,
        serde_json::json!({"pending_ms": 0, "loading_request": false, "logging_request_id": "L1"})
    );
}

struct FailingLogService;

#[async_trait::async_trait]
impl LogService for FailingLogService {
    async fn fetch(&self, _logging_request_id: &str) -> anyhow::Result<Option<RequestLogInfo>> {
        anyhow::bail!("log service unavailable")
    }
}

struct EmptyLogService;

#[async_trait::async_trait]
impl LogService for EmptyLogService {
    async fn fetch(&self, _logging_request_id: &str) -> anyhow::Result<Option<RequestLogInfo>> {
        Ok(None)
    }
}

#[tokio::test]
async fn request_log_endpoint_degrades_on_failure() {
    let server = spawn_with(|store| {
        ProfilerState::new(
            Arc::new(ConfigPolicy::new(true, ProfilingMode::default())),
            store,
            DEFAULT_LOCK_TTL,
        )
        .with_log_service(Arc::new(FailingLogService))
    })
    .await;

    let body: Value = server
        .get("/mini_profiler/request/log?logging_request_id=L2")
        .await
        .json()
        .await
        .unwrap();
    assert_eq!(body["pending_ms"], 0);
    assert_eq!(body["logging_request_id"], "L2");
}

#[tokio::test]
async fn request_log_endpoint_returns_null_for_unknown_id() {
    let server = spawn_with(|store| {
        ProfilerState::new(
            Arc::new(ConfigPolicy::new(true, ProfilingMode::default())),
            store,
            DEFAULT_LOCK_TTL,
        )
        .with_log_service(Arc::new(EmptyLogService))
    })
    .await;

    let response = server
        .get("/mini_profiler/request/log?logging_request_id=nope")
        .await;
    assert_eq!(response.text().await.unwrap(), "null");
}

#[tokio::test]
async fn logging_request_id_header_is_recorded() {
    let server = spawn_server(true).await;

    let response = server
        .client
        .get(server.url("/"))
        .header("x-request-log-id", "log-42")
        .send()
        .await
        .unwrap();
    let id = profiler_id(&response);
    response.text().await.unwrap();

    let profiles = server.profiles(&id).await;
    assert_eq!(profiles[0]["logging_request_id"], "log-42");
}

#[tokio::test]
async fn shared_page_reports_expired_profiles() {
    let server = spawn_server(true).await;

    let response = server.get("/mini_profiler/shared?request_id=gone").await;
    assert_eq!(
        response.text().await.unwrap(),
        "Profiler stats no longer exist for this request."
    );

    let response = server.get("/").await;
    let id = profiler_id(&response);
    response.text().await.unwrap();

    let response = server
        .get(&format!("/mini_profiler/shared?request_id={id}"))
        .await;
    assert!(
        response
            .headers()
            .get("content-type")
            .unwrap()
            .to_str()
            .unwrap()
            .starts_with("text/html")
    );
    assert!(response.text().await.unwrap().contains(&id));
}

#[tokio::test]
async fn cors_exposes_diagnostic_headers() {
    let server = spawn_server(true).await;

    let response = server
        .client
        .get(server.url("/mini_profiler/request?request_ids=x"))
        .header("origin", "http://example.com")
        .send()
        .await
        .unwrap();
    assert_eq!(
        response.headers().get("access-control-allow-origin").unwrap(),
        "*"
    );
    let exposed = response
        .headers()
        .get("access-control-expose-headers")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(exposed.contains("x-miniprofiler-id"));
    assert!(exposed.contains("x-miniprofiler-qs"));
}
