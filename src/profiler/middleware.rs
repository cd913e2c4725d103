//! 采样中间件
//!
//! 挂在整个应用外层：跳过采样器自身的接口，为其余请求生成采样 ID、解析模式，
//! 并在响应头中写入采样 ID、原始查询串与模式 Cookie。

use std::sync::Arc;

use axum::{
    body::Body,
    extract::State,
    http::{HeaderName, HeaderValue, Request, header::SET_COOKIE},
    middleware::Next,
    response::Response,
};
use axum_extra::extract::cookie::Cookie;
use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use http::header::LOCATION;
use http::response::Parts;

use crate::model::config::Config;
use crate::rpc::{LockOverride, RpcTracer};

use super::PROFILER_PATH_PREFIX;
use super::context::RequestContext;
use super::logservice::{HttpLogService, LocalLogService, LogService};
use super::mode::ProfilingMode;
use super::model::RequestMeta;
use super::orchestrator::RequestProfiler;
use super::policy::{ConfigPolicy, MODE_COOKIE, ProfilePolicy};
use super::redirect::modify_redirect_headers;
use super::store::{KeyValueStore, ResultStore};

/// 采样 ID 响应头
pub const PROFILER_ID_HEADER: &str = "x-miniprofiler-id";

/// 原始查询串响应头
pub const PROFILER_QS_HEADER: &str = "x-miniprofiler-qs";

/// 采样 ID 的随机字节数，编码后为 12 个 URL 安全字符
const REQUEST_ID_BYTES: usize = 9;

/// 采样中间件与查询接口共享的状态
#[derive(Clone)]
pub struct ProfilerState {
    pub(crate) policy: Arc<dyn ProfilePolicy>,
    pub(crate) results: ResultStore,
    pub(crate) rpc: RpcTracer,
    pub(crate) keep_rpc_tracing: bool,
    pub(crate) logging_request_id_header: Arc<str>,
    pub(crate) log_service: Arc<dyn LogService>,
    pub(crate) dev_server: bool,
}

impl ProfilerState {
    pub fn new(
        policy: Arc<dyn ProfilePolicy>,
        store: Arc<dyn KeyValueStore>,
        rpc_lock_ttl: std::time::Duration,
    ) -> Self {
        Self {
            policy,
            results: ResultStore::new(store.clone()),
            rpc: RpcTracer::new(store, rpc_lock_ttl),
            keep_rpc_tracing: false,
            logging_request_id_header: Arc::from("x-request-log-id"),
            log_service: Arc::new(LocalLogService),
            dev_server: false,
        }
    }

    /// 按配置构建：配置策略，配置了日志服务地址时通过 HTTP 查询
    pub fn from_config(config: &Config, store: Arc<dyn KeyValueStore>) -> Self {
        let policy = Arc::new(ConfigPolicy::new(config.enabled, config.default_mode));

        let log_service: Arc<dyn LogService> = match &config.log_service_url {
            Some(url) => Arc::new(HttpLogService::new(reqwest::Client::new(), url.clone())),
            None => Arc::new(LocalLogService),
        };

        Self::new(policy, store, config.rpc_lock_ttl())
            .with_keep_rpc_tracing(config.keep_rpc_tracing)
            .with_logging_request_id_header(&config.logging_request_id_header)
            .with_log_service(log_service)
            .with_dev_server(config.dev_server)
    }

    pub fn with_keep_rpc_tracing(mut self, keep: bool) -> Self {
        self.keep_rpc_tracing = keep;
        self
    }

    pub fn with_logging_request_id_header(mut self, header: &str) -> Self {
        self.logging_request_id_header = Arc::from(header.to_ascii_lowercase());
        self
    }

    pub fn with_log_service(mut self, log_service: Arc<dyn LogService>) -> Self {
        self.log_service = log_service;
        self
    }

    pub fn with_dev_server(mut self, dev_server: bool) -> Self {
        self.dev_server = dev_server;
        self
    }

    async fn passthrough(&self, request: Request<Body>, next: Next) -> Response {
        if self.keep_rpc_tracing {
            self.rpc.trace(next.run(request)).await
        } else {
            next.run(request).await
        }
    }
}

/// 生成 URL 安全的随机采样 ID
pub fn generate_request_id() -> String {
    let mut bytes = [0u8; REQUEST_ID_BYTES];
    fastrand::fill(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// 采样器自身的接口，含不带结尾斜杠的 `/mini_profiler`
fn is_profiler_path(path: &str) -> bool {
    path.starts_with(PROFILER_PATH_PREFIX) || path == PROFILER_PATH_PREFIX.trim_end_matches('/')
}

/// 采样中间件
pub async fn profiler_middleware(
    State(state): State<ProfilerState>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let (mut parts, body) = request.into_parts();

    if is_profiler_path(parts.uri.path()) || !state.policy.should_profile(&parts) {
        return state
            .passthrough(Request::from_parts(parts, body), next)
            .await;
    }

    let mode = state.policy.resolve_mode(&parts);
    if !mode.is_enabled() {
        return state
            .passthrough(Request::from_parts(parts, body), next)
            .await;
    }

    let request_id = generate_request_id();
    let query_string = parts.uri.query().unwrap_or("").to_string();
    let meta = RequestMeta::from_parts(&parts, &state.logging_request_id_header);
    parts.extensions.insert(RequestContext {
        request_id: request_id.clone(),
        mode,
    });
    tracing::debug!(request_id = %request_id, mode = %mode, path = %parts.uri.path(), "开始采样");

    let profiler = RequestProfiler::new(
        request_id.clone(),
        mode,
        meta,
        state.results.clone(),
        state.rpc.clone(),
        LockOverride::bypass(state.rpc.lock_key()),
    );

    let start_response =
        move |parts: &mut Parts| decorate_response(parts, &query_string, &request_id, mode);

    profiler
        .run(next.run(Request::from_parts(parts, body)), start_response)
        .await
}

/// 为响应添加诊断头和模式 Cookie，返回是否为重定向中转
fn decorate_response(
    parts: &mut Parts,
    query_string: &str,
    request_id: &str,
    mode: ProfilingMode,
) -> bool {
    let is_redirect = parts.status.is_redirection() && parts.headers.contains_key(LOCATION);
    if is_redirect {
        modify_redirect_headers(&mut parts.headers, query_string, request_id);
    }

    append_header(parts, HeaderName::from_static(PROFILER_ID_HEADER), request_id);
    append_header(parts, HeaderName::from_static(PROFILER_QS_HEADER), query_string);

    let cookie = Cookie::build((MODE_COOKIE, mode.to_string())).path("/").build();
    append_header(parts, SET_COOKIE, &cookie.to_string());

    is_redirect
}

fn append_header(parts: &mut Parts, name: HeaderName, value: &str) {
    match HeaderValue::from_str(value) {
        Ok(value) => {
            parts.headers.append(name, value);
        }
        Err(e) => tracing::warn!("无法写入响应头 {}: {}", name, e),
    }
}
