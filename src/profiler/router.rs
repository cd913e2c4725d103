//! 采样器路由

use axum::{Router, http::HeaderName, routing::get};
use tower_http::cors::{Any, CorsLayer};

use super::handlers::{get_request_log, get_request_stats, get_shared};
use super::middleware::{PROFILER_ID_HEADER, PROFILER_QS_HEADER, ProfilerState};

/// 允许跨域读取诊断响应头
pub fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers([
            HeaderName::from_static(PROFILER_ID_HEADER),
            HeaderName::from_static(PROFILER_QS_HEADER),
        ])
}

/// 创建采样结果查询路由
///
/// 返回 Router<()>，路径已带 `/mini_profiler` 前缀，可直接 merge 到主应用
pub fn create_profiler_router(state: ProfilerState) -> Router {
    let api = Router::new()
        .route("/request", get(get_request_stats))
        .route("/request/log", get(get_request_log))
        .route("/shared", get(get_shared))
        .with_state(state);

    Router::new()
        .nest("/mini_profiler", api)
        .layer(cors_layer())
}
