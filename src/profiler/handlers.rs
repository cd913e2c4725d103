//! 采样结果查询处理器

use axum::{
    extract::{Query, State},
    http::header::CONTENT_TYPE,
    response::{Html, IntoResponse, Json, Response},
};

use super::PROFILER_PATH_PREFIX;
use super::logservice::RequestLogInfo;
use super::middleware::ProfilerState;
use super::types::{RequestLogQuery, RequestProfileView, RequestStatsQuery, SharedQuery};

/// 分享的采样结果已过期时的提示
pub const EXPIRED_MESSAGE: &str = "Profiler stats no longer exist for this request.";

/// GET /mini_profiler/request
pub async fn get_request_stats(
    State(state): State<ProfilerState>,
    Query(query): Query<RequestStatsQuery>,
) -> Response {
    let profiles = state.results.get_many(&query.ids());
    let views: Vec<RequestProfileView<'_>> = profiles.iter().map(Into::into).collect();
    Json(views).into_response()
}

/// GET /mini_profiler/request/log
pub async fn get_request_log(
    State(state): State<ProfilerState>,
    Query(query): Query<RequestLogQuery>,
) -> Json<Option<RequestLogInfo>> {
    let logging_request_id = query.logging_request_id;
    // 本地环境查不到日志服务
    if state.dev_server {
        return Json(Some(RequestLogInfo::stub(&logging_request_id)));
    }

    match state.log_service.fetch(&logging_request_id).await {
        Ok(info) => Json(info),
        Err(e) => {
            tracing::warn!("查询日志服务失败: {:#}", e);
            Json(Some(RequestLogInfo::stub(&logging_request_id)))
        }
    }
}

/// GET /mini_profiler/shared
pub async fn get_shared(
    State(state): State<ProfilerState>,
    Query(query): Query<SharedQuery>,
) -> Response {
    match state.results.get(&query.request_id) {
        Some(profile) => Html(render_shared_page(&profile.request_id)).into_response(),
        None => ([(CONTENT_TYPE, "text/plain; charset=utf-8")], EXPIRED_MESSAGE).into_response(),
    }
}

fn escape_html(s: &str) -> String {
    let mut escaped = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            _ => escaped.push(c),
        }
    }
    escaped
}

/// 分享页只携带采样 ID，结果由前端脚本通过查询接口加载
fn render_shared_page(request_id: &str) -> String {
    let request_id = escape_html(request_id);
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
<meta charset="utf-8">
<title>Mini Profiler</title>
</head>
<body>
<div id="mini-profiler" data-request-id="{request_id}" data-shared="true" data-api="{PROFILER_PATH_PREFIX}request"></div>
</body>
</html>
"#
    )
}
