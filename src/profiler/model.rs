//! 采样结果数据模型

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::common::truncate_with_ellipsis;
use crate::rpc::RpcTraceResults;

use super::logs::LogLine;
use super::mode::ProfilingMode;

/// 展示用 URL 的最大字符数
pub const URL_SHORT_LEN: usize = 26;

/// 单次请求的采样摘要
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestProfile {
    /// 采样 ID（存储主键）
    pub request_id: String,
    /// 外部日志服务中的请求 ID，本地环境下为 None
    pub logging_request_id: Option<String>,
    pub method: String,
    #[serde(rename = "url")]
    pub full_url: String,
    #[serde(rename = "url_short")]
    pub display_url: String,
    /// 请求开始时间（本地时间，`%Y-%m-%d %H:%M:%S`）
    #[serde(rename = "s_dt")]
    pub started_at: String,
    pub mode: ProfilingMode,
    #[serde(rename = "profiler_results")]
    pub cpu_profile_results: Map<String, Value>,
    #[serde(rename = "appstats_results")]
    pub rpc_trace_results: RpcTraceResults,
    #[serde(rename = "logs")]
    pub log_lines: Vec<LogLine>,
    /// 该响应为重定向，目标页面会携带本 ID
    #[serde(rename = "temporary_redirect")]
    pub is_redirect_continuation: bool,
    /// 重定向摘要展示过一次后置为 true，且不再回退
    #[serde(default)]
    pub disabled: bool,
}

/// 请求的基本信息
#[derive(Debug, Clone)]
pub struct RequestMeta {
    pub method: String,
    pub full_url: String,
    pub logging_request_id: Option<String>,
}

impl RequestMeta {
    pub fn from_parts(parts: &http::request::Parts, logging_request_id_header: &str) -> Self {
        let mut full_url = parts.uri.path().to_string();
        if let Some(query) = parts.uri.query().filter(|q| !q.is_empty()) {
            full_url.push('?');
            full_url.push_str(query);
        }

        let logging_request_id = parts
            .headers
            .get(logging_request_id_header)
            .and_then(|v| v.to_str().ok())
            .filter(|v| !v.is_empty())
            .map(str::to_string);

        Self {
            method: parts.method.to_string(),
            full_url,
            logging_request_id,
        }
    }

    pub fn display_url(&self) -> String {
        truncate_with_ellipsis(&self.full_url, URL_SHORT_LEN)
    }
}
