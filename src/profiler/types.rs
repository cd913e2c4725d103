//! 查询接口的请求 / 响应类型

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::rpc::RpcTraceResults;

use super::logs::LogLine;
use super::mode::ProfilingMode;
use super::model::RequestProfile;

/// GET /mini_profiler/request 查询参数
#[derive(Debug, Default, Deserialize)]
pub struct RequestStatsQuery {
    /// 逗号分隔的采样 ID
    #[serde(default)]
    pub request_ids: String,
}

impl RequestStatsQuery {
    pub fn ids(&self) -> Vec<&str> {
        self.request_ids
            .split(',')
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .collect()
    }
}

/// GET /mini_profiler/request/log 查询参数
#[derive(Debug, Default, Deserialize)]
pub struct RequestLogQuery {
    #[serde(default)]
    pub logging_request_id: String,
}

/// GET /mini_profiler/shared 查询参数
#[derive(Debug, Default, Deserialize)]
pub struct SharedQuery {
    #[serde(default)]
    pub request_id: String,
}

/// 返回给前端的采样结果，不含内部的 `disabled` 标记
#[derive(Debug, Serialize)]
pub struct RequestProfileView<'a> {
    pub request_id: &'a str,
    pub method: &'a str,
    pub url: &'a str,
    pub url_short: &'a str,
    pub s_dt: &'a str,
    pub profiler_results: &'a Map<String, Value>,
    pub appstats_results: &'a RpcTraceResults,
    pub mode: ProfilingMode,
    pub temporary_redirect: bool,
    pub logs: &'a [LogLine],
    pub logging_request_id: Option<&'a str>,
}

impl<'a> From<&'a RequestProfile> for RequestProfileView<'a> {
    fn from(profile: &'a RequestProfile) -> Self {
        Self {
            request_id: &profile.request_id,
            method: &profile.method,
            url: &profile.full_url,
            url_short: &profile.display_url,
            s_dt: &profile.started_at,
            profiler_results: &profile.cpu_profile_results,
            appstats_results: &profile.rpc_trace_results,
            mode: profile.mode,
            temporary_redirect: profile.is_redirect_continuation,
            logs: &profile.log_lines,
            logging_request_id: profile.logging_request_id.as_deref(),
        }
    }
}
