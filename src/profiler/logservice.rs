//! 外部日志服务查询
//!
//! 按日志服务的请求 ID 查询排队耗时、是否为冷启动请求等信息。

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

/// 日志服务中的请求信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestLogInfo {
    /// 排队耗时（毫秒）
    pub pending_ms: u64,
    /// 是否为实例冷启动后的首个请求
    pub loading_request: bool,
    pub logging_request_id: String,
}

impl RequestLogInfo {
    /// 本地环境或查询失败时的占位结果
    pub fn stub(logging_request_id: &str) -> Self {
        Self {
            pending_ms: 0,
            loading_request: false,
            logging_request_id: logging_request_id.to_string(),
        }
    }
}

#[async_trait]
pub trait LogService: Send + Sync {
    /// 查询单个请求，服务中不存在时返回 None
    async fn fetch(&self, logging_request_id: &str) -> anyhow::Result<Option<RequestLogInfo>>;
}

/// 不连接任何服务，总是返回占位结果
#[derive(Debug, Clone, Default)]
pub struct LocalLogService;

#[async_trait]
impl LogService for LocalLogService {
    async fn fetch(&self, logging_request_id: &str) -> anyhow::Result<Option<RequestLogInfo>> {
        Ok(Some(RequestLogInfo::stub(logging_request_id)))
    }
}

/// 远端日志记录
#[derive(Debug, Deserialize)]
struct RemoteRequestLog {
    #[serde(alias = "pending_time")]
    pending_ms: u64,
    #[serde(alias = "was_loading_request")]
    loading_request: bool,
}

/// 通过 HTTP 查询日志服务：`GET {base_url}/requests/{id}`
#[derive(Debug, Clone)]
pub struct HttpLogService {
    client: Client,
    base_url: String,
}

impl HttpLogService {
    pub fn new(client: Client, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into().trim_end_matches('/').to_string();
        Self { client, base_url }
    }
}

#[async_trait]
impl LogService for HttpLogService {
    async fn fetch(&self, logging_request_id: &str) -> anyhow::Result<Option<RequestLogInfo>> {
        let url = format!(
            "{}/requests/{}",
            self.base_url,
            urlencoding::encode(logging_request_id)
        );
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .with_context(|| format!("请求日志服务失败: {}", url))?;

        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let log: RemoteRequestLog = response
            .error_for_status()
            .context("日志服务返回错误状态")?
            .json()
            .await
            .context("解析日志服务响应失败")?;

        Ok(Some(RequestLogInfo {
            pending_ms: log.pending_ms,
            loading_request: log.loading_request,
            logging_request_id: logging_request_id.to_string(),
        }))
    }
}
