use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::profiler::ProfilingMode;

/// 采样服务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    /// 是否启用请求采样
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// 未通过 Cookie 指定时使用的采样模式
    #[serde(default)]
    pub default_mode: ProfilingMode,

    /// 未采样的请求是否仍走 RPC 追踪
    #[serde(default = "default_keep_rpc_tracing")]
    pub keep_rpc_tracing: bool,

    /// 采样结果保留时间（秒）
    #[serde(default = "default_store_ttl_secs")]
    pub store_ttl_secs: u64,

    /// 单条采样结果压缩后的最大字节数
    #[serde(default = "default_max_value_size")]
    pub max_value_size: usize,

    /// RPC 追踪锁超时（秒）
    #[serde(default = "default_rpc_lock_ttl_secs")]
    pub rpc_lock_ttl_secs: u64,

    /// 携带日志服务请求 ID 的请求头
    #[serde(default = "default_logging_request_id_header")]
    pub logging_request_id_header: String,

    /// 日志服务地址（可选）
    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_service_url: Option<String>,

    /// 本地开发环境，日志查询直接返回占位结果
    #[serde(default)]
    pub dev_server: bool,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_enabled() -> bool {
    true
}

fn default_keep_rpc_tracing() -> bool {
    true
}

fn default_store_ttl_secs() -> u64 {
    60 * 60
}

fn default_max_value_size() -> usize {
    1_000_000
}

fn default_rpc_lock_ttl_secs() -> u64 {
    60
}

fn default_logging_request_id_header() -> String {
    "x-request-log-id".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            enabled: default_enabled(),
            default_mode: ProfilingMode::default(),
            keep_rpc_tracing: default_keep_rpc_tracing(),
            store_ttl_secs: default_store_ttl_secs(),
            max_value_size: default_max_value_size(),
            rpc_lock_ttl_secs: default_rpc_lock_ttl_secs(),
            logging_request_id_header: default_logging_request_id_header(),
            log_service_url: None,
            dev_server: false,
        }
    }
}

impl Config {
    /// 获取默认配置文件路径
    pub fn default_config_path() -> &'static str {
        "config.json"
    }

    pub fn store_ttl(&self) -> Duration {
        Duration::from_secs(self.store_ttl_secs)
    }

    pub fn rpc_lock_ttl(&self) -> Duration {
        Duration::from_secs(self.rpc_lock_ttl_secs)
    }

    /// 从文件加载配置
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::info!("配置文件 {} 不存在，使用默认配置", path.display());
            return Ok(Self::default());
        }

        let content = fs::read_to_string(path)
            .with_context(|| format!("读取配置文件失败: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("解析配置文件失败: {}", path.display()))
    }
}
