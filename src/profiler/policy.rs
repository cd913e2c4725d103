//! 采样策略：是否采样、采用何种模式

use axum_extra::extract::cookie::CookieJar;
use http::request::Parts;

use super::mode::ProfilingMode;

/// 保存采样模式的 Cookie 名
pub const MODE_COOKIE: &str = "g-m-p-mode";

/// 按请求决定是否采样及采样模式
pub trait ProfilePolicy: Send + Sync {
    fn should_profile(&self, parts: &Parts) -> bool;

    fn resolve_mode(&self, parts: &Parts) -> ProfilingMode;
}

/// 基于配置的默认策略
///
/// 模式优先取 `g-m-p-mode` Cookie，无法解析时回退到配置的默认模式
#[derive(Debug, Clone)]
pub struct ConfigPolicy {
    enabled: bool,
    default_mode: ProfilingMode,
}

impl ConfigPolicy {
    pub fn new(enabled: bool, default_mode: ProfilingMode) -> Self {
        Self {
            enabled,
            default_mode,
        }
    }
}

impl ProfilePolicy for ConfigPolicy {
    fn should_profile(&self, _parts: &Parts) -> bool {
        self.enabled
    }

    fn resolve_mode(&self, parts: &Parts) -> ProfilingMode {
        let jar = CookieJar::from_headers(&parts.headers);
        let Some(cookie) = jar.get(MODE_COOKIE) else {
            return self.default_mode;
        };
        match cookie.value().parse() {
            Ok(mode) => mode,
            Err(e) => {
                tracing::debug!("忽略无效的采样模式 Cookie: {}", e);
                self.default_mode
            }
        }
    }
}
