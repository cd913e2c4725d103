//! 采样模式
//!
//! CPU 策略（至多一个）与 RPC 追踪开关的组合，按请求解析

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// CPU 采样策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CpuStrategy {
    /// 完全不采样
    Disabled,
    /// 仅记录起止时间
    Simple,
    /// 时间加权的调用栈采样
    Sampling,
    /// 基于 span 的插桩统计
    Instrumented,
    /// 逐行耗时
    LineByLine,
}

/// 单次请求的采样模式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProfilingMode {
    pub cpu: CpuStrategy,
    pub rpc: bool,
}

impl ProfilingMode {
    pub const DISABLED: Self = Self::new(CpuStrategy::Disabled, false);
    pub const SIMPLE: Self = Self::new(CpuStrategy::Simple, false);
    pub const RPC_ONLY: Self = Self::new(CpuStrategy::Simple, true);
    pub const RPC_AND_INSTRUMENTED: Self = Self::new(CpuStrategy::Instrumented, true);

    pub const fn new(cpu: CpuStrategy, rpc: bool) -> Self {
        Self { cpu, rpc }
    }

    pub fn is_enabled(&self) -> bool {
        self.cpu != CpuStrategy::Disabled
    }

    /// 只计时：不捕获日志，不启用任何策略
    pub fn is_simple(&self) -> bool {
        self.cpu == CpuStrategy::Simple && !self.rpc
    }

    pub fn is_rpc_enabled(&self) -> bool {
        self.is_enabled() && self.rpc
    }

    pub fn is_sampling_enabled(&self) -> bool {
        self.cpu == CpuStrategy::Sampling
    }

    pub fn is_instrumented_enabled(&self) -> bool {
        self.cpu == CpuStrategy::Instrumented
    }

    pub fn is_linebyline_enabled(&self) -> bool {
        self.cpu == CpuStrategy::LineByLine
    }
}

impl Default for ProfilingMode {
    fn default() -> Self {
        Self::RPC_AND_INSTRUMENTED
    }
}

impl fmt::Display for ProfilingMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cpu = match self.cpu {
            CpuStrategy::Disabled => return f.write_str("disabled"),
            CpuStrategy::Simple if self.rpc => return f.write_str("rpc"),
            CpuStrategy::Simple => "simple",
            CpuStrategy::Sampling => "sampling",
            CpuStrategy::Instrumented => "instrumented",
            CpuStrategy::LineByLine => "linebyline",
        };
        if self.rpc {
            write!(f, "rpc-{}", cpu)
        } else {
            f.write_str(cpu)
        }
    }
}

/// 模式解析错误
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseModeError(pub String);

impl fmt::Display for ParseModeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "未知的采样模式: {}", self.0)
    }
}

impl std::error::Error for ParseModeError {}

impl FromStr for ProfilingMode {
    type Err = ParseModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s == "disabled" {
            return Ok(Self::DISABLED);
        }
        if s == "rpc" {
            return Ok(Self::RPC_ONLY);
        }

        let (rpc, cpu) = match s.strip_prefix("rpc-") {
            Some(rest) => (true, rest),
            None => (false, s),
        };
        let cpu = match cpu {
            "simple" => CpuStrategy::Simple,
            "sampling" => CpuStrategy::Sampling,
            "instrumented" => CpuStrategy::Instrumented,
            "linebyline" => CpuStrategy::LineByLine,
            _ => return Err(ParseModeError(s.to_string())),
        };
        Ok(Self::new(cpu, rpc))
    }
}

impl TryFrom<String> for ProfilingMode {
    type Error = ParseModeError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ProfilingMode> for String {
    fn from(mode: ProfilingMode) -> Self {
        mode.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display_all_modes() {
        for text in [
            "disabled",
            "simple",
            "sampling",
            "instrumented",
            "linebyline",
            "rpc",
            "rpc-sampling",
            "rpc-instrumented",
            "rpc-linebyline",
        ] {
            let mode: ProfilingMode = text.parse().unwrap();
            assert_eq!(mode.to_string(), text);
        }
    }

    #[test]
    fn test_rpc_simple_is_rpc_only() {
        let mode: ProfilingMode = "rpc-simple".parse().unwrap();
        assert_eq!(mode, ProfilingMode::RPC_ONLY);
        assert!(!mode.is_simple());
        assert!(mode.is_rpc_enabled());
    }

    #[test]
    fn test_unknown_mode_rejected() {
        assert!("cpu-everything".parse::<ProfilingMode>().is_err());
        assert!("rpc-disabled".parse::<ProfilingMode>().is_err());
    }

    #[test]
    fn test_strategy_predicates_are_exclusive() {
        let mode: ProfilingMode = "rpc-sampling".parse().unwrap();
        assert!(mode.is_sampling_enabled());
        assert!(!mode.is_instrumented_enabled());
        assert!(!mode.is_linebyline_enabled());
        assert!(!ProfilingMode::DISABLED.is_rpc_enabled());
    }

    #[test]
    fn test_serde_uses_text_form() {
        let json = serde_json::to_string(&ProfilingMode::RPC_AND_INSTRUMENTED).unwrap();
        assert_eq!(json, "\"rpc-instrumented\"");
        let mode: ProfilingMode = serde_json::from_str("\"linebyline\"").unwrap();
        assert!(mode.is_linebyline_enabled());
    }
}
