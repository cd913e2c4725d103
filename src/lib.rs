//! 请求级采样中间件
//!
//! 为 axum 应用中的每个请求收集日志、RPC 调用和 CPU 耗时，
//! 结果按采样 ID 暂存，由 `/mini_profiler/` 下的接口读取

pub mod common;
pub mod model;
pub mod profiler;
pub mod rpc;
