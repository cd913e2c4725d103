//! 请求采样模块
//!
//! 为每个请求生成采样 ID，按模式收集日志、RPC 调用和 CPU 耗时，
//! 响应体结束后把汇总结果写入存储，并提供查询接口

pub mod context;
pub mod cpu;
pub mod layer;
pub mod logs;
pub mod logservice;
pub mod middleware;
pub mod mode;
pub mod model;
pub mod orchestrator;
pub mod policy;
pub mod redirect;
pub mod store;
mod handlers;
mod router;
mod types;

/// 采样器自身接口的路径前缀，此前缀下的请求不会被采样
pub const PROFILER_PATH_PREFIX: &str = "/mini_profiler/";

pub use context::{CurrentRequestId, ExecutionScope, RequestContext};
pub use cpu::CpuProfiler;
pub use layer::ProfilerLayer;
pub use logservice::{HttpLogService, LocalLogService, LogService, RequestLogInfo};
pub use middleware::{ProfilerState, generate_request_id, profiler_middleware};
pub use mode::{CpuStrategy, ProfilingMode};
pub use model::RequestProfile;
pub use orchestrator::RequestProfiler;
pub use policy::{ConfigPolicy, ProfilePolicy};
pub use router::{cors_layer, create_profiler_router};
pub use store::{KeyValueStore, MemoryStore, ResultStore, StoreError};
