//! 请求执行上下文
//!
//! 每次 poll 请求的 handler future 或响应体时，都在当前线程上安装本请求的
//! 请求 ID、日志接收器、RPC 记录器以及 CPU 采样策略，poll 返回后立即恢复。
//! 同一线程上一次 poll 期间不会穿插其他任务，因此捕获严格限定在本请求内。

use std::cell::RefCell;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use crate::common::LocalScope;
use crate::rpc::RpcRecorder;

use super::cpu::CpuProfiler;
use super::logs::LogSink;
use super::mode::ProfilingMode;

thread_local! {
    static CURRENT_REQUEST_ID: RefCell<Option<Arc<str>>> = const { RefCell::new(None) };
}

/// 当前请求的采样 ID
///
/// 仅在本请求的 poll 期间可见，不可跨线程读取
pub struct CurrentRequestId;

impl CurrentRequestId {
    pub fn get() -> Option<String> {
        CURRENT_REQUEST_ID
            .try_with(|slot| slot.borrow().as_deref().map(str::to_string))
            .ok()
            .flatten()
    }
}

/// 注入到请求 extensions 中的上下文，供 handler 显式获取
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub mode: ProfilingMode,
}

/// 按 poll 安装的执行作用域
#[derive(Clone, Default)]
pub struct ExecutionScope {
    request_id: Option<Arc<str>>,
    logs: Option<LogSink>,
    rpc: Option<RpcRecorder>,
    cpu: Option<CpuProfiler>,
}

impl ExecutionScope {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_request_id(mut self, request_id: &str) -> Self {
        self.request_id = Some(Arc::from(request_id));
        self
    }

    pub fn with_logs(mut self, sink: Option<LogSink>) -> Self {
        self.logs = sink;
        self
    }

    pub fn with_rpc(mut self, recorder: Option<RpcRecorder>) -> Self {
        self.rpc = recorder;
        self
    }

    pub fn with_cpu(mut self, cpu: Option<CpuProfiler>) -> Self {
        self.cpu = cpu;
        self
    }

    /// 在作用域内执行 `f`，CPU 策略存在时由其包裹执行
    pub fn enter<T>(&self, f: impl FnOnce() -> T) -> T {
        let _request_id = self
            .request_id
            .clone()
            .map(|id| LocalScope::enter(&CURRENT_REQUEST_ID, id));
        let _logs = self.logs.as_ref().map(LogSink::enter);
        let _rpc = self.rpc.as_ref().map(RpcRecorder::enter);

        match &self.cpu {
            Some(cpu) => cpu.run(f),
            None => f(),
        }
    }

    /// 包装 future，使其每次 poll 都在本作用域内执行
    pub fn instrument<F: Future>(&self, future: F) -> Scoped<F> {
        Scoped {
            inner: Box::pin(future),
            scope: self.clone(),
        }
    }
}

/// 在 [`ExecutionScope`] 内逐次 poll 的 future
pub struct Scoped<F> {
    inner: Pin<Box<F>>,
    scope: ExecutionScope,
}

impl<F: Future> Future for Scoped<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let Self { inner, scope } = self.get_mut();
        scope.enter(|| inner.as_mut().poll(cx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_id_visible_only_inside_scope() {
        let scope = ExecutionScope::new().with_request_id("abc123");
        assert_eq!(CurrentRequestId::get(), None);
        let seen = scope.enter(CurrentRequestId::get);
        assert_eq!(seen.as_deref(), Some("abc123"));
        assert_eq!(CurrentRequestId::get(), None);
    }

    #[tokio::test]
    async fn test_instrumented_future_sees_id_on_every_poll() {
        let scope = ExecutionScope::new().with_request_id("req-1");
        let seen = scope
            .instrument(async {
                let first = CurrentRequestId::get();
                tokio::task::yield_now().await;
                let second = CurrentRequestId::get();
                (first, second)
            })
            .await;
        assert_eq!(seen.0.as_deref(), Some("req-1"));
        assert_eq!(seen.1.as_deref(), Some("req-1"));
        assert_eq!(CurrentRequestId::get(), None);
    }

    #[tokio::test]
    async fn test_interleaved_requests_do_not_share_ids() {
        let a = ExecutionScope::new().with_request_id("a").instrument(async {
            tokio::task::yield_now().await;
            CurrentRequestId::get()
        });
        let b = ExecutionScope::new().with_request_id("b").instrument(async {
            tokio::task::yield_now().await;
            CurrentRequestId::get()
        });
        let (a, b) = tokio::join!(a, b);
        assert_eq!(a.as_deref(), Some("a"));
        assert_eq!(b.as_deref(), Some("b"));
    }
}
