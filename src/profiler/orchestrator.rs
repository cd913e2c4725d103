//! 单次请求的采样流程
//!
//! 包装下游 handler：按模式安装日志捕获、RPC 追踪和 CPU 策略，
//! 对惰性产生的响应体逐帧在同一策略内 poll，响应体结束后汇总并写入存储。

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Instant;

use axum::body::Body;
use axum::response::Response;
use bytes::Bytes;
use http::response::Parts;
use http_body::{Body as HttpBody, Frame, SizeHint};
use serde_json::{Map, json};

use crate::rpc::{LockOverride, RpcSession, RpcTracer};

use super::context::ExecutionScope;
use super::cpu::{CpuProfiler, millis};
use super::logs::LogCapture;
use super::mode::ProfilingMode;
use super::model::{RequestMeta, RequestProfile};
use super::store::ResultStore;

/// 单次请求的采样器
pub struct RequestProfiler {
    request_id: String,
    mode: ProfilingMode,
    meta: RequestMeta,
    results: ResultStore,
    rpc: RpcTracer,
    lock: LockOverride,
}

impl RequestProfiler {
    pub fn new(
        request_id: impl Into<String>,
        mode: ProfilingMode,
        meta: RequestMeta,
        results: ResultStore,
        rpc: RpcTracer,
        lock: LockOverride,
    ) -> Self {
        Self {
            request_id: request_id.into(),
            mode,
            meta,
            results,
            rpc,
            lock,
        }
    }

    /// 执行 handler 并返回等价的响应
    ///
    /// `start_response` 在响应头确定后、响应体产生前调用，可改写响应头，
    /// 返回值表示本响应是否为重定向中转。采样结果在响应体结束后写入存储，
    /// 写入失败只记录日志。
    pub async fn run<F, S>(self, handler: F, start_response: S) -> Response
    where
        F: Future<Output = Response>,
        S: FnOnce(&mut Parts) -> bool,
    {
        let started = Instant::now();
        let started_at = chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string();

        let mut pending = PendingProfile {
            request_id: self.request_id,
            mode: self.mode,
            meta: self.meta,
            results: self.results,
            started,
            started_at,
            temporary_redirect: false,
            logs: None,
            rpc: None,
            cpu: None,
        };

        let scope = if pending.mode.is_simple() {
            ExecutionScope::new().with_request_id(&pending.request_id)
        } else {
            let logs = LogCapture::install();
            let rpc = if pending.mode.is_rpc_enabled() {
                self.rpc.begin(self.lock)
            } else {
                None
            };
            let cpu = CpuProfiler::for_mode(pending.mode);

            let scope = ExecutionScope::new()
                .with_request_id(&pending.request_id)
                .with_logs(logs.sink())
                .with_rpc(rpc.as_ref().map(RpcSession::recorder))
                .with_cpu(cpu.clone());

            pending.logs = Some(logs);
            pending.rpc = rpc;
            pending.cpu = cpu;
            scope
        };

        let response = scope.instrument(handler).await;
        let (mut parts, body) = response.into_parts();
        pending.temporary_redirect = start_response(&mut parts);

        // 已物化的响应体没有后续计算，不再逐帧包裹
        let materialized = body.size_hint().exact().is_some();
        let scope = if pending.mode.is_simple() || !materialized {
            Some(scope)
        } else {
            None
        };

        let body = ProfiledBody {
            inner: body,
            scope,
            pending: Some(pending),
        };
        Response::from_parts(parts, Body::new(body))
    }
}

/// 等待响应体结束后写入的采样结果
struct PendingProfile {
    request_id: String,
    mode: ProfilingMode,
    meta: RequestMeta,
    results: ResultStore,
    started: Instant,
    started_at: String,
    temporary_redirect: bool,
    logs: Option<LogCapture>,
    rpc: Option<RpcSession>,
    cpu: Option<CpuProfiler>,
}

impl PendingProfile {
    fn complete(self) {
        let log_lines = self.logs.map(LogCapture::finish).unwrap_or_default();
        let wall_time = millis(self.started.elapsed());

        let mut cpu_profile_results = Map::new();
        cpu_profile_results.insert("total_time".to_string(), json!(wall_time));
        cpu_profile_results.insert("wall_time".to_string(), json!(wall_time));
        if let Some(cpu) = &self.cpu {
            cpu_profile_results.extend(cpu.results());
        }

        let rpc_trace_results = self
            .rpc
            .as_ref()
            .map(RpcSession::results)
            .unwrap_or_default();
        // 释放 RPC 追踪锁
        drop(self.rpc);

        let profile = RequestProfile {
            display_url: self.meta.display_url(),
            request_id: self.request_id,
            logging_request_id: self.meta.logging_request_id,
            method: self.meta.method,
            full_url: self.meta.full_url,
            started_at: self.started_at,
            mode: self.mode,
            cpu_profile_results,
            rpc_trace_results,
            log_lines,
            is_redirect_continuation: self.temporary_redirect,
            disabled: false,
        };

        match self.results.store(&profile) {
            Ok(()) => tracing::debug!(
                request_id = %profile.request_id,
                mode = %profile.mode,
                "采样结果已保存"
            ),
            Err(e) => tracing::warn!(
                request_id = %profile.request_id,
                "采样结果保存失败: {}",
                e
            ),
        }
    }
}

/// 逐帧采样的响应体
struct ProfiledBody {
    inner: Body,
    /// 为 None 时直接透传
    scope: Option<ExecutionScope>,
    pending: Option<PendingProfile>,
}

impl ProfiledBody {
    fn complete(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.complete();
        }
    }
}

impl HttpBody for ProfiledBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = self.get_mut();
        let inner = &mut this.inner;
        let poll = match &this.scope {
            Some(scope) => scope.enter(|| Pin::new(&mut *inner).poll_frame(cx)),
            None => Pin::new(inner).poll_frame(cx),
        };

        match &poll {
            Poll::Ready(None) => this.complete(),
            Poll::Ready(Some(Ok(_))) if this.inner.is_end_stream() => this.complete(),
            Poll::Ready(Some(Err(_))) => {
                if let Some(pending) = this.pending.take() {
                    tracing::debug!(request_id = %pending.request_id, "响应体出错，丢弃采样结果");
                }
            }
            _ => {}
        }
        poll
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for ProfiledBody {
    fn drop(&mut self) {
        if self.pending.is_none() {
            return;
        }
        // 空响应体可能从未被 poll
        if self.inner.is_end_stream() {
            self.complete();
        } else if let Some(pending) = self.pending.take() {
            tracing::debug!(request_id = %pending.request_id, "响应体未读完，丢弃采样结果");
        }
    }
}
