//! RPC 调用追踪
//!
//! 记录请求处理期间发出的远程调用。为了限制追踪的开销，所有实例共享
//! 一把存放在 KV 存储中的锁，同一时刻只允许一个请求被追踪；采样中间件
//! 需要强制追踪时，通过请求级的 [`LockOverride`] 绕过这把锁。

mod client;

use std::cell::RefCell;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::common::LocalScope;
use crate::profiler::context::ExecutionScope;
use crate::profiler::cpu::millis;
use crate::profiler::store::KeyValueStore;

pub use client::TracedClient;

thread_local! {
    static ACTIVE_RECORDER: RefCell<Option<RpcRecorder>> = const { RefCell::new(None) };
}

/// 共享锁的存储键
pub const LOCK_KEY: &str = "__mini_profiler_rpc_lock";

/// 默认锁超时: 60 秒
pub const DEFAULT_LOCK_TTL: Duration = Duration::from_secs(60);

/// 单次远程调用
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcCall {
    pub service: String,
    pub method: String,
    /// 相对请求开始的偏移（毫秒）
    pub start_offset_ms: f64,
    pub duration_ms: f64,
    pub status: Option<u16>,
    pub error: Option<String>,
}

/// RPC 追踪结果
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RpcTraceResults {
    pub calls: Vec<RpcCall>,
    /// 调用总耗时（毫秒）
    pub total_time: f64,
    #[serde(default)]
    pub total_calls: usize,
}

/// 一次请求的调用记录器
#[derive(Clone)]
pub struct RpcRecorder {
    started: Instant,
    calls: Arc<Mutex<Vec<RpcCall>>>,
}

impl RpcRecorder {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub(crate) fn enter(&self) -> LocalScope<RpcRecorder> {
        LocalScope::enter(&ACTIVE_RECORDER, self.clone())
    }

    fn record(
        &self,
        service: String,
        method: String,
        started: Instant,
        status: Option<u16>,
        error: Option<String>,
    ) {
        let call = RpcCall {
            service,
            method,
            start_offset_ms: millis(started.saturating_duration_since(self.started)),
            duration_ms: millis(started.elapsed()),
            status,
            error,
        };
        self.calls.lock().push(call);
    }

    pub fn results(&self) -> RpcTraceResults {
        let calls = self.calls.lock().clone();
        let total_time = calls.iter().map(|c| c.duration_ms).sum::<f64>();
        RpcTraceResults {
            total_calls: calls.len(),
            total_time: (total_time * 1000.0).round() / 1000.0,
            calls,
        }
    }
}

impl Default for RpcRecorder {
    fn default() -> Self {
        Self::new()
    }
}

/// 向当前作用域的记录器登记一次调用，作用域外调用无效果
///
/// `started` 为调用发出的时间，耗时计算到本函数被调用为止
pub fn record_call(
    service: impl Into<String>,
    method: impl Into<String>,
    started: Instant,
    status: Option<u16>,
    error: Option<String>,
) {
    let recorder = ACTIVE_RECORDER
        .try_with(|slot| slot.try_borrow().ok().and_then(|r| r.clone()))
        .ok()
        .flatten();
    if let Some(recorder) = recorder {
        recorder.record(service.into(), method.into(), started, status, error);
    }
}

/// 共享锁的获取 / 释放操作
///
/// `bypass` 指定的键直接视为成功，其余键照常访问存储
#[derive(Debug, Clone, Default)]
pub struct LockOverride {
    bypass: Option<String>,
}

impl LockOverride {
    pub fn shared() -> Self {
        Self { bypass: None }
    }

    pub fn bypass(key: impl Into<String>) -> Self {
        Self {
            bypass: Some(key.into()),
        }
    }

    fn is_bypassed(&self, key: &str) -> bool {
        self.bypass.as_deref() == Some(key)
    }

    pub fn acquire(&self, store: &dyn KeyValueStore, key: &str, ttl: Duration) -> bool {
        self.is_bypassed(key) || store.add(key, b"1".to_vec(), Some(ttl))
    }

    pub fn release(&self, store: &dyn KeyValueStore, key: &str) -> bool {
        self.is_bypassed(key) || store.delete(key)
    }
}

/// RPC 追踪器
#[derive(Clone)]
pub struct RpcTracer {
    store: Arc<dyn KeyValueStore>,
    lock_ttl: Duration,
}

impl RpcTracer {
    pub fn new(store: Arc<dyn KeyValueStore>, lock_ttl: Duration) -> Self {
        Self { store, lock_ttl }
    }

    pub fn lock_key(&self) -> &'static str {
        LOCK_KEY
    }

    /// 开始追踪；锁被其他请求持有时返回 None
    pub fn begin(&self, lock: LockOverride) -> Option<RpcSession> {
        if !lock.acquire(self.store.as_ref(), LOCK_KEY, self.lock_ttl) {
            tracing::debug!("RPC 追踪锁已被占用，本请求不追踪");
            return None;
        }
        Some(RpcSession {
            recorder: RpcRecorder::new(),
            store: self.store.clone(),
            lock,
        })
    }

    /// 未被采样的请求上常开的追踪，遵守共享锁
    pub async fn trace<F: Future>(&self, future: F) -> F::Output {
        let Some(session) = self.begin(LockOverride::shared()) else {
            return future.await;
        };

        let output = ExecutionScope::new()
            .with_rpc(Some(session.recorder()))
            .instrument(future)
            .await;

        let results = session.results();
        tracing::debug!(
            calls = results.total_calls,
            total_time_ms = results.total_time,
            "RPC 追踪完成"
        );
        output
    }
}

/// 持有共享锁的追踪会话，drop 时释放锁
pub struct RpcSession {
    recorder: RpcRecorder,
    store: Arc<dyn KeyValueStore>,
    lock: LockOverride,
}

impl RpcSession {
    pub fn recorder(&self) -> RpcRecorder {
        self.recorder.clone()
    }

    pub fn results(&self) -> RpcTraceResults {
        self.recorder.results()
    }
}

impl Drop for RpcSession {
    fn drop(&mut self) {
        self.lock.release(self.store.as_ref(), LOCK_KEY);
    }
}
