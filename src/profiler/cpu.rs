//! CPU 采样策略
//!
//! 三种策略共用同一种能力：包裹一段零参数计算（[`CpuProfiler::run`]），
//! 并输出结构化的耗时结果。插桩数据来自 [`ProfilerLayer`](super::layer::ProfilerLayer)
//! 转发的 span / event 回调，只有在 `run` 期间才会被计入。

use std::cell::RefCell;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::{Map, Value, json};
use tracing::Metadata;

use crate::common::LocalScope;

use super::mode::{CpuStrategy, ProfilingMode};

thread_local! {
    static ACTIVE_ENGINE: RefCell<Option<CpuProfiler>> = const { RefCell::new(None) };
}

/// 采样策略的时间粒度
const SAMPLE_INTERVAL: Duration = Duration::from_millis(1);

/// 无调用栈时的占位名
const ROOT_FRAME: &str = "<root>";

/// 尚未经过任何插桩点时的占位位置
const POLL_LOCATION: (&str, u32) = ("<poll>", 0);

/// 一次请求的 CPU 采样器
#[derive(Clone)]
pub struct CpuProfiler {
    inner: Arc<Mutex<Engine>>,
}

struct Engine {
    kind: EngineKind,
    busy: Duration,
    runs: u32,
}

enum EngineKind {
    Sampling(SamplingState),
    Instrumented(InstrumentedState),
    LineByLine(LineState),
}

impl CpuProfiler {
    /// 按模式选择策略，`simple` / `rpc` 等不含 CPU 策略的模式返回 None
    pub fn for_mode(mode: ProfilingMode) -> Option<Self> {
        match mode.cpu {
            CpuStrategy::Sampling => Some(Self::sampling()),
            CpuStrategy::Instrumented => Some(Self::instrumented()),
            CpuStrategy::LineByLine => Some(Self::line_by_line()),
            CpuStrategy::Disabled | CpuStrategy::Simple => None,
        }
    }

    pub fn sampling() -> Self {
        Self::with_kind(EngineKind::Sampling(SamplingState::default()))
    }

    pub fn instrumented() -> Self {
        Self::with_kind(EngineKind::Instrumented(InstrumentedState::default()))
    }

    pub fn line_by_line() -> Self {
        Self::with_kind(EngineKind::LineByLine(LineState::default()))
    }

    fn with_kind(kind: EngineKind) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Engine {
                kind,
                busy: Duration::ZERO,
                runs: 0,
            })),
        }
    }

    /// 在采样器内执行 `f`
    ///
    /// 只统计 `f` 本身的耗时，两次调用之间的等待不计入
    pub fn run<T>(&self, f: impl FnOnce() -> T) -> T {
        let _active = LocalScope::enter(&ACTIVE_ENGINE, self.clone());
        let started = Instant::now();
        self.inner.lock().kind.begin_run(started);

        let value = f();

        let ended = Instant::now();
        let mut engine = self.inner.lock();
        engine.kind.end_run(ended);
        engine.busy += ended.duration_since(started);
        engine.runs += 1;
        value
    }

    pub fn results(&self) -> Map<String, Value> {
        let engine = self.inner.lock();
        let mut results = match &engine.kind {
            EngineKind::Sampling(state) => state.results(),
            EngineKind::Instrumented(state) => state.results(),
            EngineKind::LineByLine(state) => state.results(),
        };
        results.insert("total_time".to_string(), json!(millis(engine.busy)));
        results.insert("runs".to_string(), json!(engine.runs));
        results
    }
}

impl EngineKind {
    fn begin_run(&mut self, now: Instant) {
        match self {
            EngineKind::Sampling(state) => state.mark = Some(now),
            EngineKind::Instrumented(_) => {}
            EngineKind::LineByLine(state) => state.last = Some((POLL_LOCATION, now)),
        }
    }

    fn end_run(&mut self, now: Instant) {
        match self {
            EngineKind::Sampling(state) => {
                state.charge(now);
                state.mark = None;
                // 跨 poll 未退出的 span 已无法归因
                state.stack.clear();
            }
            EngineKind::Instrumented(state) => state.stack.clear(),
            EngineKind::LineByLine(state) => {
                state.charge(now);
                state.last = None;
            }
        }
    }
}

/// 毫秒，保留三位小数
pub(crate) fn millis(d: Duration) -> f64 {
    (d.as_secs_f64() * 1_000_000.0).round() / 1000.0
}

fn span_key(metadata: &Metadata<'_>) -> String {
    format!("{}::{}", metadata.target(), metadata.name())
}

fn location(metadata: &'static Metadata<'static>) -> (&'static str, u32) {
    (
        metadata.file().unwrap_or("<unknown>"),
        metadata.line().unwrap_or(0),
    )
}

fn with_active(f: impl FnOnce(&mut EngineKind, Instant)) {
    let _ = ACTIVE_ENGINE.try_with(|slot| {
        let Ok(slot) = slot.try_borrow() else {
            return;
        };
        if let Some(profiler) = slot.as_ref() {
            let now = Instant::now();
            f(&mut profiler.inner.lock().kind, now);
        }
    });
}

pub(crate) fn on_span_created(metadata: &'static Metadata<'static>) {
    with_active(|kind, _| {
        if let EngineKind::Instrumented(state) = kind {
            state.stats.entry(span_key(metadata)).or_default().calls += 1;
        }
    });
}

pub(crate) fn on_span_enter(id: u64, metadata: &'static Metadata<'static>) {
    with_active(|kind, now| match kind {
        EngineKind::Sampling(state) => {
            state.charge(now);
            state.stack.push((id, metadata.name()));
        }
        EngineKind::Instrumented(state) => state.stack.push(OpenFrame {
            id,
            key: span_key(metadata),
            entered: now,
            children: Duration::ZERO,
        }),
        EngineKind::LineByLine(state) => state.hit(location(metadata), now),
    });
}

pub(crate) fn on_span_exit(id: u64) {
    with_active(|kind, now| match kind {
        EngineKind::Sampling(state) => {
            if state.stack.last().is_some_and(|(top, _)| *top == id) {
                state.charge(now);
                state.stack.pop();
            }
        }
        EngineKind::Instrumented(state) => state.exit(id, now),
        EngineKind::LineByLine(_) => {}
    });
}

pub(crate) fn on_event(metadata: &'static Metadata<'static>) {
    with_active(|kind, now| match kind {
        EngineKind::Sampling(state) => state.charge(now),
        EngineKind::Instrumented(_) => {}
        EngineKind::LineByLine(state) => state.hit(location(metadata), now),
    });
}

/// 时间加权采样：相邻插桩点之间的时间归入当时的调用栈
#[derive(Default)]
struct SamplingState {
    stacks: HashMap<String, Duration>,
    stack: Vec<(u64, &'static str)>,
    mark: Option<Instant>,
}

impl SamplingState {
    fn charge(&mut self, now: Instant) {
        if let Some(mark) = self.mark {
            let key = if self.stack.is_empty() {
                ROOT_FRAME.to_string()
            } else {
                self.stack
                    .iter()
                    .map(|(_, name)| *name)
                    .collect::<Vec<_>>()
                    .join(";")
            };
            *self.stacks.entry(key).or_default() += now.duration_since(mark);
        }
        self.mark = Some(now);
    }

    fn results(&self) -> Map<String, Value> {
        let mut stacks: Vec<_> = self.stacks.iter().collect();
        stacks.sort_by(|a, b| b.1.cmp(a.1));

        let interval = SAMPLE_INTERVAL.as_secs_f64();
        let mut sample_count = 0u64;
        let samples: Vec<Value> = stacks
            .into_iter()
            .map(|(stack, time)| {
                let samples = (time.as_secs_f64() / interval) as u64;
                sample_count += samples;
                json!({
                    "stack": stack,
                    "time_ms": millis(*time),
                    "samples": samples,
                })
            })
            .collect();

        let mut results = Map::new();
        results.insert("samples".to_string(), Value::Array(samples));
        results.insert("sample_count".to_string(), json!(sample_count));
        results.insert("interval_ms".to_string(), json!(millis(SAMPLE_INTERVAL)));
        results
    }
}

#[derive(Default)]
struct CallStats {
    calls: u64,
    total: Duration,
    own: Duration,
}

struct OpenFrame {
    id: u64,
    key: String,
    entered: Instant,
    children: Duration,
}

/// 基于 span 的插桩统计
#[derive(Default)]
struct InstrumentedState {
    stats: HashMap<String, CallStats>,
    stack: Vec<OpenFrame>,
}

impl InstrumentedState {
    fn exit(&mut self, id: u64, now: Instant) {
        if !self.stack.last().is_some_and(|frame| frame.id == id) {
            return;
        }
        let Some(frame) = self.stack.pop() else {
            return;
        };

        let elapsed = now.duration_since(frame.entered);
        let stats = self.stats.entry(frame.key).or_default();
        stats.total += elapsed;
        stats.own += elapsed.saturating_sub(frame.children);

        if let Some(parent) = self.stack.last_mut() {
            parent.children += elapsed;
        }
    }

    fn results(&self) -> Map<String, Value> {
        let mut stats: Vec<_> = self.stats.iter().collect();
        stats.sort_by(|a, b| b.1.total.cmp(&a.1.total).then_with(|| a.0.cmp(b.0)));

        let total_calls: u64 = stats.iter().map(|(_, s)| s.calls).sum();
        let calls: Vec<Value> = stats
            .into_iter()
            .map(|(function, s)| {
                json!({
                    "function": function,
                    "calls": s.calls,
                    "total_time_ms": millis(s.total),
                    "own_time_ms": millis(s.own),
                })
            })
            .collect();

        let mut results = Map::new();
        results.insert("calls".to_string(), Value::Array(calls));
        results.insert("total_calls".to_string(), json!(total_calls));
        results
    }
}

#[derive(Default)]
struct LineStats {
    hits: u64,
    time: Duration,
}

/// 逐行耗时：两次插桩点之间的时间归入前一个位置
#[derive(Default)]
struct LineState {
    lines: HashMap<(&'static str, u32), LineStats>,
    last: Option<((&'static str, u32), Instant)>,
}

impl LineState {
    fn charge(&mut self, now: Instant) {
        if let Some((location, at)) = self.last {
            self.lines.entry(location).or_default().time += now.duration_since(at);
        }
    }

    fn hit(&mut self, location: (&'static str, u32), now: Instant) {
        self.charge(now);
        self.lines.entry(location).or_default().hits += 1;
        self.last = Some((location, now));
    }

    fn results(&self) -> Map<String, Value> {
        let mut lines: Vec<_> = self.lines.iter().collect();
        lines.sort_by(|a, b| a.0.cmp(b.0));

        let lines: Vec<Value> = lines
            .into_iter()
            .map(|((file, line), s)| {
                json!({
                    "file": file,
                    "line": line,
                    "hits": s.hits,
                    "time_ms": millis(s.time),
                })
            })
            .collect();

        let mut results = Map::new();
        results.insert("lines".to_string(), Value::Array(lines));
        results
    }
}
