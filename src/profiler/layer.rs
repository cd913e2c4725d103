//! tracing 订阅层
//!
//! 把 span / event 回调转发给当前执行作用域中的日志接收器与 CPU 采样器。
//! 作用域之外的回调直接忽略，因此该层可以不加过滤地挂在全局订阅器上。

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::span::{Attributes, Id};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer};
use tracing_subscriber::registry::LookupSpan;

use super::{cpu, logs};

static REGISTERED: AtomicBool = AtomicBool::new(false);

/// 是否已构造过 [`ProfilerLayer`]
pub(crate) fn is_registered() -> bool {
    REGISTERED.load(Ordering::Acquire)
}

/// 采样器的 tracing 层
///
/// ```ignore
/// tracing_subscriber::registry()
///     .with(tracing_subscriber::fmt::layer().with_filter(EnvFilter::new("info")))
///     .with(ProfilerLayer::new())
///     .init();
/// ```
#[derive(Debug)]
pub struct ProfilerLayer {
    _private: (),
}

impl ProfilerLayer {
    pub fn new() -> Self {
        REGISTERED.store(true, Ordering::Release);
        Self { _private: () }
    }
}

impl Default for ProfilerLayer {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> Layer<S> for ProfilerLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &Attributes<'_>, _id: &Id, _ctx: Context<'_, S>) {
        cpu::on_span_created(attrs.metadata());
    }

    fn on_enter(&self, id: &Id, ctx: Context<'_, S>) {
        if let Some(span) = ctx.span(id) {
            cpu::on_span_enter(id.into_u64(), span.metadata());
        }
    }

    fn on_exit(&self, id: &Id, _ctx: Context<'_, S>) {
        cpu::on_span_exit(id.into_u64());
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        if logs::is_capturing() {
            let function = ctx
                .event_span(event)
                .map(|span| span.name())
                .unwrap_or_else(|| event.metadata().target());
            logs::write_record(event, function);
        }
        cpu::on_event(event.metadata());
    }
}
