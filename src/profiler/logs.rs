//! 请求级日志捕获
//!
//! 请求开始时创建内存接收器，期间本请求执行作用域内产生的 tracing 事件按
//! 制表符分隔的文本写入，请求结束后再还原为结构化的日志行。

use std::cell::RefCell;
use std::fmt::Write as _;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::Level;
use tracing::field::{Field, Visit};

use crate::common::LocalScope;

use super::layer;

thread_local! {
    static ACTIVE_SINK: RefCell<Option<LogSink>> = const { RefCell::new(None) };
}

/// 内存日志接收器
#[derive(Clone, Default)]
pub struct LogSink {
    buffer: Arc<Mutex<String>>,
}

impl LogSink {
    pub(crate) fn enter(&self) -> LocalScope<LogSink> {
        LocalScope::enter(&ACTIVE_SINK, self.clone())
    }

    fn contents(&self) -> String {
        self.buffer.lock().clone()
    }
}

/// 结构化日志行
///
/// 字段依次为：级别、时间、函数名、文件名、行号、消息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct LogLine(pub Vec<String>);

impl LogLine {
    pub fn level(&self) -> Option<u8> {
        self.0.first().and_then(|f| f.parse().ok())
    }

    pub fn message(&self) -> &str {
        self.0.last().map(String::as_str).unwrap_or("")
    }
}

/// 一次请求的日志捕获
///
/// 进程中没有注册 [`ProfilerLayer`](super::layer::ProfilerLayer) 时无法安装接收器，
/// 此时退化为空捕获
pub struct LogCapture {
    sink: Option<LogSink>,
}

impl LogCapture {
    pub fn install() -> Self {
        if !layer::is_registered() {
            tracing::debug!("未注册 ProfilerLayer，日志捕获已跳过");
            return Self { sink: None };
        }
        Self {
            sink: Some(LogSink::default()),
        }
    }

    pub fn sink(&self) -> Option<LogSink> {
        self.sink.clone()
    }

    /// 卸载接收器并返回捕获到的日志行（从旧到新）
    pub fn finish(self) -> Vec<LogLine> {
        match self.sink {
            Some(sink) => parse_log_lines(&sink.contents()),
            None => Vec::new(),
        }
    }
}

/// 当前线程是否有激活的接收器
pub(crate) fn is_capturing() -> bool {
    ACTIVE_SINK
        .try_with(|slot| slot.try_borrow().map(|s| s.is_some()).unwrap_or(false))
        .unwrap_or(false)
}

/// 日志级别对应的数值，与前端展示约定一致
fn level_number(level: &Level) -> u8 {
    match *level {
        Level::TRACE => 5,
        Level::DEBUG => 10,
        Level::INFO => 20,
        Level::WARN => 30,
        Level::ERROR => 40,
    }
}

/// 将一条事件写入当前线程激活的接收器
pub(crate) fn write_record(event: &tracing::Event<'_>, function: &str) {
    let Ok(Some(sink)) = ACTIVE_SINK.try_with(|slot| slot.try_borrow().ok().and_then(|s| s.clone()))
    else {
        return;
    };

    let metadata = event.metadata();
    let mut visitor = MessageVisitor::default();
    event.record(&mut visitor);

    let file = metadata
        .file()
        .map(|f| f.rsplit(['/', '\\']).next().unwrap_or(f))
        .unwrap_or("");
    let line = metadata.line().map(|l| l.to_string()).unwrap_or_default();
    let timestamp = chrono::Local::now().format("%M:%S%.3f");

    let mut buffer = sink.buffer.lock();
    let _ = writeln!(
        buffer,
        "{}\t{}\t{}\t{}\t{}\t{}",
        level_number(metadata.level()),
        timestamp,
        function,
        file,
        line,
        visitor.finish().replace('\t', " ")
    );
}

/// 收集事件的 message 与其余字段
#[derive(Default)]
struct MessageVisitor {
    message: String,
    fields: String,
}

impl MessageVisitor {
    fn finish(self) -> String {
        if self.fields.is_empty() {
            self.message
        } else if self.message.is_empty() {
            self.fields.trim_start().to_string()
        } else {
            format!("{}{}", self.message, self.fields)
        }
    }
}

impl Visit for MessageVisitor {
    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message.push_str(value);
        } else {
            let _ = write!(self.fields, " {}={}", field.name(), value);
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.message, "{:?}", value);
        } else {
            let _ = write!(self.fields, " {}={:?}", field.name(), value);
        }
    }
}

/// 将捕获的原始文本还原为结构化日志行
///
/// 含制表符的行开启一条新记录；不含制表符的行属于上一条记录的多行消息
/// （如错误堆栈），以换行拼接到其最后一个字段，上一字段为空时不加换行。
pub fn parse_log_lines(raw: &str) -> Vec<LogLine> {
    let mut lines: Vec<LogLine> = Vec::new();

    for line in raw.split('\n').filter(|l| !l.is_empty()) {
        if line.contains('\t') {
            lines.push(LogLine(line.split('\t').map(str::to_string).collect()));
            continue;
        }

        match lines.last_mut().and_then(|record| record.0.last_mut()) {
            Some(previous) => {
                if !previous.is_empty() {
                    previous.push('\n');
                }
                previous.push_str(line);
            }
            // 没有可以续接的记录
            None => lines.push(LogLine(vec![line.to_string()])),
        }
    }

    lines
}
