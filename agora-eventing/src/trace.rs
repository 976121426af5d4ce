//! 跨发布/消费边界的链路上下文（W3C Trace Context）
//!
//! `traceparent` 形如 `00-<trace-id 32 hex>-<span-id 16 hex>-<flags 2 hex>`。
//! 头部缺失或格式错误时开启新的根上下文，从不因此让消息失败。
//!
//! 当前上下文保存在 tokio task-local 中：消费运行时在 `TraceContext::scope`
//! 内调用处理器，处理器内再发布的事件自然延续同一条链路。

use crate::envelope::Headers;
use std::fmt;
use std::future::Future;

tokio::task_local! {
    static CURRENT: TraceContext;
}

const VERSION: &str = "00";
const FLAG_SAMPLED: u8 = 0x01;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceContext {
    pub trace_id: [u8; 16],
    pub span_id: [u8; 8],
    pub sampled: bool,
    /// 厂商扩展，原样透传
    pub tracestate: Option<String>,
}

impl TraceContext {
    /// 新的根上下文
    pub fn root() -> Self {
        Self {
            trace_id: non_zero(rand::random()),
            span_id: non_zero(rand::random()),
            sampled: true,
            tracestate: None,
        }
    }

    /// 同一 trace 下的新 span
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id,
            span_id: non_zero(rand::random()),
            sampled: self.sampled,
            tracestate: self.tracestate.clone(),
        }
    }

    /// 当前任务所处的上下文
    pub fn current() -> Option<Self> {
        CURRENT.try_with(Clone::clone).ok()
    }

    /// 以 `self` 为当前上下文运行 `fut`
    pub async fn scope<F: Future>(self, fut: F) -> F::Output {
        CURRENT.scope(self, fut).await
    }

    pub fn trace_id_hex(&self) -> String {
        hex::encode(self.trace_id)
    }

    pub fn to_traceparent(&self) -> String {
        let flags = if self.sampled { FLAG_SAMPLED } else { 0 };
        format!(
            "{VERSION}-{}-{}-{:02x}",
            hex::encode(self.trace_id),
            hex::encode(self.span_id),
            flags
        )
    }

    /// 解析 `traceparent`；非法值返回 `None`
    pub fn parse_traceparent(value: &str) -> Option<Self> {
        let value = value.trim();
        if value.bytes().any(|b| b.is_ascii_uppercase()) {
            return None;
        }

        let parts: Vec<&str> = value.split('-').collect();
        let [version, trace, span, flags, rest @ ..] = parts.as_slice() else {
            return None;
        };
        if version.len() != 2 || *version == "ff" || (*version == VERSION && !rest.is_empty()) {
            return None;
        }
        hex::decode(version).ok()?;

        let mut trace_id = [0u8; 16];
        let mut span_id = [0u8; 8];
        let mut flag = [0u8; 1];
        hex::decode_to_slice(trace, &mut trace_id).ok()?;
        hex::decode_to_slice(span, &mut span_id).ok()?;
        hex::decode_to_slice(flags, &mut flag).ok()?;
        if trace_id == [0; 16] || span_id == [0; 8] {
            return None;
        }

        Some(Self {
            trace_id,
            span_id,
            sampled: flag[0] & FLAG_SAMPLED != 0,
            tracestate: None,
        })
    }
}

impl fmt::Display for TraceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_traceparent())
    }
}

fn non_zero<const N: usize>(mut id: [u8; N]) -> [u8; N] {
    if id.iter().all(|b| *b == 0) {
        id[N - 1] = 1;
    }
    id
}

/// 链路上下文传播器
pub trait TracePropagator: Send + Sync {
    /// 写入当前上下文的子 span（无当前上下文时为新根）
    fn inject(&self, headers: &mut Headers);

    /// 从头部延续远端上下文；缺失或非法时返回新根
    fn extract(&self, headers: &Headers) -> TraceContext;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct W3cTraceContextPropagator;

impl TracePropagator for W3cTraceContextPropagator {
    fn inject(&self, headers: &mut Headers) {
        let ctx = match TraceContext::current() {
            Some(current) => current.child(),
            // 调用方已带上 traceparent 时延续之
            None => self.extract(headers),
        };
        headers.traceparent = Some(ctx.to_traceparent());
        if let Some(state) = ctx.tracestate {
            headers.tracestate = Some(state);
        }
    }

    fn extract(&self, headers: &Headers) -> TraceContext {
        match headers
            .traceparent
            .as_deref()
            .and_then(TraceContext::parse_traceparent)
        {
            Some(remote) => {
                let mut ctx = remote.child();
                ctx.tracestate = headers.tracestate.clone();
                ctx
            }
            None => TraceContext::root(),
        }
    }
}
