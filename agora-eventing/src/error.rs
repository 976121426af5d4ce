//! 事件投递运行时统一错误定义
//!
//! 错误按“可否通过等待恢复”归类（`FailureClass`），消费运行时据此决定
//! 直接死信、进入重试，还是作为致命错误中止处理循环。
//!
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// 失败分类
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// 重放也无法修复（结构损坏、语义非法、业务规则拒绝）
    Permanent,
    /// 等待后可能成功（网络、broker 抖动、下游暂不可用）
    Transient,
    /// 可能造成静默丢消息，必须上报
    Fatal,
}

/// 统一错误类型
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum EventingError {
    // --- 编解码 ---
    #[error("malformed message: {reason}")]
    MalformedMessage { reason: String },
    #[error("validation error: {reason}")]
    Validation { reason: String },
    #[error("serialization error: {source}")]
    Serde {
        #[from]
        source: serde_json::Error,
    },

    // --- 处理器 ---
    #[error("handler error: handler={handler}, reason={source}")]
    Handler {
        handler: String,
        #[source]
        source: HandlerError,
    },

    // --- 传输 ---
    #[error("transport error: {reason}")]
    Transport { reason: String },
    #[error("publish error: exchange={exchange}, reason={reason}")]
    Publish { exchange: String, reason: String },
    #[error("dead-letter publish failed: event_id={event_id}, reason={reason}")]
    DeadLetterPublish { event_id: String, reason: String },

    // --- 运行时 ---
    #[error("consumer task failed: task={task}, reason={reason}")]
    TaskFailed { task: String, reason: String },

    // --- 通用 ---
    #[error("invalid config: {reason}")]
    Config { reason: String },
}

impl EventingError {
    pub fn malformed(reason: impl Into<String>) -> Self {
        Self::MalformedMessage {
            reason: reason.into(),
        }
    }

    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation {
            reason: reason.into(),
        }
    }

    pub fn transport(reason: impl Into<String>) -> Self {
        Self::Transport {
            reason: reason.into(),
        }
    }

    pub fn config(reason: impl Into<String>) -> Self {
        Self::Config {
            reason: reason.into(),
        }
    }

    /// 错误分类，决定传播策略
    pub fn class(&self) -> FailureClass {
        match self {
            Self::MalformedMessage { .. } | Self::Validation { .. } | Self::Serde { .. } => {
                FailureClass::Permanent
            }
            Self::Config { .. } => FailureClass::Permanent,
            Self::Handler { source, .. } => source.class(),
            Self::Transport { .. } | Self::Publish { .. } => FailureClass::Transient,
            Self::DeadLetterPublish { .. } | Self::TaskFailed { .. } => FailureClass::Fatal,
        }
    }

    /// 死信中记录的错误种类
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::MalformedMessage { .. } | Self::Serde { .. } => ErrorKind::MalformedMessage,
            Self::Validation { .. } | Self::Config { .. } => ErrorKind::Validation,
            Self::Handler { .. } => ErrorKind::Handler,
            Self::Transport { .. } | Self::Publish { .. } | Self::TaskFailed { .. } => {
                ErrorKind::Transport
            }
            Self::DeadLetterPublish { .. } => ErrorKind::DeadLetterPublish,
        }
    }
}

/// 统一 Result 类型别名
pub type EventingResult<T> = Result<T, EventingError>;

/// 错误种类（死信线上格式中的 `error.kind`）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    #[serde(rename = "MalformedMessageError")]
    MalformedMessage,
    #[serde(rename = "ValidationError")]
    Validation,
    #[serde(rename = "HandlerError")]
    Handler,
    #[serde(rename = "TransportError")]
    Transport,
    #[serde(rename = "DeadLetterPublishFailure")]
    DeadLetterPublish,
}

/// 处理器返回的错误
///
/// 默认视为瞬时错误（会被重试）；业务规则类失败可用 [`HandlerError::permanent`]
/// 标记为永久错误，直接进入死信。
#[derive(Debug)]
pub struct HandlerError {
    class: FailureClass,
    inner: anyhow::Error,
}

impl HandlerError {
    pub fn transient(err: impl Into<anyhow::Error>) -> Self {
        Self {
            class: FailureClass::Transient,
            inner: err.into(),
        }
    }

    pub fn permanent(err: impl Into<anyhow::Error>) -> Self {
        Self {
            class: FailureClass::Permanent,
            inner: err.into(),
        }
    }

    pub fn class(&self) -> FailureClass {
        self.class
    }

    pub fn is_permanent(&self) -> bool {
        self.class == FailureClass::Permanent
    }

    pub fn inner(&self) -> &anyhow::Error {
        &self.inner
    }
}

impl From<anyhow::Error> for HandlerError {
    fn from(err: anyhow::Error) -> Self {
        Self::transient(err)
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#}", self.inner)
    }
}

impl std::error::Error for HandlerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&*self.inner)
    }
}

impl From<uuid::Error> for EventingError {
    fn from(err: uuid::Error) -> Self {
        EventingError::Validation {
            reason: err.to_string(),
        }
    }
}
