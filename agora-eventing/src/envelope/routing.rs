//! 路由键语法与命名约定
//!
//! - 路由键：`<service>.<domain>.<action>`，每段为小写 kebab（`[a-z0-9-]+`）；
//! - 交换机：`agora.<service>.<domain>`（topic）；
//! - 队列：`<service>.<domain>.<purpose>-queue`，死信交换机/队列：`.dlx` / `.dlq`；
//! - 绑定模式遵循 topic 语义：`*` 匹配恰好一段，`#` 匹配零或多段。
//!
use crate::error::{EventingError, EventingResult};
use serde::{Deserialize, Serialize};
use std::fmt;

/// 交换机名前缀
pub const EXCHANGE_PREFIX: &str = "agora";

/// 判断一个段是否为合法的小写 kebab 片段
pub fn is_kebab_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .bytes()
            .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
}

/// 已校验的路由键
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct RoutingKey(String);

impl RoutingKey {
    pub fn parse(raw: impl Into<String>) -> EventingResult<Self> {
        let raw = raw.into();
        let segments: Vec<&str> = raw.split('.').collect();
        if segments.len() != 3 || !segments.iter().all(|s| is_kebab_segment(s)) {
            return Err(EventingError::validation(format!(
                "routing key '{raw}' does not match <service>.<domain>.<action>"
            )));
        }
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn segment(&self, idx: usize) -> &str {
        self.0.split('.').nth(idx).unwrap_or_default()
    }

    pub fn service(&self) -> &str {
        self.segment(0)
    }

    pub fn domain(&self) -> &str {
        self.segment(1)
    }

    pub fn action(&self) -> &str {
        self.segment(2)
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for RoutingKey {
    type Error = EventingError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<RoutingKey> for String {
    fn from(value: RoutingKey) -> Self {
        value.0
    }
}

impl std::str::FromStr for RoutingKey {
    type Err = EventingError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

/// 生产方交换机名：`agora.<service>.<domain>`
pub fn exchange_name(service: &str, domain: &str) -> String {
    format!("{EXCHANGE_PREFIX}.{service}.{domain}")
}

/// topic 绑定模式匹配
pub fn matches_pattern(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let words: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &words)
}

fn match_words(pattern: &[&str], words: &[&str]) -> bool {
    match pattern.split_first() {
        None => words.is_empty(),
        Some((&"#", rest)) => (0..=words.len()).any(|skip| match_words(rest, &words[skip..])),
        Some((&p, rest)) => match words.split_first() {
            Some((&w, tail)) => (p == "*" || p == w) && match_words(rest, tail),
            None => false,
        },
    }
}

/// 校验绑定模式：三段以内的 kebab/`*`/`#` 组合
pub fn validate_pattern(pattern: &str) -> EventingResult<()> {
    let ok = pattern
        .split('.')
        .all(|s| s == "*" || s == "#" || is_kebab_segment(s));
    if ok {
        Ok(())
    } else {
        Err(EventingError::validation(format!(
            "binding pattern '{pattern}' is not a valid topic pattern"
        )))
    }
}

/// 服务身份：确定消费方拥有的队列及其重试/死信拓扑的名字
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceIdentity {
    service: String,
    domain: String,
    purpose: String,
}

impl ServiceIdentity {
    pub fn new(
        service: impl Into<String>,
        domain: impl Into<String>,
        purpose: impl Into<String>,
    ) -> EventingResult<Self> {
        let identity = Self {
            service: service.into(),
            domain: domain.into(),
            purpose: purpose.into(),
        };
        for (field, value) in [
            ("service", &identity.service),
            ("domain", &identity.domain),
            ("purpose", &identity.purpose),
        ] {
            if !is_kebab_segment(value) {
                return Err(EventingError::validation(format!(
                    "{field} '{value}' must be lower-kebab"
                )));
            }
        }
        Ok(identity)
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn purpose(&self) -> &str {
        &self.purpose
    }

    /// 本服务自有的 topic 交换机
    pub fn exchange(&self) -> String {
        exchange_name(&self.service, &self.domain)
    }

    /// 工作队列：`<service>.<domain>.<purpose>-queue`
    pub fn queue(&self) -> String {
        format!("{}.{}.{}-queue", self.service, self.domain, self.purpose)
    }

    /// 重试用的直连交换机
    pub fn retry_exchange(&self) -> String {
        format!("{}.{}.retry", self.service, self.domain)
    }

    /// 延迟队列：无消费者，消息过期后经默认交换机回到工作队列
    pub fn delay_queue(&self) -> String {
        format!("{}.{}.{}-delay-queue", self.service, self.domain, self.purpose)
    }

    pub fn dlx(&self) -> String {
        format!("{}.{}.dlx", self.service, self.domain)
    }

    pub fn dlq(&self) -> String {
        format!("{}.{}.dlq", self.service, self.domain)
    }
}
