use std::collections::BTreeMap;
use uuid::Uuid;

/// 传输层头部（与消息体分离、随 broker 元数据传递）
pub type TransportHeaders = BTreeMap<String, String>;

pub const HEADER_USER_ID: &str = "x-user-id";
pub const HEADER_STORE_ID: &str = "x-store-id";
pub const HEADER_SERVICE_NAME: &str = "x-service-name";
pub const HEADER_CORRELATION_ID: &str = "x-correlation-id";
pub const HEADER_RETRY_ATTEMPT: &str = "x-retry-attempt";
pub const HEADER_TRACEPARENT: &str = "traceparent";
pub const HEADER_TRACESTATE: &str = "tracestate";

const RESERVED_HEADERS: [&str; 7] = [
    HEADER_USER_ID,
    HEADER_STORE_ID,
    HEADER_SERVICE_NAME,
    HEADER_CORRELATION_ID,
    HEADER_RETRY_ATTEMPT,
    HEADER_TRACEPARENT,
    HEADER_TRACESTATE,
];

/// 是否为具名字段占用的传输头部键
pub fn is_reserved_header(key: &str) -> bool {
    RESERVED_HEADERS.contains(&key)
}

/// 信封头部
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    /// 关联ID
    pub correlation_id: String,
    /// 用户ID（不透明）
    pub user_id: Option<String>,
    /// 租户/门店ID（不透明）
    pub tenant_id: Option<String>,
    /// 生产方服务名
    pub service_name: String,
    pub traceparent: Option<String>,
    pub tracestate: Option<String>,
    /// 已经历的重试次数
    pub retry_attempt: u32,
    /// 其余未识别的头部，原样透传
    pub extra: BTreeMap<String, String>,
}

impl Headers {
    /// 以服务名创建头部，并生成新的关联ID
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            correlation_id: Uuid::new_v4().to_string(),
            service_name: service_name.into(),
            ..Default::default()
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = correlation_id.into();
        self
    }

    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_tenant_id(mut self, tenant_id: impl Into<String>) -> Self {
        self.tenant_id = Some(tenant_id.into());
        self
    }

    /// `extra` 中与具名字段冲突的键不会写出
    pub fn to_transport(&self) -> TransportHeaders {
        let mut out: TransportHeaders = self
            .extra
            .iter()
            .filter(|(key, _)| !is_reserved_header(key))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect();
        out.insert(HEADER_CORRELATION_ID.into(), self.correlation_id.clone());
        out.insert(HEADER_SERVICE_NAME.into(), self.service_name.clone());
        out.insert(HEADER_RETRY_ATTEMPT.into(), self.retry_attempt.to_string());
        if let Some(v) = &self.user_id {
            out.insert(HEADER_USER_ID.into(), v.clone());
        }
        if let Some(v) = &self.tenant_id {
            out.insert(HEADER_STORE_ID.into(), v.clone());
        }
        if let Some(v) = &self.traceparent {
            out.insert(HEADER_TRACEPARENT.into(), v.clone());
        }
        if let Some(v) = &self.tracestate {
            out.insert(HEADER_TRACESTATE.into(), v.clone());
        }
        out
    }

    /// 从传输头部还原；缺失或无法解析的重试计数按 0 处理
    pub fn from_transport(raw: &TransportHeaders) -> Self {
        let mut headers = Headers::default();
        for (key, value) in raw {
            match key.as_str() {
                HEADER_CORRELATION_ID => headers.correlation_id = value.clone(),
                HEADER_SERVICE_NAME => headers.service_name = value.clone(),
                HEADER_USER_ID => headers.user_id = Some(value.clone()),
                HEADER_STORE_ID => headers.tenant_id = Some(value.clone()),
                HEADER_TRACEPARENT => headers.traceparent = Some(value.clone()),
                HEADER_TRACESTATE => headers.tracestate = Some(value.clone()),
                HEADER_RETRY_ATTEMPT => headers.retry_attempt = value.parse().unwrap_or(0),
                _ => {
                    headers.extra.insert(key.clone(), value.clone());
                }
            }
        }
        headers
    }
}
