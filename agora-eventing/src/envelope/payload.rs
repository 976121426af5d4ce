use serde::{Serialize, de::DeserializeOwned};

/// 强类型事件载荷
///
/// 通常通过 `#[derive(EventPayload)]` 与 `#[event(routing_key = "...", version = N)]`
/// 实现；载荷的结构由 `(ROUTING_KEY, SCHEMA_VERSION)` 唯一确定。
pub trait EventPayload: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// `<service>.<domain>.<action>`
    const ROUTING_KEY: &'static str;
    /// 仅在载荷结构发生破坏性变化时递增
    const SCHEMA_VERSION: u32;
}
