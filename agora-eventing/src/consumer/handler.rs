use crate::envelope::{Envelope, EventPayload};
use crate::error::{EventingError, HandlerError};
use crate::trace::TraceContext;
use async_trait::async_trait;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

/// 一次投递的处理上下文
#[derive(Debug, Clone)]
pub struct DeliveryContext {
    pub envelope: Envelope,
    /// 已经历的重试次数
    pub attempt: u32,
    /// broker 标记的重投
    pub redelivered: bool,
    /// 本次处理所在的链路上下文
    pub trace: TraceContext,
}

/// 事件处理器：按路由模式绑定
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, ctx: &DeliveryContext) -> Result<(), HandlerError>;

    /// 绑定的路由模式（`*` 匹配一段，`#` 匹配零或多段）
    fn bindings(&self) -> Vec<String>;

    /// 处理器名称（用于日志与死信上下文）
    fn handler_name(&self) -> &str;
}

struct FnHandler<F> {
    name: String,
    pattern: String,
    f: F,
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(DeliveryContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, ctx: &DeliveryContext) -> Result<(), HandlerError> {
        (self.f)(ctx.clone()).await
    }

    fn bindings(&self) -> Vec<String> {
        vec![self.pattern.clone()]
    }

    fn handler_name(&self) -> &str {
        &self.name
    }
}

/// 以闭包构建处理器
pub fn handler_fn<F, Fut>(
    name: impl Into<String>,
    pattern: impl Into<String>,
    f: F,
) -> Arc<dyn EventHandler>
where
    F: Fn(DeliveryContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler {
        name: name.into(),
        pattern: pattern.into(),
        f,
    })
}

/// 强类型处理器：接收反序列化后的载荷
#[async_trait]
pub trait TypedEventHandler<E: EventPayload>: Send + Sync {
    async fn handle(&self, event: E, ctx: &DeliveryContext) -> Result<(), HandlerError>;

    fn handler_name(&self) -> &str;
}

/// 将 [`TypedEventHandler`] 适配为 [`EventHandler`]，绑定 `E::ROUTING_KEY`
///
/// 载荷版本不符或反序列化失败属于永久错误。
pub struct Typed<E, H> {
    inner: H,
    _marker: PhantomData<fn() -> E>,
}

impl<E, H> Typed<E, H>
where
    E: EventPayload,
    H: TypedEventHandler<E> + 'static,
{
    pub fn new(inner: H) -> Self {
        Self {
            inner,
            _marker: PhantomData,
        }
    }

    pub fn into_handler(self) -> Arc<dyn EventHandler> {
        Arc::new(self)
    }
}

#[async_trait]
impl<E, H> EventHandler for Typed<E, H>
where
    E: EventPayload,
    H: TypedEventHandler<E> + 'static,
{
    async fn handle(&self, ctx: &DeliveryContext) -> Result<(), HandlerError> {
        if ctx.envelope.schema_version != E::SCHEMA_VERSION {
            return Err(HandlerError::permanent(EventingError::validation(format!(
                "unsupported schema version {} for '{}', expected {}",
                ctx.envelope.schema_version,
                E::ROUTING_KEY,
                E::SCHEMA_VERSION
            ))));
        }
        let event = ctx
            .envelope
            .decode_payload::<E>()
            .map_err(HandlerError::permanent)?;
        self.inner.handle(event, ctx).await
    }

    fn bindings(&self) -> Vec<String> {
        vec![E::ROUTING_KEY.to_string()]
    }

    fn handler_name(&self) -> &str {
        self.inner.handler_name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{Headers, RoutingKey};
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Serialize, Deserialize)]
    struct ItemPublished {
        sku: String,
    }

    impl EventPayload for ItemPublished {
        const ROUTING_KEY: &'static str = "product.item.published";
        const SCHEMA_VERSION: u32 = 1;
    }

    struct Indexer;

    #[async_trait]
    impl TypedEventHandler<ItemPublished> for Indexer {
        async fn handle(&self, event: ItemPublished, _ctx: &DeliveryContext) -> Result<(), HandlerError> {
            if event.sku.is_empty() {
                return Err(HandlerError::permanent(anyhow::anyhow!("empty sku")));
            }
            Ok(())
        }

        fn handler_name(&self) -> &str {
            "indexer"
        }
    }

    fn ctx(version: u32, payload: serde_json::Value) -> DeliveryContext {
        DeliveryContext {
            envelope: Envelope::new(
                "product",
                RoutingKey::parse("product.item.published").unwrap(),
                version,
                payload,
                Headers::new("product"),
            ),
            attempt: 0,
            redelivered: false,
            trace: TraceContext::root(),
        }
    }

    #[tokio::test]
    async fn typed_adapter_decodes_and_binds_routing_key() {
        let handler = Typed::<ItemPublished, _>::new(Indexer).into_handler();
        assert_eq!(handler.bindings(), vec!["product.item.published".to_string()]);
        assert_eq!(handler.handler_name(), "indexer");
        handler.handle(&ctx(1, json!({"sku": "A-1"}))).await.unwrap();
    }

    #[tokio::test]
    async fn bad_payloads_and_versions_are_permanent() {
        let handler = Typed::<ItemPublished, _>::new(Indexer).into_handler();
        let err = handler.handle(&ctx(1, json!({"price": 3}))).await.unwrap_err();
        assert!(err.is_permanent());
        let err = handler.handle(&ctx(2, json!({"sku": "A-1"}))).await.unwrap_err();
        assert!(err.is_permanent());
    }

    #[tokio::test]
    async fn closures_become_handlers() {
        let handler = handler_fn("audit", "product.#", |ctx: DeliveryContext| async move {
            if ctx.attempt > 0 {
                return Err(HandlerError::transient(anyhow::anyhow!("late")));
            }
            Ok(())
        });
        assert_eq!(handler.bindings(), vec!["product.#".to_string()]);
        handler.handle(&ctx(1, json!({}))).await.unwrap();
    }
}
