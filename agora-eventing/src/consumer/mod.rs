//! 事件消费
//!
//! - `EventHandler`：按路由模式绑定的处理器，闭包与强类型载荷均可适配；
//! - `ConsumerRuntime`：有界并发的消费循环，串起去重、重试与死信；
//! - `ConsumerHandle`：关闭、等待与宽限期控制。

mod handler;
mod registry;
mod runtime;

pub use handler::{DeliveryContext, EventHandler, Typed, TypedEventHandler, handler_fn};
pub(crate) use registry::HandlerRegistry;
pub use runtime::{ConsumerHandle, ConsumerRuntime, Outcome};
