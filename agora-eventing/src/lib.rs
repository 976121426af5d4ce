//! 可靠事件投递运行时（agora-eventing）
//!
//! 在通用 broker 传输之上提供：
//! - 至少一次投递（`consumer`）：有界并发消费、处理成功后才确认
//! - 指数退避重试（`retry`）：复用 broker 的过期 + 死信机制作为延迟原语
//! - 死信（`dead_letter`）：重试耗尽或永久失败的消息进入 DLQ，可排空与重放
//! - 幂等去重（`idempotency`）：原子 check-and-mark，使处理器近似只执行一次
//! - 链路传播（`trace`）：W3C `traceparent` 跨发布/消费边界延续
//! - 信封与路由约定（`envelope`）、编解码（`codec`）、发布（`publisher`）
//! - 传输抽象（`broker`）与进程级会话（`session`），以及指标埋点（`metrics`）
//!
//! 典型用法：
//! 1. 以 `BrokerSession::open` 建立会话（内存 broker 或 `amqp` 特性下的 lapin 实现）；
//! 2. 通过 `session.publisher(service)` 发布强类型事件；
//! 3. 使用 `ConsumerRuntime::builder()` 注册处理器并 `start`，拿到 `ConsumerHandle`；
//! 4. 关闭时 `handle.stop()`，再 `session.shutdown()`。
//!
pub mod broker;
pub mod codec;
pub mod config;
pub mod consumer;
pub mod dead_letter;
pub mod envelope;
pub mod error;
pub mod idempotency;
pub mod metrics;
pub mod publisher;
pub mod retry;
pub mod session;
pub mod trace;

// 允许在本 crate 内部通过 ::agora_eventing 进行自引用，
// 以便过程宏在本 crate 的单元测试中也能解析到 ::agora_eventing 路径。
extern crate self as agora_eventing;
