//! Tokio TopicQ - 发布/订阅消息代理的主题生命周期内核
//!
//! Tokio TopicQ - Topic lifecycle kernel for a publish/subscribe message broker,
//! powered by Tokio.
//!
//! The crate guarantees single-threaded mutation of a topic's state while
//! allowing many dirty readers, tracks how many queues reference a published
//! message so it can be destroyed or expired at exactly the right moment, and
//! converts undeliverable messages into recoverable dead letters.
//!
//! # Examples
//!
//! Publish a message entry and watch its reference count drive destruction:
//! ```rust
//! use tokio_topicq::{BrokerEngine, EntryState, MessageUnit, QueueKind};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let engine = BrokerEngine::new();
//!
//!     let unit = MessageUnit::new("weather", b"sunny".to_vec());
//!     let entry = engine.publish(unit, 1, 0).await?;
//!     assert_eq!(entry.reference_counter(), 1);
//!     assert_eq!(entry.state(), EntryState::Alive);
//!
//!     // 最后一个队列引用消失时，条目被销毁 / The entry is destroyed when the
//!     // last queue reference goes away.
//!     entry.increment_reference_counter(-1, QueueKind::Callback).await;
//!     assert_eq!(entry.state(), EntryState::Destroyed);
//!
//!     engine.registry().erase("weather").await;
//!     Ok(())
//! }
//! ```
pub mod engine;

pub use engine::entry::{EntryError, EntryState, MessageEntry};
pub use engine::message::{
    next_receive_timestamp, MessageKey, MessageUnit, QosInfo, QueueKind, QueuedEntry,
};
pub use engine::recovery::{DeliveryError, ErrorRecoveryHandler, FailureReport};
pub use engine::registry::{TopicHandle, TopicRegistry, TopicState};
pub use engine::timer::{ExpiryTimer, TimerKey};
pub use engine::traits::{
    DeadLetterPublisher, EntryQueue, QueueProperties, SessionHook, TopicEvent, TopicEventKind,
    TopicListener,
};
pub use engine::{BrokerEngine, KernelConfig};
