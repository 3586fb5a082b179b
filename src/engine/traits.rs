//! 外部协作者契约 / Contracts of the external collaborators.
//!
//! 生命周期内核不假定任何具体的存储介质、投递驱动或会话实现，只消费这里
//! 定义的最小协议。
//! The lifecycle kernel never assumes a concrete storage medium, delivery
//! driver or session implementation; it only consumes the minimal protocols
//! defined here.

use async_trait::async_trait;

use super::message::{MessageUnit, QueuedEntry};
use super::registry::TopicHandle;

/// 队列静态属性 / Static queue properties.
#[derive(Debug, Clone)]
pub struct QueueProperties {
    pub name: String,
    /// 投递失败时是否把剩余条目转为死信 / Whether remaining entries are
    /// converted to dead messages on delivery failure.
    pub on_failure_dead_message: bool,
}

/// 队列/存储抽象：窥视与移除协议 / Queue/store abstraction: the drain/remove
/// protocol.
#[async_trait]
pub trait EntryQueue: Send + Sync {
    /// 窥视最多 `max_entries` 条、合计不超过 `max_bytes` 的条目（不移除）
    ///
    /// Peek at up to `max_entries` entries totalling at most `max_bytes`
    /// without removing them.
    async fn peek(&self, max_entries: usize, max_bytes: usize) -> anyhow::Result<Vec<QueuedEntry>>;

    /// 按任意位置移除给定条目，返回每个条目是否被移除
    ///
    /// Remove the given entries at arbitrary positions; returns per-entry
    /// removal success.
    async fn remove_random(&self, entries: &[QueuedEntry]) -> anyhow::Result<Vec<bool>>;

    async fn num_entries(&self) -> usize;

    fn properties(&self) -> QueueProperties;
}

/// 死信发布者 / Dead-letter publisher.
///
/// 实现必须容忍同一故障被调用两次（至少一次语义）。
/// Implementations must tolerate being called twice for the same failure
/// (at-least-once semantics).
#[async_trait]
pub trait DeadLetterPublisher: Send + Sync {
    /// 发布无法解析的原始消息为死信 / Publish an unparseable raw message as a
    /// dead letter.
    async fn publish_dead_message_raw(
        &self,
        receiver: &str,
        raw: &[u8],
        reason: &str,
    ) -> anyhow::Result<()>;

    /// 发布单个已解析消息单元为死信，返回死信标识
    ///
    /// Publish a single parsed message unit as a dead letter; returns the dead
    /// letter's identifier.
    async fn publish_dead_message(
        &self,
        unit: &MessageUnit,
        reason: &str,
        dedup_key: Option<&str>,
        receiver: &str,
    ) -> anyhow::Result<u64>;

    /// 批量转换队列条目为死信 / Convert a batch of queue entries to dead
    /// letters.
    async fn dead_message(
        &self,
        entries: &[QueuedEntry],
        queue: Option<&dyn EntryQueue>,
        reason: &str,
    ) -> anyhow::Result<()>;
}

/// 会话/调度契约，用于不可恢复回调故障时的强制登出
///
/// Session/dispatch contract, used for forced logout on unrecoverable
/// callback failure.
#[async_trait]
pub trait SessionHook: Send + Sync {
    fn name(&self) -> String;

    /// 挂接的调度器是否已死亡 / Whether the attached dispatcher is dead.
    fn is_dead(&self) -> bool;

    /// 会话是否配置了回调通道 / Whether the session has a configured callback.
    fn has_callback(&self) -> bool;

    async fn shutdown(&self);

    /// 强制断开（登出）会话 / Force-disconnect (logout) the session.
    async fn disconnect(&self) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicEventKind {
    Created,
    Destroyed,
}

/// 主题生命周期事件，携带仍被锁定的主题句柄
///
/// Topic lifecycle event, carrying the still-locked topic handle. Listeners
/// must not perform long-running work while holding this implicit lock.
pub struct TopicEvent<'a> {
    pub kind: TopicEventKind,
    pub topic: &'a TopicHandle,
}

/// 主题创建/销毁监听器 / Listener for topic creation/destruction.
pub trait TopicListener: Send + Sync {
    fn changed(&self, event: &TopicEvent<'_>);
}
