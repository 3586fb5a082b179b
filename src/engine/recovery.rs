//! 投递故障恢复：死信转换、队列排空与会话强制登出
//!
//! Delivery failure recovery: dead-letter conversion, queue draining and
//! forced session logout.
//!
//! 恢复路径自身绝不失败：每一步都是尽力而为，错误只记录。消息可能因此被
//! 投递为死信两次（至少一次语义），但绝不会被无声丢弃。
//! The recovery path itself never fails: every step is best-effort and errors
//! are logged only. A message may consequently be dead-lettered twice
//! (at-least-once semantics) but is never silently dropped.

use std::sync::Arc;

use log::{debug, error, info, warn};

use super::message::{next_receive_timestamp, MessageUnit, QueueKind, QueuedEntry};
use super::registry::TopicRegistry;
use super::traits::{DeadLetterPublisher, EntryQueue, SessionHook};

/// 每轮排空批次的上限 / Per-round drain batch limits.
const DRAIN_BATCH_ENTRIES: usize = 50;
const DRAIN_BATCH_BYTES: usize = 10 * 1024 * 1024;

/// 投递失败的分类 / Classification of a delivery failure.
#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    /// 接收方明确拒绝了消息 / The receiver explicitly rejected the message.
    #[error("user rejected message: {reason}")]
    UserRejected { reason: String },

    /// 回调通道通信失败 / The callback channel failed to communicate.
    #[error("communication failure: {reason}")]
    Communication {
        reason: String,
        cause: Option<String>,
    },

    /// 内核内部错误 / Internal kernel error.
    #[error("internal failure: {reason}")]
    Internal {
        reason: String,
        cause: Option<String>,
    },
}

impl DeliveryError {
    /// 展开后的原因文本，含底层原因 / Flattened reason text including the
    /// underlying cause.
    pub fn reason_text(&self) -> String {
        match self {
            DeliveryError::UserRejected { reason } => reason.clone(),
            DeliveryError::Communication { reason, cause }
            | DeliveryError::Internal { reason, cause } => match cause {
                Some(cause) => format!("{reason}: {cause}"),
                None => reason.clone(),
            },
        }
    }

    fn is_user_rejected(&self) -> bool {
        matches!(self, DeliveryError::UserRejected { .. })
    }
}

/// 一次投递故障的完整上下文 / Full context of one delivery failure.
///
/// `entries` 是直接牵连的条目；`queue` 是故障发生时的投递队列；原始报文在
/// 解析失败时出现；会话钩子用于不可恢复故障后的强制登出。
/// `entries` are the directly implicated entries; `queue` is the delivery
/// queue at the time of failure; the raw message appears when parsing failed;
/// the session hook enables forced logout after an unrecoverable failure.
pub struct FailureReport {
    pub error: DeliveryError,
    pub entries: Vec<QueuedEntry>,
    pub queue: Option<Arc<dyn EntryQueue>>,
    pub raw_message: Option<Vec<u8>>,
    pub message_unit: Option<MessageUnit>,
    pub session: Option<Arc<dyn SessionHook>>,
}

impl FailureReport {
    pub fn new(error: DeliveryError) -> Self {
        FailureReport {
            error,
            entries: Vec::new(),
            queue: None,
            raw_message: None,
            message_unit: None,
            session: None,
        }
    }

    pub fn with_entries(mut self, entries: Vec<QueuedEntry>) -> Self {
        self.entries = entries;
        self
    }

    pub fn with_queue(mut self, queue: Arc<dyn EntryQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    pub fn with_raw_message(mut self, raw: Vec<u8>) -> Self {
        self.raw_message = Some(raw);
        self
    }

    pub fn with_message_unit(mut self, unit: MessageUnit) -> Self {
        self.message_unit = Some(unit);
        self
    }

    pub fn with_session(mut self, session: Arc<dyn SessionHook>) -> Self {
        self.session = Some(session);
        self
    }

    /// 接收方归属：首个目的地, 其次会话名, 最后 "unknown"
    ///
    /// Receiver attribution: first destination, then session name, then
    /// "unknown".
    fn receiver(&self) -> String {
        if let Some(unit) = &self.message_unit {
            if let Some(dest) = unit.qos.destinations.first() {
                return dest.clone();
            }
        }
        if let Some(dest) = self
            .entries
            .first()
            .and_then(|e| e.unit.qos.destinations.first())
        {
            return dest.clone();
        }
        match &self.session {
            Some(session) => session.name(),
            None => "unknown".to_string(),
        }
    }

    /// 原始报文无法解析的形态：有原始字节、无条目、无已解析单元
    ///
    /// The unparseable-raw shape: raw bytes present, no entries, no parsed
    /// unit.
    fn is_raw_unparseable(&self) -> bool {
        self.raw_message.is_some() && self.entries.is_empty() && self.message_unit.is_none()
    }
}

/// 异步投递故障的恢复处理器 / Recovery handler for asynchronous delivery
/// failures. Clonable facade over shared collaborators.
#[derive(Clone)]
pub struct ErrorRecoveryHandler {
    registry: TopicRegistry,
    dead_letters: Arc<dyn DeadLetterPublisher>,
}

impl ErrorRecoveryHandler {
    pub fn new(registry: TopicRegistry, dead_letters: Arc<dyn DeadLetterPublisher>) -> Self {
        ErrorRecoveryHandler {
            registry,
            dead_letters,
        }
    }

    /// 处理异步投递故障；本方法自身绝不失败
    ///
    /// Handle an asynchronous delivery failure; this method itself never
    /// fails.
    ///
    /// 用户拒绝只移除牵连条目；通信/内部故障把牵连条目与（按队列策略）整个
    /// 队列转为死信，并关停已死亡的会话调度。
    /// A user rejection only removes the implicated entries;
    /// communication/internal failures dead-letter the implicated entries and
    /// (per queue policy) the whole queue, then shut down a dead session
    /// dispatcher.
    pub async fn handle_error(&self, report: FailureReport) {
        warn!(
            "投递故障: {} / Delivery failure: {}",
            report.error.reason_text(),
            report.error.reason_text()
        );

        if report.is_raw_unparseable() {
            let receiver = report.receiver();
            let raw = report.raw_message.as_deref().unwrap_or_default();
            if let Err(e) = self
                .dead_letters
                .publish_dead_message_raw(&receiver, raw, &report.error.reason_text())
                .await
            {
                error!(
                    "PANIC: 原始死信发布失败, 消息丢失: {} / PANIC: raw dead letter publish failed, message lost: {}",
                    e, e
                );
            }
            return;
        }

        if report.error.is_user_rejected() {
            // 接收方明确拒绝：消息按其意愿消失，不产生死信
            // Explicit rejection by the receiver: the message goes away as
            // requested, no dead letter.
            info!(
                "接收方拒绝 {} 条消息, 按要求丢弃 / Receiver rejected {} message(s), discarding as requested",
                report.entries.len(),
                report.entries.len()
            );
            self.remove_from_queue(&report.entries, report.queue.as_deref())
                .await;
            return;
        }

        self.to_dead_letters(&report.entries, report.queue.as_deref(), &report.error)
            .await;
        if let Some(queue) = &report.queue {
            self.drain_queue(queue.as_ref(), &report.error).await;
        }
        if let Some(session) = &report.session {
            self.shutdown_session(session.as_ref()).await;
        }
    }

    /// 同步发布故障的恢复：把消息改投为死信并返回死信标识
    ///
    /// Recovery for a synchronous publish failure: redirect the message as a
    /// dead letter and return the dead letter's identifier.
    ///
    /// 没有已解析消息单元时退化为异步处理路径并返回 None。
    /// Without a parsed message unit this degrades to the asynchronous path
    /// and returns None.
    pub async fn handle_error_sync(
        &self,
        mut report: FailureReport,
    ) -> anyhow::Result<Option<u64>> {
        let Some(mut unit) = report.message_unit.take() else {
            self.handle_error(report).await;
            return Ok(None);
        };
        if unit.qos.rcv_timestamp.is_none() {
            unit.qos.rcv_timestamp = Some(next_receive_timestamp());
        }
        let receiver = match unit.qos.destinations.first() {
            Some(dest) => dest.clone(),
            None => "unknown".to_string(),
        };
        // 接收时间戳即去重键：重复的恢复尝试落在同一死信上
        // The receive timestamp doubles as the dedup key so a repeated
        // recovery attempt lands on the same dead letter.
        let dedup = unit.qos.rcv_timestamp.map(|ts| ts.to_string());
        let id = self
            .dead_letters
            .publish_dead_message(
                &unit,
                &report.error.reason_text(),
                dedup.as_deref(),
                &receiver,
            )
            .await?;
        info!(
            "同步发布故障已改投死信 '{}', id={} / Synchronous publish failure redirected to dead letter '{}', id={}",
            unit.oid(), id, unit.oid(), id
        );
        Ok(Some(id))
    }

    /// 牵连条目转死信并释放其队列引用 / Dead-letter the implicated entries and
    /// release their queue holds.
    async fn to_dead_letters(
        &self,
        entries: &[QueuedEntry],
        queue: Option<&dyn EntryQueue>,
        error: &DeliveryError,
    ) {
        if entries.is_empty() {
            return;
        }
        if let Err(e) = self
            .dead_letters
            .dead_message(entries, queue, &error.reason_text())
            .await
        {
            error!(
                "PANIC: {} 条消息的死信转换失败: {} / PANIC: dead-letter conversion of {} message(s) failed: {}",
                entries.len(), e, entries.len(), e
            );
        }
        self.remove_from_queue(entries, queue).await;
    }

    /// 从队列移除条目并释放回调引用 / Remove entries from the queue and release
    /// their callback references.
    async fn remove_from_queue(&self, entries: &[QueuedEntry], queue: Option<&dyn EntryQueue>) {
        for queued in entries {
            if let Some(entry) = self
                .registry
                .lookup_dirty_read(queued.oid(), queued.unique_id)
                .await
            {
                entry
                    .increment_reference_counter(-1, QueueKind::Callback)
                    .await;
            } else {
                debug!(
                    "条目 '{}/{}' 已不在注册表中 / Entry '{}/{}' no longer in the registry",
                    queued.oid(), queued.unique_id, queued.oid(), queued.unique_id
                );
            }
        }
        let Some(queue) = queue else { return };
        match queue.remove_random(entries).await {
            Ok(removed) => {
                let count = removed.iter().filter(|r| **r).count();
                if count != entries.len() {
                    error!(
                        "PANIC: 期望移除 {} 条, 实际 {} 条 / PANIC: expected to remove {} entries, removed {}",
                        entries.len(), count, entries.len(), count
                    );
                }
            }
            Err(e) => warn!(
                "从队列移除失败: {} / Removal from queue failed: {}",
                e, e
            ),
        }
    }

    /// 按队列策略排空剩余条目为死信 / Drain the remaining queue entries to dead
    /// letters, per queue policy.
    async fn drain_queue(&self, queue: &dyn EntryQueue, error: &DeliveryError) {
        let props = queue.properties();
        if !props.on_failure_dead_message {
            let remaining = queue.num_entries().await;
            if remaining > 0 {
                error!(
                    "PANIC: 队列 '{}' 未配置失败转死信, 遗留 {} 条消息 / PANIC: queue '{}' has no on-failure dead-letter policy, leaving {} message(s) behind",
                    props.name, remaining, props.name, remaining
                );
            }
            return;
        }
        loop {
            let batch = match queue.peek(DRAIN_BATCH_ENTRIES, DRAIN_BATCH_BYTES).await {
                Ok(batch) => batch,
                Err(e) => {
                    error!(
                        "PANIC: 排空队列 '{}' 时窥视失败: {} / PANIC: peek failed while draining queue '{}': {}",
                        props.name, e, props.name, e
                    );
                    return;
                }
            };
            if batch.is_empty() {
                return;
            }
            if let Err(e) = self
                .dead_letters
                .dead_message(&batch, Some(queue), &error.reason_text())
                .await
            {
                error!(
                    "PANIC: 排空 '{}' 的死信转换失败: {} / PANIC: dead-letter conversion failed while draining '{}': {}",
                    props.name, e, props.name, e
                );
            }
            for queued in &batch {
                if let Some(entry) = self
                    .registry
                    .lookup_dirty_read(queued.oid(), queued.unique_id)
                    .await
                {
                    entry
                        .increment_reference_counter(-1, QueueKind::Callback)
                        .await;
                }
            }
            match queue.remove_random(&batch).await {
                Ok(removed) => {
                    // 无进展即退出，避免对故障队列空转
                    // No progress means bail out instead of spinning on a
                    // broken queue.
                    if !removed.iter().any(|r| *r) {
                        error!(
                            "PANIC: 排空 '{}' 无进展, 中止 / PANIC: no progress draining '{}', aborting",
                            props.name, props.name
                        );
                        return;
                    }
                }
                Err(e) => {
                    error!(
                        "PANIC: 排空 '{}' 时移除失败: {} / PANIC: removal failed while draining '{}': {}",
                        props.name, e, props.name, e
                    );
                    return;
                }
            }
        }
    }

    /// 回调调度已死亡时强制关停会话 / Force-shutdown the session when its
    /// callback dispatcher is dead.
    async fn shutdown_session(&self, session: &dyn SessionHook) {
        if !session.is_dead() {
            return;
        }
        warn!(
            "会话 '{}' 的回调调度已死亡, 强制关停 / Callback dispatcher of session '{}' is dead, forcing shutdown",
            session.name(),
            session.name()
        );
        session.shutdown().await;
        if session.has_callback() {
            if let Err(e) = session.disconnect().await {
                warn!(
                    "强制登出会话 '{}' 失败: {} / Forced logout of session '{}' failed: {}",
                    session.name(), e, session.name(), e
                );
            }
        }
    }
}
