//! 消息单元与元数据 / Message unit and metadata.
//!
//! 内核把消息负载视为不可变字节，键/QoS 元数据归条目独占所有。
//! The kernel treats message payloads as immutable bytes; key/QoS metadata is
//! owned exclusively by the wrapping entry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

static LAST_TIMESTAMP: AtomicU64 = AtomicU64::new(0);

/// 分配严格递增、进程内唯一的接收时间戳（纳秒）
///
/// Allocate a strictly increasing, process-unique receive timestamp (nanos).
pub fn next_receive_timestamp() -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos() as u64;
    let mut last = LAST_TIMESTAMP.load(Ordering::Relaxed);
    loop {
        let next = if now > last { now } else { last + 1 };
        match LAST_TIMESTAMP.compare_exchange(last, next, Ordering::SeqCst, Ordering::Relaxed) {
            Ok(_) => return next,
            Err(observed) => last = observed,
        }
    }
}

/// 消息键：主题标识与内容类型
///
/// Message key: topic identifier and content type.
#[derive(Debug, Clone)]
pub struct MessageKey {
    pub oid: Arc<String>,
    pub content_mime: Option<String>,
}

/// 消息的 QoS 元数据（生存期、持久化、目的地、优先级）
///
/// Quality-of-service metadata of a message (lifetime, persistence,
/// destinations, priority).
#[derive(Debug, Clone)]
pub struct QosInfo {
    /// 消息生存期（毫秒），-1 表示永不过期 / Message lifetime in milliseconds,
    /// -1 means the message never expires.
    pub life_time_ms: i64,
    /// 生存期到达时直接销毁，跳过 EXPIRED / Destroy directly on lifetime
    /// elapse, skipping the EXPIRED state.
    pub force_destroy: bool,
    pub persistent: bool,
    pub priority: u8,
    /// 点对点投递的目的地列表 / Addressed destinations for PtP delivery.
    pub destinations: Vec<String>,
    /// 接收时间戳，同时充当条目的唯一标识 / Receive timestamp, doubling as the
    /// entry's unique identity.
    pub rcv_timestamp: Option<u64>,
}

impl Default for QosInfo {
    fn default() -> Self {
        QosInfo {
            life_time_ms: -1,
            force_destroy: false,
            persistent: false,
            priority: 5,
            destinations: Vec::new(),
            rcv_timestamp: None,
        }
    }
}

/// 已发布的消息单元：不可变负载 + 可变元数据
///
/// A published message unit: immutable payload plus mutable metadata.
#[derive(Debug, Clone)]
pub struct MessageUnit {
    pub key: MessageKey,
    pub content: Arc<Vec<u8>>,
    pub qos: QosInfo,
}

impl MessageUnit {
    /// 创建消息单元 / Create a message unit.
    pub fn new(oid: impl Into<String>, content: Vec<u8>) -> Self {
        MessageUnit {
            key: MessageKey {
                oid: Arc::new(oid.into()),
                content_mime: None,
            },
            content: Arc::new(content),
            qos: QosInfo::default(),
        }
    }

    /// 设置生存期（毫秒，-1 为永不过期）/ Set lifetime in ms (-1 = never).
    pub fn with_life_time(mut self, life_time_ms: i64) -> Self {
        self.qos.life_time_ms = life_time_ms;
        self
    }

    /// 生存期到达时直接销毁 / Destroy directly when the lifetime elapses.
    pub fn with_force_destroy(mut self) -> Self {
        self.qos.force_destroy = true;
        self
    }

    /// 追加一个投递目的地 / Append an addressed destination.
    pub fn with_destination(mut self, destination: impl Into<String>) -> Self {
        self.qos.destinations.push(destination.into());
        self
    }

    pub fn with_content_mime(mut self, mime: impl Into<String>) -> Self {
        self.key.content_mime = Some(mime.into());
        self
    }

    pub fn oid(&self) -> &Arc<String> {
        &self.key.oid
    }

    /// 负载大小（字节）/ Payload size in bytes.
    pub fn size(&self) -> usize {
        self.content.len()
    }
}

/// 持有引用的队列类别 / Kind of queue holding a reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueKind {
    /// 历史队列，持有隐式保留引用 / History queue, holds the implicit
    /// retention reference.
    History,
    Callback,
    Plugin,
}

/// 从外部队列窥视/移除时使用的最小条目形态
///
/// Minimal entry shape drained from external queues via peek/remove.
#[derive(Debug, Clone)]
pub struct QueuedEntry {
    pub unique_id: u64,
    pub unit: MessageUnit,
}

impl QueuedEntry {
    pub fn new(unique_id: u64, unit: MessageUnit) -> Self {
        QueuedEntry { unique_id, unit }
    }

    pub fn oid(&self) -> &Arc<String> {
        self.unit.oid()
    }
}
