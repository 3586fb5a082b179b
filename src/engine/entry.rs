//! 消息条目：引用计数与到期状态机
//!
//! Message entry: reference counting and the expiry state machine.
//!
//! ```text
//! ALIVE --(生存期已过, 历史引用 > 0)--> PRE_EXPIRED --(定时器触发)--> EXPIRED
//! ALIVE --(生存期已过, forceDestroy)--> DESTROYED
//! ALIVE/EXPIRED --(引用计数归零)--> DESTROYED
//! ```
//!
//! DESTROYED is terminal; every transition into it is idempotent. Decoupling
//! "expired" from "destroyed" keeps a message visible to the history queue
//! after its nominal lifetime while making it ineligible for fresh delivery.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use log::{debug, error, trace, warn};

use super::message::{MessageUnit, QueueKind};
use super::registry::RegistryCore;
use super::timer::{ExpiryTimer, TimerKey};

/// 估算条目在内存中的固定开销（字节）/ Estimated fixed per-entry overhead in
/// bytes, added to the payload size when no explicit size is supplied.
const ENTRY_BASE_OVERHEAD_BYTES: u64 = 3200;

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

#[derive(Debug, thiserror::Error)]
pub enum EntryError {
    #[error("message unit for topic '{0}' has no receive timestamp")]
    MissingReceiveTimestamp(String),
}

/// 条目生命周期状态 / Entry lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Alive,
    /// 生存期在启动定时器前已耗尽；等待零延迟定时器把我们带入 EXPIRED
    /// Lifetime was already elapsed when the timer started; a zero-delay
    /// timer will carry us into EXPIRED from the scheduler thread.
    PreExpired,
    Expired,
    Destroyed,
}

impl EntryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryState::Alive => "ALIVE",
            EntryState::PreExpired => "PRE_EXPIRED",
            EntryState::Expired => "EXPIRED",
            EntryState::Destroyed => "DESTROYED",
        }
    }
}

struct EntryInner {
    reference_counter: i64,
    history_reference_counter: i64,
    state: EntryState,
    timer_key: Option<TimerKey>,
}

enum CounterOutcome {
    Nothing,
    Propagate,
    Destroy,
}

/// 被包装的已发布消息条目 / A wrapped published message entry.
///
/// 计数器由条目自身的监视器串行化，独立于主题锁，因此即使在未持有主题锁的
/// 路径（如脏读传播）上计数也保持正确。
/// Counters are serialized by the entry's own monitor, independent of the
/// topic lock, so counting stays correct even on paths that do not hold the
/// topic lock (e.g. dirty-read propagation).
pub struct MessageEntry {
    unique_id: u64,
    oid: Arc<String>,
    unit: Mutex<MessageUnit>,
    size_in_bytes: u64,
    created_at: Instant,
    strict_counting: bool,
    swapped: AtomicBool,
    stored: AtomicBool,
    inner: Mutex<EntryInner>,
    timer: Arc<ExpiryTimer>,
    registry: Weak<RegistryCore>,
}

impl MessageEntry {
    /// 创建新条目；`size_in_bytes` 为 None 时按负载大小加固定开销估算
    ///
    /// Create a new entry; with `size_in_bytes == None` the size is estimated
    /// as payload size plus a fixed overhead. The size is immutable afterwards:
    /// callers that mutate the payload in place must not rely on size tracking
    /// staying accurate.
    pub(crate) fn new(
        registry: Weak<RegistryCore>,
        timer: Arc<ExpiryTimer>,
        unit: MessageUnit,
        reference_counter: i64,
        history_reference_counter: i64,
        size_in_bytes: Option<u64>,
        strict_counting: bool,
    ) -> Result<Arc<Self>, EntryError> {
        let unique_id = unit
            .qos
            .rcv_timestamp
            .ok_or_else(|| EntryError::MissingReceiveTimestamp(unit.key.oid.to_string()))?;
        if history_reference_counter > reference_counter {
            error!(
                "PANIC: historyReferenceCounter={} 大于 referenceCounter={}, oid={} / PANIC: historyReferenceCounter={} is bigger than referenceCounter={}, oid={}",
                history_reference_counter, reference_counter, unit.key.oid,
                history_reference_counter, reference_counter, unit.key.oid
            );
        }
        let size = size_in_bytes.unwrap_or(ENTRY_BASE_OVERHEAD_BYTES + unit.size() as u64);
        let oid = unit.key.oid.clone();
        let entry = Arc::new(MessageEntry {
            unique_id,
            oid,
            unit: Mutex::new(unit),
            size_in_bytes: size,
            created_at: Instant::now(),
            strict_counting,
            swapped: AtomicBool::new(false),
            stored: AtomicBool::new(false),
            inner: Mutex::new(EntryInner {
                reference_counter,
                history_reference_counter,
                state: EntryState::Alive,
                timer_key: None,
            }),
            timer,
            registry,
        });
        debug!(
            "创建消息条目 '{}' / Created message entry '{}'",
            entry.log_id(),
            entry.log_id()
        );
        Ok(entry)
    }

    /// 唯一标识（接收时间戳）/ Unique identity (the receive timestamp).
    pub fn unique_id(&self) -> u64 {
        self.unique_id
    }

    pub fn oid(&self) -> &Arc<String> {
        &self.oid
    }

    /// 日志标识 "oid/uniqueId" / Log identity "oid/uniqueId".
    pub fn log_id(&self) -> String {
        format!("{}/{}", self.oid, self.unique_id)
    }

    pub fn state(&self) -> EntryState {
        guard(&self.inner).state
    }

    pub fn reference_counter(&self) -> i64 {
        guard(&self.inner).reference_counter
    }

    pub fn history_reference_counter(&self) -> i64 {
        guard(&self.inner).history_reference_counter
    }

    /// 构造时固定，之后不再重新计算 / Fixed at construction, never recomputed.
    pub fn size_in_bytes(&self) -> u64 {
        self.size_in_bytes
    }

    /// 元数据快照 / Snapshot of the message unit.
    pub fn unit(&self) -> MessageUnit {
        guard(&self.unit).clone()
    }

    /// 替换键/QoS 元数据；被换出时拒绝 / Replace key/QoS metadata; rejected
    /// while swapped out.
    pub fn set_unit(&self, unit: MessageUnit) {
        if self.is_swapped() {
            warn!(
                "条目 '{}' 已被换出, 拒绝修改元数据 / Entry '{}' is swapped, metadata change rejected",
                self.log_id(),
                self.log_id()
            );
            return;
        }
        *guard(&self.unit) = unit;
    }

    pub fn is_swapped(&self) -> bool {
        self.swapped.load(Ordering::Acquire)
    }

    /// 缓存换出/换入标记；换出期间不得修改条目 / Swap marker set by the cache;
    /// the entry must not be mutated while swapped (changes would be lost).
    pub fn set_swapped(&self, swapped: bool) {
        self.swapped.store(swapped, Ordering::Release);
    }

    pub fn is_stored(&self) -> bool {
        self.stored.load(Ordering::Acquire)
    }

    pub fn set_stored(&self, stored: bool) {
        self.stored.store(stored, Ordering::Release);
    }

    pub fn life_time_ms(&self) -> i64 {
        guard(&self.unit).qos.life_time_ms
    }

    fn force_destroy_flag(&self) -> bool {
        guard(&self.unit).qos.force_destroy
    }

    pub fn is_expired(&self) -> bool {
        matches!(self.state(), EntryState::Expired | EntryState::PreExpired)
    }

    pub fn is_destroyed(&self) -> bool {
        self.state() == EntryState::Destroyed
    }

    /// 配置的生存期是否尚有剩余 / Whether the configured lifetime has remaining
    /// life. `-1` never expires.
    pub fn has_remaining_life(&self) -> bool {
        let life = self.life_time_ms();
        if life < 0 {
            return true;
        }
        (self.created_at.elapsed().as_millis() as i64) < life
    }

    /// 调整引用计数 / Adjust the reference counter.
    ///
    /// `QueueKind::History` 的增量同时计入历史子计数。换出的条目拒绝修改。
    /// 计数降到 0 及以下时触发销毁；严格计数模式下非零增量向所属主题做
    /// 脏读传播。
    /// History deltas also hit the history sub-counter. Swapped entries reject
    /// the change. Dropping to zero or below triggers destruction; in strict
    /// counting mode a nonzero delta propagates to the owning topic via a
    /// dirty read.
    pub async fn increment_reference_counter(self: &Arc<Self>, delta: i64, kind: QueueKind) {
        if self.is_swapped() {
            debug!(
                "条目 '{}' 已被换出, 忽略引用计数修改 ({delta:+}) / Entry '{}' is swapped, reference count change ({delta:+}) ignored",
                self.log_id(),
                self.log_id()
            );
            return;
        }
        let outcome = {
            let mut g = guard(&self.inner);
            if kind == QueueKind::History {
                g.history_reference_counter += delta;
            }
            g.reference_counter += delta;
            if g.history_reference_counter > g.reference_counter {
                error!(
                    "PANIC: '{}' historyReferenceCounter={} 大于 referenceCounter={} / PANIC: '{}' historyReferenceCounter={} is bigger than referenceCounter={}",
                    self.log_id(), g.history_reference_counter, g.reference_counter,
                    self.log_id(), g.history_reference_counter, g.reference_counter
                );
            }
            trace!(
                "'{}' 引用计数 {} -> {}, 历史引用 {} / '{}' reference count {} -> {}, history refs {}",
                self.log_id(), g.reference_counter - delta, g.reference_counter, g.history_reference_counter,
                self.log_id(), g.reference_counter - delta, g.reference_counter, g.history_reference_counter
            );
            if g.reference_counter > 0 {
                if self.strict_counting && delta != 0 {
                    CounterOutcome::Propagate
                } else {
                    CounterOutcome::Nothing
                }
            } else if g.state != EntryState::Destroyed {
                CounterOutcome::Destroy
            } else {
                CounterOutcome::Nothing
            }
        };
        match outcome {
            CounterOutcome::Propagate => {
                if let Some(core) = self.registry.upgrade() {
                    core.change_dirty_read(self).await;
                }
            }
            CounterOutcome::Destroy => self.to_destroyed().await,
            CounterOutcome::Nothing => {}
        }
    }

    /// 启动到期定时器 / Start the expiry timer.
    ///
    /// 仅在 ALIVE 且无现存定时器时合法；重复调用属于调用方协议误用，记录
    /// 严重日志后忽略。生存期为 -1 时不调度任何定时器。剩余生存期已耗尽时
    /// 进入 PRE_EXPIRED 并调度零延迟定时器，绝不在本调用内联转移（避免从
    /// 构造方/调用方内部重入造成死锁）。
    /// Only valid from ALIVE with no existing timer; a repeat call is a caller
    /// protocol misuse, logged severely and ignored. With lifetime -1 nothing
    /// is scheduled. If the remaining life is already elapsed the entry goes
    /// PRE_EXPIRED and a zero-delay timer is scheduled, never an inline
    /// transition.
    pub fn start_expiry_timer(self: &Arc<Self>) {
        let mut g = guard(&self.inner);
        if g.state != EntryState::Alive {
            error!(
                "PANIC: '{}' 在状态 {} 下调用 startExpiryTimer / PANIC: unexpected startExpiryTimer on '{}' in state {}",
                self.log_id(), g.state.as_str(), self.log_id(), g.state.as_str()
            );
            return;
        }
        if g.timer_key.is_some() {
            error!(
                "PANIC: '{}' 已存在到期定时器 / PANIC: unexpected existing expiry timer on '{}'",
                self.log_id(),
                self.log_id()
            );
            return;
        }
        let life = self.life_time_ms();
        if life < 0 {
            trace!(
                "'{}' 永不过期, 不调度定时器 / '{}' never expires, no timer scheduled",
                self.log_id(),
                self.log_id()
            );
            return;
        }
        let elapsed = self.created_at.elapsed().as_millis() as i64;
        let mut remaining = life - elapsed;
        if remaining <= 0 {
            g.state = EntryState::PreExpired;
            remaining = 0;
        }
        let weak = Arc::downgrade(self);
        let key = self
            .timer
            .schedule(Duration::from_millis(remaining as u64), move |key| async move {
                match weak.upgrade() {
                    Some(entry) => entry.timeout(key).await,
                    None => trace!("定时器触发时条目已释放 / Timer fired for a dropped entry"),
                }
            });
        g.timer_key = Some(key);
    }

    /// 定时器服务回调 / Fired by the expiry timer service.
    ///
    /// 键与当前存储的键不匹配说明定时器已被取消，回调成为可检测的空操作。
    /// A key mismatch means the timer was cancelled; the fired callback is a
    /// detectable no-op.
    pub(crate) async fn timeout(self: &Arc<Self>, key: TimerKey) {
        {
            let mut g = guard(&self.inner);
            match g.timer_key {
                Some(current) if current == key => g.timer_key = None,
                _ => {
                    debug!(
                        "'{}' 忽略过期的定时器回调 / '{}' ignoring stale timer callback",
                        self.log_id(),
                        self.log_id()
                    );
                    return;
                }
            }
        }
        if self.force_destroy_flag() {
            self.to_destroyed().await;
        } else {
            self.to_expired().await;
        }
    }

    async fn to_expired(self: &Arc<Self>) {
        let (refs, history) = {
            let mut g = guard(&self.inner);
            if let Some(key) = g.timer_key.take() {
                self.timer.cancel(key);
            }
            if g.state == EntryState::Expired || g.state == EntryState::Destroyed {
                return;
            }
            g.state = EntryState::Expired;
            (g.reference_counter, g.history_reference_counter)
        };
        debug!(
            "'{}' 进入 EXPIRED, 引用计数 {}, 历史引用 {} / '{}' entered EXPIRED, refs {}, history refs {}",
            self.log_id(), refs, history, self.log_id(), refs, history
        );
        if refs <= 0 {
            self.to_destroyed().await;
            return;
        }
        if history > 0 {
            // 释放历史队列的隐式保留引用，可能级联销毁
            // Release the implicit history retention hold, may cascade into
            // destruction.
            self.increment_reference_counter(-history, QueueKind::History)
                .await;
        }
    }

    /// 终态转移，幂等 / Terminal transition, idempotent.
    ///
    /// 取消未触发的定时器，然后按主题标识经注册表通知所属主题清理内部索引
    /// （而非使用可能已被擦除的容器引用）。
    /// Cancels a pending timer, then notifies the owning topic through the
    /// registry by topic identifier (never via a stored container reference
    /// that might have been erased).
    pub async fn to_destroyed(self: &Arc<Self>) {
        {
            let mut g = guard(&self.inner);
            if let Some(key) = g.timer_key.take() {
                self.timer.cancel(key);
            }
            if g.state == EntryState::Destroyed {
                return;
            }
            g.state = EntryState::Destroyed;
        }
        debug!(
            "'{}' 进入 DESTROYED / '{}' entered DESTROYED",
            self.log_id(),
            self.log_id()
        );
        match self.registry.upgrade() {
            Some(core) => core.entry_destroyed_dispatch(self).await,
            None => trace!(
                "注册表已释放, 跳过主题通知 '{}' / Registry dropped, skipping topic notification for '{}'",
                self.log_id(),
                self.log_id()
            ),
        }
    }
}

impl Drop for MessageEntry {
    fn drop(&mut self) {
        // 显式取消纪律：条目被遗忘时其定时器随之取消
        // Explicit cancellation discipline: a forgotten entry takes its timer
        // with it.
        if let Some(key) = guard(&self.inner).timer_key.take() {
            self.timer.cancel(key);
        }
    }
}

impl std::fmt::Debug for MessageEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let g = guard(&self.inner);
        f.debug_struct("MessageEntry")
            .field("id", &self.log_id())
            .field("state", &g.state)
            .field("refs", &g.reference_counter)
            .field("history_refs", &g.history_reference_counter)
            .field("size", &self.size_in_bytes)
            .finish()
    }
}
