//! 主题注册表：按主题互斥、创建竞争消解与生命周期事件
//!
//! Topic registry: per-topic mutual exclusion, create-if-absent race
//! resolution and lifecycle events.
//!
//! 每个 `access`/`find_or_create` 必须与恰好一次 `release` 配对。每主题锁对
//! 同一调用任务可重入；`erase` 强制释放全部锁层级，使阻塞中的等待者立刻以
//! "未找到" 返回而不是死锁。
//! Every `access`/`find_or_create` must be paired with exactly one `release`.
//! The per-topic lock is re-entrant for the same calling task; `erase`
//! force-releases all lock levels so blocked waiters promptly observe
//! "not found" instead of deadlocking.

use std::collections::{BTreeMap, HashMap};
use std::ops::Deref;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, Weak};
use std::thread::ThreadId;

use log::{debug, error, info, trace, warn};
use tokio::sync::{Notify, RwLock};
use tokio::task;

use super::entry::MessageEntry;
use super::message::QueuedEntry;
use super::traits::{EntryQueue, TopicEvent, TopicEventKind, TopicListener};
use super::KernelConfig;

fn guard<T>(mutex: &StdMutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// 锁持有者身份：任务 id，运行时之外退化为线程 id
///
/// Lock holder identity: the tokio task id, degrading to the thread id
/// outside a task context.
#[derive(Debug, Clone, PartialEq, Eq)]
enum LockHolder {
    Task(task::Id),
    Thread(ThreadId),
}

fn current_holder() -> LockHolder {
    match task::try_id() {
        Some(id) => LockHolder::Task(id),
        None => LockHolder::Thread(std::thread::current().id()),
    }
}

/// 活跃主题的可变状态，由其容器锁串行化全部修改
///
/// Mutable state of a live topic; all mutation is serialized by the
/// container's exclusive lock.
pub struct TopicState {
    oid: Arc<String>,
    entries: StdMutex<BTreeMap<u64, Arc<MessageEntry>>>,
    history_queue: StdMutex<Option<Arc<dyn EntryQueue>>>,
    num_change_notifications: AtomicU64,
}

impl TopicState {
    fn new(oid: Arc<String>) -> Arc<Self> {
        Arc::new(TopicState {
            oid,
            entries: StdMutex::new(BTreeMap::new()),
            history_queue: StdMutex::new(None),
            num_change_notifications: AtomicU64::new(0),
        })
    }

    pub fn oid(&self) -> &Arc<String> {
        &self.oid
    }

    /// 挂接新条目到主题索引 / Attach a new entry to the topic index.
    pub fn attach_entry(&self, entry: Arc<MessageEntry>) {
        entry.set_stored(true);
        debug!(
            "主题 '{}' 挂接条目 '{}' / Topic '{}' attached entry '{}'",
            self.oid,
            entry.log_id(),
            self.oid,
            entry.log_id()
        );
        guard(&self.entries).insert(entry.unique_id(), entry);
    }

    /// 按唯一标识查找条目 / Look up an entry by unique id.
    pub fn get_entry(&self, unique_id: u64) -> Option<Arc<MessageEntry>> {
        guard(&self.entries).get(&unique_id).cloned()
    }

    pub fn num_entries(&self) -> usize {
        guard(&self.entries).len()
    }

    /// 绑定历史队列，条目销毁时做尽力而为的移除
    ///
    /// Bind the history queue; destroyed entries are removed from it on a
    /// best-effort basis.
    pub fn set_history_queue(&self, queue: Arc<dyn EntryQueue>) {
        *guard(&self.history_queue) = Some(queue);
    }

    /// 条目销毁回调：从内部索引移除并尽力清理历史队列
    ///
    /// Entry-destroyed callback: drop the index slot and best-effort clean
    /// the history queue. A removal failure is logged, never propagated (it
    /// can lead to a leak of the entry, not to a crash).
    pub async fn entry_destroyed(&self, entry: &Arc<MessageEntry>) {
        let removed = guard(&self.entries).remove(&entry.unique_id());
        if removed.is_none() {
            trace!(
                "条目 '{}' 已不在主题索引中 / Entry '{}' already gone from the topic index",
                entry.log_id(),
                entry.log_id()
            );
        }
        entry.set_stored(false);
        let queue = guard(&self.history_queue).clone();
        if let Some(queue) = queue {
            let queued = QueuedEntry::new(entry.unique_id(), entry.unit());
            if let Err(e) = queue.remove_random(&[queued]).await {
                warn!(
                    "历史队列移除失败, 可能泄漏 '{}': {} / History queue removal failed, possible leak of '{}': {}",
                    entry.log_id(), e, entry.log_id(), e
                );
            }
        }
    }

    /// 脏读变更通知（严格计数模式）/ Dirty-read change notification (strict
    /// counting mode).
    pub fn change(&self, entry: &Arc<MessageEntry>) {
        self.num_change_notifications.fetch_add(1, Ordering::Relaxed);
        trace!(
            "主题 '{}' 收到条目 '{}' 的变更通知 / Topic '{}' notified of change on entry '{}'",
            self.oid,
            entry.log_id(),
            self.oid,
            entry.log_id()
        );
    }

    pub fn num_change_notifications(&self) -> u64 {
        self.num_change_notifications.load(Ordering::Relaxed)
    }

    /// 经脏读路径转储全部活跃条目 / Dump all live entries via the dirty-read
    /// path.
    pub fn dump_entries(&self) -> String {
        let entries = guard(&self.entries);
        let mut out = String::with_capacity(64 * entries.len());
        for entry in entries.values() {
            out.push_str(&format!(
                "  <entry id='{}' referenceCount='{}' historyReferenceCount='{}' state='{}'/>\n",
                entry.log_id(),
                entry.reference_counter(),
                entry.history_reference_counter(),
                entry.state().as_str()
            ));
        }
        out
    }
}

struct GateState {
    topic: Option<Arc<TopicState>>,
    owner: Option<LockHolder>,
    depth: usize,
}

/// 每主题独占锁包装，句柄槽可空 / Per-topic exclusive-lock wrapper around a
/// nullable topic handle slot.
pub struct TopicContainer {
    oid: Arc<String>,
    state: StdMutex<GateState>,
    notify: Notify,
}

impl TopicContainer {
    fn new(topic: Arc<TopicState>) -> Arc<Self> {
        Arc::new(TopicContainer {
            oid: topic.oid().clone(),
            state: StdMutex::new(GateState {
                topic: Some(topic),
                owner: None,
                depth: 0,
            }),
            notify: Notify::new(),
        })
    }

    /// 获取重入锁；句柄已被擦除时返回 None（调用方经注册表重试）
    ///
    /// Acquire the re-entrant lock; returns None if the handle was erased
    /// (the caller retries through the registry).
    pub async fn lock(&self) -> Option<Arc<TopicState>> {
        loop {
            let notified = self.notify.notified();
            let mut notified = std::pin::pin!(notified);
            // 先注册唤醒再检查状态，避免丢失通知
            // Register the waiter before re-checking state so no wakeup is
            // lost.
            notified.as_mut().enable();
            {
                let mut g = guard(&self.state);
                let topic = match &g.topic {
                    Some(topic) => topic.clone(),
                    None => return None,
                };
                let me = current_holder();
                match &g.owner {
                    None => {
                        g.owner = Some(me);
                        g.depth = 1;
                        return Some(topic);
                    }
                    Some(owner) if *owner == me => {
                        g.depth += 1;
                        return Some(topic);
                    }
                    Some(_) => {}
                }
            }
            notified.await;
        }
    }

    /// 释放一个锁层级；非持有者调用是带警告的空操作
    ///
    /// Release one lock level; a call by a non-holder is a warn no-op
    /// (tolerates double-unlock from error-handling paths).
    pub fn unlock(&self) {
        let mut g = guard(&self.state);
        let me = current_holder();
        match &g.owner {
            Some(owner) if *owner == me && g.depth > 0 => {
                g.depth -= 1;
                if g.depth == 0 {
                    g.owner = None;
                    drop(g);
                    self.notify.notify_waiters();
                }
            }
            _ => {
                warn!(
                    "非持有者对主题 '{}' 调用 unlock, 已忽略 / unlock on topic '{}' by a non-holder, ignored",
                    self.oid, self.oid
                );
            }
        }
    }

    /// 永久置空句柄并强制释放全部锁层级 / Permanently null the handle and
    /// force-release all outstanding lock levels.
    pub fn erase(&self) {
        {
            let mut g = guard(&self.state);
            if g.topic.is_none() {
                return;
            }
            g.topic = None;
            g.owner = None;
            g.depth = 0;
        }
        self.notify.notify_waiters();
    }

    /// 不加锁读取句柄 / Read the handle without locking.
    pub fn topic_dirty_read(&self) -> Option<Arc<TopicState>> {
        guard(&self.state).topic.clone()
    }
}

/// 已锁定主题的句柄；必须与一次 `TopicRegistry::release` 配对
///
/// Handle to a locked topic; must be paired with one `TopicRegistry::release`.
pub struct TopicHandle {
    oid: Arc<String>,
    topic: Arc<TopicState>,
}

impl TopicHandle {
    pub fn oid(&self) -> &Arc<String> {
        &self.oid
    }
}

impl Deref for TopicHandle {
    type Target = TopicState;

    fn deref(&self) -> &TopicState {
        &self.topic
    }
}

pub(crate) struct RegistryCore {
    topics: RwLock<HashMap<String, Arc<TopicContainer>>>,
    listeners: StdMutex<Vec<Arc<dyn TopicListener>>>,
    destroy_tx: StdMutex<Option<async_channel::Sender<Arc<MessageEntry>>>>,
}

impl RegistryCore {
    async fn container(&self, oid: &str) -> Option<Arc<TopicContainer>> {
        self.topics.read().await.get(oid).cloned()
    }

    pub(crate) async fn access(&self, oid: &str) -> Option<TopicHandle> {
        let container = self.container(oid).await?;
        let topic = container.lock().await?;
        Some(TopicHandle {
            oid: topic.oid().clone(),
            topic,
        })
    }

    pub(crate) async fn release(&self, handle: &TopicHandle) {
        match self.container(handle.oid()).await {
            Some(container) => container.unlock(),
            None => {
                // 与并发 erase 竞争时的正常情况 / Normal when racing a
                // concurrent erase, which force-released the lock already.
                warn!(
                    "release: 主题 '{}' 未知, 空操作 / release: topic '{}' unknown, no-op",
                    handle.oid(),
                    handle.oid()
                );
            }
        }
    }

    pub(crate) async fn topic_dirty_read(&self, oid: &str) -> Option<Arc<TopicState>> {
        self.container(oid).await?.topic_dirty_read()
    }

    /// 严格计数模式的脏读传播 / Dirty-read propagation for strict counting
    /// mode.
    pub(crate) async fn change_dirty_read(&self, entry: &Arc<MessageEntry>) {
        if let Some(topic) = self.topic_dirty_read(entry.oid()).await {
            topic.change(entry);
        }
    }

    /// 条目销毁通知的分发：配置了延迟销毁队列时入队（满则背压阻塞），
    /// 否则内联执行
    ///
    /// Dispatch of the entry-destroyed notification: enqueued when the
    /// deferred-destroy queue is configured (blocking the producer when
    /// full), inline otherwise.
    pub(crate) async fn entry_destroyed_dispatch(&self, entry: &Arc<MessageEntry>) {
        let tx = guard(&self.destroy_tx).clone();
        if let Some(tx) = tx {
            match tx.send(entry.clone()).await {
                Ok(()) => return,
                Err(e) => warn!(
                    "延迟销毁队列已关闭, 回退为内联执行: {} / Deferred-destroy queue closed, falling back inline: {}",
                    e, e
                ),
            }
        }
        self.entry_destroyed_inline(entry).await;
    }

    pub(crate) async fn entry_destroyed_inline(&self, entry: &Arc<MessageEntry>) {
        // 主题可能已带 forceDestroy 被擦除 / The topic may have been erased
        // with forceDestroy in the meantime.
        match self.access(entry.oid()).await {
            Some(handle) => {
                handle.entry_destroyed(entry).await;
                self.release(&handle).await;
            }
            None => debug!(
                "条目 '{}' 销毁时主题已不存在 / Topic already gone while destroying entry '{}'",
                entry.log_id(),
                entry.log_id()
            ),
        }
    }
}

/// 主题标识到容器的映射，含查找即建/擦除语义与生命周期监听
///
/// The map from topic identifier to container, with find-or-create/erase
/// semantics and lifecycle listener notification. Clonable facade sharing one
/// inner core.
#[derive(Clone)]
pub struct TopicRegistry {
    core: Arc<RegistryCore>,
}

impl TopicRegistry {
    /// 创建注册表；启用延迟销毁队列需要在 Tokio 运行时上下文内调用
    ///
    /// Create the registry; enabling the deferred-destroy queue requires a
    /// Tokio runtime context (a consumer task is spawned).
    pub(crate) fn new(config: &KernelConfig) -> Self {
        let core = Arc::new(RegistryCore {
            topics: RwLock::new(HashMap::new()),
            listeners: StdMutex::new(Vec::new()),
            destroy_tx: StdMutex::new(None),
        });
        if config.async_destroy {
            let (tx, rx) = async_channel::bounded(config.destroy_queue_capacity);
            *guard(&core.destroy_tx) = Some(tx);
            let weak: Weak<RegistryCore> = Arc::downgrade(&core);
            tokio::spawn(async move {
                info!("延迟销毁消费者已启动 / Deferred-destroy consumer started");
                while let Ok(entry) = rx.recv().await {
                    match weak.upgrade() {
                        Some(core) => core.entry_destroyed_inline(&entry).await,
                        None => break,
                    }
                }
            });
        }
        TopicRegistry { core }
    }

    pub(crate) fn core(&self) -> &Arc<RegistryCore> {
        &self.core
    }

    /// 查找或创建主题并锁定；绝不返回未找到
    ///
    /// Look up or create the topic and lock it; never returns not-found.
    ///
    /// 首次创建时在持锁状态下向监听器发出创建事件，保证监听器先于任何其他
    /// 线程的修改观察到创建。容器在等待期间被并发擦除时从头重试。
    /// On first creation the created event fires while the lock is held, so
    /// listeners observe the creation before any other task can mutate the
    /// topic. If the container is erased concurrently while waiting, the call
    /// retries from the top.
    pub async fn find_or_create(&self, oid: &str) -> TopicHandle {
        loop {
            let (container, created) = {
                let mut map = self.core.topics.write().await;
                match map.get(oid) {
                    Some(container) => (container.clone(), false),
                    None => {
                        let topic = TopicState::new(Arc::new(oid.to_string()));
                        let container = TopicContainer::new(topic);
                        map.insert(oid.to_string(), container.clone());
                        (container, true)
                    }
                }
            };
            match container.lock().await {
                Some(topic) => {
                    let handle = TopicHandle {
                        oid: topic.oid().clone(),
                        topic,
                    };
                    if created {
                        info!("创建新主题: {} / Created new topic: {}", oid, oid);
                        self.fire_topic_event(&handle, TopicEventKind::Created);
                    }
                    return handle;
                }
                None => {
                    warn!(
                        "主题 '{}' 在锁定期间被擦除, 重试 / Topic '{}' erased while locking, retrying",
                        oid, oid
                    );
                }
            }
        }
    }

    /// 访问并锁定已知主题；未知或已擦除时返回 None
    ///
    /// Access and lock a known topic; None if unknown or erased.
    pub async fn access(&self, oid: &str) -> Option<TopicHandle> {
        let handle = self.core.access(oid).await;
        if handle.is_none() {
            debug!("主题 '{}' 未知 / Topic '{}' unknown", oid, oid);
        }
        handle
    }

    /// 不加锁返回主题句柄；仅可读取不可变或最终一致字段
    ///
    /// Return the topic handle without locking; callers may only read
    /// immutable or eventually-consistent fields. Any write through this path
    /// is a design violation.
    pub async fn access_dirty_read(&self, oid: &str) -> Option<Arc<TopicState>> {
        self.core.topic_dirty_read(oid).await
    }

    /// 释放 access/find_or_create 获取的一个锁层级
    ///
    /// Release exactly one lock level acquired by access/find_or_create.
    /// Safe with a handle whose topic was concurrently erased (warn no-op).
    pub async fn release(&self, handle: &TopicHandle) {
        self.core.release(handle).await;
    }

    /// 永久擦除主题 / Permanently erase the topic.
    ///
    /// 持锁发出销毁事件, 再从映射移除并强制释放全部锁层级；错误只记录,
    /// 对调用方保持尽力而为。擦除的主题不会复活：同一 oid 的新发布会分配
    /// 新容器。
    /// Fires the destroyed event while locked, then removes the map entry and
    /// force-releases all lock levels; errors are logged, keeping erase
    /// best-effort. An erased topic is never resurrected: a new publish under
    /// the same oid allocates a fresh container.
    pub async fn erase(&self, oid: &str) {
        let container = match self.core.container(oid).await {
            Some(container) => container,
            None => {
                debug!("erase: 主题 '{}' 未知 / erase: topic '{}' unknown", oid, oid);
                return;
            }
        };
        let topic = match container.lock().await {
            Some(topic) => topic,
            None => {
                debug!(
                    "erase: 主题 '{}' 已被擦除 / erase: topic '{}' already erased",
                    oid, oid
                );
                return;
            }
        };
        let handle = TopicHandle {
            oid: topic.oid().clone(),
            topic,
        };
        self.fire_topic_event(&handle, TopicEventKind::Destroyed);
        let removed = self.core.topics.write().await.remove(oid);
        if removed.is_none() {
            error!(
                "PANIC: 主题 '{}' 在擦除期间从映射消失 / PANIC: topic '{}' vanished from the map during erase",
                oid, oid
            );
        }
        info!("已擦除主题: {} / Erased topic: {}", oid, oid);
        container.erase();
    }

    /// 注册监听器（按指针判重）/ Register a listener (deduplicated by
    /// pointer identity).
    pub fn add_topic_listener(&self, listener: Arc<dyn TopicListener>) {
        let mut listeners = guard(&self.core.listeners);
        if !listeners.iter().any(|l| Arc::ptr_eq(l, &listener)) {
            listeners.push(listener);
        }
    }

    pub fn remove_topic_listener(&self, listener: &Arc<dyn TopicListener>) -> bool {
        let mut listeners = guard(&self.core.listeners);
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        listeners.len() != before
    }

    /// 向监听器快照发出事件；回调执行时不持有监听器集合锁
    ///
    /// Fire the event against a point-in-time snapshot of the listeners; the
    /// listener-set lock is never held during callback execution, so a
    /// listener may register/remove listeners from within its own callback.
    fn fire_topic_event(&self, handle: &TopicHandle, kind: TopicEventKind) {
        let snapshot: Vec<Arc<dyn TopicListener>> = guard(&self.core.listeners).clone();
        for listener in snapshot {
            let event = TopicEvent { kind, topic: handle };
            if catch_unwind(AssertUnwindSafe(|| listener.changed(&event))).is_err() {
                error!(
                    "主题监听器在 {:?} 事件中 panic, 已忽略 / Topic listener panicked in {:?} event, ignored",
                    kind, kind
                );
            }
        }
    }

    /// 全部主题标识的快照 / Snapshot of all topic identifiers.
    pub async fn get_topics(&self) -> Vec<String> {
        self.core
            .topics
            .read()
            .await
            .keys()
            .cloned()
            .collect()
    }

    pub async fn num_topics(&self) -> usize {
        self.core.topics.read().await.len()
    }

    /// 不加锁查找消息条目 / Look up a message entry without locks.
    pub async fn lookup_dirty_read(&self, oid: &str, unique_id: u64) -> Option<Arc<MessageEntry>> {
        self.core.topic_dirty_read(oid).await?.get_entry(unique_id)
    }

    /// 调度条目销毁工作 / Schedule the destruction work for an entry.
    ///
    /// 配置了延迟销毁队列时经有界队列异步执行（满则阻塞生产者），否则内联。
    /// Runs through the bounded deferred-destroy queue when configured
    /// (producer blocks when full), inline otherwise.
    pub async fn schedule_destroy(&self, entry: Arc<MessageEntry>) {
        self.core.entry_destroyed_dispatch(&entry).await;
    }

    /// 经脏读路径转储全部活跃主题与条目 / Dump all live topics and entries via
    /// the dirty-read path (minimal contention, eventually consistent).
    pub async fn dump(&self) -> String {
        let containers: Vec<Arc<TopicContainer>> = {
            self.core.topics.read().await.values().cloned().collect()
        };
        let mut out = String::with_capacity(256);
        for container in containers {
            if let Some(topic) = container.topic_dirty_read() {
                out.push_str(&format!(
                    "<topic oid='{}' numEntries='{}'>\n",
                    topic.oid(),
                    topic.num_entries()
                ));
                out.push_str(&topic.dump_entries());
                out.push_str("</topic>\n");
            }
        }
        out
    }
}
