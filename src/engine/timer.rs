//! 共享的一次性到期定时器服务 / Shared one-shot expiry timer service.
//!
//! 回调在独立的调度任务上执行；取消通过键进行。回调只捕获弱引用，
//! 因此被遗忘条目的定时器不会造成泄漏。
//! Callbacks run on their own scheduling task; cancellation is keyed. Callbacks
//! capture weak references only, so a forgotten entry's timer cannot leak it.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, trace};
use tokio::task::JoinHandle;

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // 锁中毒时恢复继续服务 / Recover from poisoning and keep serving.
    mutex.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// 可取消的定时器句柄，同时充当回调的代际令牌
///
/// Cancellable timer handle, doubling as the callback's generation token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerKey(u64);

/// 一次性到期定时器服务 / One-shot expiry timer service.
pub struct ExpiryTimer {
    next_key: AtomicU64,
    pending: Mutex<HashMap<u64, JoinHandle<()>>>,
}

impl Default for ExpiryTimer {
    fn default() -> Self {
        ExpiryTimer::new()
    }
}

impl ExpiryTimer {
    pub fn new() -> Self {
        ExpiryTimer {
            next_key: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// 在 `delay` 之后触发一次 `callback`，返回可取消的键
    ///
    /// Fire `callback` once after `delay`; returns a cancellable key.
    /// The fired callback receives its own key so a stale fire can be
    /// detected by the receiver.
    pub fn schedule<F, Fut>(self: &Arc<Self>, delay: Duration, callback: F) -> TimerKey
    where
        F: FnOnce(TimerKey) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let key = TimerKey(self.next_key.fetch_add(1, Ordering::Relaxed));
        let weak = Arc::downgrade(self);
        // 先持有 pending 锁再插入，保证零延迟任务的自注销不会先于注册
        // Hold the pending lock across spawn+insert so a zero-delay task's
        // self-deregistration cannot race ahead of registration.
        let mut pending = guard(&self.pending);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(timer) = weak.upgrade() {
                guard(&timer.pending).remove(&key.0);
            }
            callback(key).await;
        });
        pending.insert(key.0, handle);
        trace!(
            "定时器已调度, key={:?}, 延迟 {:?} / Timer scheduled, key={:?}, delay {:?}",
            key,
            delay,
            key,
            delay
        );
        key
    }

    /// 取消尚未触发的定时器 / Cancel a timer that has not fired yet.
    ///
    /// Returns `false` if the timer already fired or was cancelled before.
    pub fn cancel(&self, key: TimerKey) -> bool {
        match guard(&self.pending).remove(&key.0) {
            Some(handle) => {
                handle.abort();
                debug!("定时器已取消, key={:?} / Timer cancelled, key={:?}", key, key);
                true
            }
            None => false,
        }
    }

    /// 待触发定时器数量 / Number of pending timers.
    pub fn num_pending(&self) -> usize {
        guard(&self.pending).len()
    }
}

impl Drop for ExpiryTimer {
    fn drop(&mut self) {
        for (_, handle) in guard(&self.pending).drain() {
            handle.abort();
        }
    }
}
