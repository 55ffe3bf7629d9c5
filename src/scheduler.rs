//! Common scheduler abstraction (§9 "Long-lived timers") backing debounce
//! (§4.2), grace (§4.5), update-coalesce (§4.5/§4.7), sweep (§4.1), flush
//! (§4.6), and the classification loop (§4.9) — one mechanism instead of
//! five bespoke ones.
//!
//! Timer cancellation is cooperative (§5): cancelling a key prevents a
//! not-yet-fired timer from firing, but a callback already running is not
//! interrupted.

use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crate::utils::prelude::*;

/// Per-key one-shot timers: arming a key cancels any timer already armed
/// for that key and starts a fresh delay, which is exactly the debounce
/// semantics of §4.2 ("prior pending event for that user is canceled") and
/// the update-coalescing semantics of §4.5/§4.7 ("subsequent changes ...
/// reset the countdown").
pub struct KeyedTimers<K> {
    tokens: DashMap<K, CancellationToken>,
}

impl<K> Default for KeyedTimers<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> KeyedTimers<K>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self {
            tokens: DashMap::new(),
        }
    }

    /// (Re)arm a one-shot timer for `key`. If a timer for the same key is
    /// already pending, it is cancelled first.
    pub fn arm<F, Fut>(&self, key: K, delay: Duration, on_fire: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.cancel(&key);

        let token = CancellationToken::new();
        self.tokens.insert(key, token.clone());

        tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(delay) => {
                    on_fire().await;
                }
                () = token.cancelled() => {
                    trace!("Timer cancelled before firing");
                }
            }
        });
    }

    /// Cancel the timer for `key`, if any is pending. Returns `true` if one
    /// was found and cancelled.
    pub fn cancel(&self, key: &K) -> bool {
        match self.tokens.remove(key) {
            Some((_, token)) => {
                token.cancel();
                true
            },
            None => false,
        }
    }

    pub fn is_armed(&self, key: &K) -> bool {
        self.tokens.contains_key(key)
    }

    /// Cancel every pending timer (bot disconnect, §5 cancellation
    /// semantics).
    pub fn cancel_all(&self) {
        for entry in self.tokens.iter() {
            entry.value().cancel();
        }
        self.tokens.clear();
    }
}

/// A single periodic loop (sweep, flush, classification) with cooperative
/// shutdown. Cancelling lets the in-flight tick finish; it only stops the
/// *next* scheduled tick (§5).
pub struct PeriodicTask {
    token: CancellationToken,
    handle: tokio::task::JoinHandle<()>,
}

impl PeriodicTask {
    pub fn spawn<F, Fut>(period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = CancellationToken::new();
        let child = token.clone();

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        tick().await;
                    }
                    () = child.cancelled() => {
                        debug!("Periodic task shutting down");
                        break;
                    }
                }
            }
        });

        Self { token, handle }
    }

    /// Stop future ticks without waiting for the current one.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Cancel and wait for the loop task to observe it and return.
    pub async fn shutdown(self) {
        self.token.cancel();
        let _ = self.handle.await;
    }
}

/// Bundles every long-lived scheduler the engine owns, so bot-disconnect
/// (§5) can cancel all of them in one call.
#[derive(Default)]
pub struct Schedulers {
    pub debounce: KeyedTimers<crate::model::DiscordId>,
    /// Keyed by the ad-hoc session's event id rather than its binding id: a
    /// general-lobby channel can host several concurrent ad-hoc sessions
    /// (one per game), each needing an independent grace countdown.
    pub grace: KeyedTimers<crate::model::EventId>,
    pub update_coalesce: KeyedTimers<crate::model::EventId>,
}

impl Schedulers {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Bot disconnect (§4.2/§5): cancel all debounce, grace, and
    /// update-coalesce timers. Sweep/flush/classification loops are
    /// `PeriodicTask`s owned separately by the engine and are cancelled via
    /// their own `shutdown()`.
    pub fn cancel_all(&self) {
        self.debounce.cancel_all();
        self.grace.cancel_all();
        self.update_coalesce.cancel_all();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[tokio::test(start_paused = true)]
    async fn arming_twice_only_fires_once_with_final_delay() {
        let timers: KeyedTimers<u32> = KeyedTimers::new();
        let fired = Arc::new(AtomicU32::new(0));

        let f1 = Arc::clone(&fired);
        timers.arm(1, Duration::from_millis(100), move || async move {
            f1.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::advance(Duration::from_millis(50)).await;

        // Re-arm before the first fires: this should cancel it.
        let f2 = Arc::clone(&fired);
        timers.arm(1, Duration::from_millis(100), move || async move {
            f2.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::advance(Duration::from_millis(120)).await;
        tokio::task::yield_now().await;

        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_prevents_fire() {
        let timers: KeyedTimers<&'static str> = KeyedTimers::new();
        let fired = Arc::new(AtomicU32::new(0));

        let f = Arc::clone(&fired);
        timers.arm("k", Duration::from_millis(50), move || async move {
            f.fetch_add(1, Ordering::SeqCst);
        });

        assert!(timers.cancel(&"k"));

        tokio::time::advance(Duration::from_millis(100)).await;
        tokio::task::yield_now().await;

        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_task_ticks_until_cancelled() {
        let count = Arc::new(AtomicU32::new(0));
        let c = Arc::clone(&count);

        let task = PeriodicTask::spawn(Duration::from_millis(10), move || {
            let c = Arc::clone(&c);
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::advance(Duration::from_millis(35)).await;
        tokio::task::yield_now().await;

        task.shutdown().await;

        assert!(count.load(Ordering::SeqCst) >= 3);
    }
}
