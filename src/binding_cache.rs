//! §4.1 Channel-Binding Cache.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::clock::Clock;
use crate::model::{BindingPurpose, ChannelBinding, DiscordId};
use crate::ports::BindingStore;
use crate::utils::prelude::*;

const TTL: Duration = Duration::from_secs(60);
const SWEEP_AGE: chrono::Duration = chrono::Duration::minutes(10);

struct CacheEntry {
    cached_at: DateTime<Utc>,
    binding: Option<ChannelBinding>,
}

/// Process-local `channelId -> (cachedAt, binding?)` map with TTL
/// invalidation and a periodic sweep. `null` bindings are cached too
/// (negative caching) so repeated lookups of an unbound channel don't hit
/// persistence every time.
pub struct BindingCache {
    store: Arc<dyn BindingStore>,
    clock: Arc<dyn Clock>,
    entries: DashMap<DiscordId, CacheEntry>,
}

impl BindingCache {
    pub fn new(store: Arc<dyn BindingStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            entries: DashMap::new(),
        }
    }

    /// Look up the binding for `channel_id`, scoped to `guild_id` and one of
    /// `purposes`, refreshing from `store` if the cache entry is missing or
    /// stale. Lookup failures are not cached and surface as `Ok(None)` to
    /// the caller per §4.1 ("caller treats them as 'no binding'"); the
    /// underlying error is logged.
    pub async fn lookup(
        &self,
        guild_id: DiscordId,
        channel_id: DiscordId,
        purposes: &[BindingPurpose],
    ) -> Option<ChannelBinding> {
        let now = self.clock.now();

        if let Some(entry) = self.entries.get(&channel_id) {
            if now - entry.cached_at < TTL {
                return entry.binding.clone();
            }
        }

        match self.store.find(guild_id, channel_id, purposes).await {
            Ok(binding) => {
                self.entries.insert(
                    channel_id,
                    CacheEntry {
                        cached_at: now,
                        binding: binding.clone(),
                    },
                );
                binding
            },
            Err(e) => {
                warn!("Binding lookup failed for channel '{channel_id}', treating as unbound: {e:#}");
                None
            },
        }
    }

    /// Evict entries older than 10 minutes (§4.1 periodic sweep).
    pub fn sweep(&self) {
        let now = self.clock.now();
        let before = self.entries.len();

        self.entries.retain(|_, entry| now - entry.cached_at < SWEEP_AGE);

        let evicted = before - self.entries.len();
        if evicted > 0 {
            debug!("Binding cache sweep evicted {evicted} stale entries");
        }
    }

    /// Bot disconnect (§4.1/§5): binding state may have changed while
    /// disconnected, so the whole cache is flushed.
    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Invalidate one channel's entry directly, e.g. after a `bind`/`unbind`
    /// admin command so the next lookup doesn't serve stale data for the
    /// remainder of the TTL.
    pub fn invalidate(&self, channel_id: DiscordId) {
        self.entries.remove(&channel_id);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;

    use super::*;
    use crate::clock::TestClock;
    use crate::model::{BindingConfig, BindingId, ChannelKind};

    struct FakeStore {
        binding: Option<ChannelBinding>,
        calls: std::sync::atomic::AtomicU32,
    }

    #[async_trait]
    impl BindingStore for FakeStore {
        async fn find(
            &self,
            _guild_id: DiscordId,
            _channel_id: DiscordId,
            _purposes: &[BindingPurpose],
        ) -> anyhow::Result<Option<ChannelBinding>> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(self.binding.clone())
        }

        async fn get(&self, _binding_id: BindingId) -> anyhow::Result<Option<ChannelBinding>> {
            unimplemented!()
        }

        async fn list(&self, _guild_id: DiscordId) -> anyhow::Result<Vec<ChannelBinding>> {
            unimplemented!()
        }

        async fn bind(
            &self,
            _guild_id: DiscordId,
            _channel_id: DiscordId,
            _channel_kind: ChannelKind,
            _purpose: BindingPurpose,
            _game_id: Option<i64>,
            _config: Option<BindingConfig>,
            _series_id: Option<crate::model::SeriesId>,
        ) -> anyhow::Result<(ChannelBinding, Vec<BindingId>)> {
            unimplemented!()
        }

        async fn unbind(
            &self,
            _guild_id: DiscordId,
            _channel_id: DiscordId,
            _series_id: Option<crate::model::SeriesId>,
        ) -> anyhow::Result<bool> {
            unimplemented!()
        }

        async fn update_config(
            &self,
            _binding_id: BindingId,
            _partial: crate::model::PartialBindingConfig,
            _purpose: Option<BindingPurpose>,
        ) -> anyhow::Result<Option<ChannelBinding>> {
            unimplemented!()
        }
    }

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[tokio::test]
    async fn repeated_lookup_within_ttl_hits_cache_once() {
        let store = Arc::new(FakeStore {
            binding: None,
            calls: Default::default(),
        });
        let clock = Arc::new(TestClock::new(t(0)));
        let cache = BindingCache::new(store.clone(), clock.clone());

        for _ in 0..5 {
            let res = cache
                .lookup(DiscordId(1), DiscordId(2), &[BindingPurpose::VoiceMonitor])
                .await;
            assert!(res.is_none());
        }

        assert_eq!(store.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn lookup_refreshes_after_ttl_expires() {
        let store = Arc::new(FakeStore {
            binding: None,
            calls: Default::default(),
        });
        let clock = Arc::new(TestClock::new(t(0)));
        let cache = BindingCache::new(store.clone(), clock.clone());

        cache
            .lookup(DiscordId(1), DiscordId(2), &[BindingPurpose::VoiceMonitor])
            .await;
        clock.advance(chrono::Duration::seconds(61));
        cache
            .lookup(DiscordId(1), DiscordId(2), &[BindingPurpose::VoiceMonitor])
            .await;

        assert_eq!(store.calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn sweep_evicts_entries_older_than_ten_minutes() {
        let store = Arc::new(FakeStore {
            binding: None,
            calls: Default::default(),
        });
        let clock = Arc::new(TestClock::new(t(0)));
        let cache = BindingCache::new(store, clock.clone());

        cache
            .lookup(DiscordId(1), DiscordId(2), &[BindingPurpose::VoiceMonitor])
            .await;
        assert_eq!(cache.entries.len(), 1);

        clock.advance(chrono::Duration::minutes(11));
        cache.sweep();

        assert_eq!(cache.entries.len(), 0);
    }

    #[tokio::test]
    async fn clear_flushes_everything() {
        let store = Arc::new(FakeStore {
            binding: None,
            calls: Default::default(),
        });
        let clock = Arc::new(TestClock::new(t(0)));
        let cache = BindingCache::new(store, clock);

        cache
            .lookup(DiscordId(1), DiscordId(2), &[BindingPurpose::VoiceMonitor])
            .await;
        cache.clear();

        assert_eq!(cache.entries.len(), 0);
    }
}
