//! In-memory fake of every `src/ports.rs` trait, backed by `DashMap`s. Used
//! by unit tests that need a real store (rather than a single-purpose fake
//! implementing one trait) and by the demo binary as its persistence
//! backend when the `postgres` feature is not compiled in.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use crate::clock::Clock;
use crate::model::{
    AdHocParticipantRecord, AttendanceClassification, AvailabilityStatus, AvailabilityWindow,
    BindingConfig, BindingId, BindingPurpose, ChannelBinding, ChannelKind, DiscordId, EventId,
    PartialBindingConfig, ScheduledEvent, SeriesId,
};
use crate::ports::{
    AvailabilityStore, BindingStore, GameRegistryStore, ScheduledEventStore, SessionStore, SignupStore,
};

const OVERRIDE_TTL: chrono::Duration = chrono::Duration::minutes(30);

/// One store, all six aggregates. A caller wanting a `Arc<dyn BindingStore>`
/// just upcasts an `Arc<MemoryStore>` via an unsized coercion.
pub struct MemoryStore {
    clock: Arc<dyn Clock>,
    bindings: DashMap<BindingId, ChannelBinding>,
    game_catalog: DashMap<i64, String>,
    game_admin_map: DashMap<String, (i64, String)>,
    playing_overrides: DashMap<DiscordId, (String, DateTime<Utc>)>,
    sessions: DashMap<(EventId, DiscordId), AdHocParticipantRecord>,
    events: DashMap<EventId, ScheduledEvent>,
    signups: DashMap<(EventId, DiscordId), Option<AttendanceClassification>>,
    availability: DashMap<Uuid, AvailabilityWindow>,
}

impl MemoryStore {
    pub fn new(clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            clock,
            bindings: DashMap::new(),
            game_catalog: DashMap::new(),
            game_admin_map: DashMap::new(),
            playing_overrides: DashMap::new(),
            sessions: DashMap::new(),
            events: DashMap::new(),
            signups: DashMap::new(),
            availability: DashMap::new(),
        })
    }

    /// Seed the registry catalog the resolver's exact/case-insensitive/
    /// trigram steps run against. Not part of `GameRegistryStore` itself —
    /// a real adapter reads its catalog from a `games` table instead.
    pub fn seed_game(&self, game_id: i64, name: impl Into<String>) {
        self.game_catalog.insert(game_id, name.into());
    }

    /// Seed an admin-managed activity-name override (§4.3 step 2).
    pub fn seed_admin_mapping(&self, activity_name: impl Into<String>, game_id: i64, game_name: impl Into<String>) {
        self.game_admin_map.insert(activity_name.into(), (game_id, game_name.into()));
    }

    /// Record a signup for `event_id`/`user_id` with status left unset, so
    /// the classification loop (§4.9 steps 4-5) has something to populate.
    pub fn seed_signup(&self, event_id: EventId, user_id: DiscordId) {
        self.signups.entry((event_id, user_id)).or_insert(None);
    }

    /// Insert a pre-planned scheduled event directly, for tests that need
    /// one already live rather than built via `create_ad_hoc` (which always
    /// produces `is_ad_hoc = true` rows).
    pub fn seed_scheduled_event(&self, event: ScheduledEvent) {
        self.events.insert(event.id, event);
    }

    /// Read back a signup's current status, for test assertions.
    pub fn signup_status(&self, event_id: EventId, user_id: DiscordId) -> Option<AttendanceClassification> {
        self.signups.get(&(event_id, user_id)).and_then(|v| *v)
    }
}

#[async_trait]
impl BindingStore for MemoryStore {
    async fn find(
        &self,
        guild_id: DiscordId,
        channel_id: DiscordId,
        purposes: &[BindingPurpose],
    ) -> anyhow::Result<Option<ChannelBinding>> {
        Ok(self
            .bindings
            .iter()
            .find(|e| e.guild_id == guild_id && e.channel_id == channel_id && purposes.contains(&e.purpose))
            .map(|e| e.value().clone()))
    }

    async fn get(&self, binding_id: BindingId) -> anyhow::Result<Option<ChannelBinding>> {
        Ok(self.bindings.get(&binding_id).map(|e| e.clone()))
    }

    async fn list(&self, guild_id: DiscordId) -> anyhow::Result<Vec<ChannelBinding>> {
        Ok(self.bindings.iter().filter(|e| e.guild_id == guild_id).map(|e| e.value().clone()).collect())
    }

    async fn bind(
        &self,
        guild_id: DiscordId,
        channel_id: DiscordId,
        channel_kind: ChannelKind,
        purpose: BindingPurpose,
        game_id: Option<i64>,
        config: Option<BindingConfig>,
        series_id: Option<SeriesId>,
    ) -> anyhow::Result<(ChannelBinding, Vec<BindingId>)> {
        let now = self.clock.now();

        let replaced: Vec<BindingId> = self
            .bindings
            .iter()
            .filter(|e| e.guild_id == guild_id && e.channel_id == channel_id)
            .map(|e| *e.key())
            .collect();
        for id in &replaced {
            self.bindings.remove(id);
        }

        let binding = ChannelBinding {
            id: BindingId::new(),
            guild_id,
            channel_id,
            channel_kind,
            purpose,
            game_id,
            series_id,
            config: config.unwrap_or_default(),
            created_at: now,
            updated_at: now,
        };
        self.bindings.insert(binding.id, binding.clone());

        Ok((binding, replaced))
    }

    async fn unbind(&self, guild_id: DiscordId, channel_id: DiscordId, series_id: Option<SeriesId>) -> anyhow::Result<bool> {
        let matches: Vec<BindingId> = self
            .bindings
            .iter()
            .filter(|e| {
                e.guild_id == guild_id
                    && e.channel_id == channel_id
                    && series_id.map(|s| e.series_id == Some(s)).unwrap_or(true)
            })
            .map(|e| *e.key())
            .collect();

        for id in &matches {
            self.bindings.remove(id);
        }

        Ok(!matches.is_empty())
    }

    async fn update_config(
        &self,
        binding_id: BindingId,
        partial: PartialBindingConfig,
        purpose: Option<BindingPurpose>,
    ) -> anyhow::Result<Option<ChannelBinding>> {
        let Some(mut entry) = self.bindings.get_mut(&binding_id) else {
            return Ok(None);
        };

        entry.config = entry.config.merged_with(partial);
        if let Some(p) = purpose {
            entry.purpose = p;
        }
        entry.updated_at = self.clock.now();

        Ok(Some(entry.clone()))
    }
}

#[async_trait]
impl GameRegistryStore for MemoryStore {
    async fn mapped_game(&self, activity_name: &str) -> anyhow::Result<Option<(i64, String)>> {
        Ok(self.game_admin_map.get(activity_name).map(|e| e.clone()))
    }

    async fn exact_match(&self, name: &str) -> anyhow::Result<Option<(i64, String)>> {
        Ok(self.game_catalog.iter().find(|e| e.value() == name).map(|e| (*e.key(), e.value().clone())))
    }

    async fn case_insensitive_match(&self, name: &str) -> anyhow::Result<Option<(i64, String)>> {
        Ok(self
            .game_catalog
            .iter()
            .find(|e| e.value().eq_ignore_ascii_case(name))
            .map(|e| (*e.key(), e.value().clone())))
    }

    async fn trigram_match(&self, name: &str, threshold: f64) -> anyhow::Result<Option<(i64, String)>> {
        let best = self
            .game_catalog
            .iter()
            .map(|e| (*e.key(), e.value().clone(), strsim::jaro_winkler(name, e.value())))
            .filter(|(_, _, score)| *score >= threshold)
            .max_by(|a, b| a.2.partial_cmp(&b.2).unwrap_or(std::cmp::Ordering::Equal));

        Ok(best.map(|(id, name, _)| (id, name)))
    }

    fn supports_trigram(&self) -> bool {
        true
    }

    async fn set_playing_override(&self, user_id: DiscordId, game_name: String) -> anyhow::Result<()> {
        let expires_at = self.clock.now() + OVERRIDE_TTL;
        self.playing_overrides.insert(user_id, (game_name, expires_at));
        Ok(())
    }

    async fn playing_override(&self, user_id: DiscordId) -> anyhow::Result<Option<String>> {
        let now = self.clock.now();
        match self.playing_overrides.get(&user_id) {
            Some(entry) if entry.1 > now => Ok(Some(entry.0.clone())),
            Some(_) => {
                drop(self.playing_overrides.remove(&user_id));
                Ok(None)
            },
            None => Ok(None),
        }
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn upsert(&self, mut record: AdHocParticipantRecord) -> anyhow::Result<()> {
        let key = (record.event_id, record.discord_user_id);
        if let Some(existing) = self.sessions.get(&key) {
            record.id = existing.id;
            record.created_at = existing.created_at;
            if record.classification.is_none() {
                record.classification = existing.classification;
            }
        }
        self.sessions.insert(key, record);
        Ok(())
    }

    async fn get(&self, event_id: EventId, discord_user_id: DiscordId) -> anyhow::Result<Option<AdHocParticipantRecord>> {
        Ok(self.sessions.get(&(event_id, discord_user_id)).map(|e| e.clone()))
    }

    async fn list_for_event(&self, event_id: EventId) -> anyhow::Result<Vec<AdHocParticipantRecord>> {
        Ok(self.sessions.iter().filter(|e| e.key().0 == event_id).map(|e| e.value().clone()).collect())
    }

    async fn set_classification(
        &self,
        event_id: EventId,
        discord_user_id: DiscordId,
        classification: AttendanceClassification,
    ) -> anyhow::Result<()> {
        if let Some(mut entry) = self.sessions.get_mut(&(event_id, discord_user_id)) {
            entry.classification = Some(classification);
            entry.updated_at = self.clock.now();
        }
        Ok(())
    }

    async fn complete_event(&self, event_id: EventId, end_time: DateTime<Utc>) -> anyhow::Result<()> {
        if let Some(mut event) = self.events.get_mut(&event_id) {
            event.end_time = end_time;
        }
        Ok(())
    }
}

#[async_trait]
impl ScheduledEventStore for MemoryStore {
    async fn ended_between(&self, since: DateTime<Utc>, until: DateTime<Utc>) -> anyhow::Result<Vec<ScheduledEvent>> {
        Ok(self
            .events
            .iter()
            .filter(|e| e.cancelled_at.is_none() && e.end_time >= since && e.end_time <= until)
            .map(|e| e.value().clone())
            .collect())
    }

    async fn live_at(&self, guild_id: DiscordId, at: DateTime<Utc>) -> anyhow::Result<Vec<ScheduledEvent>> {
        let guild_game_ids: std::collections::HashSet<Option<i64>> = self
            .bindings
            .iter()
            .filter(|b| b.guild_id == guild_id && b.purpose == BindingPurpose::VoiceMonitor)
            .map(|b| b.game_id)
            .collect();

        Ok(self
            .events
            .iter()
            .filter(|e| e.is_live(at) && guild_game_ids.contains(&e.game_id))
            .map(|e| e.value().clone())
            .collect())
    }

    async fn get(&self, event_id: EventId) -> anyhow::Result<Option<ScheduledEvent>> {
        Ok(self.events.get(&event_id).map(|e| e.clone()))
    }

    async fn create_ad_hoc(&self, title: String, game_id: Option<i64>, start_time: DateTime<Utc>) -> anyhow::Result<EventId> {
        let id = EventId::new();
        self.events.insert(
            id,
            ScheduledEvent {
                id,
                title,
                start_time,
                end_time: start_time,
                game_id,
                cancelled_at: None,
                series_id: None,
                is_ad_hoc: true,
            },
        );
        Ok(id)
    }
}

#[async_trait]
impl SignupStore for MemoryStore {
    async fn signups_missing_status(&self, event_id: EventId) -> anyhow::Result<Vec<(DiscordId, Option<AttendanceClassification>)>> {
        Ok(self
            .signups
            .iter()
            .filter(|e| e.key().0 == event_id && e.value().is_none())
            .map(|e| (e.key().1, *e.value()))
            .collect())
    }

    async fn signed_up_user_ids(&self, event_id: EventId) -> anyhow::Result<Vec<DiscordId>> {
        Ok(self.signups.iter().filter(|e| e.key().0 == event_id).map(|e| e.key().1).collect())
    }

    async fn set_status_if_null(
        &self,
        event_id: EventId,
        discord_user_id: DiscordId,
        classification: AttendanceClassification,
    ) -> anyhow::Result<()> {
        if let Some(mut entry) = self.signups.get_mut(&(event_id, discord_user_id)) {
            if entry.is_none() {
                *entry = Some(classification);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl AvailabilityStore for MemoryStore {
    async fn check_conflicts(
        &self,
        user_id: DiscordId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        exclude_game_id: Option<i64>,
        exclude_id: Option<Uuid>,
    ) -> anyhow::Result<Vec<AvailabilityWindow>> {
        let windows: Vec<AvailabilityWindow> =
            self.availability.iter().filter(|e| e.user_id == user_id).map(|e| e.value().clone()).collect();

        Ok(crate::availability::conflicts(windows.iter(), start, end, exclude_game_id, exclude_id))
    }

    async fn windows_for_users_in_range(
        &self,
        user_ids: &[DiscordId],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> anyhow::Result<std::collections::HashMap<DiscordId, Vec<AvailabilityWindow>>> {
        let mut out: std::collections::HashMap<DiscordId, Vec<AvailabilityWindow>> = std::collections::HashMap::new();

        for entry in self.availability.iter() {
            let w = entry.value();
            if user_ids.contains(&w.user_id) && w.overlaps(start, end) {
                out.entry(w.user_id).or_default().push(w.clone());
            }
        }

        Ok(out)
    }

    async fn insert_window(
        &self,
        user_id: DiscordId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        status: AvailabilityStatus,
        game_id: Option<i64>,
        source_event_id: Option<EventId>,
    ) -> anyhow::Result<AvailabilityWindow> {
        let window = AvailabilityWindow {
            id: Uuid::new_v4(),
            user_id,
            start,
            end,
            status,
            game_id,
            source_event_id,
        };

        if !window.is_valid() {
            anyhow::bail!("availability window must satisfy end > start and span <= 24h");
        }

        self.availability.insert(window.id, window.clone());
        Ok(window)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TestClock;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn store() -> Arc<MemoryStore> {
        MemoryStore::new(Arc::new(TestClock::new(t(0))))
    }

    #[tokio::test]
    async fn bind_then_find_round_trips() {
        let store = store();
        let (binding, replaced) = store
            .bind(DiscordId(1), DiscordId(2), ChannelKind::Voice, BindingPurpose::VoiceMonitor, None, None, None)
            .await
            .unwrap();
        assert!(replaced.is_empty());

        let found = store.find(DiscordId(1), DiscordId(2), &[BindingPurpose::VoiceMonitor]).await.unwrap();
        assert_eq!(found.unwrap().id, binding.id);
    }

    #[tokio::test]
    async fn rebinding_same_channel_replaces_previous_binding() {
        let store = store();
        let (first, _) = store
            .bind(DiscordId(1), DiscordId(2), ChannelKind::Voice, BindingPurpose::VoiceMonitor, None, None, None)
            .await
            .unwrap();

        let (_second, replaced) = store
            .bind(DiscordId(1), DiscordId(2), ChannelKind::Voice, BindingPurpose::VoiceMonitor, Some(7), None, None)
            .await
            .unwrap();

        assert_eq!(replaced, vec![first.id]);
        assert!(store.get(first.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn update_config_merges_partial_over_existing() {
        let store = store();
        let (binding, _) = store
            .bind(DiscordId(1), DiscordId(2), ChannelKind::Voice, BindingPurpose::VoiceMonitor, None, None, None)
            .await
            .unwrap();

        let partial = PartialBindingConfig {
            min_players: Some(5),
            ..Default::default()
        };
        let updated = store.update_config(binding.id, partial, None).await.unwrap().unwrap();

        assert_eq!(updated.config.min_players, 5);
        assert_eq!(updated.config.grace_period_sec, BindingConfig::default().grace_period_sec);
    }

    #[tokio::test]
    async fn playing_override_expires_after_thirty_minutes() {
        let clock = Arc::new(TestClock::new(t(0)));
        let store = MemoryStore::new(clock.clone());

        store.set_playing_override(DiscordId(1), "Factorio".into()).await.unwrap();
        assert_eq!(store.playing_override(DiscordId(1)).await.unwrap(), Some("Factorio".into()));

        clock.advance(chrono::Duration::minutes(31));
        assert_eq!(store.playing_override(DiscordId(1)).await.unwrap(), None);
    }

    #[tokio::test]
    async fn trigram_match_finds_closest_catalog_entry_above_threshold() {
        let store = store();
        store.seed_game(1, "Counter-Strike 2");
        store.seed_game(2, "Factorio");

        let hit = store.trigram_match("Counter Strike2", 0.7).await.unwrap();
        assert_eq!(hit.map(|(id, _)| id), Some(1));

        let miss = store.trigram_match("Some Totally Unrelated Thing", 0.95).await.unwrap();
        assert!(miss.is_none());
    }

    #[tokio::test]
    async fn signup_status_is_set_only_when_null() {
        let store = store();
        let event_id = EventId::new();
        store.seed_signup(event_id, DiscordId(1));

        store.set_status_if_null(event_id, DiscordId(1), AttendanceClassification::Full).await.unwrap();
        store.set_status_if_null(event_id, DiscordId(1), AttendanceClassification::NoShow).await.unwrap();

        let missing = store.signups_missing_status(event_id).await.unwrap();
        assert!(missing.is_empty());
    }

    #[tokio::test]
    async fn insert_window_rejects_invalid_span() {
        let store = store();
        let result = store
            .insert_window(DiscordId(1), t(0), t(25 * 3600), AvailabilityStatus::Committed, None, None)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn check_conflicts_delegates_to_pure_overlap_logic() {
        let store = store();
        store
            .insert_window(DiscordId(1), t(0), t(3600), AvailabilityStatus::Committed, Some(7), None)
            .await
            .unwrap();

        let conflicts = store.check_conflicts(DiscordId(1), t(1800), t(5000), Some(9), None).await.unwrap();
        assert_eq!(conflicts.len(), 1);

        let no_conflicts = store.check_conflicts(DiscordId(1), t(1800), t(5000), Some(7), None).await.unwrap();
        assert!(no_conflicts.is_empty());
    }
}
