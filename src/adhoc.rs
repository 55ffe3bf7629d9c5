//! §4.5 Ad-Hoc Session Engine: the `∅ -> ACTIVE -> GRACE -> COMPLETED` state
//! machine per `(bindingId, gameId?)`, including general-lobby consensus
//! spawning and the just-chatting policy.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Mutex as AsyncMutex;

use crate::clock::Clock;
use crate::consensus::{self, Group};
use crate::model::{
    AdHocParticipantRecord, AdHocSessionState, BindingConfig, BindingId, ChannelBinding, DiscordId,
    EventId, InMemorySession, MemberHint,
};
use crate::notifier::{NotificationBatcher, PendingRender};
use crate::ports::{ScheduledEventStore, SessionStore};
use crate::resolver::{GameResolver, Resolution};
use crate::scheduler::Schedulers;
use crate::utils::prelude::*;

const JUST_CHATTING: &str = "Just Chatting";

struct GameSession {
    state: AdHocSessionState,
    participants: HashMap<DiscordId, InMemorySession>,
}

impl GameSession {
    fn is_empty(&self) -> bool {
        self.state.member_set.is_empty()
    }
}

/// Per-binding lobby state. One binding may host several concurrent
/// `GameSession`s when it is general-lobby (§4.5 "A joiner whose own
/// presence resolves to a different non-null game below majority produces
/// a second concurrent session").
struct LobbyState {
    binding: ChannelBinding,
    /// General-lobby members not yet attached to any game session, with
    /// their last resolution.
    waiting: HashMap<DiscordId, (String, Resolution)>,
    /// `allowJustChatting = false` members resolved to nothing: present,
    /// tracked only so a later presence change can re-evaluate them.
    untracked: HashMap<DiscordId, String>,
    games: HashMap<Option<i64>, GameSession>,
}

impl LobbyState {
    fn new(binding: ChannelBinding) -> Self {
        Self {
            binding,
            waiting: HashMap::new(),
            untracked: HashMap::new(),
            games: HashMap::new(),
        }
    }

    fn total_present(&self) -> usize {
        self.waiting.len() + self.games.values().map(|g| g.state.member_set.len()).sum::<usize>()
    }
}

pub struct AdhocEngine {
    schedulers: Arc<Schedulers>,
    resolver: Arc<GameResolver>,
    scheduled_events: Arc<dyn ScheduledEventStore>,
    session_store: Arc<dyn SessionStore>,
    notifier: Arc<NotificationBatcher>,
    clock: Arc<dyn Clock>,
    lobbies: dashmap::DashMap<BindingId, Arc<AsyncMutex<LobbyState>>>,
}

impl AdhocEngine {
    pub fn new(
        schedulers: Arc<Schedulers>,
        resolver: Arc<GameResolver>,
        scheduled_events: Arc<dyn ScheduledEventStore>,
        session_store: Arc<dyn SessionStore>,
        notifier: Arc<NotificationBatcher>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        Arc::new(Self {
            schedulers,
            resolver,
            scheduled_events,
            session_store,
            notifier,
            clock,
            lobbies: dashmap::DashMap::new(),
        })
    }

    fn lobby_for(&self, binding: &ChannelBinding) -> Arc<AsyncMutex<LobbyState>> {
        self.lobbies
            .entry(binding.id)
            .or_insert_with(|| Arc::new(AsyncMutex::new(LobbyState::new(binding.clone()))))
            .clone()
    }

    /// `handleChannelJoin` routed here by the gateway (§4.2) once a binding
    /// resolves to voice-monitor. `binding` is assumed current; callers
    /// refresh it via the binding cache before calling.
    pub async fn handle_join(
        self: &Arc<Self>,
        notify_channel_id: DiscordId,
        binding: &ChannelBinding,
        user_id: DiscordId,
        hint: &MemberHint,
    ) {
        let lobby_lock = self.lobby_for(binding);
        let mut lobby = lobby_lock.lock().await;
        lobby.binding = binding.clone();
        let now = self.clock.now();

        if binding.is_game_specific() {
            self.handle_game_specific_join(&mut lobby, notify_channel_id, user_id, hint, now)
                .await;
            return;
        }

        self.handle_general_lobby_join(&mut lobby, notify_channel_id, user_id, hint, now)
            .await;
    }

    /// Game-specific binding join (§4.5 "∅ -> ACTIVE on join raises count >=
    /// minPlayers"): members accumulate in `lobby.waiting` exactly like a
    /// general lobby's pre-spawn pool, but the game identity is fixed by
    /// the binding rather than run through consensus.
    async fn handle_game_specific_join(
        self: &Arc<Self>,
        lobby: &mut LobbyState,
        notify_channel_id: DiscordId,
        user_id: DiscordId,
        hint: &MemberHint,
        now: DateTime<Utc>,
    ) {
        let game_id = lobby.binding.game_id;

        if lobby.games.contains_key(&game_id) {
            let resolution = self.resolver.resolve(user_id, hint.playing_activity().unwrap_or("")).await;
            let game_name = if resolution.game_id == game_id {
                resolution.game_name
            } else {
                hint.playing_activity().unwrap_or("").to_string()
            };
            self.attach_or_spawn(
                lobby,
                notify_channel_id,
                game_id,
                game_name,
                user_id,
                hint.display_name.clone(),
                now,
            )
            .await;
            return;
        }

        let resolution = self.resolver.resolve(user_id, hint.playing_activity().unwrap_or("")).await;
        lobby
            .waiting
            .insert(user_id, (hint.display_name.clone(), resolution));

        if lobby.total_present() < lobby.binding.config.min_players as usize {
            return;
        }

        let game_name = lobby
            .waiting
            .values()
            .find(|(_, res)| res.game_id == game_id)
            .map(|(_, res)| res.game_name.clone())
            .unwrap_or_else(|| hint.playing_activity().unwrap_or("").to_string());

        let members: Vec<(DiscordId, String)> =
            lobby.waiting.drain().map(|(id, (name, _))| (id, name)).collect();

        for (member_id, display_name) in members {
            self.attach_or_spawn(
                lobby,
                notify_channel_id,
                game_id,
                game_name.clone(),
                member_id,
                display_name,
                now,
            )
            .await;
        }
    }

    async fn handle_general_lobby_join(
        self: &Arc<Self>,
        lobby: &mut LobbyState,
        notify_channel_id: DiscordId,
        user_id: DiscordId,
        hint: &MemberHint,
        now: DateTime<Utc>,
    ) {
        let activity = hint.playing_activity().unwrap_or("");
        let resolution = self.resolver.resolve(user_id, activity).await;

        let resolution = if resolution.game_id.is_none() {
            if lobby.binding.config.allow_just_chatting {
                Resolution {
                    game_id: None,
                    game_name: JUST_CHATTING.to_string(),
                }
            } else {
                lobby.untracked.insert(user_id, hint.display_name.clone());
                return;
            }
        } else {
            resolution
        };

        if lobby.games.contains_key(&resolution.game_id) {
            self.attach_or_spawn(
                lobby,
                notify_channel_id,
                resolution.game_id,
                resolution.game_name,
                user_id,
                hint.display_name.clone(),
                now,
            )
            .await;
            return;
        }

        lobby
            .waiting
            .insert(user_id, (hint.display_name.clone(), resolution));

        // Threshold is evaluated over the waiting pool alone, not the whole
        // lobby: an already-spawned game's members are already accounted
        // for by its own session, so they must not count again here.
        // Re-evaluating per join (rather than gating on `games.is_empty()`)
        // is what lets a second concurrent session spawn once enough
        // waiting members agree on a different game (§4.5 "a second
        // concurrent session in the same channel").
        if lobby.waiting.len() >= lobby.binding.config.min_players as usize {
            self.spawn_from_consensus(lobby, notify_channel_id, now).await;
        }
    }

    async fn spawn_from_consensus(
        self: &Arc<Self>,
        lobby: &mut LobbyState,
        notify_channel_id: DiscordId,
        now: DateTime<Utc>,
    ) {
        let members: Vec<(DiscordId, Resolution)> = lobby
            .waiting
            .iter()
            .map(|(id, (_, res))| (*id, res.clone()))
            .collect();
        let groups: Vec<Group> = consensus::detect(&members);

        for group in groups {
            let display_names: Vec<(DiscordId, String)> = group
                .member_ids
                .iter()
                .filter_map(|id| lobby.waiting.remove(id).map(|(name, _)| (*id, name)))
                .collect();

            for (user_id, display_name) in display_names {
                self.attach_or_spawn(
                    lobby,
                    notify_channel_id,
                    group.game_id,
                    group.game_name.clone(),
                    user_id,
                    display_name,
                    now,
                )
                .await;
            }
        }
    }

    /// Attach `user_id` to the existing session for `game_id`, or spawn one
    /// if none exists (§4.5 "Spawn", guarded per-binding by the caller
    /// already holding `lobby`'s lock).
    #[allow(clippy::too_many_arguments)]
    async fn attach_or_spawn(
        self: &Arc<Self>,
        lobby: &mut LobbyState,
        notify_channel_id: DiscordId,
        game_id: Option<i64>,
        game_name: String,
        user_id: DiscordId,
        display_name: String,
        now: DateTime<Utc>,
    ) {
        if let Some(session) = lobby.games.get_mut(&game_id) {
            session.state.member_set.insert(user_id);
            session
                .participants
                .entry(user_id)
                .and_modify(|s| s.reopen(now))
                .or_insert_with(|| InMemorySession::new(session.state.event_id, user_id, display_name, now));

            if self.schedulers.grace.cancel(&session.state.event_id) {
                session.state.grace_armed = false;
                session.state.last_extended_at = now;
            }

            self.queue_roster_update(session, notify_channel_id);
            return;
        }

        let event_id = match self
            .scheduled_events
            .create_ad_hoc(game_name.clone(), game_id, now)
            .await
        {
            Ok(id) => id,
            Err(e) => {
                warn!("Failed to persist ad-hoc event for binding '{}': {e:#}", lobby.binding.id);
                return;
            },
        };

        let mut participants = HashMap::new();
        participants.insert(
            user_id,
            InMemorySession::new(event_id, user_id, display_name, now),
        );

        let state = AdHocSessionState::new(event_id, lobby.binding.id, game_id, game_name.clone(), [user_id], now);
        let session = GameSession { state, participants };

        self.notifier
            .notify_spawned(notify_channel_id, event_id, game_name, vec![lobby_member_name(&session, user_id)])
            .await;

        lobby.games.insert(game_id, session);
    }

    fn queue_roster_update(&self, session: &GameSession, notify_channel_id: DiscordId) {
        let member_names: Vec<String> = session
            .participants
            .values()
            .filter(|s| s.is_active)
            .map(|s| s.display_name.clone())
            .collect();

        self.notifier.queue_update(
            notify_channel_id,
            session.state.event_id,
            PendingRender {
                game_name: session.state.game_name.clone(),
                member_names,
            },
        );
    }

    /// `handleChannelLeave`.
    pub async fn handle_leave(self: &Arc<Self>, notify_channel_id: DiscordId, binding: &ChannelBinding, user_id: DiscordId) {
        let lobby_lock = self.lobby_for(binding);
        let mut lobby = lobby_lock.lock().await;
        let now = self.clock.now();

        if lobby.untracked.remove(&user_id).is_some() {
            return;
        }
        if lobby.waiting.remove(&user_id).is_some() {
            return;
        }

        let Some(game_id) = lobby
            .games
            .iter()
            .find(|(_, s)| s.participants.contains_key(&user_id))
            .map(|(id, _)| *id)
        else {
            return;
        };

        let Some(session) = lobby.games.get_mut(&game_id) else {
            return;
        };

        session.state.member_set.remove(&user_id);
        if let Some(s) = session.participants.get_mut(&user_id) {
            s.close(now);
        }

        if session.is_empty() {
            session.state.grace_armed = true;
            let event_id = session.state.event_id;
            let grace = Duration::from_secs(lobby.binding.config.grace_period_sec);

            let this = Arc::clone(self);
            let binding_id = binding.id;
            self.schedulers.grace.arm(event_id, grace, move || async move {
                this.fire_grace(binding_id, event_id).await;
            });
        } else {
            self.queue_roster_update(session, notify_channel_id);
        }
    }

    /// Game-switch migration (§4.5): a presence-activity change for a user
    /// already attached to a general-lobby session.
    pub async fn handle_presence_change(
        self: &Arc<Self>,
        notify_channel_id: DiscordId,
        binding: &ChannelBinding,
        user_id: DiscordId,
        hint: &MemberHint,
    ) {
        if !binding.is_general_lobby() {
            return;
        }

        let lobby_lock = self.lobby_for(binding);
        let current_game = {
            let lobby = lobby_lock.lock().await;
            lobby
                .games
                .iter()
                .find(|(_, s)| s.participants.contains_key(&user_id))
                .map(|(id, _)| *id)
        };

        let Some(current_game) = current_game else {
            return;
        };

        let resolution = self
            .resolver
            .resolve(user_id, hint.playing_activity().unwrap_or(""))
            .await;

        if resolution.game_id == current_game {
            return;
        }

        self.handle_leave(notify_channel_id, binding, user_id).await;

        if resolution.game_id.is_none() && !binding.config.allow_just_chatting {
            return;
        }

        self.handle_join(notify_channel_id, binding, user_id, hint).await;
    }

    /// §4.8 live-roster read model for an in-progress ad-hoc session.
    pub async fn roster_for(&self, binding_id: BindingId, event_id: EventId) -> Option<crate::roster::RosterDto> {
        let lobby_lock = self.lobbies.get(&binding_id)?.clone();
        let lobby = lobby_lock.lock().await;
        let now = self.clock.now();
        let session = lobby.games.values().find(|g| g.state.event_id == event_id)?;
        Some(crate::roster::build_roster(event_id, session.participants.values(), now))
    }

    async fn fire_grace(self: Arc<Self>, binding_id: BindingId, event_id: EventId) {
        let Some(lobby_lock) = self.lobbies.get(&binding_id).map(|e| e.clone()) else {
            return;
        };
        let mut lobby = lobby_lock.lock().await;

        let Some(game_id) = lobby
            .games
            .iter()
            .find(|(_, s)| s.state.event_id == event_id)
            .map(|(id, _)| *id)
        else {
            return;
        };

        let Some(session) = lobby.games.remove(&game_id) else {
            return;
        };

        if !session.is_empty() {
            // Re-armed/rejoined between the timer firing and this lock: put
            // it back, nothing to complete.
            lobby.games.insert(game_id, session);
            return;
        }

        let now = self.clock.now();
        let mut durations = Vec::with_capacity(session.participants.len());

        for (_, mut participant) in session.participants {
            participant.close(now);
            durations.push((participant.display_name.clone(), participant.total_duration_sec));

            let record = AdHocParticipantRecord::from_session(&participant, now);
            if let Err(e) = self.session_store.upsert(record).await {
                warn!("Failed to flush ad-hoc participant for event '{event_id}': {e:#}");
            }
        }

        if let Err(e) = self.session_store.complete_event(event_id, now).await {
            warn!("Failed to mark ad-hoc event '{event_id}' completed: {e:#}");
        }

        self.notifier
            .notify_completed(event_id, session.state.game_name.clone(), durations)
            .await;
    }
}

fn lobby_member_name(session: &GameSession, user_id: DiscordId) -> String {
    session
        .participants
        .get(&user_id)
        .map(|s| s.display_name.clone())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::clock::TestClock;
    use crate::model::{Activity, ActivityKind, BindingId as BId, BindingPurpose, ChannelKind};
    use crate::ports::{GameRegistryStore, NotificationPayload, NotificationSender};

    fn hint(name: &str, activity: Option<&str>) -> MemberHint {
        MemberHint {
            display_name: name.to_string(),
            avatar_hash: None,
            activities: activity
                .map(|a| vec![Activity { kind: ActivityKind::Playing, name: a.to_string() }])
                .unwrap_or_default(),
        }
    }

    fn game_specific_binding(min_players: u32, grace_sec: u64) -> ChannelBinding {
        ChannelBinding {
            id: BId::new(),
            guild_id: DiscordId(1),
            channel_id: DiscordId(2),
            channel_kind: ChannelKind::Voice,
            purpose: BindingPurpose::VoiceMonitor,
            game_id: Some(7),
            series_id: None,
            config: BindingConfig {
                min_players,
                grace_period_sec: grace_sec,
                notification_channel_id: None,
                allow_just_chatting: false,
            },
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }

    fn general_lobby_binding(min_players: u32) -> ChannelBinding {
        ChannelBinding {
            id: BId::new(),
            guild_id: DiscordId(1),
            channel_id: DiscordId(2),
            channel_kind: ChannelKind::Voice,
            purpose: BindingPurpose::VoiceMonitor,
            game_id: None,
            series_id: None,
            config: BindingConfig {
                min_players,
                grace_period_sec: 180,
                notification_channel_id: None,
                allow_just_chatting: false,
            },
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }

    #[derive(Default)]
    struct NullRegistry;

    #[async_trait]
    impl GameRegistryStore for NullRegistry {
        async fn mapped_game(&self, _n: &str) -> anyhow::Result<Option<(i64, String)>> {
            Ok(None)
        }
        async fn exact_match(&self, name: &str) -> anyhow::Result<Option<(i64, String)>> {
            Ok(Some((7, name.to_string())))
        }
        async fn case_insensitive_match(&self, _n: &str) -> anyhow::Result<Option<(i64, String)>> {
            Ok(None)
        }
        async fn trigram_match(&self, _n: &str, _t: f64) -> anyhow::Result<Option<(i64, String)>> {
            Ok(None)
        }
        fn supports_trigram(&self) -> bool {
            false
        }
        async fn set_playing_override(&self, _u: DiscordId, _g: String) -> anyhow::Result<()> {
            Ok(())
        }
        async fn playing_override(&self, _u: DiscordId) -> anyhow::Result<Option<String>> {
            Ok(None)
        }
    }

    struct FakeScheduledEvents {
        next_id: std::sync::Mutex<Option<EventId>>,
        completed: AtomicU32,
    }

    #[async_trait]
    impl ScheduledEventStore for FakeScheduledEvents {
        async fn ended_between(&self, _s: DateTime<Utc>, _u: DateTime<Utc>) -> anyhow::Result<Vec<crate::model::ScheduledEvent>> {
            Ok(vec![])
        }
        async fn live_at(&self, _g: DiscordId, _a: DateTime<Utc>) -> anyhow::Result<Vec<crate::model::ScheduledEvent>> {
            Ok(vec![])
        }
        async fn get(&self, _e: EventId) -> anyhow::Result<Option<crate::model::ScheduledEvent>> {
            Ok(None)
        }
        async fn create_ad_hoc(&self, _title: String, _game_id: Option<i64>, _start: DateTime<Utc>) -> anyhow::Result<EventId> {
            let id = self.next_id.lock().unwrap().unwrap_or_else(EventId::new);
            Ok(id)
        }
    }

    #[derive(Default)]
    struct FakeSessionStore {
        upserts: AtomicU32,
        completions: AtomicU32,
    }

    #[async_trait]
    impl SessionStore for FakeSessionStore {
        async fn upsert(&self, _r: AdHocParticipantRecord) -> anyhow::Result<()> {
            self.upserts.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        async fn get(&self, _e: EventId, _u: DiscordId) -> anyhow::Result<Option<AdHocParticipantRecord>> {
            Ok(None)
        }
        async fn list_for_event(&self, _e: EventId) -> anyhow::Result<Vec<AdHocParticipantRecord>> {
            Ok(vec![])
        }
        async fn set_classification(
            &self,
            _e: EventId,
            _u: DiscordId,
            _c: crate::model::AttendanceClassification,
        ) -> anyhow::Result<()> {
            Ok(())
        }
        async fn complete_event(&self, _e: EventId, _at: DateTime<Utc>) -> anyhow::Result<()> {
            self.completions.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct FakeSender {
        sends: AtomicU32,
    }

    #[async_trait]
    impl NotificationSender for FakeSender {
        async fn send_or_edit(
            &self,
            _c: DiscordId,
            message_id: Option<String>,
            _p: NotificationPayload,
        ) -> anyhow::Result<String> {
            self.sends.fetch_add(1, Ordering::SeqCst);
            Ok(message_id.unwrap_or_else(|| "m".into()))
        }
    }

    fn build_engine() -> (Arc<AdhocEngine>, Arc<FakeSessionStore>, Arc<FakeSender>) {
        let schedulers = Schedulers::new();
        let resolver = Arc::new(GameResolver::new(Arc::new(NullRegistry), Arc::new(TestClock::new(Utc::now()))));
        let scheduled_events = Arc::new(FakeScheduledEvents {
            next_id: std::sync::Mutex::new(None),
            completed: AtomicU32::new(0),
        });
        let session_store = Arc::new(FakeSessionStore::default());
        let sender = Arc::new(FakeSender { sends: AtomicU32::new(0) });
        let notifier = NotificationBatcher::new(sender.clone());
        let clock = Arc::new(TestClock::new(Utc::now()));

        let engine = AdhocEngine::new(schedulers, resolver, scheduled_events, session_store.clone(), notifier, clock);
        (engine, session_store, sender)
    }

    #[tokio::test(start_paused = true)]
    async fn two_joins_spawn_session_for_game_specific_binding() {
        let (engine, _store, sender) = build_engine();
        let binding = game_specific_binding(2, 180);

        engine.handle_join(DiscordId(99), &binding, DiscordId(1), &hint("a", Some("Factorio"))).await;
        engine.handle_join(DiscordId(99), &binding, DiscordId(2), &hint("b", Some("Factorio"))).await;

        assert_eq!(sender.sends.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn empty_session_completes_after_grace_period() {
        let (engine, store, sender) = build_engine();
        let binding = game_specific_binding(1, 60);

        engine.handle_join(DiscordId(99), &binding, DiscordId(1), &hint("a", Some("Factorio"))).await;
        engine.handle_leave(DiscordId(99), &binding, DiscordId(1)).await;

        tokio::time::advance(Duration::from_secs(61)).await;
        tokio::task::yield_now().await;

        assert_eq!(store.completions.load(Ordering::SeqCst), 1);
        assert_eq!(sender.sends.load(Ordering::SeqCst), 2); // spawn + completion
    }

    #[tokio::test(start_paused = true)]
    async fn rejoin_during_grace_cancels_completion() {
        let (engine, store, _sender) = build_engine();
        let binding = game_specific_binding(1, 60);

        engine.handle_join(DiscordId(99), &binding, DiscordId(1), &hint("a", Some("Factorio"))).await;
        engine.handle_leave(DiscordId(99), &binding, DiscordId(1)).await;

        tokio::time::advance(Duration::from_secs(30)).await;
        engine.handle_join(DiscordId(99), &binding, DiscordId(1), &hint("a", Some("Factorio"))).await;

        tokio::time::advance(Duration::from_secs(61)).await;
        tokio::task::yield_now().await;

        assert_eq!(store.completions.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn solo_join_below_threshold_does_not_spawn() {
        let (engine, store, sender) = build_engine();
        let binding = game_specific_binding(2, 60);

        engine.handle_join(DiscordId(99), &binding, DiscordId(1), &hint("a", Some("Factorio"))).await;
        tokio::time::advance(Duration::from_secs(60)).await;
        tokio::task::yield_now().await;

        assert_eq!(sender.sends.load(Ordering::SeqCst), 0);
        assert_eq!(store.completions.load(Ordering::SeqCst), 0);
    }

    /// Resolves by name instead of collapsing everything to one game id, so
    /// a general-lobby test can tell two distinct games apart.
    #[derive(Default)]
    struct NamedRegistry;

    #[async_trait]
    impl GameRegistryStore for NamedRegistry {
        async fn mapped_game(&self, _n: &str) -> anyhow::Result<Option<(i64, String)>> {
            Ok(None)
        }
        async fn exact_match(&self, name: &str) -> anyhow::Result<Option<(i64, String)>> {
            Ok(match name {
                "WoW" => Some((1, "WoW".to_string())),
                "Final Fantasy XIV" => Some((20, "Final Fantasy XIV".to_string())),
                _ => None,
            })
        }
        async fn case_insensitive_match(&self, _n: &str) -> anyhow::Result<Option<(i64, String)>> {
            Ok(None)
        }
        async fn trigram_match(&self, _n: &str, _t: f64) -> anyhow::Result<Option<(i64, String)>> {
            Ok(None)
        }
        fn supports_trigram(&self) -> bool {
            false
        }
        async fn set_playing_override(&self, _u: DiscordId, _g: String) -> anyhow::Result<()> {
            Ok(())
        }
        async fn playing_override(&self, _u: DiscordId) -> anyhow::Result<Option<String>> {
            Ok(None)
        }
    }

    fn build_engine_with_registry(
        registry: Arc<dyn GameRegistryStore>,
    ) -> (Arc<AdhocEngine>, Arc<FakeSessionStore>, Arc<FakeSender>) {
        let schedulers = Schedulers::new();
        let resolver = Arc::new(GameResolver::new(registry, Arc::new(TestClock::new(Utc::now()))));
        let scheduled_events = Arc::new(FakeScheduledEvents {
            next_id: std::sync::Mutex::new(None),
            completed: AtomicU32::new(0),
        });
        let session_store = Arc::new(FakeSessionStore::default());
        let sender = Arc::new(FakeSender { sends: AtomicU32::new(0) });
        let notifier = NotificationBatcher::new(sender.clone());
        let clock = Arc::new(TestClock::new(Utc::now()));

        let engine = AdhocEngine::new(schedulers, resolver, scheduled_events, session_store.clone(), notifier, clock);
        (engine, session_store, sender)
    }

    #[tokio::test(start_paused = true)]
    async fn game_switch_spawns_second_concurrent_session_once_its_own_threshold_is_met() {
        // Scenario 4: general lobby, minPlayers=2. A and B join playing WoW
        // and spawn S1. A switches to FFXIV; per spec this only detaches A
        // (tracked-but-unassigned) since minPlayers=2 isn't met by A alone.
        // C then joins playing FFXIV too, crossing the threshold for the
        // *waiting* pool and spawning a second, concurrent session S2 while
        // S1 (still holding B) remains untouched.
        let (engine, _store, sender) = build_engine_with_registry(Arc::new(NamedRegistry));
        let binding = general_lobby_binding(2);

        engine.handle_join(DiscordId(99), &binding, DiscordId(1), &hint("a", Some("WoW"))).await;
        engine.handle_join(DiscordId(99), &binding, DiscordId(2), &hint("b", Some("WoW"))).await;
        assert_eq!(sender.sends.load(Ordering::SeqCst), 1); // S1 spawned

        engine
            .handle_presence_change(DiscordId(99), &binding, DiscordId(1), &hint("a", Some("Final Fantasy XIV")))
            .await;
        assert_eq!(sender.sends.load(Ordering::SeqCst), 1); // A alone: below S2's threshold

        engine.handle_join(DiscordId(99), &binding, DiscordId(3), &hint("c", Some("Final Fantasy XIV"))).await;
        assert_eq!(sender.sends.load(Ordering::SeqCst), 2); // S2 spawned alongside S1

        let lobby_lock = engine.lobbies.get(&binding.id).unwrap().clone();
        let lobby = lobby_lock.lock().await;
        assert_eq!(lobby.games.len(), 2);
        assert!(lobby.games.get(&Some(1)).unwrap().state.member_set.contains(&DiscordId(2)));
        assert!(!lobby.games.get(&Some(1)).unwrap().state.member_set.contains(&DiscordId(1)));
        let s2 = lobby.games.get(&Some(20)).unwrap();
        assert!(s2.state.member_set.contains(&DiscordId(1)) && s2.state.member_set.contains(&DiscordId(3)));
    }

    #[tokio::test(start_paused = true)]
    async fn third_join_to_game_specific_binding_attaches_to_existing_session() {
        let (engine, _store, sender) = build_engine();
        let binding = game_specific_binding(2, 180);

        engine.handle_join(DiscordId(99), &binding, DiscordId(1), &hint("a", Some("Factorio"))).await;
        engine.handle_join(DiscordId(99), &binding, DiscordId(2), &hint("b", Some("Factorio"))).await;
        engine.handle_join(DiscordId(99), &binding, DiscordId(3), &hint("c", Some("Factorio"))).await;

        // Only the threshold-crossing join renders a spawn; the third is a
        // debounced roster update, not a second spawn.
        assert_eq!(sender.sends.load(Ordering::SeqCst), 1);
    }
}
