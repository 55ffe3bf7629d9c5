//! The crate's façade: wires every component into one `Engine`, exposes the
//! admin command surface as plain async methods, and drives the periodic
//! schedulers (binding-cache sweep, attendance flush, classification tick)
//! plus gateway event dispatch and clean shutdown.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use crate::adhoc::AdhocEngine;
use crate::attendance::AttendanceEngine;
use crate::binding_cache::BindingCache;
use crate::classifier::ClassificationLoop;
use crate::clock::Clock;
use crate::error::{EngineError, EngineResult};
use crate::gateway::Gateway;
use crate::model::{
    AvailabilityStatus, AvailabilityWindow, BindingConfig, BindingId, BindingPurpose, ChannelBinding,
    ChannelKind, DiscordId, EventId, PartialBindingConfig, SeriesId,
};
use crate::notifier::NotificationBatcher;
use crate::ports::{
    AvailabilityStore, BindingStore, GameRegistryStore, GatewayEvent, NotificationSender,
    PresenceEventSource, ScheduledEventStore, SessionStore, SignupStore,
};
use crate::resolver::GameResolver;
use crate::roster::RosterDto;
use crate::scheduler::{PeriodicTask, Schedulers};
use crate::utils::prelude::*;

const SWEEP_PERIOD: Duration = Duration::from_secs(60);
const FLUSH_PERIOD: Duration = Duration::from_secs(30);
const CLASSIFY_PERIOD: Duration = Duration::from_secs(60);

/// Every persistence trait object the engine needs, grouped so callers build
/// one of these once (typically from a single connection pool or a single
/// in-memory store implementing all six) and hand it to [`Engine::new`].
pub struct Stores {
    pub bindings: Arc<dyn BindingStore>,
    pub games: Arc<dyn GameRegistryStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub events: Arc<dyn ScheduledEventStore>,
    pub signups: Arc<dyn SignupStore>,
    pub availability: Arc<dyn AvailabilityStore>,
}

/// The spawned periodic loops, kept around so `shutdown` can cancel them
/// cooperatively instead of just dropping the handles.
struct Loops {
    sweep: PeriodicTask,
    flush: PeriodicTask,
    classify: PeriodicTask,
}

/// Bundles every component behind the engine's command surface. One
/// `Engine` corresponds to one guild's worth of voice-presence tracking;
/// the gateway is guild-scoped, but the stores and resolver caches
/// underneath are shared process-wide so a multi-guild deployment just
/// constructs one `Engine` per guild over the same `Stores`.
pub struct Engine {
    stores: Stores,
    binding_cache: Arc<BindingCache>,
    resolver: Arc<GameResolver>,
    adhoc: Arc<AdhocEngine>,
    attendance: Arc<AttendanceEngine>,
    notifier: Arc<NotificationBatcher>,
    classifier: Arc<ClassificationLoop>,
    schedulers: Arc<Schedulers>,
    gateway: Arc<Gateway>,
    clock: Arc<dyn Clock>,
    loops: std::sync::Mutex<Option<Loops>>,
}

impl Engine {
    pub fn new(guild_id: DiscordId, stores: Stores, sender: Arc<dyn NotificationSender>, clock: Arc<dyn Clock>) -> Arc<Self> {
        let binding_cache = Arc::new(BindingCache::new(stores.bindings.clone(), clock.clone()));
        let resolver = Arc::new(GameResolver::new(stores.games.clone(), clock.clone()));
        let notifier = NotificationBatcher::new(sender);
        let schedulers = Schedulers::new();

        let adhoc = AdhocEngine::new(
            schedulers.clone(),
            resolver.clone(),
            stores.events.clone(),
            stores.sessions.clone(),
            notifier.clone(),
            clock.clone(),
        );
        let attendance = AttendanceEngine::new(stores.sessions.clone(), clock.clone());
        let classifier = Arc::new(ClassificationLoop::new(
            attendance.clone(),
            stores.events.clone(),
            stores.sessions.clone(),
            stores.signups.clone(),
        ));

        let gateway = Gateway::new(
            guild_id,
            binding_cache.clone(),
            stores.events.clone(),
            adhoc.clone(),
            attendance.clone(),
            schedulers.clone(),
            clock.clone(),
        );

        Arc::new(Self {
            stores,
            binding_cache,
            resolver,
            adhoc,
            attendance,
            notifier,
            classifier,
            schedulers,
            gateway,
            clock,
            loops: std::sync::Mutex::new(None),
        })
    }

    /// Startup recovery: reconcile in-memory state with whoever
    /// is actually present, then start the periodic loops. Call once after
    /// construction, after the presence source is ready to answer
    /// `occupied_voice_channels`.
    pub async fn start(self: &Arc<Self>, presence: Arc<dyn PresenceEventSource>) -> anyhow::Result<()> {
        self.gateway.reconnect(presence).await?;

        let binding_cache = self.binding_cache.clone();
        let sweep = PeriodicTask::spawn(SWEEP_PERIOD, move || {
            let binding_cache = binding_cache.clone();
            async move { binding_cache.sweep() }
        });

        let attendance = self.attendance.clone();
        let flush = PeriodicTask::spawn(FLUSH_PERIOD, move || {
            let attendance = attendance.clone();
            async move { attendance.flush().await }
        });

        let classifier = self.classifier.clone();
        let clock = self.clock.clone();
        let classify = PeriodicTask::spawn(CLASSIFY_PERIOD, move || {
            let classifier = classifier.clone();
            let now = clock.now();
            async move { classifier.tick(now).await }
        });

        *self.loops.lock().unwrap() = Some(Loops { sweep, flush, classify });

        Ok(())
    }

    /// Feed one presence-stream event into the gateway.
    pub async fn handle_event(self: &Arc<Self>, event: GatewayEvent) {
        self.gateway.handle_event(event).await;
    }

    /// Bot disconnect: cancel debounce/grace/update timers and clear the
    /// binding cache. The periodic loops and in-memory session tables are
    /// left running so a later `start` call can reconcile.
    pub fn disconnect(&self) {
        self.gateway.disconnect();
        self.schedulers.cancel_all();
    }

    /// Full shutdown: cancel every timer and periodic loop, waiting for the
    /// in-flight tick of each to finish cooperatively.
    pub async fn shutdown(&self) {
        self.disconnect();

        if let Some(loops) = self.loops.lock().unwrap().take() {
            loops.sweep.shutdown().await;
            loops.flush.shutdown().await;
            loops.classify.shutdown().await;
        }
    }

    // ---- admin command surface -----------------------------------------

    /// `bind(guildId, channelId, channelKind, purpose, gameId?, config?, seriesId?)`.
    #[allow(clippy::too_many_arguments)]
    pub async fn bind(
        &self,
        guild_id: DiscordId,
        channel_id: DiscordId,
        channel_kind: ChannelKind,
        purpose: BindingPurpose,
        game_id: Option<i64>,
        config: Option<BindingConfig>,
        series_id: Option<SeriesId>,
    ) -> EngineResult<ChannelBinding> {
        if purpose != BindingPurpose::VoiceMonitor && channel_kind != ChannelKind::Text {
            return Err(EngineError::validation("announcements/general-lobby purposes require a text channel"));
        }

        let (binding, replaced) = self
            .stores
            .bindings
            .bind(guild_id, channel_id, channel_kind, purpose, game_id, config, series_id)
            .await
            .map_err(EngineError::Transient)?;

        self.binding_cache.invalidate(channel_id);
        for replaced_id in replaced {
            if let Ok(Some(old)) = self.stores.bindings.get(replaced_id).await {
                self.binding_cache.invalidate(old.channel_id);
            }
        }

        Ok(binding)
    }

    /// `unbind(guildId, channelId, seriesId?)`.
    pub async fn unbind(&self, guild_id: DiscordId, channel_id: DiscordId, series_id: Option<SeriesId>) -> EngineResult<bool> {
        let removed = self
            .stores
            .bindings
            .unbind(guild_id, channel_id, series_id)
            .await
            .map_err(EngineError::Transient)?;

        self.binding_cache.invalidate(channel_id);
        Ok(removed)
    }

    /// `updateConfig(bindingId, partialConfig, purpose?)`.
    pub async fn update_config(
        &self,
        binding_id: BindingId,
        partial: PartialBindingConfig,
        purpose: Option<BindingPurpose>,
    ) -> EngineResult<ChannelBinding> {
        let updated = self
            .stores
            .bindings
            .update_config(binding_id, partial, purpose)
            .await
            .map_err(EngineError::Transient)?
            .ok_or_else(|| EngineError::not_found(format!("binding '{binding_id}'")))?;

        self.binding_cache.invalidate(updated.channel_id);
        Ok(updated)
    }

    /// `getBindings(guildId)`.
    pub async fn get_bindings(&self, guild_id: DiscordId) -> EngineResult<Vec<ChannelBinding>> {
        self.stores.bindings.list(guild_id).await.map_err(EngineError::Transient)
    }

    /// `setPlayingOverride(userId, gameName)`, a 30-minute manual override.
    pub async fn set_playing_override(&self, user_id: DiscordId, game_name: String) -> EngineResult<()> {
        if game_name.trim().is_empty() {
            return Err(EngineError::validation("game name must not be empty"));
        }

        self.stores
            .games
            .set_playing_override(user_id, game_name)
            .await
            .map_err(EngineError::Transient)
    }

    // ---- §4.8 live-roster queries ---------------------------------------

    /// Live roster for an in-progress ad-hoc session hosted by `binding_id`.
    pub async fn adhoc_roster(&self, binding_id: BindingId, event_id: EventId) -> Option<RosterDto> {
        self.adhoc.roster_for(binding_id, event_id).await
    }

    /// Live roster for a scheduled event's voice attendance.
    pub fn attendance_roster(&self, event_id: EventId) -> RosterDto {
        self.attendance.roster_for(event_id)
    }

    // ---- §6 availability surface -----------------------------------------

    /// Register an availability window, returning any committed/blocked
    /// windows it conflicts with (§3/§7: conflicts are data, not failures —
    /// the window is still created).
    #[allow(clippy::too_many_arguments)]
    pub async fn declare_availability(
        &self,
        user_id: DiscordId,
        start: chrono::DateTime<Utc>,
        end: chrono::DateTime<Utc>,
        status: AvailabilityStatus,
        game_id: Option<i64>,
        source_event_id: Option<EventId>,
    ) -> EngineResult<(AvailabilityWindow, Vec<AvailabilityWindow>)> {
        if end <= start || (end - start) > chrono::Duration::hours(24) {
            return Err(EngineError::validation("availability window must be non-empty and at most 24h"));
        }

        let conflicts = self
            .stores
            .availability
            .check_conflicts(user_id, start, end, game_id, None)
            .await
            .map_err(EngineError::Transient)?;

        let created = self
            .stores
            .availability
            .insert_window(user_id, start, end, status, game_id, source_event_id)
            .await
            .map_err(EngineError::Transient)?;

        Ok((created, conflicts))
    }
}
