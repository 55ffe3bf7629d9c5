//! Voice-event gateway: the sole consumer of the raw presence stream.
//! Applies per-user debounce, resolves channel bindings, and dispatches to
//! the ad-hoc engine or the voice-attendance engine depending on whether a
//! scheduled event currently owns the channel.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

use crate::adhoc::AdhocEngine;
use crate::attendance::AttendanceEngine;
use crate::binding_cache::BindingCache;
use crate::clock::Clock;
use crate::model::{BindingPurpose, ChannelBinding, DiscordId, MemberHint};
use crate::ports::{GatewayEvent, PresenceEventSource, ScheduledEventStore};
use crate::scheduler::Schedulers;
use crate::utils::prelude::*;

/// `newChannelId` events for the same user are suppressed until 2000ms of
/// silence.
const DEBOUNCE_MS: u64 = 2000;

struct PendingVoiceState {
    old_channel_id: Option<DiscordId>,
    new_channel_id: Option<DiscordId>,
    member_hint: MemberHint,
}

/// Owns the debounce timers and the `userId -> channelId` map, and routes
/// resolved actions into the two session engines.
pub struct Gateway {
    guild_id: DiscordId,
    binding_cache: Arc<BindingCache>,
    scheduled_events: Arc<dyn ScheduledEventStore>,
    adhoc: Arc<AdhocEngine>,
    attendance: Arc<AttendanceEngine>,
    schedulers: Arc<Schedulers>,
    clock: Arc<dyn Clock>,
    /// A parallel `userId -> channelId` map, used to route undebounced
    /// presence-activity events to the ad-hoc engine's game-switch
    /// migration only when the user's resolved channel is a general lobby.
    user_channel_map: DashMap<DiscordId, DiscordId>,
    /// Debounced-but-not-yet-fired voice-state, keyed by user, so the
    /// timer callback (which runs later, with no event payload of its own)
    /// can see the *last* state recorded for that user — a prior pending
    /// event for the same user is replaced, not queued.
    pending: DashMap<DiscordId, PendingVoiceState>,
}

impl Gateway {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        guild_id: DiscordId,
        binding_cache: Arc<BindingCache>,
        scheduled_events: Arc<dyn ScheduledEventStore>,
        adhoc: Arc<AdhocEngine>,
        attendance: Arc<AttendanceEngine>,
        schedulers: Arc<Schedulers>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        Arc::new(Self {
            guild_id,
            binding_cache,
            scheduled_events,
            adhoc,
            attendance,
            schedulers,
            clock,
            user_channel_map: DashMap::new(),
            pending: DashMap::new(),
        })
    }

    /// Entry point for one `voiceStateUpdate`: filters mute/deafen noise,
    /// then arms the per-user debounce timer.
    pub fn handle_voice_state_update(
        self: &Arc<Self>,
        user_id: DiscordId,
        old_channel_id: Option<DiscordId>,
        new_channel_id: Option<DiscordId>,
        member_hint: MemberHint,
    ) {
        // Step 1: mute/deafen noise.
        if old_channel_id == new_channel_id {
            return;
        }

        self.pending.insert(
            user_id,
            PendingVoiceState {
                old_channel_id,
                new_channel_id,
                member_hint,
            },
        );

        let this = Arc::clone(self);
        self.schedulers
            .debounce
            .arm(user_id, Duration::from_millis(DEBOUNCE_MS), move || async move {
                this.fire_debounced(user_id).await;
            });
    }

    async fn fire_debounced(self: Arc<Self>, user_id: DiscordId) {
        let Some((_, pending)) = self.pending.remove(&user_id) else {
            return;
        };

        // Step 3: resolve actions serially, leave then join.
        if let Some(old_channel_id) = pending.old_channel_id {
            self.handle_channel_leave(old_channel_id, user_id).await;
        }
        if let Some(new_channel_id) = pending.new_channel_id {
            self.handle_channel_join(new_channel_id, user_id, &pending.member_hint)
                .await;
        }
    }

    /// Fires after the debounce settles on a join: routes to the
    /// attendance engine if a scheduled event owns the channel, otherwise
    /// the ad-hoc engine.
    async fn handle_channel_join(self: &Arc<Self>, channel_id: DiscordId, user_id: DiscordId, hint: &MemberHint) {
        self.user_channel_map.insert(user_id, channel_id);

        let Some(binding) = self.voice_monitor_binding(channel_id).await else {
            return;
        };

        match self.live_attendance_event(&binding).await {
            Some(event_id) => self.attendance.handle_join(event_id, user_id, hint.display_name.clone()),
            None => {
                self.adhoc
                    .handle_join(notify_channel_of(&binding, channel_id), &binding, user_id, hint)
                    .await;
            },
        }
    }

    /// Fires after the debounce settles on a leave, mirroring
    /// `handle_channel_join`'s routing.
    async fn handle_channel_leave(self: &Arc<Self>, channel_id: DiscordId, user_id: DiscordId) {
        self.user_channel_map.remove(&user_id);

        let Some(binding) = self.voice_monitor_binding(channel_id).await else {
            return;
        };

        match self.live_attendance_event(&binding).await {
            Some(event_id) => self.attendance.handle_leave(event_id, user_id),
            None => self.adhoc.handle_leave(notify_channel_of(&binding, channel_id), &binding, user_id).await,
        }
    }

    /// A non-debounced `presenceUpdate`: does not drive leave/join, only
    /// game-switch migration, and only when the user's resolved channel is
    /// bound as a general lobby.
    pub async fn handle_presence_update(self: &Arc<Self>, user_id: DiscordId, hint: &MemberHint) {
        let Some(channel_id) = self.user_channel_map.get(&user_id).map(|v| *v) else {
            return;
        };

        let Some(binding) = self.voice_monitor_binding(channel_id).await else {
            return;
        };

        if !binding.is_general_lobby() {
            return;
        }

        self.adhoc
            .handle_presence_change(notify_channel_of(&binding, channel_id), &binding, user_id, hint)
            .await;
    }

    async fn voice_monitor_binding(&self, channel_id: DiscordId) -> Option<ChannelBinding> {
        let binding = self
            .binding_cache
            .lookup(self.guild_id, channel_id, &[BindingPurpose::VoiceMonitor])
            .await?;
        (binding.purpose == BindingPurpose::VoiceMonitor).then_some(binding)
    }

    /// If a scheduled (non-ad-hoc) event currently owns this binding's
    /// channel — its gameId matches the binding's and `now` falls in its
    /// window — return that event's id so the caller routes to the
    /// attendance engine instead of the ad-hoc engine.
    async fn live_attendance_event(&self, binding: &ChannelBinding) -> Option<crate::model::EventId> {
        let now = self.clock.now();
        let live = self.scheduled_events.live_at(self.guild_id, now).await.ok()?;
        live.into_iter()
            .find(|e| e.is_live(now) && e.game_id == binding.game_id)
            .map(|e| e.id)
    }

    /// Startup recovery: enumerate occupied voice channels and synthesize
    /// a join per occupant so in-memory state reconciles with live reality
    /// after a restart or reconnect. Attendance's own persisted-duration
    /// recovery is handled separately by `AttendanceEngine::recover`,
    /// invoked first so attendance-bound
    /// channels restore their accumulated totals before any ad-hoc
    /// fallback would see them.
    pub async fn reconnect(self: &Arc<Self>, presence: Arc<dyn PresenceEventSource>) -> anyhow::Result<()> {
        self.attendance
            .recover(
                self.guild_id,
                Arc::clone(&self.binding_cache),
                Arc::clone(&self.scheduled_events),
                Arc::clone(&presence),
            )
            .await?;

        let occupied = presence.occupied_voice_channels(self.guild_id).await?;
        for (channel_id, members) in occupied {
            for (user_id, hint) in members {
                self.handle_channel_join(channel_id, user_id, &hint).await;
            }
        }

        Ok(())
    }

    /// Bot disconnect: cancel debounce timers, clear per-user channel
    /// tracking, and flush the binding cache. The in-memory
    /// session tables themselves are preserved so `reconnect` can diff
    /// against live reality.
    pub fn disconnect(&self) {
        self.schedulers.debounce.cancel_all();
        self.pending.clear();
        self.user_channel_map.clear();
        self.binding_cache.clear();
    }

    /// Consume one `GatewayEvent` from an abstract presence source,
    /// routing it to the appropriate handler. `PresenceEventSource`
    /// implementations drive their event loop by polling `next_event` and
    /// calling this.
    pub async fn handle_event(self: &Arc<Self>, event: GatewayEvent) {
        match event {
            GatewayEvent::VoiceStateUpdate {
                user_id,
                old_channel_id,
                new_channel_id,
                member_hint,
                ..
            } => self.handle_voice_state_update(user_id, old_channel_id, new_channel_id, member_hint),
            GatewayEvent::PresenceUpdate {
                user_id, member_hint, ..
            } => self.handle_presence_update(user_id, &member_hint).await,
            GatewayEvent::GuildMemberAdd { .. } => {
                // Awaiting-assignment slots are a controller concern;
                // the core has nothing to do until that member joins voice.
            },
        }
    }
}

fn notify_channel_of(binding: &ChannelBinding, fallback_channel_id: DiscordId) -> DiscordId {
    binding.config.notification_channel_id.unwrap_or(fallback_channel_id)
}
