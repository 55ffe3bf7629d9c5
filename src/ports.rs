//! External interfaces as Rust traits. Each trait is one aggregate so a
//! unit test can implement only the slice it needs; `persistence::memory`
//! implements all of them over plain `DashMap`s, `persistence::postgres`
//! implements all of them over one `sqlx::PgPool`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::model::{
    AdHocParticipantRecord, AttendanceClassification, AvailabilityStatus, AvailabilityWindow,
    BindingConfig, BindingId, BindingPurpose, ChannelBinding, ChannelKind, DiscordId, EventId,
    InMemorySession, PartialBindingConfig, ScheduledEvent, SeriesId,
};

/// The presence stream, flowing in.
#[derive(Debug, Clone)]
pub enum GatewayEvent {
    VoiceStateUpdate {
        user_id: DiscordId,
        old_channel_id: Option<DiscordId>,
        new_channel_id: Option<DiscordId>,
        member_hint: crate::model::MemberHint,
        timestamp: DateTime<Utc>,
    },
    PresenceUpdate {
        user_id: DiscordId,
        activities: Vec<crate::model::Activity>,
        member_hint: crate::model::MemberHint,
        timestamp: DateTime<Utc>,
    },
    GuildMemberAdd {
        user_id: DiscordId,
        username: String,
        avatar_hash: Option<String>,
    },
}

/// An abstract, restartable sequence of presence events. A real adapter
/// (gateway reconnect, OAuth, embed rendering) is a caller's concern; the
/// core only consumes whatever implements this.
#[async_trait]
pub trait PresenceEventSource: Send + Sync {
    async fn next_event(&self) -> Option<GatewayEvent>;

    /// All voice channels currently occupied, per channel. Used by gateway
    /// startup recovery and attendance startup recovery.
    async fn occupied_voice_channels(
        &self,
        guild_id: DiscordId,
    ) -> anyhow::Result<Vec<(DiscordId, Vec<(DiscordId, crate::model::MemberHint)>)>>;
}

/// The notification interface, flowing out.
#[async_trait]
pub trait NotificationSender: Send + Sync {
    /// `sendOrEdit(channelId, messageId?, payload) -> messageId`. Idempotent:
    /// resending an edit with an identical payload is acceptable.
    async fn send_or_edit(
        &self,
        channel_id: DiscordId,
        message_id: Option<String>,
        payload: NotificationPayload,
    ) -> anyhow::Result<String>;
}

/// Structured payload for a rendering collaborator — the core does not
/// render human-readable notification bodies itself.
#[derive(Debug, Clone)]
pub enum NotificationPayload {
    Spawned {
        event_id: EventId,
        game_name: String,
        member_names: Vec<String>,
    },
    Updated {
        event_id: EventId,
        game_name: String,
        member_names: Vec<String>,
    },
    Completed {
        event_id: EventId,
        game_name: String,
        durations: Vec<(String, i64)>,
    },
}

/// Channel-binding persistence.
#[async_trait]
pub trait BindingStore: Send + Sync {
    async fn find(
        &self,
        guild_id: DiscordId,
        channel_id: DiscordId,
        purposes: &[BindingPurpose],
    ) -> anyhow::Result<Option<ChannelBinding>>;

    async fn get(&self, binding_id: BindingId) -> anyhow::Result<Option<ChannelBinding>>;

    async fn list(&self, guild_id: DiscordId) -> anyhow::Result<Vec<ChannelBinding>>;

    /// Upsert on the natural key `(guildId, channelId, seriesId)`. Returns
    /// the resulting binding plus the ids of any bindings it replaced (for
    /// series moves).
    #[allow(clippy::too_many_arguments)]
    async fn bind(
        &self,
        guild_id: DiscordId,
        channel_id: DiscordId,
        channel_kind: ChannelKind,
        purpose: BindingPurpose,
        game_id: Option<i64>,
        config: Option<BindingConfig>,
        series_id: Option<SeriesId>,
    ) -> anyhow::Result<(ChannelBinding, Vec<BindingId>)>;

    /// Returns `false` if nothing matched.
    async fn unbind(
        &self,
        guild_id: DiscordId,
        channel_id: DiscordId,
        series_id: Option<SeriesId>,
    ) -> anyhow::Result<bool>;

    async fn update_config(
        &self,
        binding_id: BindingId,
        partial: PartialBindingConfig,
        purpose: Option<BindingPurpose>,
    ) -> anyhow::Result<Option<ChannelBinding>>;
}

/// Manual-override and admin mapping table, plus registry lookups for the
/// game-name resolver.
#[async_trait]
pub trait GameRegistryStore: Send + Sync {
    /// Step 2: admin-managed activity-name -> game mapping, exact match.
    async fn mapped_game(&self, activity_name: &str) -> anyhow::Result<Option<(i64, String)>>;

    /// Step 3: exact match on game name.
    async fn exact_match(&self, name: &str) -> anyhow::Result<Option<(i64, String)>>;

    /// Step 4: case-insensitive match.
    async fn case_insensitive_match(&self, name: &str) -> anyhow::Result<Option<(i64, String)>>;

    /// Step 5: trigram similarity >= threshold, ordered by similarity DESC.
    /// Returns `Ok(None)` both when there is no match and when the
    /// underlying index is unavailable (`supports_trigram` distinguishes
    /// the two for logging purposes only).
    async fn trigram_match(
        &self,
        name: &str,
        threshold: f64,
    ) -> anyhow::Result<Option<(i64, String)>>;

    /// Checked once at startup: whether this step can run at all.
    fn supports_trigram(&self) -> bool;

    /// Set a 30-minute manual override for a user.
    async fn set_playing_override(&self, user_id: DiscordId, game_name: String)
        -> anyhow::Result<()>;

    /// Fetch a still-live manual override, if any.
    async fn playing_override(&self, user_id: DiscordId) -> anyhow::Result<Option<String>>;
}

/// Session persistence — shared by the ad-hoc engine and the
/// voice-attendance engine (one physical "persisted session row" shape).
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// `ON CONFLICT (eventId, discordUserId) DO UPDATE`.
    async fn upsert(&self, record: AdHocParticipantRecord) -> anyhow::Result<()>;

    async fn get(
        &self,
        event_id: EventId,
        discord_user_id: DiscordId,
    ) -> anyhow::Result<Option<AdHocParticipantRecord>>;

    async fn list_for_event(&self, event_id: EventId) -> anyhow::Result<Vec<AdHocParticipantRecord>>;

    async fn set_classification(
        &self,
        event_id: EventId,
        discord_user_id: DiscordId,
        classification: AttendanceClassification,
    ) -> anyhow::Result<()>;

    /// Mark an ad-hoc event row as completed with the given end time.
    async fn complete_event(&self, event_id: EventId, end_time: DateTime<Utc>) -> anyhow::Result<()>;
}

/// Scheduled-event persistence (read-only from the core's view, plus the
/// signup auto-population write used by the classification loop).
#[async_trait]
pub trait ScheduledEventStore: Send + Sync {
    /// Events whose `endTime` falls in `[since, until]` and are not
    /// cancelled ad-hoc rows — classification loop candidates.
    async fn ended_between(
        &self,
        since: DateTime<Utc>,
        until: DateTime<Utc>,
    ) -> anyhow::Result<Vec<ScheduledEvent>>;

    /// Events currently live (`now` within `[startTime, endTime]`) bound to
    /// a voice-monitor channel, for startup recovery.
    async fn live_at(&self, guild_id: DiscordId, at: DateTime<Utc>) -> anyhow::Result<Vec<ScheduledEvent>>;

    async fn get(&self, event_id: EventId) -> anyhow::Result<Option<ScheduledEvent>>;

    /// Create a brand-new ad-hoc event row, returning its assigned id.
    async fn create_ad_hoc(
        &self,
        title: String,
        game_id: Option<i64>,
        start_time: DateTime<Utc>,
    ) -> anyhow::Result<EventId>;
}

/// Signup auto-population, driven by the classification loop.
#[async_trait]
pub trait SignupStore: Send + Sync {
    /// Signups for `event_id` with a linked Discord user id but with
    /// `attendanceStatus` still null.
    async fn signups_missing_status(
        &self,
        event_id: EventId,
    ) -> anyhow::Result<Vec<(DiscordId, Option<AttendanceClassification>)>>;

    /// All signed-up Discord user ids for the event, regardless of status.
    async fn signed_up_user_ids(&self, event_id: EventId) -> anyhow::Result<Vec<DiscordId>>;

    /// Update a signup's `attendanceStatus` only if it is currently null —
    /// preserves manual overrides already set by staff.
    async fn set_status_if_null(
        &self,
        event_id: EventId,
        discord_user_id: DiscordId,
        classification: AttendanceClassification,
    ) -> anyhow::Result<()>;
}

/// The availability interface, flowing out.
#[async_trait]
pub trait AvailabilityStore: Send + Sync {
    async fn check_conflicts(
        &self,
        user_id: DiscordId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        exclude_game_id: Option<i64>,
        exclude_id: Option<uuid::Uuid>,
    ) -> anyhow::Result<Vec<AvailabilityWindow>>;

    async fn windows_for_users_in_range(
        &self,
        user_ids: &[DiscordId],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> anyhow::Result<std::collections::HashMap<DiscordId, Vec<AvailabilityWindow>>>;

    async fn insert_window(
        &self,
        user_id: DiscordId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        status: AvailabilityStatus,
        game_id: Option<i64>,
        source_event_id: Option<EventId>,
    ) -> anyhow::Result<AvailabilityWindow>;
}

/// Snapshot of an in-progress session, shared by the live-roster read model
/// and the notification batcher.
#[derive(Debug, Clone)]
pub struct SessionSnapshot {
    pub discord_user_id: DiscordId,
    pub display_name: String,
    pub joined_at: DateTime<Utc>,
    pub left_at: Option<DateTime<Utc>>,
    pub total_duration_sec: i64,
    pub session_count: usize,
}

impl SessionSnapshot {
    pub fn from_session(session: &InMemorySession, now: DateTime<Utc>) -> Self {
        Self {
            discord_user_id: session.discord_user_id,
            display_name: session.display_name.clone(),
            joined_at: session.first_join_at,
            left_at: if session.is_active {
                None
            } else {
                session.last_leave_at
            },
            total_duration_sec: session.snapshot_total_duration(now),
            session_count: session.segments.len(),
        }
    }
}
