//! Core data model. All entities here are conceptual value types; the
//! engine's runtime state (binding cache, session tables, ad-hoc state map)
//! lives in their respective modules and is built out of these types.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A Discord-shaped snowflake id. The core never talks to Discord directly,
/// so this is a bare newtype rather than a gateway library's own id type —
/// it crosses the trait boundary in [`crate::ports`] as plain data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DiscordId(pub u64);

impl fmt::Display for DiscordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for DiscordId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for DiscordId {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse::<u64>().map(DiscordId).map_err(serde::de::Error::custom)
    }
}

macro_rules! uuid_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

uuid_id!(BindingId);
uuid_id!(EventId);
uuid_id!(SeriesId);

/// Discord channel kind a binding is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Text,
    Voice,
}

/// What a channel binding is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindingPurpose {
    Announcements,
    VoiceMonitor,
    GeneralLobby,
}

/// A closed schema, not a free-form map. Keys outside this set simply
/// don't exist.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BindingConfig {
    #[serde(default = "BindingConfig::default_min_players")]
    pub min_players: u32,
    #[serde(default = "BindingConfig::default_grace_period_sec")]
    pub grace_period_sec: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notification_channel_id: Option<DiscordId>,
    #[serde(default)]
    pub allow_just_chatting: bool,
}

impl BindingConfig {
    const fn default_min_players() -> u32 {
        2
    }

    const fn default_grace_period_sec() -> u64 {
        180
    }

    /// Merge `partial` over `self`, keeping anything `partial` leaves unset.
    /// Used by `Engine::update_config`; `partial` is itself built from a
    /// JSON merge-patch by the caller, so there is nothing left ambiguous
    /// here.
    pub fn merged_with(mut self, partial: PartialBindingConfig) -> Self {
        if let Some(v) = partial.min_players {
            self.min_players = v;
        }
        if let Some(v) = partial.grace_period_sec {
            self.grace_period_sec = v;
        }
        if let Some(v) = partial.notification_channel_id {
            self.notification_channel_id = v;
        }
        if let Some(v) = partial.allow_just_chatting {
            self.allow_just_chatting = v;
        }
        self
    }
}

impl Default for BindingConfig {
    fn default() -> Self {
        Self {
            min_players: Self::default_min_players(),
            grace_period_sec: Self::default_grace_period_sec(),
            notification_channel_id: None,
            allow_just_chatting: false,
        }
    }
}

/// A merge-patch over [`BindingConfig`]; every field is optional so
/// `updateConfig(bindingId, partialConfig, ..)` only touches what the caller
/// names.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PartialBindingConfig {
    pub min_players: Option<u32>,
    pub grace_period_sec: Option<u64>,
    pub notification_channel_id: Option<Option<DiscordId>>,
    pub allow_just_chatting: Option<bool>,
}

/// A channel bound to a purpose, game, and config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelBinding {
    pub id: BindingId,
    pub guild_id: DiscordId,
    pub channel_id: DiscordId,
    pub channel_kind: ChannelKind,
    pub purpose: BindingPurpose,
    pub game_id: Option<i64>,
    pub series_id: Option<SeriesId>,
    pub config: BindingConfig,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ChannelBinding {
    /// A voice-monitor binding with no game id: the engine infers the game
    /// from member presence instead of a fixed binding-level game.
    pub fn is_general_lobby(&self) -> bool {
        self.purpose == BindingPurpose::VoiceMonitor && self.game_id.is_none()
    }

    /// A voice-monitor binding scoped to one game.
    pub fn is_game_specific(&self) -> bool {
        self.purpose == BindingPurpose::VoiceMonitor && self.game_id.is_some()
    }
}

/// A member's display name, avatar, and current activities, as carried by
/// a presence update.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberHint {
    pub display_name: String,
    pub avatar_hash: Option<String>,
    pub activities: Vec<Activity>,
}

/// One `(activityKind, activityName)` pair. Only `Playing` drives game
/// detection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Activity {
    pub kind: ActivityKind,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActivityKind {
    Playing,
    Listening,
    Watching,
    Streaming,
    Custom,
    Competing,
}

impl MemberHint {
    /// The first `Playing` activity's name, if any — the raw input to the
    /// game-name resolver.
    pub fn playing_activity(&self) -> Option<&str> {
        self.activities
            .iter()
            .find(|a| a.kind == ActivityKind::Playing)
            .map(|a| a.name.as_str())
    }
}

/// A normalized voice-channel move plus the member's presence at that
/// moment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceEvent {
    pub user_id: DiscordId,
    pub old_channel_id: Option<DiscordId>,
    pub new_channel_id: Option<DiscordId>,
    pub timestamp: DateTime<Utc>,
    pub member_hint: MemberHint,
}

/// A `[joinAt, leaveAt]` interval of continuous presence.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Segment {
    pub join_at: DateTime<Utc>,
    pub leave_at: Option<DateTime<Utc>>,
    pub duration_sec: i64,
}

impl Segment {
    fn open(at: DateTime<Utc>) -> Self {
        Self {
            join_at: at,
            leave_at: None,
            duration_sec: 0,
        }
    }

    pub fn is_open(&self) -> bool {
        self.leave_at.is_none()
    }
}

/// Shared shape for ad-hoc participants and scheduled-event voice-attendance
/// participants, keyed by `(eventId, discordUserId)` in both cases.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InMemorySession {
    pub event_id: EventId,
    pub internal_user_id: Option<Uuid>,
    pub discord_user_id: DiscordId,
    pub display_name: String,
    pub first_join_at: DateTime<Utc>,
    pub last_leave_at: Option<DateTime<Utc>>,
    pub total_duration_sec: i64,
    pub segments: Vec<Segment>,
    pub is_active: bool,
    pub active_segment_start: Option<DateTime<Utc>>,
    pub dirty: bool,
}

impl InMemorySession {
    /// Start a brand new session with one open segment (a first join).
    pub fn new(
        event_id: EventId,
        discord_user_id: DiscordId,
        display_name: String,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id,
            internal_user_id: None,
            discord_user_id,
            display_name,
            first_join_at: now,
            last_leave_at: None,
            total_duration_sec: 0,
            segments: vec![Segment::open(now)],
            is_active: true,
            active_segment_start: Some(now),
            dirty: true,
        }
    }

    /// `isActive ⇔ activeSegmentStart ≠ null ⇔ last segment.leaveAt = null`.
    pub fn invariant_holds(&self) -> bool {
        let last_open = self.segments.last().is_some_and(Segment::is_open);
        self.is_active == self.active_segment_start.is_some() && self.is_active == last_open
    }

    /// Invariant (b): `totalDurationSec` equals the sum of closed segments.
    pub fn closed_segments_sum(&self) -> i64 {
        self.segments
            .iter()
            .filter(|s| !s.is_open())
            .map(|s| s.duration_sec)
            .sum()
    }

    /// Re-open the session: used by both the ad-hoc join path and the
    /// attendance join path when the participant rejoins after leaving.
    pub fn reopen(&mut self, now: DateTime<Utc>) {
        if self.is_active {
            return; // idempotent: join(u);join(u) == join(u)
        }
        self.segments.push(Segment::open(now));
        self.is_active = true;
        self.active_segment_start = Some(now);
        self.dirty = true;
    }

    /// Close the currently-open segment, folding its elapsed time into
    /// `total_duration_sec`. No-op if already inactive (leave(u);leave(u) ==
    /// leave(u)).
    pub fn close(&mut self, now: DateTime<Utc>) {
        if !self.is_active {
            return;
        }
        let Some(start) = self.active_segment_start else {
            return;
        };
        let elapsed = (now - start).num_seconds().max(0);

        if let Some(last) = self.segments.last_mut() {
            last.leave_at = Some(now);
            last.duration_sec = elapsed;
        }

        self.total_duration_sec += elapsed;
        self.last_leave_at = Some(now);
        self.is_active = false;
        self.active_segment_start = None;
        self.dirty = true;
    }

    /// Invariant (c): elapsed time of an open segment is not folded into
    /// `total_duration_sec` until close/flush. This is what a flush
    /// snapshot and the live-roster read model both compute without
    /// mutating the session.
    pub fn snapshot_total_duration(&self, now: DateTime<Utc>) -> i64 {
        match self.active_segment_start {
            Some(start) => self.total_duration_sec + (now - start).num_seconds().max(0),
            None => self.total_duration_sec,
        }
    }

    /// The current open segment's elapsed duration, as it would be recorded
    /// by a flush snapshot — `None` if the session is not active.
    pub fn open_segment_elapsed(&self, now: DateTime<Utc>) -> Option<i64> {
        self.active_segment_start
            .map(|start| (now - start).num_seconds().max(0))
    }
}

/// In-memory lobby state for one `(bindingId, gameId?)` tuple.
#[derive(Debug, Clone)]
pub struct AdHocSessionState {
    pub event_id: EventId,
    pub binding_id: BindingId,
    pub game_id: Option<i64>,
    pub game_name: String,
    pub member_set: std::collections::BTreeSet<DiscordId>,
    pub spawned_at: DateTime<Utc>,
    /// Bumped whenever a grace timer is cancelled by a rescuing join
    /// (§4.5 "grace-period rescue"); tracks how recently the session was
    /// saved from dissolving, separate from `spawned_at`.
    pub last_extended_at: DateTime<Utc>,
    pub grace_armed: bool,
}

impl AdHocSessionState {
    pub fn new(
        event_id: EventId,
        binding_id: BindingId,
        game_id: Option<i64>,
        game_name: String,
        members: impl IntoIterator<Item = DiscordId>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            event_id,
            binding_id,
            game_id,
            game_name,
            member_set: members.into_iter().collect(),
            spawned_at: now,
            last_extended_at: now,
            grace_armed: false,
        }
    }
}

/// Persisted mirror of an `InMemorySession` plus classification, keyed by
/// `(eventId, discordUserId)`; both the ad-hoc engine and the
/// voice-attendance engine flush into rows of this exact shape, so
/// [`crate::ports::SessionStore`] operates on it for both subsystems.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdHocParticipantRecord {
    pub id: Uuid,
    pub event_id: EventId,
    pub user_id: Option<Uuid>,
    pub discord_user_id: DiscordId,
    pub discord_username: String,
    pub first_join_at: DateTime<Utc>,
    pub last_leave_at: Option<DateTime<Utc>>,
    pub total_duration_sec: i64,
    pub segments: Vec<Segment>,
    pub classification: Option<AttendanceClassification>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AdHocParticipantRecord {
    /// Build a persisted record from the hot in-memory session, as-is
    /// (`flush`) — use [`InMemorySession::snapshot_total_duration`] first if
    /// you need the open-segment-inclusive variant.
    pub fn from_session(session: &InMemorySession, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_id: session.event_id,
            user_id: session.internal_user_id,
            discord_user_id: session.discord_user_id,
            discord_username: session.display_name.clone(),
            first_join_at: session.first_join_at,
            last_leave_at: session.last_leave_at,
            total_duration_sec: session.total_duration_sec,
            segments: session.segments.clone(),
            classification: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A scheduled event, read-only from the core's view.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduledEvent {
    pub id: EventId,
    pub title: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub game_id: Option<i64>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub series_id: Option<SeriesId>,
    pub is_ad_hoc: bool,
}

impl ScheduledEvent {
    pub fn duration_sec(&self) -> i64 {
        (self.end_time - self.start_time).num_seconds().max(0)
    }

    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start_time <= at && at <= self.end_time
    }

    pub fn is_live(&self, at: DateTime<Utc>) -> bool {
        self.cancelled_at.is_none() && !self.is_ad_hoc && self.contains(at)
    }
}

/// How a participant's attendance at a scheduled event is classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttendanceClassification {
    Full,
    Partial,
    Late,
    EarlyLeaver,
    NoShow,
}

/// Status of an availability window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AvailabilityStatus {
    Available,
    Committed,
    Blocked,
    Freed,
}

/// A user's self-reported availability for a time range.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AvailabilityWindow {
    pub id: Uuid,
    pub user_id: DiscordId,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub status: AvailabilityStatus,
    pub game_id: Option<i64>,
    pub source_event_id: Option<EventId>,
}

impl AvailabilityWindow {
    /// Invariant: `end > start ∧ end - start ≤ 24h`.
    pub fn is_valid(&self) -> bool {
        self.end > self.start && (self.end - self.start) <= chrono::Duration::hours(24)
    }

    pub fn overlaps(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> bool {
        self.start < end && start < self.end
    }

    /// A window constitutes a conflict candidate only if committed/blocked
    /// — `available`/`freed` windows never conflict.
    pub fn is_conflict_candidate(&self) -> bool {
        matches!(
            self.status,
            AvailabilityStatus::Committed | AvailabilityStatus::Blocked
        )
    }
}
