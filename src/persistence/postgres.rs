//! Postgres-backed implementation of every `src/ports.rs` trait, gated
//! behind the `postgres` feature.
//!
//! Grounded on `ethereum-kzg-ceremony-sequencer`'s `storage.rs`: one
//! `Pool` wrapped in a struct, a `thiserror` error enum wrapping
//! `sqlx::error::Error`, and runtime `sqlx::query(sql).bind(...)` calls
//! rather than the compile-time-checked `query!`/`query_as!` macros (those
//! need a live `DATABASE_URL` to even build). Row decoding is done by hand
//! with `Row::try_get` for the same reason.
//!
//! Assumed schema (see migrations in a real deployment):
//! `channel_bindings(id uuid pk, guild_id bigint, channel_id bigint,
//! channel_kind text, purpose text, game_id bigint null, series_id uuid
//! null, config jsonb, created_at timestamptz, updated_at timestamptz,
//! unique(guild_id, channel_id))`, `games(id bigint pk, name text)`,
//! `game_overrides(activity_name text pk, game_id bigint, game_name
//! text)`, `playing_overrides(user_id bigint pk, game_name text,
//! expires_at timestamptz)`, `sessions(id uuid pk, event_id uuid,
//! discord_user_id bigint, user_id uuid null, discord_username text,
//! first_join_at timestamptz, last_leave_at timestamptz null,
//! total_duration_sec bigint, segments jsonb, classification text null,
//! created_at timestamptz, updated_at timestamptz, unique(event_id,
//! discord_user_id))`, `scheduled_events(id uuid pk, title text,
//! start_time timestamptz, end_time timestamptz, game_id bigint null,
//! cancelled_at timestamptz null, series_id uuid null, is_ad_hoc bool)`,
//! `signups(event_id uuid, discord_user_id bigint, attendance_status text
//! null, primary key(event_id, discord_user_id))`, `availability_windows(id
//! uuid pk, user_id bigint, start_time timestamptz, end_time timestamptz,
//! status text, game_id bigint null, source_event_id uuid null)`.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use thiserror::Error;
use uuid::Uuid;

use crate::model::{
    AdHocParticipantRecord, AttendanceClassification, AvailabilityStatus, AvailabilityWindow,
    BindingConfig, BindingId, BindingPurpose, ChannelBinding, ChannelKind, DiscordId, EventId,
    PartialBindingConfig, ScheduledEvent, Segment, SeriesId,
};
use crate::ports::{
    AvailabilityStore, BindingStore, GameRegistryStore, ScheduledEventStore, SessionStore, SignupStore,
};

#[derive(Debug, Error)]
pub enum PostgresError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("malformed stored json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unrecognized enum value in storage: {0}")]
    BadEnumValue(String),
}

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub async fn connect(database_url: &str, max_connections: u32) -> anyhow::Result<Arc<Self>> {
        let pool = PgPoolOptions::new().max_connections(max_connections).connect(database_url).await?;
        Ok(Arc::new(Self { pool }))
    }

    pub fn from_pool(pool: PgPool) -> Arc<Self> {
        Arc::new(Self { pool })
    }
}

fn channel_kind_str(kind: ChannelKind) -> &'static str {
    match kind {
        ChannelKind::Text => "text",
        ChannelKind::Voice => "voice",
    }
}

fn parse_channel_kind(s: &str) -> Result<ChannelKind, PostgresError> {
    match s {
        "text" => Ok(ChannelKind::Text),
        "voice" => Ok(ChannelKind::Voice),
        other => Err(PostgresError::BadEnumValue(other.to_string())),
    }
}

fn purpose_str(purpose: BindingPurpose) -> &'static str {
    match purpose {
        BindingPurpose::Announcements => "announcements",
        BindingPurpose::VoiceMonitor => "voice_monitor",
        BindingPurpose::GeneralLobby => "general_lobby",
    }
}

fn parse_purpose(s: &str) -> Result<BindingPurpose, PostgresError> {
    match s {
        "announcements" => Ok(BindingPurpose::Announcements),
        "voice_monitor" => Ok(BindingPurpose::VoiceMonitor),
        "general_lobby" => Ok(BindingPurpose::GeneralLobby),
        other => Err(PostgresError::BadEnumValue(other.to_string())),
    }
}

fn classification_str(c: AttendanceClassification) -> &'static str {
    match c {
        AttendanceClassification::Full => "full",
        AttendanceClassification::Partial => "partial",
        AttendanceClassification::Late => "late",
        AttendanceClassification::EarlyLeaver => "early_leaver",
        AttendanceClassification::NoShow => "no_show",
    }
}

fn parse_classification(s: &str) -> Result<AttendanceClassification, PostgresError> {
    match s {
        "full" => Ok(AttendanceClassification::Full),
        "partial" => Ok(AttendanceClassification::Partial),
        "late" => Ok(AttendanceClassification::Late),
        "early_leaver" => Ok(AttendanceClassification::EarlyLeaver),
        "no_show" => Ok(AttendanceClassification::NoShow),
        other => Err(PostgresError::BadEnumValue(other.to_string())),
    }
}

fn availability_status_str(s: AvailabilityStatus) -> &'static str {
    match s {
        AvailabilityStatus::Available => "available",
        AvailabilityStatus::Committed => "committed",
        AvailabilityStatus::Blocked => "blocked",
        AvailabilityStatus::Freed => "freed",
    }
}

fn parse_availability_status(s: &str) -> Result<AvailabilityStatus, PostgresError> {
    match s {
        "available" => Ok(AvailabilityStatus::Available),
        "committed" => Ok(AvailabilityStatus::Committed),
        "blocked" => Ok(AvailabilityStatus::Blocked),
        "freed" => Ok(AvailabilityStatus::Freed),
        other => Err(PostgresError::BadEnumValue(other.to_string())),
    }
}

fn row_to_binding(row: &PgRow) -> Result<ChannelBinding, PostgresError> {
    let config: serde_json::Value = row.try_get("config")?;
    Ok(ChannelBinding {
        id: BindingId(row.try_get("id")?),
        guild_id: DiscordId(row.try_get::<i64, _>("guild_id")? as u64),
        channel_id: DiscordId(row.try_get::<i64, _>("channel_id")? as u64),
        channel_kind: parse_channel_kind(row.try_get::<&str, _>("channel_kind")?)?,
        purpose: parse_purpose(row.try_get::<&str, _>("purpose")?)?,
        game_id: row.try_get("game_id")?,
        series_id: row.try_get::<Option<Uuid>, _>("series_id")?.map(SeriesId),
        config: serde_json::from_value(config)?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_session(row: &PgRow) -> Result<AdHocParticipantRecord, PostgresError> {
    let segments: serde_json::Value = row.try_get("segments")?;
    let classification: Option<String> = row.try_get("classification")?;
    Ok(AdHocParticipantRecord {
        id: row.try_get("id")?,
        event_id: EventId(row.try_get("event_id")?),
        user_id: row.try_get("user_id")?,
        discord_user_id: DiscordId(row.try_get::<i64, _>("discord_user_id")? as u64),
        discord_username: row.try_get("discord_username")?,
        first_join_at: row.try_get("first_join_at")?,
        last_leave_at: row.try_get("last_leave_at")?,
        total_duration_sec: row.try_get("total_duration_sec")?,
        segments: serde_json::from_value::<Vec<Segment>>(segments)?,
        classification: classification.map(|c| parse_classification(&c)).transpose()?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn row_to_event(row: &PgRow) -> Result<ScheduledEvent, PostgresError> {
    Ok(ScheduledEvent {
        id: EventId(row.try_get("id")?),
        title: row.try_get("title")?,
        start_time: row.try_get("start_time")?,
        end_time: row.try_get("end_time")?,
        game_id: row.try_get("game_id")?,
        cancelled_at: row.try_get("cancelled_at")?,
        series_id: row.try_get::<Option<Uuid>, _>("series_id")?.map(SeriesId),
        is_ad_hoc: row.try_get("is_ad_hoc")?,
    })
}

fn row_to_window(row: &PgRow) -> Result<AvailabilityWindow, PostgresError> {
    let status: String = row.try_get("status")?;
    Ok(AvailabilityWindow {
        id: row.try_get("id")?,
        user_id: DiscordId(row.try_get::<i64, _>("user_id")? as u64),
        start: row.try_get("start_time")?,
        end: row.try_get("end_time")?,
        status: parse_availability_status(&status)?,
        game_id: row.try_get("game_id")?,
        source_event_id: row.try_get::<Option<Uuid>, _>("source_event_id")?.map(EventId),
    })
}

#[async_trait]
impl BindingStore for PostgresStore {
    async fn find(
        &self,
        guild_id: DiscordId,
        channel_id: DiscordId,
        purposes: &[BindingPurpose],
    ) -> anyhow::Result<Option<ChannelBinding>> {
        let purpose_strs: Vec<&'static str> = purposes.iter().copied().map(purpose_str).collect();
        let sql = "SELECT * FROM channel_bindings WHERE guild_id = $1 AND channel_id = $2 AND purpose = ANY($3)";
        let row = sqlx::query(sql)
            .bind(guild_id.0 as i64)
            .bind(channel_id.0 as i64)
            .bind(&purpose_strs)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.as_ref().map(row_to_binding).transpose().map_err(anyhow::Error::from)?)
    }

    async fn get(&self, binding_id: BindingId) -> anyhow::Result<Option<ChannelBinding>> {
        let sql = "SELECT * FROM channel_bindings WHERE id = $1";
        let row = sqlx::query(sql).bind(binding_id.0).fetch_optional(&self.pool).await?;
        Ok(row.as_ref().map(row_to_binding).transpose().map_err(anyhow::Error::from)?)
    }

    async fn list(&self, guild_id: DiscordId) -> anyhow::Result<Vec<ChannelBinding>> {
        let sql = "SELECT * FROM channel_bindings WHERE guild_id = $1 ORDER BY created_at";
        let rows = sqlx::query(sql).bind(guild_id.0 as i64).fetch_all(&self.pool).await?;
        Ok(rows.iter().map(row_to_binding).collect::<Result<_, _>>().map_err(anyhow::Error::from)?)
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
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();
        let config = config.unwrap_or_default();

        let mut replaced = Vec::new();

        if let Some(series) = series_id {
            let moved_sql = "SELECT id FROM channel_bindings WHERE guild_id = $1 AND series_id = $2 AND channel_id <> $3";
            let moved = sqlx::query(moved_sql)
                .bind(guild_id.0 as i64)
                .bind(series.0)
                .bind(channel_id.0 as i64)
                .fetch_all(&mut *tx)
                .await?;
            for row in &moved {
                replaced.push(BindingId(row.try_get("id")?));
            }
            if !replaced.is_empty() {
                sqlx::query("DELETE FROM channel_bindings WHERE guild_id = $1 AND series_id = $2 AND channel_id <> $3")
                    .bind(guild_id.0 as i64)
                    .bind(series.0)
                    .bind(channel_id.0 as i64)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        let existing_sql = "SELECT id FROM channel_bindings WHERE guild_id = $1 AND channel_id = $2";
        if let Some(row) = sqlx::query(existing_sql)
            .bind(guild_id.0 as i64)
            .bind(channel_id.0 as i64)
            .fetch_optional(&mut *tx)
            .await?
        {
            let id: Uuid = row.try_get("id")?;
            replaced.push(BindingId(id));
        }

        let upsert_sql = "
            INSERT INTO channel_bindings
                (id, guild_id, channel_id, channel_kind, purpose, game_id, series_id, config, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $9)
            ON CONFLICT (guild_id, channel_id) DO UPDATE SET
                channel_kind = EXCLUDED.channel_kind,
                purpose = EXCLUDED.purpose,
                game_id = EXCLUDED.game_id,
                series_id = EXCLUDED.series_id,
                config = EXCLUDED.config,
                updated_at = EXCLUDED.updated_at
            RETURNING *";

        let new_id = BindingId::new();
        let row = sqlx::query(upsert_sql)
            .bind(new_id.0)
            .bind(guild_id.0 as i64)
            .bind(channel_id.0 as i64)
            .bind(channel_kind_str(channel_kind))
            .bind(purpose_str(purpose))
            .bind(game_id)
            .bind(series_id.map(|s| s.0))
            .bind(serde_json::to_value(&config)?)
            .bind(now)
            .fetch_one(&mut *tx)
            .await?;

        let binding = row_to_binding(&row)?;
        replaced.retain(|id| *id != binding.id);
        tx.commit().await?;

        Ok((binding, replaced))
    }

    async fn unbind(&self, guild_id: DiscordId, channel_id: DiscordId, series_id: Option<SeriesId>) -> anyhow::Result<bool> {
        let result = if let Some(series) = series_id {
            sqlx::query("DELETE FROM channel_bindings WHERE guild_id = $1 AND channel_id = $2 AND series_id = $3")
                .bind(guild_id.0 as i64)
                .bind(channel_id.0 as i64)
                .bind(series.0)
                .execute(&self.pool)
                .await?
        } else {
            sqlx::query("DELETE FROM channel_bindings WHERE guild_id = $1 AND channel_id = $2")
                .bind(guild_id.0 as i64)
                .bind(channel_id.0 as i64)
                .execute(&self.pool)
                .await?
        };
        Ok(result.rows_affected() > 0)
    }

    async fn update_config(
        &self,
        binding_id: BindingId,
        partial: PartialBindingConfig,
        purpose: Option<BindingPurpose>,
    ) -> anyhow::Result<Option<ChannelBinding>> {
        let Some(current) = self.get(binding_id).await? else {
            return Ok(None);
        };

        let merged = current.config.merged_with(partial);
        let purpose = purpose.unwrap_or(current.purpose);

        let sql = "UPDATE channel_bindings SET config = $1, purpose = $2, updated_at = $3 WHERE id = $4 RETURNING *";
        let row = sqlx::query(sql)
            .bind(serde_json::to_value(&merged)?)
            .bind(purpose_str(purpose))
            .bind(Utc::now())
            .bind(binding_id.0)
            .fetch_one(&self.pool)
            .await?;

        Ok(Some(row_to_binding(&row)?))
    }
}

#[async_trait]
impl GameRegistryStore for PostgresStore {
    async fn mapped_game(&self, activity_name: &str) -> anyhow::Result<Option<(i64, String)>> {
        let sql = "SELECT game_id, game_name FROM game_overrides WHERE activity_name = $1";
        let row = sqlx::query(sql).bind(activity_name).fetch_optional(&self.pool).await?;
        Ok(row.map(|r| Ok::<_, PostgresError>((r.try_get("game_id")?, r.try_get("game_name")?))).transpose()?)
    }

    async fn exact_match(&self, name: &str) -> anyhow::Result<Option<(i64, String)>> {
        let sql = "SELECT id, name FROM games WHERE name = $1 LIMIT 1";
        let row = sqlx::query(sql).bind(name).fetch_optional(&self.pool).await?;
        Ok(row.map(|r| Ok::<_, PostgresError>((r.try_get("id")?, r.try_get("name")?))).transpose()?)
    }

    async fn case_insensitive_match(&self, name: &str) -> anyhow::Result<Option<(i64, String)>> {
        let sql = "SELECT id, name FROM games WHERE lower(name) = lower($1) LIMIT 1";
        let row = sqlx::query(sql).bind(name).fetch_optional(&self.pool).await?;
        Ok(row.map(|r| Ok::<_, PostgresError>((r.try_get("id")?, r.try_get("name")?))).transpose()?)
    }

    async fn trigram_match(&self, name: &str, threshold: f64) -> anyhow::Result<Option<(i64, String)>> {
        let sql = "
            SELECT id, name, similarity(name, $1) AS score
            FROM games
            WHERE similarity(name, $1) >= $2
            ORDER BY score DESC
            LIMIT 1";
        let row = sqlx::query(sql).bind(name).bind(threshold).fetch_optional(&self.pool).await?;
        Ok(row.map(|r| Ok::<_, PostgresError>((r.try_get("id")?, r.try_get("name")?))).transpose()?)
    }

    fn supports_trigram(&self) -> bool {
        true
    }

    async fn set_playing_override(&self, user_id: DiscordId, game_name: String) -> anyhow::Result<()> {
        let expires_at = Utc::now() + chrono::Duration::minutes(30);
        let sql = "
            INSERT INTO playing_overrides (user_id, game_name, expires_at)
            VALUES ($1, $2, $3)
            ON CONFLICT (user_id) DO UPDATE SET game_name = EXCLUDED.game_name, expires_at = EXCLUDED.expires_at";
        sqlx::query(sql).bind(user_id.0 as i64).bind(game_name).bind(expires_at).execute(&self.pool).await?;
        Ok(())
    }

    async fn playing_override(&self, user_id: DiscordId) -> anyhow::Result<Option<String>> {
        let sql = "SELECT game_name FROM playing_overrides WHERE user_id = $1 AND expires_at > $2";
        let row = sqlx::query(sql).bind(user_id.0 as i64).bind(Utc::now()).fetch_optional(&self.pool).await?;
        Ok(row.map(|r| r.try_get("game_name")).transpose()?)
    }
}

#[async_trait]
impl SessionStore for PostgresStore {
    async fn upsert(&self, record: AdHocParticipantRecord) -> anyhow::Result<()> {
        let sql = "
            INSERT INTO sessions
                (id, event_id, discord_user_id, user_id, discord_username, first_join_at,
                 last_leave_at, total_duration_sec, segments, classification, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $11)
            ON CONFLICT (event_id, discord_user_id) DO UPDATE SET
                discord_username = EXCLUDED.discord_username,
                last_leave_at = EXCLUDED.last_leave_at,
                total_duration_sec = EXCLUDED.total_duration_sec,
                segments = EXCLUDED.segments,
                classification = COALESCE(sessions.classification, EXCLUDED.classification),
                updated_at = EXCLUDED.updated_at";

        sqlx::query(sql)
            .bind(record.id)
            .bind(record.event_id.0)
            .bind(record.discord_user_id.0 as i64)
            .bind(record.user_id)
            .bind(record.discord_username)
            .bind(record.first_join_at)
            .bind(record.last_leave_at)
            .bind(record.total_duration_sec)
            .bind(serde_json::to_value(&record.segments)?)
            .bind(record.classification.map(classification_str))
            .bind(record.updated_at)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn get(&self, event_id: EventId, discord_user_id: DiscordId) -> anyhow::Result<Option<AdHocParticipantRecord>> {
        let sql = "SELECT * FROM sessions WHERE event_id = $1 AND discord_user_id = $2";
        let row = sqlx::query(sql).bind(event_id.0).bind(discord_user_id.0 as i64).fetch_optional(&self.pool).await?;
        Ok(row.as_ref().map(row_to_session).transpose().map_err(anyhow::Error::from)?)
    }

    async fn list_for_event(&self, event_id: EventId) -> anyhow::Result<Vec<AdHocParticipantRecord>> {
        let sql = "SELECT * FROM sessions WHERE event_id = $1";
        let rows = sqlx::query(sql).bind(event_id.0).fetch_all(&self.pool).await?;
        Ok(rows.iter().map(row_to_session).collect::<Result<_, _>>().map_err(anyhow::Error::from)?)
    }

    async fn set_classification(
        &self,
        event_id: EventId,
        discord_user_id: DiscordId,
        classification: AttendanceClassification,
    ) -> anyhow::Result<()> {
        let sql = "UPDATE sessions SET classification = $1, updated_at = $2 WHERE event_id = $3 AND discord_user_id = $4";
        sqlx::query(sql)
            .bind(classification_str(classification))
            .bind(Utc::now())
            .bind(event_id.0)
            .bind(discord_user_id.0 as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn complete_event(&self, event_id: EventId, end_time: DateTime<Utc>) -> anyhow::Result<()> {
        sqlx::query("UPDATE scheduled_events SET end_time = $1 WHERE id = $2")
            .bind(end_time)
            .bind(event_id.0)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl ScheduledEventStore for PostgresStore {
    async fn ended_between(&self, since: DateTime<Utc>, until: DateTime<Utc>) -> anyhow::Result<Vec<ScheduledEvent>> {
        let sql = "SELECT * FROM scheduled_events WHERE end_time BETWEEN $1 AND $2 AND cancelled_at IS NULL";
        let rows = sqlx::query(sql).bind(since).bind(until).fetch_all(&self.pool).await?;
        Ok(rows.iter().map(row_to_event).collect::<Result<_, _>>().map_err(anyhow::Error::from)?)
    }

    async fn live_at(&self, guild_id: DiscordId, at: DateTime<Utc>) -> anyhow::Result<Vec<ScheduledEvent>> {
        let sql = "
            SELECT DISTINCT se.*
            FROM scheduled_events se
            JOIN channel_bindings cb ON cb.game_id = se.game_id AND cb.purpose = 'voice_monitor'
            WHERE cb.guild_id = $1
              AND se.cancelled_at IS NULL
              AND se.is_ad_hoc = FALSE
              AND se.start_time <= $2
              AND se.end_time >= $2";
        let rows = sqlx::query(sql).bind(guild_id.0 as i64).bind(at).fetch_all(&self.pool).await?;
        Ok(rows.iter().map(row_to_event).collect::<Result<_, _>>().map_err(anyhow::Error::from)?)
    }

    async fn get(&self, event_id: EventId) -> anyhow::Result<Option<ScheduledEvent>> {
        let sql = "SELECT * FROM scheduled_events WHERE id = $1";
        let row = sqlx::query(sql).bind(event_id.0).fetch_optional(&self.pool).await?;
        Ok(row.as_ref().map(row_to_event).transpose().map_err(anyhow::Error::from)?)
    }

    async fn create_ad_hoc(&self, title: String, game_id: Option<i64>, start_time: DateTime<Utc>) -> anyhow::Result<EventId> {
        let id = EventId::new();
        let sql = "
            INSERT INTO scheduled_events (id, title, start_time, end_time, game_id, cancelled_at, series_id, is_ad_hoc)
            VALUES ($1, $2, $3, $3, $4, NULL, NULL, TRUE)";
        sqlx::query(sql).bind(id.0).bind(title).bind(start_time).bind(game_id).execute(&self.pool).await?;
        Ok(id)
    }
}

#[async_trait]
impl SignupStore for PostgresStore {
    async fn signups_missing_status(
        &self,
        event_id: EventId,
    ) -> anyhow::Result<Vec<(DiscordId, Option<AttendanceClassification>)>> {
        let sql = "SELECT discord_user_id, attendance_status FROM signups WHERE event_id = $1 AND attendance_status IS NULL";
        let rows = sqlx::query(sql).bind(event_id.0).fetch_all(&self.pool).await?;
        rows.iter()
            .map(|r| {
                let status: Option<String> = r.try_get("attendance_status")?;
                Ok::<_, PostgresError>((
                    DiscordId(r.try_get::<i64, _>("discord_user_id")? as u64),
                    status.map(|s| parse_classification(&s)).transpose()?,
                ))
            })
            .collect::<Result<_, _>>()
            .map_err(anyhow::Error::from)
    }

    async fn signed_up_user_ids(&self, event_id: EventId) -> anyhow::Result<Vec<DiscordId>> {
        let sql = "SELECT discord_user_id FROM signups WHERE event_id = $1";
        let rows = sqlx::query(sql).bind(event_id.0).fetch_all(&self.pool).await?;
        Ok(rows.iter().map(|r| Ok::<_, PostgresError>(DiscordId(r.try_get::<i64, _>("discord_user_id")? as u64))).collect::<Result<_, _>>().map_err(anyhow::Error::from)?)
    }

    async fn set_status_if_null(
        &self,
        event_id: EventId,
        discord_user_id: DiscordId,
        classification: AttendanceClassification,
    ) -> anyhow::Result<()> {
        let sql = "
            UPDATE signups SET attendance_status = $1
            WHERE event_id = $2 AND discord_user_id = $3 AND attendance_status IS NULL";
        sqlx::query(sql)
            .bind(classification_str(classification))
            .bind(event_id.0)
            .bind(discord_user_id.0 as i64)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl AvailabilityStore for PostgresStore {
    async fn check_conflicts(
        &self,
        user_id: DiscordId,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        exclude_game_id: Option<i64>,
        exclude_id: Option<Uuid>,
    ) -> anyhow::Result<Vec<AvailabilityWindow>> {
        // `game_id IS NOT NULL` must gate the equality check: without it, a
        // NULL-game row makes `game_id = $5` evaluate to NULL rather than
        // false, and `NOT (...)` drops the row entirely instead of keeping
        // it as a conflict.
        let sql = "
            SELECT * FROM availability_windows
            WHERE user_id = $1
              AND status IN ('committed', 'blocked')
              AND start_time < $3 AND $2 < end_time
              AND ($4::uuid IS NULL OR id <> $4)
              AND NOT (game_id IS NOT NULL AND $5::bigint IS NOT NULL AND game_id = $5)";
        let rows = sqlx::query(sql)
            .bind(user_id.0 as i64)
            .bind(start)
            .bind(end)
            .bind(exclude_id)
            .bind(exclude_game_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows.iter().map(row_to_window).collect::<Result<_, _>>().map_err(anyhow::Error::from)?)
    }

    async fn windows_for_users_in_range(
        &self,
        user_ids: &[DiscordId],
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> anyhow::Result<HashMap<DiscordId, Vec<AvailabilityWindow>>> {
        let ids: Vec<i64> = user_ids.iter().map(|id| id.0 as i64).collect();
        let sql = "
            SELECT * FROM availability_windows
            WHERE user_id = ANY($1) AND start_time < $3 AND $2 < end_time";
        let rows = sqlx::query(sql).bind(&ids).bind(start).bind(end).fetch_all(&self.pool).await?;

        let mut out: HashMap<DiscordId, Vec<AvailabilityWindow>> = HashMap::new();
        for row in &rows {
            let window = row_to_window(row)?;
            out.entry(window.user_id).or_default().push(window);
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

        let sql = "
            INSERT INTO availability_windows (id, user_id, start_time, end_time, status, game_id, source_event_id)
            VALUES ($1, $2, $3, $4, $5, $6, $7)";
        sqlx::query(sql)
            .bind(window.id)
            .bind(user_id.0 as i64)
            .bind(start)
            .bind(end)
            .bind(availability_status_str(status))
            .bind(game_id)
            .bind(source_event_id.map(|e| e.0))
            .execute(&self.pool)
            .await?;

        Ok(window)
    }
}
