//! §4.6 Voice-Attendance Engine: presence tracking for scheduled
//! (non-ad-hoc) events, sharing `InMemorySession` with §4.5 but keyed by
//! `(scheduledEventId, discordUserId)`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;

use crate::binding_cache::BindingCache;
use crate::clock::Clock;
use crate::model::{AdHocParticipantRecord, BindingPurpose, DiscordId, EventId, InMemorySession, MemberHint};
use crate::ports::{PresenceEventSource, ScheduledEventStore, SessionStore};
use crate::utils::prelude::*;

/// Owns the live session table for scheduled-event voice attendance.
/// Shares nothing at runtime with [`crate::adhoc::AdhocEngine`] beyond the
/// `InMemorySession` type — the two subsystems key their tables by
/// different event kinds and never touch the same row.
pub struct AttendanceEngine {
    session_store: Arc<dyn SessionStore>,
    clock: Arc<dyn Clock>,
    sessions: DashMap<(EventId, DiscordId), InMemorySession>,
}

impl AttendanceEngine {
    pub fn new(session_store: Arc<dyn SessionStore>, clock: Arc<dyn Clock>) -> Arc<Self> {
        Arc::new(Self {
            session_store,
            clock,
            sessions: DashMap::new(),
        })
    }

    /// §4.6 Join.
    pub fn handle_join(&self, event_id: EventId, user_id: DiscordId, display_name: String) {
        let now = self.clock.now();
        match self.sessions.get_mut(&(event_id, user_id)) {
            Some(entry) if entry.is_active => {
                trace!("Duplicate join for ({event_id}, {user_id}), ignoring");
            },
            Some(mut entry) => entry.reopen(now),
            None => {
                self.sessions
                    .insert((event_id, user_id), InMemorySession::new(event_id, user_id, display_name, now));
            },
        }
    }

    /// §4.6 Leave.
    pub fn handle_leave(&self, event_id: EventId, user_id: DiscordId) {
        let now = self.clock.now();
        if let Some(mut entry) = self.sessions.get_mut(&(event_id, user_id)) {
            entry.close(now);
        }
    }

    /// §4.6 periodic flush: any session that is dirty or currently active
    /// is written as a snapshot that folds in the open segment's elapsed
    /// time without mutating the in-memory session (invariant (c) of §3).
    pub async fn flush(&self) {
        let now = self.clock.now();
        let mut written = 0usize;

        for mut entry in self.sessions.iter_mut() {
            if !entry.dirty && !entry.is_active {
                continue;
            }

            let record = snapshot_record(&entry, now);
            match self.session_store.upsert(record).await {
                Ok(()) => {
                    entry.dirty = false;
                    written += 1;
                },
                Err(e) => warn!("Attendance flush failed for ({}, {}): {e:#}", entry.event_id, entry.discord_user_id),
            }
        }

        if written > 0 {
            debug!("Attendance flush wrote {written} sessions");
        }
    }

    /// Drop every in-memory session for `event_id` (§4.9 step 6, run by the
    /// classification loop once an event has been classified).
    pub fn drop_event(&self, event_id: EventId) {
        self.sessions.retain(|(e, _), _| *e != event_id);
    }

    /// §4.8 live-roster read model for a scheduled event's voice attendance.
    pub fn roster_for(&self, event_id: EventId) -> crate::roster::RosterDto {
        let now = self.clock.now();
        let sessions: Vec<InMemorySession> =
            self.sessions.iter().filter(|e| e.key().0 == event_id).map(|e| e.value().clone()).collect();
        crate::roster::build_roster(event_id, sessions.iter(), now)
    }

    /// §4.9 step 1: close any still-active sessions for `event_id` with
    /// `leaveAt = end_time` (the event's own end, not "now" — attendance
    /// tracking respects only the original window, §4.6 "Scoping").
    pub fn close_all_for_event(&self, event_id: EventId, end_time: DateTime<Utc>) {
        for mut entry in self.sessions.iter_mut() {
            if entry.event_id == event_id && entry.is_active {
                entry.close(end_time);
            }
        }
    }

    /// §4.6 startup recovery: reconcile persisted rows with who is actually
    /// present right now, scoped per-channel so each occupant is attributed
    /// only to the live event actually bound to *their* channel — never to
    /// every live event in the guild, and never to members of unrelated
    /// channels.
    pub async fn recover(
        &self,
        guild_id: DiscordId,
        binding_cache: Arc<BindingCache>,
        events: Arc<dyn ScheduledEventStore>,
        presence: Arc<dyn PresenceEventSource>,
    ) -> anyhow::Result<()> {
        let now = self.clock.now();
        let occupied = presence.occupied_voice_channels(guild_id).await?;

        for (channel_id, members) in occupied {
            let Some(binding) = binding_cache.lookup(guild_id, channel_id, &[BindingPurpose::VoiceMonitor]).await else {
                continue;
            };
            if binding.purpose != BindingPurpose::VoiceMonitor {
                continue;
            }

            let live = events.live_at(guild_id, now).await?;
            let Some(event) = live.into_iter().find(|e| e.is_live(now) && e.game_id == binding.game_id) else {
                continue;
            };

            for (user_id, hint) in members {
                self.recover_member(event.id, user_id, &hint, now).await?;
            }
        }

        Ok(())
    }

    async fn recover_member(
        &self,
        event_id: EventId,
        user_id: DiscordId,
        hint: &MemberHint,
        now: DateTime<Utc>,
    ) -> anyhow::Result<()> {
        match self.session_store.get(event_id, user_id).await? {
            Some(record) => {
                let mut session = InMemorySession {
                    event_id,
                    internal_user_id: record.user_id,
                    discord_user_id: user_id,
                    display_name: hint.display_name.clone(),
                    first_join_at: record.first_join_at,
                    last_leave_at: record.last_leave_at,
                    total_duration_sec: record.total_duration_sec,
                    segments: record.segments,
                    is_active: false,
                    active_segment_start: None,
                    dirty: true,
                };

                for seg in &mut session.segments {
                    if seg.is_open() {
                        seg.leave_at = Some(now);
                    }
                }
                session.reopen(now);

                self.sessions.insert((event_id, user_id), session);
            },
            None => self.handle_join(event_id, user_id, hint.display_name.clone()),
        }

        Ok(())
    }
}

fn snapshot_record(session: &InMemorySession, now: DateTime<Utc>) -> AdHocParticipantRecord {
    let mut record = AdHocParticipantRecord::from_session(session, now);
    record.total_duration_sec = session.snapshot_total_duration(now);

    if let Some(elapsed) = session.open_segment_elapsed(now) {
        if let Some(last) = record.segments.last_mut() {
            if last.is_open() {
                last.duration_sec = elapsed;
            }
        }
    }

    record
}
