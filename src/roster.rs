//! §4.8 Live-Roster Read Model: a pure function over the in-memory session
//! table, consumed by ad-hoc update notifications and a live-roster
//! endpoint for clients watching an in-progress session.

use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::model::{DiscordId, EventId, InMemorySession};

#[derive(Debug, Clone, Serialize)]
pub struct ParticipantDto {
    pub id: DiscordId,
    pub user_id: Option<Uuid>,
    pub discord_username: String,
    pub joined_at: DateTime<Utc>,
    pub left_at: Option<DateTime<Utc>>,
    pub total_duration_seconds: i64,
    pub session_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct RosterDto {
    pub event_id: EventId,
    pub participants: Vec<ParticipantDto>,
    pub active_count: usize,
}

/// Build the roster for `event_id` from whatever sessions in `sessions`
/// match it. `sessions` is any iterable of `(eventId, &InMemorySession)`
/// pairs so callers (ad-hoc's per-game table, attendance's flat table) can
/// feed this without converging on one storage shape.
pub fn build_roster<'a>(
    event_id: EventId,
    sessions: impl IntoIterator<Item = &'a InMemorySession>,
    now: DateTime<Utc>,
) -> RosterDto {
    let participants: Vec<ParticipantDto> = sessions
        .into_iter()
        .filter(|s| s.event_id == event_id)
        .map(|s| ParticipantDto {
            id: s.discord_user_id,
            user_id: s.internal_user_id,
            discord_username: s.display_name.clone(),
            joined_at: s.first_join_at,
            left_at: if s.is_active { None } else { s.last_leave_at },
            total_duration_seconds: s.snapshot_total_duration(now),
            session_count: s.segments.len(),
        })
        .collect();

    let active_count = participants.iter().filter(|p| p.left_at.is_none()).count();

    RosterDto {
        event_id,
        participants,
        active_count,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn active_participant_duration_includes_open_segment() {
        let event_id = EventId::new();
        let session = InMemorySession::new(event_id, DiscordId(1), "a".into(), t(0));

        let roster = build_roster(event_id, std::iter::once(&session), t(30));

        assert_eq!(roster.participants.len(), 1);
        assert_eq!(roster.participants[0].total_duration_seconds, 30);
        assert!(roster.participants[0].left_at.is_none());
        assert_eq!(roster.active_count, 1);
    }

    #[test]
    fn only_matching_event_id_is_included() {
        let event_a = EventId::new();
        let event_b = EventId::new();
        let a = InMemorySession::new(event_a, DiscordId(1), "a".into(), t(0));
        let b = InMemorySession::new(event_b, DiscordId(2), "b".into(), t(0));

        let roster = build_roster(event_a, vec![&a, &b], t(10));

        assert_eq!(roster.participants.len(), 1);
        assert_eq!(roster.participants[0].id, DiscordId(1));
    }

    #[test]
    fn left_participant_has_left_at_and_frozen_duration() {
        let event_id = EventId::new();
        let mut session = InMemorySession::new(event_id, DiscordId(1), "a".into(), t(0));
        session.close(t(20));

        let roster = build_roster(event_id, std::iter::once(&session), t(50));

        assert_eq!(roster.participants[0].total_duration_seconds, 20);
        assert_eq!(roster.participants[0].left_at, Some(t(20)));
        assert_eq!(roster.active_count, 0);
    }
}
