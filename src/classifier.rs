//! §4.9 Scheduled-Classification Loop: the per-minute cron-like driver that
//! closes out ended scheduled events, flushes their sessions, classifies
//! each participant into the §3 taxonomy, and auto-populates signups.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::attendance::AttendanceEngine;
use crate::model::{AdHocParticipantRecord, AttendanceClassification, ScheduledEvent};
use crate::ports::{ScheduledEventStore, SessionStore, SignupStore};
use crate::utils::prelude::*;

/// Default `graceMs` (§4.9): 5 minutes.
const DEFAULT_GRACE: chrono::Duration = chrono::Duration::minutes(5);
/// Look-back window so extended outages don't permanently skip
/// classification (§4.9).
const LOOKBACK: chrono::Duration = chrono::Duration::hours(24);

/// §4.9 classification algorithm, first-match-wins. Pure function over a
/// persisted session row's accumulated fields and the event's window, so
/// it is testable without any store or loop around it.
pub fn classify(
    record: &AdHocParticipantRecord,
    event: &ScheduledEvent,
    grace: chrono::Duration,
) -> AttendanceClassification {
    if record.total_duration_sec < 120 {
        return AttendanceClassification::NoShow;
    }

    let event_duration_sec = event.duration_sec();
    let ratio = crate::utils::safe_ratio(record.total_duration_sec as f64, event_duration_sec as f64);

    let joined_late = record.first_join_at > event.start_time + grace;
    if joined_late && ratio >= 0.2 {
        return AttendanceClassification::Late;
    }

    let left_early = record
        .last_leave_at
        .is_some_and(|leave| leave < event.end_time - chrono::Duration::minutes(5));
    if left_early && (0.2..0.8).contains(&ratio) {
        return AttendanceClassification::EarlyLeaver;
    }

    if (0.2..0.8).contains(&ratio) {
        return AttendanceClassification::Partial;
    }

    if ratio >= 0.8 {
        return AttendanceClassification::Full;
    }

    AttendanceClassification::Partial
}

/// Owns the per-minute driver. `grace` is the configurable `graceMs`
/// (§4.9), defaulted to 5 minutes.
pub struct ClassificationLoop {
    attendance: Arc<AttendanceEngine>,
    events: Arc<dyn ScheduledEventStore>,
    sessions: Arc<dyn SessionStore>,
    signups: Arc<dyn SignupStore>,
    grace: chrono::Duration,
}

impl ClassificationLoop {
    pub fn new(
        attendance: Arc<AttendanceEngine>,
        events: Arc<dyn ScheduledEventStore>,
        sessions: Arc<dyn SessionStore>,
        signups: Arc<dyn SignupStore>,
    ) -> Self {
        Self {
            attendance,
            events,
            sessions,
            signups,
            grace: DEFAULT_GRACE,
        }
    }

    pub fn with_grace(mut self, grace: chrono::Duration) -> Self {
        self.grace = grace;
        self
    }

    /// One tick: classify every scheduled event whose `endTime` falls in
    /// `[now - 24h, now]`. Each event's processing is wrapped
    /// independently (§7: "one failing event does not stop the batch").
    pub async fn tick(&self, now: DateTime<Utc>) {
        let candidates = match self.events.ended_between(now - LOOKBACK, now).await {
            Ok(events) => events,
            Err(e) => {
                warn!("Failed to list ended scheduled events: {e:#}");
                return;
            },
        };

        for event in candidates {
            if let Err(e) = self.classify_event(&event, now).await {
                warn!("Classification failed for event '{}': {e:#}", event.id);
            }
        }
    }

    async fn classify_event(&self, event: &ScheduledEvent, now: DateTime<Utc>) -> anyhow::Result<()> {
        // Step 1-2: close any still-active sessions at event end, then flush.
        self.attendance.close_all_for_event(event.id, event.end_time);
        self.attendance.flush().await;

        // Step 3: classify every persisted session for this event. Computed
        // classifications are kept alongside (not reread from `records`,
        // which is a pre-classification snapshot) so step 5's
        // auto-population below sees what was just written this tick.
        let records = self.sessions.list_for_event(event.id).await?;
        let mut classifications = std::collections::HashMap::new();

        for record in &records {
            let classification = classify(record, event, self.grace);
            self.sessions
                .set_classification(event.id, record.discord_user_id, classification)
                .await?;
            classifications.insert(record.discord_user_id, classification);
        }

        // Step 4: synthesize no_show rows for signups with no voice session.
        let signed_up = self.signups.signed_up_user_ids(event.id).await?;
        for user_id in signed_up {
            if !classifications.contains_key(&user_id) {
                // Step 5: auto-populate only where null (preserves manual
                // overrides by staff).
                self.signups
                    .set_status_if_null(event.id, user_id, AttendanceClassification::NoShow)
                    .await?;
            }
        }

        // Step 5 (voice-classified participants): auto-populate status
        // only where currently null.
        let missing = self.signups.signups_missing_status(event.id).await?;
        for (user_id, _) in missing {
            if let Some(classification) = classifications.get(&user_id) {
                self.signups
                    .set_status_if_null(event.id, user_id, *classification)
                    .await?;
            }
        }

        // Step 6: drop in-memory sessions for this event.
        self.attendance.drop_event(event.id);

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DiscordId, EventId, SeriesId};

    fn event(start: i64, end: i64) -> ScheduledEvent {
        ScheduledEvent {
            id: EventId::new(),
            title: "Raid".into(),
            start_time: t(start),
            end_time: t(end),
            game_id: Some(7),
            cancelled_at: None,
            series_id: None::<SeriesId>,
            is_ad_hoc: false,
        }
    }

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn record(total_duration_sec: i64, first_join_at: DateTime<Utc>, last_leave_at: Option<DateTime<Utc>>) -> AdHocParticipantRecord {
        AdHocParticipantRecord {
            id: uuid::Uuid::new_v4(),
            event_id: EventId::new(),
            user_id: None,
            discord_user_id: DiscordId(1),
            discord_username: "a".into(),
            first_join_at,
            last_leave_at,
            total_duration_sec,
            segments: vec![],
            classification: None,
            created_at: t(0),
            updated_at: t(0),
        }
    }

    // 2 hour event: 7200s.
    fn two_hour_event() -> ScheduledEvent {
        event(0, 7200)
    }

    #[test]
    fn under_two_minutes_is_always_no_show() {
        let e = two_hour_event();
        let r = record(119, e.start_time, Some(e.start_time + chrono::Duration::seconds(119)));
        assert_eq!(classify(&r, &e, DEFAULT_GRACE), AttendanceClassification::NoShow);
    }

    #[test]
    fn late_with_high_presence_beats_full() {
        // Scenario 6: joins at 20:06 (6 min late), stays to 22:00. ratio=114/120=0.95.
        let e = two_hour_event();
        let r = record(114 * 60, e.start_time + chrono::Duration::minutes(6), Some(e.end_time));
        assert_eq!(classify(&r, &e, DEFAULT_GRACE), AttendanceClassification::Late);
    }

    #[test]
    fn join_at_exactly_grace_boundary_is_not_late() {
        let e = two_hour_event();
        let join_at = e.start_time + DEFAULT_GRACE;
        let r = record(6900, join_at, Some(e.end_time));
        assert_ne!(classify(&r, &e, DEFAULT_GRACE), AttendanceClassification::Late);
    }

    #[test]
    fn leave_at_exactly_five_minutes_before_end_is_not_early_leaver() {
        let e = two_hour_event();
        let leave_at = e.end_time - chrono::Duration::minutes(5);
        // ratio must land in [0.2, 0.8) for early_leaver to even be a candidate.
        let r = record(4000, e.start_time, Some(leave_at));
        assert_ne!(classify(&r, &e, DEFAULT_GRACE), AttendanceClassification::EarlyLeaver);
    }

    #[test]
    fn ratio_exactly_point_two_is_partial() {
        let e = two_hour_event();
        let r = record(1440, e.start_time, Some(e.start_time + chrono::Duration::seconds(1440)));
        assert_eq!(classify(&r, &e, DEFAULT_GRACE), AttendanceClassification::Partial);
    }

    #[test]
    fn ratio_exactly_point_eight_is_full() {
        let e = two_hour_event();
        let r = record(5760, e.start_time, Some(e.end_time));
        assert_eq!(classify(&r, &e, DEFAULT_GRACE), AttendanceClassification::Full);
    }

    #[test]
    fn early_leaver_takes_priority_over_partial() {
        let e = two_hour_event();
        let leave_at = e.end_time - chrono::Duration::minutes(10);
        let r = record(3600, e.start_time, Some(leave_at));
        assert_eq!(classify(&r, &e, DEFAULT_GRACE), AttendanceClassification::EarlyLeaver);
    }

    #[test]
    fn full_attendance_with_no_anomalies() {
        let e = two_hour_event();
        let r = record(7200, e.start_time, Some(e.end_time));
        assert_eq!(classify(&r, &e, DEFAULT_GRACE), AttendanceClassification::Full);
    }

    #[tokio::test]
    async fn tick_auto_populates_signup_status_for_a_non_no_show_participant() {
        // Regression test: a participant who actually attended (full
        // attendance, not a no-show) must have their signup row populated
        // by the same tick that computes their classification, not left
        // null forever because step 5 read a pre-classification snapshot.
        use crate::attendance::AttendanceEngine;
        use crate::clock::TestClock;
        use crate::persistence::memory::MemoryStore;

        let clock = std::sync::Arc::new(TestClock::new(t(0)));
        let store = MemoryStore::new(clock.clone());

        let e = two_hour_event();
        store.seed_scheduled_event(e.clone());
        store.seed_signup(e.id, DiscordId(1));

        let attendance = AttendanceEngine::new(store.clone(), clock.clone());
        attendance.handle_join(e.id, DiscordId(1), "a".into());
        clock.advance(chrono::Duration::hours(2));

        let loop_ = ClassificationLoop::new(attendance, store.clone(), store.clone(), store.clone());
        loop_.tick(clock.now() + chrono::Duration::seconds(1)).await;

        assert_eq!(store.signup_status(e.id, DiscordId(1)), Some(AttendanceClassification::Full));
    }
}
