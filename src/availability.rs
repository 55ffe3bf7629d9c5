//! §4.10 (SPEC_FULL) Availability & conflict detection. §1 calls this
//! "adjacent" to the core, and §2's budget table does not name it, but §6
//! requires the core to expose the `checkConflicts` contract because
//! scheduled-event creation depends on it.
//!
//! The [`crate::ports::AvailabilityStore`] trait is the persistence seam;
//! this module holds the pure overlap/conflict logic so it can be unit
//! tested without a store at all, the same split `consensus.rs` makes
//! between "pure algorithm" and "caller that has a store".

use chrono::{DateTime, Utc};

use crate::model::AvailabilityWindow;

/// §6 `checkConflicts`: windows from `candidates` that overlap
/// `[start, end)`, are `committed`/`blocked`, and are not excluded by
/// `exclude_game_id` (same non-null game overlap is never a conflict,
/// §3) or `exclude_id` (a window being edited doesn't conflict with
/// itself).
///
/// §9 records an explicit open question about whether two separate
/// *committed* windows for the same game should instead merge rather than
/// simply both being excluded from conflict; this function preserves only
/// the literally-specified behavior (same-game overlap = no conflict,
/// regardless of count) and does not attempt to merge. See `DESIGN.md`.
pub fn conflicts<'a>(
    candidates: impl IntoIterator<Item = &'a AvailabilityWindow>,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    exclude_game_id: Option<i64>,
    exclude_id: Option<uuid::Uuid>,
) -> Vec<AvailabilityWindow> {
    candidates
        .into_iter()
        .filter(|w| Some(w.id) != exclude_id)
        .filter(|w| w.is_conflict_candidate())
        .filter(|w| w.overlaps(start, end))
        .filter(|w| !same_game(w.game_id, exclude_game_id))
        .cloned()
        .collect()
}

fn same_game(window_game: Option<i64>, exclude_game_id: Option<i64>) -> bool {
    match (window_game, exclude_game_id) {
        (Some(a), Some(b)) => a == b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AvailabilityStatus, DiscordId, EventId};

    fn t(secs: i64) -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000 + secs, 0).unwrap()
    }

    fn window(status: AvailabilityStatus, start: i64, end: i64, game_id: Option<i64>) -> AvailabilityWindow {
        AvailabilityWindow {
            id: uuid::Uuid::new_v4(),
            user_id: DiscordId(1),
            start: t(start),
            end: t(end),
            status,
            game_id,
            source_event_id: None::<EventId>,
        }
    }

    #[test]
    fn overlapping_committed_window_is_a_conflict() {
        let existing = window(AvailabilityStatus::Committed, 0, 3600, Some(1));
        let found = conflicts([&existing], t(1800), t(5000), None, None);
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn available_status_never_conflicts() {
        let existing = window(AvailabilityStatus::Available, 0, 3600, None);
        let found = conflicts([&existing], t(1800), t(5000), None, None);
        assert!(found.is_empty());
    }

    #[test]
    fn same_game_overlap_is_excluded_regardless_of_count() {
        let a = window(AvailabilityStatus::Committed, 0, 3600, Some(7));
        let b = window(AvailabilityStatus::Committed, 100, 3700, Some(7));
        let found = conflicts([&a, &b], t(200), t(2000), Some(7), None);
        assert!(found.is_empty());
    }

    #[test]
    fn different_game_overlap_still_conflicts() {
        let existing = window(AvailabilityStatus::Blocked, 0, 3600, Some(7));
        let found = conflicts([&existing], t(1800), t(5000), Some(9), None);
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn non_overlapping_window_is_not_a_conflict() {
        let existing = window(AvailabilityStatus::Committed, 0, 100, Some(1));
        let found = conflicts([&existing], t(200), t(300), None, None);
        assert!(found.is_empty());
    }

    #[test]
    fn excluded_id_never_conflicts_with_itself() {
        let existing = window(AvailabilityStatus::Committed, 0, 3600, Some(1));
        let id = existing.id;
        let found = conflicts([&existing], t(1800), t(5000), None, Some(id));
        assert!(found.is_empty());
    }
}
