//! §4.4 Consensus Detector: turns a set of resolved member presences into an
//! ordered list of session groups, deterministically.

use crate::model::DiscordId;
use crate::resolver::Resolution;

/// One bucket of members agreed (by majority, or by split) to share a
/// session.
#[derive(Debug, Clone, PartialEq)]
pub struct Group {
    pub game_id: Option<i64>,
    pub game_name: String,
    pub member_ids: Vec<DiscordId>,
}

const UNTITLED_SESSION_NAME: &str = "Untitled Gaming Session";

/// Bucket key used only to group members before majority/split logic runs;
/// §4.4 step 1: `id:<gameId>` for matched games, `name:<gameName>` for
/// unmatched.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
enum BucketKey {
    Id(i64),
    Name(String),
}

struct Bucket {
    key: BucketKey,
    resolution: Resolution,
    member_ids: Vec<DiscordId>,
}

/// Run the consensus algorithm over `members` (each paired with its
/// resolved `(gameId?, gameName)`). Input order does not affect the
/// resulting groups' member sets; only the deterministic tiebreak governs
/// group identity and ordering.
pub fn detect(members: &[(DiscordId, Resolution)]) -> Vec<Group> {
    if members.is_empty() {
        return Vec::new();
    }

    let buckets = bucket_members(members);
    let total = members.len();

    if let Some(majority) = find_majority(&buckets, total) {
        let all_members: Vec<DiscordId> = members.iter().map(|(id, _)| *id).collect();
        return vec![Group {
            game_id: majority.resolution.game_id,
            game_name: majority.resolution.game_name.clone(),
            member_ids: all_members,
        }];
    }

    let all_null = buckets
        .iter()
        .all(|b| matches!(b.key, BucketKey::Name(_)));
    if all_null {
        let all_members: Vec<DiscordId> = members.iter().map(|(id, _)| *id).collect();
        return vec![Group {
            game_id: None,
            game_name: UNTITLED_SESSION_NAME.to_string(),
            member_ids: all_members,
        }];
    }

    split_groups(buckets)
}

fn bucket_members(members: &[(DiscordId, Resolution)]) -> Vec<Bucket> {
    let mut buckets: Vec<Bucket> = Vec::new();

    for (member_id, resolution) in members {
        let key = match resolution.game_id {
            Some(id) => BucketKey::Id(id),
            None => BucketKey::Name(resolution.game_name.clone()),
        };

        match buckets.iter_mut().find(|b| b.key == key) {
            Some(bucket) => bucket.member_ids.push(*member_id),
            None => buckets.push(Bucket {
                key,
                resolution: resolution.clone(),
                member_ids: vec![*member_id],
            }),
        }
    }

    buckets
}

/// A majority iff `|group| >= N/2` (integer ceil-free per spec: `N/2` as
/// stated) and the bucket's gameId is non-null. Ties among multiple
/// qualifying buckets resolve to the largest, then ascending gameId.
fn find_majority(buckets: &[Bucket], total: usize) -> Option<&Bucket> {
    let half = total as f64 / 2.0;

    buckets
        .iter()
        .filter(|b| matches!(b.key, BucketKey::Id(_)) && b.member_ids.len() as f64 >= half)
        .max_by(|a, b| {
            a.member_ids
                .len()
                .cmp(&b.member_ids.len())
                .then_with(|| bucket_game_id(b).cmp(&bucket_game_id(a)))
        })
}

fn bucket_game_id(bucket: &Bucket) -> i64 {
    match bucket.key {
        BucketKey::Id(id) => id,
        BucketKey::Name(_) => i64::MAX,
    }
}

/// §4.4 step 4: one group per non-null game, with null-resolved members
/// folded into the largest group (ties broken by ascending gameId).
fn split_groups(buckets: Vec<Bucket>) -> Vec<Group> {
    let (mut named, unmatched): (Vec<Bucket>, Vec<Bucket>) = buckets
        .into_iter()
        .partition(|b| matches!(b.key, BucketKey::Id(_)));

    named.sort_by_key(bucket_game_id);

    let target = named
        .iter()
        .enumerate()
        .max_by(|(_, a), (_, b)| {
            a.member_ids
                .len()
                .cmp(&b.member_ids.len())
                .then_with(|| bucket_game_id(b).cmp(&bucket_game_id(a)))
        })
        .map(|(idx, _)| idx);

    if let Some(idx) = target {
        for bucket in &unmatched {
            named[idx].member_ids.extend(bucket.member_ids.iter().copied());
        }
    }

    named
        .into_iter()
        .map(|b| Group {
            game_id: b.resolution.game_id,
            game_name: b.resolution.game_name,
            member_ids: b.member_ids,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn named(id: Option<i64>, name: &str) -> Resolution {
        Resolution {
            game_id: id,
            game_name: name.to_string(),
        }
    }

    #[test]
    fn clear_majority_absorbs_outliers() {
        let members = vec![
            (DiscordId(1), named(Some(1), "Factorio")),
            (DiscordId(2), named(Some(1), "Factorio")),
            (DiscordId(3), named(Some(1), "Factorio")),
            (DiscordId(4), named(Some(2), "Chess")),
        ];

        let groups = detect(&members);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].game_id, Some(1));
        assert_eq!(groups[0].member_ids.len(), 4);
    }

    #[test]
    fn all_untitled_collapses_to_single_group() {
        let members = vec![
            (DiscordId(1), named(None, "Browsing")),
            (DiscordId(2), named(None, "Idle")),
        ];

        let groups = detect(&members);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].game_id, None);
        assert_eq!(groups[0].game_name, UNTITLED_SESSION_NAME);
        assert_eq!(groups[0].member_ids.len(), 2);
    }

    #[test]
    fn no_majority_splits_by_game_and_folds_null_into_largest() {
        let members = vec![
            (DiscordId(1), named(Some(1), "Factorio")),
            (DiscordId(2), named(Some(2), "Chess")),
            (DiscordId(3), named(Some(2), "Chess")),
            (DiscordId(4), named(None, "Idle")),
        ];

        let groups = detect(&members);
        assert_eq!(groups.len(), 2);

        let chess = groups.iter().find(|g| g.game_id == Some(2)).unwrap();
        assert_eq!(chess.member_ids.len(), 3);

        let factorio = groups.iter().find(|g| g.game_id == Some(1)).unwrap();
        assert_eq!(factorio.member_ids.len(), 1);
    }

    #[test]
    fn tie_breaks_by_ascending_game_id() {
        let members = vec![
            (DiscordId(1), named(Some(5), "Five")),
            (DiscordId(2), named(Some(3), "Three")),
            (DiscordId(3), named(None, "Idle")),
        ];

        let groups = detect(&members);
        assert_eq!(groups.len(), 2);

        let three = groups.iter().find(|g| g.game_id == Some(3)).unwrap();
        assert_eq!(three.member_ids.len(), 2);
    }

    #[test]
    fn two_players_on_same_game_is_a_majority() {
        let members = vec![
            (DiscordId(1), named(Some(1), "Factorio")),
            (DiscordId(2), named(Some(1), "Factorio")),
        ];

        let groups = detect(&members);
        assert_eq!(groups.len(), 1);
        assert_eq!(groups[0].member_ids.len(), 2);
    }
}
