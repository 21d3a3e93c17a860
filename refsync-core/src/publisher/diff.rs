//! Snapshot diffing of match lists.

use std::collections::BTreeMap;

use itertools::{EitherOrBoth, Itertools};
use refsync_sdk::objects::{MatchId, MatchRecord};
use serde::Serialize;

/// Last-published records keyed by id.
pub type Snapshot = BTreeMap<MatchId, MatchRecord>;

/// Index a match list by id. When an id appears twice the last one wins.
pub fn index_matches(matches: Vec<MatchRecord>) -> Snapshot {
    matches
        .into_iter()
        .map(|record| (record.match_id, record))
        .collect()
}

/// A known match whose tracked fields changed.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchChange {
    pub match_id: MatchId,
    pub fields: Vec<&'static str>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MatchDiff {
    pub added: Vec<MatchRecord>,
    /// Current versions of the updated records.
    pub updated: Vec<MatchRecord>,
    pub changes: Vec<MatchChange>,
    /// Previous versions of the removed records.
    pub removed: Vec<MatchRecord>,
}

impl MatchDiff {
    pub fn has_changes(&self) -> bool {
        !(self.added.is_empty() && self.updated.is_empty() && self.removed.is_empty())
    }
}

/// Compare two snapshots.
///
/// Only the tracked fields of [`MatchRecord::changed_fields`] count as an
/// update; both maps are walked in id order in a single pass.
pub fn diff_snapshots(previous: &Snapshot, current: &Snapshot) -> MatchDiff {
    let mut diff = MatchDiff::default();

    for pair in previous
        .iter()
        .merge_join_by(current.iter(), |(a, _), (b, _)| a.cmp(b))
    {
        match pair {
            EitherOrBoth::Left((_, old)) => diff.removed.push(old.clone()),
            EitherOrBoth::Right((_, new)) => diff.added.push(new.clone()),
            EitherOrBoth::Both((id, old), (_, new)) => {
                let fields = old.changed_fields(new);
                if !fields.is_empty() {
                    diff.changes.push(MatchChange {
                        match_id: *id,
                        fields,
                    });
                    diff.updated.push(new.clone());
                }
            }
        }
    }

    diff
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(id: MatchId, venue: &str) -> MatchRecord {
        MatchRecord {
            venue: venue.to_string(),
            home_team: "Hammarby IF".to_string(),
            away_team: "Djurgårdens IF".to_string(),
            ..MatchRecord::new(id)
        }
    }

    #[test]
    fn test_first_snapshot_is_all_added() {
        let current = index_matches(vec![record(1, "Tele2 Arena"), record(2, "Strawberry Arena")]);
        let diff = diff_snapshots(&Snapshot::new(), &current);
        assert_eq!(diff.added.len(), 2);
        assert!(diff.updated.is_empty());
        assert!(diff.removed.is_empty());
        assert!(diff.has_changes());
    }

    #[test]
    fn test_unchanged_snapshot_has_no_changes() {
        let snapshot = index_matches(vec![record(1, "Tele2 Arena")]);
        let diff = diff_snapshots(&snapshot, &snapshot.clone());
        assert_eq!(diff, MatchDiff::default());
        assert!(!diff.has_changes());
    }

    #[test]
    fn test_added_updated_and_removed_together() {
        let previous = index_matches(vec![record(1, "Tele2 Arena"), record(2, "Gamla Ullevi")]);
        let current = index_matches(vec![record(1, "Friends Arena"), record(3, "Eleda Stadion")]);
        let diff = diff_snapshots(&previous, &current);

        assert_eq!(diff.added, vec![record(3, "Eleda Stadion")]);
        assert_eq!(diff.updated, vec![record(1, "Friends Arena")]);
        assert_eq!(
            diff.changes,
            vec![MatchChange {
                match_id: 1,
                fields: vec!["venue"]
            }]
        );
        assert_eq!(diff.removed, vec![record(2, "Gamla Ullevi")]);
    }

    #[test]
    fn test_untracked_field_change_is_not_an_update() {
        let previous = index_matches(vec![record(1, "Tele2 Arena")]);
        let mut changed = record(1, "Tele2 Arena");
        changed.competition = "Svenska Cupen".to_string();
        let diff = diff_snapshots(&previous, &index_matches(vec![changed]));
        assert!(!diff.has_changes());
    }

    #[test]
    fn test_duplicate_ids_keep_last() {
        let snapshot = index_matches(vec![record(7, "first"), record(7, "second")]);
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[&7].venue, "second");
    }
}
