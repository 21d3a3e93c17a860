//! Referee match assignments as they travel between services.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Stable record id assigned by the source system.
pub type MatchId = u64;

/// Fields compared when deciding whether a known match was updated.
///
/// Changes to anything else (competition name, extra source fields) are not
/// detected.
pub const TRACKED_FIELDS: [&str; 6] = [
    "kickoff",
    "venue",
    "home_team",
    "away_team",
    "referees",
    "status",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Referee {
    pub name: String,
    /// e.g. `referee`, `assistant_1`, `fourth_official`
    pub role: String,
}

/// One assignment from the source system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchRecord {
    pub match_id: MatchId,
    /// Local kickoff time as given by the source (ISO 8601).
    #[serde(default)]
    pub kickoff: String,
    #[serde(default)]
    pub venue: String,
    #[serde(default)]
    pub home_team: String,
    #[serde(default)]
    pub away_team: String,
    #[serde(default)]
    pub competition: String,
    #[serde(default)]
    pub referees: Vec<Referee>,
    #[serde(default)]
    pub status: String,
    /// Source fields this system does not interpret, passed through verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl MatchRecord {
    /// A record with only its id set.
    pub fn new(match_id: MatchId) -> Self {
        Self {
            match_id,
            kickoff: String::new(),
            venue: String::new(),
            home_team: String::new(),
            away_team: String::new(),
            competition: String::new(),
            referees: Vec::new(),
            status: String::new(),
            extra: Map::new(),
        }
    }

    /// Tracked fields whose values differ between `self` and `other`.
    pub fn changed_fields(&self, other: &MatchRecord) -> Vec<&'static str> {
        TRACKED_FIELDS
            .into_iter()
            .filter(|field| match *field {
                "kickoff" => self.kickoff != other.kickoff,
                "venue" => self.venue != other.venue,
                "home_team" => self.home_team != other.home_team,
                "away_team" => self.away_team != other.away_team,
                "referees" => self.referees != other.referees,
                "status" => self.status != other.status,
                _ => false,
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample() -> MatchRecord {
        MatchRecord {
            kickoff: "2026-10-24T15:00:00".into(),
            venue: "Nya Ullevi".into(),
            home_team: "IFK Göteborg".into(),
            away_team: "AIK".into(),
            competition: "Allsvenskan".into(),
            referees: vec![Referee {
                name: "Anna Berg".into(),
                role: "referee".into(),
            }],
            status: "scheduled".into(),
            ..MatchRecord::new(6169105)
        }
    }

    #[test]
    fn test_identical_records_have_no_changes() {
        assert!(sample().changed_fields(&sample()).is_empty());
    }

    #[test]
    fn test_tracked_field_changes_are_reported() {
        let mut moved = sample();
        moved.venue = "Gamla Ullevi".into();
        moved.kickoff = "2026-10-24T17:00:00".into();
        assert_eq!(sample().changed_fields(&moved), vec!["kickoff", "venue"]);
    }

    #[test]
    fn test_untracked_changes_are_ignored() {
        let mut renamed = sample();
        renamed.competition = "Svenska Cupen".into();
        renamed.extra.insert("round".into(), json!(12));
        assert!(sample().changed_fields(&renamed).is_empty());
    }

    #[test]
    fn test_extra_source_fields_pass_through() {
        let record: MatchRecord = serde_json::from_value(json!({
            "match_id": 42,
            "venue": "Tele2 Arena",
            "round": 7,
        }))
        .unwrap();
        assert_eq!(record.match_id, 42);
        assert_eq!(record.extra.get("round"), Some(&json!(7)));
        let back = serde_json::to_value(&record).unwrap();
        assert_eq!(back["round"], json!(7));
    }
}
