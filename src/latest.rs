/// The most recent roll seen by this process, kept for live display.
///
/// Latest rolls are ephemeral: they are shown and broadcast but never
/// persisted, and they are updated even when privacy settings keep a roll
/// out of the durable statistics.
use serde::{Deserialize, Serialize};

use crate::identity::Identity;
use crate::normalizer::faces::{merge_result_counts, merge_result_sequences};
use crate::normalizer::{ActionType, Advantage, ResultCounts, ResultSequence, RollPayload};
use crate::visibility::VisibilityInfo;

fn default_action() -> String {
    ActionType::Other.as_str().to_string()
}

fn default_rolls() -> u64 {
    1
}

/// One `(action, detail)` group of a latest roll.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LatestRollSegment {
    pub action_type: String,
    pub detail_key: Option<String>,
    pub advantage: Option<Advantage>,
    pub results: ResultCounts,
    pub sequence: ResultSequence,
}

impl Default for LatestRollSegment {
    fn default() -> Self {
        LatestRollSegment {
            action_type: default_action(),
            detail_key: None,
            advantage: None,
            results: ResultCounts::new(),
            sequence: ResultSequence::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatestRollEntry {
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub user_name: Option<String>,
    #[serde(default = "default_action")]
    pub action_type: String,
    /// None when the groups disagree.
    #[serde(default)]
    pub detail_key: Option<String>,
    /// None when the groups disagree.
    #[serde(default)]
    pub advantage: Option<Advantage>,
    #[serde(default)]
    pub visibility: Option<VisibilityInfo>,
    #[serde(default = "default_rolls")]
    pub rolls: u64,
    #[serde(default)]
    pub results: ResultCounts,
    #[serde(default)]
    pub sequence: ResultSequence,
    #[serde(default)]
    pub segments: Option<Vec<LatestRollSegment>>,
    /// Milliseconds since the Unix epoch; 0 until stamped.
    #[serde(default)]
    pub at: i64,
}

impl LatestRollEntry {
    /// Combines the payloads of one roll event into a single entry.
    pub fn from_payloads(payloads: &[RollPayload], now_ms: i64) -> Option<Self> {
        let base = payloads.first()?;
        let mut entry = LatestRollEntry {
            user_id: None,
            user_name: None,
            action_type: String::new(),
            detail_key: base.detail_key.clone(),
            advantage: base.advantage,
            visibility: None,
            rolls: 0,
            results: ResultCounts::new(),
            sequence: ResultSequence::new(),
            segments: Some(Vec::with_capacity(payloads.len())),
            at: now_ms,
        };
        let mut mixed_detail = false;
        let mut mixed_advantage = false;

        for payload in payloads {
            entry.rolls += payload.rolls;
            if let Some(results) = &payload.results {
                merge_result_counts(&mut entry.results, results);
            }
            merge_result_sequences(&mut entry.sequence, &payload.sequence);
            if let Some(segments) = entry.segments.as_mut() {
                segments.push(LatestRollSegment {
                    action_type: payload.action_type.clone().unwrap_or_else(default_action),
                    detail_key: payload.detail_key.clone(),
                    advantage: payload.advantage,
                    results: payload.results.clone().unwrap_or_default(),
                    sequence: payload.sequence.clone(),
                });
            }

            if entry.user_id.is_none() {
                entry.user_id = payload.user_id.clone();
            }
            if entry.visibility.is_none() {
                entry.visibility = payload.visibility.clone();
            }
            if entry.action_type.is_empty() {
                entry.action_type = payload.action_type.clone().unwrap_or_default();
            }
            mixed_detail |= payload.detail_key != base.detail_key;
            mixed_advantage |= payload.advantage != base.advantage;
        }

        if mixed_detail {
            entry.detail_key = None;
        }
        if mixed_advantage {
            entry.advantage = None;
        }
        entry.normalize(now_ms);
        Some(entry)
    }

    /// Fills defaults on an entry of unknown origin.
    pub fn normalize(&mut self, now_ms: i64) {
        if self.action_type.is_empty() {
            self.action_type = default_action();
        }
        self.detail_key = self.detail_key.take().filter(|d| !d.is_empty());
        self.user_id = self.user_id.take().filter(|u| !u.is_empty());
        self.results.retain(|_, faces| !faces.is_empty());
        self.sequence.retain(|_, values| !values.is_empty());
        if let Some(visibility) = self.visibility.as_mut() {
            visibility.whisper.retain(|id| !id.is_empty());
        }
        if self.at <= 0 {
            self.at = now_ms;
        }
    }

    /// Resolves the display name of the roller when missing.
    pub fn with_user_name(mut self, identity: &dyn Identity) -> Self {
        if self.user_name.is_none() {
            self.user_name = self.user_id.as_deref().and_then(|id| identity.user_name(id));
        }
        self
    }

    pub fn has_d20(&self) -> bool {
        let is_d20 = |key: &String| key.eq_ignore_ascii_case("d20");
        self.results.keys().any(is_d20) || self.sequence.keys().any(is_d20)
    }

    /// "Blind", "Private" or "Self" for non-public rolls.
    pub fn privacy_label(&self) -> Option<&'static str> {
        self.visibility.as_ref().and_then(VisibilityInfo::privacy_label)
    }

    /// Whether the current user of `identity` may see this roll.
    ///
    /// Players never see GM rolls unless GM statistics are shared; beyond
    /// that the roll's own privacy mode decides.
    pub fn is_visible_to(&self, identity: &dyn Identity, allow_players_see_gm_stats: bool) -> bool {
        let Some(visibility) = &self.visibility else {
            return true;
        };
        let viewer = identity.current_user();
        let viewer_is_gm = identity.current_is_gm();
        if !allow_players_see_gm_stats && !viewer_is_gm {
            let source = self
                .user_id
                .as_deref()
                .or(visibility.author_id.as_deref())
                .or(visibility.user_id.as_deref());
            if source.is_some_and(|id| identity.is_gm(id)) {
                return false;
            }
        }
        visibility.visible_to(viewer.as_deref(), viewer_is_gm)
    }
}

/// Latest roll state of one process.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LatestRolls {
    pub latest: Option<LatestRollEntry>,
    /// Latest roll involving a d20.
    pub latest_d20: Option<LatestRollEntry>,
}

impl LatestRolls {
    pub fn set(&mut self, entry: LatestRollEntry) {
        if entry.has_d20() {
            self.latest_d20 = Some(entry.clone());
        }
        self.latest = Some(entry);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Directory;
    use indexmap::IndexMap;
    use serde_json::json;

    fn payload(action: &str, detail: Option<&str>, advantage: Option<Advantage>, die: &str, faces: &[i64]) -> RollPayload {
        let mut counts: IndexMap<String, u64> = IndexMap::new();
        for face in faces {
            *counts.entry(face.to_string()).or_insert(0) += 1;
        }
        RollPayload {
            user_id: Some("p1".to_string()),
            action_type: Some(action.to_string()),
            detail_key: detail.map(str::to_string),
            rolls: 1,
            results: Some(ResultCounts::from([(die.to_string(), counts)])),
            sequence: ResultSequence::from([(die.to_string(), faces.to_vec())]),
            advantage,
            ..Default::default()
        }
    }

    fn roster() -> Directory {
        serde_json::from_value(json!({
            "users": [
                {"id": "gm", "name": "GM", "isGM": true, "active": true},
                {"id": "p1", "name": "Pat", "active": true},
                {"id": "p2", "name": "Sam", "active": true}
            ],
            "currentUser": "p2"
        }))
        .unwrap()
    }

    #[test]
    fn test_from_payloads_merges_groups() {
        let payloads = [
            payload("attack", None, Some(Advantage::Advantage), "d20", &[17, 4]),
            payload("damage", None, Some(Advantage::Advantage), "d8", &[6]),
        ];
        let entry = LatestRollEntry::from_payloads(&payloads, 500).unwrap();
        assert_eq!(entry.action_type, "attack");
        assert_eq!(entry.rolls, 2);
        assert_eq!(entry.advantage, Some(Advantage::Advantage));
        assert_eq!(entry.sequence["d20"], vec![17, 4]);
        assert_eq!(entry.results["d8"]["6"], 1);
        assert_eq!(entry.segments.as_ref().unwrap().len(), 2);
        assert_eq!(entry.at, 500);
        assert!(entry.has_d20());
        assert!(LatestRollEntry::from_payloads(&[], 500).is_none());
    }

    #[test]
    fn test_mixed_groups_clear_detail_and_advantage() {
        let payloads = [
            payload("save", Some("dex"), Some(Advantage::Advantage), "d20", &[12]),
            payload("save", Some("wis"), None, "d20", &[3]),
        ];
        let entry = LatestRollEntry::from_payloads(&payloads, 1).unwrap();
        assert_eq!(entry.detail_key, None);
        assert_eq!(entry.advantage, None);
        let segments = entry.segments.unwrap();
        assert_eq!(segments[0].detail_key.as_deref(), Some("dex"));
        assert_eq!(segments[1].detail_key.as_deref(), Some("wis"));
    }

    #[test]
    fn test_deserialize_fills_defaults() {
        let mut entry: LatestRollEntry =
            serde_json::from_value(json!({"userId": "p1", "detailKey": "", "results": {"D20": {"20": 1}}})).unwrap();
        entry.normalize(42);
        assert_eq!(entry.action_type, "other");
        assert_eq!(entry.rolls, 1);
        assert_eq!(entry.detail_key, None);
        assert_eq!(entry.at, 42);
        assert!(entry.has_d20());
        let entry = entry.with_user_name(&roster());
        assert_eq!(entry.user_name.as_deref(), Some("Pat"));
    }

    #[test]
    fn test_latest_d20_only_tracks_d20_rolls() {
        let mut latest = LatestRolls::default();
        let d20 = LatestRollEntry::from_payloads(&[payload("check", None, None, "d20", &[9])], 1).unwrap();
        let d6 = LatestRollEntry::from_payloads(&[payload("damage", None, None, "d6", &[2])], 2).unwrap();
        latest.set(d20.clone());
        latest.set(d6.clone());
        assert_eq!(latest.latest, Some(d6));
        assert_eq!(latest.latest_d20, Some(d20));
    }

    #[test]
    fn test_visibility_rules() {
        let dir = roster();
        let mut entry = LatestRollEntry::from_payloads(&[payload("attack", None, None, "d20", &[5])], 1).unwrap();
        assert!(entry.is_visible_to(&dir, false));
        assert_eq!(entry.privacy_label(), None);

        entry.visibility = Some(VisibilityInfo {
            roll_mode: Some("gmroll".into()),
            author_id: Some("p1".into()),
            ..Default::default()
        });
        assert_eq!(entry.privacy_label(), Some("Private"));
        assert!(!entry.is_visible_to(&dir, false));
        assert!(entry.is_visible_to(&dir.as_user("p1"), false));
        assert!(entry.is_visible_to(&dir.as_user("gm"), false));

        entry.visibility = Some(VisibilityInfo {
            roll_mode: Some("blindroll".into()),
            blind: true,
            ..Default::default()
        });
        assert_eq!(entry.privacy_label(), Some("Blind"));
        assert!(!entry.is_visible_to(&dir.as_user("p1"), false));
        assert!(entry.is_visible_to(&dir.as_user("gm"), false));
    }

    #[test]
    fn test_gm_rolls_hidden_from_players() {
        let dir = roster();
        let mut entry = LatestRollEntry::from_payloads(&[payload("attack", None, None, "d20", &[5])], 1).unwrap();
        entry.user_id = Some("gm".into());
        entry.visibility = Some(VisibilityInfo {
            roll_mode: Some("publicroll".into()),
            ..Default::default()
        });
        assert!(!entry.is_visible_to(&dir, false));
        assert!(entry.is_visible_to(&dir, true));
        assert!(entry.is_visible_to(&dir.as_user("gm"), false));
    }
}
