/// Action type, detail key and advantage classification.
///
/// Host objects carry classification hints in many places depending on the
/// game system and automation modules installed. Each resolver scans an
/// ordered candidate list and takes the first usable signal.
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::LazyLock;

use crate::value::{self, path, text, text_at, NULL};

use super::WorkflowMeta;

/// Canonical roll purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionType {
    Attack,
    Damage,
    Save,
    Check,
    Skill,
    Ability,
    Initiative,
    #[serde(rename = "deathsave")]
    DeathSave,
    Tool,
    Heal,
    Spell,
    Other,
}

impl ActionType {
    /// Display order used by reports.
    pub const ORDER: [ActionType; 12] = [
        ActionType::Attack,
        ActionType::Damage,
        ActionType::Save,
        ActionType::Check,
        ActionType::Skill,
        ActionType::Ability,
        ActionType::Initiative,
        ActionType::DeathSave,
        ActionType::Tool,
        ActionType::Heal,
        ActionType::Spell,
        ActionType::Other,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ActionType::Attack => "attack",
            ActionType::Damage => "damage",
            ActionType::Save => "save",
            ActionType::Check => "check",
            ActionType::Skill => "skill",
            ActionType::Ability => "ability",
            ActionType::Initiative => "initiative",
            ActionType::DeathSave => "deathsave",
            ActionType::Tool => "tool",
            ActionType::Heal => "heal",
            ActionType::Spell => "spell",
            ActionType::Other => "other",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            ActionType::Attack => "Attack Rolls",
            ActionType::Damage => "Damage Rolls",
            ActionType::Save => "Saving Throw",
            ActionType::Check => "Ability Check",
            ActionType::Skill => "Skill Check",
            ActionType::Ability => "Ability Check",
            ActionType::Initiative => "Initiative",
            ActionType::DeathSave => "Death Save",
            ActionType::Tool => "Tool Check",
            ActionType::Heal => "Healing",
            ActionType::Spell => "Spell",
            ActionType::Other => "Other",
        }
    }

    /// Exact tag lookup (no keyword matching).
    pub fn parse(tag: &str) -> Option<Self> {
        Self::ORDER.into_iter().find(|action| action.as_str() == tag)
    }

    /// Whether rolls of this type are subdivided by detail key.
    pub fn has_details(self) -> bool {
        matches!(
            self,
            ActionType::Save | ActionType::Skill | ActionType::Check | ActionType::Ability
        )
    }

    /// Position in `ORDER`.
    pub fn rank(self) -> usize {
        Self::ORDER.iter().position(|a| *a == self).unwrap_or(Self::ORDER.len())
    }
}

impl std::fmt::Display for ActionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether a free-form action tag carries detail keys.
pub fn tag_has_details(tag: &str) -> bool {
    ActionType::parse(tag).is_some_and(ActionType::has_details)
}

/// Advantage state of a roll group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Advantage {
    Advantage,
    Disadvantage,
}

impl Advantage {
    /// Combines two states. Disadvantage wins over advantage, which wins over none.
    pub fn merge(current: Option<Advantage>, next: Option<Advantage>) -> Option<Advantage> {
        match (current, next) {
            (Some(Advantage::Disadvantage), _) | (_, Some(Advantage::Disadvantage)) => {
                Some(Advantage::Disadvantage)
            }
            (Some(Advantage::Advantage), _) | (_, Some(Advantage::Advantage)) => {
                Some(Advantage::Advantage)
            }
            (None, None) => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Advantage::Advantage => "advantage",
            Advantage::Disadvantage => "disadvantage",
        }
    }
}

/// Short codes used by item activities.
const SHORT_CODES: [(&str, ActionType); 7] = [
    ("mwak", ActionType::Attack),
    ("rwak", ActionType::Attack),
    ("msak", ActionType::Attack),
    ("rsak", ActionType::Attack),
    ("save", ActionType::Save),
    ("heal", ActionType::Heal),
    ("util", ActionType::Other),
];

/// Maps free text onto an action type.
pub fn normalize_action_type(raw: &str) -> ActionType {
    let value = raw.trim().to_lowercase();
    if value.is_empty() {
        return ActionType::Other;
    }
    if let Some((_, action)) = SHORT_CODES.iter().find(|(code, _)| *code == value) {
        return *action;
    }
    let has = |needle: &str| value.contains(needle);
    if has("attack") || has("atk") {
        ActionType::Attack
    } else if has("damage") || has("dmg") {
        ActionType::Damage
    } else if has("save") || has("saving") {
        ActionType::Save
    } else if has("skill") || has("perception") {
        ActionType::Skill
    } else if has("ability") || has("check") {
        ActionType::Check
    } else if has("initiative") || value == "init" {
        ActionType::Initiative
    } else if has("death") {
        ActionType::DeathSave
    } else if has("tool") {
        ActionType::Tool
    } else if has("heal") {
        ActionType::Heal
    } else if has("spell") {
        ActionType::Spell
    } else {
        ActionType::Other
    }
}

static PAREN_ADVANTAGE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\((?:disadvantage|advantage)\)").expect("valid regex"));
static WITH_ADVANTAGE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bwith\s+(?:disadvantage|advantage)\b").expect("valid regex"));
static SAVE_CHECK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(?:saving throw|ability check)\b").expect("valid regex"));
static SPACES: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\s{2,}").expect("valid regex"));

/// Removes "(advantage)" and "with advantage" style markers.
pub fn strip_advantage_markers(raw: &str) -> String {
    let stripped = PAREN_ADVANTAGE.replace_all(raw, " ");
    let stripped = WITH_ADVANTAGE.replace_all(&stripped, " ");
    SPACES.replace_all(&stripped, " ").trim().to_string()
}

fn strip_save_check_markers(raw: &str) -> String {
    let stripped = SAVE_CHECK.replace_all(raw, " ");
    SPACES.replace_all(&stripped, " ").trim().to_string()
}

/// Options object of a roll, resolving serialized rolls.
pub(crate) fn roll_options(roll: Option<&Value>) -> Value {
    roll.and_then(value::resolve_roll)
        .and_then(|resolved| resolved.get("options").filter(|o| o.is_object()).cloned())
        .unwrap_or(Value::Null)
}

fn first_classified<I>(candidates: I) -> Option<ActionType>
where
    I: IntoIterator<Item = String>,
{
    candidates
        .into_iter()
        .map(|candidate| normalize_action_type(&strip_advantage_markers(&candidate)))
        .find(|action| *action != ActionType::Other)
}

/// Event-level action type for a message (or workflow card) and its first roll.
pub fn extract_action_type(
    message: Option<&Value>,
    roll: Option<&Value>,
    meta: Option<&WorkflowMeta>,
) -> ActionType {
    let options = roll_options(roll);
    let message = message.unwrap_or(&NULL);

    let mut candidates: Vec<Option<String>> = vec![
        text_at(&options, &["rollType"]),
        text_at(&options, &["rolltype"]),
        text_at(&options, &["type"]),
        text_at(message, &["flags", "dnd5e", "roll", "type"]),
        text_at(message, &["flags", "dnd5e", "roll", "rollType"]),
        text_at(message, &["flags", "dnd5e", "activity", "type"]),
        text_at(message, &["flags", "midi-qol", "rollType"]),
        text_at(message, &["flags", "midi-qol", "type"]),
        text_at(message, &["flags", "midi-qol", "workflowType"]),
        text_at(message, &["flags", "pf2e", "context", "type"]),
        text_at(message, &["flags", "pf2e", "context", "action"]),
        text_at(message, &["flags", "pf2e", "context", "origin", "type"]),
        meta.and_then(|m| m.action_type.clone()),
    ];
    candidates.push(
        text_at(&options, &["flavor"])
            .or_else(|| text_at(message, &["flavor"]))
            .or_else(|| text_at(message, &["content"])),
    );

    first_classified(candidates.into_iter().flatten()).unwrap_or(ActionType::Other)
}

/// Action type of one roll within an event, falling back to the event's type.
pub fn resolve_roll_action_type(roll: &Value, fallback: ActionType) -> ActionType {
    let options = roll_options(Some(roll));
    let candidates = ["rollType", "rolltype", "type", "flavor"]
        .into_iter()
        .filter_map(|key| text_at(&options, &[key]));
    first_classified(candidates).unwrap_or(fallback)
}

/// Detail slug carried by alternate-system check contexts.
pub fn pf2e_detail(context: &Value, action: ActionType) -> Option<String> {
    let check = context
        .get("check")
        .filter(|c| value::truthy(c))
        .or_else(|| context.get("type"))
        .unwrap_or(&NULL);
    let from_check = || text_at(check, &["key"]).or_else(|| text_at(check, &["slug"]));
    match action {
        ActionType::Save => from_check()
            .or_else(|| text_at(context, &["save"]))
            .or_else(|| text_at(context, &["statistic"])),
        ActionType::Check | ActionType::Skill | ActionType::Ability => from_check()
            .or_else(|| text_at(context, &["skill"]))
            .or_else(|| text_at(context, &["statistic"])),
        _ => None,
    }
}

/// Detail key (which save, skill or ability) for a roll.
pub fn resolve_roll_detail_key(
    roll: &Value,
    action: ActionType,
    message: Option<&Value>,
    meta: Option<&WorkflowMeta>,
) -> Option<String> {
    if !action.has_details() {
        return None;
    }
    let options = roll_options(Some(roll));
    let context = meta
        .and_then(|m| m.pf2e_context.as_ref())
        .or_else(|| message.and_then(|m| path(m, &["flags", "pf2e", "context"])))
        .filter(|c| c.is_object());

    let candidates = [
        text_at(&options, &["flags", "dnd5e", "skillId"]),
        text_at(&options, &["flags", "dnd5e", "abilityId"]),
        text_at(&options, &["flags", "dnd5e", "ability"]),
        text_at(&options, &["flavor"]),
        message.and_then(|m| text_at(m, &["flavor"])),
        context.and_then(|c| pf2e_detail(c, action)),
    ];
    let candidate = candidates.into_iter().flatten().next()?;
    let detail = strip_save_check_markers(&strip_advantage_markers(&candidate)).to_lowercase();
    match detail.as_str() {
        "" | "save" | "saving-throw" => None,
        _ => Some(detail),
    }
}

fn advantage_flag(source: Option<&Value>) -> Option<Advantage> {
    let source = source.filter(|s| s.is_object())?;
    let present = |a: &str, b: &str| {
        source
            .get(a)
            .filter(|v| !v.is_null())
            .or_else(|| source.get(b))
            .cloned()
            .unwrap_or(Value::Null)
    };
    let disadvantage = present("disadvantage", "disadvantaged");
    let advantage = present("advantage", "advantaged");
    let is_set = |v: &Value| v.as_bool() == Some(true) || v.as_f64() == Some(1.0);

    if is_set(&disadvantage) {
        return Some(Advantage::Disadvantage);
    }
    if is_set(&advantage) {
        return Some(Advantage::Advantage);
    }
    if disadvantage.as_str().is_some_and(|s| s.to_lowercase().contains("dis")) {
        return Some(Advantage::Disadvantage);
    }
    if advantage.as_str().is_some_and(|s| s.to_lowercase().contains("adv")) {
        return Some(Advantage::Advantage);
    }

    let mode = ["advantageMode", "mode", "rollMode"]
        .into_iter()
        .filter_map(|key| source.get(key))
        .find(|v| value::truthy(v))?;
    match mode {
        Value::String(mode) => {
            let mode = mode.to_lowercase();
            if mode.contains("dis") {
                Some(Advantage::Disadvantage)
            } else if mode.contains("adv") {
                Some(Advantage::Advantage)
            } else {
                None
            }
        }
        Value::Number(n) => match n.as_f64() {
            Some(n) if n < 0.0 => Some(Advantage::Disadvantage),
            Some(n) if n > 0.0 => Some(Advantage::Advantage),
            _ => None,
        },
        _ => None,
    }
}

fn advantage_from_text(raw: &str) -> Option<Advantage> {
    let lowered = raw.to_lowercase();
    if lowered.contains("disadvantage") {
        Some(Advantage::Disadvantage)
    } else if lowered.contains("advantage") {
        Some(Advantage::Advantage)
    } else {
        None
    }
}

/// Advantage state of a roll: explicit flags first, then flavor/content text.
pub fn extract_advantage_state(roll: &Value, message: Option<&Value>) -> Option<Advantage> {
    let options = roll_options(Some(roll));
    let message = message.unwrap_or(&NULL);
    let sources = [
        Some(&options),
        path(&options, &["flags", "dnd5e", "roll"]),
        path(message, &["flags", "dnd5e", "roll"]),
        path(message, &["flags", "midi-qol"]),
    ];
    if let Some(flagged) = sources.into_iter().find_map(advantage_flag) {
        return Some(flagged);
    }

    let prose = [
        options.get("flavor"),
        message.get("flavor"),
        message.get("content"),
    ]
    .into_iter()
    .flatten()
    .filter_map(text)
    .collect::<Vec<_>>()
    .join(" ");
    advantage_from_text(&prose)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_normalize_action_type_keywords() {
        assert_eq!(normalize_action_type("mwak"), ActionType::Attack);
        assert_eq!(normalize_action_type("RSAK"), ActionType::Attack);
        assert_eq!(normalize_action_type("util"), ActionType::Other);
        assert_eq!(normalize_action_type("Damage Roll"), ActionType::Damage);
        assert_eq!(normalize_action_type("dmg"), ActionType::Damage);
        assert_eq!(normalize_action_type("saving-throw"), ActionType::Save);
        assert_eq!(normalize_action_type("skill-check"), ActionType::Skill);
        assert_eq!(normalize_action_type("perception"), ActionType::Skill);
        assert_eq!(normalize_action_type("ability"), ActionType::Check);
        assert_eq!(normalize_action_type("init"), ActionType::Initiative);
        assert_eq!(normalize_action_type("Death Saving Throw"), ActionType::Save);
        assert_eq!(normalize_action_type("death"), ActionType::DeathSave);
        assert_eq!(normalize_action_type("tool"), ActionType::Tool);
        assert_eq!(normalize_action_type("healing"), ActionType::Heal);
        assert_eq!(normalize_action_type("spell"), ActionType::Spell);
        assert_eq!(normalize_action_type(""), ActionType::Other);
        assert_eq!(normalize_action_type("whatever"), ActionType::Other);
    }

    #[test]
    fn test_action_type_serde_tags() {
        assert_eq!(serde_json::to_value(ActionType::DeathSave).unwrap(), json!("deathsave"));
        assert_eq!(ActionType::parse("deathsave"), Some(ActionType::DeathSave));
        assert_eq!(ActionType::parse("nope"), None);
        assert!(ActionType::Ability.has_details());
        assert!(!ActionType::Attack.has_details());
        assert_eq!(ActionType::Other.rank(), 11);
    }

    #[test]
    fn test_extract_action_type_prefers_roll_options() {
        let roll = json!({"options": {"rollType": "attack"}});
        let message = json!({"flags": {"dnd5e": {"roll": {"type": "damage"}}}});
        assert_eq!(
            extract_action_type(Some(&message), Some(&roll), None),
            ActionType::Attack
        );
    }

    #[test]
    fn test_extract_action_type_skips_other_candidates() {
        let roll = json!({"options": {"type": "mystery"}});
        let message = json!({"flags": {"midi-qol": {"workflowType": "Workflow"}, "dnd5e": {"activity": {"type": "save"}}}});
        assert_eq!(
            extract_action_type(Some(&message), Some(&roll), None),
            ActionType::Save
        );
    }

    #[test]
    fn test_extract_action_type_from_meta_and_flavor() {
        let meta = WorkflowMeta {
            action_type: Some("heal".into()),
            pf2e_context: None,
        };
        assert_eq!(extract_action_type(None, None, Some(&meta)), ActionType::Heal);

        let message = json!({"flavor": "Longsword - Attack Roll"});
        assert_eq!(extract_action_type(Some(&message), None, None), ActionType::Attack);
        assert_eq!(extract_action_type(None, None, None), ActionType::Other);
    }

    #[test]
    fn test_extract_action_type_serialized_roll() {
        let roll = json!(r#"{"options":{"rollType":"skill"}}"#);
        assert_eq!(extract_action_type(None, Some(&roll), None), ActionType::Skill);
        let broken = json!("{not json");
        assert_eq!(extract_action_type(None, Some(&broken), None), ActionType::Other);
    }

    #[test]
    fn test_resolve_roll_action_type_fallback() {
        let roll = json!({"options": {"flavor": "Fire Bolt - Damage"}});
        assert_eq!(resolve_roll_action_type(&roll, ActionType::Attack), ActionType::Damage);
        let bare = json!({"terms": []});
        assert_eq!(resolve_roll_action_type(&bare, ActionType::Attack), ActionType::Attack);
    }

    #[test]
    fn test_detail_saving_throw_is_suppressed() {
        let roll = json!({"options": {"flavor": "Saving Throw"}});
        assert_eq!(resolve_roll_detail_key(&roll, ActionType::Save, None, None), None);
        let roll = json!({"options": {"flags": {"dnd5e": {"ability": "save"}}}});
        assert_eq!(resolve_roll_detail_key(&roll, ActionType::Save, None, None), None);
    }

    #[test]
    fn test_detail_strips_markers() {
        let roll = json!({"options": {"flavor": "Dexterity Saving Throw (Advantage)"}});
        assert_eq!(
            resolve_roll_detail_key(&roll, ActionType::Save, None, None),
            Some("dexterity".to_string())
        );
        let roll = json!({"options": {"flags": {"dnd5e": {"skillId": "ste"}}, "flavor": "Stealth"}});
        assert_eq!(
            resolve_roll_detail_key(&roll, ActionType::Skill, None, None),
            Some("ste".to_string())
        );
        let message = json!({"flavor": "Athletics with advantage"});
        assert_eq!(
            resolve_roll_detail_key(&json!({}), ActionType::Skill, Some(&message), None),
            Some("athletics".to_string())
        );
    }

    #[test]
    fn test_detail_only_for_detail_actions() {
        let roll = json!({"options": {"flavor": "Longsword"}});
        assert_eq!(resolve_roll_detail_key(&roll, ActionType::Attack, None, None), None);
    }

    #[test]
    fn test_detail_from_pf2e_context() {
        let message = json!({"flags": {"pf2e": {"context": {"type": "saving-throw", "statistic": "reflex"}}}});
        assert_eq!(
            resolve_roll_detail_key(&json!({}), ActionType::Save, Some(&message), None),
            Some("reflex".to_string())
        );
        let context = json!({"check": {"slug": "Stealth"}});
        assert_eq!(pf2e_detail(&context, ActionType::Skill), Some("Stealth".to_string()));
        assert_eq!(pf2e_detail(&context, ActionType::Damage), None);
    }

    #[test]
    fn test_advantage_flags() {
        let roll = json!({"options": {"advantage": true}});
        assert_eq!(extract_advantage_state(&roll, None), Some(Advantage::Advantage));
        let roll = json!({"options": {"advantageMode": -1}});
        assert_eq!(extract_advantage_state(&roll, None), Some(Advantage::Disadvantage));
        let message = json!({"flags": {"midi-qol": {"disadvantage": 1}}});
        assert_eq!(
            extract_advantage_state(&json!({}), Some(&message)),
            Some(Advantage::Disadvantage)
        );
        let roll = json!({"options": {"rollMode": "publicroll"}});
        assert_eq!(extract_advantage_state(&roll, None), None);
    }

    #[test]
    fn test_advantage_text_fallback() {
        let message = json!({"flavor": "Perception (Disadvantage)"});
        assert_eq!(
            extract_advantage_state(&json!({}), Some(&message)),
            Some(Advantage::Disadvantage)
        );
        let message = json!({"content": "rolled with advantage"});
        assert_eq!(
            extract_advantage_state(&json!({}), Some(&message)),
            Some(Advantage::Advantage)
        );
    }

    #[test]
    fn test_advantage_merge_priority() {
        let adv = Some(Advantage::Advantage);
        let dis = Some(Advantage::Disadvantage);
        assert_eq!(Advantage::merge(None, None), None);
        assert_eq!(Advantage::merge(None, adv), adv);
        assert_eq!(Advantage::merge(adv, dis), dis);
        assert_eq!(Advantage::merge(dis, adv), dis);
        assert_eq!(Advantage::merge(dis, None), dis);
    }

    #[test]
    fn test_strip_advantage_markers() {
        assert_eq!(strip_advantage_markers("Attack (advantage)"), "Attack");
        assert_eq!(strip_advantage_markers("Save  with Disadvantage now"), "Save now");
    }
}
