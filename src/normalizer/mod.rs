/// Roll normalizer: raw chat messages and automation workflows → `RollPayload`s.
///
/// One event yields one payload per distinct `(action, detail)` pair found
/// among its rolls. Rolls sharing a pair are merged by face-count addition and
/// sequence concatenation.
pub mod classify;
pub mod faces;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::value::{self, text_at};
use crate::visibility::VisibilityInfo;

pub use classify::{
    extract_action_type, extract_advantage_state, normalize_action_type, resolve_roll_action_type,
    resolve_roll_detail_key, ActionType, Advantage,
};
pub use faces::{ResultCounts, ResultSequence};

/// Canonical contribution of one `(action, detail)` group of a roll event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RollPayload {
    pub user_id: Option<String>,
    pub action_type: Option<String>,
    pub detail_key: Option<String>,
    /// Roll objects that contributed dice.
    pub rolls: u64,
    pub results: Option<ResultCounts>,
    pub sequence: ResultSequence,
    pub advantage: Option<Advantage>,
    pub visibility: Option<VisibilityInfo>,
    pub message_id: Option<String>,
    /// Session date override; the engine uses the current day when absent.
    pub date_key: Option<String>,
}

impl RollPayload {
    fn empty(action: ActionType, user_id: Option<&str>) -> Self {
        RollPayload {
            user_id: user_id.map(str::to_string),
            action_type: Some(action.as_str().to_string()),
            results: Some(ResultCounts::new()),
            ..Default::default()
        }
    }

    /// Grouping key `"<action>|<detail-or-all>"`.
    pub fn group_key(&self) -> String {
        crate::streaks::filter_key(self.action_type.as_deref(), self.detail_key.as_deref())
    }

    /// Number of individual faces carried.
    pub fn dice_count(&self) -> u64 {
        self.results.as_ref().map(faces::total_faces).unwrap_or(0)
    }
}

/// Classification hints recorded from an automation workflow for its chat card.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WorkflowMeta {
    pub action_type: Option<String>,
    pub pf2e_context: Option<Value>,
}

impl WorkflowMeta {
    pub fn from_workflow(workflow: &Value) -> Self {
        WorkflowMeta {
            action_type: Some(workflow_action_type(workflow).as_str().to_string()),
            pf2e_context: workflow.get("pf2eContext").filter(|c| c.is_object()).cloned(),
        }
    }
}

/// Rolls attached to a chat message: `rolls`, `rolls.contents`, or a lone `roll`.
pub fn rolls_from_message(message: &Value) -> &[Value] {
    let rolls = value::list(message.get("rolls"));
    if !rolls.is_empty() {
        return rolls;
    }
    match message.get("roll") {
        Some(roll) if value::truthy(roll) => std::slice::from_ref(roll),
        _ => &[],
    }
}

/// Identifier of a chat message.
pub fn message_id(message: &Value) -> Option<String> {
    text_at(message, &["id"]).or_else(|| text_at(message, &["_id"]))
}

/// Rolls referenced by a workflow, in discovery order, without duplicates.
///
/// The same roll is often reachable under several fields (`attackRoll` is also
/// in `rolls`), so structurally equal entries are kept once.
pub fn collect_workflow_rolls(workflow: &Value) -> Vec<&Value> {
    let mut rolls: Vec<&Value> = Vec::new();
    rolls.extend(value::list(workflow.get("rolls")));
    rolls.extend(workflow.get("attackRoll"));
    rolls.extend(value::list(workflow.get("damageRolls")));
    rolls.extend(workflow.get("damageRoll"));
    rolls.extend(workflow.get("saveRoll"));
    rolls.extend(value::list(workflow.get("saves")));

    let mut unique: Vec<&Value> = Vec::with_capacity(rolls.len());
    for roll in rolls {
        if !value::truthy(roll) || unique.contains(&roll) {
            continue;
        }
        unique.push(roll);
    }
    unique
}

/// Action hint of a workflow: `rollType`, `workflowType`, or the item's action type.
pub fn workflow_action_type(workflow: &Value) -> ActionType {
    let hint = text_at(workflow, &["rollType"])
        .or_else(|| text_at(workflow, &["workflowType"]))
        .or_else(|| text_at(workflow, &["item", "system", "actionType"]))
        .unwrap_or_default();
    normalize_action_type(&hint)
}

/// Chat card id of a workflow.
pub fn workflow_message_id(workflow: &Value) -> Option<String> {
    text_at(workflow, &["itemCardId"])
        .or_else(|| text_at(workflow, &["chatMessageId"]))
        .or_else(|| text_at(workflow, &["messageId"]))
}

/// Groups rolls into payloads by `(action, detail)` in first-seen order.
///
/// Groups whose rolls carried no dice results are dropped.
pub fn build_payloads_from_rolls<'a, I>(
    rolls: I,
    fallback_action: ActionType,
    user_id: Option<&str>,
    message: Option<&Value>,
    meta: Option<&WorkflowMeta>,
) -> Vec<RollPayload>
where
    I: IntoIterator<Item = &'a Value>,
{
    let visibility = message.map(|m| VisibilityInfo::from_message(m, user_id));
    let source_id = message.and_then(message_id);
    let mut groups: IndexMap<String, RollPayload> = IndexMap::new();

    for roll in rolls {
        if !value::truthy(roll) {
            continue;
        }
        let action = resolve_roll_action_type(roll, fallback_action);
        let detail_key = resolve_roll_detail_key(roll, action, message, meta);
        let advantage = extract_advantage_state(roll, message);

        let key = crate::streaks::filter_key(Some(action.as_str()), detail_key.as_deref());
        let payload = groups
            .entry(key)
            .or_insert_with(|| RollPayload::empty(action, user_id));
        payload.detail_key = detail_key;
        payload.advantage = Advantage::merge(payload.advantage, advantage);
        if payload.visibility.is_none() {
            payload.visibility = visibility.clone();
        }
        if payload.message_id.is_none() {
            payload.message_id = source_id.clone();
        }

        let (counts, sequence) = faces::counts_and_sequence(roll);
        if counts.is_empty() {
            continue;
        }
        if let Some(results) = payload.results.as_mut() {
            faces::merge_result_counts(results, &counts);
        }
        faces::merge_result_sequences(&mut payload.sequence, &sequence);
        payload.rolls += 1;
    }

    groups.into_values().filter(|payload| payload.rolls > 0).collect()
}

/// Payloads of a chat message attributed to `user_id`.
pub fn payloads_from_message(
    message: &Value,
    user_id: Option<&str>,
    meta: Option<&WorkflowMeta>,
) -> Vec<RollPayload> {
    let rolls = rolls_from_message(message);
    let action = extract_action_type(Some(message), rolls.first(), meta);
    build_payloads_from_rolls(rolls, action, user_id, Some(message), meta)
}

/// Payloads of an automation workflow attributed to `user_id`.
///
/// Workflow payloads carry the chat card id so relayed copies can be
/// de-duplicated against the card's own message event.
pub fn payloads_from_workflow(workflow: &Value, user_id: Option<&str>) -> Vec<RollPayload> {
    let meta = WorkflowMeta::from_workflow(workflow);
    let action = workflow_action_type(workflow);
    let card_id = workflow_message_id(workflow);
    let mut payloads =
        build_payloads_from_rolls(collect_workflow_rolls(workflow), action, user_id, None, Some(&meta));
    for payload in &mut payloads {
        payload.message_id = card_id.clone();
    }
    payloads
}
