/// Aggregation engine.
///
/// Folds normalized roll payloads into the four scopes of `GlobalStats`
/// (all-time, per user, per date, per user per date) and rebuilds derived
/// scopes after resets.
use tracing::{debug, info};

use crate::normalizer::classify::tag_has_details;
use crate::normalizer::{ResultCounts, RollPayload};
use crate::stats::{ensure_die, get_or_insert_default, is_plausible_face, GlobalStats, StatsRecord, MAX_FACE_COUNT};
use crate::streaks::apply_streaks_for_sequence;

/// Records a face histogram into one record at die, action and detail level.
///
/// `roll_count` roll events are added to the totals; every face adds to the
/// dice counters. Details are only kept for action types that have them.
pub fn record_result_counts(
    stats: &mut StatsRecord,
    action_type: &str,
    results: &ResultCounts,
    roll_count: u64,
    detail_key: Option<&str>,
) {
    let detail_key = detail_key.filter(|d| !d.is_empty() && tag_has_details(action_type));

    stats.totals.rolls = stats.totals.rolls.saturating_add(roll_count);
    let action = stats.ensure_action(action_type);
    action.rolls = action.rolls.saturating_add(roll_count);
    if let Some(detail) = detail_key {
        let detail = action.ensure_detail(detail);
        detail.rolls = detail.rolls.saturating_add(roll_count);
    }

    for (die_key, faces) in results {
        for (face, count) in faces {
            let Ok(value) = face.trim().parse::<i64>() else {
                continue;
            };
            if *count == 0 {
                continue;
            }
            stats.totals.dice = stats.totals.dice.saturating_add(*count);
            ensure_die(&mut stats.dice, die_key).record(value, *count);

            let action = stats.ensure_action(action_type);
            action.count = action.count.saturating_add(*count);
            ensure_die(&mut action.dice, die_key).record(value, *count);

            if let Some(detail) = detail_key {
                let detail = action.ensure_detail(detail);
                detail.count = detail.count.saturating_add(*count);
                ensure_die(&mut detail.dice, die_key).record(value, *count);
            }
        }
    }
}

fn apply_to(target: &mut StatsRecord, payload: &ValidPayload<'_>, now_ms: i64) {
    record_result_counts(
        target,
        payload.action_type,
        payload.results,
        payload.roll_count,
        payload.detail_key,
    );
    apply_streaks_for_sequence(target, payload.action_type, payload.sequence, payload.detail_key);
    target.updated_at = now_ms;
}

/// Borrowed view of a payload that passed validation.
struct ValidPayload<'a> {
    user_id: &'a str,
    action_type: &'a str,
    detail_key: Option<&'a str>,
    results: &'a ResultCounts,
    sequence: &'a crate::normalizer::ResultSequence,
    roll_count: u64,
    date_key: &'a str,
}

impl<'a> ValidPayload<'a> {
    fn from_payload(payload: &'a RollPayload, default_date: &'a str) -> Option<Self> {
        let user_id = payload.user_id.as_deref().filter(|u| !u.is_empty())?;
        let action_type = payload.action_type.as_deref().filter(|a| !a.is_empty())?;
        let results = payload.results.as_ref()?;
        if payload.rolls > MAX_FACE_COUNT || !results_are_plausible(results) {
            return None;
        }
        Some(ValidPayload {
            user_id,
            action_type,
            detail_key: payload
                .detail_key
                .as_deref()
                .filter(|d| !d.is_empty() && tag_has_details(action_type)),
            results,
            sequence: &payload.sequence,
            roll_count: payload.rolls.max(1),
            date_key: payload
                .date_key
                .as_deref()
                .filter(|d| !d.is_empty())
                .unwrap_or(default_date),
        })
    }
}

/// Numeric faces must be rollable on their die. Unparsable faces and zero
/// counts are ignored later by `record_result_counts`.
fn results_are_plausible(results: &ResultCounts) -> bool {
    results.iter().all(|(die_key, faces)| {
        faces.iter().all(|(face, count)| match face.trim().parse::<i64>() {
            Ok(value) => *count == 0 || is_plausible_face(die_key, value, *count),
            Err(_) => true,
        })
    })
}

/// Applies payloads to every scope. Malformed payloads are skipped.
///
/// Returns the number of payloads applied.
pub fn apply_payloads(
    global: &mut GlobalStats,
    payloads: &[RollPayload],
    date_key: &str,
    now_ms: i64,
) -> usize {
    let mut applied = 0;
    for payload in payloads {
        let Some(valid) = ValidPayload::from_payload(payload, date_key) else {
            debug!(
                "Skipping malformed payload (user={:?}, action={:?}, results={})",
                payload.user_id,
                payload.action_type,
                payload.results.is_some()
            );
            continue;
        };

        apply_to(&mut global.aggregate, &valid, now_ms);
        apply_to(get_or_insert_default(&mut global.users, valid.user_id), &valid, now_ms);
        apply_to(get_or_insert_default(&mut global.by_date, valid.date_key), &valid, now_ms);
        let user_dates = get_or_insert_default(&mut global.users_by_date, valid.user_id);
        apply_to(get_or_insert_default(user_dates, valid.date_key), &valid, now_ms);
        applied += 1;
    }
    if applied > 0 {
        global.aggregate.updated_at = now_ms;
    }
    applied
}

/// Rebuilds the all-time record and the per-date records from the per-user shards.
///
/// Streak tables of rebuilt records only keep longest runs.
pub fn recompute_global(global: &mut GlobalStats) {
    let mut aggregate = StatsRecord::new();
    for stats in global.users.values() {
        aggregate.merge(stats);
        aggregate.updated_at = aggregate.updated_at.max(stats.updated_at);
    }

    let mut by_date = std::collections::BTreeMap::new();
    for dates in global.users_by_date.values() {
        for (date_key, stats) in dates {
            let merged: &mut StatsRecord = get_or_insert_default(&mut by_date, date_key);
            merged.merge(stats);
            merged.updated_at = merged.updated_at.max(stats.updated_at);
        }
    }

    global.aggregate = aggregate;
    global.by_date = by_date;
}

/// Removes one user's shards and rebuilds the combined scopes.
///
/// Returns false if the user had no statistics.
pub fn reset_user(global: &mut GlobalStats, user_id: &str) -> bool {
    let had_user = global.users.remove(user_id).is_some();
    let had_dates = global.users_by_date.remove(user_id).is_some();
    if !had_user && !had_dates {
        return false;
    }
    recompute_global(global);
    info!("Reset statistics for user {}", user_id);
    true
}

pub fn reset_all(global: &mut GlobalStats) {
    *global = GlobalStats::new();
    info!("Reset all statistics");
}
