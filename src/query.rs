/// Read-side projections over `GlobalStats`.
///
/// Everything here is pure: views are built from the stored shards on demand
/// and never written back.
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet, HashSet};

use crate::config::Settings;
use crate::identity::Identity;
use crate::normalizer::classify::tag_has_details;
use crate::normalizer::ActionType;
use crate::stats::{ActionStat, DieStat, GlobalStats, StatsRecord, StreakEntry};
use crate::streaks::{filter_key, ALL};

/// Which sessions a view covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionFilter {
    All,
    Today,
    Date(String),
}

impl SessionFilter {
    /// Parses `all`, `today` or a literal date key.
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "" | ALL => SessionFilter::All,
            "today" => SessionFilter::Today,
            date => SessionFilter::Date(date.to_string()),
        }
    }

    /// Concrete date key, or None for all sessions.
    pub fn date_key(&self, today: &str) -> Option<String> {
        match self {
            SessionFilter::All => None,
            SessionFilter::Today => Some(today.to_string()),
            SessionFilter::Date(date) => Some(date.clone()),
        }
    }
}

/// Whose rolls a view covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserFilter {
    All,
    User(String),
}

impl UserFilter {
    pub fn parse(raw: &str) -> Self {
        match raw.trim() {
            "" | ALL => UserFilter::All,
            user => UserFilter::User(user.to_string()),
        }
    }
}

/// Record restricted to one action type.
///
/// Totals come from the action's own counters; unknown actions give an empty record.
pub fn action_view(stats: &StatsRecord, action_type: &str) -> StatsRecord {
    let mut scoped = StatsRecord::new();
    scoped.updated_at = stats.updated_at;
    let Some(action) = stats.actions.get(action_type) else {
        return scoped;
    };
    scoped.totals.rolls = action.rolls;
    scoped.totals.dice = action.count;
    scoped.dice = action.dice.clone();
    scoped.actions.insert(action_type.to_string(), action.clone());
    scoped
}

/// Record restricted to one detail of a detail-carrying action.
pub fn detail_view(stats: &StatsRecord, action_type: &str, detail_key: &str) -> StatsRecord {
    let mut scoped = StatsRecord::new();
    scoped.updated_at = stats.updated_at;
    let Some(detail) = stats
        .actions
        .get(action_type)
        .and_then(|action| action.details.get(detail_key))
    else {
        return scoped;
    };
    scoped.totals.rolls = detail.rolls;
    scoped.totals.dice = detail.count;
    scoped.dice = detail.dice.clone();
    scoped.actions.insert(
        action_type.to_string(),
        ActionStat {
            rolls: detail.rolls,
            count: detail.count,
            dice: detail.dice.clone(),
            details: BTreeMap::from([(detail_key.to_string(), detail.clone())]),
        },
    );
    scoped
}

/// Applies an action filter, then a detail filter when the action carries details.
pub fn filtered_view(stats: &StatsRecord, action_filter: &str, detail_filter: &str) -> StatsRecord {
    let scoped = if action_filter == ALL {
        stats.clone()
    } else {
        action_view(stats, action_filter)
    };
    if detail_filter == ALL || detail_filter.is_empty() || !tag_has_details(action_filter) {
        return scoped;
    }
    detail_view(&scoped, action_filter, detail_filter)
}

fn merge_visible<'a>(
    records: impl Iterator<Item = (&'a String, &'a StatsRecord)>,
    hidden: &HashSet<String>,
) -> StatsRecord {
    let mut merged = StatsRecord::new();
    for (user_id, stats) in records {
        if hidden.contains(user_id) {
            continue;
        }
        merged.merge(stats);
        merged.updated_at = merged.updated_at.max(stats.updated_at);
    }
    merged
}

/// The record a report shows for a user and session selection.
///
/// With no hidden users the precomputed combined scopes are used; otherwise
/// the visible users' shards are merged.
pub fn stats_for_session(
    global: &GlobalStats,
    user: &UserFilter,
    session: &SessionFilter,
    hidden: &HashSet<String>,
    today: &str,
) -> StatsRecord {
    match (session.date_key(today), user) {
        (None, UserFilter::User(user_id)) => global.user_stats(user_id),
        (None, UserFilter::All) if hidden.is_empty() => global.aggregate.clone(),
        (None, UserFilter::All) => merge_visible(global.users.iter(), hidden),
        (Some(date), UserFilter::All) if hidden.is_empty() => {
            global.by_date.get(&date).cloned().unwrap_or_default()
        }
        (Some(date), UserFilter::All) => merge_visible(
            global
                .users_by_date
                .iter()
                .filter_map(|(user_id, dates)| dates.get(&date).map(|stats| (user_id, stats))),
            hidden,
        ),
        (Some(date), UserFilter::User(user_id)) => global
            .users_by_date
            .get(user_id)
            .and_then(|dates| dates.get(&date))
            .cloned()
            .unwrap_or_default(),
    }
}

/// Per-date records for one user, or merged across visible users.
pub fn all_session_stats(
    global: &GlobalStats,
    user: &UserFilter,
    hidden: &HashSet<String>,
) -> BTreeMap<String, StatsRecord> {
    if let UserFilter::User(user_id) = user {
        return global.users_by_date.get(user_id).cloned().unwrap_or_default();
    }
    let mut merged: BTreeMap<String, StatsRecord> = BTreeMap::new();
    for (user_id, dates) in &global.users_by_date {
        if hidden.contains(user_id) {
            continue;
        }
        for (date_key, stats) in dates {
            let target = merged.entry(date_key.clone()).or_default();
            target.merge(stats);
            target.updated_at = target.updated_at.max(stats.updated_at);
        }
    }
    merged
}

/// Session dates with at least one roll from a visible user.
pub fn visible_session_dates(global: &GlobalStats, hidden: &HashSet<String>) -> Vec<String> {
    if hidden.is_empty() {
        return global.by_date.keys().cloned().collect();
    }
    let dates: BTreeSet<&String> = global
        .users_by_date
        .iter()
        .filter(|(user_id, _)| !hidden.contains(*user_id))
        .flat_map(|(_, dates)| dates.iter())
        .filter(|(_, stats)| stats.totals.rolls > 0 || stats.totals.dice > 0)
        .map(|(date_key, _)| date_key)
        .collect();
    dates.into_iter().cloned().collect()
}

/// Streak table combined from several users for one session selection.
///
/// Only longest runs survive; the result carries no other counters.
pub fn streak_source(
    global: &GlobalStats,
    user_ids: &[String],
    session: &SessionFilter,
    today: &str,
) -> StatsRecord {
    let mut merged = StatsRecord::new();
    let date = session.date_key(today);
    for user_id in user_ids.iter().filter(|id| !id.is_empty()) {
        let stats = match &date {
            Some(date) => global.users_by_date.get(user_id).and_then(|dates| dates.get(date)),
            None => global.users.get(user_id),
        };
        if let Some(stats) = stats {
            crate::streaks::merge_streaks_max(&mut merged.streaks, &stats.streaks);
        }
    }
    merged
}

/// Looks up the streak entry matching a report's filters.
///
/// The detail filter only narrows the row for detail-carrying actions.
pub fn streak_entry_for_filters(
    stats: &StatsRecord,
    action_filter: &str,
    detail_filter: &str,
    die_key: &str,
) -> Option<StreakEntry> {
    if die_key.is_empty() {
        return None;
    }
    let action = Some(action_filter).filter(|a| !a.is_empty() && *a != ALL);
    let detail = action
        .filter(|a| tag_has_details(a))
        .and(Some(detail_filter))
        .filter(|d| !d.is_empty() && *d != ALL);
    stats
        .streaks
        .get(&filter_key(action, detail))
        .and_then(|dies| dies.get(die_key))
        .copied()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DieSummary {
    pub avg: f64,
    pub min: f64,
    pub max: f64,
    pub q1: f64,
    pub q3: f64,
    pub count: u64,
}

/// Smallest face whose cumulative count reaches `quantile` of the total.
pub fn quantile_from_results(results: &BTreeMap<String, u64>, quantile: f64) -> Option<f64> {
    let mut entries: Vec<(f64, u64)> = results
        .iter()
        .filter_map(|(face, count)| {
            let face = face.trim().parse::<f64>().ok().filter(|f| f.is_finite())?;
            (*count > 0).then_some((face, *count))
        })
        .collect();
    entries.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(Ordering::Equal));
    let total: u64 = entries.iter().map(|(_, count)| count).sum();
    if total == 0 {
        return None;
    }

    let threshold = quantile * total as f64;
    let mut cumulative = 0u64;
    for (face, count) in &entries {
        cumulative += count;
        if cumulative as f64 >= threshold {
            return Some(*face);
        }
    }
    entries.last().map(|(face, _)| *face)
}

pub fn die_summary(die: &DieStat) -> Option<DieSummary> {
    if die.count == 0 {
        return None;
    }
    let avg = die.sum as f64 / die.count as f64;
    let min = die.min.map_or(avg, |min| min as f64);
    let max = die.max.map_or(avg, |max| max as f64);
    Some(DieSummary {
        avg,
        min,
        max,
        q1: quantile_from_results(&die.results, 0.25).unwrap_or(min),
        q3: quantile_from_results(&die.results, 0.75).unwrap_or(max),
        count: die.count,
    })
}

/// Users excluded from aggregate views for the current viewer.
///
/// Players also lose every GM unless GM statistics are shared.
pub fn hidden_user_ids(settings: &Settings, identity: &dyn Identity) -> HashSet<String> {
    let mut hidden: HashSet<String> = settings.hidden_players.iter().cloned().collect();
    if !settings.allow_players_see_gm_stats && !identity.current_is_gm() {
        hidden.extend(
            identity
                .users()
                .into_iter()
                .filter(|user| user.is_gm)
                .map(|user| user.id),
        );
    }
    hidden
}

/// Action with the most dice rolled. The first one wins ties.
pub fn most_frequent_action(actions: &BTreeMap<String, ActionStat>) -> Option<&str> {
    let mut top: Option<(&str, u64)> = None;
    for (action_type, stats) in actions {
        if top.map_or(true, |(_, best)| stats.count > best) {
            top = Some((action_type, stats.count));
        }
    }
    top.map(|(action_type, _)| action_type)
}

fn die_number(die_key: &str) -> u64 {
    let digits: String = die_key.chars().filter(char::is_ascii_digit).collect();
    digits.parse().unwrap_or(0)
}

/// Orders die keys by face count (`d4` before `d20`).
pub fn sort_die_keys(keys: &mut [String]) {
    keys.sort_by_key(|key| die_number(key));
}

fn compare_actions(a: &str, b: &str) -> Ordering {
    match (ActionType::parse(a), ActionType::parse(b)) {
        (Some(a), Some(b)) => a.rank().cmp(&b.rank()),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.cmp(b),
    }
}

/// Canonical action order; unknown tags follow alphabetically.
pub fn sort_action_keys(keys: &mut [String]) {
    keys.sort_by(|a, b| compare_actions(a, b));
}

/// Display label for a tag, falling back to the tag itself.
pub fn action_label(action_type: &str) -> String {
    ActionType::parse(action_type)
        .map(|action| action.label().to_string())
        .unwrap_or_else(|| action_type.to_string())
}

fn title_case(raw: &str) -> String {
    raw.split(|c: char| !c.is_ascii_alphanumeric())
        .filter(|segment| !segment.is_empty())
        .map(|segment| {
            let lower = segment.to_lowercase();
            let mut chars = lower.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Labels `kind:value` detail keys (`save:dex` → `Dex Save`); other keys pass through.
pub fn format_detail_label(detail_key: &str) -> String {
    let Some((kind, value)) = detail_key.split_once(':') else {
        return detail_key.to_string();
    };
    let label = if value.is_empty() {
        detail_key.to_string()
    } else {
        title_case(value)
    };
    match kind {
        "save" => format!("{label} Save"),
        "skill" => format!("{label} Skill"),
        "ability" => format!("{label} Check"),
        _ => detail_key.to_string(),
    }
}
