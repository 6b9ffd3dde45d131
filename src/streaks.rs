/// Run-length tracking of extreme faces.
///
/// Every face in a payload's sequence updates three filter rows at once:
/// `all|all`, `<action>|all` and, when a detail is known, `<action>|<detail>`.
/// Queries then become plain key lookups.
use indexmap::IndexMap;

use crate::stats::{get_or_insert_default, StatsRecord, StreakEntry, StreakTable};

/// Wildcard used in filter keys.
pub const ALL: &str = "all";

/// Builds the `"<action>|<detail>"` key, substituting `all` for missing parts.
pub fn filter_key(action_type: Option<&str>, detail_key: Option<&str>) -> String {
    let action = action_type.filter(|a| !a.is_empty()).unwrap_or(ALL);
    let detail = detail_key.filter(|d| !d.is_empty()).unwrap_or(ALL);
    format!("{action}|{detail}")
}

/// Maximum face of a die key such as `d20`. Non-digits are ignored.
pub fn die_faces(die_key: &str) -> Option<i64> {
    let digits: String = die_key.chars().filter(char::is_ascii_digit).collect();
    digits.parse::<i64>().ok().filter(|faces| *faces > 0)
}

impl StreakEntry {
    /// Advances both runs with one face value.
    pub fn apply(&mut self, value: i64, faces: i64) {
        if value == 1 {
            self.current_min += 1;
            self.longest_min = self.longest_min.max(self.current_min);
        } else {
            self.current_min = 0;
        }
        if value == faces {
            self.current_max += 1;
            self.longest_max = self.longest_max.max(self.current_max);
        } else {
            self.current_max = 0;
        }
    }

    /// Folds the historical maxima of `source` into `self`.
    pub fn merge_longest(&mut self, source: &StreakEntry) {
        self.longest_min = self.longest_min.max(source.longest_min);
        self.longest_max = self.longest_max.max(source.longest_max);
    }
}

pub fn ensure_entry<'a>(
    stats: &'a mut StatsRecord,
    action_type: Option<&str>,
    detail_key: Option<&str>,
    die_key: &str,
) -> &'a mut StreakEntry {
    let row = get_or_insert_default(&mut stats.streaks, &filter_key(action_type, detail_key));
    get_or_insert_default(row, die_key)
}

/// Applies an ordered per-die sequence to the streak table of `stats`.
pub fn apply_streaks_for_sequence(
    stats: &mut StatsRecord,
    action_type: &str,
    sequence: &IndexMap<String, Vec<i64>>,
    detail_key: Option<&str>,
) {
    let mut filters: Vec<(Option<&str>, Option<&str>)> = vec![(None, None), (Some(action_type), None)];
    if detail_key.is_some_and(|d| !d.is_empty()) {
        filters.push((Some(action_type), detail_key));
    }

    for (die_key, values) in sequence {
        let Some(faces) = die_faces(die_key) else {
            continue;
        };
        for value in values {
            for (action, detail) in &filters {
                ensure_entry(stats, *action, *detail, die_key).apply(*value, faces);
            }
        }
    }
}

/// Combines streak tables across independent timelines.
///
/// Only the longest runs are carried; entries created here start with zero
/// in-progress counters.
pub fn merge_streaks_max(target: &mut StreakTable, source: &StreakTable) {
    for (filter, dies) in source {
        let row = get_or_insert_default(target, filter);
        for (die_key, entry) in dies {
            get_or_insert_default(row, die_key).merge_longest(entry);
        }
    }
}
