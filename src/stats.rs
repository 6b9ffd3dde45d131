/// Aggregate data model for dice statistics.
///
/// A `StatsRecord` is the unit of aggregation: totals, per-die histograms,
/// per-action breakdowns and streak tables. `GlobalStats` wraps the all-time
/// record together with its per-user, per-date and per-user-per-date shards.
///
/// Records are plain serializable data. Deserialization always goes through
/// `normalize`, so stored objects from older versions (or garbage) load as
/// well-formed records instead of failing.
use anyhow::{Context, Result};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;

use crate::value;

#[cfg(test)]
use anyhow::{anyhow, bail};
#[cfg(test)]
use jsonschema::{Draft, JSONSchema};

/// Current schema tag written into every record.
pub const SCHEMA_VERSION: u32 = 1;

/// Upper bound on how often a single face can be reported at once.
pub const MAX_FACE_COUNT: u64 = u32::MAX as u64;

/// Die key → streak entry.
pub type DieStreaks = BTreeMap<String, StreakEntry>;

/// Filter key (`"<action>|<detail>"`) → die key → streak entry.
pub type StreakTable = BTreeMap<String, DieStreaks>;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Totals {
    /// Roll events recorded.
    pub rolls: u64,
    /// Individual die results recorded.
    pub dice: u64,
}

/// Histogram and extremes for one die shape.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DieStat {
    pub count: u64,
    pub sum: i64,
    pub min: Option<i64>,
    pub max: Option<i64>,
    /// Face value (as text) → times rolled.
    pub results: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DetailStat {
    pub rolls: u64,
    pub count: u64,
    pub dice: BTreeMap<String, DieStat>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionStat {
    pub rolls: u64,
    pub count: u64,
    pub dice: BTreeMap<String, DieStat>,
    pub details: BTreeMap<String, DetailStat>,
}

/// Run-length counters for minimum and maximum faces on one die.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreakEntry {
    pub current_min: u64,
    pub current_max: u64,
    pub longest_min: u64,
    pub longest_max: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatsRecord {
    pub v: u32,
    /// Milliseconds since the Unix epoch of the last mutation.
    pub updated_at: i64,
    pub totals: Totals,
    pub dice: BTreeMap<String, DieStat>,
    pub actions: BTreeMap<String, ActionStat>,
    pub streaks: StreakTable,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GlobalStats {
    #[serde(flatten)]
    pub aggregate: StatsRecord,
    pub users: BTreeMap<String, StatsRecord>,
    pub by_date: BTreeMap<String, StatsRecord>,
    pub users_by_date: BTreeMap<String, BTreeMap<String, StatsRecord>>,
}

/// Returns the entry for `key`, inserting `V::default()` on first access.
pub fn get_or_insert_default<'a, V: Default>(
    map: &'a mut BTreeMap<String, V>,
    key: &str,
) -> &'a mut V {
    map.entry(key.to_string()).or_default()
}

/// True when `count` rolls of `value` can come from the die `die_key`.
///
/// Dice with a numeric size only roll `1..=faces`. Other shapes (fudge dice)
/// are only bounded in magnitude.
pub fn is_plausible_face(die_key: &str, value: i64, count: u64) -> bool {
    if count == 0 || count > MAX_FACE_COUNT {
        return false;
    }
    match crate::streaks::die_faces(die_key) {
        Some(faces) => (1..=faces).contains(&value),
        None => value.unsigned_abs() <= MAX_FACE_COUNT,
    }
}

/// Lazily creates the die histogram for `die_key` inside `container`.
pub fn ensure_die<'a>(container: &'a mut BTreeMap<String, DieStat>, die_key: &str) -> &'a mut DieStat {
    get_or_insert_default(container, die_key)
}

impl DieStat {
    /// Folds `count` occurrences of face `value` into the histogram.
    pub fn record(&mut self, value: i64, count: u64) {
        if count == 0 {
            return;
        }
        self.count = self.count.saturating_add(count);
        self.sum = self.sum.saturating_add(value.saturating_mul(saturating_i64(count)));
        self.min = Some(self.min.map_or(value, |min| min.min(value)));
        self.max = Some(self.max.map_or(value, |max| max.max(value)));
        let times = self.results.entry(value.to_string()).or_insert(0);
        *times = times.saturating_add(count);
    }

    pub fn merge(&mut self, source: &DieStat) {
        self.count = self.count.saturating_add(source.count);
        self.sum = self.sum.saturating_add(source.sum);
        if let Some(min) = source.min {
            self.min = Some(self.min.map_or(min, |current| current.min(min)));
        }
        if let Some(max) = source.max {
            self.max = Some(self.max.map_or(max, |current| current.max(max)));
        }
        for (face, count) in &source.results {
            if *count == 0 {
                continue;
            }
            let times = self.results.entry(face.clone()).or_insert(0);
            *times = times.saturating_add(*count);
        }
    }

    /// Checks `count == Σ results` and `sum == Σ face * count`.
    pub fn is_consistent(&self) -> bool {
        let mut count = 0u64;
        let mut sum = 0i64;
        for (face, times) in &self.results {
            let Ok(face) = face.parse::<i64>() else {
                return false;
            };
            count = count.saturating_add(*times);
            sum = sum.saturating_add(face.saturating_mul(saturating_i64(*times)));
        }
        count == self.count && sum == self.sum
    }

    /// Rebuilds a histogram from raw JSON.
    ///
    /// Only the face histogram is trusted: count, sum and extremes are derived
    /// from it so the count invariant holds for any input. Faces the die
    /// `die_key` cannot roll are dropped.
    pub fn normalize(die_key: &str, raw: &Value) -> Self {
        let mut stat = DieStat::default();
        let Some(results) = value::object(raw.get("results")) else {
            return stat;
        };
        for (face, times) in results {
            let Some(face) = face.trim().parse::<f64>().ok().filter(|f| f.is_finite() && f.fract() == 0.0) else {
                continue;
            };
            let (face, times) = (face as i64, value::count(Some(times)));
            if !is_plausible_face(die_key, face, times) {
                continue;
            }
            stat.record(face, times);
        }
        stat
    }
}

fn saturating_i64(count: u64) -> i64 {
    i64::try_from(count).unwrap_or(i64::MAX)
}

fn normalize_dice(raw: Option<&Value>) -> BTreeMap<String, DieStat> {
    value::object(raw)
        .map(|dice| {
            dice.iter()
                .filter(|(key, _)| !key.is_empty())
                .map(|(key, die)| (key.clone(), DieStat::normalize(key, die)))
                .collect()
        })
        .unwrap_or_default()
}

fn merge_dice(target: &mut BTreeMap<String, DieStat>, source: &BTreeMap<String, DieStat>) {
    for (die_key, die) in source {
        ensure_die(target, die_key).merge(die);
    }
}

impl DetailStat {
    pub fn normalize(raw: &Value) -> Self {
        DetailStat {
            rolls: value::count(raw.get("rolls")),
            count: value::count(raw.get("count")),
            dice: normalize_dice(raw.get("dice")),
        }
    }

    pub fn merge(&mut self, source: &DetailStat) {
        self.rolls = self.rolls.saturating_add(source.rolls);
        self.count = self.count.saturating_add(source.count);
        merge_dice(&mut self.dice, &source.dice);
    }
}

impl ActionStat {
    /// Lazily creates the breakdown for `detail_key`.
    pub fn ensure_detail(&mut self, detail_key: &str) -> &mut DetailStat {
        get_or_insert_default(&mut self.details, detail_key)
    }

    pub fn normalize(raw: &Value) -> Self {
        let details = value::object(raw.get("details"))
            .map(|details| {
                details
                    .iter()
                    .filter(|(key, _)| !key.is_empty())
                    .map(|(key, detail)| (key.clone(), DetailStat::normalize(detail)))
                    .collect()
            })
            .unwrap_or_default();
        ActionStat {
            rolls: value::count(raw.get("rolls")),
            count: value::count(raw.get("count")),
            dice: normalize_dice(raw.get("dice")),
            details,
        }
    }

    pub fn merge(&mut self, source: &ActionStat) {
        self.rolls = self.rolls.saturating_add(source.rolls);
        self.count = self.count.saturating_add(source.count);
        merge_dice(&mut self.dice, &source.dice);
        for (detail_key, detail) in &source.details {
            self.ensure_detail(detail_key).merge(detail);
        }
    }
}

impl StreakEntry {
    pub fn normalize(raw: &Value) -> Self {
        StreakEntry {
            current_min: value::count(raw.get("currentMin")),
            current_max: value::count(raw.get("currentMax")),
            longest_min: value::count(raw.get("longestMin")),
            longest_max: value::count(raw.get("longestMax")),
        }
    }
}

fn normalize_streaks(raw: Option<&Value>) -> StreakTable {
    let Some(filters) = value::object(raw) else {
        return StreakTable::new();
    };
    filters
        .iter()
        .filter_map(|(filter_key, dies)| {
            let dies = dies.as_object()?;
            let entries = dies
                .iter()
                .filter(|(_, entry)| entry.is_object())
                .map(|(die_key, entry)| (die_key.clone(), StreakEntry::normalize(entry)))
                .collect();
            Some((filter_key.clone(), entries))
        })
        .collect()
}

impl Default for StatsRecord {
    fn default() -> Self {
        Self::new()
    }
}

impl StatsRecord {
    /// An empty record: all counters zero, all maps empty.
    pub fn new() -> Self {
        StatsRecord {
            v: SCHEMA_VERSION,
            updated_at: 0,
            totals: Totals::default(),
            dice: BTreeMap::new(),
            actions: BTreeMap::new(),
            streaks: StreakTable::new(),
        }
    }

    /// Lazily creates the breakdown for `action_type`.
    pub fn ensure_action(&mut self, action_type: &str) -> &mut ActionStat {
        get_or_insert_default(&mut self.actions, action_type)
    }

    /// Defensive reconstruction from arbitrary JSON. Never fails and is idempotent.
    pub fn normalize(raw: &Value) -> Self {
        let mut record = StatsRecord::new();
        if !raw.is_object() {
            return record;
        }
        if let Some(v) = raw.get("v").and_then(Value::as_u64) {
            record.v = u32::try_from(v).unwrap_or(SCHEMA_VERSION);
        }
        if let Some(updated_at) = raw.get("updatedAt").and_then(value::integer) {
            record.updated_at = updated_at;
        }
        if let Some(totals) = raw.get("totals").filter(|t| t.is_object()) {
            record.totals.rolls = value::count(totals.get("rolls"));
            record.totals.dice = value::count(totals.get("dice"));
        }
        record.dice = normalize_dice(raw.get("dice"));
        record.actions = value::object(raw.get("actions"))
            .map(|actions| {
                actions
                    .iter()
                    .filter(|(key, _)| !key.is_empty())
                    .map(|(key, action)| (key.clone(), ActionStat::normalize(action)))
                    .collect()
            })
            .unwrap_or_default();
        record.streaks = normalize_streaks(raw.get("streaks"));
        record
    }

    /// Accumulates `source` into `self`.
    ///
    /// Counters add, extremes widen, and streak records keep the longest run
    /// seen in either record. In-progress streak counters are not carried over
    /// because they belong to a single timeline.
    pub fn merge(&mut self, source: &StatsRecord) -> &mut Self {
        self.totals.rolls = self.totals.rolls.saturating_add(source.totals.rolls);
        self.totals.dice = self.totals.dice.saturating_add(source.totals.dice);
        merge_dice(&mut self.dice, &source.dice);
        for (action_type, action) in &source.actions {
            self.ensure_action(action_type).merge(action);
        }
        crate::streaks::merge_streaks_max(&mut self.streaks, &source.streaks);
        self
    }

    /// True when every die histogram at every level satisfies the count invariant.
    pub fn is_consistent(&self) -> bool {
        let dice_ok = |dice: &BTreeMap<String, DieStat>| dice.values().all(DieStat::is_consistent);
        dice_ok(&self.dice)
            && self.actions.values().all(|action| {
                dice_ok(&action.dice) && action.details.values().all(|detail| dice_ok(&detail.dice))
            })
    }
}

impl<'de> Deserialize<'de> for StatsRecord {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Value::deserialize(deserializer)?;
        Ok(StatsRecord::normalize(&raw))
    }
}

fn normalize_record_map(raw: Option<&Value>) -> BTreeMap<String, StatsRecord> {
    value::object(raw)
        .map(|records| {
            records
                .iter()
                .map(|(key, record)| (key.clone(), StatsRecord::normalize(record)))
                .collect()
        })
        .unwrap_or_default()
}

impl Default for GlobalStats {
    fn default() -> Self {
        Self::new()
    }
}

impl GlobalStats {
    pub fn new() -> Self {
        GlobalStats {
            aggregate: StatsRecord::new(),
            users: BTreeMap::new(),
            by_date: BTreeMap::new(),
            users_by_date: BTreeMap::new(),
        }
    }

    /// Defensive reconstruction of the whole store, shard by shard.
    pub fn normalize(raw: &Value) -> Self {
        let mut global = GlobalStats::new();
        if !raw.is_object() {
            return global;
        }
        global.aggregate = StatsRecord::normalize(raw);
        global.users = normalize_record_map(raw.get("users"));
        global.by_date = normalize_record_map(raw.get("byDate"));
        global.users_by_date = value::object(raw.get("usersByDate"))
            .map(|users| {
                users
                    .iter()
                    .map(|(user_id, by_date)| (user_id.clone(), normalize_record_map(Some(by_date))))
                    .collect()
            })
            .unwrap_or_default();
        global
    }

    /// Per-user record, or an empty one for unknown users.
    pub fn user_stats(&self, user_id: &str) -> StatsRecord {
        self.users.get(user_id).cloned().unwrap_or_default()
    }

    pub fn load_from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read stats file: {}", path.display()))?;

        let raw: Value = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse JSON from: {}", path.display()))?;

        Ok(GlobalStats::normalize(&raw))
    }

    pub fn save_to_file(&self, path: &Path) -> Result<()> {
        let content =
            serde_json::to_string_pretty(self).context("Failed to serialize global stats")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write stats file: {}", path.display()))?;
        Ok(())
    }

    #[cfg(test)]
    /// Validate stats JSON against the JSON schema
    pub fn validate_with_schema(stats_json: &Value, schema: &JSONSchema) -> Result<()> {
        match schema.validate(stats_json) {
            Ok(_) => Ok(()),
            Err(errors) => {
                let error_messages: Vec<String> = errors
                    .map(|e| format!("  - {}: {}", e.instance_path, e))
                    .collect();
                bail!("Stats validation failed:\n{}", error_messages.join("\n"))
            }
        }
    }

    #[cfg(test)]
    /// Load and compile the JSON schema
    pub fn load_schema(schema_path: &Path) -> Result<JSONSchema> {
        let schema_content = std::fs::read_to_string(schema_path)
            .with_context(|| format!("Failed to read schema file: {}", schema_path.display()))?;

        let schema_json: Value = serde_json::from_str(&schema_content).with_context(|| {
            format!("Failed to parse schema JSON from: {}", schema_path.display())
        })?;

        JSONSchema::options()
            .with_draft(Draft::Draft7)
            .compile(&schema_json)
            .map_err(|e| anyhow!("Failed to compile JSON schema: {}", e))
    }
}

impl<'de> Deserialize<'de> for GlobalStats {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Value::deserialize(deserializer)?;
        Ok(GlobalStats::normalize(&raw))
    }
}
