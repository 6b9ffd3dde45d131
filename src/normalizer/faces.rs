use indexmap::IndexMap;
use serde_json::Value;

use crate::value;

/// Die key → face (as text) → occurrences.
pub type ResultCounts = IndexMap<String, IndexMap<String, u64>>;

/// Die key → faces in roll order.
pub type ResultSequence = IndexMap<String, Vec<i64>>;

/// Active faces of every dice term of a roll, keyed by die.
///
/// Terms without a positive `faces` value (numeric modifiers, operators) and
/// results flagged `active: false` (dropped or rerolled dice) are skipped.
fn active_faces(roll: &Value) -> IndexMap<String, Vec<i64>> {
    let mut faces_by_die: IndexMap<String, Vec<i64>> = IndexMap::new();
    let Some(resolved) = value::resolve_roll(roll) else {
        return faces_by_die;
    };
    let Some(terms) = resolved.get("terms").and_then(Value::as_array) else {
        return faces_by_die;
    };
    for term in terms {
        let Some(faces) = term.get("faces").and_then(value::integer).filter(|f| *f > 0) else {
            continue;
        };
        let Some(results) = term.get("results").and_then(Value::as_array) else {
            continue;
        };
        let active = results
            .iter()
            .filter(|result| result.get("active") != Some(&Value::Bool(false)))
            .filter_map(|result| result.get("result").and_then(value::integer));
        faces_by_die
            .entry(format!("d{faces}"))
            .or_default()
            .extend(active);
    }
    faces_by_die.retain(|_, values| !values.is_empty());
    faces_by_die
}

/// Face histogram and ordered sequence of one roll, from the same result set.
pub fn counts_and_sequence(roll: &Value) -> (ResultCounts, ResultSequence) {
    let sequence = active_faces(roll);
    let mut counts = ResultCounts::new();
    for (die_key, values) in &sequence {
        let faces = counts.entry(die_key.clone()).or_default();
        for face in values {
            *faces.entry(face.to_string()).or_insert(0) += 1;
        }
    }
    (counts, sequence)
}

pub fn merge_result_counts(target: &mut ResultCounts, source: &ResultCounts) {
    for (die_key, faces) in source {
        let target_faces = target.entry(die_key.clone()).or_default();
        for (face, count) in faces {
            if *count == 0 {
                continue;
            }
            *target_faces.entry(face.clone()).or_insert(0) += count;
        }
    }
}

pub fn merge_result_sequences(target: &mut ResultSequence, source: &ResultSequence) {
    for (die_key, values) in source {
        target.entry(die_key.clone()).or_default().extend(values.iter().copied());
    }
}

/// Number of individual faces in a histogram.
pub fn total_faces(counts: &ResultCounts) -> u64 {
    counts.values().flat_map(|faces| faces.values()).sum()
}
