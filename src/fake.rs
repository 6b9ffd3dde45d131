/// Demo data generator.
///
/// Produces a believable history for one user: a dozen sessions spread over
/// the past weeks, each with a mix of attacks, damage, saves and skill checks.
/// Generated rolls go through the regular aggregation path, so every scope and
/// streak table stays consistent.
use chrono::{Days, NaiveDate};
use indexmap::IndexMap;
use rand::seq::SliceRandom;
use rand::Rng;
use tracing::info;

use crate::aggregate::apply_payloads;
use crate::normalizer::{ResultCounts, ResultSequence, RollPayload};
use crate::stats::GlobalStats;
use crate::timefmt::DATE_KEY_FORMAT;

pub const SESSION_COUNT: usize = 12;
pub const ROLLS_MIN: usize = 30;
pub const ROLLS_MAX: usize = 90;

/// Weighted pool actions are drawn from.
pub const ACTION_POOL: [&str; 16] = [
    "attack", "attack", "attack", "damage", "damage", "damage", "save", "skill", "skill", "check",
    "ability", "initiative", "spell", "heal", "tool", "other",
];

pub const ABILITIES: [&str; 6] = ["str", "dex", "con", "int", "wis", "cha"];

pub const SKILLS: [&str; 18] = [
    "acrobatics",
    "animal-handling",
    "arcana",
    "athletics",
    "deception",
    "history",
    "insight",
    "intimidation",
    "investigation",
    "medicine",
    "nature",
    "perception",
    "performance",
    "persuasion",
    "religion",
    "sleight-of-hand",
    "stealth",
    "survival",
];

/// `(faces, count)` dice specs.
type DiceSpec = &'static [(i64, u32)];

pub const DAMAGE_DICE: [DiceSpec; 7] = [
    &[(6, 2)],
    &[(8, 1)],
    &[(10, 1)],
    &[(12, 1)],
    &[(4, 2)],
    &[(6, 1), (4, 1)],
    &[(8, 2)],
];

pub const HEAL_DICE: [DiceSpec; 5] = [&[(4, 1)], &[(8, 1)], &[(10, 1)], &[(4, 2)], &[(6, 2)]];

const ATTACK_FACES: [i64; 5] = [4, 6, 8, 10, 12];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FakeSummary {
    pub rolls: usize,
    pub sessions: usize,
}

/// Session dates walking back from `today`, oldest first.
pub fn session_dates<R: Rng + ?Sized>(today: NaiveDate, count: usize, rng: &mut R) -> Vec<String> {
    let mut dates: Vec<String> = (0..count as u64)
        .map(|i| {
            let back = i * rng.gen_range(3..=7);
            today
                .checked_sub_days(Days::new(back))
                .unwrap_or(today)
                .format(DATE_KEY_FORMAT)
                .to_string()
        })
        .collect();
    dates.reverse();
    dates
}

fn roll_dice<R: Rng + ?Sized>(specs: &[(i64, u32)], rng: &mut R) -> (ResultCounts, ResultSequence) {
    let mut counts = ResultCounts::new();
    let mut sequence = ResultSequence::new();
    for (faces, count) in specs {
        let die_key = format!("d{faces}");
        for _ in 0..*count {
            let value = rng.gen_range(1..=*faces);
            *counts
                .entry(die_key.clone())
                .or_insert_with(IndexMap::new)
                .entry(value.to_string())
                .or_insert(0) += 1;
            sequence.entry(die_key.clone()).or_default().push(value);
        }
    }
    (counts, sequence)
}

fn results_for_action<R: Rng + ?Sized>(action_type: &str, rng: &mut R) -> (ResultCounts, ResultSequence) {
    match action_type {
        "damage" => roll_dice(DAMAGE_DICE.choose(rng).copied().unwrap_or(&[(6, 1)]), rng),
        "heal" => roll_dice(HEAL_DICE.choose(rng).copied().unwrap_or(&[(8, 1)]), rng),
        "attack" => {
            let faces = ATTACK_FACES.choose(rng).copied().unwrap_or(6);
            roll_dice(&[(faces, 1)], rng)
        }
        _ => roll_dice(&[(20, 1)], rng),
    }
}

/// Takes this session's share of a queue; the last session takes the rest.
fn allocate<'a>(queue: &mut Vec<&'a str>, remaining_sessions: usize) -> Vec<&'a str> {
    if queue.is_empty() {
        return Vec::new();
    }
    let take = if remaining_sessions <= 1 {
        queue.len()
    } else {
        (queue.len() / remaining_sessions).max(1)
    };
    queue.drain(..take.min(queue.len())).collect()
}

fn detail_for<R: Rng + ?Sized>(
    action_type: &str,
    index: usize,
    skills: &[&str],
    abilities: &[&str],
    rng: &mut R,
) -> Option<String> {
    let pick = |planned: &[&str], pool: &[&'static str], rng: &mut R| -> Option<String> {
        if planned.is_empty() {
            pool.choose(rng).map(|d| d.to_string())
        } else {
            Some(planned[index % planned.len()].to_string())
        }
    };
    match action_type {
        "skill" => pick(skills, &SKILLS[..], rng),
        "save" | "ability" | "check" => pick(abilities, &ABILITIES[..], rng),
        _ => None,
    }
}

/// Adds a generated history for `user_id` to `global`.
pub fn generate_for_user<R: Rng + ?Sized>(
    global: &mut GlobalStats,
    user_id: &str,
    today: NaiveDate,
    now_ms: i64,
    rng: &mut R,
) -> FakeSummary {
    let dates = session_dates(today, SESSION_COUNT, rng);
    let mut skill_queue: Vec<&str> = SKILLS.to_vec();
    skill_queue.shuffle(rng);
    let mut ability_queue: Vec<&str> = ABILITIES.to_vec();
    ability_queue.shuffle(rng);

    let mut payloads = Vec::new();
    for (session_index, date_key) in dates.iter().enumerate() {
        let remaining = dates.len() - session_index;
        let session_skills = allocate(&mut skill_queue, remaining);
        let session_abilities = allocate(&mut ability_queue, remaining);
        let session_rolls = rng.gen_range(ROLLS_MIN..=ROLLS_MAX);

        for index in 0..session_rolls {
            let Some(action_type) = ACTION_POOL.choose(rng).copied() else {
                continue;
            };
            let detail_key = detail_for(action_type, index, &session_skills, &session_abilities, rng);
            let (results, sequence) = results_for_action(action_type, rng);
            payloads.push(RollPayload {
                user_id: Some(user_id.to_string()),
                action_type: Some(action_type.to_string()),
                detail_key,
                rolls: 1,
                results: Some(results),
                sequence,
                date_key: Some(date_key.clone()),
                ..Default::default()
            });
        }
    }

    let latest = dates.last().map(String::as_str).unwrap_or_default();
    let rolls = apply_payloads(global, &payloads, latest, now_ms);
    info!("Generated {} demo rolls over {} sessions for {}", rolls, dates.len(), user_id);
    FakeSummary {
        rolls,
        sessions: dates.len(),
    }
}
