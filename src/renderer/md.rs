use crate::latest::LatestRollEntry;
use crate::query::{
    action_label, die_summary, format_detail_label, most_frequent_action, sort_action_keys,
    sort_die_keys, streak_entry_for_filters,
};
use crate::stats::StatsRecord;
use crate::timefmt::format_timestamp_opt;
use anyhow::Result;
use std::collections::BTreeMap;

/// Everything a Markdown report shows.
pub struct Report<'a> {
    pub title: String,
    /// Who and which sessions the figures cover, e.g. "All players · 2025-03-15".
    pub scope: String,
    pub stats: &'a StatsRecord,
    /// Record whose streak table matches the selection.
    pub streaks: &'a StatsRecord,
    pub action_filter: &'a str,
    pub detail_filter: &'a str,
    pub sessions: &'a BTreeMap<String, StatsRecord>,
    pub latest: Option<&'a LatestRollEntry>,
}

/// Render a dice report to Markdown
pub fn render(report: &Report<'_>) -> Result<String> {
    let mut output = String::new();

    render_header(&mut output, report);
    render_summary(&mut output, report);

    if let Some(latest) = report.latest {
        render_latest(&mut output, latest);
    }

    render_dice(&mut output, report);

    if !report.stats.actions.is_empty() {
        render_actions(&mut output, report.stats);
    }

    if !report.sessions.is_empty() {
        render_sessions(&mut output, report.sessions);
    }

    Ok(output)
}

fn render_header(output: &mut String, report: &Report<'_>) {
    output.push_str(&format!("# 🎲 {}\n", report.title));
    output.push_str(&format!("*{}*\n\n", report.scope));
    let updated = Some(report.stats.updated_at);
    output.push_str(&format!("- **Last update:** {} UTC\n", format_timestamp_opt(updated)));
    if report.action_filter != "all" {
        output.push_str(&format!("- **Action:** {}\n", action_label(report.action_filter)));
    }
    if report.detail_filter != "all" {
        output.push_str(&format!("- **Detail:** {}\n", format_detail_label(report.detail_filter)));
    }
    output.push('\n');
}

fn render_summary(output: &mut String, report: &Report<'_>) {
    let stats = report.stats;
    output.push_str("### 📊 Summary\n");
    output.push_str(&format!("- 🎯 **Rolls:** {}\n", format_number(stats.totals.rolls)));
    output.push_str(&format!("- 🎲 **Dice rolled:** {}\n", format_number(stats.totals.dice)));
    if let Some(action) = most_frequent_action(&stats.actions) {
        output.push_str(&format!("- ⭐ **Most rolled:** {}\n", action_label(action)));
    }
    if !report.sessions.is_empty() {
        output.push_str(&format!("- 📅 **Sessions:** {}\n", report.sessions.len()));
    }
    output.push('\n');
}

fn render_latest(output: &mut String, latest: &LatestRollEntry) {
    output.push_str("### 🕐 Latest roll\n");
    let who = latest
        .user_name
        .as_deref()
        .or(latest.user_id.as_deref())
        .unwrap_or("Unknown");
    let mut line = format!("- **{}** rolled {}", who, action_label(&latest.action_type));
    if let Some(detail) = &latest.detail_key {
        line.push_str(&format!(" ({})", format_detail_label(detail)));
    }
    if let Some(advantage) = latest.advantage {
        line.push_str(&format!(" with {}", advantage.as_str()));
    }
    if let Some(label) = latest.privacy_label() {
        line.push_str(&format!(" [{}]", label));
    }
    output.push_str(&line);
    output.push('\n');

    let mut dice: Vec<String> = latest.sequence.keys().cloned().collect();
    sort_die_keys(&mut dice);
    for die_key in dice {
        let faces: Vec<String> = latest.sequence[&die_key].iter().map(i64::to_string).collect();
        output.push_str(&format!("  - {}: {}\n", die_key.to_uppercase(), faces.join(", ")));
    }
    output.push('\n');
}

fn render_dice(output: &mut String, report: &Report<'_>) {
    output.push_str("### 🎲 Dice\n");
    if report.stats.dice.is_empty() {
        output.push_str("No dice rolled yet.\n\n");
        return;
    }

    output.push_str("| Die | Count | Avg | Min | Q1 | Q3 | Max | Min streak | Max streak |\n");
    output.push_str("|---|---:|---:|---:|---:|---:|---:|---:|---:|\n");

    let mut dice: Vec<String> = report.stats.dice.keys().cloned().collect();
    sort_die_keys(&mut dice);
    for die_key in dice {
        let Some(summary) = die_summary(&report.stats.dice[&die_key]) else {
            continue;
        };
        let streak = streak_entry_for_filters(
            report.streaks,
            report.action_filter,
            report.detail_filter,
            &die_key,
        )
        .unwrap_or_default();
        output.push_str(&format!(
            "| {} | {} | {:.2} | {} | {} | {} | {} | {} | {} |\n",
            die_key.to_uppercase(),
            format_number(summary.count),
            summary.avg,
            summary.min,
            summary.q1,
            summary.q3,
            summary.max,
            streak.longest_min,
            streak.longest_max
        ));
    }
    output.push('\n');
}

fn render_actions(output: &mut String, stats: &StatsRecord) {
    output.push_str("### ⚔️ Actions\n");

    let mut actions: Vec<String> = stats.actions.keys().cloned().collect();
    sort_action_keys(&mut actions);
    for action_type in actions {
        let action = &stats.actions[&action_type];
        output.push_str(&format!(
            "- **{}:** {} rolls, {} dice\n",
            action_label(&action_type),
            format_number(action.rolls),
            format_number(action.count)
        ));

        // Busiest details first
        let mut details: Vec<(&String, u64)> = action
            .details
            .iter()
            .map(|(key, detail)| (key, detail.rolls))
            .collect();
        details.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(b.0)));
        for (detail_key, rolls) in details {
            output.push_str(&format!(
                "  - {}: {} rolls\n",
                uppercase_first_char(&format_detail_label(detail_key)),
                format_number(rolls)
            ));
        }
    }
    output.push('\n');
}

fn render_sessions(output: &mut String, sessions: &BTreeMap<String, StatsRecord>) {
    output.push_str("### 📅 Sessions\n");
    for (date_key, stats) in sessions.iter().rev() {
        let d20_avg = stats
            .dice
            .get("d20")
            .and_then(die_summary)
            .map(|summary| format!(", d20 avg {:.2}", summary.avg))
            .unwrap_or_default();
        output.push_str(&format!(
            "- {}: {} rolls, {} dice{}\n",
            date_key,
            format_number(stats.totals.rolls),
            format_number(stats.totals.dice),
            d20_avg
        ));
    }
    output.push('\n');
}

/// Format a number with thousand separators
fn format_number(n: u64) -> String {
    let digits = n.to_string();
    let mut grouped_rev = String::new();

    for (count, ch) in digits.chars().rev().enumerate() {
        if count > 0 && count % 3 == 0 {
            grouped_rev.push(',');
        }
        grouped_rev.push(ch);
    }

    grouped_rev.chars().rev().collect()
}

/// Uppercase the first character of a string
fn uppercase_first_char(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        None => String::new(),
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::apply_payloads;
    use crate::normalizer::{ResultCounts, ResultSequence, RollPayload};
    use crate::stats::GlobalStats;
    use indexmap::IndexMap;

    fn payload(action: &str, detail: Option<&str>, die: &str, faces: &[i64]) -> RollPayload {
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
            ..Default::default()
        }
    }

    fn sample() -> GlobalStats {
        let mut global = GlobalStats::new();
        apply_payloads(
            &mut global,
            &[
                payload("attack", None, "d20", &[20, 20, 7]),
                payload("damage", None, "d6", &[1, 6]),
                payload("skill", Some("stealth"), "d20", &[3]),
            ],
            "2025-03-15",
            1_700_000_000_000,
        );
        global
    }

    fn report<'a>(global: &'a GlobalStats, latest: Option<&'a LatestRollEntry>) -> Report<'a> {
        Report {
            title: "Dice Stats".to_string(),
            scope: "All players · All sessions".to_string(),
            stats: &global.aggregate,
            streaks: &global.aggregate,
            action_filter: "all",
            detail_filter: "all",
            sessions: &global.by_date,
            latest,
        }
    }

    #[test]
    fn test_render_sections() {
        let global = sample();
        let markdown = render(&report(&global, None)).unwrap();
        assert!(markdown.starts_with("# 🎲 Dice Stats\n"));
        assert!(markdown.contains("- 🎯 **Rolls:** 3\n"));
        assert!(markdown.contains("- 🎲 **Dice rolled:** 6\n"));
        assert!(markdown.contains("- ⭐ **Most rolled:** Attack Rolls\n"));
        assert!(markdown.contains("| D6 | 2 | 3.50 | 1 | 1 | 6 | 6 | 1 | 1 |\n"));
        assert!(markdown.contains("| D20 | 4 | 12.50 | 3 | 3 | 20 | 20 | 0 | 2 |\n"));
        assert!(markdown.contains("  - Stealth: 1 rolls\n"));
        assert!(markdown.contains("- 2025-03-15: 3 rolls, 6 dice, d20 avg 12.50\n"));
        assert!(markdown.find("D6").unwrap() < markdown.find("D20").unwrap());
        assert!(markdown.find("Attack Rolls:").unwrap() < markdown.find("Damage Rolls:").unwrap());
        assert!(!markdown.contains("Latest roll"));
    }

    #[test]
    fn test_render_empty() {
        let global = GlobalStats::new();
        let markdown = render(&report(&global, None)).unwrap();
        assert!(markdown.contains("No dice rolled yet."));
        assert!(markdown.contains("- **Last update:** - UTC\n"));
        assert!(!markdown.contains("### ⚔️ Actions"));
    }

    #[test]
    fn test_render_latest_roll() {
        let global = sample();
        let mut latest =
            LatestRollEntry::from_payloads(&[payload("save", Some("dex"), "d20", &[18])], 1).unwrap();
        latest.user_name = Some("Pat".to_string());
        let markdown = render(&report(&global, Some(&latest))).unwrap();
        assert!(markdown.contains("- **Pat** rolled Saving Throw (dex)\n"));
        assert!(markdown.contains("  - D20: 18\n"));
    }

    #[test]
    fn test_format_number() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1234567), "1,234,567");
    }
}
