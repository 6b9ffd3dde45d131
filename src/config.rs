/// Tracker settings and data directory resolution.
///
/// Settings live in the key-value store: the flags under `settings`, the
/// hidden user list under its own `hiddenPlayers` key.
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use tracing::warn;

use crate::store::{SettingsStore, HIDDEN_PLAYERS_KEY, SETTINGS_KEY};

/// Environment variable overriding the data directory
pub const DATA_DIR_ENV: &str = "DICE_STATS_DATA_DIR";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Settings {
    /// Master switch for recording
    pub enabled: bool,
    pub record_self_rolls: bool,
    pub record_gm_private_rolls: bool,
    pub record_gm_blind_rolls: bool,
    pub allow_players_see_gm_stats: bool,
    /// Users excluded from aggregate views
    #[serde(skip)]
    pub hidden_players: Vec<String>,
    /// Delay before a roll is processed, so dice animations finish first
    pub roll_processing_delay_ms: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            enabled: true,
            record_self_rolls: true,
            record_gm_private_rolls: true,
            record_gm_blind_rolls: true,
            allow_players_see_gm_stats: false,
            hidden_players: Vec::new(),
            roll_processing_delay_ms: 0,
        }
    }
}

fn parse_bool(key: &str, raw: &str) -> Result<bool> {
    match raw.trim().to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        other => bail!("Invalid boolean for {key}: {other}"),
    }
}

impl Settings {
    /// Loads settings from the store; unreadable entries fall back to defaults
    pub fn load(store: &dyn SettingsStore) -> Result<Self> {
        let mut settings = match store.get(SETTINGS_KEY)? {
            Some(raw) => serde_json::from_value(raw).unwrap_or_else(|err| {
                warn!("Stored settings are malformed, using defaults: {err}");
                Settings::default()
            }),
            None => Settings::default(),
        };
        settings.hidden_players = match store.get(HIDDEN_PLAYERS_KEY)? {
            Some(raw) => crate::value::list(Some(&raw))
                .iter()
                .filter_map(crate::value::text)
                .collect(),
            None => Vec::new(),
        };
        Ok(settings)
    }

    pub fn save(&self, store: &dyn SettingsStore) -> Result<()> {
        let flags = serde_json::to_value(self).context("Failed to serialize settings")?;
        store.set(SETTINGS_KEY, &flags)?;
        let hidden = serde_json::to_value(&self.hidden_players)
            .context("Failed to serialize hidden players")?;
        store.set(HIDDEN_PLAYERS_KEY, &hidden)?;
        Ok(())
    }

    /// Applies a `key=value` override; keys accept camelCase or snake_case
    pub fn apply_override(&mut self, assignment: &str) -> Result<()> {
        let Some((key, raw)) = assignment.split_once('=') else {
            bail!("Expected key=value, got: {assignment}");
        };
        let key = key.trim();
        match key {
            "enabled" => self.enabled = parse_bool(key, raw)?,
            "recordSelfRolls" | "record_self_rolls" => self.record_self_rolls = parse_bool(key, raw)?,
            "recordGmPrivateRolls" | "record_gm_private_rolls" => {
                self.record_gm_private_rolls = parse_bool(key, raw)?
            }
            "recordGmBlindRolls" | "record_gm_blind_rolls" => {
                self.record_gm_blind_rolls = parse_bool(key, raw)?
            }
            "allowPlayersSeeGmStats" | "allow_players_see_gm_stats" => {
                self.allow_players_see_gm_stats = parse_bool(key, raw)?
            }
            "rollProcessingDelayMs" | "roll_processing_delay_ms" => {
                self.roll_processing_delay_ms = raw
                    .trim()
                    .parse()
                    .with_context(|| format!("Invalid delay for {key}: {raw}"))?
            }
            other => bail!("Unknown setting: {other}"),
        }
        Ok(())
    }

    /// Adds a user to the hidden list. Returns false if already hidden.
    pub fn hide_player(&mut self, user_id: &str) -> bool {
        if self.hidden_players.iter().any(|id| id == user_id) {
            return false;
        }
        self.hidden_players.push(user_id.to_string());
        true
    }

    /// Removes a user from the hidden list. Returns false if not hidden.
    pub fn unhide_player(&mut self, user_id: &str) -> bool {
        let before = self.hidden_players.len();
        self.hidden_players.retain(|id| id != user_id);
        self.hidden_players.len() != before
    }
}

pub fn resolve_data_root() -> Result<PathBuf> {
    if let Some(dir) = env::var_os(DATA_DIR_ENV) {
        return Ok(PathBuf::from(dir));
    }
    Ok(PathBuf::from(".dice-stats"))
}
