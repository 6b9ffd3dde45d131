/// Roll privacy classification and the record/skip decision for chat messages.
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;

use crate::config::Settings;
use crate::normalizer::message_id;
use crate::value::{self, path, text, text_at};

/// Flag scope under which messages may carry tracking hints.
pub const FLAG_SCOPE: &str = "dice-stats";

/// Privacy metadata of a message, as far as it can be recovered.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VisibilityInfo {
    pub roll_mode: Option<String>,
    pub whisper: Vec<String>,
    pub blind: bool,
    pub author_id: Option<String>,
    /// User that created the message according to the host hook.
    pub user_id: Option<String>,
}

/// Author of a message from any of the fields hosts have used for it.
pub fn author_id(message: &Value) -> Option<String> {
    text_at(message, &["user", "id"])
        .or_else(|| text_at(message, &["author", "id"]))
        .or_else(|| message.get("author").and_then(text))
        .or_else(|| text_at(message, &["userId"]))
        .or_else(|| text_at(message, &["data", "user"]))
        .or_else(|| text_at(message, &["data", "userId"]))
}

fn whisper_list(message: &Value) -> Vec<String> {
    let raw = [
        message.get("whisper"),
        path(message, &["data", "whisper"]),
        path(message, &["system", "whisper"]),
        path(message, &["flags", "core", "whisper"]),
    ]
    .into_iter()
    .flatten()
    .find(|w| !w.is_null());
    value::list(raw).iter().filter_map(text).collect()
}

fn roll_mode(message: &Value) -> Option<String> {
    let from_rolls = value::list(message.get("rolls"))
        .iter()
        .filter_map(value::resolve_roll)
        .find_map(|roll| text_at(&roll, &["options", "rollMode"]));
    from_rolls
        .or_else(|| text_at(message, &["rollMode"]))
        .or_else(|| text_at(message, &["data", "rollMode"]))
        .or_else(|| text_at(message, &["system", "rollMode"]))
        .or_else(|| text_at(message, &["flags", "core", "rollMode"]))
        .or_else(|| text_at(message, &["flags", "dnd5e", "roll", "rollMode"]))
}

impl VisibilityInfo {
    /// Extracts privacy metadata from a raw message.
    pub fn from_message(message: &Value, user_id: Option<&str>) -> Self {
        let blind = [
            message.get("blind"),
            path(message, &["data", "blind"]),
            path(message, &["system", "blind"]),
        ]
        .into_iter()
        .flatten()
        .find(|b| !b.is_null())
        .is_some_and(value::truthy);

        VisibilityInfo {
            roll_mode: roll_mode(message),
            whisper: whisper_list(message),
            blind,
            author_id: author_id(message),
            user_id: user_id.map(str::to_string),
        }
    }

    fn mode(&self) -> String {
        self.roll_mode.as_deref().unwrap_or_default().to_lowercase()
    }

    /// Self roll: a "self" mode, or a single whisper recipient who is the roller.
    pub fn is_self_roll(&self) -> bool {
        let mode = self.mode();
        if mode.contains("self") {
            return true;
        }
        if mode.contains("gm") || mode.contains("blind") {
            return false;
        }
        match self.whisper.as_slice() {
            [sole] => {
                self.author_id.as_deref() == Some(sole.as_str())
                    || self.user_id.as_deref() == Some(sole.as_str())
            }
            _ => false,
        }
    }

    pub fn is_gm_private(&self) -> bool {
        let mode = self.mode();
        mode.contains("gm") && !mode.contains("blind")
    }

    pub fn is_gm_blind(&self) -> bool {
        self.mode().contains("blind")
    }

    /// Short label shown next to a non-public roll.
    pub fn privacy_label(&self) -> Option<&'static str> {
        let mode = self.mode();
        if mode.contains("blind") {
            Some("Blind")
        } else if mode.contains("gm") {
            Some("Private")
        } else if mode.contains("self") {
            Some("Self")
        } else {
            None
        }
    }

    fn involves(&self, viewer: &str) -> bool {
        self.author_id.as_deref() == Some(viewer) || self.user_id.as_deref() == Some(viewer)
    }

    /// Whether a viewer may see the roll itself (not its aggregates).
    pub fn visible_to(&self, viewer: Option<&str>, viewer_is_gm: bool) -> bool {
        if self.blind {
            return viewer_is_gm;
        }
        if !self.whisper.is_empty() {
            return viewer.is_some_and(|v| self.whisper.iter().any(|w| w == v));
        }
        let mode = self.mode();
        if mode.contains("self") {
            return viewer.is_some_and(|v| self.involves(v));
        }
        if mode.contains("blind") {
            return viewer_is_gm;
        }
        if mode.contains("gm") {
            return viewer_is_gm || viewer.is_some_and(|v| self.involves(v));
        }
        true
    }
}

/// Why a message is not recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    Disabled,
    /// The message author differs from the user reported by the hook.
    AuthorMismatch,
    /// Another process originated the roll and records it.
    NotOriginator,
    AlreadyProcessed,
    SelfRoll,
    GmPrivate,
    GmBlind,
    /// The message is flagged as not to be tracked.
    Untracked,
    /// The message was already relayed to the writer over the channel.
    RelayedViaSocket,
}

impl SkipReason {
    pub fn as_str(self) -> &'static str {
        match self {
            SkipReason::Disabled => "disabled",
            SkipReason::AuthorMismatch => "author mismatch",
            SkipReason::NotOriginator => "not originator",
            SkipReason::AlreadyProcessed => "already processed",
            SkipReason::SelfRoll => "self roll",
            SkipReason::GmPrivate => "gm private roll",
            SkipReason::GmBlind => "gm blind roll",
            SkipReason::Untracked => "untracked",
            SkipReason::RelayedViaSocket => "relayed via socket",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Eligibility {
    Record,
    Skip(SkipReason),
}

impl Eligibility {
    pub fn is_record(self) -> bool {
        matches!(self, Eligibility::Record)
    }

    /// Privacy suppression still updates the live latest-roll display.
    pub fn allows_display(self) -> bool {
        matches!(
            self,
            Eligibility::Record
                | Eligibility::Skip(SkipReason::SelfRoll)
                | Eligibility::Skip(SkipReason::GmPrivate)
                | Eligibility::Skip(SkipReason::GmBlind)
        )
    }
}

/// The process evaluating a message.
#[derive(Debug, Clone, Copy, Default)]
pub struct Observer<'a> {
    pub user_id: Option<&'a str>,
    pub is_gm: bool,
    pub primary_gm: Option<&'a str>,
}

impl Observer<'_> {
    /// True when this process stands in for rolls without a known originator.
    ///
    /// Only the primary GM does; without one such rolls are not recorded.
    pub fn is_fallback_writer(&self) -> bool {
        self.primary_gm.is_some() && self.user_id == self.primary_gm
    }
}

/// Decides whether `message` is recorded into durable aggregates by this process.
pub fn should_track(
    message: &Value,
    hook_user_id: Option<&str>,
    settings: &Settings,
    processed: &HashSet<String>,
    observer: &Observer<'_>,
) -> Eligibility {
    if !settings.enabled {
        return Eligibility::Skip(SkipReason::Disabled);
    }

    let author = author_id(message);
    if let (Some(author), Some(hook_user)) = (author.as_deref(), hook_user_id) {
        if author != hook_user {
            return Eligibility::Skip(SkipReason::AuthorMismatch);
        }
    }
    let originator_here = match author.as_deref().or(hook_user_id) {
        Some(originator) => observer.user_id == Some(originator),
        None => observer.is_fallback_writer(),
    };
    if !originator_here {
        return Eligibility::Skip(SkipReason::NotOriginator);
    }

    if message_id(message).is_some_and(|id| processed.contains(&id)) {
        return Eligibility::Skip(SkipReason::AlreadyProcessed);
    }

    let visibility = VisibilityInfo::from_message(message, hook_user_id);
    if !settings.record_self_rolls && visibility.is_self_roll() {
        return Eligibility::Skip(SkipReason::SelfRoll);
    }
    if !settings.record_gm_private_rolls && visibility.is_gm_private() {
        return Eligibility::Skip(SkipReason::GmPrivate);
    }
    if !settings.record_gm_blind_rolls && visibility.is_gm_blind() {
        return Eligibility::Skip(SkipReason::GmBlind);
    }

    let flags = path(message, &["flags", FLAG_SCOPE]).unwrap_or(&value::NULL);
    if flags.get("tracked") == Some(&Value::Bool(false)) {
        return Eligibility::Skip(SkipReason::Untracked);
    }
    if flags.get("trackedViaSocket").is_some_and(value::truthy) && observer.is_gm {
        return Eligibility::Skip(SkipReason::RelayedViaSocket);
    }
    Eligibility::Record
}
