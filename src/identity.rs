/// Users, actors and ownership, as seen by one connected process.
///
/// The engine never looks at host globals: everything it needs to know about
/// who is who comes through the `Identity` trait. `Directory` implements it
/// from a JSON roster file.
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;

use crate::value::text_at;
use crate::visibility::author_id;

/// Ownership level granting full control of an actor.
pub const OWNER_LEVEL: u8 = 3;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserInfo {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "isGM")]
    pub is_gm: bool,
    #[serde(default)]
    pub active: bool,
    /// Actor id of the user's assigned character.
    #[serde(default)]
    pub character: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActorInfo {
    pub id: String,
    #[serde(default)]
    pub uuid: Option<String>,
    #[serde(default)]
    pub has_player_owner: bool,
    /// User id → ownership level.
    #[serde(default)]
    pub ownership: std::collections::BTreeMap<String, u8>,
}

pub trait Identity: Send + Sync {
    /// User this process runs as.
    fn current_user(&self) -> Option<String>;
    fn is_gm(&self, user_id: &str) -> bool;
    /// User responsible for rolls made by an actor.
    fn resolve_owner(&self, actor_ref: &str) -> Option<String>;
    /// The single writer of durable statistics.
    fn primary_gm(&self) -> Option<String>;
    fn user_name(&self, user_id: &str) -> Option<String>;
    fn users(&self) -> Vec<UserInfo>;

    fn current_is_gm(&self) -> bool {
        self.current_user().is_some_and(|id| self.is_gm(&id))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Directory {
    pub users: Vec<UserInfo>,
    pub actors: Vec<ActorInfo>,
    pub current_user: Option<String>,
}

impl Directory {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read roster file: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse roster from: {}", path.display()))
    }

    /// A roster with one game master, running as that game master.
    pub fn local_gm() -> Self {
        Directory {
            users: vec![UserInfo {
                id: "gm".to_string(),
                name: "Gamemaster".to_string(),
                is_gm: true,
                active: true,
                character: None,
            }],
            actors: Vec::new(),
            current_user: Some("gm".to_string()),
        }
    }

    /// Same roster seen from another user's process.
    pub fn as_user(&self, user_id: &str) -> Self {
        Directory {
            current_user: Some(user_id.to_string()),
            ..self.clone()
        }
    }

    fn user(&self, user_id: &str) -> Option<&UserInfo> {
        self.users.iter().find(|user| user.id == user_id)
    }

    fn actor(&self, actor_ref: &str) -> Option<&ActorInfo> {
        let bare = actor_ref.strip_prefix("Actor.").unwrap_or(actor_ref);
        self.actors
            .iter()
            .find(|actor| actor.id == bare || actor.uuid.as_deref() == Some(actor_ref))
    }
}

impl Identity for Directory {
    fn current_user(&self) -> Option<String> {
        self.current_user.clone()
    }

    fn is_gm(&self, user_id: &str) -> bool {
        self.user(user_id).is_some_and(|user| user.is_gm)
    }

    fn resolve_owner(&self, actor_ref: &str) -> Option<String> {
        let actor = self.actor(actor_ref)?;
        if !actor.has_player_owner {
            return self.primary_gm();
        }
        if let Some(player) = self
            .users
            .iter()
            .find(|user| user.character.as_deref() == Some(actor.id.as_str()))
        {
            return Some(player.id.clone());
        }

        let owners: Vec<&UserInfo> = actor
            .ownership
            .iter()
            .filter(|(_, level)| **level == OWNER_LEVEL)
            .filter_map(|(id, _)| self.user(id))
            .collect();
        owners
            .iter()
            .find(|user| user.active && !user.is_gm)
            .or_else(|| owners.iter().find(|user| !user.is_gm))
            .or_else(|| owners.iter().find(|user| user.is_gm))
            .map(|user| user.id.clone())
            .or_else(|| self.primary_gm())
    }

    /// First active game master, else the first one listed.
    fn primary_gm(&self) -> Option<String> {
        self.users
            .iter()
            .find(|user| user.is_gm && user.active)
            .or_else(|| self.users.iter().find(|user| user.is_gm))
            .map(|user| user.id.clone())
    }

    fn user_name(&self, user_id: &str) -> Option<String> {
        self.user(user_id)
            .map(|user| user.name.clone())
            .filter(|name| !name.is_empty())
    }

    fn users(&self) -> Vec<UserInfo> {
        self.users.clone()
    }
}

/// Originating user of a chat message: author, hook user, speaker's owner, then current user.
pub fn resolve_user_from_message(
    message: &Value,
    hook_user_id: Option<&str>,
    identity: &dyn Identity,
) -> Option<String> {
    author_id(message)
        .or_else(|| hook_user_id.map(str::to_string))
        .or_else(|| {
            text_at(message, &["speaker", "actor"]).and_then(|actor| identity.resolve_owner(&actor))
        })
        .or_else(|| identity.current_user())
}

/// Originating user of a workflow: the acting actor's owner, then the workflow's user.
pub fn resolve_user_from_workflow(workflow: &Value, identity: &dyn Identity) -> Option<String> {
    text_at(workflow, &["actor", "id"])
        .or_else(|| text_at(workflow, &["actorId"]))
        .or_else(|| text_at(workflow, &["actor", "uuid"]))
        .and_then(|actor| identity.resolve_owner(&actor))
        .or_else(|| text_at(workflow, &["user", "id"]))
        .or_else(|| text_at(workflow, &["userId"]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn roster() -> Directory {
        serde_json::from_value(json!({
            "users": [
                {"id": "gm-idle", "name": "Old GM", "isGM": true, "active": false},
                {"id": "gm", "name": "GM", "isGM": true, "active": true},
                {"id": "alice", "name": "Alice", "active": true, "character": "a-hero"},
                {"id": "bob", "name": "Bob", "active": false},
                {"id": "carol", "name": "Carol", "active": true}
            ],
            "actors": [
                {"id": "a-hero", "hasPlayerOwner": true, "ownership": {"alice": 3, "gm": 3}},
                {"id": "a-shared", "uuid": "Actor.a-shared", "hasPlayerOwner": true, "ownership": {"bob": 3, "carol": 3, "gm": 3}},
                {"id": "a-offline", "hasPlayerOwner": true, "ownership": {"bob": 3, "carol": 2}},
                {"id": "a-gm-only", "hasPlayerOwner": true, "ownership": {"gm-idle": 3}},
                {"id": "a-goblin", "hasPlayerOwner": false, "ownership": {"gm": 3}}
            ],
            "currentUser": "alice"
        }))
        .unwrap()
    }

    #[test]
    fn test_primary_gm_prefers_active() {
        assert_eq!(roster().primary_gm().as_deref(), Some("gm"));
        let mut idle = roster();
        idle.users.iter_mut().for_each(|u| u.active = false);
        assert_eq!(idle.primary_gm().as_deref(), Some("gm-idle"));
        assert_eq!(Directory::default().primary_gm(), None);
    }

    #[test]
    fn test_resolve_owner_rules() {
        let dir = roster();
        assert_eq!(dir.resolve_owner("a-hero").as_deref(), Some("alice"));
        assert_eq!(dir.resolve_owner("Actor.a-shared").as_deref(), Some("carol"));
        assert_eq!(dir.resolve_owner("a-offline").as_deref(), Some("bob"));
        assert_eq!(dir.resolve_owner("a-gm-only").as_deref(), Some("gm-idle"));
        assert_eq!(dir.resolve_owner("a-goblin").as_deref(), Some("gm"));
        assert_eq!(dir.resolve_owner("missing"), None);
    }

    #[test]
    fn test_current_user_perspective() {
        let dir = roster();
        assert!(!dir.current_is_gm());
        assert!(dir.as_user("gm").current_is_gm());
        assert_eq!(dir.user_name("bob").as_deref(), Some("Bob"));
        assert_eq!(dir.user_name("nobody"), None);
        assert!(Directory::local_gm().current_is_gm());
    }

    #[test]
    fn test_resolve_user_from_message() {
        let dir = roster();
        let authored = json!({"user": {"id": "bob"}, "speaker": {"actor": "a-hero"}});
        assert_eq!(resolve_user_from_message(&authored, Some("carol"), &dir).as_deref(), Some("bob"));

        let spoken = json!({"speaker": {"actor": "a-hero"}});
        assert_eq!(resolve_user_from_message(&spoken, Some("carol"), &dir).as_deref(), Some("carol"));
        assert_eq!(resolve_user_from_message(&spoken, None, &dir).as_deref(), Some("alice"));
        assert_eq!(resolve_user_from_message(&json!({}), None, &dir).as_deref(), Some("alice"));
        assert_eq!(resolve_user_from_message(&json!({}), None, &dir.as_user("carol")).as_deref(), Some("carol"));
    }

    #[test]
    fn test_resolve_user_from_author_fields() {
        let dir = roster().as_user("gm");
        let spoken = json!({"speaker": {"actor": "a-hero"}});

        let mut author_object = spoken.clone();
        author_object["author"] = json!({"id": "bob"});
        assert_eq!(resolve_user_from_message(&author_object, None, &dir).as_deref(), Some("bob"));

        let mut author_text = spoken.clone();
        author_text["author"] = json!("carol");
        assert_eq!(resolve_user_from_message(&author_text, Some("gm"), &dir).as_deref(), Some("carol"));

        let mut user_id = spoken;
        user_id["userId"] = json!("bob");
        assert_eq!(resolve_user_from_message(&user_id, None, &dir).as_deref(), Some("bob"));
    }

    #[test]
    fn test_resolve_user_from_workflow() {
        let dir = roster();
        let workflow = json!({"actor": {"id": "a-hero"}, "userId": "gm"});
        assert_eq!(resolve_user_from_workflow(&workflow, &dir).as_deref(), Some("alice"));
        let unknown_actor = json!({"actorId": "ghost", "user": {"id": "bob"}});
        assert_eq!(resolve_user_from_workflow(&unknown_actor, &dir).as_deref(), Some("bob"));
        assert_eq!(resolve_user_from_workflow(&json!({}), &dir), None);
    }

    #[test]
    fn test_load_roster_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("roster.json");
        std::fs::write(&path, serde_json::to_string(&roster()).unwrap()).unwrap();
        assert_eq!(Directory::load(&path).unwrap(), roster());
        assert!(Directory::load(&dir.path().join("missing.json")).is_err());
    }
}
