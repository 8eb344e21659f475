//! Domain records replicated between devices.
//!
//! Every record carries a `last_modified` timestamp (milliseconds since
//! epoch) set by whichever side produced the current value. It is the only
//! input conflict resolution looks at.

use crate::{error::Result, Error, GroupId, RecordId, Timestamp, UserId};
use serde::{Deserialize, Serialize};
use std::fmt;

/// The kinds of entity the engine synchronizes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EntityType {
    User,
    Group,
    Player,
    Match,
    /// Pseudo-type used by `DOWNLOAD_ALL` operations and catch-all listeners.
    All,
}

impl EntityType {
    /// Concrete entity kinds, in dependency order.
    pub const CONCRETE: [EntityType; 4] = [
        EntityType::User,
        EntityType::Group,
        EntityType::Player,
        EntityType::Match,
    ];

    /// Remote collection holding documents of this kind.
    pub fn collection(self) -> &'static str {
        match self {
            EntityType::User => "users",
            EntityType::Group => "groups",
            EntityType::Player => "players",
            EntityType::Match => "matches",
            EntityType::All => "*",
        }
    }

    /// Whether records of this kind live inside a group.
    pub fn is_group_scoped(self) -> bool {
        matches!(self, EntityType::Player | EntityType::Match)
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            EntityType::User => "USER",
            EntityType::Group => "GROUP",
            EntityType::Player => "PLAYER",
            EntityType::Match => "MATCH",
            EntityType::All => "ALL",
        };
        f.write_str(name)
    }
}

/// Provenance of a queued mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Origin {
    /// Produced by a user action on this device
    #[default]
    Local,
    /// Received from the remote store
    Remote,
    /// Written back after a local value beat an incoming remote value
    ConflictResolution,
}

/// A user profile.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: UserId,
    pub display_name: String,
    #[serde(default)]
    pub email: Option<String>,
    pub last_modified: Timestamp,
}

/// A team the user belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Group {
    pub id: GroupId,
    pub name: String,
    pub owner_id: UserId,
    #[serde(default)]
    pub members: Vec<UserId>,
    pub invite_code: String,
    pub last_modified: Timestamp,
}

impl Group {
    /// Create a group owned (and joined) by `owner_id`.
    ///
    /// The invite code is normalized; invalid codes are rejected.
    pub fn new(
        id: impl Into<GroupId>,
        name: impl Into<String>,
        owner_id: impl Into<UserId>,
        invite_code: &str,
        last_modified: Timestamp,
    ) -> Result<Self> {
        let owner_id = owner_id.into();
        Ok(Self {
            id: id.into(),
            name: name.into(),
            members: vec![owner_id.clone()],
            owner_id,
            invite_code: normalize_invite_code(invite_code)?,
            last_modified,
        })
    }

    /// Whether `user_id` is listed as a member.
    pub fn has_member(&self, user_id: &str) -> bool {
        self.members.iter().any(|m| m == user_id)
    }
}

/// A player registered in a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Player {
    pub id: RecordId,
    pub group_id: GroupId,
    pub name: String,
    #[serde(default)]
    pub nickname: Option<String>,
    #[serde(default = "default_true")]
    pub active: bool,
    pub last_modified: Timestamp,
}

/// A match played inside a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Match {
    pub id: RecordId,
    pub group_id: GroupId,
    pub played_at: Timestamp,
    #[serde(default)]
    pub team_a: Vec<RecordId>,
    #[serde(default)]
    pub team_b: Vec<RecordId>,
    #[serde(default)]
    pub score_a: Option<u32>,
    #[serde(default)]
    pub score_b: Option<u32>,
    pub last_modified: Timestamp,
}

fn default_true() -> bool {
    true
}

/// A domain record of any kind.
///
/// This is the payload type carried by queued operations; it serializes as
/// `{"entityType": "...", "data": {...}}` so persisted queues stay typed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "entityType", content = "data", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Record {
    User(User),
    Group(Group),
    Player(Player),
    Match(Match),
}

impl Record {
    /// The record's id.
    pub fn id(&self) -> &RecordId {
        match self {
            Record::User(r) => &r.id,
            Record::Group(r) => &r.id,
            Record::Player(r) => &r.id,
            Record::Match(r) => &r.id,
        }
    }

    /// The entity kind of this record.
    pub fn entity_type(&self) -> EntityType {
        match self {
            Record::User(_) => EntityType::User,
            Record::Group(_) => EntityType::Group,
            Record::Player(_) => EntityType::Player,
            Record::Match(_) => EntityType::Match,
        }
    }

    /// When the current value was produced.
    pub fn last_modified(&self) -> Timestamp {
        match self {
            Record::User(r) => r.last_modified,
            Record::Group(r) => r.last_modified,
            Record::Player(r) => r.last_modified,
            Record::Match(r) => r.last_modified,
        }
    }

    /// Overwrite the modification timestamp.
    pub fn set_last_modified(&mut self, timestamp: Timestamp) {
        match self {
            Record::User(r) => r.last_modified = timestamp,
            Record::Group(r) => r.last_modified = timestamp,
            Record::Player(r) => r.last_modified = timestamp,
            Record::Match(r) => r.last_modified = timestamp,
        }
    }

    /// Consume and return the record stamped with `timestamp`.
    pub fn with_last_modified(mut self, timestamp: Timestamp) -> Self {
        self.set_last_modified(timestamp);
        self
    }

    /// The group this record belongs to, if any.
    ///
    /// A group is scoped to itself; users are not group scoped.
    pub fn group_scope(&self) -> Option<&GroupId> {
        match self {
            Record::User(_) => None,
            Record::Group(r) => Some(&r.id),
            Record::Player(r) => Some(&r.group_id),
            Record::Match(r) => Some(&r.group_id),
        }
    }

    /// Whether both records hold the same fields, ignoring `last_modified`.
    pub fn same_content(&self, other: &Record) -> bool {
        self.entity_type() == other.entity_type()
            && self.clone().with_last_modified(0) == other.clone().with_last_modified(0)
    }

    /// Group view of the record, if it is one.
    pub fn as_group(&self) -> Option<&Group> {
        match self {
            Record::Group(g) => Some(g),
            _ => None,
        }
    }

    /// Check the structural invariants every stored record must satisfy.
    pub fn validate(&self) -> Result<()> {
        let id = self.id();
        if id.trim().is_empty() {
            return Err(Error::invalid_record(id.clone(), "id must not be empty"));
        }
        match self {
            Record::Group(group) => {
                let normalized = normalize_invite_code(&group.invite_code)?;
                if normalized != group.invite_code {
                    return Err(Error::invalid_record(
                        id.clone(),
                        "invite code is not normalized",
                    ));
                }
                if group.owner_id.is_empty() {
                    return Err(Error::invalid_record(id.clone(), "group has no owner"));
                }
            }
            Record::Player(Player { group_id, .. }) | Record::Match(Match { group_id, .. }) => {
                if group_id.is_empty() {
                    return Err(Error::invalid_record(id.clone(), "missing group id"));
                }
            }
            Record::User(_) => {}
        }
        Ok(())
    }

    /// The bare document stored remotely (no entity tag).
    pub fn to_document(&self) -> serde_json::Value {
        let value = match self {
            Record::User(r) => serde_json::to_value(r),
            Record::Group(r) => serde_json::to_value(r),
            Record::Player(r) => serde_json::to_value(r),
            Record::Match(r) => serde_json::to_value(r),
        };
        // Plain structs with string keys always serialize.
        value.unwrap_or(serde_json::Value::Null)
    }

    /// Parse a bare remote document of a known kind.
    pub fn from_document(entity_type: EntityType, document: serde_json::Value) -> Result<Self> {
        let id = document
            .get("id")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let parsed = match entity_type {
            EntityType::User => serde_json::from_value(document).map(Record::User),
            EntityType::Group => serde_json::from_value(document).map(Record::Group),
            EntityType::Player => serde_json::from_value(document).map(Record::Player),
            EntityType::Match => serde_json::from_value(document).map(Record::Match),
            EntityType::All => {
                return Err(Error::invalid_record(id, "documents must have a concrete type"))
            }
        };
        parsed.map_err(|e| Error::invalid_record(id, e.to_string()))
    }
}

/// Trim and upper-case an invite code, rejecting anything that is not
/// 4-12 ASCII alphanumerics.
pub fn normalize_invite_code(code: &str) -> Result<String> {
    let normalized = code.trim().to_ascii_uppercase();
    let valid_len = (4..=12).contains(&normalized.len());
    if !valid_len || !normalized.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(Error::InvalidInviteCode(code.to_string()));
    }
    Ok(normalized)
}
