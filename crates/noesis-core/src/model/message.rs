//! The working tier's atomic unit: a single user/assistant/system turn.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Who authored a [`Message`].
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        }
    }

    pub fn parse_name(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "user" => Some(Role::User),
            "assistant" => Some(Role::Assistant),
            "system" => Some(Role::System),
            _ => None,
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Role::parse_name(s).ok_or_else(|| format!("unknown role: {s}"))
    }
}

/// A single stored turn. Owned by exactly one tier at a time; promotion
/// preserves `id` and `user_id` (I3).
#[non_exhaustive]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub user_id: String,
    pub conversation_id: String,
    pub role: Role,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Composite score in [0,1] (I1), assigned by the importance engine.
    pub importance_score: f64,
    /// Populated lazily by best-effort entity extraction; absent until the
    /// extraction collaborator call completes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extracted_entities: Option<Vec<String>>,
    /// Number of times this message has been read back out of the working
    /// tier (bumped by `recent()`/`get_messages`). Phase 1's `access_count
    /// >= 3` promotion criterion (§4.6) reads this field.
    #[serde(default)]
    pub access_count: u32,
    #[serde(default = "Utc::now")]
    pub last_accessed: DateTime<Utc>,
}

impl Message {
    pub fn new(
        user_id: impl Into<String>,
        conversation_id: impl Into<String>,
        role: Role,
        content: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            conversation_id: conversation_id.into(),
            role,
            content: content.into(),
            timestamp: now,
            tags: Vec::new(),
            importance_score: 0.0,
            extracted_entities: None,
            access_count: 0,
            last_accessed: now,
        }
    }

    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.timestamp
    }

    /// Bumped every time a read path (`recent()`/`get_messages`) surfaces
    /// this message, feeding Phase 1's `access_count >= 3` criterion.
    pub fn touch(&mut self) {
        self.access_count += 1;
        self.last_accessed = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_roundtrip() {
        for role in [Role::User, Role::Assistant, Role::System] {
            assert_eq!(Role::parse_name(role.as_str()), Some(role));
        }
    }

    #[test]
    fn unknown_role_rejected() {
        assert_eq!(Role::parse_name("narrator"), None);
    }

    #[test]
    fn new_message_has_stable_identity_fields() {
        let msg = Message::new("u1", "c1", Role::User, "hi");
        assert_eq!(msg.user_id, "u1");
        assert_eq!(msg.conversation_id, "c1");
        assert_eq!(msg.importance_score, 0.0);
        assert!(!msg.id.is_empty());
    }
}
