//! The semantic tier's unit: a short textual assertion derived from one or
//! more messages, with optional embedding for similarity search.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Coarse classification of what an [`ExtractedFact`] asserts.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Person,
    Place,
    Technology,
    Decision,
    Preference,
    Constraint,
    Goal,
    #[default]
    Other,
}

impl EntityType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Person => "person",
            EntityType::Place => "place",
            EntityType::Technology => "technology",
            EntityType::Decision => "decision",
            EntityType::Preference => "preference",
            EntityType::Constraint => "constraint",
            EntityType::Goal => "goal",
            EntityType::Other => "other",
        }
    }

    pub fn parse_name(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "person" => EntityType::Person,
            "place" => EntityType::Place,
            "technology" => EntityType::Technology,
            "decision" => EntityType::Decision,
            "preference" => EntityType::Preference,
            "constraint" => EntityType::Constraint,
            "goal" => EntityType::Goal,
            _ => EntityType::Other,
        }
    }
}

impl std::fmt::Display for EntityType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A fact promoted from the working tier during consolidation Phase 1, or
/// written directly by an explicit fact-ingestion caller.
#[non_exhaustive]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExtractedFact {
    pub id: String,
    pub user_id: String,
    pub conversation_id: String,
    pub key: String,
    pub value: String,
    pub entity_type: EntityType,
    /// Confidence/importance in [0,1] (I6).
    pub importance: f64,
    pub access_count: u32,
    pub last_accessed: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    /// Present once an embedding has been generated (typically 1536-wide,
    /// truncated to the active model's dimensionality elsewhere).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    /// Soft-delete marker used by Phase 2 clustering (open question #2: soft
    /// deleted facts are excluded from reads during the grace period).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    /// Id of the episodic event this fact was folded into, if any, kept for
    /// observability of the promotion chain.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub promoted_to: Option<String>,
}

impl ExtractedFact {
    pub fn new(
        user_id: impl Into<String>,
        conversation_id: impl Into<String>,
        key: impl Into<String>,
        value: impl Into<String>,
        entity_type: EntityType,
        importance: f64,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            conversation_id: conversation_id.into(),
            key: key.into(),
            value: value.into(),
            entity_type,
            importance: importance.clamp(0.0, 1.0),
            access_count: 0,
            last_accessed: now,
            created_at: now,
            embedding: None,
            deleted_at: None,
            promoted_to: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }

    pub fn age(&self) -> chrono::Duration {
        Utc::now() - self.created_at
    }

    pub fn touch(&mut self) {
        self.access_count += 1;
        self.last_accessed = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entity_type_roundtrip() {
        for entity_type in [
            EntityType::Person,
            EntityType::Place,
            EntityType::Technology,
            EntityType::Decision,
            EntityType::Preference,
            EntityType::Constraint,
            EntityType::Goal,
            EntityType::Other,
        ] {
            assert_eq!(EntityType::parse_name(entity_type.as_str()), entity_type);
        }
    }

    #[test]
    fn importance_is_clamped_on_construction() {
        let fact = ExtractedFact::new("u1", "c1", "k", "v", EntityType::Other, 1.4);
        assert_eq!(fact.importance, 1.0);
    }

    #[test]
    fn new_fact_is_not_deleted() {
        let fact = ExtractedFact::new("u1", "c1", "k", "v", EntityType::Other, 0.5);
        assert!(!fact.is_deleted());
    }

    #[test]
    fn touch_increments_access_count() {
        let mut fact = ExtractedFact::new("u1", "c1", "k", "v", EntityType::Other, 0.5);
        fact.touch();
        fact.touch();
        assert_eq!(fact.access_count, 2);
    }
}
