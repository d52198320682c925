//! The procedural tier's unit: a learned routine matched against incoming
//! queries by [`crate::pattern`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How a [`Trigger`] is evaluated against a query.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TriggerKind {
    Keyword,
    Regex,
    Semantic,
}

/// One matchable condition within a [`ProceduralPattern`]'s trigger list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trigger {
    pub kind: TriggerKind,
    pub pattern: String,
}

/// A learned routine: when any trigger matches, `instruction_template` is
/// injected into the assembled context.
#[non_exhaustive]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProceduralPattern {
    pub id: String,
    pub user_id: String,
    pub name: String,
    pub description: String,
    pub triggers: Vec<Trigger>,
    pub instruction_template: String,
    /// Minimum cosine similarity for this pattern's semantic triggers, and
    /// the threshold below which it is not eligible to be the plan's
    /// `suggested_pattern_id` (I6: stays in [0,1]).
    pub confidence_threshold: f64,
    pub usage_count: u64,
    pub last_used: Option<DateTime<Utc>>,
    pub success_count: u64,
    pub failure_count: u64,
    pub created_at: DateTime<Utc>,
    /// Present once a semantic trigger has had its pattern embedding
    /// computed by the collaborator.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
}

impl ProceduralPattern {
    pub fn new(
        user_id: impl Into<String>,
        name: impl Into<String>,
        description: impl Into<String>,
        triggers: Vec<Trigger>,
        instruction_template: impl Into<String>,
        confidence_threshold: f64,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            name: name.into(),
            description: description.into(),
            triggers,
            instruction_template: instruction_template.into(),
            confidence_threshold: confidence_threshold.clamp(0.0, 1.0),
            usage_count: 0,
            last_used: None,
            success_count: 0,
            failure_count: 0,
            created_at: Utc::now(),
            embedding: None,
        }
    }

    pub fn touch(&mut self) {
        self.usage_count += 1;
        self.last_used = Some(Utc::now());
    }

    pub fn record_success(&mut self) {
        self.success_count += 1;
    }

    pub fn record_failure(&mut self) {
        self.failure_count += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> ProceduralPattern {
        ProceduralPattern::new(
            "u1",
            "database_trigger",
            "fires on database questions",
            vec![Trigger {
                kind: TriggerKind::Keyword,
                pattern: "database".to_string(),
            }],
            "Remember the user's database preference.",
            0.5,
        )
    }

    #[test]
    fn confidence_threshold_is_clamped() {
        let pattern = ProceduralPattern::new(
            "u1",
            "n",
            "d",
            vec![],
            "t",
            1.5,
        );
        assert_eq!(pattern.confidence_threshold, 1.0);
    }

    #[test]
    fn touch_updates_usage_and_last_used() {
        let mut pattern = sample();
        assert!(pattern.last_used.is_none());
        pattern.touch();
        assert_eq!(pattern.usage_count, 1);
        assert!(pattern.last_used.is_some());
    }

    #[test]
    fn success_and_failure_counters_are_independent() {
        let mut pattern = sample();
        pattern.record_success();
        pattern.record_success();
        pattern.record_failure();
        assert_eq!(pattern.success_count, 2);
        assert_eq!(pattern.failure_count, 1);
    }
}
