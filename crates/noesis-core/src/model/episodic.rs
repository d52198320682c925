//! The episodic tier's unit: a time-anchored record, either an archived
//! message or a cluster summary detected during consolidation Phase 2.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A time-anchored event. `event_type="message"` marks a message that was
/// consolidated straight into the episodic tier (bypassing Phase 2
/// clustering because it arrived as episodic content directly, e.g. an
/// archived turn); other event types are produced by consolidation.
#[non_exhaustive]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EpisodicEvent {
    pub id: String,
    pub user_id: String,
    pub conversation_id: String,
    pub event_type: String,
    pub content: String,
    pub occurred_at: DateTime<Utc>,
    /// In (0,1]; influences ranking decay over time.
    pub decay_factor: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub embedding: Option<Vec<f32>>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl EpisodicEvent {
    pub fn new(
        user_id: impl Into<String>,
        conversation_id: impl Into<String>,
        event_type: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            conversation_id: conversation_id.into(),
            event_type: event_type.into(),
            content: content.into(),
            occurred_at: Utc::now(),
            decay_factor: 1.0,
            embedding: None,
            metadata: HashMap::new(),
        }
    }

    /// Average-success metadata field used by Phase 3 grouping; defaults to
    /// 1.0 when absent, per §4.6.
    pub fn success_rate(&self) -> f64 {
        self.metadata
            .get("success_rate")
            .and_then(|v| v.parse::<f64>().ok())
            .unwrap_or(1.0)
    }

    pub fn is_consolidated(&self) -> bool {
        self.metadata
            .get("consolidated")
            .map(|v| v == "true")
            .unwrap_or(false)
    }

    pub fn mark_consolidated(&mut self) {
        self.metadata
            .insert("consolidated".to_string(), "true".to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_success_rate_is_one() {
        let event = EpisodicEvent::new("u1", "c1", "message", "hi");
        assert_eq!(event.success_rate(), 1.0);
    }

    #[test]
    fn explicit_success_rate_is_read_back() {
        let mut event = EpisodicEvent::new("u1", "c1", "retry", "failed then worked");
        event
            .metadata
            .insert("success_rate".to_string(), "0.75".to_string());
        assert_eq!(event.success_rate(), 0.75);
    }

    #[test]
    fn mark_consolidated_is_observable() {
        let mut event = EpisodicEvent::new("u1", "c1", "message", "hi");
        assert!(!event.is_consolidated());
        event.mark_consolidated();
        assert!(event.is_consolidated());
    }
}
