//! The query planner's output value.

use serde::{Deserialize, Serialize};

/// The five query kinds the planner classifies into, each with a default
/// ordered layer set (overridable via explicit pattern match results).
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryKind {
    Continuation,
    FactRetrieval,
    DeepRecall,
    Complex,
    ProceduralTrigger,
}

impl QueryKind {
    /// The default ordered layer set for this kind, per the planner's
    /// classification table.
    pub fn default_layers(self) -> Vec<MemoryLayer> {
        use MemoryLayer::*;
        match self {
            QueryKind::Continuation => vec![Working],
            QueryKind::FactRetrieval => vec![Working, Semantic],
            QueryKind::DeepRecall => vec![Working, Episodic],
            QueryKind::Complex => vec![Working, Semantic, Episodic],
            QueryKind::ProceduralTrigger => vec![Procedural, Working, Semantic],
        }
    }
}

/// One of the four memory tiers.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryLayer {
    Working,
    Semantic,
    Episodic,
    Procedural,
}

/// The planner's decision: which tiers to read, in what order, and how much
/// budget to spend assembling the resulting context.
#[non_exhaustive]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryPlan {
    pub kind: QueryKind,
    pub layers: Vec<MemoryLayer>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_pattern_id: Option<String>,
    pub estimated_tokens: u32,
    pub include_history: bool,
}

impl QueryPlan {
    pub fn for_kind(kind: QueryKind, estimated_tokens: u32) -> Self {
        Self {
            layers: kind.default_layers(),
            kind,
            suggested_pattern_id: None,
            estimated_tokens,
            include_history: matches!(kind, QueryKind::DeepRecall | QueryKind::Complex),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn continuation_reads_only_working() {
        assert_eq!(
            QueryKind::Continuation.default_layers(),
            vec![MemoryLayer::Working]
        );
    }

    #[test]
    fn fact_retrieval_includes_semantic() {
        assert!(QueryKind::FactRetrieval
            .default_layers()
            .contains(&MemoryLayer::Semantic));
    }

    #[test]
    fn deep_recall_includes_episodic() {
        assert!(QueryKind::DeepRecall
            .default_layers()
            .contains(&MemoryLayer::Episodic));
    }

    #[test]
    fn procedural_trigger_puts_procedural_first() {
        let layers = QueryKind::ProceduralTrigger.default_layers();
        assert_eq!(layers.first(), Some(&MemoryLayer::Procedural));
    }
}
