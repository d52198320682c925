//! Query planner ("prefrontal", C4, §4.4): classifies an incoming query
//! into one of five kinds and emits a [`QueryPlan`] naming which tiers to
//! read and how much budget the orchestrator may spend assembling context.
//!
//! Classification is two-staged: a pure, non-suspending surface pattern
//! match (dictionaries per kind) first; if its confidence falls below
//! `specific_layers_threshold`, the planner defers to the external
//! [`EmbeddingAndCompletion`] collaborator. An unavailable or unrecognized
//! collaborator response defaults to [`QueryKind::Complex`] (§4.4).

use std::sync::LazyLock;

use regex::Regex;

use crate::collaborator::EmbeddingAndCompletion;
use crate::config::{HeuristicsConfig, PlannerWeights};
use crate::model::{QueryKind, QueryPlan};

/// A summary of conversation state the planner's contextual signal consults,
/// cheaper to pass in than re-deriving from the full message history.
#[derive(Debug, Clone, Copy, Default)]
pub struct ConversationState {
    pub turn_count: u32,
    pub elapsed_since_last_query_secs: f64,
    pub recent_message_count: u32,
}

static NEGATION: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\b(not|don't|never|no)\b").unwrap());
static INTENSITY: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"!{2,}|\b(exactly|precisely|literally)\b").unwrap());

struct KindDictionary {
    kind: QueryKind,
    phrases: &'static [&'static str],
}

static DICTIONARIES: LazyLock<Vec<KindDictionary>> = LazyLock::new(|| {
    vec![
        KindDictionary {
            kind: QueryKind::Continuation,
            phrases: &["continue", "go on", "keep going", "and then", "what else"],
        },
        KindDictionary {
            kind: QueryKind::FactRetrieval,
            phrases: &["what is", "what's", "who is", "who's", "when did", "where is", "what was my"],
        },
        KindDictionary {
            kind: QueryKind::DeepRecall,
            phrases: &[
                "exactly what i said",
                "show me the code from earlier",
                "word for word",
                "earlier in this conversation",
                "what did i say",
            ],
        },
        KindDictionary {
            kind: QueryKind::Complex,
            phrases: &["compare", "analyze", "pros and cons", "trade-off", "walk me through"],
        },
    ]
});

/// Stage (a) surface score for a single kind: fraction of its dictionary
/// phrases present in `query`, adjusted by negation/intensity/contextual
/// signals, weighted per [`PlannerWeights`].
fn surface_score(query: &str, dict: &KindDictionary, state: ConversationState, weights: &PlannerWeights) -> f64 {
    let lower = query.to_lowercase();
    let hits = dict.phrases.iter().filter(|phrase| lower.contains(*phrase)).count();
    if hits == 0 {
        return 0.0;
    }
    let raw = (hits as f64 / dict.phrases.len() as f64 * 2.0).min(1.0);

    let negated = NEGATION.is_match(&lower);
    let intense = INTENSITY.is_match(&lower);

    let contextual = match dict.kind {
        QueryKind::Continuation if state.elapsed_since_last_query_secs < 60.0 && state.turn_count > 1 => 1.0,
        QueryKind::DeepRecall if state.recent_message_count > 10 => 1.0,
        _ => 0.0,
    };

    let mut score =
        weights.surface * raw + weights.contextual * contextual + if intense { weights.intensity } else { 0.0 };
    if negated {
        score -= weights.negation;
    }
    score.clamp(0.0, 1.0)
}

/// Stage (a) result: the best-scoring kind and its confidence.
struct SurfaceClassification {
    kind: QueryKind,
    confidence: f64,
}

fn classify_surface(query: &str, state: ConversationState, weights: &PlannerWeights) -> SurfaceClassification {
    let mut best = SurfaceClassification {
        kind: QueryKind::Complex,
        confidence: 0.0,
    };
    for dict in DICTIONARIES.iter() {
        let score = surface_score(query, dict, state, weights);
        if score > best.confidence {
            best = SurfaceClassification { kind: dict.kind, confidence: score };
        }
    }
    best
}

fn parse_collaborator_label(label: &str) -> Option<QueryKind> {
    match label.trim().to_lowercase().as_str() {
        "continuation" => Some(QueryKind::Continuation),
        "fact_retrieval" | "fact-retrieval" => Some(QueryKind::FactRetrieval),
        "deep_recall" | "deep-recall" => Some(QueryKind::DeepRecall),
        "complex" => Some(QueryKind::Complex),
        "procedural_trigger" | "procedural-trigger" => Some(QueryKind::ProceduralTrigger),
        _ => None,
    }
}

/// Classifies `query` and builds its [`QueryPlan`]. `has_procedural_match`
/// is decided by C7 before this call; when true, the plan is forced to
/// [`QueryKind::ProceduralTrigger`] regardless of surface/semantic result,
/// matching §4.4's "matches any registered pattern's triggers" rule.
pub struct QueryPlanner<'a> {
    config: &'a HeuristicsConfig,
    collaborator: &'a dyn EmbeddingAndCompletion,
}

impl<'a> QueryPlanner<'a> {
    pub fn new(config: &'a HeuristicsConfig, collaborator: &'a dyn EmbeddingAndCompletion) -> Self {
        Self { config, collaborator }
    }

    pub async fn plan(
        &self,
        query: &str,
        state: ConversationState,
        has_procedural_match: bool,
        suggested_pattern_id: Option<String>,
        tier_budget_tokens: u32,
    ) -> QueryPlan {
        let kind = if has_procedural_match {
            QueryKind::ProceduralTrigger
        } else {
            self.classify(query, state).await
        };

        let mut plan = QueryPlan::for_kind(kind, tier_budget_tokens);
        if matches!(kind, QueryKind::ProceduralTrigger) {
            plan.suggested_pattern_id = suggested_pattern_id;
        }
        plan
    }

    /// The two-stage classification itself, exposed separately from
    /// `plan()` for callers (and tests) that only need the kind.
    pub async fn classify(&self, query: &str, state: ConversationState) -> QueryKind {
        let surface = classify_surface(query, state, &self.config.planner_weights);
        if surface.confidence >= self.config.specific_layers_threshold as f64 {
            return surface.kind;
        }

        match self.collaborator.classify_query(query).await {
            Ok(label) => parse_collaborator_label(&label).unwrap_or(QueryKind::Complex),
            Err(_) => {
                if surface.confidence > 0.0 {
                    surface.kind
                } else {
                    QueryKind::Complex
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborator::{CollaboratorError, CollaboratorResult, Entity};
    use async_trait::async_trait;

    struct UnavailableCollaborator;

    #[async_trait]
    impl EmbeddingAndCompletion for UnavailableCollaborator {
        async fn embed(&self, _text: &str) -> CollaboratorResult<Vec<f32>> {
            Err(CollaboratorError::Unavailable("test".into()))
        }
        async fn classify_query(&self, _text: &str) -> CollaboratorResult<String> {
            Err(CollaboratorError::Unavailable("no llm".into()))
        }
        async fn extract_entities(&self, _text: &str) -> CollaboratorResult<Vec<Entity>> {
            Ok(vec![])
        }
        async fn complete(&self, _prompt: &str, _max_tokens: u32) -> CollaboratorResult<String> {
            Err(CollaboratorError::Unavailable("test".into()))
        }
        async fn answer_with_context(&self, _query: &str, _context: &str) -> CollaboratorResult<String> {
            Err(CollaboratorError::Unavailable("test".into()))
        }
        async fn analyze_sentiment(&self, _text: &str) -> CollaboratorResult<(f64, String)> {
            Ok((0.0, "neutral".into()))
        }
    }

    struct FixedLabelCollaborator(&'static str);

    #[async_trait]
    impl EmbeddingAndCompletion for FixedLabelCollaborator {
        async fn embed(&self, _text: &str) -> CollaboratorResult<Vec<f32>> {
            Ok(vec![])
        }
        async fn classify_query(&self, _text: &str) -> CollaboratorResult<String> {
            Ok(self.0.to_string())
        }
        async fn extract_entities(&self, _text: &str) -> CollaboratorResult<Vec<Entity>> {
            Ok(vec![])
        }
        async fn complete(&self, _prompt: &str, _max_tokens: u32) -> CollaboratorResult<String> {
            Ok(String::new())
        }
        async fn answer_with_context(&self, _query: &str, _context: &str) -> CollaboratorResult<String> {
            Ok(String::new())
        }
        async fn analyze_sentiment(&self, _text: &str) -> CollaboratorResult<(f64, String)> {
            Ok((0.0, "neutral".into()))
        }
    }

    #[tokio::test]
    async fn continue_classifies_to_continuation_with_only_w() {
        let config = HeuristicsConfig::default();
        let collaborator = UnavailableCollaborator;
        let planner = QueryPlanner::new(&config, &collaborator);
        let plan = planner.plan("continue", ConversationState::default(), false, None, 500).await;
        assert_eq!(plan.kind, QueryKind::Continuation);
        assert_eq!(plan.layers, vec![crate::model::MemoryLayer::Working]);
    }

    #[tokio::test]
    async fn fact_question_includes_semantic_layer() {
        let config = HeuristicsConfig::default();
        let collaborator = UnavailableCollaborator;
        let planner = QueryPlanner::new(&config, &collaborator);
        let plan = planner
            .plan("what is the user's email?", ConversationState::default(), false, None, 500)
            .await;
        assert!(plan.layers.contains(&crate::model::MemoryLayer::Semantic));
    }

    #[tokio::test]
    async fn deep_recall_phrase_includes_episodic_layer() {
        let config = HeuristicsConfig::default();
        let collaborator = UnavailableCollaborator;
        let planner = QueryPlanner::new(&config, &collaborator);
        let plan = planner
            .plan(
                "show me exactly what I said earlier",
                ConversationState::default(),
                false,
                None,
                500,
            )
            .await;
        assert!(plan.layers.contains(&crate::model::MemoryLayer::Episodic));
    }

    #[tokio::test]
    async fn procedural_match_forces_procedural_trigger_kind() {
        let config = HeuristicsConfig::default();
        let collaborator = UnavailableCollaborator;
        let planner = QueryPlanner::new(&config, &collaborator);
        let plan = planner
            .plan("I need a database", ConversationState::default(), true, Some("p1".into()), 500)
            .await;
        assert_eq!(plan.kind, QueryKind::ProceduralTrigger);
        assert_eq!(plan.suggested_pattern_id, Some("p1".to_string()));
    }

    #[tokio::test]
    async fn low_confidence_surface_defers_to_collaborator() {
        let config = HeuristicsConfig::default();
        let collaborator = FixedLabelCollaborator("deep_recall");
        let planner = QueryPlanner::new(&config, &collaborator);
        let kind = planner.classify("a vague ambiguous utterance", ConversationState::default()).await;
        assert_eq!(kind, QueryKind::DeepRecall);
    }

    #[tokio::test]
    async fn unavailable_collaborator_and_no_surface_signal_defaults_complex() {
        let config = HeuristicsConfig::default();
        let collaborator = UnavailableCollaborator;
        let planner = QueryPlanner::new(&config, &collaborator);
        let kind = planner.classify("a vague ambiguous utterance", ConversationState::default()).await;
        assert_eq!(kind, QueryKind::Complex);
    }

    #[tokio::test]
    async fn deterministic_for_fixed_config_and_collaborator_output() {
        let config = HeuristicsConfig::default();
        let collaborator = FixedLabelCollaborator("complex");
        let planner = QueryPlanner::new(&config, &collaborator);
        let a = planner.classify("ambiguous text here", ConversationState::default()).await;
        let b = planner.classify("ambiguous text here", ConversationState::default()).await;
        assert_eq!(a, b);
    }
}
