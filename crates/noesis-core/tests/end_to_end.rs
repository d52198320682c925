//! Cross-component scenarios exercised against the public API surface:
//! store-and-recall, threshold-triggered consolidation, query-plan
//! classification, procedural pattern matching, and user erasure.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use noesis_core::storage::{InProcessDriver, Repositories};
use noesis_core::{
    CollaboratorError, CollaboratorResult, EmbeddingAndCompletion, Entity, EngineConfig, HeuristicsConfig,
    ImportanceWeights, MemoryEngine, MemoryLayer, PatternTrigger, ProceduralPattern, ProceduralRepo, QueryKind, Role,
    TriggerKind,
};

struct NoopCollaborator;

#[async_trait]
impl EmbeddingAndCompletion for NoopCollaborator {
    async fn embed(&self, _text: &str) -> CollaboratorResult<Vec<f32>> {
        Err(CollaboratorError::Unavailable("no embedder in test".into()))
    }
    async fn classify_query(&self, _text: &str) -> CollaboratorResult<String> {
        Err(CollaboratorError::Unavailable("no classifier in test".into()))
    }
    async fn extract_entities(&self, _text: &str) -> CollaboratorResult<Vec<Entity>> {
        Ok(vec![])
    }
    async fn complete(&self, _prompt: &str, _max_tokens: u32) -> CollaboratorResult<String> {
        Err(CollaboratorError::Unavailable("no completion in test".into()))
    }
    async fn answer_with_context(&self, _query: &str, _context: &str) -> CollaboratorResult<String> {
        Err(CollaboratorError::Unavailable("no completion in test".into()))
    }
    async fn analyze_sentiment(&self, _text: &str) -> CollaboratorResult<(f64, String)> {
        Ok((0.0, "neutral".into()))
    }
}

async fn engine_with(config: EngineConfig) -> MemoryEngine {
    MemoryEngine::new(config, Arc::new(NoopCollaborator)).await.unwrap()
}

async fn engine() -> MemoryEngine {
    engine_with(EngineConfig::default()).await
}

/// Store + recent: a single stored message comes back from `get_messages`
/// with the content and role it was stored with, and a composite importance
/// score in range.
#[tokio::test]
async fn store_then_recent_round_trips_the_message() {
    let engine = engine().await;
    engine.add_message("u1", "c1", Role::User, "Hi", None).await.unwrap();

    let messages = engine.get_messages("u1", "c1", 5, None, None, None).await.unwrap();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].role, Role::User);
    assert_eq!(messages[0].content, "Hi");
    assert!(messages[0].importance_score >= 0.0 && messages[0].importance_score <= 1.0);
}

/// Threshold-triggered consolidation: once a conversation crosses the
/// configured message threshold, the working tier sheds its oldest entries
/// into the semantic tier as facts.
///
/// The default importance weights can't push a single message's composite
/// score above ~0.86 (the question-signal term alone caps the weighted sum
/// below 1.0), so this test concentrates the weights onto the decision-marker
/// signal and stores messages carrying an explicit marker (`TODO`), which the
/// importance engine forces to 1.0 regardless of content. This exercises the
/// real `add_message` -> `ImportanceEngine::score` path rather than forging
/// an `importance_score` directly.
#[tokio::test]
async fn threshold_triggered_consolidation_promotes_facts_and_trims_working_tier() {
    let mut config = EngineConfig::default();
    config.heuristics = HeuristicsConfig {
        importance_weights: ImportanceWeights {
            base: 0.0,
            decision_marker: 1.0,
            question: 0.0,
            novelty: 0.0,
            sentiment: 0.0,
            technical_depth: 0.0,
            recency: 0.0,
        },
        dampening: 1.0,
        ..HeuristicsConfig::default()
    };
    let engine = engine_with(config).await;

    for i in 0..21 {
        engine
            .add_message(
                "u1",
                "c1",
                Role::User,
                &format!("TODO decided item {i}: remember this from now on"),
                None,
            )
            .await
            .unwrap();
    }

    // The 21st store fires threshold consolidation in the background; force
    // a fresh cycle now so the assertions below observe its result
    // deterministically instead of racing the spawned task.
    engine.consolidate("u1", None, true).await.unwrap();

    let working = engine
        .get_messages("u1", "c1", 100, None, None, Some(MemoryLayer::Working))
        .await
        .unwrap();
    assert!(working.len() <= 20, "working tier should be trimmed by consolidation, got {}", working.len());

    let context = engine.get_context("u1", "c1", "what did we decide?").await.unwrap();
    assert!(
        context.rendered_context.contains("Known facts:"),
        "expected at least one promoted fact in the rendered context: {}",
        context.rendered_context
    );
}

/// Pattern classification: surface dictionaries route each query to the
/// tiers named in the scenario without needing the external collaborator.
#[tokio::test]
async fn query_plan_classification_selects_expected_layers() {
    let engine = engine().await;
    engine.add_message("u1", "c1", Role::User, "hello", None).await.unwrap();

    let continuation = engine.get_context("u1", "c1", "continue").await.unwrap();
    assert_eq!(continuation.query_plan.kind, QueryKind::Continuation);
    assert_eq!(continuation.query_plan.layers, vec![MemoryLayer::Working]);

    let fact = engine
        .get_context("u1", "c1", "what is the user's email?")
        .await
        .unwrap();
    assert!(fact.query_plan.layers.contains(&MemoryLayer::Semantic));

    let recall = engine
        .get_context("u1", "c1", "show me exactly what I said earlier")
        .await
        .unwrap();
    assert!(recall.query_plan.layers.contains(&MemoryLayer::Episodic));
}

/// Procedural match: a pattern registered directly against the procedural
/// tier is surfaced by `get_context` as `applied_pattern` once its trigger
/// matches. There's no public API to register a pattern (only consolidation
/// phase 3 creates one in production), so this seeds it at the storage layer,
/// then hands the same repos to a real `MemoryEngine` via `from_repos` and
/// exercises the match through `get_context` rather than bypassing the engine.
#[tokio::test]
async fn procedural_pattern_is_applied_when_its_trigger_matches() {
    let driver = Arc::new(InProcessDriver::new(Duration::from_secs(3600)));
    let pattern = ProceduralPattern::new(
        "u1",
        "database-helper",
        "surfaces the schema reminder when databases come up",
        vec![PatternTrigger {
            kind: TriggerKind::Keyword,
            pattern: "database".into(),
        }],
        "Remember the schema migration policy.",
        0.5,
    );
    ProceduralRepo::upsert(driver.as_ref(), pattern.clone()).await.unwrap();

    let repos = Arc::new(Repositories {
        working: Box::new(driver.clone()),
        semantic: Box::new(driver.clone()),
        episodic: Box::new(driver.clone()),
        procedural: Box::new(driver.clone()),
    });
    let engine = MemoryEngine::from_repos(repos, EngineConfig::default(), Arc::new(NoopCollaborator)).await;

    let context = engine.get_context("u1", "c1", "I need a database").await.unwrap();
    assert!(
        context.rendered_context.contains("Remember the schema migration policy."),
        "expected the matched pattern's instruction in the rendered context: {}",
        context.rendered_context
    );

    engine.shutdown().await;
}

/// Forget-user: after `forget_user`, every tier is empty for that user.
#[tokio::test]
async fn forget_user_clears_every_tier() {
    let engine = engine().await;
    engine.add_message("u1", "c1", Role::User, "secret", None).await.unwrap();
    engine.create_conversation("u1", "chat", None).await.unwrap();

    engine.forget_user("u1").await.unwrap();

    let messages = engine.get_messages("u1", "c1", 10, None, None, None).await.unwrap();
    assert!(messages.is_empty());
    let patterns = engine.list_patterns("u1").await.unwrap();
    assert!(patterns.is_empty());
}
