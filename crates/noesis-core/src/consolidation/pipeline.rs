//! Consolidation pipeline (C6, §4.6): runs the three phases for a single
//! `(user, conv)` as one logical unit, retrying the whole cycle with
//! exponential backoff on failure and reporting real per-phase statistics.
//!
//! §4.6 calls each cycle "a single atomic unit" that rolls back on failure.
//! The storage layer has no cross-tier transaction primitive (drivers are
//! independent per-tier repositories, possibly different backends), so
//! atomicity here means: on any phase's error, the cycle stops advancing
//! phases and is retried from the top; already-committed per-item writes
//! from the failed attempt are not undone; instead, promotion candidate
//! queries are idempotent against their own already-promoted/already-deleted
//! state, so a retried cycle converges rather than double-applying.

use std::time::Instant;

use crate::collaborator::EmbeddingAndCompletion;
use crate::config::ConsolidationConfig;
use crate::error::{EngineError, Result};
use crate::metrics::MetricsSink;
use crate::storage::Repositories;

use super::phases::{
    phase1_working_to_semantic, phase2_semantic_to_episodic, phase3_episodic_to_procedural, Phase1Stats,
    Phase2Stats, Phase3Stats,
};

/// Why a consolidation cycle ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    /// Working-tier count for the (user, conv) reached `threshold_messages`.
    ThresholdPerConversation,
    /// Global working-tier count for the user exceeded `working.max_items`.
    ThresholdGlobal,
    /// The background periodic task's tick fired.
    Periodic,
    /// A caller invoked `Consolidate` directly.
    Manual,
}

/// The full report returned by a completed cycle (§9 open question #3: real
/// per-phase counts, never a derived placeholder).
#[derive(Debug, Clone)]
pub struct ConsolidationReport {
    pub user: String,
    pub trigger: Trigger,
    pub attempts: u32,
    pub phase1: Phase1Stats,
    pub phase2: Phase2Stats,
    pub phase3: Phase3Stats,
    pub total_duration_ms: u64,
}

/// Runs one consolidation cycle for `user`, retrying the entire three-phase
/// sequence up to `config.max_retry_attempts` times with exponential
/// backoff (base `config.retry_backoff_base`) on any phase failure.
/// Persistent failure is logged and surfaced as [`EngineError::Conflict`];
/// the caller is expected to treat this as "cycle abandoned, no further
/// state guaranteed beyond what individual phases already committed".
pub async fn run_cycle(
    repos: &Repositories,
    collaborator: &dyn EmbeddingAndCompletion,
    config: &ConsolidationConfig,
    metrics: &MetricsSink,
    user: &str,
    trigger: Trigger,
) -> Result<ConsolidationReport> {
    let start = Instant::now();
    let mut last_err = None;

    for attempt in 0..config.max_retry_attempts.max(1) {
        match run_phases_once(repos, collaborator, config, user).await {
            Ok((phase1, phase2, phase3)) => {
                let report = ConsolidationReport {
                    user: user.to_string(),
                    trigger,
                    attempts: attempt + 1,
                    phase1,
                    phase2,
                    phase3,
                    total_duration_ms: start.elapsed().as_millis() as u64,
                };
                metrics.record("consolidation.cycle", start.elapsed(), Some(user));
                return Ok(report);
            }
            Err(err) => {
                tracing::warn!(user, attempt, error = %err, "consolidation cycle attempt failed");
                last_err = Some(err);
                if attempt + 1 < config.max_retry_attempts {
                    let backoff = config.retry_backoff_base * 2u32.pow(attempt);
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }

    let message = last_err.map(|e| e.to_string()).unwrap_or_else(|| "unknown error".into());
    tracing::error!(user, "consolidation cycle abandoned after {} attempts: {message}", config.max_retry_attempts);
    Err(EngineError::Conflict(format!(
        "consolidation cycle for user {user} failed after {} attempts: {message}",
        config.max_retry_attempts
    )))
}

async fn run_phases_once(
    repos: &Repositories,
    collaborator: &dyn EmbeddingAndCompletion,
    config: &ConsolidationConfig,
    user: &str,
) -> Result<(Phase1Stats, Phase2Stats, Phase3Stats)> {
    let phase1 = phase1_working_to_semantic(repos, collaborator, user).await?;
    let phase2 = phase2_semantic_to_episodic(repos, collaborator, config, user).await?;
    let phase3 = phase3_episodic_to_procedural(repos, config, user).await?;
    Ok((phase1, phase2, phase3))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborator::{CollaboratorError, CollaboratorResult, Entity};
    use crate::model::{Message, Role};
    use crate::storage::{InProcessDriver, WorkingRepo};
    use async_trait::async_trait;
    use std::sync::Arc;

    struct NoopCollaborator;

    #[async_trait]
    impl EmbeddingAndCompletion for NoopCollaborator {
        async fn embed(&self, _text: &str) -> CollaboratorResult<Vec<f32>> {
            Err(CollaboratorError::Unavailable("no embedder in test".into()))
        }
        async fn classify_query(&self, _text: &str) -> CollaboratorResult<String> {
            Err(CollaboratorError::Unavailable("test".into()))
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

    fn repos() -> Repositories {
        let driver = Arc::new(InProcessDriver::new(std::time::Duration::from_secs(3600)));
        Repositories {
            working: Box::new(driver.clone()),
            semantic: Box::new(driver.clone()),
            episodic: Box::new(driver.clone()),
            procedural: Box::new(driver),
        }
    }

    #[tokio::test]
    async fn cycle_on_quiet_conversation_is_idempotent() {
        let repos = repos();
        let collaborator = NoopCollaborator;
        let config = ConsolidationConfig::default();
        let metrics = MetricsSink::new();

        let first = run_cycle(&repos, &collaborator, &config, &metrics, "u1", Trigger::Manual)
            .await
            .unwrap();
        let second = run_cycle(&repos, &collaborator, &config, &metrics, "u1", Trigger::Manual)
            .await
            .unwrap();

        assert_eq!(first.phase1.facts_created, 0);
        assert_eq!(second.phase1.facts_created, 0);
    }

    #[tokio::test]
    async fn cycle_promotes_eligible_message_and_records_metrics() {
        let repos = repos();
        let collaborator = NoopCollaborator;
        let config = ConsolidationConfig::default();
        let metrics = MetricsSink::new();

        let mut msg = Message::new("u1", "c1", Role::User, "we decided on the new plan");
        msg.importance_score = 0.95;
        WorkingRepo::add(&repos.working, "u1", "c1", msg).await.unwrap();

        let report = run_cycle(&repos, &collaborator, &config, &metrics, "u1", Trigger::ThresholdPerConversation)
            .await
            .unwrap();
        assert_eq!(report.phase1.facts_created, 1);
        assert_eq!(report.attempts, 1);

        let snapshot = metrics.snapshot(chrono::Duration::hours(1));
        assert!(snapshot.by_op.contains_key("consolidation.cycle"));
    }
}
