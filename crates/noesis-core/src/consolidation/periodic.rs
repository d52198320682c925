//! Background consolidation task (§4.6 periodic trigger, §5 concurrency
//! model): a single long-running task, spawned once at startup, that fires
//! the pipeline every `consolidation.period` across every user the
//! orchestrator has seen, plus an in-memory channel callers use to request
//! on-demand cycles (threshold and manual triggers).
//!
//! Per §5: "Consolidation is serialized per (user, conv): at most one
//! consolidation cycle per key runs at a time; callers requesting a cycle
//! while one is in flight observe the in-flight cycle's completion
//! (coalesced, not queued)." [`ConsolidationScheduler`] implements that by
//! tracking an in-flight [`Notify`] per user: a caller that finds a cycle
//! already running waits on it and reads the cycle's own report rather than
//! starting a second cycle.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{Mutex, Notify};

use crate::collaborator::EmbeddingAndCompletion;
use crate::config::ConsolidationConfig;
use crate::error::Result;
use crate::metrics::MetricsSink;
use crate::storage::Repositories;

use super::pipeline::{run_cycle, ConsolidationReport, Trigger};

struct SchedulerState {
    /// Users seen via `track_user`, swept on every periodic tick.
    known_users: Mutex<HashSet<String>>,
    /// Per-user in-flight marker. Present while a cycle for that user is
    /// running; removed once it completes.
    in_flight: Mutex<HashMap<String, Arc<Notify>>>,
    /// Most recent report per user, read by callers that coalesced onto an
    /// in-flight cycle rather than running their own.
    last_report: Mutex<HashMap<String, Arc<Result<ConsolidationReport, String>>>>,
}

/// Owns the background periodic task's cancellation handle and exposes the
/// coalescing on-demand entry point used by the orchestrator's threshold
/// and manual triggers.
pub struct ConsolidationScheduler {
    state: Arc<SchedulerState>,
    repos: Arc<Repositories>,
    collaborator: Arc<dyn EmbeddingAndCompletion>,
    config: ConsolidationConfig,
    metrics: Arc<MetricsSink>,
    tick_task: Option<tokio::task::JoinHandle<()>>,
    cancel: Arc<Notify>,
}

impl ConsolidationScheduler {
    pub fn new(
        repos: Arc<Repositories>,
        collaborator: Arc<dyn EmbeddingAndCompletion>,
        config: ConsolidationConfig,
        metrics: Arc<MetricsSink>,
    ) -> Self {
        Self {
            state: Arc::new(SchedulerState {
                known_users: Mutex::new(HashSet::new()),
                in_flight: Mutex::new(HashMap::new()),
                last_report: Mutex::new(HashMap::new()),
            }),
            repos,
            collaborator,
            config,
            metrics,
            tick_task: None,
            cancel: Arc::new(Notify::new()),
        }
    }

    /// Registers `user` as eligible for the periodic sweep. Idempotent;
    /// called by the orchestrator on every `Store`.
    pub async fn track_user(&self, user: &str) {
        self.state.known_users.lock().await.insert(user.to_string());
    }

    /// Spawns the periodic tick task. Calling this twice leaks the first
    /// task's handle (it keeps running); callers should only spawn once per
    /// scheduler instance, matching "a single consolidation task spawned at
    /// startup" (§9).
    pub fn spawn(&mut self) {
        let state = self.state.clone();
        let repos = self.repos.clone();
        let collaborator = self.collaborator.clone();
        let config = self.config.clone();
        let metrics = self.metrics.clone();
        let cancel = self.cancel.clone();
        let period = config.period;

        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await; // first tick fires immediately; skip it
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        let users: Vec<String> = state.known_users.lock().await.iter().cloned().collect();
                        for user in users {
                            let _ = request_cycle(
                                &state, &repos, collaborator.as_ref(), &config, &metrics, &user, Trigger::Periodic,
                                false,
                            )
                            .await;
                        }
                    }
                    _ = cancel.notified() => break,
                }
            }
        });
        self.tick_task = Some(handle);
    }

    /// Cooperative cancellation (§5): signals the periodic task to stop
    /// after its current tick's in-memory step, and awaits its exit.
    pub async fn shutdown(&mut self) {
        self.cancel.notify_one();
        if let Some(handle) = self.tick_task.take() {
            let _ = handle.await;
        }
    }

    /// On-demand cycle request (threshold or manual trigger). Coalesces
    /// onto an in-flight cycle for the same user rather than queuing a
    /// second one, unless `force` is set.
    pub async fn request(&self, user: &str, trigger: Trigger, force: bool) -> Result<ConsolidationReport> {
        request_cycle(
            &self.state,
            &self.repos,
            self.collaborator.as_ref(),
            &self.config,
            &self.metrics,
            user,
            trigger,
            force,
        )
        .await
    }
}

/// `force=true` (§6's `Consolidate(..., force?)`) never reuses a coalesced
/// report: it waits out any in-flight cycle for `user`, then runs its own
/// fresh one. `force=false` is the ordinary coalescing path (§5).
async fn request_cycle(
    state: &SchedulerState,
    repos: &Repositories,
    collaborator: &dyn EmbeddingAndCompletion,
    config: &ConsolidationConfig,
    metrics: &MetricsSink,
    user: &str,
    trigger: Trigger,
    force: bool,
) -> Result<ConsolidationReport> {
    loop {
        let notify = {
            let mut in_flight = state.in_flight.lock().await;
            if let Some(existing) = in_flight.get(user) {
                Some(existing.clone())
            } else {
                in_flight.insert(user.to_string(), Arc::new(Notify::new()));
                None
            }
        };

        let Some(notify) = notify else { break };

        // Another cycle for this user is already running: coalesce onto it
        // rather than starting a second one.
        notify.notified().await;
        if !force {
            let reports = state.last_report.lock().await;
            return match reports.get(user) {
                Some(result) => (**result).clone().map_err(crate::error::EngineError::Conflict),
                None => Err(crate::error::EngineError::Internal(format!(
                    "no report recorded for coalesced consolidation cycle (user {user})"
                ))),
            };
        }
        // forced: loop around and try to claim the in-flight slot ourselves
    }

    let outcome = run_cycle(repos, collaborator, config, metrics, user, trigger).await;
    let stored = outcome.as_ref().map(Clone::clone).map_err(|e| e.to_string());

    state.last_report.lock().await.insert(user.to_string(), Arc::new(stored));
    let notify = state.in_flight.lock().await.remove(user);
    if let Some(notify) = notify {
        notify.notify_waiters();
    }

    outcome
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborator::{CollaboratorError, CollaboratorResult, Entity};
    use crate::storage::InProcessDriver;
    use async_trait::async_trait;

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

    fn scheduler() -> ConsolidationScheduler {
        let driver = Arc::new(InProcessDriver::new(std::time::Duration::from_secs(3600)));
        let repos = Arc::new(Repositories {
            working: Box::new(driver.clone()),
            semantic: Box::new(driver.clone()),
            episodic: Box::new(driver.clone()),
            procedural: Box::new(driver),
        });
        ConsolidationScheduler::new(
            repos,
            Arc::new(NoopCollaborator),
            ConsolidationConfig::default(),
            Arc::new(MetricsSink::new()),
        )
    }

    #[tokio::test]
    async fn request_runs_a_cycle_and_reports_zero_activity_on_empty_user() {
        let scheduler = scheduler();
        let report = scheduler.request("u1", Trigger::Manual, false).await.unwrap();
        assert_eq!(report.phase1.facts_created, 0);
    }

    #[tokio::test]
    async fn concurrent_requests_for_same_user_coalesce() {
        let scheduler = Arc::new(scheduler());
        let a = scheduler.clone();
        let b = scheduler.clone();
        let (ra, rb) = tokio::join!(
            tokio::spawn(async move { a.request("u1", Trigger::Manual, false).await }),
            tokio::spawn(async move { b.request("u1", Trigger::Manual, false).await }),
        );
        assert!(ra.unwrap().is_ok());
        assert!(rb.unwrap().is_ok());
    }

    #[tokio::test]
    async fn track_user_registers_for_periodic_sweep() {
        let scheduler = scheduler();
        scheduler.track_user("u1").await;
        assert!(scheduler.state.known_users.lock().await.contains("u1"));
    }
}
