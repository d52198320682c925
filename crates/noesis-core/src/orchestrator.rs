//! Memory orchestrator ("prefrontal executive", C5, §4.5): the engine's
//! single public entry point. Wires the importance engine (C3), query
//! planner (C4), procedural matcher (C7), consolidation scheduler (C6), and
//! the four tier repositories (C1/C2) behind the operations named in §6:
//! `CreateConversation`, `Store`, `GetMessages`, `RetrieveContext`, `Query`,
//! `ForgetMessage`, `ForgetUser`, `Consolidate`, `ListPatterns`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, RwLock};

use crate::collaborator::{CollaboratorError, EmbeddingAndCompletion};
use crate::config::EngineConfig;
use crate::consolidation::{ConsolidationReport, ConsolidationScheduler, Trigger};
use crate::error::{EngineError, Result, StorageError};
use crate::importance::ImportanceEngine;
use crate::metrics::{self, MetricsSink, MetricsSnapshot};
use crate::model::{ExtractedFact, MemoryContext, MemoryLayer, Message, ProceduralPattern, Role};
use crate::pattern;
use crate::planner::{ConversationState, QueryPlanner};
use crate::storage::{DriverFactory, Repositories};

/// Maximum message content length accepted by `add_message` (§7's
/// validation rule: "content > 10 000 chars" is rejected).
const MAX_CONTENT_LEN: usize = 10_000;

/// §7: "tag count > 10" is a validation error, on both `CreateConversation`
/// and `AddMessage`.
const MAX_TAGS: usize = 10;

/// Assumed context-assembly token budget when the caller doesn't carry one
/// in from an upstream request framework.
const DEFAULT_CONTEXT_TOKEN_BUDGET: u32 = 2_000;

/// Per-tier read deadline (§5: "a retrieval deadline of 500ms"). A tier that
/// misses it is dropped from the assembled context and `partial` is set.
const RETRIEVAL_DEADLINE: std::time::Duration = std::time::Duration::from_millis(500);

/// Lookback window for `GetMessages`' episodic backfill. Not configurable
/// (§3 gives episodic events no separate retention knob beyond the fact TTL
/// that feeds Phase 2).
const BACKFILL_LOOKBACK: chrono::Duration = chrono::Duration::days(365);

fn validate_tags(tags: &Option<Vec<String>>) -> Result<()> {
    if let Some(tags) = tags {
        if tags.len() > MAX_TAGS {
            return Err(EngineError::Validation(format!("tag count exceeds {MAX_TAGS}")));
        }
    }
    Ok(())
}

/// In-memory record of a conversation's declared metadata. Conversations
/// have no dedicated tier of their own (§3); this is enough to answer
/// `CreateConversation`'s `title`/`tags` and to let `ForgetUser` sweep the
/// registry clean.
#[derive(Debug, Clone, Default)]
struct ConversationMeta {
    title: String,
    tags: Vec<String>,
}

/// `Query`'s answer plus the memory it was grounded in (§6: `answer +
/// sources`).
#[derive(Debug, Clone)]
pub struct QueryAnswer {
    pub answer: String,
    pub sources: Vec<QuerySource>,
}

/// One item of memory that fed a `Query` answer.
#[derive(Debug, Clone)]
pub struct QuerySource {
    pub layer: MemoryLayer,
    pub id: String,
    pub excerpt: String,
}

/// `GetContext`'s return shape (§6: `rendered_context + token_count +
/// latency_ms`). `query_plan` and `partial` are carried along too since
/// callers inspecting why a context looks thin need them.
#[derive(Debug, Clone)]
pub struct ContextResult {
    pub rendered_context: String,
    pub token_count: u32,
    pub latency_ms: u64,
    pub query_plan: crate::model::QueryPlan,
    pub partial: bool,
}

/// The engine's single public handle. Cheap to clone the `Arc` this is
/// typically wrapped in; internally `Arc`-shared so callers can hold one
/// instance behind a web framework's shared state.
pub struct MemoryEngine {
    repos: Arc<Repositories>,
    collaborator: Arc<dyn EmbeddingAndCompletion>,
    importance: ImportanceEngine,
    config: EngineConfig,
    metrics: Arc<MetricsSink>,
    scheduler: Arc<Mutex<ConsolidationScheduler>>,
    /// user -> conversation id -> declared metadata. Also populated lazily
    /// on first `add_message` to a conversation nobody explicitly created.
    conversations: RwLock<HashMap<String, HashMap<String, ConversationMeta>>>,
}

impl MemoryEngine {
    /// Builds the storage drivers from `config`, then spawns the background
    /// consolidation task (§5: "a single consolidation task spawned at
    /// startup").
    pub async fn new(config: EngineConfig, collaborator: Arc<dyn EmbeddingAndCompletion>) -> Result<Self> {
        let repos = Arc::new(DriverFactory::build(&config).await?);
        let metrics = Arc::new(MetricsSink::new());
        let mut scheduler = ConsolidationScheduler::new(
            repos.clone(),
            collaborator.clone(),
            config.consolidation.clone(),
            metrics.clone(),
        );
        scheduler.spawn();

        Ok(Self {
            importance: ImportanceEngine::new(config.heuristics.clone()),
            repos,
            collaborator,
            config,
            metrics,
            scheduler: Arc::new(Mutex::new(scheduler)),
            conversations: RwLock::new(HashMap::new()),
        })
    }

    /// Builds an engine around already-constructed repositories instead of
    /// going through `DriverFactory::build`, so tests can seed storage (e.g.
    /// a procedural pattern) before the engine ever touches it and then
    /// drive everything through the public API.
    #[cfg(any(test, feature = "test-util"))]
    pub async fn from_repos(
        repos: Arc<Repositories>,
        config: EngineConfig,
        collaborator: Arc<dyn EmbeddingAndCompletion>,
    ) -> Self {
        let metrics = Arc::new(MetricsSink::new());
        let mut scheduler = ConsolidationScheduler::new(
            repos.clone(),
            collaborator.clone(),
            config.consolidation.clone(),
            metrics.clone(),
        );
        scheduler.spawn();

        Self {
            importance: ImportanceEngine::new(config.heuristics.clone()),
            repos,
            collaborator,
            config,
            metrics,
            scheduler: Arc::new(Mutex::new(scheduler)),
            conversations: RwLock::new(HashMap::new()),
        }
    }

    /// Cooperative shutdown (§5): stops the periodic consolidation task and
    /// awaits it. Does not touch in-flight on-demand cycles triggered by
    /// `consolidate` or threshold triggers; those run to completion.
    pub async fn shutdown(&self) {
        self.scheduler.lock().await.shutdown().await;
    }

    pub fn metrics_snapshot(&self, window: chrono::Duration) -> MetricsSnapshot {
        self.metrics.snapshot(window)
    }

    /// `CreateConversation`: registers a new conversation id for `user`
    /// along with its declared `title`/`tags`. Conversations aren't a
    /// stored entity of their own (§3 has no conversation record) — this
    /// only seeds the in-memory registry.
    pub async fn create_conversation(&self, user: &str, title: &str, tags: Option<Vec<String>>) -> Result<String> {
        if user.trim().is_empty() {
            return Err(EngineError::Validation("user id must not be empty".into()));
        }
        validate_tags(&tags)?;

        let conv_id = uuid::Uuid::new_v4().to_string();
        self.conversations.write().await.entry(user.to_string()).or_default().insert(
            conv_id.clone(),
            ConversationMeta {
                title: title.to_string(),
                tags: tags.unwrap_or_default(),
            },
        );
        Ok(conv_id)
    }

    /// `Store`: validates, scores, and writes one message to the working
    /// tier, then does three things in the background rather than on the
    /// caller's critical path: tracks `user` for the periodic consolidation
    /// sweep, best-effort entity extraction, and a threshold-triggered
    /// consolidation cycle if either the per-conversation or the per-user
    /// global threshold has been crossed.
    pub async fn add_message(
        &self,
        user: &str,
        conv: &str,
        role: Role,
        content: &str,
        tags: Option<Vec<String>>,
    ) -> Result<Message> {
        metrics::timed(&self.metrics, "add_message", Some(user), async {
            self.add_message_inner(user, conv, role, content, tags).await
        })
        .await
    }

    async fn add_message_inner(
        &self,
        user: &str,
        conv: &str,
        role: Role,
        content: &str,
        tags: Option<Vec<String>>,
    ) -> Result<Message> {
        if user.trim().is_empty() {
            return Err(EngineError::Validation("user id must not be empty".into()));
        }
        if conv.trim().is_empty() {
            return Err(EngineError::Validation("conversation id must not be empty".into()));
        }
        if content.trim().is_empty() {
            return Err(EngineError::Validation("message content must not be empty".into()));
        }
        if content.len() > MAX_CONTENT_LEN {
            return Err(EngineError::Validation(format!(
                "message content exceeds {MAX_CONTENT_LEN} bytes"
            )));
        }
        validate_tags(&tags)?;

        self.register_conversation(user, conv).await;

        let recent = self.repos.working.recent(user, conv, 10).await?;
        let embedding = self.collaborator.embed(content).await.ok();
        // Messages don't persist embeddings (§3), so novelty against recent
        // history falls back to the importance engine's Jaccard estimate.
        let recent_embeddings = vec![None; recent.len()];

        let mut message = Message::new(user, conv, role, content);
        message.tags = tags.unwrap_or_default();
        let breakdown = self
            .importance
            .score(&message, &recent, embedding.as_deref(), &recent_embeddings);
        message.importance_score = breakdown.composite;

        self.repos.working.add(user, conv, message.clone()).await?;
        self.scheduler.lock().await.track_user(user).await;

        self.spawn_entity_extraction(content);
        self.maybe_trigger_threshold_consolidation(user, conv).await?;

        Ok(message)
    }

    /// Inserts a default metadata entry for `(user, conv)` if one doesn't
    /// already exist, so a message added to a conversation nobody
    /// explicitly `create_conversation`-ed still shows up in the registry
    /// `ForgetUser` sweeps.
    async fn register_conversation(&self, user: &str, conv: &str) {
        self.conversations
            .write()
            .await
            .entry(user.to_string())
            .or_default()
            .entry(conv.to_string())
            .or_default();
    }

    /// Entity extraction is logged, not persisted: `WorkingRepo` exposes no
    /// per-item update method, so there is nowhere to write
    /// `extracted_entities` back onto an already-stored message. Kept as a
    /// fire-and-forget observability signal rather than dropped entirely.
    fn spawn_entity_extraction(&self, content: &str) {
        let collaborator = self.collaborator.clone();
        let content = content.to_string();
        tokio::spawn(async move {
            if let Ok(entities) = collaborator.extract_entities(&content).await {
                if !entities.is_empty() {
                    tracing::debug!(count = entities.len(), "extracted entities from new message");
                }
            }
        });
    }

    async fn maybe_trigger_threshold_consolidation(&self, user: &str, conv: &str) -> Result<()> {
        let threshold = self.config.consolidation.threshold_messages as usize;
        let conv_count = self.repos.working.recent(user, conv, threshold + 1).await?.len();
        if conv_count >= threshold {
            self.trigger_background_consolidation(user, Trigger::ThresholdPerConversation);
            return Ok(());
        }

        let total = self.repos.working.total_count(user).await?;
        if total >= self.config.working.max_items {
            self.trigger_background_consolidation(user, Trigger::ThresholdGlobal);
        }
        Ok(())
    }

    fn trigger_background_consolidation(&self, user: &str, trigger: Trigger) {
        let scheduler = self.scheduler.clone();
        let user = user.to_string();
        tokio::spawn(async move {
            if let Err(err) = scheduler.lock().await.request(&user, trigger, false).await {
                tracing::warn!(%user, error = %err, "threshold-triggered consolidation failed");
            }
        });
    }

    /// `GetMessages`: working-tier messages, backfilled from archived
    /// (episodic, `event_type == "message"`) events when `layer` is
    /// unconstrained and the working tier alone doesn't cover `limit`.
    /// Archived events carry no `Role` (§3's `EpisodicEvent` has no role
    /// field), so backfilled entries are synthesized as `Role::User`.
    ///
    /// `layer` restricts the read to a single tier: `Working` or `Episodic`
    /// (the only two tiers whose items are message-shaped). `Semantic` and
    /// `Procedural` hold facts and patterns, not messages, so requesting
    /// either is a validation error rather than a silent empty result.
    pub async fn get_messages(
        &self,
        user: &str,
        conv: &str,
        limit: usize,
        before: Option<DateTime<Utc>>,
        after: Option<DateTime<Utc>>,
        layer: Option<MemoryLayer>,
    ) -> Result<Vec<Message>> {
        let mut combined = match layer {
            Some(MemoryLayer::Working) => self.repos.working.recent(user, conv, limit.max(1)).await?,
            Some(MemoryLayer::Episodic) => self.archived_as_messages(user, conv).await?,
            Some(other @ (MemoryLayer::Semantic | MemoryLayer::Procedural)) => {
                return Err(EngineError::Validation(format!(
                    "GetMessages does not support layer {other:?}: its items are not message-shaped"
                )));
            }
            None => {
                let working = self.repos.working.recent(user, conv, limit).await?;
                if working.len() >= limit && before.is_none() && after.is_none() {
                    return Ok(working);
                }
                let mut archived = self.archived_as_messages(user, conv).await?;
                archived.extend(working);
                archived
            }
        };

        if let Some(before) = before {
            combined.retain(|m| m.timestamp < before);
        }
        if let Some(after) = after {
            combined.retain(|m| m.timestamp > after);
        }
        combined.sort_by_key(|m| m.timestamp);
        combined.truncate(limit);
        Ok(combined)
    }

    async fn archived_as_messages(&self, user: &str, conv: &str) -> Result<Vec<Message>> {
        let end = Utc::now();
        let start = end - BACKFILL_LOOKBACK;
        let archived = self.repos.episodic.by_time_range(user, conv, start, end).await?;
        let mut messages: Vec<Message> = archived
            .into_iter()
            .filter(|event| event.event_type == "message")
            .map(|event| {
                let mut msg = Message::new(event.user_id, event.conversation_id, Role::User, event.content);
                msg.id = event.id;
                msg.timestamp = event.occurred_at;
                msg
            })
            .collect();
        messages.sort_by_key(|m| m.timestamp);
        Ok(messages)
    }

    /// `RetrieveContext`: plans which tiers to read, reads each under the
    /// §5 retrieval deadline, truncates the assembled context to the plan's
    /// `estimated_tokens` (§4.5 step iv, §8's testable token-budget
    /// property), and returns the literal §6 shape plus the plan that
    /// produced it.
    pub async fn get_context(&self, user: &str, conv: &str, query: &str) -> Result<ContextResult> {
        let start = Instant::now();
        let ctx = metrics::timed(&self.metrics, "retrieve_context", Some(user), async {
            self.get_context_inner(user, conv, query, DEFAULT_CONTEXT_TOKEN_BUDGET).await
        })
        .await?;
        Ok(ContextResult {
            rendered_context: ctx.render(),
            token_count: ctx.total_tokens,
            latency_ms: start.elapsed().as_millis() as u64,
            query_plan: ctx.query_plan,
            partial: ctx.partial,
        })
    }

    async fn get_context_inner(&self, user: &str, conv: &str, query: &str, token_budget: u32) -> Result<MemoryContext> {
        if query.trim().is_empty() {
            return Err(EngineError::Validation("query must not be empty".into()));
        }

        let patterns = self.repos.procedural.by_user(user).await?;
        let query_embedding = self.collaborator.embed(query).await.ok();
        let matched_pattern = pattern::match_pattern(query, query_embedding.as_deref(), &patterns);
        if let Some(pattern) = &matched_pattern {
            self.repos.procedural.touch(&pattern.id).await?;
        }

        let recent_working = self.repos.working.recent(user, conv, 50).await?;
        let state = ConversationState {
            turn_count: recent_working.len() as u32,
            elapsed_since_last_query_secs: recent_working
                .last()
                .map(|m| (Utc::now() - m.timestamp).num_milliseconds() as f64 / 1000.0)
                .unwrap_or(f64::MAX),
            recent_message_count: recent_working.len() as u32,
        };

        let planner = QueryPlanner::new(&self.config.heuristics, self.collaborator.as_ref());
        let plan = planner
            .plan(
                query,
                state,
                matched_pattern.is_some(),
                matched_pattern.as_ref().map(|p| p.id.clone()),
                token_budget,
            )
            .await;

        // Each tier is bounded by its own 500ms deadline, but the three reads
        // run concurrently so a cold cache in one tier doesn't queue behind
        // the others — worst case is ~500ms total, not ~1.5s.
        let working_task = async {
            if !plan.layers.contains(&MemoryLayer::Working) {
                return (Vec::new(), false);
            }
            match tokio::time::timeout(RETRIEVAL_DEADLINE, self.repos.working.recent(user, conv, 20)).await {
                Ok(Ok(messages)) => (messages, false),
                _ => (Vec::new(), true),
            }
        };

        let semantic_task = async {
            if !plan.layers.contains(&MemoryLayer::Semantic) {
                return (Vec::new(), false);
            }
            match tokio::time::timeout(
                RETRIEVAL_DEADLINE,
                self.semantic_facts_for_query(user, query, query_embedding.as_deref()),
            )
            .await
            {
                Ok(Ok(facts)) => (facts, false),
                _ => (Vec::new(), true),
            }
        };

        let episodic_task = async {
            if !plan.layers.contains(&MemoryLayer::Episodic) {
                return (Vec::new(), false);
            }
            match tokio::time::timeout(RETRIEVAL_DEADLINE, self.repos.episodic.search(user, query, 10)).await {
                Ok(Ok(events)) => (events, false),
                _ => (Vec::new(), true),
            }
        };

        let (
            (working_messages, working_partial),
            (facts, semantic_partial),
            (archived_messages, episodic_partial),
        ) = tokio::join!(working_task, semantic_task, episodic_task);
        let partial = working_partial || semantic_partial || episodic_partial;

        let mut context = MemoryContext {
            working_messages,
            facts,
            archived_messages,
            applied_pattern: matched_pattern,
            query_plan: plan,
            total_tokens: 0,
            partial,
        };
        truncate_to_budget(&mut context);
        Ok(context)
    }

    async fn semantic_facts_for_query(
        &self,
        user: &str,
        query: &str,
        embedding: Option<&[f32]>,
    ) -> crate::error::StorageResult<Vec<ExtractedFact>> {
        if let Some(vector) = embedding {
            match self.repos.semantic.search_by_embedding(user, vector, 0.5, 10).await {
                Ok(hits) => return Ok(hits.into_iter().map(|(fact, _)| fact).collect()),
                Err(StorageError::CapabilityMissing(_)) => {}
                Err(err) => return Err(err),
            }
        }

        let lower = query.to_lowercase();
        let all = self.repos.semantic.by_user(user).await?;
        Ok(all
            .into_iter()
            .filter(|fact| fact.value.to_lowercase().contains(&lower) || fact.key.to_lowercase().contains(&lower))
            .take(10)
            .collect())
    }

    /// `Query`: `RetrieveContext` followed by `answer_with_context`, with
    /// the context's memory surfaced back as `sources`. `max_tokens` caps
    /// the context-assembly budget fed to the planner (and, via the
    /// rendered context's length, the prompt the collaborator sees); when
    /// absent, falls back to the same default `RetrieveContext` uses. When
    /// the collaborator has no generative backend (`Unavailable`), falls
    /// back to returning the rendered context directly rather than failing
    /// the call (§4.4/§6's documented degradation path).
    pub async fn query(&self, user: &str, conv: &str, query: &str, max_tokens: Option<u32>) -> Result<QueryAnswer> {
        let budget = max_tokens.unwrap_or(DEFAULT_CONTEXT_TOKEN_BUDGET);
        let context = metrics::timed(&self.metrics, "query", Some(user), async {
            self.get_context_inner(user, conv, query, budget).await
        })
        .await?;
        let rendered = context.render();
        let sources = sources_from_context(&context);

        let answer = match self.collaborator.answer_with_context(query, &rendered).await {
            Ok(answer) => answer,
            Err(CollaboratorError::Unavailable(_)) => rendered,
            Err(CollaboratorError::Embedding(err)) => return Err(EngineError::Unavailable(err.to_string())),
        };

        Ok(QueryAnswer { answer, sources })
    }

    /// `ForgetMessage`: tolerant fan-out delete across the tiers that could
    /// hold `id` (working, semantic, episodic — procedural patterns are
    /// never keyed by message id). Every tier's `delete`/`remove` is a
    /// documented no-op on an unknown id, so this never errors on "not
    /// found".
    pub async fn forget_message(&self, user: &str, conv: &str, id: &str) -> Result<()> {
        self.repos.working.remove(user, conv, id).await?;
        self.repos.semantic.delete(id).await?;
        self.repos.episodic.delete(id).await?;
        Ok(())
    }

    /// `ForgetUser`: deletes `user`'s data from every tier and drops the
    /// conversation registry entry.
    pub async fn forget_user(&self, user: &str) -> Result<()> {
        self.repos.working.delete_user(user).await?;
        self.repos.semantic.delete_user(user).await?;
        self.repos.episodic.delete_user(user).await?;
        self.repos.procedural.delete_user(user).await?;
        self.conversations.write().await.remove(user);
        Ok(())
    }

    /// `Consolidate`: runs a consolidation cycle for `user`. `conv` is
    /// accepted for API fidelity with callers that scope by conversation,
    /// but is otherwise unused — a cycle always runs at user scope, because
    /// every tier repository is itself scoped by `user` alone (§4.1 has no
    /// per-conversation semantic/episodic/procedural partition). `force`
    /// bypasses coalescing onto an in-flight cycle's report: it waits for
    /// any in-flight cycle to finish, then always runs a fresh one (§5's
    /// coalescing is the *default* behavior, not something `force` can be
    /// asked to skip outright without serializing on the same per-user key).
    pub async fn consolidate(&self, user: &str, _conv: Option<&str>, force: bool) -> Result<ConsolidationReport> {
        self.scheduler.lock().await.request(user, Trigger::Manual, force).await
    }

    /// `ListPatterns`: all procedural patterns registered for `user`.
    pub async fn list_patterns(&self, user: &str) -> Result<Vec<ProceduralPattern>> {
        Ok(self.repos.procedural.by_user(user).await?)
    }
}

/// Rough 4-chars-per-token estimate; this crate has no tokenizer dependency
/// and the budget only needs to be directionally right.
fn estimate_tokens(text: &str) -> u32 {
    (text.len() / 4) as u32
}

/// §4.5 step (iv): rank + truncate to `estimated_tokens` using priority
/// order procedural > working > semantic > episodic, breaking ties by
/// recency. Procedural is a single instruction block (never truncated
/// itself, just counted first); working messages are kept newest-first
/// against the remaining budget then restored to chronological order;
/// semantic facts and episodic events are kept in their incoming
/// (relevance-ranked) order up to the point the budget runs out.
fn truncate_to_budget(context: &mut MemoryContext) {
    let budget = context.query_plan.estimated_tokens;
    let mut remaining = budget;

    let pattern_tokens = context
        .applied_pattern
        .as_ref()
        .map(|p| estimate_tokens(&p.instruction_template))
        .unwrap_or(0);
    remaining = remaining.saturating_sub(pattern_tokens);

    let mut kept_working = Vec::new();
    for message in context.working_messages.iter().rev() {
        let cost = estimate_tokens(&message.content);
        if cost > remaining {
            break;
        }
        remaining -= cost;
        kept_working.push(message.clone());
    }
    kept_working.reverse();
    context.working_messages = kept_working;

    let mut kept_facts = Vec::new();
    for fact in &context.facts {
        let cost = estimate_tokens(&fact.key) + estimate_tokens(&fact.value);
        if cost > remaining {
            break;
        }
        remaining -= cost;
        kept_facts.push(fact.clone());
    }
    context.facts = kept_facts;

    let mut kept_archived = Vec::new();
    for event in &context.archived_messages {
        let cost = estimate_tokens(&event.content);
        if cost > remaining {
            break;
        }
        remaining -= cost;
        kept_archived.push(event.clone());
    }
    context.archived_messages = kept_archived;

    context.total_tokens = budget.saturating_sub(remaining).min(budget);
}

fn sources_from_context(context: &MemoryContext) -> Vec<QuerySource> {
    let mut sources = Vec::new();
    if let Some(pattern) = &context.applied_pattern {
        sources.push(QuerySource {
            layer: MemoryLayer::Procedural,
            id: pattern.id.clone(),
            excerpt: pattern.instruction_template.clone(),
        });
    }
    for message in &context.working_messages {
        sources.push(QuerySource {
            layer: MemoryLayer::Working,
            id: message.id.clone(),
            excerpt: message.content.clone(),
        });
    }
    for fact in &context.facts {
        sources.push(QuerySource {
            layer: MemoryLayer::Semantic,
            id: fact.id.clone(),
            excerpt: fact.value.clone(),
        });
    }
    for event in &context.archived_messages {
        sources.push(QuerySource {
            layer: MemoryLayer::Episodic,
            id: event.id.clone(),
            excerpt: event.content.clone(),
        });
    }
    sources
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborator::{CollaboratorResult, Entity};
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

    async fn engine() -> MemoryEngine {
        MemoryEngine::new(EngineConfig::default(), Arc::new(NoopCollaborator))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn add_message_rejects_empty_content() {
        let engine = engine().await;
        let err = engine
            .add_message("u1", "c1", Role::User, "   ", None)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn add_message_rejects_too_many_tags() {
        let engine = engine().await;
        let tags = (0..11).map(|i| format!("tag{i}")).collect();
        let err = engine
            .add_message("u1", "c1", Role::User, "hi", Some(tags))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn add_message_then_get_messages_round_trips() {
        let engine = engine().await;
        engine
            .add_message("u1", "c1", Role::User, "hello there", None)
            .await
            .unwrap();
        let messages = engine.get_messages("u1", "c1", 10, None, None, None).await.unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "hello there");
    }

    #[tokio::test]
    async fn get_messages_rejects_a_non_message_layer() {
        let engine = engine().await;
        let err = engine
            .get_messages("u1", "c1", 10, None, None, Some(MemoryLayer::Semantic))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn get_messages_after_filter_excludes_earlier_messages() {
        let engine = engine().await;
        engine.add_message("u1", "c1", Role::User, "first", None).await.unwrap();
        let cutoff = Utc::now();
        engine.add_message("u1", "c1", Role::User, "second", None).await.unwrap();
        let messages = engine
            .get_messages("u1", "c1", 10, None, Some(cutoff), None)
            .await
            .unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "second");
    }

    #[tokio::test]
    async fn create_conversation_rejects_too_many_tags() {
        let engine = engine().await;
        let tags = (0..11).map(|i| format!("tag{i}")).collect();
        let err = engine
            .create_conversation("u1", "title", Some(tags))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation(_)));
    }

    #[tokio::test]
    async fn get_context_returns_a_plan_and_rendered_text_within_budget() {
        let engine = engine().await;
        engine
            .add_message("u1", "c1", Role::User, "we decided to use postgres", None)
            .await
            .unwrap();
        let context = engine.get_context("u1", "c1", "what did we decide?").await.unwrap();
        assert!(context.query_plan.layers.contains(&MemoryLayer::Working));
        assert!(context.token_count <= context.query_plan.estimated_tokens);
    }

    #[tokio::test]
    async fn query_falls_back_to_rendered_context_when_collaborator_unavailable() {
        let engine = engine().await;
        engine
            .add_message("u1", "c1", Role::User, "remember my favorite color is blue", None)
            .await
            .unwrap();
        let result = engine.query("u1", "c1", "what is my favorite color?", None).await.unwrap();
        assert!(!result.sources.is_empty());
    }

    #[tokio::test]
    async fn forget_message_is_a_no_op_on_unknown_id() {
        let engine = engine().await;
        engine.forget_message("u1", "c1", "does-not-exist").await.unwrap();
    }

    #[tokio::test]
    async fn forget_user_clears_conversation_registry() {
        let engine = engine().await;
        let conv = engine.create_conversation("u1", "title", None).await.unwrap();
        engine.add_message("u1", &conv, Role::User, "hi", None).await.unwrap();
        engine.forget_user("u1").await.unwrap();
        let messages = engine.get_messages("u1", &conv, 10, None, None, None).await.unwrap();
        assert!(messages.is_empty());
    }

    #[tokio::test]
    async fn consolidate_runs_a_manual_cycle() {
        let engine = engine().await;
        let report = engine.consolidate("u1", None, false).await.unwrap();
        assert_eq!(report.phase1.facts_created, 0);
    }

    #[tokio::test]
    async fn consolidate_force_runs_a_fresh_cycle() {
        let engine = engine().await;
        engine.consolidate("u1", None, false).await.unwrap();
        let report = engine.consolidate("u1", None, true).await.unwrap();
        assert_eq!(report.phase1.facts_created, 0);
    }

    #[tokio::test]
    async fn list_patterns_is_empty_for_new_user() {
        let engine = engine().await;
        let patterns = engine.list_patterns("u1").await.unwrap();
        assert!(patterns.is_empty());
    }
}
