//! The three consolidation phases (§4.6): Working→Semantic, Semantic→Episodic,
//! Episodic→Procedural. Each phase is a free function over the tier
//! repositories plus the collaborator, returning its own typed statistics so
//! [`super::pipeline::run_cycle`] can assemble a [`ConsolidationReport`]
//! with real per-phase counts rather than a derived placeholder (an earlier
//! design used `messages_consolidated / 2` for Phase 1's count; this crate
//! tracks each phase independently).

use std::collections::HashMap;
use std::time::Instant;

use chrono::Utc;

use crate::collaborator::EmbeddingAndCompletion;
use crate::config::ConsolidationConfig;
use crate::embeddings::cosine_similarity;
use crate::error::StorageResult;
use crate::model::{EntityType, EpisodicEvent, ExtractedFact, ProceduralPattern, Trigger, TriggerKind};
use crate::storage::Repositories;

/// Phase 1 (Working → Semantic) statistics.
#[derive(Debug, Clone, Default)]
pub struct Phase1Stats {
    pub working_pruned_expired: usize,
    pub candidates_considered: usize,
    pub facts_created: usize,
    pub duration_ms: u64,
}

/// Phase 2 (Semantic → Episodic) statistics.
#[derive(Debug, Clone, Default)]
pub struct Phase2Stats {
    pub facts_pruned: usize,
    pub candidates_considered: usize,
    pub clusters_formed: usize,
    pub facts_soft_deleted: usize,
    pub events_created: usize,
    pub duration_ms: u64,
}

/// Phase 3 (Episodic → Procedural) statistics.
#[derive(Debug, Clone, Default)]
pub struct Phase3Stats {
    pub groups_considered: usize,
    pub patterns_upserted: usize,
    pub events_marked_consolidated: usize,
    pub duration_ms: u64,
}

fn digest_key(content: &str) -> String {
    let mut hash: u64 = 0xcbf29ce484222325;
    for byte in content.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    format!("fact_{hash:016x}")
}

/// Phase 1: promote eligible working-tier messages into semantic facts.
/// Prunes TTL-expired entries first (they are never promotion candidates),
/// per §4.6's eviction note. `user` scopes the whole operation (I4).
pub async fn phase1_working_to_semantic(
    repos: &Repositories,
    collaborator: &dyn EmbeddingAndCompletion,
    user: &str,
) -> StorageResult<Phase1Stats> {
    let start = Instant::now();
    let mut stats = Phase1Stats::default();

    let candidates = repos.working.promote_candidates(user).await?;
    stats.candidates_considered = candidates.len();

    for message in candidates {
        let key = match &message.extracted_entities {
            Some(entities) if !entities.is_empty() => entities[0].clone(),
            _ => digest_key(&message.content),
        };

        let embedding = collaborator.embed(&message.content).await.ok();
        let confidence = (message.importance_score + 0.25).min(1.0);

        let mut fact = ExtractedFact::new(
            message.user_id.clone(),
            message.conversation_id.clone(),
            key,
            message.content.clone(),
            EntityType::Other,
            confidence,
        );
        // I3: promotion preserves id across tiers.
        fact.id = message.id.clone();
        fact.embedding = embedding;
        fact.promoted_to = None;

        repos.semantic.add(fact.clone()).await?;
        repos.working.remove(&message.user_id, &message.conversation_id, &message.id).await?;
        stats.facts_created += 1;
    }

    stats.duration_ms = start.elapsed().as_millis() as u64;
    Ok(stats)
}

struct FactCluster {
    members: Vec<ExtractedFact>,
}

/// Groups `facts` into clusters of size >= 3 with pairwise cosine similarity
/// >= `threshold`, restricted to facts created within `window` of now.
/// Facts outside any qualifying cluster and not individually eligible
/// (`confidence > 0.8 && age > min_age`) are left untouched by Phase 2.
fn cluster_similar_facts(
    facts: &[ExtractedFact],
    threshold: f32,
    window: chrono::Duration,
) -> Vec<FactCluster> {
    let now = Utc::now();
    let eligible: Vec<&ExtractedFact> = facts
        .iter()
        .filter(|f| f.embedding.is_some() && now - f.created_at <= window)
        .collect();

    let mut assigned = vec![false; eligible.len()];
    let mut clusters = Vec::new();

    for i in 0..eligible.len() {
        if assigned[i] {
            continue;
        }
        let mut members = vec![i];
        for j in (i + 1)..eligible.len() {
            if assigned[j] {
                continue;
            }
            let sim = cosine_similarity(
                eligible[i].embedding.as_ref().unwrap(),
                eligible[j].embedding.as_ref().unwrap(),
            );
            if sim >= threshold {
                members.push(j);
            }
        }
        if members.len() >= 3 {
            for &idx in &members {
                assigned[idx] = true;
            }
            clusters.push(FactCluster {
                members: members.iter().map(|&idx| eligible[idx].clone()).collect(),
            });
        }
    }

    clusters
}

/// Phase 2: prune stale facts, then fold individually-eligible facts and
/// similarity clusters into episodic events. Source facts are soft-deleted,
/// not physically removed (open question #2: excluded from reads during
/// the grace period, per [`crate::storage::SemanticRepo::by_user`]).
pub async fn phase2_semantic_to_episodic(
    repos: &Repositories,
    collaborator: &dyn EmbeddingAndCompletion,
    config: &ConsolidationConfig,
    user: &str,
) -> StorageResult<Phase2Stats> {
    let start = Instant::now();
    let mut stats = Phase2Stats::default();

    let ttl = chrono::Duration::from_std(config.fact_ttl).unwrap_or(chrono::Duration::days(30));
    let prunable = repos
        .semantic
        .prune_candidates(user, ttl, config.fact_prune_min_access_count)
        .await?;
    for fact in prunable {
        repos.semantic.delete(&fact.id).await?;
        stats.facts_pruned += 1;
    }

    let candidates = repos.semantic.promote_candidates(user).await?;
    stats.candidates_considered = candidates.len();

    let window = chrono::Duration::from_std(config.phase2_cluster_window).unwrap_or(chrono::Duration::days(7));
    let clusters = cluster_similar_facts(&candidates, config.phase2_similarity_threshold, window);

    let mut clustered_ids: std::collections::HashSet<String> = std::collections::HashSet::new();
    for cluster in clusters {
        for fact in &cluster.members {
            clustered_ids.insert(fact.id.clone());
        }

        let fact_type = cluster.members[0].entity_type;
        let summary = cluster
            .members
            .iter()
            .map(|f| f.value.as_str())
            .collect::<Vec<_>>()
            .join("; ");
        let mut event = EpisodicEvent::new(
            user,
            cluster.members[0].conversation_id.clone(),
            format!("{}_pattern_detected", fact_type.as_str()),
            summary,
        );
        event.embedding = collaborator.embed(&event.content).await.ok();
        repos.episodic.add(event.clone()).await?;
        stats.clusters_formed += 1;
        stats.events_created += 1;

        for mut fact in cluster.members {
            fact.deleted_at = Some(Utc::now());
            fact.promoted_to = Some(event.id.clone());
            repos.semantic.update(fact).await?;
            stats.facts_soft_deleted += 1;
        }
    }

    let min_age = chrono::Duration::from_std(config.phase2_min_age).unwrap_or(chrono::Duration::hours(2));
    for fact in candidates {
        if clustered_ids.contains(fact.id.as_str()) {
            continue;
        }
        if fact.importance <= 0.8 || fact.age() <= min_age {
            continue;
        }
        let mut event = EpisodicEvent::new(
            fact.user_id.clone(),
            fact.conversation_id.clone(),
            "message",
            fact.value.clone(),
        );
        // I3: single-fact promotion preserves id; the cluster branch above is
        // a legitimate N:1 merge and is exempt.
        event.id = fact.id.clone();
        event.embedding = fact.embedding.clone();
        repos.episodic.add(event.clone()).await?;
        stats.events_created += 1;

        let mut updated = fact;
        updated.deleted_at = Some(Utc::now());
        updated.promoted_to = Some(event.id.clone());
        repos.semantic.update(updated).await?;
        stats.facts_soft_deleted += 1;
    }

    stats.duration_ms = start.elapsed().as_millis() as u64;
    Ok(stats)
}

fn common_tokens(events: &[EpisodicEvent], min_occurrences: usize) -> Vec<String> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for event in events {
        let mut seen = std::collections::HashSet::new();
        for token in event.content.to_lowercase().split_whitespace() {
            let cleaned: String = token.chars().filter(|c| c.is_alphanumeric()).collect();
            if cleaned.len() > 3 && seen.insert(cleaned.clone()) {
                *counts.entry(cleaned).or_insert(0) += 1;
            }
        }
    }
    let mut tokens: Vec<String> = counts
        .into_iter()
        .filter(|(_, count)| *count >= min_occurrences)
        .map(|(token, _)| token)
        .collect();
    tokens.sort();
    tokens.truncate(5);
    tokens
}

/// Phase 3: group the last `config.phase3_window` of events by `event_type`,
/// and upsert a procedural pattern for every group meeting the occurrence
/// and success-rate bars.
pub async fn phase3_episodic_to_procedural(
    repos: &Repositories,
    config: &ConsolidationConfig,
    user: &str,
) -> StorageResult<Phase3Stats> {
    let start = Instant::now();
    let mut stats = Phase3Stats::default();

    let window = chrono::Duration::from_std(config.phase3_window).unwrap_or(chrono::Duration::days(30));
    let events = repos.episodic.promote_candidates(user, window).await?;

    let mut groups: HashMap<String, Vec<EpisodicEvent>> = HashMap::new();
    for event in events {
        if event.is_consolidated() {
            continue;
        }
        groups.entry(event.event_type.clone()).or_default().push(event);
    }
    stats.groups_considered = groups.len();

    for (event_type, group) in groups {
        if group.len() < config.phase3_min_occurrences as usize {
            continue;
        }
        let avg_success = group.iter().map(|e| e.success_rate()).sum::<f64>() / group.len() as f64;
        if avg_success <= config.phase3_min_success_rate {
            continue;
        }

        let tokens = common_tokens(&group, 2);
        let triggers: Vec<Trigger> = tokens
            .into_iter()
            .map(|token| Trigger { kind: TriggerKind::Keyword, pattern: token })
            .collect();

        let most_recent = group.iter().max_by_key(|e| e.occurred_at).unwrap();
        let existing = repos
            .procedural
            .by_user(user)
            .await?
            .into_iter()
            .find(|p| p.name == format!("{event_type}_learned_pattern"));

        let mut pattern = existing.unwrap_or_else(|| {
            ProceduralPattern::new(
                user,
                format!("{event_type}_learned_pattern"),
                format!("learned from {} recurring '{event_type}' events", group.len()),
                triggers.clone(),
                most_recent.content.clone(),
                0.6,
            )
        });
        pattern.triggers = triggers;
        pattern.instruction_template = most_recent.content.clone();
        repos.procedural.upsert(pattern).await?;
        stats.patterns_upserted += 1;

        for mut event in group {
            event.mark_consolidated();
            repos.episodic.delete(&event.id).await?;
            repos.episodic.add(event).await?;
            stats.events_marked_consolidated += 1;
        }
    }

    stats.duration_ms = start.elapsed().as_millis() as u64;
    Ok(stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborator::{CollaboratorError, CollaboratorResult, Entity};
    use crate::model::{Message, Role};
    use crate::storage::InProcessDriver;
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
    async fn phase1_promotes_high_importance_message_to_semantic() {
        let repos = repos();
        let collaborator = NoopCollaborator;
        let mut msg = Message::new("u1", "c1", Role::User, "we decided to use postgres");
        msg.importance_score = 0.9;
        crate::storage::WorkingRepo::add(&repos.working, "u1", "c1", msg).await.unwrap();

        let stats = phase1_working_to_semantic(&repos, &collaborator, "u1").await.unwrap();
        assert_eq!(stats.facts_created, 1);

        let facts = repos.semantic.by_user("u1").await.unwrap();
        assert_eq!(facts.len(), 1);

        let remaining = repos.working.recent("u1", "c1", 10).await.unwrap();
        assert!(remaining.is_empty());
    }

    #[tokio::test]
    async fn phase1_is_idempotent_when_no_new_candidates() {
        let repos = repos();
        let collaborator = NoopCollaborator;
        let mut msg = Message::new("u1", "c1", Role::User, "important decision here");
        msg.importance_score = 0.95;
        crate::storage::WorkingRepo::add(&repos.working, "u1", "c1", msg).await.unwrap();

        phase1_working_to_semantic(&repos, &collaborator, "u1").await.unwrap();
        let second = phase1_working_to_semantic(&repos, &collaborator, "u1").await.unwrap();
        assert_eq!(second.facts_created, 0);
    }

    #[tokio::test]
    async fn phase3_upserts_a_pattern_for_recurring_event_type() {
        let repos = repos();
        for i in 0..3 {
            let mut event = EpisodicEvent::new("u1", "c1", "retry_deploy", format!("retry deploy attempt {i}"));
            event.metadata.insert("success_rate".into(), "0.9".into());
            repos.episodic.add(event).await.unwrap();
        }

        let config = ConsolidationConfig::default();
        let stats = phase3_episodic_to_procedural(&repos, &config, "u1").await.unwrap();
        assert_eq!(stats.patterns_upserted, 1);

        let patterns = repos.procedural.by_user("u1").await.unwrap();
        assert_eq!(patterns.len(), 1);
        assert_eq!(patterns[0].name, "retry_deploy_learned_pattern");
    }

    #[tokio::test]
    async fn phase3_skips_groups_below_occurrence_threshold() {
        let repos = repos();
        let event = EpisodicEvent::new("u1", "c1", "rare_event", "only happened once");
        repos.episodic.add(event).await.unwrap();

        let config = ConsolidationConfig::default();
        let stats = phase3_episodic_to_procedural(&repos, &config, "u1").await.unwrap();
        assert_eq!(stats.patterns_upserted, 0);
    }
}
