//! Per-tier repository contracts (§4.1). Every concrete driver — in-process,
//! embedded-file, networked — implements these four traits; the resilient
//! wrapper (§4.2) and the orchestrator (§4.5) only ever see the trait
//! objects, never a concrete driver type.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StorageResult;
use crate::model::{EpisodicEvent, ExtractedFact, Message, ProceduralPattern};

/// Working-tier repository (§4.1): short-TTL per-conversation recent
/// messages. Expired entries must never be returned by `recent`.
#[async_trait]
pub trait WorkingRepo: Send + Sync {
    async fn add(&self, user: &str, conv: &str, msg: Message) -> StorageResult<()>;

    /// Newest `n` non-expired messages, chronological order (oldest first).
    async fn recent(&self, user: &str, conv: &str, n: usize) -> StorageResult<Vec<Message>>;

    async fn remove(&self, user: &str, conv: &str, id: &str) -> StorageResult<()>;

    async fn clear(&self, user: &str, conv: &str) -> StorageResult<()>;

    /// Items eligible for Phase 1 promotion: `importance > 0.7`, OR
    /// `access_count >= 3` (not tracked on messages directly — drivers
    /// approximate via tag/embedding lookups), OR `age > 15 minutes`.
    /// Expired (TTL) entries are pruned before this list is computed.
    async fn promote_candidates(&self, user: &str) -> StorageResult<Vec<Message>>;

    /// Total, non-expired message count across all of `user`'s conversations.
    async fn total_count(&self, user: &str) -> StorageResult<usize>;

    async fn delete_user(&self, user: &str) -> StorageResult<()>;
}

/// Semantic-tier repository (§4.1): long-lived facts with optional
/// embedding-based similarity search.
#[async_trait]
pub trait SemanticRepo: Send + Sync {
    async fn add(&self, fact: ExtractedFact) -> StorageResult<()>;

    async fn update(&self, fact: ExtractedFact) -> StorageResult<()>;

    /// Top-k facts by cosine similarity >= `threshold`. Drivers without a
    /// native vector index return `StorageError::CapabilityMissing` rather
    /// than silently scanning, unless they've opted into the documented
    /// exhaustive-scan fallback.
    async fn search_by_embedding(
        &self,
        user: &str,
        vector: &[f32],
        threshold: f32,
        k: usize,
    ) -> StorageResult<Vec<(ExtractedFact, f32)>>;

    async fn get_by_key(&self, user: &str, key: &str) -> StorageResult<Option<ExtractedFact>>;

    async fn get_by_id(&self, id: &str) -> StorageResult<Option<ExtractedFact>>;

    async fn delete(&self, id: &str) -> StorageResult<()>;

    /// All non-soft-deleted facts for `user` (open question #2: soft-deleted
    /// facts are excluded from reads during the grace period).
    async fn by_user(&self, user: &str) -> StorageResult<Vec<ExtractedFact>>;

    /// Full non-deleted fact pool for `user`, unfiltered by confidence or
    /// age. The consolidation pipeline unions two independent criteria over
    /// this pool — `confidence > 0.8 && age > 2h`, and similarity-cluster
    /// membership — rather than either restricting the other at the driver
    /// boundary.
    async fn promote_candidates(&self, user: &str) -> StorageResult<Vec<ExtractedFact>>;

    /// Facts past `fact_ttl` with `access_count < fact_prune_min_access_count`,
    /// eligible for eviction at the start of Phase 2.
    async fn prune_candidates(
        &self,
        user: &str,
        ttl: chrono::Duration,
        min_access_count: u32,
    ) -> StorageResult<Vec<ExtractedFact>>;

    async fn delete_user(&self, user: &str) -> StorageResult<()>;
}

/// Episodic-tier repository (§4.1): time-ordered events and archived
/// messages.
#[async_trait]
pub trait EpisodicRepo: Send + Sync {
    async fn add(&self, event: EpisodicEvent) -> StorageResult<()>;

    async fn by_time_range(
        &self,
        user: &str,
        conv: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StorageResult<Vec<EpisodicEvent>>;

    async fn by_type(&self, user: &str, event_type: &str, k: usize) -> StorageResult<Vec<EpisodicEvent>>;

    /// Substring or vector-assisted search, top-k by relevance.
    async fn search(&self, user: &str, query: &str, k: usize) -> StorageResult<Vec<EpisodicEvent>>;

    async fn get(&self, id: &str) -> StorageResult<Option<EpisodicEvent>>;

    async fn delete(&self, id: &str) -> StorageResult<()>;

    async fn by_user(&self, user: &str) -> StorageResult<Vec<EpisodicEvent>>;

    /// Events in the last `window` grouped implicitly by `event_type`;
    /// returned flat, the consolidation pipeline performs the grouping.
    async fn promote_candidates(
        &self,
        user: &str,
        window: chrono::Duration,
    ) -> StorageResult<Vec<EpisodicEvent>>;

    async fn delete_user(&self, user: &str) -> StorageResult<()>;
}

/// Procedural-tier repository (§4.1): learned trigger/instruction patterns.
#[async_trait]
pub trait ProceduralRepo: Send + Sync {
    /// Insert or replace by id.
    async fn upsert(&self, pattern: ProceduralPattern) -> StorageResult<()>;

    async fn by_user(&self, user: &str) -> StorageResult<Vec<ProceduralPattern>>;

    async fn get(&self, id: &str) -> StorageResult<Option<ProceduralPattern>>;

    async fn record_success(&self, id: &str) -> StorageResult<()>;

    async fn record_failure(&self, id: &str) -> StorageResult<()>;

    /// Updates `last_used` and increments `usage_count`.
    async fn touch(&self, id: &str) -> StorageResult<()>;

    async fn delete(&self, id: &str) -> StorageResult<()>;

    async fn delete_user(&self, user: &str) -> StorageResult<()>;
}

/// The four tier repositories bundled together, as handed to the
/// orchestrator by a [`super::DriverFactory`].
pub struct Repositories {
    pub working: Box<dyn WorkingRepo>,
    pub semantic: Box<dyn SemanticRepo>,
    pub episodic: Box<dyn EpisodicRepo>,
    pub procedural: Box<dyn ProceduralRepo>,
}

/// Blanket impls so a single driver instance shared via `Arc` across all
/// four tiers (the common case: one SQLite file or one in-process map backs
/// every tier) can still be boxed as each tier's trait object.
#[async_trait]
impl<T: WorkingRepo + ?Sized> WorkingRepo for std::sync::Arc<T> {
    async fn add(&self, user: &str, conv: &str, msg: Message) -> StorageResult<()> {
        (**self).add(user, conv, msg).await
    }
    async fn recent(&self, user: &str, conv: &str, n: usize) -> StorageResult<Vec<Message>> {
        (**self).recent(user, conv, n).await
    }
    async fn remove(&self, user: &str, conv: &str, id: &str) -> StorageResult<()> {
        (**self).remove(user, conv, id).await
    }
    async fn clear(&self, user: &str, conv: &str) -> StorageResult<()> {
        (**self).clear(user, conv).await
    }
    async fn promote_candidates(&self, user: &str) -> StorageResult<Vec<Message>> {
        (**self).promote_candidates(user).await
    }
    async fn total_count(&self, user: &str) -> StorageResult<usize> {
        (**self).total_count(user).await
    }
    async fn delete_user(&self, user: &str) -> StorageResult<()> {
        (**self).delete_user(user).await
    }
}

#[async_trait]
impl<T: SemanticRepo + ?Sized> SemanticRepo for std::sync::Arc<T> {
    async fn add(&self, fact: ExtractedFact) -> StorageResult<()> {
        (**self).add(fact).await
    }
    async fn update(&self, fact: ExtractedFact) -> StorageResult<()> {
        (**self).update(fact).await
    }
    async fn search_by_embedding(
        &self,
        user: &str,
        vector: &[f32],
        threshold: f32,
        k: usize,
    ) -> StorageResult<Vec<(ExtractedFact, f32)>> {
        (**self).search_by_embedding(user, vector, threshold, k).await
    }
    async fn get_by_key(&self, user: &str, key: &str) -> StorageResult<Option<ExtractedFact>> {
        (**self).get_by_key(user, key).await
    }
    async fn get_by_id(&self, id: &str) -> StorageResult<Option<ExtractedFact>> {
        (**self).get_by_id(id).await
    }
    async fn delete(&self, id: &str) -> StorageResult<()> {
        (**self).delete(id).await
    }
    async fn by_user(&self, user: &str) -> StorageResult<Vec<ExtractedFact>> {
        (**self).by_user(user).await
    }
    async fn promote_candidates(&self, user: &str) -> StorageResult<Vec<ExtractedFact>> {
        (**self).promote_candidates(user).await
    }
    async fn prune_candidates(
        &self,
        user: &str,
        ttl: chrono::Duration,
        min_access_count: u32,
    ) -> StorageResult<Vec<ExtractedFact>> {
        (**self).prune_candidates(user, ttl, min_access_count).await
    }
    async fn delete_user(&self, user: &str) -> StorageResult<()> {
        (**self).delete_user(user).await
    }
}

#[async_trait]
impl<T: EpisodicRepo + ?Sized> EpisodicRepo for std::sync::Arc<T> {
    async fn add(&self, event: EpisodicEvent) -> StorageResult<()> {
        (**self).add(event).await
    }
    async fn by_time_range(
        &self,
        user: &str,
        conv: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StorageResult<Vec<EpisodicEvent>> {
        (**self).by_time_range(user, conv, start, end).await
    }
    async fn by_type(&self, user: &str, event_type: &str, k: usize) -> StorageResult<Vec<EpisodicEvent>> {
        (**self).by_type(user, event_type, k).await
    }
    async fn search(&self, user: &str, query: &str, k: usize) -> StorageResult<Vec<EpisodicEvent>> {
        (**self).search(user, query, k).await
    }
    async fn get(&self, id: &str) -> StorageResult<Option<EpisodicEvent>> {
        (**self).get(id).await
    }
    async fn delete(&self, id: &str) -> StorageResult<()> {
        (**self).delete(id).await
    }
    async fn by_user(&self, user: &str) -> StorageResult<Vec<EpisodicEvent>> {
        (**self).by_user(user).await
    }
    async fn promote_candidates(
        &self,
        user: &str,
        window: chrono::Duration,
    ) -> StorageResult<Vec<EpisodicEvent>> {
        (**self).promote_candidates(user, window).await
    }
    async fn delete_user(&self, user: &str) -> StorageResult<()> {
        (**self).delete_user(user).await
    }
}

#[async_trait]
impl<T: ProceduralRepo + ?Sized> ProceduralRepo for std::sync::Arc<T> {
    async fn upsert(&self, pattern: ProceduralPattern) -> StorageResult<()> {
        (**self).upsert(pattern).await
    }
    async fn by_user(&self, user: &str) -> StorageResult<Vec<ProceduralPattern>> {
        (**self).by_user(user).await
    }
    async fn get(&self, id: &str) -> StorageResult<Option<ProceduralPattern>> {
        (**self).get(id).await
    }
    async fn record_success(&self, id: &str) -> StorageResult<()> {
        (**self).record_success(id).await
    }
    async fn record_failure(&self, id: &str) -> StorageResult<()> {
        (**self).record_failure(id).await
    }
    async fn touch(&self, id: &str) -> StorageResult<()> {
        (**self).touch(id).await
    }
    async fn delete(&self, id: &str) -> StorageResult<()> {
        (**self).delete(id).await
    }
    async fn delete_user(&self, user: &str) -> StorageResult<()> {
        (**self).delete_user(user).await
    }
}
