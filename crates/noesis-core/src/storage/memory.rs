//! In-process driver: the default fallback for [`super::resilient::Resilient`]
//! and the backing store for tests. Holds everything in memory behind
//! `std::sync::RwLock`-guarded maps; locks are held only across synchronous
//! map operations, never across an `.await`, so the blocking lock is safe
//! inside the `async_trait` methods.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{Duration, Utc};

use crate::error::{StorageError, StorageResult};
use crate::model::{EpisodicEvent, ExtractedFact, Message, ProceduralPattern};

use super::traits::{EpisodicRepo, ProceduralRepo, SemanticRepo, WorkingRepo};

/// Per-message TTL tracked alongside the stored [`Message`] since the data
/// model itself carries no TTL field (I5: TTL is a tier property, not a
/// message property).
struct WorkingEntry {
    message: Message,
    expires_at: chrono::DateTime<Utc>,
}

/// Fully in-memory implementation of all four tier contracts.
pub struct InProcessDriver {
    working: RwLock<HashMap<(String, String), Vec<WorkingEntry>>>,
    ttl: Duration,
    facts: RwLock<HashMap<String, ExtractedFact>>,
    events: RwLock<HashMap<String, EpisodicEvent>>,
    patterns: RwLock<HashMap<String, ProceduralPattern>>,
}

impl InProcessDriver {
    pub fn new(ttl: std::time::Duration) -> Self {
        Self {
            working: RwLock::new(HashMap::new()),
            ttl: Duration::from_std(ttl).unwrap_or(Duration::hours(1)),
            facts: RwLock::new(HashMap::new()),
            events: RwLock::new(HashMap::new()),
            patterns: RwLock::new(HashMap::new()),
        }
    }

    fn lock_poisoned(what: &str) -> StorageError {
        StorageError::Backend(format!("{what} lock poisoned"))
    }
}

impl Default for InProcessDriver {
    fn default() -> Self {
        Self::new(std::time::Duration::from_secs(3600))
    }
}

#[async_trait]
impl WorkingRepo for InProcessDriver {
    async fn add(&self, user: &str, conv: &str, msg: Message) -> StorageResult<()> {
        let mut guard = self
            .working
            .write()
            .map_err(|_| Self::lock_poisoned("working"))?;
        let expires_at = Utc::now() + self.ttl;
        guard
            .entry((user.to_string(), conv.to_string()))
            .or_default()
            .push(WorkingEntry {
                message: msg,
                expires_at,
            });
        Ok(())
    }

    async fn recent(&self, user: &str, conv: &str, n: usize) -> StorageResult<Vec<Message>> {
        let mut guard = self
            .working
            .write()
            .map_err(|_| Self::lock_poisoned("working"))?;
        let now = Utc::now();
        let Some(entries) = guard.get_mut(&(user.to_string(), conv.to_string())) else {
            return Ok(Vec::new());
        };
        let live_count = entries.iter().filter(|e| e.expires_at > now).count();
        let start = live_count.saturating_sub(n);
        let mut seen = 0usize;
        let mut out = Vec::new();
        for entry in entries.iter_mut() {
            if entry.expires_at <= now {
                continue;
            }
            if seen >= start {
                entry.message.touch();
                out.push(entry.message.clone());
            }
            seen += 1;
        }
        Ok(out)
    }

    async fn remove(&self, user: &str, conv: &str, id: &str) -> StorageResult<()> {
        let mut guard = self
            .working
            .write()
            .map_err(|_| Self::lock_poisoned("working"))?;
        if let Some(entries) = guard.get_mut(&(user.to_string(), conv.to_string())) {
            entries.retain(|e| e.message.id != id);
        }
        Ok(())
    }

    async fn clear(&self, user: &str, conv: &str) -> StorageResult<()> {
        let mut guard = self
            .working
            .write()
            .map_err(|_| Self::lock_poisoned("working"))?;
        guard.remove(&(user.to_string(), conv.to_string()));
        Ok(())
    }

    async fn promote_candidates(&self, user: &str) -> StorageResult<Vec<Message>> {
        let now = Utc::now();
        let guard = self
            .working
            .read()
            .map_err(|_| Self::lock_poisoned("working"))?;
        let mut out = Vec::new();
        for ((u, _conv), entries) in guard.iter() {
            if u != user {
                continue;
            }
            for entry in entries {
                if entry.expires_at <= now {
                    continue;
                }
                let age = now - entry.message.timestamp;
                if entry.message.importance_score > 0.7
                    || entry.message.access_count >= 3
                    || age > Duration::minutes(15)
                {
                    out.push(entry.message.clone());
                }
            }
        }
        Ok(out)
    }

    async fn total_count(&self, user: &str) -> StorageResult<usize> {
        let now = Utc::now();
        let guard = self
            .working
            .read()
            .map_err(|_| Self::lock_poisoned("working"))?;
        Ok(guard
            .iter()
            .filter(|((u, _), _)| u == user)
            .flat_map(|(_, entries)| entries.iter())
            .filter(|e| e.expires_at > now)
            .count())
    }

    async fn delete_user(&self, user: &str) -> StorageResult<()> {
        let mut guard = self
            .working
            .write()
            .map_err(|_| Self::lock_poisoned("working"))?;
        guard.retain(|(u, _), _| u != user);
        Ok(())
    }
}

#[async_trait]
impl SemanticRepo for InProcessDriver {
    async fn add(&self, fact: ExtractedFact) -> StorageResult<()> {
        let mut guard = self
            .facts
            .write()
            .map_err(|_| Self::lock_poisoned("facts"))?;
        guard.insert(fact.id.clone(), fact);
        Ok(())
    }

    async fn update(&self, fact: ExtractedFact) -> StorageResult<()> {
        let mut guard = self
            .facts
            .write()
            .map_err(|_| Self::lock_poisoned("facts"))?;
        guard.insert(fact.id.clone(), fact);
        Ok(())
    }

    async fn search_by_embedding(
        &self,
        user: &str,
        vector: &[f32],
        threshold: f32,
        k: usize,
    ) -> StorageResult<Vec<(ExtractedFact, f32)>> {
        let guard = self
            .facts
            .read()
            .map_err(|_| Self::lock_poisoned("facts"))?;
        let mut scored: Vec<(ExtractedFact, f32)> = guard
            .values()
            .filter(|f| f.user_id == user && !f.is_deleted())
            .filter_map(|f| {
                f.embedding
                    .as_ref()
                    .map(|e| (f.clone(), crate::embeddings::cosine_similarity(e, vector)))
            })
            .filter(|(_, sim)| *sim >= threshold)
            .collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        scored.truncate(k);
        Ok(scored)
    }

    async fn get_by_key(&self, user: &str, key: &str) -> StorageResult<Option<ExtractedFact>> {
        let guard = self
            .facts
            .read()
            .map_err(|_| Self::lock_poisoned("facts"))?;
        Ok(guard
            .values()
            .find(|f| f.user_id == user && f.key == key && !f.is_deleted())
            .cloned())
    }

    async fn get_by_id(&self, id: &str) -> StorageResult<Option<ExtractedFact>> {
        let guard = self
            .facts
            .read()
            .map_err(|_| Self::lock_poisoned("facts"))?;
        Ok(guard.get(id).cloned())
    }

    async fn delete(&self, id: &str) -> StorageResult<()> {
        let mut guard = self
            .facts
            .write()
            .map_err(|_| Self::lock_poisoned("facts"))?;
        guard.remove(id);
        Ok(())
    }

    async fn by_user(&self, user: &str) -> StorageResult<Vec<ExtractedFact>> {
        let guard = self
            .facts
            .read()
            .map_err(|_| Self::lock_poisoned("facts"))?;
        Ok(guard
            .values()
            .filter(|f| f.user_id == user && !f.is_deleted())
            .cloned()
            .collect())
    }

    async fn promote_candidates(&self, user: &str) -> StorageResult<Vec<ExtractedFact>> {
        let guard = self
            .facts
            .read()
            .map_err(|_| Self::lock_poisoned("facts"))?;
        // Full non-deleted pool for the user; the consolidation pipeline
        // unions the confidence/age filter with similarity clustering over
        // this same pool rather than having either restrict the other.
        Ok(guard
            .values()
            .filter(|f| f.user_id == user && !f.is_deleted())
            .cloned()
            .collect())
    }

    async fn prune_candidates(
        &self,
        user: &str,
        ttl: Duration,
        min_access_count: u32,
    ) -> StorageResult<Vec<ExtractedFact>> {
        let now = Utc::now();
        let guard = self
            .facts
            .read()
            .map_err(|_| Self::lock_poisoned("facts"))?;
        Ok(guard
            .values()
            .filter(|f| {
                f.user_id == user
                    && !f.is_deleted()
                    && (now - f.created_at) > ttl
                    && f.access_count < min_access_count
            })
            .cloned()
            .collect())
    }

    async fn delete_user(&self, user: &str) -> StorageResult<()> {
        let mut guard = self
            .facts
            .write()
            .map_err(|_| Self::lock_poisoned("facts"))?;
        guard.retain(|_, f| f.user_id != user);
        Ok(())
    }
}

#[async_trait]
impl EpisodicRepo for InProcessDriver {
    async fn add(&self, event: EpisodicEvent) -> StorageResult<()> {
        let mut guard = self
            .events
            .write()
            .map_err(|_| Self::lock_poisoned("events"))?;
        guard.insert(event.id.clone(), event);
        Ok(())
    }

    async fn by_time_range(
        &self,
        user: &str,
        conv: &str,
        start: chrono::DateTime<Utc>,
        end: chrono::DateTime<Utc>,
    ) -> StorageResult<Vec<EpisodicEvent>> {
        let guard = self
            .events
            .read()
            .map_err(|_| Self::lock_poisoned("events"))?;
        let mut out: Vec<EpisodicEvent> = guard
            .values()
            .filter(|e| {
                e.user_id == user
                    && e.conversation_id == conv
                    && e.occurred_at >= start
                    && e.occurred_at <= end
            })
            .cloned()
            .collect();
        out.sort_by_key(|e| e.occurred_at);
        Ok(out)
    }

    async fn by_type(&self, user: &str, event_type: &str, k: usize) -> StorageResult<Vec<EpisodicEvent>> {
        let guard = self
            .events
            .read()
            .map_err(|_| Self::lock_poisoned("events"))?;
        let mut out: Vec<EpisodicEvent> = guard
            .values()
            .filter(|e| e.user_id == user && e.event_type == event_type)
            .cloned()
            .collect();
        out.sort_by(|a, b| b.occurred_at.cmp(&a.occurred_at));
        out.truncate(k);
        Ok(out)
    }

    async fn search(&self, user: &str, query: &str, k: usize) -> StorageResult<Vec<EpisodicEvent>> {
        let guard = self
            .events
            .read()
            .map_err(|_| Self::lock_poisoned("events"))?;
        let needle = query.to_lowercase();
        let mut out: Vec<EpisodicEvent> = guard
            .values()
            .filter(|e| e.user_id == user && e.content.to_lowercase().contains(&needle))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.occurred_at.cmp(&a.occurred_at));
        out.truncate(k);
        Ok(out)
    }

    async fn get(&self, id: &str) -> StorageResult<Option<EpisodicEvent>> {
        let guard = self
            .events
            .read()
            .map_err(|_| Self::lock_poisoned("events"))?;
        Ok(guard.get(id).cloned())
    }

    async fn delete(&self, id: &str) -> StorageResult<()> {
        let mut guard = self
            .events
            .write()
            .map_err(|_| Self::lock_poisoned("events"))?;
        guard.remove(id);
        Ok(())
    }

    async fn by_user(&self, user: &str) -> StorageResult<Vec<EpisodicEvent>> {
        let guard = self
            .events
            .read()
            .map_err(|_| Self::lock_poisoned("events"))?;
        Ok(guard
            .values()
            .filter(|e| e.user_id == user)
            .cloned()
            .collect())
    }

    async fn promote_candidates(
        &self,
        user: &str,
        window: Duration,
    ) -> StorageResult<Vec<EpisodicEvent>> {
        let cutoff = Utc::now() - window;
        let guard = self
            .events
            .read()
            .map_err(|_| Self::lock_poisoned("events"))?;
        Ok(guard
            .values()
            .filter(|e| e.user_id == user && e.occurred_at >= cutoff && !e.is_consolidated())
            .cloned()
            .collect())
    }

    async fn delete_user(&self, user: &str) -> StorageResult<()> {
        let mut guard = self
            .events
            .write()
            .map_err(|_| Self::lock_poisoned("events"))?;
        guard.retain(|_, e| e.user_id != user);
        Ok(())
    }
}

#[async_trait]
impl ProceduralRepo for InProcessDriver {
    async fn upsert(&self, pattern: ProceduralPattern) -> StorageResult<()> {
        let mut guard = self
            .patterns
            .write()
            .map_err(|_| Self::lock_poisoned("patterns"))?;
        guard.insert(pattern.id.clone(), pattern);
        Ok(())
    }

    async fn by_user(&self, user: &str) -> StorageResult<Vec<ProceduralPattern>> {
        let guard = self
            .patterns
            .read()
            .map_err(|_| Self::lock_poisoned("patterns"))?;
        Ok(guard
            .values()
            .filter(|p| p.user_id == user)
            .cloned()
            .collect())
    }

    async fn get(&self, id: &str) -> StorageResult<Option<ProceduralPattern>> {
        let guard = self
            .patterns
            .read()
            .map_err(|_| Self::lock_poisoned("patterns"))?;
        Ok(guard.get(id).cloned())
    }

    async fn record_success(&self, id: &str) -> StorageResult<()> {
        let mut guard = self
            .patterns
            .write()
            .map_err(|_| Self::lock_poisoned("patterns"))?;
        match guard.get_mut(id) {
            Some(p) => {
                p.record_success();
                Ok(())
            }
            None => Err(StorageError::NotFound(id.to_string())),
        }
    }

    async fn record_failure(&self, id: &str) -> StorageResult<()> {
        let mut guard = self
            .patterns
            .write()
            .map_err(|_| Self::lock_poisoned("patterns"))?;
        match guard.get_mut(id) {
            Some(p) => {
                p.record_failure();
                Ok(())
            }
            None => Err(StorageError::NotFound(id.to_string())),
        }
    }

    async fn touch(&self, id: &str) -> StorageResult<()> {
        let mut guard = self
            .patterns
            .write()
            .map_err(|_| Self::lock_poisoned("patterns"))?;
        match guard.get_mut(id) {
            Some(p) => {
                p.touch();
                Ok(())
            }
            None => Err(StorageError::NotFound(id.to_string())),
        }
    }

    async fn delete(&self, id: &str) -> StorageResult<()> {
        let mut guard = self
            .patterns
            .write()
            .map_err(|_| Self::lock_poisoned("patterns"))?;
        guard.remove(id);
        Ok(())
    }

    async fn delete_user(&self, user: &str) -> StorageResult<()> {
        let mut guard = self
            .patterns
            .write()
            .map_err(|_| Self::lock_poisoned("patterns"))?;
        guard.retain(|_, p| p.user_id != user);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{EntityType, Role};

    #[tokio::test]
    async fn working_recent_excludes_expired() {
        let driver = InProcessDriver::new(std::time::Duration::from_millis(10));
        driver
            .add("u1", "c1", Message::new("u1", "c1", Role::User, "hi"))
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(30)).await;
        let recent = driver.recent("u1", "c1", 10).await.unwrap();
        assert!(recent.is_empty());
    }

    #[tokio::test]
    async fn working_recent_is_chronological() {
        let driver = InProcessDriver::default();
        for i in 0..3 {
            driver
                .add(
                    "u1",
                    "c1",
                    Message::new("u1", "c1", Role::User, format!("msg{i}")),
                )
                .await
                .unwrap();
        }
        let recent = driver.recent("u1", "c1", 10).await.unwrap();
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].content, "msg0");
        assert_eq!(recent[2].content, "msg2");
    }

    #[tokio::test]
    async fn semantic_search_respects_threshold() {
        let driver = InProcessDriver::default();
        let mut fact = ExtractedFact::new("u1", "c1", "k", "v", EntityType::Other, 0.5);
        fact.embedding = Some(vec![1.0, 0.0, 0.0]);
        SemanticRepo::add(&driver, fact).await.unwrap();
        let hits = driver
            .search_by_embedding("u1", &[0.0, 1.0, 0.0], 0.5, 10)
            .await
            .unwrap();
        assert!(hits.is_empty());
        let hits = driver
            .search_by_embedding("u1", &[1.0, 0.0, 0.0], 0.5, 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn delete_user_fans_out_across_tiers() {
        let driver = InProcessDriver::default();
        driver
            .add("u1", "c1", Message::new("u1", "c1", Role::User, "hi"))
            .await
            .unwrap();
        SemanticRepo::add(
            &driver,
            ExtractedFact::new("u1", "c1", "k", "v", EntityType::Other, 0.5),
        )
        .await
        .unwrap();
        EpisodicRepo::add(&driver, EpisodicEvent::new("u1", "c1", "message", "hi"))
            .await
            .unwrap();
        ProceduralRepo::upsert(
            &driver,
            ProceduralPattern::new("u1", "p", "d", vec![], "t", 0.5),
        )
        .await
        .unwrap();

        WorkingRepo::delete_user(&driver, "u1").await.unwrap();
        SemanticRepo::delete_user(&driver, "u1").await.unwrap();
        EpisodicRepo::delete_user(&driver, "u1").await.unwrap();
        ProceduralRepo::delete_user(&driver, "u1").await.unwrap();

        assert!(driver.recent("u1", "c1", 10).await.unwrap().is_empty());
        assert!(SemanticRepo::by_user(&driver, "u1").await.unwrap().is_empty());
        assert!(EpisodicRepo::by_user(&driver, "u1").await.unwrap().is_empty());
        assert!(ProceduralRepo::by_user(&driver, "u1").await.unwrap().is_empty());
    }
}
