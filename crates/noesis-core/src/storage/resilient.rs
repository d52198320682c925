//! Resilient wrapper (C2, §4.2): retries a primary driver with exponential
//! backoff and, on terminal failure, falls back to an independent driver of
//! the same tier contract. The fallback is a separate store, not a replica —
//! reads never block on fallback-write replay.
//!
//! No prior equivalent of this wrapper existed elsewhere in the codebase
//! (other drivers assume a single always-on connection); the shape is new
//! but built in the same terse struct-plus-impl style as the rest of
//! `storage`.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{StorageError, StorageResult};
use crate::model::{EpisodicEvent, ExtractedFact, Message, ProceduralPattern};

use super::traits::{EpisodicRepo, ProceduralRepo, SemanticRepo, WorkingRepo};

/// Retry policy shared by every resilient wrapper: up to `max_attempts`
/// tries against the primary with base-100ms, factor-2 exponential backoff.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
        }
    }
}

impl RetryPolicy {
    fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt)
    }
}

/// Runs `op` against the primary with retries, falling back to `fallback_op`
/// if every primary attempt fails and `enable_fallback` is set. Surfaces the
/// primary's last error if the fallback also fails (or is disabled).
async fn with_retry_and_fallback<T, Fut1, Fut2>(
    policy: RetryPolicy,
    enable_fallback: bool,
    primary_failures: &std::sync::atomic::AtomicU64,
    mut primary_op: impl FnMut() -> Fut1,
    fallback_op: impl FnOnce() -> Fut2,
) -> StorageResult<T>
where
    Fut1: std::future::Future<Output = StorageResult<T>>,
    Fut2: std::future::Future<Output = StorageResult<T>>,
{
    let mut last_err = None;
    for attempt in 0..policy.max_attempts {
        match primary_op().await {
            Ok(v) => return Ok(v),
            Err(err) => {
                primary_failures.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                if attempt + 1 < policy.max_attempts {
                    tokio::time::sleep(policy.delay_for(attempt)).await;
                }
                last_err = Some(err);
            }
        }
    }

    if enable_fallback {
        if let Ok(v) = fallback_op().await {
            return Ok(v);
        }
    }

    Err(last_err.unwrap_or(StorageError::Backend("retry loop produced no error".into())))
}

/// Generic resilient wrapper around any two drivers implementing the same
/// tier contract. One instance per tier (`Resilient<dyn WorkingRepo>` isn't
/// expressible generically over the four distinct traits, so each tier gets
/// its own thin wrapper struct below that delegates through this helper).
pub struct Resilient<P, F> {
    primary: P,
    fallback: F,
    policy: RetryPolicy,
    enable_fallback: bool,
    /// Exposed for the "resilient fallback" testable property: count of
    /// primary-op failures observed so far.
    pub primary_failures: std::sync::atomic::AtomicU64,
}

impl<P, F> Resilient<P, F> {
    pub fn new(primary: P, fallback: F, policy: RetryPolicy, enable_fallback: bool) -> Self {
        Self {
            primary,
            fallback,
            policy,
            enable_fallback,
            primary_failures: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub fn primary_failure_count(&self) -> u64 {
        self.primary_failures.load(std::sync::atomic::Ordering::Relaxed)
    }
}

#[async_trait]
impl<P: WorkingRepo, F: WorkingRepo> WorkingRepo for Resilient<P, F> {
    async fn add(&self, user: &str, conv: &str, msg: Message) -> StorageResult<()> {
        with_retry_and_fallback(
            self.policy,
            self.enable_fallback,
            &self.primary_failures,
            || self.primary.add(user, conv, msg.clone()),
            || self.fallback.add(user, conv, msg.clone()),
        )
        .await
    }

    async fn recent(&self, user: &str, conv: &str, n: usize) -> StorageResult<Vec<Message>> {
        with_retry_and_fallback(
            self.policy,
            self.enable_fallback,
            &self.primary_failures,
            || self.primary.recent(user, conv, n),
            || self.fallback.recent(user, conv, n),
        )
        .await
    }

    async fn remove(&self, user: &str, conv: &str, id: &str) -> StorageResult<()> {
        with_retry_and_fallback(
            self.policy,
            self.enable_fallback,
            &self.primary_failures,
            || self.primary.remove(user, conv, id),
            || self.fallback.remove(user, conv, id),
        )
        .await
    }

    async fn clear(&self, user: &str, conv: &str) -> StorageResult<()> {
        with_retry_and_fallback(
            self.policy,
            self.enable_fallback,
            &self.primary_failures,
            || self.primary.clear(user, conv),
            || self.fallback.clear(user, conv),
        )
        .await
    }

    async fn promote_candidates(&self, user: &str) -> StorageResult<Vec<Message>> {
        with_retry_and_fallback(
            self.policy,
            self.enable_fallback,
            &self.primary_failures,
            || self.primary.promote_candidates(user),
            || self.fallback.promote_candidates(user),
        )
        .await
    }

    async fn total_count(&self, user: &str) -> StorageResult<usize> {
        with_retry_and_fallback(
            self.policy,
            self.enable_fallback,
            &self.primary_failures,
            || self.primary.total_count(user),
            || self.fallback.total_count(user),
        )
        .await
    }

    async fn delete_user(&self, user: &str) -> StorageResult<()> {
        with_retry_and_fallback(
            self.policy,
            self.enable_fallback,
            &self.primary_failures,
            || self.primary.delete_user(user),
            || self.fallback.delete_user(user),
        )
        .await
    }
}

#[async_trait]
impl<P: SemanticRepo, F: SemanticRepo> SemanticRepo for Resilient<P, F> {
    async fn add(&self, fact: ExtractedFact) -> StorageResult<()> {
        with_retry_and_fallback(
            self.policy,
            self.enable_fallback,
            &self.primary_failures,
            || self.primary.add(fact.clone()),
            || self.fallback.add(fact.clone()),
        )
        .await
    }

    async fn update(&self, fact: ExtractedFact) -> StorageResult<()> {
        with_retry_and_fallback(
            self.policy,
            self.enable_fallback,
            &self.primary_failures,
            || self.primary.update(fact.clone()),
            || self.fallback.update(fact.clone()),
        )
        .await
    }

    async fn search_by_embedding(
        &self,
        user: &str,
        vector: &[f32],
        threshold: f32,
        k: usize,
    ) -> StorageResult<Vec<(ExtractedFact, f32)>> {
        with_retry_and_fallback(
            self.policy,
            self.enable_fallback,
            &self.primary_failures,
            || self.primary.search_by_embedding(user, vector, threshold, k),
            || self.fallback.search_by_embedding(user, vector, threshold, k),
        )
        .await
    }

    async fn get_by_key(&self, user: &str, key: &str) -> StorageResult<Option<ExtractedFact>> {
        with_retry_and_fallback(
            self.policy,
            self.enable_fallback,
            &self.primary_failures,
            || self.primary.get_by_key(user, key),
            || self.fallback.get_by_key(user, key),
        )
        .await
    }

    async fn get_by_id(&self, id: &str) -> StorageResult<Option<ExtractedFact>> {
        with_retry_and_fallback(
            self.policy,
            self.enable_fallback,
            &self.primary_failures,
            || self.primary.get_by_id(id),
            || self.fallback.get_by_id(id),
        )
        .await
    }

    async fn delete(&self, id: &str) -> StorageResult<()> {
        with_retry_and_fallback(
            self.policy,
            self.enable_fallback,
            &self.primary_failures,
            || self.primary.delete(id),
            || self.fallback.delete(id),
        )
        .await
    }

    async fn by_user(&self, user: &str) -> StorageResult<Vec<ExtractedFact>> {
        with_retry_and_fallback(
            self.policy,
            self.enable_fallback,
            &self.primary_failures,
            || self.primary.by_user(user),
            || self.fallback.by_user(user),
        )
        .await
    }

    async fn promote_candidates(&self, user: &str) -> StorageResult<Vec<ExtractedFact>> {
        with_retry_and_fallback(
            self.policy,
            self.enable_fallback,
            &self.primary_failures,
            || self.primary.promote_candidates(user),
            || self.fallback.promote_candidates(user),
        )
        .await
    }

    async fn prune_candidates(
        &self,
        user: &str,
        ttl: chrono::Duration,
        min_access_count: u32,
    ) -> StorageResult<Vec<ExtractedFact>> {
        with_retry_and_fallback(
            self.policy,
            self.enable_fallback,
            &self.primary_failures,
            || self.primary.prune_candidates(user, ttl, min_access_count),
            || self.fallback.prune_candidates(user, ttl, min_access_count),
        )
        .await
    }

    async fn delete_user(&self, user: &str) -> StorageResult<()> {
        with_retry_and_fallback(
            self.policy,
            self.enable_fallback,
            &self.primary_failures,
            || self.primary.delete_user(user),
            || self.fallback.delete_user(user),
        )
        .await
    }
}

#[async_trait]
impl<P: EpisodicRepo, F: EpisodicRepo> EpisodicRepo for Resilient<P, F> {
    async fn add(&self, event: EpisodicEvent) -> StorageResult<()> {
        with_retry_and_fallback(
            self.policy,
            self.enable_fallback,
            &self.primary_failures,
            || self.primary.add(event.clone()),
            || self.fallback.add(event.clone()),
        )
        .await
    }

    async fn by_time_range(
        &self,
        user: &str,
        conv: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StorageResult<Vec<EpisodicEvent>> {
        with_retry_and_fallback(
            self.policy,
            self.enable_fallback,
            &self.primary_failures,
            || self.primary.by_time_range(user, conv, start, end),
            || self.fallback.by_time_range(user, conv, start, end),
        )
        .await
    }

    async fn by_type(&self, user: &str, event_type: &str, k: usize) -> StorageResult<Vec<EpisodicEvent>> {
        with_retry_and_fallback(
            self.policy,
            self.enable_fallback,
            &self.primary_failures,
            || self.primary.by_type(user, event_type, k),
            || self.fallback.by_type(user, event_type, k),
        )
        .await
    }

    async fn search(&self, user: &str, query: &str, k: usize) -> StorageResult<Vec<EpisodicEvent>> {
        with_retry_and_fallback(
            self.policy,
            self.enable_fallback,
            &self.primary_failures,
            || self.primary.search(user, query, k),
            || self.fallback.search(user, query, k),
        )
        .await
    }

    async fn get(&self, id: &str) -> StorageResult<Option<EpisodicEvent>> {
        with_retry_and_fallback(
            self.policy,
            self.enable_fallback,
            &self.primary_failures,
            || self.primary.get(id),
            || self.fallback.get(id),
        )
        .await
    }

    async fn delete(&self, id: &str) -> StorageResult<()> {
        with_retry_and_fallback(
            self.policy,
            self.enable_fallback,
            &self.primary_failures,
            || self.primary.delete(id),
            || self.fallback.delete(id),
        )
        .await
    }

    async fn by_user(&self, user: &str) -> StorageResult<Vec<EpisodicEvent>> {
        with_retry_and_fallback(
            self.policy,
            self.enable_fallback,
            &self.primary_failures,
            || self.primary.by_user(user),
            || self.fallback.by_user(user),
        )
        .await
    }

    async fn promote_candidates(
        &self,
        user: &str,
        window: chrono::Duration,
    ) -> StorageResult<Vec<EpisodicEvent>> {
        with_retry_and_fallback(
            self.policy,
            self.enable_fallback,
            &self.primary_failures,
            || self.primary.promote_candidates(user, window),
            || self.fallback.promote_candidates(user, window),
        )
        .await
    }

    async fn delete_user(&self, user: &str) -> StorageResult<()> {
        with_retry_and_fallback(
            self.policy,
            self.enable_fallback,
            &self.primary_failures,
            || self.primary.delete_user(user),
            || self.fallback.delete_user(user),
        )
        .await
    }
}

#[async_trait]
impl<P: ProceduralRepo, F: ProceduralRepo> ProceduralRepo for Resilient<P, F> {
    async fn upsert(&self, pattern: ProceduralPattern) -> StorageResult<()> {
        with_retry_and_fallback(
            self.policy,
            self.enable_fallback,
            &self.primary_failures,
            || self.primary.upsert(pattern.clone()),
            || self.fallback.upsert(pattern.clone()),
        )
        .await
    }

    async fn by_user(&self, user: &str) -> StorageResult<Vec<ProceduralPattern>> {
        with_retry_and_fallback(
            self.policy,
            self.enable_fallback,
            &self.primary_failures,
            || self.primary.by_user(user),
            || self.fallback.by_user(user),
        )
        .await
    }

    async fn get(&self, id: &str) -> StorageResult<Option<ProceduralPattern>> {
        with_retry_and_fallback(
            self.policy,
            self.enable_fallback,
            &self.primary_failures,
            || self.primary.get(id),
            || self.fallback.get(id),
        )
        .await
    }

    async fn record_success(&self, id: &str) -> StorageResult<()> {
        with_retry_and_fallback(
            self.policy,
            self.enable_fallback,
            &self.primary_failures,
            || self.primary.record_success(id),
            || self.fallback.record_success(id),
        )
        .await
    }

    async fn record_failure(&self, id: &str) -> StorageResult<()> {
        with_retry_and_fallback(
            self.policy,
            self.enable_fallback,
            &self.primary_failures,
            || self.primary.record_failure(id),
            || self.fallback.record_failure(id),
        )
        .await
    }

    async fn touch(&self, id: &str) -> StorageResult<()> {
        with_retry_and_fallback(
            self.policy,
            self.enable_fallback,
            &self.primary_failures,
            || self.primary.touch(id),
            || self.fallback.touch(id),
        )
        .await
    }

    async fn delete(&self, id: &str) -> StorageResult<()> {
        with_retry_and_fallback(
            self.policy,
            self.enable_fallback,
            &self.primary_failures,
            || self.primary.delete(id),
            || self.fallback.delete(id),
        )
        .await
    }

    async fn delete_user(&self, user: &str) -> StorageResult<()> {
        with_retry_and_fallback(
            self.policy,
            self.enable_fallback,
            &self.primary_failures,
            || self.primary.delete_user(user),
            || self.fallback.delete_user(user),
        )
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Role;
    use crate::storage::memory::InProcessDriver;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// A `WorkingRepo` whose `add` always fails, to exercise the fallback path.
    struct FailingWorking {
        calls: AtomicU32,
    }

    #[async_trait]
    impl WorkingRepo for FailingWorking {
        async fn add(&self, _user: &str, _conv: &str, _msg: Message) -> StorageResult<()> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            Err(StorageError::Backend("primary down".into()))
        }
        async fn recent(&self, _user: &str, _conv: &str, _n: usize) -> StorageResult<Vec<Message>> {
            Err(StorageError::Backend("primary down".into()))
        }
        async fn remove(&self, _user: &str, _conv: &str, _id: &str) -> StorageResult<()> {
            Err(StorageError::Backend("primary down".into()))
        }
        async fn clear(&self, _user: &str, _conv: &str) -> StorageResult<()> {
            Err(StorageError::Backend("primary down".into()))
        }
        async fn promote_candidates(&self, _user: &str) -> StorageResult<Vec<Message>> {
            Err(StorageError::Backend("primary down".into()))
        }
        async fn total_count(&self, _user: &str) -> StorageResult<usize> {
            Err(StorageError::Backend("primary down".into()))
        }
        async fn delete_user(&self, _user: &str) -> StorageResult<()> {
            Err(StorageError::Backend("primary down".into()))
        }
    }

    #[tokio::test]
    async fn add_falls_back_after_retries_exhausted() {
        let policy = RetryPolicy {
            max_attempts: 2,
            base_delay: Duration::from_millis(1),
        };
        let resilient = Resilient::new(
            FailingWorking {
                calls: AtomicU32::new(0),
            },
            InProcessDriver::default(),
            policy,
            true,
        );

        resilient
            .add("u1", "c1", Message::new("u1", "c1", Role::User, "hi"))
            .await
            .expect("fallback should succeed");
        assert_eq!(resilient.primary_failure_count(), 2);
    }

    #[tokio::test]
    async fn add_surfaces_error_when_fallback_disabled() {
        let policy = RetryPolicy {
            max_attempts: 1,
            base_delay: Duration::from_millis(1),
        };
        let resilient = Resilient::new(
            FailingWorking {
                calls: AtomicU32::new(0),
            },
            InProcessDriver::default(),
            policy,
            false,
        );

        let result = resilient
            .add("u1", "c1", Message::new("u1", "c1", Role::User, "hi"))
            .await;
        assert!(result.is_err());
    }
}
