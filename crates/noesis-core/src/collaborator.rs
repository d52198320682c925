//! The external `EmbeddingAndCompletion` collaborator (§6): embedding and
//! LLM-backed capabilities the orchestrator treats as a pluggable,
//! best-effort dependency. Write-path failures here are logged and
//! swallowed (§4.5); read-path failures fall back to surface classification
//! (§4.4).
//!
//! [`LocalCollaborator`] is the in-process implementation: it provides real
//! embeddings via [`crate::embeddings::EmbeddingService`] and cheap
//! heuristic sentiment/entity extraction, but has no generative model to
//! back `complete`/`answer_with_context`/`classify_query` — those surface
//! [`CollaboratorError::Unavailable`] so callers take their documented
//! fallback path rather than silently returning nonsense.

use async_trait::async_trait;
use lru::LruCache;
use regex::Regex;
use std::num::NonZeroUsize;
use std::sync::{LazyLock, Mutex};
use thiserror::Error;

use crate::embeddings::{EmbeddingError, EmbeddingService};
use crate::model::EntityType;

/// Query-embedding cache capacity. Queries repeat far more than unique
/// messages do (planner re-embeds the same query text for pattern matching
/// and semantic search within a single `get_context` call), so this is sized
/// for hit-rate on that repetition, not corpus coverage.
const EMBED_CACHE_CAPACITY: usize = 256;

/// An entity extracted from free text by `extract_entities`.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub text: String,
    pub entity_type: EntityType,
}

/// Error surfaced by an `EmbeddingAndCompletion` collaborator method.
#[non_exhaustive]
#[derive(Debug, Error)]
pub enum CollaboratorError {
    /// The collaborator has no backing implementation for this capability
    /// (e.g. no LLM configured). Callers fall back per §4.4/§6.
    #[error("collaborator capability unavailable: {0}")]
    Unavailable(String),

    #[error("embedding failed: {0}")]
    Embedding(#[from] EmbeddingError),
}

pub type CollaboratorResult<T> = Result<T, CollaboratorError>;

/// The pluggable embedding/completion capability (§6). The orchestrator
/// depends only on this trait, never on a concrete provider.
#[async_trait]
pub trait EmbeddingAndCompletion: Send + Sync {
    async fn embed(&self, text: &str) -> CollaboratorResult<Vec<f32>>;

    /// Best-effort query classification label for the planner's stage (b)
    /// fallback. Returns `Unavailable` when no classifier is configured.
    async fn classify_query(&self, text: &str) -> CollaboratorResult<String>;

    async fn extract_entities(&self, text: &str) -> CollaboratorResult<Vec<Entity>>;

    async fn complete(&self, prompt: &str, max_tokens: u32) -> CollaboratorResult<String>;

    async fn answer_with_context(&self, query: &str, context: &str) -> CollaboratorResult<String>;

    /// Returns `(score, label)` where `score` is signed polarity magnitude
    /// and `label` is one of `positive`, `negative`, `neutral`.
    async fn analyze_sentiment(&self, text: &str) -> CollaboratorResult<(f64, String)>;
}

static POSITIVE: LazyLock<Vec<&'static str>> =
    LazyLock::new(|| vec!["great", "love", "thanks", "perfect", "excellent", "good", "awesome", "happy"]);
static NEGATIVE: LazyLock<Vec<&'static str>> = LazyLock::new(|| {
    vec![
        "broken", "bug", "hate", "terrible", "wrong", "fail", "failed", "error", "angry", "frustrated",
    ]
});

static PROPER_NOUN: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"\b[A-Z][a-zA-Z]{2,}\b").unwrap());
static TECH_TERMS: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(rust|python|sql|postgres|redis|docker|kubernetes|api|database|server|json|http)\b").unwrap()
});

/// In-process collaborator: real local embeddings, heuristic sentiment and
/// entity extraction, no generative backend.
///
/// [`EmbeddingService`] is a thin handle onto a process-wide model loaded
/// once behind a `OnceLock`; constructing a fresh one per call is cheap.
pub struct LocalCollaborator {
    embed_cache: Mutex<LruCache<String, Vec<f32>>>,
}

impl Default for LocalCollaborator {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalCollaborator {
    pub fn new() -> Self {
        Self {
            embed_cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(EMBED_CACHE_CAPACITY).expect("capacity is nonzero"),
            )),
        }
    }
}

#[async_trait]
impl EmbeddingAndCompletion for LocalCollaborator {
    async fn embed(&self, text: &str) -> CollaboratorResult<Vec<f32>> {
        if let Some(cached) = self
            .embed_cache
            .lock()
            .map_err(|_| CollaboratorError::Unavailable("embed cache lock poisoned".into()))?
            .get(text)
        {
            return Ok(cached.clone());
        }

        let owned = text.to_string();
        let service = EmbeddingService::new();
        let embedding = tokio::task::spawn_blocking(move || service.embed(&owned))
            .await
            .map_err(|e| CollaboratorError::Unavailable(format!("embedding task panicked: {e}")))??;

        if let Ok(mut cache) = self.embed_cache.lock() {
            cache.put(text.to_string(), embedding.vector.clone());
        }
        Ok(embedding.vector)
    }

    async fn classify_query(&self, _text: &str) -> CollaboratorResult<String> {
        Err(CollaboratorError::Unavailable(
            "no LLM-backed classifier configured".into(),
        ))
    }

    async fn extract_entities(&self, text: &str) -> CollaboratorResult<Vec<Entity>> {
        let mut entities = Vec::new();
        for hit in PROPER_NOUN.find_iter(text) {
            entities.push(Entity {
                text: hit.as_str().to_string(),
                entity_type: EntityType::Other,
            });
        }
        for hit in TECH_TERMS.find_iter(text) {
            entities.push(Entity {
                text: hit.as_str().to_string(),
                entity_type: EntityType::Technology,
            });
        }
        entities.dedup_by(|a, b| a.text.eq_ignore_ascii_case(&b.text));
        Ok(entities)
    }

    async fn complete(&self, _prompt: &str, _max_tokens: u32) -> CollaboratorResult<String> {
        Err(CollaboratorError::Unavailable("no completion model configured".into()))
    }

    async fn answer_with_context(&self, _query: &str, _context: &str) -> CollaboratorResult<String> {
        Err(CollaboratorError::Unavailable("no completion model configured".into()))
    }

    async fn analyze_sentiment(&self, text: &str) -> CollaboratorResult<(f64, String)> {
        let lower = text.to_lowercase();
        let mut score = 0.0_f64;
        for word in lower.split_whitespace() {
            let cleaned: String = word.chars().filter(|c| c.is_alphanumeric()).collect();
            if POSITIVE.contains(&cleaned.as_str()) {
                score += 1.0;
            } else if NEGATIVE.contains(&cleaned.as_str()) {
                score -= 1.0;
            }
        }
        let label = if score > 0.0 {
            "positive"
        } else if score < 0.0 {
            "negative"
        } else {
            "neutral"
        };
        Ok((score, label.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn extract_entities_finds_technology_terms() {
        let collaborator = LocalCollaborator::new();
        let entities = collaborator
            .extract_entities("we deployed the Rust service behind Redis")
            .await
            .unwrap();
        assert!(entities.iter().any(|e| e.entity_type == EntityType::Technology));
    }

    #[tokio::test]
    async fn sentiment_detects_positive_and_negative() {
        let collaborator = LocalCollaborator::new();
        let (score, label) = collaborator.analyze_sentiment("this is great, I love it").await.unwrap();
        assert!(score > 0.0);
        assert_eq!(label, "positive");

        let (score, label) = collaborator.analyze_sentiment("the build is broken and failed").await.unwrap();
        assert!(score < 0.0);
        assert_eq!(label, "negative");
    }

    #[tokio::test]
    async fn classify_query_is_unavailable_without_llm() {
        let collaborator = LocalCollaborator::new();
        let result = collaborator.classify_query("what is the weather").await;
        assert!(matches!(result, Err(CollaboratorError::Unavailable(_))));
    }
}
