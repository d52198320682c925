//! Configuration structs for every tunable listed in the storage-configuration
//! table: storage provider selection, compression, embedding quantization,
//! working-tier TTL, consolidation triggers, and query-planner heuristics.
//!
//! Each struct is a plain literal with a `Default` impl, in the style the
//! teacher configures `ConsolidationConfig` and `VectorIndexConfig` — no
//! config-file parsing crate is involved.

use std::time::Duration;

/// Which concrete driver set backs a [`crate::storage::Repositories`].
#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageProvider {
    /// In-memory, used for tests and as the resilient-wrapper fallback.
    #[default]
    InProcess,
    /// Durable local persistence (SQLite).
    EmbeddedFile,
    /// Networked backend with native vector search (Qdrant).
    NetworkedVector,
}

/// `storage.*` configuration.
#[derive(Debug, Clone)]
pub struct StorageConfig {
    pub provider: StorageProvider,
    /// Driver-specific endpoint: filesystem path for `EmbeddedFile`, URI for
    /// `NetworkedVector`. Ignored for `InProcess`.
    pub connection: Option<String>,
    pub enable_fallback: bool,
    pub max_retries: u32,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            provider: StorageProvider::InProcess,
            connection: None,
            enable_fallback: true,
            max_retries: 3,
        }
    }
}

/// `compression.*` configuration (§4.1 selective compression policy).
#[derive(Debug, Clone)]
pub struct CompressionConfig {
    pub enabled: bool,
    pub algorithm: CompressionAlgorithm,
    /// Minimum payload size, in bytes, before compression is attempted.
    pub threshold_bytes: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            algorithm: CompressionAlgorithm::SelectiveGzip,
            threshold_bytes: 1024,
        }
    }
}

#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CompressionAlgorithm {
    #[default]
    SelectiveGzip,
    Gzip,
}

/// `embeddings.*` configuration.
#[derive(Debug, Clone)]
pub struct EmbeddingsConfig {
    pub quantization_enabled: bool,
    pub precision: EmbeddingPrecision,
}

impl Default for EmbeddingsConfig {
    fn default() -> Self {
        Self {
            quantization_enabled: false,
            precision: EmbeddingPrecision::Float32,
        }
    }
}

#[non_exhaustive]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EmbeddingPrecision {
    #[default]
    Float32,
    Int8,
}

/// `working.*` configuration.
#[derive(Debug, Clone)]
pub struct WorkingConfig {
    pub ttl: Duration,
    pub max_items: usize,
}

impl Default for WorkingConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(3600),
            max_items: 1000,
        }
    }
}

/// `consolidation.*` configuration, plus the phase-2 clustering parameters
/// this crate adopts as its resolution of the corresponding open question.
#[derive(Debug, Clone)]
pub struct ConsolidationConfig {
    pub period: Duration,
    pub threshold_messages: u32,
    /// Cosine-similarity threshold for Phase 2 (Semantic → Episodic)
    /// cluster detection. Default 0.85.
    pub phase2_similarity_threshold: f32,
    /// Lookback window for Phase 2 clustering. Default 7 days.
    pub phase2_cluster_window: Duration,
    /// Age after which a fact becomes promotable in Phase 2. Default 2h.
    pub phase2_min_age: Duration,
    /// Minimum occurrences of an event type for Phase 3 promotion. Default 3.
    pub phase3_min_occurrences: u32,
    /// Lookback window for Phase 3 recurrence grouping. Default 30 days.
    pub phase3_window: Duration,
    /// Minimum average success rate for Phase 3 promotion. Default 0.6.
    pub phase3_min_success_rate: f64,
    /// TTL for semantic facts eligible for pruning at the start of Phase 2.
    pub fact_ttl: Duration,
    /// Minimum access count below which an expired fact is pruned.
    pub fact_prune_min_access_count: u32,
    /// Backoff base for cycle retries (exponential, up to 3 attempts).
    pub retry_backoff_base: Duration,
    pub max_retry_attempts: u32,
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            period: Duration::from_secs(5 * 60),
            threshold_messages: 20,
            phase2_similarity_threshold: 0.85,
            phase2_cluster_window: Duration::from_secs(7 * 24 * 3600),
            phase2_min_age: Duration::from_secs(2 * 3600),
            phase3_min_occurrences: 3,
            phase3_window: Duration::from_secs(30 * 24 * 3600),
            phase3_min_success_rate: 0.6,
            fact_ttl: Duration::from_secs(30 * 24 * 3600),
            fact_prune_min_access_count: 3,
            retry_backoff_base: Duration::from_secs(5),
            max_retry_attempts: 3,
        }
    }
}

/// `heuristics.*` configuration consumed by the query planner and importance
/// engine.
#[derive(Debug, Clone)]
pub struct HeuristicsConfig {
    /// Confidence below which the surface classifier defers to the external
    /// collaborator.
    pub specific_layers_threshold: f32,
    /// Multiplicative dampener applied to the importance composite.
    pub dampening: f64,
    /// Per-component weights for the importance engine's composite score
    /// (§4.3), applied before dampening.
    pub importance_weights: ImportanceWeights,
    /// Score floor returned when every component evaluates to zero.
    pub importance_default: f64,
    /// Recency half-life-ish time constant τ (seconds) for
    /// `exp(-age_seconds / tau)`.
    pub recency_tau_secs: f64,
    /// Promotion threshold (default 0.7, independent of the tier
    /// classification thresholds below).
    pub promotion_threshold: f64,
    /// Query-planner surface-classification signal weights (§4.4).
    pub planner_weights: PlannerWeights,
}

impl Default for HeuristicsConfig {
    fn default() -> Self {
        Self {
            specific_layers_threshold: 0.80,
            dampening: 0.90,
            importance_weights: ImportanceWeights::default(),
            importance_default: 0.3,
            recency_tau_secs: 3600.0,
            promotion_threshold: 0.7,
            planner_weights: PlannerWeights::default(),
        }
    }
}

/// Signal weights for the query planner's stage-(a) surface classifier
/// (§4.4): how much each evidence source contributes to a candidate kind's
/// confidence before the `specific_layers_threshold` gate.
#[derive(Debug, Clone)]
pub struct PlannerWeights {
    /// Weight of dictionary phrase matches against the query text.
    pub surface: f64,
    /// Weight of embedding similarity to each kind's exemplar phrases.
    pub semantic: f64,
    /// Weight of conversation-state signals (turn count, elapsed time,
    /// recent message count).
    pub contextual: f64,
    /// Penalty applied when a negation precedes a matched marker.
    pub negation: f64,
    /// Boost applied for intensity markers (e.g. repeated punctuation,
    /// emphatic phrasing).
    pub intensity: f64,
}

impl Default for PlannerWeights {
    fn default() -> Self {
        Self {
            surface: 0.6,
            semantic: 0.2,
            contextual: 0.1,
            negation: 0.3,
            intensity: 0.1,
        }
    }
}

/// Weights for each component of the importance composite; must sum to
/// roughly 1.0 for the clamp in §4.3 to behave intuitively, but the engine
/// clamps the final score regardless.
#[derive(Debug, Clone)]
pub struct ImportanceWeights {
    pub base: f64,
    pub decision_marker: f64,
    pub question: f64,
    pub novelty: f64,
    pub sentiment: f64,
    pub technical_depth: f64,
    pub recency: f64,
}

impl Default for ImportanceWeights {
    fn default() -> Self {
        Self {
            base: 0.15,
            decision_marker: 0.25,
            question: 0.10,
            novelty: 0.20,
            sentiment: 0.10,
            technical_depth: 0.10,
            recency: 0.10,
        }
    }
}

/// Aggregate configuration for the whole engine.
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub storage: StorageConfig,
    pub compression: CompressionConfig,
    pub embeddings: EmbeddingsConfig,
    pub working: WorkingConfig,
    pub consolidation: ConsolidationConfig,
    pub heuristics: HeuristicsConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_table() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.storage.max_retries, 3);
        assert!(cfg.storage.enable_fallback);
        assert_eq!(cfg.compression.threshold_bytes, 1024);
        assert_eq!(cfg.working.ttl, Duration::from_secs(3600));
        assert_eq!(cfg.working.max_items, 1000);
        assert_eq!(cfg.consolidation.period, Duration::from_secs(300));
        assert_eq!(cfg.consolidation.threshold_messages, 20);
        assert_eq!(cfg.consolidation.phase2_similarity_threshold, 0.85);
        assert_eq!(cfg.heuristics.specific_layers_threshold, 0.80);
        assert_eq!(cfg.heuristics.dampening, 0.90);
    }
}
