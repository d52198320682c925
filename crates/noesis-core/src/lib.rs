//! # noesis-core
//!
//! A hierarchical conversational-memory engine for AI agents: four tiers
//! (working, semantic, episodic, procedural), a pure importance scorer, a
//! query planner that decides which tiers a request needs, a procedural
//! pattern matcher, and a background consolidation pipeline that promotes
//! memory between tiers over time.
//!
//! [`MemoryEngine`] is the crate's single public entry point — it owns the
//! storage drivers, the collaborator, and the background consolidation
//! task, and exposes the operations a caller needs: `add_message`,
//! `get_context`, `query`, `get_messages`, `forget_message`, `forget_user`,
//! `consolidate`, `list_patterns`.
//!
//! ## Feature flags
//!
//! - `embeddings` (default): local embedding generation via fastembed.
//! - `vector-search` (default): HNSW vector search via usearch.
//! - `bundled-sqlite` (default): statically link SQLite for the
//!   embedded-file storage provider.
//! - `networked`: Qdrant-backed storage provider.
//! - `encryption`: at-rest encryption for the embedded-file provider.
//! - `full`: every feature above.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(rustdoc::missing_crate_level_docs)]

pub mod collaborator;
pub mod config;
pub mod consolidation;
pub mod error;
pub mod importance;
pub mod metrics;
pub mod model;
pub mod orchestrator;
pub mod pattern;
pub mod planner;
pub mod storage;

#[cfg(feature = "embeddings")]
#[cfg_attr(docsrs, doc(cfg(feature = "embeddings")))]
pub mod embeddings;

#[cfg(feature = "vector-search")]
#[cfg_attr(docsrs, doc(cfg(feature = "vector-search")))]
pub mod search;

pub use collaborator::{CollaboratorError, CollaboratorResult, Entity, EmbeddingAndCompletion, LocalCollaborator};
pub use config::{
    CompressionAlgorithm, CompressionConfig, ConsolidationConfig, EmbeddingPrecision, EmbeddingsConfig,
    EngineConfig, HeuristicsConfig, ImportanceWeights, PlannerWeights, StorageConfig, StorageProvider,
    WorkingConfig,
};
pub use consolidation::{ConsolidationReport, ConsolidationScheduler, Trigger};
pub use error::{EngineError, Result, StorageError, StorageResult};
pub use importance::{ImportanceBand, ImportanceBreakdown, ImportanceEngine};
pub use metrics::{MetricRecord, MetricsSink, MetricsSnapshot, OpStats};
pub use model::{
    EntityType, EpisodicEvent, ExtractedFact, MemoryContext, MemoryLayer, Message, ProceduralPattern, QueryKind,
    QueryPlan, Role, Trigger as PatternTrigger, TriggerKind,
};
pub use orchestrator::{ContextResult, MemoryEngine, QueryAnswer, QuerySource};
pub use planner::{ConversationState, QueryPlanner};
pub use storage::{DriverFactory, EpisodicRepo, ProceduralRepo, Repositories, SemanticRepo, WorkingRepo};

#[cfg(feature = "embeddings")]
pub use embeddings::{cosine_similarity, Embedding, EmbeddingError, EmbeddingService, EMBEDDING_DIMENSIONS};

#[cfg(feature = "vector-search")]
pub use search::{VectorIndex, VectorIndexConfig};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Convenient imports for common usage.
pub mod prelude {
    pub use crate::{
        EngineConfig, EngineError, MemoryContext, MemoryEngine, MemoryLayer, Message, ProceduralPattern,
        QueryKind, QueryPlan, Result, Role,
    };

    #[cfg(feature = "embeddings")]
    pub use crate::{Embedding, EmbeddingService};

    #[cfg(feature = "vector-search")]
    pub use crate::VectorIndex;
}
