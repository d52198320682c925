//! Local embedding generation for the semantic tier's similarity search and
//! the importance engine's novelty signal.
//!
//! No external API calls required — backed by fastembed (ONNX) when the
//! `embeddings` feature is enabled.

mod local;

pub use local::{
    cosine_similarity, dot_product, euclidean_distance, matryoshka_truncate, Embedding,
    EmbeddingError, EmbeddingService, BATCH_SIZE, EMBEDDING_DIMENSIONS, MAX_TEXT_LENGTH,
};
