//! Search primitives shared by the semantic and episodic tier drivers:
//! HNSW vector search over embeddings.

mod vector;

pub use vector::{
    VectorIndex, VectorIndexConfig, VectorIndexStats, VectorSearchError, DEFAULT_CONNECTIVITY,
    DEFAULT_DIMENSIONS,
};
