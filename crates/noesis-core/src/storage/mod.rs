//! Storage layer (C1, §4.1): four per-tier repository contracts, three
//! concrete drivers (in-process, embedded-file, networked), a resilient
//! retry/fallback wrapper (C2, §4.2), and the compression/quantization
//! policies shared by every driver that persists free-text or embeddings.

mod compression;
mod memory;
mod migrations;
mod quantization;
mod resilient;
mod sqlite;
#[cfg(feature = "networked")]
mod networked;
mod traits;

pub use compression::{decode as decode_blob, encode as encode_blob};
pub use memory::InProcessDriver;
pub use migrations::{apply_migrations, Migration, MIGRATIONS};
#[cfg(feature = "networked")]
pub use networked::NetworkedDriver;
pub use quantization::{dequantize, quantize, QuantizedEmbedding};
pub use resilient::{Resilient, RetryPolicy};
pub use sqlite::{sanitize_fts5_query, SqliteDriver};
pub use traits::{EpisodicRepo, ProceduralRepo, Repositories, SemanticRepo, WorkingRepo};

use crate::config::{EngineConfig, StorageProvider};
use crate::error::{StorageError, StorageResult};

/// Builds the tier repositories for an [`EngineConfig`], wrapping the
/// selected driver in [`Resilient`] with an in-process fallback whenever
/// `storage.enable_fallback` is set (§4.2: the fallback is an independent
/// store, never a replica of the primary).
pub struct DriverFactory;

impl DriverFactory {
    pub async fn build(config: &EngineConfig) -> StorageResult<Repositories> {
        let policy = RetryPolicy {
            max_attempts: config.storage.max_retries.max(1),
            ..RetryPolicy::default()
        };

        match config.storage.provider {
            StorageProvider::InProcess => {
                let driver = std::sync::Arc::new(InProcessDriver::new(config.working.ttl));
                Ok(Repositories {
                    working: Box::new(driver.clone()),
                    semantic: Box::new(driver.clone()),
                    episodic: Box::new(driver.clone()),
                    procedural: Box::new(driver),
                })
            }
            StorageProvider::EmbeddedFile => {
                let path = config.storage.connection.as_ref().map(std::path::PathBuf::from);
                let primary = SqliteDriver::open(path, config.compression.clone(), config.embeddings.clone())?;
                let fallback = InProcessDriver::new(config.working.ttl);
                let resilient = std::sync::Arc::new(Resilient::new(
                    primary,
                    fallback,
                    policy,
                    config.storage.enable_fallback,
                ));
                Ok(Repositories {
                    working: Box::new(resilient.clone()),
                    semantic: Box::new(resilient.clone()),
                    episodic: Box::new(resilient.clone()),
                    procedural: Box::new(resilient),
                })
            }
            StorageProvider::NetworkedVector => {
                #[cfg(feature = "networked")]
                {
                    let url = config.storage.connection.as_deref().ok_or_else(|| {
                        StorageError::Backend("networked storage provider requires storage.connection".into())
                    })?;
                    let primary = NetworkedDriver::connect(url, 256).await?;
                    let fallback = InProcessDriver::new(config.working.ttl);
                    let resilient = std::sync::Arc::new(Resilient::new(
                        primary,
                        fallback,
                        policy,
                        config.storage.enable_fallback,
                    ));
                    Ok(Repositories {
                        working: Box::new(resilient.clone()),
                        semantic: Box::new(resilient.clone()),
                        episodic: Box::new(resilient.clone()),
                        procedural: Box::new(resilient),
                    })
                }
                #[cfg(not(feature = "networked"))]
                {
                    Err(StorageError::CapabilityMissing(
                        "networked storage provider requires the `networked` feature".into(),
                    ))
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_process_provider_builds_repositories() {
        let config = EngineConfig::default();
        let repos = DriverFactory::build(&config).await.unwrap();
        assert!(repos.working.total_count("u1").await.unwrap() == 0);
    }
}
