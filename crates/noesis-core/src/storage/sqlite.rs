//! Embedded-file driver (§4.1): durable local persistence via SQLite, with
//! FTS5-backed episodic search and an optional in-process HNSW index
//! (feature `vector-search`) for semantic similarity search.
//!
//! Separate writer/reader `Mutex<Connection>`s, a `configure_connection`
//! PRAGMA block, and a `ProjectDirs`-based default path with Unix
//! permission hardening.

use std::path::PathBuf;
use std::sync::{Mutex, Once};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use directories::ProjectDirs;
use rusqlite::{params, Connection, OptionalExtension};

use crate::config::{CompressionConfig, EmbeddingsConfig};
use crate::error::{StorageError, StorageResult};
use crate::model::{EntityType, EpisodicEvent, ExtractedFact, Message, ProceduralPattern, Role, Trigger};

use super::compression;
use super::quantization;
use super::traits::{EpisodicRepo, ProceduralRepo, SemanticRepo, WorkingRepo};

#[cfg(feature = "vector-search")]
use crate::search::VectorIndex;

/// Embedded-file driver backed by SQLite. `&self` methods only (interior
/// mutability via `Mutex<Connection>`), so the driver is `Send + Sync` and
/// can be shared behind an `Arc` the way the orchestrator expects.
pub struct SqliteDriver {
    writer: Mutex<Connection>,
    reader: Mutex<Connection>,
    compression: CompressionConfig,
    embeddings: EmbeddingsConfig,
    #[cfg(feature = "vector-search")]
    vector_index: Mutex<Option<VectorIndex>>,
    vector_search_warned: Once,
}

impl SqliteDriver {
    fn configure_connection(conn: &Connection) -> rusqlite::Result<()> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA cache_size = -64000;
             PRAGMA temp_store = MEMORY;
             PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )
    }

    pub fn default_path() -> StorageResult<PathBuf> {
        let proj_dirs = ProjectDirs::from("com", "noesis", "core")
            .ok_or_else(|| StorageError::Backend("could not determine project directories".into()))?;
        let data_dir = proj_dirs.data_dir();
        std::fs::create_dir_all(data_dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(data_dir, std::fs::Permissions::from_mode(0o700));
        }
        Ok(data_dir.join("noesis.db"))
    }

    pub fn open(
        path: Option<PathBuf>,
        compression: CompressionConfig,
        embeddings: EmbeddingsConfig,
    ) -> StorageResult<Self> {
        let path = match path {
            Some(p) => p,
            None => Self::default_path()?,
        };

        let writer = Connection::open(&path)?;
        #[cfg(unix)]
        if path.exists() {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600));
        }
        Self::configure_connection(&writer)?;
        super::migrations::apply_migrations(&writer)?;

        let reader = Connection::open(&path)?;
        Self::configure_connection(&reader)?;

        #[cfg(feature = "vector-search")]
        let vector_index = Mutex::new(VectorIndex::new().ok());

        Ok(Self {
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
            compression,
            embeddings,
            #[cfg(feature = "vector-search")]
            vector_index,
            vector_search_warned: Once::new(),
        })
    }

    /// A shared-cache in-memory database, uniquely named per call so
    /// concurrent tests don't collide. The writer connection is kept open
    /// for the driver's lifetime, which keeps the in-memory database alive
    /// for the reader connection too (SQLite drops a shared-cache `:memory:`
    /// db once its last connection closes).
    pub fn open_in_memory(compression: CompressionConfig, embeddings: EmbeddingsConfig) -> StorageResult<Self> {
        static COUNTER: std::sync::atomic::AtomicU64 = std::sync::atomic::AtomicU64::new(0);
        let id = COUNTER.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let uri = format!("file:noesis_mem_{id}?mode=memory&cache=shared");

        let writer = Connection::open(&uri)?;
        Self::configure_connection(&writer)?;
        super::migrations::apply_migrations(&writer)?;

        let reader = Connection::open(&uri)?;
        Self::configure_connection(&reader)?;

        #[cfg(feature = "vector-search")]
        let vector_index = Mutex::new(VectorIndex::new().ok());

        Ok(Self {
            writer: Mutex::new(writer),
            reader: Mutex::new(reader),
            compression,
            embeddings,
            #[cfg(feature = "vector-search")]
            vector_index,
            vector_search_warned: Once::new(),
        })
    }

    fn encode_blob(&self, text: &str) -> StorageResult<Vec<u8>> {
        compression::encode(text.as_bytes(), &self.compression)
    }

    fn decode_blob(&self, blob: &[u8]) -> StorageResult<String> {
        let bytes = compression::decode(blob)?;
        String::from_utf8(bytes).map_err(|e| StorageError::Backend(e.to_string()))
    }

    fn encode_embedding(&self, vector: &[f32]) -> (Vec<u8>, Option<f32>, Option<f32>) {
        if self.embeddings.quantization_enabled {
            let q = quantization::quantize(vector);
            let bytes: Vec<u8> = q.values.iter().map(|&v| v as u8).collect();
            (bytes, Some(q.scale), Some(q.offset))
        } else {
            let bytes: Vec<u8> = vector.iter().flat_map(|f| f.to_le_bytes()).collect();
            (bytes, None, None)
        }
    }

    fn decode_embedding(bytes: &[u8], scale: Option<f32>, offset: Option<f32>) -> Vec<f32> {
        match (scale, offset) {
            (Some(scale), Some(offset)) => {
                let q = quantization::QuantizedEmbedding {
                    values: bytes.iter().map(|&b| b as i8).collect(),
                    scale,
                    offset,
                };
                quantization::dequantize(&q)
            }
            _ => bytes
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        }
    }
}

fn fact_row(row: &rusqlite::Row, driver: &SqliteDriver) -> rusqlite::Result<ExtractedFact> {
    let value_blob: Vec<u8> = row.get("value")?;
    let value = driver
        .decode_blob(&value_blob)
        .unwrap_or_else(|_| String::new());
    let embedding: Option<Vec<u8>> = row.get("embedding")?;
    let scale: Option<f32> = row.get("embedding_scale")?;
    let offset: Option<f32> = row.get("embedding_offset")?;
    Ok(ExtractedFact {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        conversation_id: row.get("conversation_id")?,
        key: row.get("key")?,
        value,
        entity_type: EntityType::parse_name(&row.get::<_, String>("entity_type")?),
        importance: row.get("importance")?,
        access_count: row.get("access_count")?,
        last_accessed: parse_ts(&row.get::<_, String>("last_accessed")?),
        created_at: parse_ts(&row.get::<_, String>("created_at")?),
        embedding: embedding.map(|b| SqliteDriver::decode_embedding(&b, scale, offset)),
        deleted_at: row
            .get::<_, Option<String>>("deleted_at")?
            .map(|s| parse_ts(&s)),
        promoted_to: row.get("promoted_to")?,
    })
}

fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now())
}

#[async_trait]
impl WorkingRepo for SqliteDriver {
    async fn add(&self, user: &str, conv: &str, msg: Message) -> StorageResult<()> {
        let conn = self.writer.lock().map_err(|_| StorageError::Backend("writer lock poisoned".into()))?;
        let expires_at = Utc::now() + Duration::hours(1);
        let content_blob = self.encode_blob(&msg.content)?;
        conn.execute(
            "INSERT INTO working_messages
                (id, user_id, conversation_id, role, content, created_at, tags,
                 importance_score, extracted_entities, expires_at, access_count, last_accessed)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                msg.id,
                user,
                conv,
                msg.role.as_str(),
                content_blob,
                msg.timestamp.to_rfc3339(),
                serde_json::to_string(&msg.tags).unwrap_or_default(),
                msg.importance_score,
                msg.extracted_entities.map(|e| serde_json::to_string(&e).unwrap_or_default()),
                expires_at.to_rfc3339(),
                msg.access_count,
                msg.last_accessed.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    async fn recent(&self, user: &str, conv: &str, n: usize) -> StorageResult<Vec<Message>> {
        let conn = self.reader.lock().map_err(|_| StorageError::Backend("reader lock poisoned".into()))?;
        let now = Utc::now().to_rfc3339();
        let mut stmt = conn.prepare(
            "SELECT id, role, content, created_at, tags, importance_score, extracted_entities,
                    access_count, last_accessed
             FROM working_messages
             WHERE user_id = ?1 AND conversation_id = ?2 AND expires_at > ?3
             ORDER BY created_at DESC LIMIT ?4",
        )?;
        let rows = stmt.query_map(params![user, conv, now, n as i64], |row| {
            let content_blob: Vec<u8> = row.get("content")?;
            let tags_json: String = row.get("tags")?;
            let entities_json: Option<String> = row.get("extracted_entities")?;
            Ok((
                row.get::<_, String>("id")?,
                row.get::<_, String>("role")?,
                content_blob,
                row.get::<_, String>("created_at")?,
                tags_json,
                row.get::<_, f64>("importance_score")?,
                entities_json,
                row.get::<_, u32>("access_count")?,
                row.get::<_, Option<String>>("last_accessed")?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (id, role, content_blob, created_at, tags_json, importance, entities_json, access_count, last_accessed) = row?;
            out.push(Message {
                id,
                user_id: user.to_string(),
                conversation_id: conv.to_string(),
                role: Role::parse_name(&role).unwrap_or(Role::User),
                content: self.decode_blob(&content_blob)?,
                timestamp: parse_ts(&created_at),
                tags: serde_json::from_str(&tags_json).unwrap_or_default(),
                importance_score: importance,
                extracted_entities: entities_json.and_then(|s| serde_json::from_str(&s).ok()),
                access_count,
                last_accessed: last_accessed.map(|s| parse_ts(&s)).unwrap_or(Utc::now()),
            });
        }
        out.reverse();

        // Bump access_count/last_accessed for every message this read surfaced
        // (§4.6 Phase 1's `access_count >= 3` criterion).
        if !out.is_empty() {
            let now = Utc::now().to_rfc3339();
            for msg in &out {
                conn.execute(
                    "UPDATE working_messages SET access_count = access_count + 1, last_accessed = ?2
                     WHERE id = ?1",
                    params![msg.id, now],
                )?;
            }
        }
        Ok(out)
    }

    async fn remove(&self, user: &str, conv: &str, id: &str) -> StorageResult<()> {
        let conn = self.writer.lock().map_err(|_| StorageError::Backend("writer lock poisoned".into()))?;
        conn.execute(
            "DELETE FROM working_messages WHERE id = ?1 AND user_id = ?2 AND conversation_id = ?3",
            params![id, user, conv],
        )?;
        Ok(())
    }

    async fn clear(&self, user: &str, conv: &str) -> StorageResult<()> {
        let conn = self.writer.lock().map_err(|_| StorageError::Backend("writer lock poisoned".into()))?;
        conn.execute(
            "DELETE FROM working_messages WHERE user_id = ?1 AND conversation_id = ?2",
            params![user, conv],
        )?;
        Ok(())
    }

    async fn promote_candidates(&self, user: &str) -> StorageResult<Vec<Message>> {
        let conn = self.writer.lock().map_err(|_| StorageError::Backend("writer lock poisoned".into()))?;
        let now = Utc::now();
        // prune expired entries before computing candidates (§4.6 eviction)
        conn.execute(
            "DELETE FROM working_messages WHERE user_id = ?1 AND expires_at <= ?2",
            params![user, now.to_rfc3339()],
        )?;

        let cutoff = (now - Duration::minutes(15)).to_rfc3339();
        let mut stmt = conn.prepare(
            "SELECT id, conversation_id, role, content, created_at, tags, importance_score, extracted_entities,
                    access_count, last_accessed
             FROM working_messages
             WHERE user_id = ?1 AND (importance_score > 0.7 OR access_count >= 3 OR created_at < ?2)",
        )?;
        let rows = stmt.query_map(params![user, cutoff], |row| {
            Ok((
                row.get::<_, String>("id")?,
                row.get::<_, String>("conversation_id")?,
                row.get::<_, String>("role")?,
                row.get::<_, Vec<u8>>("content")?,
                row.get::<_, String>("created_at")?,
                row.get::<_, String>("tags")?,
                row.get::<_, f64>("importance_score")?,
                row.get::<_, Option<String>>("extracted_entities")?,
                row.get::<_, u32>("access_count")?,
                row.get::<_, Option<String>>("last_accessed")?,
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (id, conv, role, content_blob, created_at, tags_json, importance, entities_json, access_count, last_accessed) = row?;
            out.push(Message {
                id,
                user_id: user.to_string(),
                conversation_id: conv,
                role: Role::parse_name(&role).unwrap_or(Role::User),
                content: self.decode_blob(&content_blob)?,
                timestamp: parse_ts(&created_at),
                tags: serde_json::from_str(&tags_json).unwrap_or_default(),
                importance_score: importance,
                extracted_entities: entities_json.and_then(|s| serde_json::from_str(&s).ok()),
                access_count,
                last_accessed: last_accessed.map(|s| parse_ts(&s)).unwrap_or(Utc::now()),
            });
        }
        Ok(out)
    }

    async fn total_count(&self, user: &str) -> StorageResult<usize> {
        let conn = self.reader.lock().map_err(|_| StorageError::Backend("reader lock poisoned".into()))?;
        let now = Utc::now().to_rfc3339();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM working_messages WHERE user_id = ?1 AND expires_at > ?2",
            params![user, now],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    async fn delete_user(&self, user: &str) -> StorageResult<()> {
        let conn = self.writer.lock().map_err(|_| StorageError::Backend("writer lock poisoned".into()))?;
        conn.execute("DELETE FROM working_messages WHERE user_id = ?1", params![user])?;
        Ok(())
    }
}

#[async_trait]
impl SemanticRepo for SqliteDriver {
    async fn add(&self, fact: ExtractedFact) -> StorageResult<()> {
        let conn = self.writer.lock().map_err(|_| StorageError::Backend("writer lock poisoned".into()))?;
        let value_blob = self.encode_blob(&fact.value)?;
        let (embedding_bytes, scale, offset) = fact
            .embedding
            .as_ref()
            .map(|e| self.encode_embedding(e))
            .map(|(b, s, o)| (Some(b), s, o))
            .unwrap_or((None, None, None));

        conn.execute(
            "INSERT INTO semantic_facts
                (id, user_id, conversation_id, key, value, entity_type, importance,
                 access_count, last_accessed, created_at, embedding, embedding_scale,
                 embedding_offset, deleted_at, promoted_to)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13,?14,?15)",
            params![
                fact.id,
                fact.user_id,
                fact.conversation_id,
                fact.key,
                value_blob,
                fact.entity_type.as_str(),
                fact.importance,
                fact.access_count,
                fact.last_accessed.to_rfc3339(),
                fact.created_at.to_rfc3339(),
                embedding_bytes,
                scale,
                offset,
                fact.deleted_at.map(|d| d.to_rfc3339()),
                fact.promoted_to,
            ],
        )?;

        #[cfg(feature = "vector-search")]
        if let Some(embedding) = &fact.embedding {
            if let Ok(mut guard) = self.vector_index.lock() {
                if let Some(index) = guard.as_mut() {
                    let _ = index.add(&fact.id, embedding);
                }
            }
        }

        Ok(())
    }

    async fn update(&self, fact: ExtractedFact) -> StorageResult<()> {
        let conn = self.writer.lock().map_err(|_| StorageError::Backend("writer lock poisoned".into()))?;
        let value_blob = self.encode_blob(&fact.value)?;
        let (embedding_bytes, scale, offset) = fact
            .embedding
            .as_ref()
            .map(|e| self.encode_embedding(e))
            .map(|(b, s, o)| (Some(b), s, o))
            .unwrap_or((None, None, None));

        conn.execute(
            "UPDATE semantic_facts SET key=?2, value=?3, entity_type=?4, importance=?5,
                access_count=?6, last_accessed=?7, embedding=?8, embedding_scale=?9,
                embedding_offset=?10, deleted_at=?11, promoted_to=?12
             WHERE id=?1",
            params![
                fact.id,
                fact.key,
                value_blob,
                fact.entity_type.as_str(),
                fact.importance,
                fact.access_count,
                fact.last_accessed.to_rfc3339(),
                embedding_bytes,
                scale,
                offset,
                fact.deleted_at.map(|d| d.to_rfc3339()),
                fact.promoted_to,
            ],
        )?;
        Ok(())
    }

    async fn search_by_embedding(
        &self,
        user: &str,
        vector: &[f32],
        threshold: f32,
        k: usize,
    ) -> StorageResult<Vec<(ExtractedFact, f32)>> {
        #[cfg(feature = "vector-search")]
        {
            let candidate_ids: Vec<(String, f32)> = {
                let guard = self.vector_index.lock().map_err(|_| StorageError::Backend("vector index lock poisoned".into()))?;
                match guard.as_ref() {
                    Some(index) => index
                        .search_with_threshold(vector, k.max(32), threshold)
                        .map_err(|e| StorageError::Backend(e.to_string()))?,
                    None => Vec::new(),
                }
            };

            let mut out = Vec::new();
            for (id, score) in candidate_ids {
                if let Some(fact) = self.get_by_id(&id).await? {
                    if fact.user_id == user && !fact.is_deleted() {
                        out.push((fact, score));
                    }
                }
                if out.len() >= k {
                    break;
                }
            }
            return Ok(out);
        }

        #[cfg(not(feature = "vector-search"))]
        {
            self.vector_search_warned.call_once(|| {
                tracing::warn!(
                    "semantic search_by_embedding: no native vector index available, \
                     falling back to exhaustive scan"
                );
            });
            let facts = SemanticRepo::by_user(self, user).await?;
            let mut scored: Vec<(ExtractedFact, f32)> = facts
                .into_iter()
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
    }

    async fn get_by_key(&self, user: &str, key: &str) -> StorageResult<Option<ExtractedFact>> {
        let conn = self.reader.lock().map_err(|_| StorageError::Backend("reader lock poisoned".into()))?;
        conn.query_row(
            "SELECT * FROM semantic_facts WHERE user_id=?1 AND key=?2 AND deleted_at IS NULL",
            params![user, key],
            |row| fact_row(row, self),
        )
        .optional()
        .map_err(StorageError::from)
    }

    async fn get_by_id(&self, id: &str) -> StorageResult<Option<ExtractedFact>> {
        let conn = self.reader.lock().map_err(|_| StorageError::Backend("reader lock poisoned".into()))?;
        conn.query_row(
            "SELECT * FROM semantic_facts WHERE id=?1",
            params![id],
            |row| fact_row(row, self),
        )
        .optional()
        .map_err(StorageError::from)
    }

    async fn delete(&self, id: &str) -> StorageResult<()> {
        let conn = self.writer.lock().map_err(|_| StorageError::Backend("writer lock poisoned".into()))?;
        conn.execute("DELETE FROM semantic_facts WHERE id=?1", params![id])?;
        #[cfg(feature = "vector-search")]
        if let Ok(mut guard) = self.vector_index.lock() {
            if let Some(index) = guard.as_mut() {
                let _ = index.remove(id);
            }
        }
        Ok(())
    }

    async fn by_user(&self, user: &str) -> StorageResult<Vec<ExtractedFact>> {
        let conn = self.reader.lock().map_err(|_| StorageError::Backend("reader lock poisoned".into()))?;
        let mut stmt = conn.prepare("SELECT * FROM semantic_facts WHERE user_id=?1 AND deleted_at IS NULL")?;
        let rows = stmt.query_map(params![user], |row| fact_row(row, self))?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(StorageError::from)
    }

    async fn promote_candidates(&self, user: &str) -> StorageResult<Vec<ExtractedFact>> {
        let conn = self.reader.lock().map_err(|_| StorageError::Backend("reader lock poisoned".into()))?;
        // Full non-deleted pool for the user; the consolidation pipeline
        // unions the confidence/age filter with similarity clustering over
        // this same pool rather than having either restrict the other.
        let mut stmt = conn.prepare("SELECT * FROM semantic_facts WHERE user_id=?1 AND deleted_at IS NULL")?;
        let rows = stmt.query_map(params![user], |row| fact_row(row, self))?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(StorageError::from)
    }

    async fn prune_candidates(
        &self,
        user: &str,
        ttl: Duration,
        min_access_count: u32,
    ) -> StorageResult<Vec<ExtractedFact>> {
        let conn = self.reader.lock().map_err(|_| StorageError::Backend("reader lock poisoned".into()))?;
        let cutoff = (Utc::now() - ttl).to_rfc3339();
        let mut stmt = conn.prepare(
            "SELECT * FROM semantic_facts
             WHERE user_id=?1 AND deleted_at IS NULL AND created_at < ?2 AND access_count < ?3",
        )?;
        let rows = stmt.query_map(params![user, cutoff, min_access_count], |row| fact_row(row, self))?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(StorageError::from)
    }

    async fn delete_user(&self, user: &str) -> StorageResult<()> {
        let conn = self.writer.lock().map_err(|_| StorageError::Backend("writer lock poisoned".into()))?;
        conn.execute("DELETE FROM semantic_facts WHERE user_id=?1", params![user])?;
        Ok(())
    }
}

#[async_trait]
impl EpisodicRepo for SqliteDriver {
    async fn add(&self, event: EpisodicEvent) -> StorageResult<()> {
        let conn = self.writer.lock().map_err(|_| StorageError::Backend("writer lock poisoned".into()))?;
        let content_blob = self.encode_blob(&event.content)?;
        let embedding_bytes = event.embedding.as_ref().map(|e| self.encode_embedding(e).0);

        conn.execute(
            "INSERT INTO episodic_events
                (id, user_id, conversation_id, event_type, content, occurred_at,
                 decay_factor, embedding, metadata)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
            params![
                event.id,
                event.user_id,
                event.conversation_id,
                event.event_type,
                content_blob,
                event.occurred_at.to_rfc3339(),
                event.decay_factor,
                embedding_bytes,
                serde_json::to_string(&event.metadata).unwrap_or_default(),
            ],
        )?;
        conn.execute(
            "INSERT INTO episodic_events_fts (rowid, id, content)
             VALUES ((SELECT rowid FROM episodic_events WHERE id = ?1), ?1, ?2)",
            params![event.id, event.content],
        )?;
        Ok(())
    }

    async fn by_time_range(
        &self,
        user: &str,
        conv: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StorageResult<Vec<EpisodicEvent>> {
        let conn = self.reader.lock().map_err(|_| StorageError::Backend("reader lock poisoned".into()))?;
        let mut stmt = conn.prepare(
            "SELECT * FROM episodic_events
             WHERE user_id=?1 AND conversation_id=?2 AND occurred_at BETWEEN ?3 AND ?4
             ORDER BY occurred_at ASC",
        )?;
        let rows = stmt.query_map(
            params![user, conv, start.to_rfc3339(), end.to_rfc3339()],
            |row| event_row(row, self),
        )?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(StorageError::from)
    }

    async fn by_type(&self, user: &str, event_type: &str, k: usize) -> StorageResult<Vec<EpisodicEvent>> {
        let conn = self.reader.lock().map_err(|_| StorageError::Backend("reader lock poisoned".into()))?;
        let mut stmt = conn.prepare(
            "SELECT * FROM episodic_events WHERE user_id=?1 AND event_type=?2
             ORDER BY occurred_at DESC LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![user, event_type, k as i64], |row| event_row(row, self))?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(StorageError::from)
    }

    async fn search(&self, user: &str, query: &str, k: usize) -> StorageResult<Vec<EpisodicEvent>> {
        let conn = self.reader.lock().map_err(|_| StorageError::Backend("reader lock poisoned".into()))?;
        let sanitized = sanitize_fts5_query(query);
        if sanitized.is_empty() {
            return Ok(Vec::new());
        }
        let mut stmt = conn.prepare(
            "SELECT e.* FROM episodic_events e
             JOIN episodic_events_fts fts ON fts.id = e.id
             WHERE e.user_id=?1 AND episodic_events_fts MATCH ?2
             ORDER BY rank LIMIT ?3",
        )?;
        let rows = stmt.query_map(params![user, sanitized, k as i64], |row| event_row(row, self))?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(StorageError::from)
    }

    async fn get(&self, id: &str) -> StorageResult<Option<EpisodicEvent>> {
        let conn = self.reader.lock().map_err(|_| StorageError::Backend("reader lock poisoned".into()))?;
        conn.query_row("SELECT * FROM episodic_events WHERE id=?1", params![id], |row| {
            event_row(row, self)
        })
        .optional()
        .map_err(StorageError::from)
    }

    async fn delete(&self, id: &str) -> StorageResult<()> {
        let conn = self.writer.lock().map_err(|_| StorageError::Backend("writer lock poisoned".into()))?;
        conn.execute("DELETE FROM episodic_events WHERE id=?1", params![id])?;
        conn.execute("DELETE FROM episodic_events_fts WHERE id=?1", params![id])?;
        Ok(())
    }

    async fn by_user(&self, user: &str) -> StorageResult<Vec<EpisodicEvent>> {
        let conn = self.reader.lock().map_err(|_| StorageError::Backend("reader lock poisoned".into()))?;
        let mut stmt = conn.prepare("SELECT * FROM episodic_events WHERE user_id=?1")?;
        let rows = stmt.query_map(params![user], |row| event_row(row, self))?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(StorageError::from)
    }

    async fn promote_candidates(&self, user: &str, window: Duration) -> StorageResult<Vec<EpisodicEvent>> {
        let conn = self.reader.lock().map_err(|_| StorageError::Backend("reader lock poisoned".into()))?;
        let cutoff = (Utc::now() - window).to_rfc3339();
        let mut stmt = conn.prepare(
            "SELECT * FROM episodic_events WHERE user_id=?1 AND occurred_at >= ?2
             AND metadata NOT LIKE '%\"consolidated\":\"true\"%'",
        )?;
        let rows = stmt.query_map(params![user, cutoff], |row| event_row(row, self))?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(StorageError::from)
    }

    async fn delete_user(&self, user: &str) -> StorageResult<()> {
        let conn = self.writer.lock().map_err(|_| StorageError::Backend("writer lock poisoned".into()))?;
        conn.execute(
            "DELETE FROM episodic_events_fts WHERE id IN (SELECT id FROM episodic_events WHERE user_id=?1)",
            params![user],
        )?;
        conn.execute("DELETE FROM episodic_events WHERE user_id=?1", params![user])?;
        Ok(())
    }
}

fn event_row(row: &rusqlite::Row, driver: &SqliteDriver) -> rusqlite::Result<EpisodicEvent> {
    let content_blob: Vec<u8> = row.get("content")?;
    let content = driver.decode_blob(&content_blob).unwrap_or_default();
    let embedding: Option<Vec<u8>> = row.get("embedding")?;
    let metadata_json: String = row.get("metadata")?;
    Ok(EpisodicEvent {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        conversation_id: row.get("conversation_id")?,
        event_type: row.get("event_type")?,
        content,
        occurred_at: parse_ts(&row.get::<_, String>("occurred_at")?),
        decay_factor: row.get("decay_factor")?,
        embedding: embedding.map(|b| SqliteDriver::decode_embedding(&b, None, None)),
        metadata: serde_json::from_str(&metadata_json).unwrap_or_default(),
    })
}

/// Strips FTS5 special characters so user-supplied query text can't break
/// the MATCH syntax (quoting each token keeps `-`/`"`/etc. literal).
pub fn sanitize_fts5_query(query: &str) -> String {
    query
        .split_whitespace()
        .map(|token| {
            let cleaned: String = token.chars().filter(|c| c.is_alphanumeric()).collect();
            cleaned
        })
        .filter(|t| !t.is_empty())
        .map(|t| format!("\"{t}\""))
        .collect::<Vec<_>>()
        .join(" OR ")
}

#[async_trait]
impl ProceduralRepo for SqliteDriver {
    async fn upsert(&self, pattern: ProceduralPattern) -> StorageResult<()> {
        let conn = self.writer.lock().map_err(|_| StorageError::Backend("writer lock poisoned".into()))?;
        let triggers_json = serde_json::to_string(&pattern.triggers).unwrap_or_default();
        conn.execute(
            "INSERT INTO procedural_patterns
                (id, user_id, name, description, triggers, instruction_template,
                 confidence_threshold, usage_count, last_used, success_count,
                 failure_count, created_at, embedding)
             VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13)
             ON CONFLICT(id) DO UPDATE SET
                name=excluded.name, description=excluded.description,
                triggers=excluded.triggers, instruction_template=excluded.instruction_template,
                confidence_threshold=excluded.confidence_threshold,
                usage_count=excluded.usage_count, last_used=excluded.last_used,
                success_count=excluded.success_count, failure_count=excluded.failure_count,
                embedding=excluded.embedding",
            params![
                pattern.id,
                pattern.user_id,
                pattern.name,
                pattern.description,
                triggers_json,
                pattern.instruction_template,
                pattern.confidence_threshold,
                pattern.usage_count,
                pattern.last_used.map(|d| d.to_rfc3339()),
                pattern.success_count,
                pattern.failure_count,
                pattern.created_at.to_rfc3339(),
                pattern.embedding.map(|e| self.encode_embedding(&e).0),
            ],
        )?;
        Ok(())
    }

    async fn by_user(&self, user: &str) -> StorageResult<Vec<ProceduralPattern>> {
        let conn = self.reader.lock().map_err(|_| StorageError::Backend("reader lock poisoned".into()))?;
        let mut stmt = conn.prepare("SELECT * FROM procedural_patterns WHERE user_id=?1")?;
        let rows = stmt.query_map(params![user], pattern_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(StorageError::from)
    }

    async fn get(&self, id: &str) -> StorageResult<Option<ProceduralPattern>> {
        let conn = self.reader.lock().map_err(|_| StorageError::Backend("reader lock poisoned".into()))?;
        conn.query_row("SELECT * FROM procedural_patterns WHERE id=?1", params![id], pattern_row)
            .optional()
            .map_err(StorageError::from)
    }

    async fn record_success(&self, id: &str) -> StorageResult<()> {
        let conn = self.writer.lock().map_err(|_| StorageError::Backend("writer lock poisoned".into()))?;
        let changed = conn.execute(
            "UPDATE procedural_patterns SET success_count = success_count + 1 WHERE id=?1",
            params![id],
        )?;
        if changed == 0 {
            return Err(StorageError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn record_failure(&self, id: &str) -> StorageResult<()> {
        let conn = self.writer.lock().map_err(|_| StorageError::Backend("writer lock poisoned".into()))?;
        let changed = conn.execute(
            "UPDATE procedural_patterns SET failure_count = failure_count + 1 WHERE id=?1",
            params![id],
        )?;
        if changed == 0 {
            return Err(StorageError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn touch(&self, id: &str) -> StorageResult<()> {
        let conn = self.writer.lock().map_err(|_| StorageError::Backend("writer lock poisoned".into()))?;
        let changed = conn.execute(
            "UPDATE procedural_patterns SET usage_count = usage_count + 1, last_used = ?2 WHERE id=?1",
            params![id, Utc::now().to_rfc3339()],
        )?;
        if changed == 0 {
            return Err(StorageError::NotFound(id.to_string()));
        }
        Ok(())
    }

    async fn delete(&self, id: &str) -> StorageResult<()> {
        let conn = self.writer.lock().map_err(|_| StorageError::Backend("writer lock poisoned".into()))?;
        conn.execute("DELETE FROM procedural_patterns WHERE id=?1", params![id])?;
        Ok(())
    }

    async fn delete_user(&self, user: &str) -> StorageResult<()> {
        let conn = self.writer.lock().map_err(|_| StorageError::Backend("writer lock poisoned".into()))?;
        conn.execute("DELETE FROM procedural_patterns WHERE user_id=?1", params![user])?;
        Ok(())
    }
}

fn pattern_row(row: &rusqlite::Row) -> rusqlite::Result<ProceduralPattern> {
    let triggers_json: String = row.get("triggers")?;
    let triggers: Vec<Trigger> = serde_json::from_str(&triggers_json).unwrap_or_default();
    let embedding: Option<Vec<u8>> = row.get("embedding")?;
    Ok(ProceduralPattern {
        id: row.get("id")?,
        user_id: row.get("user_id")?,
        name: row.get("name")?,
        description: row.get("description")?,
        triggers,
        instruction_template: row.get("instruction_template")?,
        confidence_threshold: row.get("confidence_threshold")?,
        usage_count: row.get("usage_count")?,
        last_used: row
            .get::<_, Option<String>>("last_used")?
            .map(|s| parse_ts(&s)),
        success_count: row.get("success_count")?,
        failure_count: row.get("failure_count")?,
        created_at: parse_ts(&row.get::<_, String>("created_at")?),
        embedding: embedding.map(|b| SqliteDriver::decode_embedding(&b, None, None)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::EntityType;

    fn driver() -> SqliteDriver {
        SqliteDriver::open_in_memory(CompressionConfig::default(), EmbeddingsConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn store_and_recall_message() {
        let d = driver();
        WorkingRepo::add(&d, "u1", "c1", Message::new("u1", "c1", Role::User, "Hi")).await.unwrap();
        let recent = d.recent("u1", "c1", 5).await.unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].content, "Hi");
        assert!(recent[0].importance_score >= 0.0 && recent[0].importance_score <= 1.0);
    }

    #[tokio::test]
    async fn fact_round_trips_with_embedding() {
        let d = driver();
        let mut fact = ExtractedFact::new("u1", "c1", "favorite_language", "Rust", EntityType::Technology, 0.9);
        fact.embedding = Some(vec![0.1, 0.2, 0.3]);
        SemanticRepo::add(&d, fact.clone()).await.unwrap();

        let fetched = d.get_by_id(&fact.id).await.unwrap().unwrap();
        assert_eq!(fetched.value, "Rust");
        assert!(fetched.embedding.is_some());
    }

    #[tokio::test]
    async fn episodic_search_finds_substring_match() {
        let d = driver();
        EpisodicRepo::add(&d, EpisodicEvent::new("u1", "c1", "message", "we discussed the database schema")).await.unwrap();
        let hits = d.search("u1", "database", 5).await.unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn delete_user_removes_across_all_tiers() {
        let d = driver();
        WorkingRepo::add(&d, "u1", "c1", Message::new("u1", "c1", Role::User, "hi")).await.unwrap();
        SemanticRepo::add(&d, ExtractedFact::new("u1", "c1", "k", "v", EntityType::Other, 0.5)).await.unwrap();
        EpisodicRepo::add(&d, EpisodicEvent::new("u1", "c1", "message", "hi")).await.unwrap();
        ProceduralRepo::upsert(&d, ProceduralPattern::new("u1", "p", "d", vec![], "t", 0.5)).await.unwrap();

        WorkingRepo::delete_user(&d, "u1").await.unwrap();
        SemanticRepo::delete_user(&d, "u1").await.unwrap();
        EpisodicRepo::delete_user(&d, "u1").await.unwrap();
        ProceduralRepo::delete_user(&d, "u1").await.unwrap();

        assert!(d.recent("u1", "c1", 10).await.unwrap().is_empty());
        assert!(SemanticRepo::by_user(&d, "u1").await.unwrap().is_empty());
        assert!(EpisodicRepo::by_user(&d, "u1").await.unwrap().is_empty());
        assert!(ProceduralRepo::by_user(&d, "u1").await.unwrap().is_empty());
    }

    #[test]
    fn sanitize_strips_fts5_special_chars() {
        let sanitized = sanitize_fts5_query("\"drop table\" OR 1=1");
        assert!(!sanitized.contains('"') || sanitized.starts_with('"'));
        assert!(sanitized.contains("drop"));
    }
}
