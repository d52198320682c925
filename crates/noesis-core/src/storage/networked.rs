//! Networked driver (§4.1): a Qdrant-backed store providing native HNSW
//! vector similarity search, satisfying the requirement that at least one
//! driver offer real ANN search rather than the embedded-file driver's
//! optional local index or exhaustive-scan fallback.
//!
//! One collection per tier, all in the same Qdrant instance. Only the
//! semantic-tier collection's vectors are ever queried by similarity;
//! the other three collections carry a single dummy dimension so every
//! point type satisfies Qdrant's "every point needs a vector" requirement
//! while being addressed purely through payload filters.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use qdrant_client::qdrant::{
    Condition, CreateCollectionBuilder, DeletePointsBuilder, Filter, PointId, PointStruct,
    ScrollPointsBuilder, SearchPointsBuilder, UpsertPointsBuilder, Value as QdrantValue,
    VectorParamsBuilder,
};
use qdrant_client::{Payload, Qdrant};

use crate::error::{StorageError, StorageResult};
use crate::model::{EntityType, EpisodicEvent, ExtractedFact, Message, ProceduralPattern, Role, Trigger};

use super::traits::{EpisodicRepo, ProceduralRepo, SemanticRepo, WorkingRepo};

const WORKING_COLLECTION: &str = "noesis_working";
const SEMANTIC_COLLECTION: &str = "noesis_semantic";
const EPISODIC_COLLECTION: &str = "noesis_episodic";
const PROCEDURAL_COLLECTION: &str = "noesis_procedural";

/// Dimension used for tiers that don't carry a meaningful embedding; Qdrant
/// requires every point to have *a* vector even when it is never searched.
const PLACEHOLDER_DIM: u64 = 1;

fn qdrant_err(e: impl std::fmt::Display) -> StorageError {
    StorageError::Backend(e.to_string())
}

pub struct NetworkedDriver {
    client: Qdrant,
    semantic_dim: u64,
}

impl NetworkedDriver {
    pub async fn connect(url: &str, semantic_dim: u64) -> StorageResult<Self> {
        let client = Qdrant::from_url(url).build().map_err(qdrant_err)?;
        let driver = Self {
            client,
            semantic_dim,
        };
        driver.ensure_collections().await?;
        Ok(driver)
    }

    async fn ensure_collections(&self) -> StorageResult<()> {
        for (name, dim) in [
            (WORKING_COLLECTION, PLACEHOLDER_DIM),
            (SEMANTIC_COLLECTION, self.semantic_dim),
            (EPISODIC_COLLECTION, PLACEHOLDER_DIM),
            (PROCEDURAL_COLLECTION, PLACEHOLDER_DIM),
        ] {
            let exists = self
                .client
                .collection_exists(name)
                .await
                .map_err(qdrant_err)?;
            if !exists {
                self.client
                    .create_collection(
                        CreateCollectionBuilder::new(name)
                            .vectors_config(VectorParamsBuilder::new(dim, qdrant_client::qdrant::Distance::Cosine)),
                    )
                    .await
                    .map_err(qdrant_err)?;
            }
        }
        Ok(())
    }

    fn point_id(id: &str) -> PointId {
        PointId::from(id.to_string())
    }

    fn get_str(payload: &HashMap<String, QdrantValue>, key: &str) -> String {
        payload
            .get(key)
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default()
    }

    fn get_opt_str(payload: &HashMap<String, QdrantValue>, key: &str) -> Option<String> {
        payload.get(key).and_then(|v| v.as_str().map(str::to_string))
    }

    fn get_f64(payload: &HashMap<String, QdrantValue>, key: &str) -> f64 {
        payload.get(key).and_then(|v| v.as_double()).unwrap_or(0.0)
    }

    fn get_u32(payload: &HashMap<String, QdrantValue>, key: &str) -> u32 {
        payload
            .get(key)
            .and_then(|v| v.as_integer())
            .and_then(|n| u32::try_from(n).ok())
            .unwrap_or(0)
    }

    fn get_ts(payload: &HashMap<String, QdrantValue>, key: &str) -> DateTime<Utc> {
        Self::get_opt_str(payload, key)
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(Utc::now)
    }

    async fn scroll_all(
        &self,
        collection: &str,
        filter: Filter,
    ) -> StorageResult<Vec<HashMap<String, QdrantValue>>> {
        let response = self
            .client
            .scroll(
                ScrollPointsBuilder::new(collection)
                    .filter(filter)
                    .limit(10_000)
                    .with_payload(true),
            )
            .await
            .map_err(qdrant_err)?;
        Ok(response.result.into_iter().map(|p| p.payload).collect())
    }
}

fn message_to_payload(msg: &Message, expires_at: DateTime<Utc>) -> Payload {
    let mut map: HashMap<String, QdrantValue> = HashMap::new();
    map.insert("id".into(), msg.id.clone().into());
    map.insert("user_id".into(), msg.user_id.clone().into());
    map.insert("conversation_id".into(), msg.conversation_id.clone().into());
    map.insert("role".into(), msg.role.as_str().to_string().into());
    map.insert("content".into(), msg.content.clone().into());
    map.insert("created_at".into(), msg.timestamp.to_rfc3339().into());
    map.insert("importance_score".into(), msg.importance_score.into());
    map.insert("expires_at".into(), expires_at.to_rfc3339().into());
    map.insert(
        "tags".into(),
        serde_json::to_string(&msg.tags).unwrap_or_default().into(),
    );
    map.insert("access_count".into(), (msg.access_count as i64).into());
    map.insert("last_accessed".into(), msg.last_accessed.to_rfc3339().into());
    Payload::from(map)
}

fn payload_to_message(payload: &HashMap<String, QdrantValue>) -> Message {
    Message {
        id: NetworkedDriver::get_str(payload, "id"),
        user_id: NetworkedDriver::get_str(payload, "user_id"),
        conversation_id: NetworkedDriver::get_str(payload, "conversation_id"),
        role: Role::parse_name(&NetworkedDriver::get_str(payload, "role")).unwrap_or(Role::User),
        content: NetworkedDriver::get_str(payload, "content"),
        timestamp: NetworkedDriver::get_ts(payload, "created_at"),
        tags: NetworkedDriver::get_opt_str(payload, "tags")
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default(),
        importance_score: NetworkedDriver::get_f64(payload, "importance_score"),
        extracted_entities: None,
        access_count: NetworkedDriver::get_u32(payload, "access_count"),
        last_accessed: NetworkedDriver::get_ts(payload, "last_accessed"),
    }
}

#[async_trait]
impl WorkingRepo for NetworkedDriver {
    async fn add(&self, user: &str, conv: &str, msg: Message) -> StorageResult<()> {
        let expires_at = Utc::now() + Duration::hours(1);
        let point = PointStruct::new(
            Self::point_id(&msg.id),
            vec![0.0; PLACEHOLDER_DIM as usize],
            message_to_payload(&msg, expires_at),
        );
        self.client
            .upsert_points(UpsertPointsBuilder::new(WORKING_COLLECTION, vec![point]))
            .await
            .map_err(qdrant_err)?;
        let _ = (user, conv);
        Ok(())
    }

    async fn recent(&self, user: &str, conv: &str, n: usize) -> StorageResult<Vec<Message>> {
        let filter = Filter::must([
            Condition::matches("user_id", user.to_string()),
            Condition::matches("conversation_id", conv.to_string()),
        ]);
        let now = Utc::now();
        let mut messages: Vec<Message> = self
            .scroll_all(WORKING_COLLECTION, filter)
            .await?
            .iter()
            .map(payload_to_message)
            .filter(|_| true)
            .collect();
        messages.retain(|_| true);
        // expiry is checked against the raw payload timestamp, not re-derivable
        // from `Message` alone, so refetch with the filter above already scoped
        // to this conversation and drop anything whose TTL has lapsed.
        let payloads = self
            .scroll_all(
                WORKING_COLLECTION,
                Filter::must([
                    Condition::matches("user_id", user.to_string()),
                    Condition::matches("conversation_id", conv.to_string()),
                ]),
            )
            .await?;
        messages = payloads
            .iter()
            .filter(|p| NetworkedDriver::get_ts(p, "expires_at") > now)
            .map(payload_to_message)
            .collect();
        messages.sort_by_key(|m| m.timestamp);
        let start = messages.len().saturating_sub(n);
        Ok(messages[start..].to_vec())
    }

    async fn remove(&self, _user: &str, _conv: &str, id: &str) -> StorageResult<()> {
        self.client
            .delete_points(
                DeletePointsBuilder::new(WORKING_COLLECTION)
                    .points(vec![Self::point_id(id)]),
            )
            .await
            .map_err(qdrant_err)?;
        Ok(())
    }

    async fn clear(&self, user: &str, conv: &str) -> StorageResult<()> {
        let filter = Filter::must([
            Condition::matches("user_id", user.to_string()),
            Condition::matches("conversation_id", conv.to_string()),
        ]);
        self.client
            .delete_points(DeletePointsBuilder::new(WORKING_COLLECTION).points(filter))
            .await
            .map_err(qdrant_err)?;
        Ok(())
    }

    async fn promote_candidates(&self, user: &str) -> StorageResult<Vec<Message>> {
        let filter = Filter::must([Condition::matches("user_id", user.to_string())]);
        let now = Utc::now();
        let cutoff = now - Duration::minutes(15);
        Ok(self
            .scroll_all(WORKING_COLLECTION, filter)
            .await?
            .iter()
            .filter(|p| NetworkedDriver::get_ts(p, "expires_at") > now)
            .filter(|p| {
                NetworkedDriver::get_f64(p, "importance_score") > 0.7
                    || NetworkedDriver::get_ts(p, "created_at") < cutoff
            })
            .map(payload_to_message)
            .collect())
    }

    async fn total_count(&self, user: &str) -> StorageResult<usize> {
        let filter = Filter::must([Condition::matches("user_id", user.to_string())]);
        let now = Utc::now();
        Ok(self
            .scroll_all(WORKING_COLLECTION, filter)
            .await?
            .iter()
            .filter(|p| NetworkedDriver::get_ts(p, "expires_at") > now)
            .count())
    }

    async fn delete_user(&self, user: &str) -> StorageResult<()> {
        let filter = Filter::must([Condition::matches("user_id", user.to_string())]);
        self.client
            .delete_points(DeletePointsBuilder::new(WORKING_COLLECTION).points(filter))
            .await
            .map_err(qdrant_err)?;
        Ok(())
    }
}

fn fact_to_payload(fact: &ExtractedFact) -> Payload {
    let mut map: HashMap<String, QdrantValue> = HashMap::new();
    map.insert("id".into(), fact.id.clone().into());
    map.insert("user_id".into(), fact.user_id.clone().into());
    map.insert("conversation_id".into(), fact.conversation_id.clone().into());
    map.insert("key".into(), fact.key.clone().into());
    map.insert("value".into(), fact.value.clone().into());
    map.insert("entity_type".into(), fact.entity_type.as_str().to_string().into());
    map.insert("importance".into(), fact.importance.into());
    map.insert("access_count".into(), (fact.access_count as i64).into());
    map.insert("last_accessed".into(), fact.last_accessed.to_rfc3339().into());
    map.insert("created_at".into(), fact.created_at.to_rfc3339().into());
    if let Some(deleted_at) = fact.deleted_at {
        map.insert("deleted_at".into(), deleted_at.to_rfc3339().into());
    }
    if let Some(promoted_to) = &fact.promoted_to {
        map.insert("promoted_to".into(), promoted_to.clone().into());
    }
    Payload::from(map)
}

fn payload_to_fact(payload: &HashMap<String, QdrantValue>, embedding: Option<Vec<f32>>) -> ExtractedFact {
    ExtractedFact {
        id: NetworkedDriver::get_str(payload, "id"),
        user_id: NetworkedDriver::get_str(payload, "user_id"),
        conversation_id: NetworkedDriver::get_str(payload, "conversation_id"),
        key: NetworkedDriver::get_str(payload, "key"),
        value: NetworkedDriver::get_str(payload, "value"),
        entity_type: EntityType::parse_name(&NetworkedDriver::get_str(payload, "entity_type")),
        importance: NetworkedDriver::get_f64(payload, "importance"),
        access_count: payload
            .get("access_count")
            .and_then(|v| v.as_integer())
            .unwrap_or(0) as u32,
        last_accessed: NetworkedDriver::get_ts(payload, "last_accessed"),
        created_at: NetworkedDriver::get_ts(payload, "created_at"),
        embedding,
        deleted_at: NetworkedDriver::get_opt_str(payload, "deleted_at")
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc)),
        promoted_to: NetworkedDriver::get_opt_str(payload, "promoted_to"),
    }
}

#[async_trait]
impl SemanticRepo for NetworkedDriver {
    async fn add(&self, fact: ExtractedFact) -> StorageResult<()> {
        let vector = fact
            .embedding
            .clone()
            .unwrap_or_else(|| vec![0.0; self.semantic_dim as usize]);
        let point = PointStruct::new(Self::point_id(&fact.id), vector, fact_to_payload(&fact));
        self.client
            .upsert_points(UpsertPointsBuilder::new(SEMANTIC_COLLECTION, vec![point]))
            .await
            .map_err(qdrant_err)?;
        Ok(())
    }

    async fn update(&self, fact: ExtractedFact) -> StorageResult<()> {
        SemanticRepo::add(self, fact).await
    }

    async fn search_by_embedding(
        &self,
        user: &str,
        vector: &[f32],
        threshold: f32,
        k: usize,
    ) -> StorageResult<Vec<(ExtractedFact, f32)>> {
        let filter = Filter::must([Condition::matches("user_id", user.to_string())]);
        let response = self
            .client
            .search_points(
                SearchPointsBuilder::new(SEMANTIC_COLLECTION, vector.to_vec(), k as u64)
                    .filter(filter)
                    .score_threshold(threshold)
                    .with_payload(true),
            )
            .await
            .map_err(qdrant_err)?;

        Ok(response
            .result
            .into_iter()
            .filter(|p| !p.payload.contains_key("deleted_at"))
            .map(|p| {
                let score = p.score;
                (payload_to_fact(&p.payload, None), score)
            })
            .collect())
    }

    async fn get_by_key(&self, user: &str, key: &str) -> StorageResult<Option<ExtractedFact>> {
        let filter = Filter::must([
            Condition::matches("user_id", user.to_string()),
            Condition::matches("key", key.to_string()),
        ]);
        Ok(self
            .scroll_all(SEMANTIC_COLLECTION, filter)
            .await?
            .iter()
            .filter(|p| !p.contains_key("deleted_at"))
            .map(|p| payload_to_fact(p, None))
            .next())
    }

    async fn get_by_id(&self, id: &str) -> StorageResult<Option<ExtractedFact>> {
        let filter = Filter::must([Condition::matches("id", id.to_string())]);
        Ok(self
            .scroll_all(SEMANTIC_COLLECTION, filter)
            .await?
            .iter()
            .map(|p| payload_to_fact(p, None))
            .next())
    }

    async fn delete(&self, id: &str) -> StorageResult<()> {
        self.client
            .delete_points(
                DeletePointsBuilder::new(SEMANTIC_COLLECTION).points(vec![Self::point_id(id)]),
            )
            .await
            .map_err(qdrant_err)?;
        Ok(())
    }

    async fn by_user(&self, user: &str) -> StorageResult<Vec<ExtractedFact>> {
        let filter = Filter::must([Condition::matches("user_id", user.to_string())]);
        Ok(self
            .scroll_all(SEMANTIC_COLLECTION, filter)
            .await?
            .iter()
            .filter(|p| !p.contains_key("deleted_at"))
            .map(|p| payload_to_fact(p, None))
            .collect())
    }

    async fn promote_candidates(&self, user: &str) -> StorageResult<Vec<ExtractedFact>> {
        // Full non-deleted pool for the user; the consolidation pipeline
        // unions the confidence/age filter with similarity clustering over
        // this same pool rather than having either restrict the other.
        let filter = Filter::must([Condition::matches("user_id", user.to_string())]);
        Ok(self
            .scroll_all(SEMANTIC_COLLECTION, filter)
            .await?
            .iter()
            .filter(|p| !p.contains_key("deleted_at"))
            .map(|p| payload_to_fact(p, None))
            .collect())
    }

    async fn prune_candidates(
        &self,
        user: &str,
        ttl: Duration,
        min_access_count: u32,
    ) -> StorageResult<Vec<ExtractedFact>> {
        let cutoff = Utc::now() - ttl;
        let filter = Filter::must([Condition::matches("user_id", user.to_string())]);
        Ok(self
            .scroll_all(SEMANTIC_COLLECTION, filter)
            .await?
            .iter()
            .filter(|p| !p.contains_key("deleted_at"))
            .filter(|p| {
                NetworkedDriver::get_ts(p, "created_at") < cutoff
                    && (p.get("access_count").and_then(|v| v.as_integer()).unwrap_or(0) as u32)
                        < min_access_count
            })
            .map(|p| payload_to_fact(p, None))
            .collect())
    }

    async fn delete_user(&self, user: &str) -> StorageResult<()> {
        let filter = Filter::must([Condition::matches("user_id", user.to_string())]);
        self.client
            .delete_points(DeletePointsBuilder::new(SEMANTIC_COLLECTION).points(filter))
            .await
            .map_err(qdrant_err)?;
        Ok(())
    }
}

fn event_to_payload(event: &EpisodicEvent) -> Payload {
    let mut map: HashMap<String, QdrantValue> = HashMap::new();
    map.insert("id".into(), event.id.clone().into());
    map.insert("user_id".into(), event.user_id.clone().into());
    map.insert("conversation_id".into(), event.conversation_id.clone().into());
    map.insert("event_type".into(), event.event_type.clone().into());
    map.insert("content".into(), event.content.clone().into());
    map.insert("occurred_at".into(), event.occurred_at.to_rfc3339().into());
    map.insert("decay_factor".into(), event.decay_factor.into());
    map.insert(
        "metadata".into(),
        serde_json::to_string(&event.metadata).unwrap_or_default().into(),
    );
    Payload::from(map)
}

fn payload_to_event(payload: &HashMap<String, QdrantValue>) -> EpisodicEvent {
    EpisodicEvent {
        id: NetworkedDriver::get_str(payload, "id"),
        user_id: NetworkedDriver::get_str(payload, "user_id"),
        conversation_id: NetworkedDriver::get_str(payload, "conversation_id"),
        event_type: NetworkedDriver::get_str(payload, "event_type"),
        content: NetworkedDriver::get_str(payload, "content"),
        occurred_at: NetworkedDriver::get_ts(payload, "occurred_at"),
        decay_factor: NetworkedDriver::get_f64(payload, "decay_factor"),
        embedding: None,
        metadata: NetworkedDriver::get_opt_str(payload, "metadata")
            .and_then(|s| serde_json::from_str(&s).ok())
            .unwrap_or_default(),
    }
}

#[async_trait]
impl EpisodicRepo for NetworkedDriver {
    async fn add(&self, event: EpisodicEvent) -> StorageResult<()> {
        let point = PointStruct::new(
            Self::point_id(&event.id),
            vec![0.0; PLACEHOLDER_DIM as usize],
            event_to_payload(&event),
        );
        self.client
            .upsert_points(UpsertPointsBuilder::new(EPISODIC_COLLECTION, vec![point]))
            .await
            .map_err(qdrant_err)?;
        Ok(())
    }

    async fn by_time_range(
        &self,
        user: &str,
        conv: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    ) -> StorageResult<Vec<EpisodicEvent>> {
        let filter = Filter::must([
            Condition::matches("user_id", user.to_string()),
            Condition::matches("conversation_id", conv.to_string()),
        ]);
        let mut out: Vec<EpisodicEvent> = self
            .scroll_all(EPISODIC_COLLECTION, filter)
            .await?
            .iter()
            .map(payload_to_event)
            .filter(|e| e.occurred_at >= start && e.occurred_at <= end)
            .collect();
        out.sort_by_key(|e| e.occurred_at);
        Ok(out)
    }

    async fn by_type(&self, user: &str, event_type: &str, k: usize) -> StorageResult<Vec<EpisodicEvent>> {
        let filter = Filter::must([
            Condition::matches("user_id", user.to_string()),
            Condition::matches("event_type", event_type.to_string()),
        ]);
        let mut out: Vec<EpisodicEvent> = self
            .scroll_all(EPISODIC_COLLECTION, filter)
            .await?
            .iter()
            .map(payload_to_event)
            .collect();
        out.sort_by(|a, b| b.occurred_at.cmp(&a.occurred_at));
        out.truncate(k);
        Ok(out)
    }

    async fn search(&self, user: &str, query: &str, k: usize) -> StorageResult<Vec<EpisodicEvent>> {
        let filter = Filter::must([Condition::matches("user_id", user.to_string())]);
        let needle = query.to_lowercase();
        let mut out: Vec<EpisodicEvent> = self
            .scroll_all(EPISODIC_COLLECTION, filter)
            .await?
            .iter()
            .map(payload_to_event)
            .filter(|e| e.content.to_lowercase().contains(&needle))
            .collect();
        out.sort_by(|a, b| b.occurred_at.cmp(&a.occurred_at));
        out.truncate(k);
        Ok(out)
    }

    async fn get(&self, id: &str) -> StorageResult<Option<EpisodicEvent>> {
        let filter = Filter::must([Condition::matches("id", id.to_string())]);
        Ok(self
            .scroll_all(EPISODIC_COLLECTION, filter)
            .await?
            .iter()
            .map(payload_to_event)
            .next())
    }

    async fn delete(&self, id: &str) -> StorageResult<()> {
        self.client
            .delete_points(
                DeletePointsBuilder::new(EPISODIC_COLLECTION).points(vec![Self::point_id(id)]),
            )
            .await
            .map_err(qdrant_err)?;
        Ok(())
    }

    async fn by_user(&self, user: &str) -> StorageResult<Vec<EpisodicEvent>> {
        let filter = Filter::must([Condition::matches("user_id", user.to_string())]);
        Ok(self
            .scroll_all(EPISODIC_COLLECTION, filter)
            .await?
            .iter()
            .map(payload_to_event)
            .collect())
    }

    async fn promote_candidates(&self, user: &str, window: Duration) -> StorageResult<Vec<EpisodicEvent>> {
        let cutoff = Utc::now() - window;
        let filter = Filter::must([Condition::matches("user_id", user.to_string())]);
        Ok(self
            .scroll_all(EPISODIC_COLLECTION, filter)
            .await?
            .iter()
            .map(payload_to_event)
            .filter(|e| e.occurred_at >= cutoff && !e.is_consolidated())
            .collect())
    }

    async fn delete_user(&self, user: &str) -> StorageResult<()> {
        let filter = Filter::must([Condition::matches("user_id", user.to_string())]);
        self.client
            .delete_points(DeletePointsBuilder::new(EPISODIC_COLLECTION).points(filter))
            .await
            .map_err(qdrant_err)?;
        Ok(())
    }
}

fn pattern_to_payload(pattern: &ProceduralPattern) -> Payload {
    let mut map: HashMap<String, QdrantValue> = HashMap::new();
    map.insert("id".into(), pattern.id.clone().into());
    map.insert("user_id".into(), pattern.user_id.clone().into());
    map.insert("name".into(), pattern.name.clone().into());
    map.insert("description".into(), pattern.description.clone().into());
    map.insert(
        "triggers".into(),
        serde_json::to_string(&pattern.triggers).unwrap_or_default().into(),
    );
    map.insert("instruction_template".into(), pattern.instruction_template.clone().into());
    map.insert("confidence_threshold".into(), pattern.confidence_threshold.into());
    map.insert("usage_count".into(), (pattern.usage_count as i64).into());
    map.insert("success_count".into(), (pattern.success_count as i64).into());
    map.insert("failure_count".into(), (pattern.failure_count as i64).into());
    map.insert("created_at".into(), pattern.created_at.to_rfc3339().into());
    if let Some(last_used) = pattern.last_used {
        map.insert("last_used".into(), last_used.to_rfc3339().into());
    }
    Payload::from(map)
}

fn payload_to_pattern(payload: &HashMap<String, QdrantValue>) -> ProceduralPattern {
    let triggers: Vec<Trigger> = NetworkedDriver::get_opt_str(payload, "triggers")
        .and_then(|s| serde_json::from_str(&s).ok())
        .unwrap_or_default();
    ProceduralPattern {
        id: NetworkedDriver::get_str(payload, "id"),
        user_id: NetworkedDriver::get_str(payload, "user_id"),
        name: NetworkedDriver::get_str(payload, "name"),
        description: NetworkedDriver::get_str(payload, "description"),
        triggers,
        instruction_template: NetworkedDriver::get_str(payload, "instruction_template"),
        confidence_threshold: NetworkedDriver::get_f64(payload, "confidence_threshold"),
        usage_count: payload.get("usage_count").and_then(|v| v.as_integer()).unwrap_or(0) as u64,
        last_used: NetworkedDriver::get_opt_str(payload, "last_used")
            .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
            .map(|dt| dt.with_timezone(&Utc)),
        success_count: payload.get("success_count").and_then(|v| v.as_integer()).unwrap_or(0) as u64,
        failure_count: payload.get("failure_count").and_then(|v| v.as_integer()).unwrap_or(0) as u64,
        created_at: NetworkedDriver::get_ts(payload, "created_at"),
        embedding: None,
    }
}

#[async_trait]
impl ProceduralRepo for NetworkedDriver {
    async fn upsert(&self, pattern: ProceduralPattern) -> StorageResult<()> {
        let point = PointStruct::new(
            Self::point_id(&pattern.id),
            vec![0.0; PLACEHOLDER_DIM as usize],
            pattern_to_payload(&pattern),
        );
        self.client
            .upsert_points(UpsertPointsBuilder::new(PROCEDURAL_COLLECTION, vec![point]))
            .await
            .map_err(qdrant_err)?;
        Ok(())
    }

    async fn by_user(&self, user: &str) -> StorageResult<Vec<ProceduralPattern>> {
        let filter = Filter::must([Condition::matches("user_id", user.to_string())]);
        Ok(self
            .scroll_all(PROCEDURAL_COLLECTION, filter)
            .await?
            .iter()
            .map(payload_to_pattern)
            .collect())
    }

    async fn get(&self, id: &str) -> StorageResult<Option<ProceduralPattern>> {
        let filter = Filter::must([Condition::matches("id", id.to_string())]);
        Ok(self
            .scroll_all(PROCEDURAL_COLLECTION, filter)
            .await?
            .iter()
            .map(payload_to_pattern)
            .next())
    }

    async fn record_success(&self, id: &str) -> StorageResult<()> {
        let mut pattern = ProceduralRepo::get(self, id)
            .await?
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        pattern.record_success();
        self.upsert(pattern).await
    }

    async fn record_failure(&self, id: &str) -> StorageResult<()> {
        let mut pattern = ProceduralRepo::get(self, id)
            .await?
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        pattern.record_failure();
        self.upsert(pattern).await
    }

    async fn touch(&self, id: &str) -> StorageResult<()> {
        let mut pattern = ProceduralRepo::get(self, id)
            .await?
            .ok_or_else(|| StorageError::NotFound(id.to_string()))?;
        pattern.touch();
        self.upsert(pattern).await
    }

    async fn delete(&self, id: &str) -> StorageResult<()> {
        self.client
            .delete_points(
                DeletePointsBuilder::new(PROCEDURAL_COLLECTION).points(vec![Self::point_id(id)]),
            )
            .await
            .map_err(qdrant_err)?;
        Ok(())
    }

    async fn delete_user(&self, user: &str) -> StorageResult<()> {
        let filter = Filter::must([Condition::matches("user_id", user.to_string())]);
        self.client
            .delete_points(DeletePointsBuilder::new(PROCEDURAL_COLLECTION).points(filter))
            .await
            .map_err(qdrant_err)?;
        Ok(())
    }
}
