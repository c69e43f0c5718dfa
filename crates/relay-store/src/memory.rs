use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use relay_core::embed::Embedder;
use relay_core::ids::{SessionKey, TenantId};

use crate::database::Database;
use crate::error::StoreError;

/// Which memory tier an operation addresses.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MemoryScope {
    /// Short-TTL, process-local: recently observed tool outputs and prompts.
    Cache,
    /// Session-scoped working set: distilled facts, lives with the session.
    Runtime(SessionKey),
    /// Cross-session long-term store, content-addressed by embedding.
    Vector(TenantId),
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MemoryItem {
    pub key: String,
    pub content: String,
    pub pinned: bool,
    pub created_at: String,
}

impl MemoryItem {
    fn new(key: impl Into<String>, content: impl Into<String>, pinned: bool) -> Self {
        Self {
            key: key.into(),
            content: content.into(),
            pinned,
            created_at: Utc::now().to_rfc3339(),
        }
    }

    fn age(&self, now: DateTime<Utc>) -> Duration {
        DateTime::parse_from_rfc3339(&self.created_at)
            .map(|t| (now - t.with_timezone(&Utc)).to_std().unwrap_or(Duration::ZERO))
            .unwrap_or(Duration::ZERO)
    }
}

#[derive(Clone, Debug)]
pub struct ScoredItem {
    pub item: MemoryItem,
    pub score: f64,
}

/// Relevance ranking combines similarity, recency decay, and explicit pins.
/// The precedence between them is deliberately configuration, not code.
#[derive(Clone, Debug)]
pub struct MemoryConfig {
    pub cache_ttl: Duration,
    pub similarity_weight: f64,
    pub recency_weight: f64,
    pub pin_weight: f64,
    pub recency_half_life: Duration,
    pub score_floor: f64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(60),
            similarity_weight: 0.6,
            recency_weight: 0.25,
            pin_weight: 0.15,
            recency_half_life: Duration::from_secs(600),
            score_floor: 0.05,
        }
    }
}

/// Three-tier memory behind one interface. The cache and runtime tiers are
/// in-process; the vector tier persists embeddings in SQLite and ranks by
/// brute-force cosine similarity.
pub struct MemoryStore {
    cache: Mutex<HashMap<String, MemoryItem>>,
    runtime: DashMap<String, HashMap<String, MemoryItem>>,
    db: Database,
    embedder: Arc<dyn Embedder>,
    config: MemoryConfig,
}

impl MemoryStore {
    pub fn new(db: Database, embedder: Arc<dyn Embedder>, config: MemoryConfig) -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
            runtime: DashMap::new(),
            db,
            embedder,
            config,
        }
    }

    pub fn config(&self) -> &MemoryConfig {
        &self.config
    }

    /// Store an item. For the vector tier the content is embedded unless an
    /// explicit embedding is supplied.
    pub async fn put(
        &self,
        scope: &MemoryScope,
        key: &str,
        content: &str,
        pinned: bool,
        embedding: Option<Vec<f32>>,
    ) -> Result<(), StoreError> {
        let item = MemoryItem::new(key, content, pinned);
        match scope {
            MemoryScope::Cache => {
                self.cache.lock().insert(key.to_string(), item);
                Ok(())
            }
            MemoryScope::Runtime(session) => {
                self.runtime
                    .entry(session.to_string())
                    .or_default()
                    .insert(key.to_string(), item);
                Ok(())
            }
            MemoryScope::Vector(tenant) => {
                let embedding = match embedding {
                    Some(e) => e,
                    None => self
                        .embedder
                        .embed(content)
                        .await
                        .map_err(|e| StoreError::Database(format!("embed: {e}")))?,
                };
                self.put_vector(tenant, &item, &embedding)
            }
        }
    }

    pub fn get(&self, scope: &MemoryScope, key: &str) -> Result<Option<MemoryItem>, StoreError> {
        match scope {
            MemoryScope::Cache => {
                let mut cache = self.cache.lock();
                let now = Utc::now();
                let expired = cache
                    .get(key)
                    .map(|item| item.age(now) >= self.config.cache_ttl)
                    .unwrap_or(false);
                if expired {
                    cache.remove(key);
                }
                Ok(cache.get(key).cloned())
            }
            MemoryScope::Runtime(session) => Ok(self
                .runtime
                .get(&session.to_string())
                .and_then(|m| m.get(key).cloned())),
            MemoryScope::Vector(tenant) => self.db.with_conn(|conn| {
                let row = conn
                    .query_row(
                        "SELECT key, content, pinned, created_at FROM memory_items
                         WHERE tenant_id = ?1 AND key = ?2",
                        [tenant.as_str(), key],
                        |row| {
                            Ok(MemoryItem {
                                key: row.get(0)?,
                                content: row.get(1)?,
                                pinned: row.get::<_, i64>(2)? != 0,
                                created_at: row.get(3)?,
                            })
                        },
                    )
                    .ok();
                Ok(row)
            }),
        }
    }

    /// Top-k relevance search within one tier. Results below the score
    /// floor are dropped; ties break on key for determinism.
    pub async fn search(
        &self,
        scope: &MemoryScope,
        query: &str,
        k: usize,
    ) -> Result<Vec<ScoredItem>, StoreError> {
        let now = Utc::now();
        let mut scored = match scope {
            MemoryScope::Cache => {
                let mut cache = self.cache.lock();
                cache.retain(|_, item| item.age(now) < self.config.cache_ttl);
                cache
                    .values()
                    .map(|item| self.scored(item, keyword_score(query, &item.content), now))
                    .collect::<Vec<_>>()
            }
            MemoryScope::Runtime(session) => self
                .runtime
                .get(&session.to_string())
                .map(|m| {
                    m.values()
                        .map(|item| self.scored(item, keyword_score(query, &item.content), now))
                        .collect::<Vec<_>>()
                })
                .unwrap_or_default(),
            MemoryScope::Vector(tenant) => {
                let query_embedding = self
                    .embedder
                    .embed(query)
                    .await
                    .map_err(|e| StoreError::Database(format!("embed: {e}")))?;
                self.search_vector(tenant, &query_embedding, now)?
            }
        };

        scored.retain(|s| s.score >= self.config.score_floor);
        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.item.key.cmp(&b.item.key))
        });
        scored.truncate(k);
        Ok(scored)
    }

    /// Drop a session's runtime working set (session close or TTL expiry).
    pub fn clear_session(&self, session: &SessionKey) {
        self.runtime.remove(&session.to_string());
    }

    fn scored(&self, item: &MemoryItem, similarity: f64, now: DateTime<Utc>) -> ScoredItem {
        let age = item.age(now).as_secs_f64();
        let half_life = self.config.recency_half_life.as_secs_f64().max(1.0);
        let recency = (-age / half_life).exp();
        let pin = if item.pinned { 1.0 } else { 0.0 };
        let score = similarity * self.config.similarity_weight
            + recency * self.config.recency_weight
            + pin * self.config.pin_weight;
        ScoredItem {
            item: item.clone(),
            score,
        }
    }

    fn put_vector(
        &self,
        tenant: &TenantId,
        item: &MemoryItem,
        embedding: &[f32],
    ) -> Result<(), StoreError> {
        if embedding.len() != self.embedder.dims() {
            return Err(StoreError::Database(format!(
                "embedding dimension mismatch: expected {}, got {}",
                self.embedder.dims(),
                embedding.len()
            )));
        }
        let blob = f32_slice_to_blob(embedding);
        self.db.with_conn(|conn| {
            // Delete-then-insert upsert, keyed (tenant, key).
            conn.execute(
                "DELETE FROM memory_items WHERE tenant_id = ?1 AND key = ?2",
                [tenant.as_str(), item.key.as_str()],
            )?;
            conn.execute(
                "INSERT INTO memory_items (id, tenant_id, key, content, pinned, embedding, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    uuid::Uuid::now_v7().to_string(),
                    tenant.as_str(),
                    item.key,
                    item.content,
                    item.pinned as i64,
                    blob,
                    item.created_at,
                ],
            )?;
            Ok(())
        })
    }

    fn search_vector(
        &self,
        tenant: &TenantId,
        query: &[f32],
        now: DateTime<Utc>,
    ) -> Result<Vec<ScoredItem>, StoreError> {
        let rows: Vec<(MemoryItem, Vec<u8>)> = self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT key, content, pinned, created_at, embedding FROM memory_items
                 WHERE tenant_id = ?1 AND embedding IS NOT NULL",
            )?;
            let rows = stmt
                .query_map([tenant.as_str()], |row| {
                    Ok((
                        MemoryItem {
                            key: row.get(0)?,
                            content: row.get(1)?,
                            pinned: row.get::<_, i64>(2)? != 0,
                            created_at: row.get(3)?,
                        },
                        row.get::<_, Vec<u8>>(4)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(rows)
        })?;

        Ok(rows
            .into_iter()
            .map(|(item, blob)| {
                let embedding = blob_to_f32_vec(&blob);
                let similarity = cosine_similarity(query, &embedding) as f64;
                self.scored(&item, similarity.max(0.0), now)
            })
            .collect())
    }
}

/// Word-overlap relevance with a substring boost, capped at 1.0.
pub fn keyword_score(query: &str, content: &str) -> f64 {
    let query_lower = query.to_lowercase();
    let content_lower = content.to_lowercase();

    let query_words: Vec<&str> = query_lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .collect();
    if query_words.is_empty() {
        return 0.0;
    }

    let overlap = query_words
        .iter()
        .filter(|w| content_lower.contains(*w))
        .count();
    let mut score = overlap as f64 / query_words.len() as f64;
    if content_lower.contains(&query_lower) {
        score += 0.3;
    }
    score.min(1.0)
}

pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    if norm_a == 0.0 || norm_b == 0.0 {
        return 0.0;
    }
    dot / (norm_a.sqrt() * norm_b.sqrt())
}

pub fn f32_slice_to_blob(v: &[f32]) -> Vec<u8> {
    v.iter().flat_map(|f| f.to_le_bytes()).collect()
}

pub fn blob_to_f32_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}
