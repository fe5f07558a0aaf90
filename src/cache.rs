use crate::config::CacheConfig;
use crate::filter::FilterStage;
use crate::models::ItemDetail;
use chrono::{DateTime, Utc};
use redis::AsyncCommands;
use redis::aio::MultiplexedConnection;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("redis connection failed: {0}")]
    Connect(String),
    #[error("redis command failed: {0}")]
    Command(String),
    #[error("cache entry codec: {0}")]
    Codec(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CacheOutcome {
    Accepted {
        task_id: Uuid,
    },
    Rejected {
        reason: String,
        stage: FilterStage,
        universal: bool,
        /// Task whose rules produced a task-specific rejection.
        task_id: Option<Uuid>,
    },
    DetailCached,
    /// Detail payload could not be decoded; no task should pay for it again.
    Malformed {
        reason: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub item_id: String,
    pub outcome: CacheOutcome,
    pub detail: Option<ItemDetail>,
    pub recorded_at: DateTime<Utc>,
}

/// What a task should do with an item it finds in the cache.
#[derive(Debug, Clone, PartialEq)]
pub enum CachedVerdict {
    Skip,
    Reevaluate(ItemDetail),
    Fetch,
}

impl CacheEntry {
    pub fn verdict_for(&self, task_id: Uuid) -> CachedVerdict {
        match &self.outcome {
            CacheOutcome::Rejected { universal: true, .. } | CacheOutcome::Malformed { .. } => {
                CachedVerdict::Skip
            }
            CacheOutcome::Rejected {
                task_id: Some(owner),
                ..
            } if *owner == task_id => CachedVerdict::Skip,
            CacheOutcome::Accepted { task_id: owner } if *owner == task_id => CachedVerdict::Skip,
            _ => match &self.detail {
                Some(detail) => CachedVerdict::Reevaluate(detail.clone()),
                None => CachedVerdict::Fetch,
            },
        }
    }
}

#[derive(Clone)]
enum Backend {
    Memory(Arc<RwLock<HashMap<String, CacheEntry>>>),
    Redis(MultiplexedConnection),
}

/// Item-level evaluation cache shared by every task. Last writer wins.
#[derive(Clone)]
pub struct ItemCache {
    backend: Backend,
    ttl: Duration,
    prefix: String,
}

impl ItemCache {
    pub fn memory(config: &CacheConfig) -> Self {
        Self {
            backend: Backend::Memory(Arc::new(RwLock::new(HashMap::new()))),
            ttl: config.ttl(),
            prefix: config.key_prefix.clone(),
        }
    }

    pub async fn redis(config: &CacheConfig, url: &str) -> Result<Self, CacheError> {
        let client = redis::Client::open(url).map_err(|err| CacheError::Connect(err.to_string()))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|err| CacheError::Connect(err.to_string()))?;
        Ok(Self {
            backend: Backend::Redis(conn),
            ttl: config.ttl(),
            prefix: config.key_prefix.clone(),
        })
    }

    /// Redis when a URL is configured and reachable, otherwise in-process.
    pub async fn from_config(config: &CacheConfig) -> Self {
        if let Some(url) = config.redis_url.as_deref() {
            match Self::redis(config, url).await {
                Ok(cache) => return cache,
                Err(err) => {
                    warn!(target = "hermes.cache", error = %err, "redis_unavailable_using_memory");
                }
            }
        }
        Self::memory(config)
    }

    pub fn backend_name(&self) -> &'static str {
        match self.backend {
            Backend::Memory(_) => "memory",
            Backend::Redis(_) => "redis",
        }
    }

    fn key(&self, item_id: &str) -> String {
        format!("{}{}", self.prefix, item_id)
    }

    fn is_expired(&self, entry: &CacheEntry, now: DateTime<Utc>) -> bool {
        match chrono::Duration::from_std(self.ttl) {
            Ok(ttl) => now - entry.recorded_at >= ttl,
            Err(_) => false,
        }
    }

    pub async fn lookup(&self, item_id: &str) -> Option<CacheEntry> {
        let entry = match &self.backend {
            Backend::Memory(map) => map.read().await.get(item_id).cloned(),
            Backend::Redis(conn) => match redis_get(conn.clone(), &self.key(item_id)).await {
                Ok(entry) => entry,
                Err(err) => {
                    warn!(target = "hermes.cache", item_id, error = %err, "cache_lookup_degraded");
                    None
                }
            },
        };
        entry.filter(|e| !self.is_expired(e, Utc::now()))
    }

    pub async fn record(&self, item_id: &str, outcome: CacheOutcome, detail: Option<ItemDetail>) {
        self.store(CacheEntry {
            item_id: item_id.to_string(),
            outcome,
            detail,
            recorded_at: Utc::now(),
        })
        .await;
    }

    async fn store(&self, entry: CacheEntry) {
        match &self.backend {
            Backend::Memory(map) => {
                map.write().await.insert(entry.item_id.clone(), entry);
            }
            Backend::Redis(conn) => {
                let key = self.key(&entry.item_id);
                if let Err(err) = redis_set(conn.clone(), &key, &entry, self.ttl).await {
                    warn!(
                        target = "hermes.cache",
                        item_id = %entry.item_id,
                        error = %err,
                        "cache_write_degraded"
                    );
                }
            }
        }
    }

    /// Drops aged-out in-process entries. Redis expires keys itself.
    pub async fn evict_expired(&self) -> usize {
        let Backend::Memory(map) = &self.backend else {
            return 0;
        };
        let now = Utc::now();
        let mut guard = map.write().await;
        let before = guard.len();
        guard.retain(|_, entry| !self.is_expired(entry, now));
        let evicted = before - guard.len();
        if evicted > 0 {
            debug!(target = "hermes.cache", evicted, "cache_entries_evicted");
        }
        evicted
    }
}

async fn redis_get(
    mut conn: MultiplexedConnection,
    key: &str,
) -> Result<Option<CacheEntry>, CacheError> {
    let raw: Option<String> = conn
        .get(key)
        .await
        .map_err(|err| CacheError::Command(err.to_string()))?;
    raw.map(|value| serde_json::from_str(&value).map_err(|err| CacheError::Codec(err.to_string())))
        .transpose()
}

async fn redis_set(
    mut conn: MultiplexedConnection,
    key: &str,
    entry: &CacheEntry,
    ttl: Duration,
) -> Result<(), CacheError> {
    let json = serde_json::to_string(entry).map_err(|err| CacheError::Codec(err.to_string()))?;
    conn.set_ex::<_, _, ()>(key, json, ttl.as_secs().max(1))
        .await
        .map_err(|err| CacheError::Command(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detail(id: &str) -> ItemDetail {
        ItemDetail {
            item_id: id.into(),
            title: "18k Gold Band 4.2g".into(),
            price: 150.0,
            currency: "USD".into(),
            condition: Some("Pre-owned".into()),
            specs: [("metal purity".to_string(), "18k".to_string())].into(),
            seller: None,
            item_url: None,
            image_url: None,
            listed_at: None,
        }
    }

    fn cache() -> ItemCache {
        ItemCache::memory(&CacheConfig::default())
    }

    #[tokio::test]
    async fn universal_rejection_is_skipped_by_every_task() {
        let cache = cache();
        cache
            .record(
                "1",
                CacheOutcome::Rejected {
                    reason: "blacklisted term \"cz\" in title".into(),
                    stage: FilterStage::Simulant,
                    universal: true,
                    task_id: None,
                },
                None,
            )
            .await;
        let entry = cache.lookup("1").await.expect("entry");
        assert_eq!(entry.verdict_for(Uuid::new_v4()), CachedVerdict::Skip);
    }

    #[tokio::test]
    async fn other_tasks_reevaluate_cached_detail() {
        let cache = cache();
        let owner = Uuid::new_v4();
        cache
            .record(
                "2",
                CacheOutcome::Rejected {
                    reason: "price 150.00 above maximum 100.00".into(),
                    stage: FilterStage::Price,
                    universal: false,
                    task_id: Some(owner),
                },
                Some(detail("2")),
            )
            .await;
        let entry = cache.lookup("2").await.expect("entry");
        assert_eq!(entry.verdict_for(owner), CachedVerdict::Skip);
        assert_eq!(
            entry.verdict_for(Uuid::new_v4()),
            CachedVerdict::Reevaluate(detail("2"))
        );
    }

    #[tokio::test]
    async fn accepted_item_is_not_refetched_by_same_task() {
        let cache = cache();
        let task = Uuid::new_v4();
        cache
            .record("3", CacheOutcome::Accepted { task_id: task }, Some(detail("3")))
            .await;
        let entry = cache.lookup("3").await.expect("entry");
        assert_eq!(entry.verdict_for(task), CachedVerdict::Skip);
        assert!(matches!(
            entry.verdict_for(Uuid::new_v4()),
            CachedVerdict::Reevaluate(_)
        ));
    }

    #[tokio::test]
    async fn expired_entries_are_misses_and_evicted() {
        let config = CacheConfig {
            ttl_secs: 60,
            ..CacheConfig::default()
        };
        let cache = ItemCache::memory(&config);
        cache
            .store(CacheEntry {
                item_id: "old".into(),
                outcome: CacheOutcome::DetailCached,
                detail: Some(detail("old")),
                recorded_at: Utc::now() - chrono::Duration::seconds(120),
            })
            .await;
        cache.record("fresh", CacheOutcome::DetailCached, None).await;
        assert!(cache.lookup("old").await.is_none());
        assert_eq!(cache.evict_expired().await, 1);
        assert!(cache.lookup("fresh").await.is_some());
    }

    #[tokio::test]
    async fn last_writer_wins() {
        let cache = cache();
        let task = Uuid::new_v4();
        cache.record("4", CacheOutcome::DetailCached, Some(detail("4"))).await;
        cache
            .record("4", CacheOutcome::Accepted { task_id: task }, Some(detail("4")))
            .await;
        let entry = cache.lookup("4").await.expect("entry");
        assert_eq!(entry.outcome, CacheOutcome::Accepted { task_id: task });
    }

    #[test]
    fn entries_round_trip_through_json() {
        let entry = CacheEntry {
            item_id: "5".into(),
            outcome: CacheOutcome::Rejected {
                reason: "blacklisted term \"moissanite\" in title".into(),
                stage: FilterStage::Simulant,
                universal: true,
                task_id: None,
            },
            detail: None,
            recorded_at: Utc::now(),
        };
        let json = serde_json::to_string(&entry).unwrap();
        assert!(json.contains("\"kind\":\"rejected\""));
        let back: CacheEntry = serde_json::from_str(&json).unwrap();
        assert_eq!(back, entry);
    }
}
