use crate::filter::Economics;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use uuid::Uuid;

/// Structured item specifics keyed by lower-cased aspect name.
pub type ItemSpecs = BTreeMap<String, String>;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ItemType {
    #[default]
    Jewelry,
    Gemstone,
    Watch,
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Active,
    Paused,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct TaskFilters {
    pub min_price: Option<f64>,
    pub max_price: Option<f64>,
    pub category_ids: Vec<String>,
    pub allow_lab_created: bool,
    pub exclude_keywords: Vec<String>,
    pub min_margin: Option<f64>,
}

/// A saved search. Written by the settings UI, read-only here.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    #[serde(default)]
    pub user_id: Option<Uuid>,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub keywords: String,
    #[serde(default)]
    pub item_type: ItemType,
    #[serde(default)]
    pub filters: TaskFilters,
    #[serde(default)]
    pub status: TaskStatus,
}

impl Task {
    pub fn is_active(&self) -> bool {
        self.status == TaskStatus::Active
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SellerInfo {
    pub username: String,
    #[serde(default)]
    pub feedback_score: Option<i64>,
    #[serde(default)]
    pub feedback_percentage: Option<f64>,
}

/// Search-result summary; not yet detail-fetched or filtered.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ItemSummary {
    pub item_id: String,
    pub title: String,
    pub price: f64,
    pub currency: String,
    #[serde(default)]
    pub item_url: Option<String>,
    #[serde(default)]
    pub listed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ItemDetail {
    pub item_id: String,
    pub title: String,
    pub price: f64,
    pub currency: String,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub specs: ItemSpecs,
    #[serde(default)]
    pub seller: Option<SellerInfo>,
    #[serde(default)]
    pub item_url: Option<String>,
    #[serde(default)]
    pub image_url: Option<String>,
    #[serde(default)]
    pub listed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MatchStatus {
    #[default]
    New,
    Reviewed,
    Offered,
    Purchased,
    Passed,
}

/// Accepted listing tied to a task. Unique per `(task_id, item_id)`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Match {
    pub id: Uuid,
    pub task_id: Uuid,
    pub item_id: String,
    pub title: String,
    pub price: f64,
    pub currency: String,
    pub seller_username: Option<String>,
    pub seller_feedback_score: Option<i64>,
    pub item_url: Option<String>,
    pub image_url: Option<String>,
    pub melt_value: Option<f64>,
    pub margin: Option<f64>,
    pub listed_at: Option<DateTime<Utc>>,
    pub found_at: DateTime<Utc>,
    pub status: MatchStatus,
}

impl Match {
    pub fn new(
        task: &Task,
        detail: &ItemDetail,
        economics: Option<Economics>,
        found_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            task_id: task.id,
            item_id: detail.item_id.clone(),
            title: detail.title.clone(),
            price: detail.price,
            currency: detail.currency.clone(),
            seller_username: detail.seller.as_ref().map(|s| s.username.clone()),
            seller_feedback_score: detail.seller.as_ref().and_then(|s| s.feedback_score),
            item_url: detail.item_url.clone(),
            image_url: detail.image_url.clone(),
            melt_value: economics.map(|e| e.melt_value),
            margin: economics.map(|e| e.margin),
            listed_at: detail.listed_at,
            found_at,
            status: MatchStatus::New,
        }
    }

    pub fn key(&self) -> (Uuid, String) {
        (self.task_id, self.item_id.clone())
    }
}

/// One row per completed poll cycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CycleHealthRecord {
    pub cycle_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub tasks_processed: u32,
    pub tasks_failed: u32,
    pub tasks_deferred: u32,
    pub items_found: u32,
    pub items_matched: u32,
    pub items_excluded: u32,
    pub items_malformed: u32,
    pub detail_calls: u32,
    pub cache_hits: u32,
    pub credential_used: Option<String>,
    pub credential_usage: BTreeMap<String, u32>,
    pub memory_rss_bytes: Option<u64>,
}

/// Deduplicates summaries by item id, keeping the first occurrence.
pub fn unique_summaries(items: Vec<ItemSummary>) -> Vec<ItemSummary> {
    let mut seen = HashSet::new();
    items
        .into_iter()
        .filter(|item| seen.insert(item.item_id.clone()))
        .collect()
}
