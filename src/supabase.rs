use crate::credentials::{CredentialRecord, CredentialUsage};
use crate::models::{CycleHealthRecord, Match, Task};
use crate::store::{StoreError, WorkerStore};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde_json::json;
use tracing::debug;

const TASKS_TABLE: &str = "scout_tasks";
const CREDENTIALS_TABLE: &str = "scout_credentials";
const MATCHES_TABLE: &str = "scout_matches";
const HEALTH_TABLE: &str = "scout_health";

#[derive(Debug, Clone)]
pub struct SupabaseClient {
    base_url: String,
    service_key: String,
    http: Client,
}

impl SupabaseClient {
    pub fn new(base_url: &str, service_key: impl Into<String>, http: Client) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            service_key: service_key.into(),
            http,
        }
    }

    pub fn from_env(http: Client) -> Option<Self> {
        let base_url = std::env::var("SUPABASE_URL").ok()?;
        let service_key = std::env::var("SUPABASE_SERVICE_ROLE_KEY")
            .or_else(|_| std::env::var("SUPABASE_SERVICE_KEY"))
            .or_else(|_| std::env::var("SUPABASE_KEY"))
            .ok()?;
        Some(Self::new(&base_url, service_key, http))
    }

    fn table_url(&self, table: &str) -> String {
        format!("{}/rest/v1/{}", self.base_url, table)
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("apikey", &self.service_key)
            .header("Authorization", format!("Bearer {}", self.service_key))
    }

    async fn send(&self, builder: RequestBuilder) -> Result<Response, StoreError> {
        let response = self
            .authorized(builder)
            .send()
            .await
            .map_err(|err| StoreError::Request(err.to_string()))?;
        if !response.status().is_success() {
            let status = response.status();
            let detail: String = response
                .text()
                .await
                .unwrap_or_default()
                .chars()
                .take(200)
                .collect();
            return Err(StoreError::Request(format!("HTTP {status}: {detail}")));
        }
        Ok(response)
    }

    async fn fetch<T: DeserializeOwned>(&self, builder: RequestBuilder) -> Result<T, StoreError> {
        self.send(builder)
            .await?
            .json()
            .await
            .map_err(|err| StoreError::Deserialize(err.to_string()))
    }
}

#[async_trait]
impl WorkerStore for SupabaseClient {
    async fn active_tasks(&self) -> Result<Vec<Task>, StoreError> {
        let request = self
            .http
            .get(self.table_url(TASKS_TABLE))
            .query(&[("status", "eq.active"), ("select", "*")]);
        self.fetch(request).await
    }

    async fn credentials(&self) -> Result<Vec<CredentialRecord>, StoreError> {
        let request = self.http.get(self.table_url(CREDENTIALS_TABLE)).query(&[
            (
                "select",
                "label,app_id,cert_id,calls_today,reset_date,status",
            ),
            ("order", "label.asc"),
        ]);
        self.fetch(request).await
    }

    async fn save_credential_usage(&self, usage: &CredentialUsage) -> Result<(), StoreError> {
        let label = format!("eq.{}", usage.label);
        let request = self
            .http
            .patch(self.table_url(CREDENTIALS_TABLE))
            .query(&[("label", label.as_str())])
            .header("Prefer", "return=minimal")
            .json(&json!({
                "calls_today": usage.calls_today,
                "reset_date": usage.reset_date,
                "status": usage.status,
                "last_used_at": usage.last_used_at,
            }));
        self.send(request).await?;
        Ok(())
    }

    async fn upsert_match(&self, record: &Match) -> Result<bool, StoreError> {
        // ignore-duplicates keeps reviewer-set lifecycle status intact
        let request = self
            .http
            .post(self.table_url(MATCHES_TABLE))
            .query(&[("on_conflict", "task_id,item_id")])
            .header(
                "Prefer",
                "resolution=ignore-duplicates,return=representation",
            )
            .json(&[record]);
        let rows: Vec<serde_json::Value> = self.fetch(request).await?;
        let inserted = !rows.is_empty();
        debug!(
            target = "hermes.supabase",
            task_id = %record.task_id,
            item_id = %record.item_id,
            inserted,
            "match_upserted"
        );
        Ok(inserted)
    }

    async fn append_health(&self, record: &CycleHealthRecord) -> Result<(), StoreError> {
        let request = self
            .http
            .post(self.table_url(HEALTH_TABLE))
            .header("Prefer", "return=minimal")
            .json(record);
        self.send(request).await?;
        Ok(())
    }
}
