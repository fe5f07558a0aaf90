use crate::credentials::{CredentialRecord, CredentialStatus, CredentialUsage};
use crate::models::{CycleHealthRecord, Match, Task};
use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("invalid response: {0}")]
    Deserialize(String),
    #[error("seed data: {0}")]
    Seed(String),
}

/// Persistence the worker reads from and writes to.
#[async_trait]
pub trait WorkerStore: Send + Sync {
    async fn active_tasks(&self) -> Result<Vec<Task>, StoreError>;

    async fn credentials(&self) -> Result<Vec<CredentialRecord>, StoreError>;

    async fn save_credential_usage(&self, usage: &CredentialUsage) -> Result<(), StoreError>;

    /// Inserts the match unless one exists for the same task and item.
    /// Returns whether a new row was written.
    async fn upsert_match(&self, record: &Match) -> Result<bool, StoreError>;

    async fn append_health(&self, record: &CycleHealthRecord) -> Result<(), StoreError>;
}

#[derive(Debug, Default)]
struct MemoryState {
    tasks: Vec<Task>,
    credentials: Vec<CredentialRecord>,
    matches: HashMap<(Uuid, String), Match>,
    health: Vec<CycleHealthRecord>,
}

/// In-process store for offline runs and tests.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl MemoryStore {
    pub fn new(tasks: Vec<Task>, credentials: Vec<CredentialRecord>) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState {
                tasks,
                credentials,
                ..MemoryState::default()
            })),
        }
    }

    /// Seeds credentials from `SCOUT_CREDENTIALS` (`label:app_id:cert_id,...`)
    /// and tasks from the YAML file named by `SCOUT_TASKS_FILE`.
    pub fn seeded_from_env() -> Result<Self, StoreError> {
        let credentials = match std::env::var("SCOUT_CREDENTIALS") {
            Ok(raw) => parse_credentials(&raw)?,
            Err(_) => Vec::new(),
        };
        let tasks = match std::env::var("SCOUT_TASKS_FILE") {
            Ok(path) => load_tasks(Path::new(&path))?,
            Err(_) => Vec::new(),
        };
        Ok(Self::new(tasks, credentials))
    }
}

#[cfg(test)]
impl MemoryStore {
    pub async fn matches(&self) -> Vec<Match> {
        self.state.lock().await.matches.values().cloned().collect()
    }

    pub async fn health(&self) -> Vec<CycleHealthRecord> {
        self.state.lock().await.health.clone()
    }

    pub async fn credential(&self, label: &str) -> Option<CredentialRecord> {
        self.state
            .lock()
            .await
            .credentials
            .iter()
            .find(|c| c.label == label)
            .cloned()
    }
}

#[async_trait]
impl WorkerStore for MemoryStore {
    async fn active_tasks(&self) -> Result<Vec<Task>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.tasks.iter().filter(|t| t.is_active()).cloned().collect())
    }

    async fn credentials(&self) -> Result<Vec<CredentialRecord>, StoreError> {
        Ok(self.state.lock().await.credentials.clone())
    }

    async fn save_credential_usage(&self, usage: &CredentialUsage) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        if let Some(record) = state.credentials.iter_mut().find(|c| c.label == usage.label) {
            record.calls_today = usage.calls_today;
            record.reset_date = Some(usage.reset_date);
            record.status = usage.status;
        }
        Ok(())
    }

    async fn upsert_match(&self, record: &Match) -> Result<bool, StoreError> {
        let mut state = self.state.lock().await;
        let key = record.key();
        if state.matches.contains_key(&key) {
            return Ok(false);
        }
        state.matches.insert(key, record.clone());
        Ok(true)
    }

    async fn append_health(&self, record: &CycleHealthRecord) -> Result<(), StoreError> {
        self.state.lock().await.health.push(record.clone());
        Ok(())
    }
}

fn parse_credentials(raw: &str) -> Result<Vec<CredentialRecord>, StoreError> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let mut parts = entry.splitn(3, ':');
            match (parts.next(), parts.next(), parts.next()) {
                (Some(label), Some(app_id), Some(cert_id))
                    if !label.is_empty() && !app_id.is_empty() && !cert_id.is_empty() =>
                {
                    Ok(CredentialRecord {
                        label: label.to_string(),
                        app_id: app_id.to_string(),
                        cert_id: cert_id.to_string(),
                        calls_today: 0,
                        reset_date: None,
                        status: CredentialStatus::Unknown,
                    })
                }
                _ => Err(StoreError::Seed(format!(
                    "credential entry must be label:app_id:cert_id (got `{}`)",
                    entry.split(':').next().unwrap_or_default()
                ))),
            }
        })
        .collect()
}

#[derive(Deserialize)]
#[serde(untagged)]
enum TaskFile {
    List(Vec<Task>),
    Wrapped { tasks: Vec<Task> },
}

fn parse_tasks(raw: &str) -> Result<Vec<Task>, StoreError> {
    let file: TaskFile =
        serde_yaml::from_str(raw).map_err(|err| StoreError::Seed(err.to_string()))?;
    Ok(match file {
        TaskFile::List(tasks) | TaskFile::Wrapped { tasks } => tasks,
    })
}

fn load_tasks(path: &Path) -> Result<Vec<Task>, StoreError> {
    let raw = std::fs::read_to_string(path)
        .map_err(|err| StoreError::Seed(format!("{}: {err}", path.display())))?;
    parse_tasks(&raw)
}
