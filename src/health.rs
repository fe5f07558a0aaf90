use crate::models::CycleHealthRecord;
use crate::store::WorkerStore;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{info, warn};
use uuid::Uuid;

/// Counters accumulated over one cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleStats {
    pub tasks_processed: u32,
    pub tasks_failed: u32,
    pub tasks_deferred: u32,
    pub items_found: u32,
    pub items_matched: u32,
    pub items_excluded: u32,
    pub items_malformed: u32,
    pub detail_calls: u32,
    pub cache_hits: u32,
}

impl CycleStats {
    pub fn merge(&mut self, other: &CycleStats) {
        self.tasks_processed += other.tasks_processed;
        self.tasks_failed += other.tasks_failed;
        self.tasks_deferred += other.tasks_deferred;
        self.items_found += other.items_found;
        self.items_matched += other.items_matched;
        self.items_excluded += other.items_excluded;
        self.items_malformed += other.items_malformed;
        self.detail_calls += other.detail_calls;
        self.cache_hits += other.cache_hits;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Starting,
    Healthy,
    Degraded,
    Stale,
}

/// Worker liveness judged from the latest cycle record.
pub fn assess(
    last: Option<&CycleHealthRecord>,
    now: DateTime<Utc>,
    poll_interval: Duration,
) -> HealthStatus {
    let Some(record) = last else {
        return HealthStatus::Starting;
    };
    let stale_after = chrono::Duration::from_std(poll_interval * 3)
        .unwrap_or_else(|_| chrono::Duration::MAX);
    if now - record.finished_at > stale_after {
        return HealthStatus::Stale;
    }
    if record.tasks_processed > 0 && record.tasks_failed * 2 > record.tasks_processed {
        return HealthStatus::Degraded;
    }
    HealthStatus::Healthy
}

/// Resident set size from `/proc/self/status`; `None` off Linux.
pub fn resident_memory_bytes() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    parse_vm_rss(&status)
}

// VmRSS is reported in kB whatever the page size.
fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|line| line.starts_with("VmRSS:"))?;
    let kb: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kb * 1024)
}

#[derive(Clone)]
pub struct HealthRecorder {
    store: Arc<dyn WorkerStore>,
    last: Arc<RwLock<Option<CycleHealthRecord>>>,
}

impl HealthRecorder {
    pub fn new(store: Arc<dyn WorkerStore>) -> Self {
        Self {
            store,
            last: Arc::new(RwLock::new(None)),
        }
    }

    /// Builds and appends the cycle row. A failed append is logged, never raised.
    pub async fn record(
        &self,
        cycle_id: Uuid,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        stats: &CycleStats,
        credential_usage: BTreeMap<String, u32>,
    ) -> CycleHealthRecord {
        let credential_used = credential_usage
            .iter()
            .max_by_key(|(_, calls)| **calls)
            .map(|(label, _)| label.clone());
        let record = CycleHealthRecord {
            cycle_id,
            started_at,
            finished_at,
            duration_ms: (finished_at - started_at).num_milliseconds().max(0) as u64,
            tasks_processed: stats.tasks_processed,
            tasks_failed: stats.tasks_failed,
            tasks_deferred: stats.tasks_deferred,
            items_found: stats.items_found,
            items_matched: stats.items_matched,
            items_excluded: stats.items_excluded,
            items_malformed: stats.items_malformed,
            detail_calls: stats.detail_calls,
            cache_hits: stats.cache_hits,
            credential_used,
            credential_usage,
            memory_rss_bytes: resident_memory_bytes(),
        };

        if let Err(err) = self.store.append_health(&record).await {
            warn!(target = "hermes.health", cycle_id = %cycle_id, error = %err, "health_append_failed");
        }
        info!(
            target = "hermes.health",
            cycle_id = %cycle_id,
            duration_ms = record.duration_ms,
            tasks_processed = record.tasks_processed,
            tasks_failed = record.tasks_failed,
            items_found = record.items_found,
            items_matched = record.items_matched,
            "cycle_recorded"
        );
        *self.last.write().await = Some(record.clone());
        record
    }

    pub async fn last(&self) -> Option<CycleHealthRecord> {
        self.last.read().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn record_at(finished_at: DateTime<Utc>, processed: u32, failed: u32) -> CycleHealthRecord {
        CycleHealthRecord {
            cycle_id: Uuid::new_v4(),
            started_at: finished_at,
            finished_at,
            duration_ms: 0,
            tasks_processed: processed,
            tasks_failed: failed,
            tasks_deferred: 0,
            items_found: 0,
            items_matched: 0,
            items_excluded: 0,
            items_malformed: 0,
            detail_calls: 0,
            cache_hits: 0,
            credential_used: None,
            credential_usage: BTreeMap::new(),
            memory_rss_bytes: None,
        }
    }

    #[test]
    fn assessment_covers_each_state() {
        let now = Utc::now();
        let interval = Duration::from_secs(10);
        assert_eq!(assess(None, now, interval), HealthStatus::Starting);
        assert_eq!(
            assess(Some(&record_at(now, 4, 1)), now, interval),
            HealthStatus::Healthy
        );
        assert_eq!(
            assess(Some(&record_at(now, 4, 3)), now, interval),
            HealthStatus::Degraded
        );
        assert_eq!(
            assess(
                Some(&record_at(now - chrono::Duration::seconds(31), 4, 0)),
                now,
                interval
            ),
            HealthStatus::Stale
        );
    }

    #[tokio::test]
    async fn record_appends_one_row_and_names_busiest_credential() {
        let store = MemoryStore::default();
        let recorder = HealthRecorder::new(Arc::new(store.clone()));
        let started = Utc::now();
        let stats = CycleStats {
            tasks_processed: 2,
            items_found: 30,
            items_matched: 1,
            ..CycleStats::default()
        };
        let usage = BTreeMap::from([("a".to_string(), 3), ("b".to_string(), 9)]);
        let record = recorder
            .record(
                Uuid::new_v4(),
                started,
                started + chrono::Duration::milliseconds(850),
                &stats,
                usage,
            )
            .await;
        assert_eq!(record.duration_ms, 850);
        assert_eq!(record.credential_used.as_deref(), Some("b"));
        assert_eq!(store.health().await.len(), 1);
        assert_eq!(recorder.last().await, Some(record));
    }

    #[test]
    fn rss_is_read_from_vm_rss_in_kilobytes() {
        let status = "Name:\thermes-scout-rs\nVmPeak:\t  90000 kB\nVmRSS:\t   20480 kB\nThreads:\t8\n";
        assert_eq!(parse_vm_rss(status), Some(20_971_520));
        assert_eq!(parse_vm_rss("Name:\tx\n"), None);
    }

    #[test]
    fn stats_merge_sums_counters() {
        let mut total = CycleStats::default();
        let one = CycleStats {
            tasks_processed: 1,
            items_found: 5,
            detail_calls: 2,
            ..CycleStats::default()
        };
        total.merge(&one);
        total.merge(&one);
        assert_eq!(total.items_found, 10);
        assert_eq!(total.detail_calls, 4);
    }
}
