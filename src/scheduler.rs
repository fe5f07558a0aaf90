//! Poll cycle scheduler.
//!
//! One cycle: sync credentials, read active tasks, then per task search the
//! newest listings, consult the item cache, fetch detail only on a miss, run
//! the filter, persist matches and write every outcome back to the cache.
//! Cycles never overlap; tasks within a cycle run with bounded parallelism.

use crate::cache::{CacheOutcome, CachedVerdict, ItemCache};
use crate::config::{SchedulerConfig, WorkerConfig};
use crate::credentials::{CredentialPool, FailureKind, PoolError};
use crate::ebay::{Marketplace, MarketplaceError, SearchQuery};
use crate::filter::{FilterDecision, FilterPipeline};
use crate::health::{CycleStats, HealthRecorder};
use crate::metrics;
use crate::models::{CycleHealthRecord, ItemDetail, ItemSummary, Match, Task, unique_summaries};
use crate::notify::Notifier;
use crate::store::{StoreError, WorkerStore};
use chrono::Utc;
use futures::{StreamExt, stream};
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("no credential with remaining quota")]
    Exhausted,
    #[error("transient failure after {attempts} attempts: {message}")]
    Transient { attempts: u32, message: String },
    #[error("malformed payload: {0}")]
    Malformed(String),
    #[error("persistence failed: {0}")]
    Persistence(#[from] StoreError),
}

impl From<PoolError> for TaskError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::Exhausted => TaskError::Exhausted,
        }
    }
}

#[derive(Debug, Error)]
pub enum CycleError {
    #[error("task list unavailable: {0}")]
    Tasks(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Endpoint {
    Search,
    Detail,
}

impl Endpoint {
    fn as_str(&self) -> &'static str {
        match self {
            Endpoint::Search => "search",
            Endpoint::Detail => "item_detail",
        }
    }
}

/// Everything a scheduler drives.
pub struct SchedulerDeps {
    pub pool: Arc<CredentialPool>,
    pub marketplace: Arc<dyn Marketplace>,
    pub store: Arc<dyn WorkerStore>,
    pub cache: ItemCache,
    pub notifier: Notifier,
    pub health: HealthRecorder,
}

pub struct Scheduler {
    config: SchedulerConfig,
    search_cost: u32,
    detail_cost: u32,
    filter: FilterPipeline,
    pool: Arc<CredentialPool>,
    marketplace: Arc<dyn Marketplace>,
    store: Arc<dyn WorkerStore>,
    cache: ItemCache,
    notifier: Notifier,
    health: HealthRecorder,
}

impl Scheduler {
    pub fn new(config: &WorkerConfig, deps: SchedulerDeps) -> Self {
        Self {
            config: config.scheduler.clone(),
            search_cost: config.pool.search_cost,
            detail_cost: config.pool.detail_cost,
            filter: FilterPipeline::new(config.economics.clone()),
            pool: deps.pool,
            marketplace: deps.marketplace,
            store: deps.store,
            cache: deps.cache,
            notifier: deps.notifier,
            health: deps.health,
        }
    }

    /// Runs cycles forever at the configured interval. An overrunning cycle
    /// delays the next one instead of overlapping it.
    pub async fn run(self: Arc<Self>) {
        let interval = self.config.poll_interval();
        info!(
            target = "hermes.scout",
            interval_secs = interval.as_secs(),
            parallelism = self.config.max_parallel_tasks,
            "scheduler_started"
        );
        loop {
            let started = Instant::now();
            if let Err(err) = self.run_cycle().await {
                error!(target = "hermes.scout", error = %err, "cycle_aborted");
            }
            let elapsed = started.elapsed();
            match interval.checked_sub(elapsed) {
                Some(rest) => sleep(rest).await,
                None => warn!(
                    target = "hermes.scout",
                    elapsed_ms = elapsed.as_millis() as u64,
                    "cycle_overran_interval"
                ),
            }
        }
    }

    pub async fn run_cycle(&self) -> Result<CycleHealthRecord, CycleError> {
        let cycle_id = Uuid::new_v4();
        let started_at = Utc::now();
        let started = Instant::now();

        match self.store.credentials().await {
            Ok(records) => self.pool.reload(records),
            Err(err) => {
                warn!(target = "hermes.pool", error = %err, "credential_sync_failed");
            }
        }
        let tasks: Vec<Task> = self
            .store
            .active_tasks()
            .await?
            .into_iter()
            .filter(Task::is_active)
            .collect();
        self.cache.evict_expired().await;
        debug!(target = "hermes.scout", cycle_id = %cycle_id, tasks = tasks.len(), "cycle_started");

        let reports: Vec<CycleStats> = stream::iter(tasks)
            .map(|task| async move { self.run_task(&task).await })
            .buffer_unordered(self.config.max_parallel_tasks.max(1))
            .collect()
            .await;
        let mut stats = CycleStats::default();
        for report in &reports {
            stats.merge(report);
        }

        let usage = self.pool.take_cycle_usage();
        let record = self
            .health
            .record(cycle_id, started_at, Utc::now(), &stats, usage)
            .await;
        metrics::cycle_completed(started.elapsed().as_millis() as u64);
        Ok(record)
    }

    /// Task boundary: every error stops here and becomes a counter.
    async fn run_task(&self, task: &Task) -> CycleStats {
        let mut stats = CycleStats {
            tasks_processed: 1,
            ..CycleStats::default()
        };
        match self.process_task(task, &mut stats).await {
            Ok(()) => {}
            Err(TaskError::Exhausted) => {
                stats.tasks_deferred += 1;
                warn!(target = "hermes.scout", task_id = %task.id, "task_deferred_quota_exhausted");
            }
            Err(err) => {
                stats.tasks_failed += 1;
                metrics::task_failed();
                error!(
                    target = "hermes.scout",
                    task_id = %task.id,
                    task = %task.name,
                    error = %err,
                    "task_failed"
                );
            }
        }
        stats
    }

    async fn process_task(&self, task: &Task, stats: &mut CycleStats) -> Result<(), TaskError> {
        let query = SearchQuery::for_task(task, self.config.search_limit);
        debug!(
            target = "hermes.scout",
            task_id = %task.id,
            item_type = ?task.item_type,
            keywords = %query.keywords,
            "task_search"
        );
        let marketplace = self.marketplace.as_ref();
        let summaries = self
            .with_credential(Endpoint::Search, |token| {
                let query = &query;
                async move { marketplace.search(&token, query).await }
            })
            .await?;
        let summaries = unique_summaries(summaries);
        stats.items_found += summaries.len() as u32;

        for summary in &summaries {
            match self.process_candidate(task, summary, stats).await {
                Ok(()) => {}
                Err(TaskError::Malformed(message)) => {
                    stats.items_malformed += 1;
                    warn!(
                        target = "hermes.scout",
                        task_id = %task.id,
                        item_id = %summary.item_id,
                        error = %message,
                        "item_skipped_malformed"
                    );
                }
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    async fn process_candidate(
        &self,
        task: &Task,
        summary: &ItemSummary,
        stats: &mut CycleStats,
    ) -> Result<(), TaskError> {
        let cached = match self.cache.lookup(&summary.item_id).await {
            Some(entry) => entry.verdict_for(task.id),
            None => CachedVerdict::Fetch,
        };
        let detail = match cached {
            CachedVerdict::Skip => {
                stats.cache_hits += 1;
                return Ok(());
            }
            CachedVerdict::Reevaluate(detail) => {
                stats.cache_hits += 1;
                detail
            }
            CachedVerdict::Fetch => match self.prescreen_and_fetch(task, summary, stats).await? {
                Some(detail) => detail,
                None => return Ok(()),
            },
        };

        let decision = self.filter.evaluate(
            &detail.title,
            &detail.specs,
            Some(detail.price),
            &task.filters,
        );
        if decision.accepted {
            self.persist_match(task, detail, &decision, stats).await
        } else {
            let item_id = detail.item_id.clone();
            self.record_rejection(task, &item_id, &decision, Some(detail), stats)
                .await;
            Ok(())
        }
    }

    /// Title and price check on the summary; spends a detail call only on a pass.
    async fn prescreen_and_fetch(
        &self,
        task: &Task,
        summary: &ItemSummary,
        stats: &mut CycleStats,
    ) -> Result<Option<ItemDetail>, TaskError> {
        let decision = self
            .filter
            .prescreen(&summary.title, summary.price, &task.filters);
        if !decision.accepted {
            if decision.is_universal_rejection() {
                self.record_rejection(task, &summary.item_id, &decision, None, stats)
                    .await;
            } else {
                stats.items_excluded += 1;
                if let Some(stage) = decision.stage {
                    metrics::item_excluded(stage.as_str());
                }
            }
            return Ok(None);
        }

        let marketplace = self.marketplace.as_ref();
        let item_id = summary.item_id.as_str();
        let result = self
            .with_credential(Endpoint::Detail, |token| async move {
                marketplace.item_detail(&token, item_id).await
            })
            .await;
        if !matches!(result, Err(TaskError::Exhausted)) {
            stats.detail_calls += 1;
        }
        if let Err(TaskError::Malformed(message)) = &result {
            self.cache
                .record(
                    item_id,
                    CacheOutcome::Malformed {
                        reason: message.clone(),
                    },
                    None,
                )
                .await;
        }
        Ok(Some(result?))
    }

    async fn persist_match(
        &self,
        task: &Task,
        detail: ItemDetail,
        decision: &FilterDecision,
        stats: &mut CycleStats,
    ) -> Result<(), TaskError> {
        let record = Match::new(task, &detail, decision.economics, Utc::now());
        let item_id = detail.item_id.clone();
        let inserted = match self.store.upsert_match(&record).await {
            Ok(inserted) => inserted,
            Err(err) => {
                // keep the fetched detail so the retry next cycle costs no call
                self.cache
                    .record(&item_id, CacheOutcome::DetailCached, Some(detail))
                    .await;
                return Err(err.into());
            }
        };
        self.cache
            .record(
                &item_id,
                CacheOutcome::Accepted { task_id: task.id },
                Some(detail),
            )
            .await;
        if inserted {
            stats.items_matched += 1;
            metrics::match_found();
            info!(
                target = "hermes.scout",
                task_id = %task.id,
                item_id = %record.item_id,
                price = record.price,
                margin = ?record.margin,
                "match_found"
            );
            self.notifier.notify(&record);
        }
        Ok(())
    }

    async fn record_rejection(
        &self,
        task: &Task,
        item_id: &str,
        decision: &FilterDecision,
        detail: Option<ItemDetail>,
        stats: &mut CycleStats,
    ) {
        stats.items_excluded += 1;
        let Some(stage) = decision.stage else {
            return;
        };
        metrics::item_excluded(stage.as_str());
        let universal = stage.is_universal();
        debug!(
            target = "hermes.scout",
            task_id = %task.id,
            item_id,
            reason = decision.reason.as_deref().unwrap_or_default(),
            "item_excluded"
        );
        self.cache
            .record(
                item_id,
                CacheOutcome::Rejected {
                    reason: decision.reason.clone().unwrap_or_default(),
                    stage,
                    universal,
                    task_id: (!universal).then_some(task.id),
                },
                detail,
            )
            .await;
    }

    /// Runs one marketplace call under a leased credential, rotating on
    /// 429 and auth failures and retrying transient ones with backoff.
    async fn with_credential<T, F, Fut>(&self, endpoint: Endpoint, op: F) -> Result<T, TaskError>
    where
        F: Fn(String) -> Fut,
        Fut: Future<Output = Result<T, MarketplaceError>>,
    {
        let cost = match endpoint {
            Endpoint::Search => self.search_cost,
            Endpoint::Detail => self.detail_cost,
        };
        let max_attempts = self.pool.len() as u32 + self.config.max_retries + 1;
        let mut transient_failures = 0u32;

        for attempt in 1..=max_attempts {
            let lease = self.pool.acquire(cost)?;
            let label = lease.label().to_string();

            let token = match self.pool.bearer_token(&lease, self.marketplace.as_ref()).await {
                Ok(token) => token,
                Err(MarketplaceError::Transient(message)) => {
                    self.pool.record_failure(lease, FailureKind::TransientTokenRefresh);
                    transient_failures += 1;
                    if transient_failures > self.config.max_retries {
                        return Err(TaskError::Transient {
                            attempts: attempt,
                            message,
                        });
                    }
                    sleep(backoff_delay(self.config.backoff_base(), transient_failures)).await;
                    continue;
                }
                // throttled token endpoint: try the next credential without penalty
                Err(MarketplaceError::RateLimited) => {
                    self.pool.record_failure(lease, FailureKind::TransientTokenRefresh);
                    continue;
                }
                Err(err) => {
                    warn!(target = "hermes.pool", label = %label, error = %err, "token_refresh_failed");
                    self.pool.record_failure(lease, FailureKind::TokenRefresh);
                    self.write_back(&label).await;
                    continue;
                }
            };

            metrics::api_call(endpoint.as_str());
            match op(token).await {
                Ok(value) => {
                    self.pool.record_call(lease);
                    self.write_back(&label).await;
                    return Ok(value);
                }
                Err(MarketplaceError::RateLimited) => {
                    self.pool.record_failure(lease, FailureKind::RateLimited);
                    self.write_back(&label).await;
                }
                Err(MarketplaceError::Auth(message)) => {
                    warn!(target = "hermes.pool", label = %label, error = %message, "credential_auth_rejected");
                    self.pool.record_failure(lease, FailureKind::Auth);
                    self.write_back(&label).await;
                }
                Err(MarketplaceError::Transient(message)) => {
                    self.pool.record_failure(lease, FailureKind::Transient);
                    self.write_back(&label).await;
                    transient_failures += 1;
                    if transient_failures > self.config.max_retries {
                        return Err(TaskError::Transient {
                            attempts: attempt,
                            message,
                        });
                    }
                    debug!(
                        target = "hermes.ebay",
                        endpoint = endpoint.as_str(),
                        attempt,
                        error = %message,
                        "transient_failure_retrying"
                    );
                    sleep(backoff_delay(self.config.backoff_base(), transient_failures)).await;
                }
                Err(MarketplaceError::Malformed(message)) => {
                    self.pool.record_call(lease);
                    self.write_back(&label).await;
                    return Err(TaskError::Malformed(message));
                }
            }
        }
        Err(TaskError::Exhausted)
    }

    async fn write_back(&self, label: &str) {
        let Some(usage) = self.pool.usage(label) else {
            return;
        };
        if let Err(err) = self.store.save_credential_usage(&usage).await {
            warn!(target = "hermes.pool", label, error = %err, "credential_write_back_failed");
        }
    }
}

/// Exponential backoff with up to 50% jitter.
fn backoff_delay(base: Duration, failures: u32) -> Duration {
    let exp = failures.saturating_sub(1).min(10);
    let delay_ms = (base.as_millis() as u64).saturating_mul(1u64 << exp);
    let jitter = rand::rng().random_range(0..=delay_ms / 2);
    Duration::from_millis(delay_ms + jitter)
}
