//! Marketplace credential pool.
//!
//! Each credential carries a daily call counter and a status. Selection is
//! round-robin over `Active` credentials; a call's cost is reserved at
//! `acquire` time so concurrent tasks cannot jointly overrun a quota. The
//! daily reset is a boundary check on every access, not a timer.

use crate::config::PoolConfig;
use crate::ebay::{AccessToken, AppKeys, Marketplace, MarketplaceError};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use thiserror::Error;
use tracing::{info, warn};

pub type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CredentialStatus {
    Active,
    RateLimited,
    Error,
    #[default]
    #[serde(other)]
    Unknown,
}

impl CredentialStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            CredentialStatus::Active => "active",
            CredentialStatus::RateLimited => "rate_limited",
            CredentialStatus::Error => "error",
            CredentialStatus::Unknown => "unknown",
        }
    }

    pub fn is_usable(&self) -> bool {
        matches!(self, CredentialStatus::Active)
    }

    /// Never-probed credentials enter service as active.
    pub fn on_load(self) -> Self {
        match self {
            CredentialStatus::Unknown => CredentialStatus::Active,
            other => other,
        }
    }

    pub fn on_quota_exceeded(self) -> Self {
        match self {
            CredentialStatus::Active | CredentialStatus::Unknown => CredentialStatus::RateLimited,
            other => other,
        }
    }

    pub fn on_server_rate_limit(self) -> Self {
        match self {
            CredentialStatus::Error => CredentialStatus::Error,
            _ => CredentialStatus::RateLimited,
        }
    }

    /// `Error` is terminal until fixed outside the worker.
    pub fn on_auth_failure(self) -> Self {
        CredentialStatus::Error
    }

    pub fn on_recovery(self) -> Self {
        match self {
            CredentialStatus::RateLimited => CredentialStatus::Active,
            other => other,
        }
    }
}

/// Credential row as stored externally.
#[derive(Clone, Deserialize)]
pub struct CredentialRecord {
    pub label: String,
    pub app_id: String,
    pub cert_id: String,
    #[serde(default)]
    pub calls_today: u32,
    #[serde(default)]
    pub reset_date: Option<NaiveDate>,
    #[serde(default)]
    pub status: CredentialStatus,
}

impl fmt::Debug for CredentialRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialRecord")
            .field("label", &self.label)
            .field("calls_today", &self.calls_today)
            .field("reset_date", &self.reset_date)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}

/// Counter/status snapshot written back to the credential store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CredentialUsage {
    pub label: String,
    pub calls_today: u32,
    pub reset_date: NaiveDate,
    pub status: CredentialStatus,
    pub last_used_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// API call rejected the token (401/403). The call counts.
    Auth,
    /// Token exchange was refused. No API call was made.
    TokenRefresh,
    /// HTTP 429. The call counts.
    RateLimited,
    /// Timeout, connect error or 5xx. The call counts.
    Transient,
    /// Token endpoint unreachable. No API call was made.
    TransientTokenRefresh,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("no usable credential")]
    Exhausted,
}

#[derive(Debug)]
struct SlotState {
    keys: AppKeys,
    calls_today: u32,
    reserved: u32,
    reset_date: NaiveDate,
    status: CredentialStatus,
    limited_at: Option<DateTime<Utc>>,
    last_used_at: Option<DateTime<Utc>>,
    token: Option<AccessToken>,
    cycle_calls: u32,
    // status last read from or written to the store; used to spot external edits
    synced_status: CredentialStatus,
}

#[derive(Debug)]
struct Slot {
    label: String,
    state: Mutex<SlotState>,
}

impl Slot {
    fn lock(&self) -> MutexGuard<'_, SlotState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// A reserved call slot on one credential. Settle it with
/// [`CredentialPool::record_call`] or [`CredentialPool::record_failure`];
/// dropping it unsettled releases the reservation.
#[derive(Debug)]
pub struct Lease {
    slot: Arc<Slot>,
    cost: u32,
    settled: bool,
}

impl Lease {
    pub fn label(&self) -> &str {
        &self.slot.label
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        if !self.settled {
            let mut state = self.slot.lock();
            state.reserved = state.reserved.saturating_sub(self.cost);
        }
    }
}

pub struct CredentialPool {
    slots: RwLock<Vec<Arc<Slot>>>,
    cursor: AtomicUsize,
    config: PoolConfig,
    clock: Clock,
}

impl fmt::Debug for CredentialPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialPool")
            .field("config", &self.config)
            .field("credentials", &self.len())
            .finish_non_exhaustive()
    }
}

impl CredentialPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            slots: RwLock::new(Vec::new()),
            cursor: AtomicUsize::new(0),
            config,
            clock: Arc::new(Utc::now),
        }
    }

    #[cfg(test)]
    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    fn now(&self) -> DateTime<Utc> {
        (self.clock)()
    }

    fn read_slots(&self) -> Vec<Arc<Slot>> {
        self.slots
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn len(&self) -> usize {
        self.read_slots().len()
    }

    /// Syncs with the credential store at cycle start. Keeps local counters
    /// when they are ahead of the stored ones; adopts statuses edited
    /// externally (e.g. an operator re-enabling an `error` credential).
    pub fn reload(&self, records: Vec<CredentialRecord>) {
        let now = self.now();
        let today = now.date_naive();
        let existing = self.read_slots();
        let mut next = Vec::with_capacity(records.len());

        for record in records {
            let keys = AppKeys {
                app_id: record.app_id,
                cert_id: record.cert_id,
            };
            let stored_date = record.reset_date.unwrap_or(today);
            let stored_calls = if stored_date < today {
                0
            } else {
                record.calls_today
            };

            if let Some(slot) = existing.iter().find(|s| s.label == record.label) {
                {
                    let mut state = slot.lock();
                    if state.keys != keys {
                        state.keys = keys;
                        state.token = None;
                    }
                    if record.status != state.synced_status {
                        info!(
                            target = "hermes.pool",
                            label = %slot.label,
                            from = state.status.as_str(),
                            to = record.status.as_str(),
                            "credential_status_changed_externally"
                        );
                        state.status = record.status.on_load();
                        state.synced_status = record.status;
                        state.limited_at = None;
                    }
                    if stored_date >= state.reset_date {
                        state.calls_today = state.calls_today.max(stored_calls);
                    }
                    roll_over(&mut state, now, &self.config);
                }
                next.push(slot.clone());
            } else {
                let mut state = SlotState {
                    keys,
                    calls_today: stored_calls,
                    reserved: 0,
                    reset_date: stored_date.max(today),
                    status: record.status.on_load(),
                    limited_at: None,
                    last_used_at: None,
                    token: None,
                    cycle_calls: 0,
                    synced_status: record.status,
                };
                if record.status == CredentialStatus::RateLimited {
                    state.limited_at = Some(now);
                }
                if stored_date < today {
                    state.status = state.status.on_recovery();
                }
                next.push(Arc::new(Slot {
                    label: record.label,
                    state: Mutex::new(state),
                }));
            }
        }

        *self
            .slots
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = next;
    }

    /// Reserves `cost` calls on the next usable credential, round-robin.
    pub fn acquire(&self, cost: u32) -> Result<Lease, PoolError> {
        let slots = self.read_slots();
        if slots.is_empty() {
            return Err(PoolError::Exhausted);
        }
        let now = self.now();
        let start = self.cursor.load(Ordering::Relaxed);
        for offset in 0..slots.len() {
            let index = (start + offset) % slots.len();
            let slot = &slots[index];
            let mut state = slot.lock();
            roll_over(&mut state, now, &self.config);
            if !state.status.is_usable() {
                continue;
            }
            let committed = state.calls_today.saturating_add(state.reserved);
            if committed.saturating_add(cost) > self.config.daily_quota {
                continue;
            }
            state.reserved += cost;
            // Rotation resumes after the slot actually leased, not after `start`.
            self.cursor.store(index + 1, Ordering::Relaxed);
            return Ok(Lease {
                slot: slot.clone(),
                cost,
                settled: false,
            });
        }
        Err(PoolError::Exhausted)
    }

    /// Counts a completed call against the lease's credential.
    pub fn record_call(&self, mut lease: Lease) {
        let now = self.now();
        let mut state = lease.slot.lock();
        state.reserved = state.reserved.saturating_sub(lease.cost);
        count_call(&mut state, lease.cost, now, &self.config, &lease.slot.label);
        lease.settled = true;
    }

    pub fn record_failure(&self, mut lease: Lease, kind: FailureKind) {
        let now = self.now();
        let label = lease.slot.label.clone();
        let mut state = lease.slot.lock();
        state.reserved = state.reserved.saturating_sub(lease.cost);
        lease.settled = true;
        match kind {
            FailureKind::Auth | FailureKind::TokenRefresh => {
                if kind == FailureKind::Auth {
                    count_call(&mut state, lease.cost, now, &self.config, &label);
                }
                state.status = state.status.on_auth_failure();
                state.token = None;
                warn!(target = "hermes.pool", label = %label, "credential_marked_error");
            }
            FailureKind::RateLimited => {
                count_call(&mut state, lease.cost, now, &self.config, &label);
                if state.status != CredentialStatus::RateLimited {
                    state.limited_at = Some(now);
                }
                state.status = state.status.on_server_rate_limit();
                warn!(
                    target = "hermes.pool",
                    label = %label,
                    calls_today = state.calls_today,
                    "credential_rate_limited_by_server"
                );
            }
            FailureKind::Transient => {
                count_call(&mut state, lease.cost, now, &self.config, &label);
            }
            FailureKind::TransientTokenRefresh => {}
        }
    }

    /// Cached bearer token for the lease's credential, exchanging a new one
    /// when missing or within the refresh margin of expiry.
    pub async fn bearer_token(
        &self,
        lease: &Lease,
        marketplace: &dyn Marketplace,
    ) -> Result<String, MarketplaceError> {
        let now = self.now();
        let margin = self.config.token_refresh_margin();
        let keys = {
            let state = lease.slot.lock();
            if let Some(token) = state.token.as_ref().filter(|t| t.is_fresh(now, margin)) {
                return Ok(token.value.clone());
            }
            state.keys.clone()
        };
        let token = marketplace.exchange_token(&keys).await?;
        let value = token.value.clone();
        lease.slot.lock().token = Some(token);
        Ok(value)
    }

    pub fn usage(&self, label: &str) -> Option<CredentialUsage> {
        self.read_slots()
            .iter()
            .find(|slot| slot.label == label)
            .map(|slot| {
                let mut state = slot.lock();
                state.synced_status = state.status;
                usage_of(&slot.label, &state)
            })
    }

    pub fn snapshot(&self) -> Vec<CredentialUsage> {
        let now = self.now();
        self.read_slots()
            .iter()
            .map(|slot| {
                let mut state = slot.lock();
                roll_over(&mut state, now, &self.config);
                usage_of(&slot.label, &state)
            })
            .collect()
    }

    /// Per-credential call counts since the previous call, then resets them.
    pub fn take_cycle_usage(&self) -> BTreeMap<String, u32> {
        self.read_slots()
            .iter()
            .filter_map(|slot| {
                let mut state = slot.lock();
                let calls = std::mem::take(&mut state.cycle_calls);
                (calls > 0).then(|| (slot.label.clone(), calls))
            })
            .collect()
    }
}

fn usage_of(label: &str, state: &SlotState) -> CredentialUsage {
    CredentialUsage {
        label: label.to_string(),
        calls_today: state.calls_today,
        reset_date: state.reset_date,
        status: state.status,
        last_used_at: state.last_used_at,
    }
}

fn count_call(
    state: &mut SlotState,
    cost: u32,
    now: DateTime<Utc>,
    config: &PoolConfig,
    label: &str,
) {
    roll_over(state, now, config);
    state.calls_today = state.calls_today.saturating_add(cost);
    state.cycle_calls = state.cycle_calls.saturating_add(cost);
    state.last_used_at = Some(now);
    if state.calls_today > config.daily_quota && state.status.is_usable() {
        state.status = state.status.on_quota_exceeded();
        state.limited_at = Some(now);
        warn!(
            target = "hermes.pool",
            label = %label,
            calls_today = state.calls_today,
            quota = config.daily_quota,
            "credential_quota_exceeded"
        );
    }
}

/// UTC day boundary and optional early cooldown recovery.
fn roll_over(state: &mut SlotState, now: DateTime<Utc>, config: &PoolConfig) {
    let today = now.date_naive();
    if today > state.reset_date {
        state.calls_today = 0;
        state.reset_date = today;
        state.status = state.status.on_recovery();
        state.limited_at = None;
        return;
    }
    if state.status == CredentialStatus::RateLimited
        && let (Some(cooldown), Some(limited_at)) = (config.rate_limit_cooldown(), state.limited_at)
        && now - limited_at >= cooldown
        && state.calls_today < config.daily_quota
    {
        state.status = state.status.on_recovery();
        state.limited_at = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::{Duration, TimeZone};
    use crate::ebay::SearchQuery;
    use crate::models::{ItemDetail, ItemSummary};
    use std::sync::atomic::AtomicU32;

    fn record(label: &str, calls_today: u32, status: CredentialStatus) -> CredentialRecord {
        CredentialRecord {
            label: label.into(),
            app_id: format!("{label}-app"),
            cert_id: format!("{label}-cert"),
            calls_today,
            reset_date: Some(NaiveDate::from_ymd_opt(2026, 10, 15).unwrap()),
            status,
        }
    }

    fn manual_clock(start: DateTime<Utc>) -> (Clock, Arc<Mutex<DateTime<Utc>>>) {
        let now = Arc::new(Mutex::new(start));
        let handle = now.clone();
        let clock: Clock = Arc::new(move || *handle.lock().unwrap());
        (clock, now)
    }

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 15, 12, 0, 0).unwrap()
    }

    fn pool_with(records: Vec<CredentialRecord>, config: PoolConfig) -> (CredentialPool, Arc<Mutex<DateTime<Utc>>>) {
        let (clock, now) = manual_clock(noon());
        let pool = CredentialPool::new(config).with_clock(clock);
        pool.reload(records);
        (pool, now)
    }

    #[test]
    fn round_robin_is_fair() {
        let (pool, _) = pool_with(
            vec![
                record("a", 0, CredentialStatus::Active),
                record("b", 0, CredentialStatus::Active),
                record("c", 0, CredentialStatus::Active),
            ],
            PoolConfig::default(),
        );
        let n: usize = 10;
        let mut counts: BTreeMap<String, usize> = BTreeMap::new();
        for _ in 0..n {
            let lease = pool.acquire(1).expect("lease");
            *counts.entry(lease.label().to_string()).or_default() += 1;
            pool.record_call(lease);
        }
        let bound = n.div_ceil(3);
        assert_eq!(counts.len(), 3);
        assert!(counts.values().all(|c| *c <= bound), "{counts:?}");
    }

    #[test]
    fn rotation_skips_unusable_credential_without_doubling_up() {
        let (pool, _) = pool_with(
            vec![
                record("a", 0, CredentialStatus::Error),
                record("b", 0, CredentialStatus::Active),
                record("c", 0, CredentialStatus::Active),
            ],
            PoolConfig::default(),
        );
        let mut sequence = Vec::new();
        for _ in 0..6 {
            let lease = pool.acquire(1).expect("lease");
            sequence.push(lease.label().to_string());
            pool.record_failure(lease, FailureKind::Transient);
        }
        assert_eq!(sequence, ["b", "c", "b", "c", "b", "c"]);
    }

    #[test]
    fn credential_at_quota_is_skipped_and_sole_one_exhausts() {
        let (pool, _) = pool_with(
            vec![record("full", 5000, CredentialStatus::Active)],
            PoolConfig::default(),
        );
        assert_eq!(pool.acquire(1).unwrap_err(), PoolError::Exhausted);

        let (pool, _) = pool_with(
            vec![
                record("full", 5000, CredentialStatus::Active),
                record("spare", 10, CredentialStatus::Active),
            ],
            PoolConfig::default(),
        );
        for _ in 0..4 {
            let lease = pool.acquire(1).expect("lease");
            assert_eq!(lease.label(), "spare");
        }
    }

    #[test]
    fn counter_never_exceeds_quota_while_active() {
        let config = PoolConfig {
            daily_quota: 5,
            ..PoolConfig::default()
        };
        let (pool, _) = pool_with(
            vec![record("a", 0, CredentialStatus::Active), record("b", 3, CredentialStatus::Unknown)],
            config,
        );
        while let Ok(lease) = pool.acquire(1) {
            pool.record_call(lease);
            for usage in pool.snapshot() {
                if usage.status == CredentialStatus::Active {
                    assert!(usage.calls_today <= 5);
                }
            }
        }
        let total: u32 = pool.snapshot().iter().map(|u| u.calls_today).sum();
        assert_eq!(total, 10);
    }

    #[test]
    fn reservations_block_concurrent_overrun() {
        let config = PoolConfig {
            daily_quota: 2,
            ..PoolConfig::default()
        };
        let (pool, _) = pool_with(vec![record("a", 0, CredentialStatus::Active)], config);
        let first = pool.acquire(1).expect("first");
        let second = pool.acquire(1).expect("second");
        assert!(pool.acquire(1).is_err());
        drop(second);
        let third = pool.acquire(1).expect("released reservation is reusable");
        pool.record_call(first);
        pool.record_call(third);
        assert_eq!(pool.usage("a").unwrap().calls_today, 2);
        assert_eq!(pool.usage("a").unwrap().status, CredentialStatus::Active);
    }

    #[test]
    fn exceeding_quota_flips_to_rate_limited_until_midnight() {
        let config = PoolConfig {
            daily_quota: 3,
            ..PoolConfig::default()
        };
        let (pool, now) = pool_with(vec![record("a", 3, CredentialStatus::Active)], config);
        // a call that bypassed acquire, e.g. an untracked retry
        let lease = Lease {
            slot: pool.read_slots()[0].clone(),
            cost: 1,
            settled: false,
        };
        pool.record_call(lease);
        assert_eq!(pool.usage("a").unwrap().status, CredentialStatus::RateLimited);

        *now.lock().unwrap() = noon() + Duration::hours(6);
        assert!(pool.acquire(1).is_err());

        *now.lock().unwrap() = noon() + Duration::hours(13);
        let lease = pool.acquire(1).expect("reset at midnight");
        pool.record_call(lease);
        let usage = pool.usage("a").unwrap();
        assert_eq!(usage.calls_today, 1);
        assert_eq!(usage.status, CredentialStatus::Active);
    }

    #[test]
    fn server_429_marks_rate_limited_even_under_quota() {
        let (pool, _) = pool_with(
            vec![record("a", 10, CredentialStatus::Active), record("b", 10, CredentialStatus::Active)],
            PoolConfig::default(),
        );
        let lease = pool.acquire(1).unwrap();
        let limited = lease.label().to_string();
        pool.record_failure(lease, FailureKind::RateLimited);
        assert_eq!(pool.usage(&limited).unwrap().status, CredentialStatus::RateLimited);
        let next = pool.acquire(1).unwrap();
        assert_ne!(next.label(), limited);
    }

    #[test]
    fn cooldown_allows_early_recovery_when_configured() {
        let config = PoolConfig {
            rate_limit_cooldown_secs: Some(600),
            ..PoolConfig::default()
        };
        let (pool, now) = pool_with(vec![record("a", 10, CredentialStatus::Active)], config);
        let lease = pool.acquire(1).unwrap();
        pool.record_failure(lease, FailureKind::RateLimited);
        assert!(pool.acquire(1).is_err());
        *now.lock().unwrap() = noon() + Duration::minutes(11);
        assert!(pool.acquire(1).is_ok());
    }

    #[test]
    fn rate_limited_stays_sticky_without_cooldown() {
        let (pool, now) = pool_with(vec![record("a", 10, CredentialStatus::Active)], PoolConfig::default());
        let lease = pool.acquire(1).unwrap();
        pool.record_failure(lease, FailureKind::RateLimited);
        *now.lock().unwrap() = noon() + Duration::hours(11);
        assert!(pool.acquire(1).is_err());
    }

    #[test]
    fn auth_failure_is_terminal_until_store_remediates() {
        let (pool, now) = pool_with(vec![record("a", 0, CredentialStatus::Active)], PoolConfig::default());
        let lease = pool.acquire(1).unwrap();
        pool.record_failure(lease, FailureKind::Auth);
        assert_eq!(pool.usage("a").unwrap().status, CredentialStatus::Error);

        *now.lock().unwrap() = noon() + Duration::days(2);
        assert!(pool.acquire(1).is_err());

        // store still says error: nothing changes
        pool.reload(vec![record("a", 0, CredentialStatus::Error)]);
        assert!(pool.acquire(1).is_err());

        // operator fixed the keys and re-enabled it
        pool.reload(vec![record("a", 0, CredentialStatus::Active)]);
        assert!(pool.acquire(1).is_ok());
    }

    #[test]
    fn reload_keeps_higher_local_counter() {
        let (pool, _) = pool_with(vec![record("a", 5, CredentialStatus::Active)], PoolConfig::default());
        for _ in 0..3 {
            let lease = pool.acquire(1).unwrap();
            pool.record_call(lease);
        }
        pool.reload(vec![record("a", 5, CredentialStatus::Active)]);
        assert_eq!(pool.usage("a").unwrap().calls_today, 8);
        pool.reload(vec![record("a", 20, CredentialStatus::Active)]);
        assert_eq!(pool.usage("a").unwrap().calls_today, 20);
    }

    #[test]
    fn cycle_usage_is_drained() {
        let (pool, _) = pool_with(vec![record("a", 0, CredentialStatus::Active)], PoolConfig::default());
        let lease = pool.acquire(2).unwrap();
        pool.record_call(lease);
        let usage = pool.take_cycle_usage();
        assert_eq!(usage.get("a"), Some(&2));
        assert!(pool.take_cycle_usage().is_empty());
    }

    struct CountingMarketplace {
        exchanges: AtomicU32,
        fail: bool,
    }

    #[async_trait]
    impl Marketplace for CountingMarketplace {
        async fn exchange_token(&self, keys: &AppKeys) -> Result<AccessToken, MarketplaceError> {
            self.exchanges.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(MarketplaceError::Auth("invalid_client".into()));
            }
            Ok(AccessToken {
                value: format!("token-{}", keys.app_id),
                expires_at: noon() + Duration::hours(2),
            })
        }

        async fn search(&self, _: &str, _: &SearchQuery) -> Result<Vec<ItemSummary>, MarketplaceError> {
            Ok(vec![])
        }

        async fn item_detail(&self, _: &str, id: &str) -> Result<ItemDetail, MarketplaceError> {
            Err(MarketplaceError::Malformed(id.to_string()))
        }
    }

    #[tokio::test]
    async fn bearer_tokens_are_cached_until_near_expiry() {
        let (pool, now) = pool_with(vec![record("a", 0, CredentialStatus::Active)], PoolConfig::default());
        let market = CountingMarketplace {
            exchanges: AtomicU32::new(0),
            fail: false,
        };
        let lease = pool.acquire(1).unwrap();
        let first = pool.bearer_token(&lease, &market).await.unwrap();
        let second = pool.bearer_token(&lease, &market).await.unwrap();
        assert_eq!(first, "token-a-app");
        assert_eq!(first, second);
        assert_eq!(market.exchanges.load(Ordering::SeqCst), 1);

        // inside the 5 minute refresh margin
        *now.lock().unwrap() = noon() + Duration::minutes(116);
        pool.bearer_token(&lease, &market).await.unwrap();
        assert_eq!(market.exchanges.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn refused_token_exchange_marks_error() {
        let (pool, _) = pool_with(vec![record("a", 0, CredentialStatus::Active)], PoolConfig::default());
        let market = CountingMarketplace {
            exchanges: AtomicU32::new(0),
            fail: true,
        };
        let lease = pool.acquire(1).unwrap();
        assert!(pool.bearer_token(&lease, &market).await.is_err());
        pool.record_failure(lease, FailureKind::TokenRefresh);
        let usage = pool.usage("a").unwrap();
        assert_eq!(usage.status, CredentialStatus::Error);
        assert_eq!(usage.calls_today, 0);
    }
}
