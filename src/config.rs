use crate::ebay::config::EbayConfig;
use serde::Deserialize;
use std::{env, fs, str::FromStr, time::Duration};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to read config file `{path}`: {message}")]
    Read { path: String, message: String },
    #[error("invalid config file: {0}")]
    Parse(String),
    #[error("invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

impl ConfigError {
    fn invalid(key: &'static str, message: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    pub scheduler: SchedulerConfig,
    pub pool: PoolConfig,
    pub cache: CacheConfig,
    pub economics: EconomicsConfig,
    pub notify: NotifyConfig,
    pub server: ServerConfig,
    pub http: HttpConfig,
    pub ebay: EbayConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub poll_interval_secs: u64,
    pub max_parallel_tasks: usize,
    pub search_limit: u32,
    pub max_retries: u32,
    pub backoff_base_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 10,
            max_parallel_tasks: 4,
            search_limit: 50,
            max_retries: 2,
            backoff_base_ms: 500,
        }
    }
}

impl SchedulerConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    pub daily_quota: u32,
    pub search_cost: u32,
    pub detail_cost: u32,
    pub token_refresh_margin_secs: u64,
    /// When set, a rate-limited credential returns to service after this long
    /// instead of waiting for the UTC day boundary.
    pub rate_limit_cooldown_secs: Option<u64>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            daily_quota: 5000,
            search_cost: 1,
            detail_cost: 1,
            token_refresh_margin_secs: 300,
            rate_limit_cooldown_secs: None,
        }
    }
}

impl PoolConfig {
    pub fn token_refresh_margin(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.token_refresh_margin_secs as i64)
    }

    pub fn rate_limit_cooldown(&self) -> Option<chrono::Duration> {
        self.rate_limit_cooldown_secs
            .map(|secs| chrono::Duration::seconds(secs as i64))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub ttl_secs: u64,
    pub key_prefix: String,
    pub redis_url: Option<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_secs: 72 * 3600,
            key_prefix: "scout:item:".to_string(),
            redis_url: None,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Spot prices are USD per troy ounce.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct EconomicsConfig {
    pub gold_spot_usd: f64,
    pub silver_spot_usd: f64,
    pub platinum_spot_usd: f64,
    pub shipping_cost: f64,
    pub fee_rate: f64,
}

impl Default for EconomicsConfig {
    fn default() -> Self {
        Self {
            gold_spot_usd: 2400.0,
            silver_spot_usd: 30.0,
            platinum_spot_usd: 1000.0,
            shipping_cost: 10.0,
            fee_rate: 0.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    pub webhook_url: Option<String>,
    pub queue_capacity: usize,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            webhook_url: None,
            queue_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub port: u16,
    pub metrics_key: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8000,
            metrics_key: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub timeout_secs: u64,
    pub connect_timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 15,
            connect_timeout_secs: 5,
        }
    }
}

impl WorkerConfig {
    /// Loads `SCOUT_CONFIG` (YAML) if set, applies environment overrides and validates.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match env::var("SCOUT_CONFIG") {
            Ok(path) => {
                let raw = fs::read_to_string(&path).map_err(|err| ConfigError::Read {
                    path: path.clone(),
                    message: err.to_string(),
                })?;
                Self::from_yaml_str(&raw)?
            }
            Err(_) => Self::default(),
        };
        config.apply_overrides(|key| env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(raw).map_err(|err| ConfigError::Parse(err.to_string()))
    }

    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let lookup = &lookup;
        if let Some(v) = parse_var(lookup, "SCOUT_POLL_INTERVAL_SECS")? {
            self.scheduler.poll_interval_secs = v;
        }
        if let Some(v) = parse_var(lookup, "SCOUT_MAX_PARALLEL_TASKS")? {
            self.scheduler.max_parallel_tasks = v;
        }
        if let Some(v) = parse_var(lookup, "SCOUT_SEARCH_LIMIT")? {
            self.scheduler.search_limit = v;
        }
        if let Some(v) = parse_var(lookup, "SCOUT_MAX_RETRIES")? {
            self.scheduler.max_retries = v;
        }
        if let Some(v) = parse_var(lookup, "SCOUT_DAILY_QUOTA")? {
            self.pool.daily_quota = v;
        }
        if let Some(v) = parse_var(lookup, "SCOUT_RATE_LIMIT_COOLDOWN_SECS")? {
            self.pool.rate_limit_cooldown_secs = Some(v);
        }
        if let Some(v) = parse_var(lookup, "SCOUT_CACHE_TTL_SECS")? {
            self.cache.ttl_secs = v;
        }
        if let Some(url) = non_empty(lookup, "REDIS_URL") {
            self.cache.redis_url = Some(url);
        }
        if let Some(url) = non_empty(lookup, "SCOUT_NOTIFY_WEBHOOK") {
            self.notify.webhook_url = Some(url);
        }
        if let Some(v) = parse_var(lookup, "SCOUT_NOTIFY_QUEUE")? {
            self.notify.queue_capacity = v;
        }
        if let Some(v) = parse_var(lookup, "PORT")? {
            self.server.port = v;
        }
        if let Some(key) = non_empty(lookup, "METRICS_KEY") {
            self.server.metrics_key = Some(key);
        }
        if let Some(v) = parse_var(lookup, "HTTP_TIMEOUT_SECS")? {
            self.http.timeout_secs = v;
        }
        if let Some(v) = parse_var(lookup, "HTTP_CONNECT_TIMEOUT_SECS")? {
            self.http.connect_timeout_secs = v;
        }
        if let Some(value) = non_empty(lookup, "EBAY_ENV") {
            self.ebay.environment = value
                .parse()
                .map_err(|msg: String| ConfigError::invalid("EBAY_ENV", msg))?;
        }
        if let Some(value) = non_empty(lookup, "EBAY_MARKETPLACE_ID") {
            self.ebay.marketplace_id = value;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.poll_interval_secs == 0 {
            return Err(ConfigError::invalid("poll_interval_secs", "must be > 0"));
        }
        if self.scheduler.max_parallel_tasks == 0 {
            return Err(ConfigError::invalid("max_parallel_tasks", "must be > 0"));
        }
        if self.scheduler.search_limit == 0 || self.scheduler.search_limit > 200 {
            return Err(ConfigError::invalid("search_limit", "must be within 1..=200"));
        }
        if self.pool.daily_quota == 0 {
            return Err(ConfigError::invalid("daily_quota", "must be > 0"));
        }
        if self.pool.search_cost == 0 || self.pool.detail_cost == 0 {
            return Err(ConfigError::invalid("call_cost", "must be > 0"));
        }
        if self.pool.rate_limit_cooldown_secs == Some(0) {
            return Err(ConfigError::invalid(
                "rate_limit_cooldown_secs",
                "must be > 0 when set",
            ));
        }
        if self.cache.ttl_secs == 0 {
            return Err(ConfigError::invalid("cache.ttl_secs", "must be > 0"));
        }
        if self.notify.queue_capacity == 0 {
            return Err(ConfigError::invalid("notify.queue_capacity", "must be > 0"));
        }
        let econ = &self.economics;
        if econ.gold_spot_usd <= 0.0 || econ.silver_spot_usd <= 0.0 || econ.platinum_spot_usd <= 0.0
        {
            return Err(ConfigError::invalid("economics", "spot prices must be positive"));
        }
        if !(0.0..1.0).contains(&econ.fee_rate) || econ.shipping_cost < 0.0 {
            return Err(ConfigError::invalid(
                "economics",
                "fee_rate must be within [0, 1) and shipping_cost non-negative",
            ));
        }
        if self.ebay.marketplace_id.trim().is_empty() {
            return Err(ConfigError::invalid("EBAY_MARKETPLACE_ID", "must not be empty"));
        }
        Ok(())
    }
}

fn non_empty<F>(lookup: &F, key: &str) -> Option<String>
where
    F: Fn(&str) -> Option<String>,
{
    lookup(key)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_var<T, F>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match non_empty(lookup, key) {
        Some(raw) => raw
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::invalid(key, format!("cannot parse `{raw}`"))),
        None => Ok(None),
    }
}
