use std::env;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TracepulseError};
use crate::model::alert::AlertRule;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Config {
    pub ingest_http_addr: String,
    pub ingest_grpc_addr: String,
    pub query_http_addr: String,
    pub queue_capacity: usize,
    pub tick_interval: Duration,
    pub tick_budget: Duration,
    pub trace_idle_timeout: Duration,
    pub trace_retention: usize,
    pub bucket_width: Duration,
    pub window_buckets: usize,
    pub top_endpoints: usize,
    pub service_map_interval: Duration,
    pub service_map_lookback: Duration,
    pub service_map_top_operations: usize,
    pub alert_history: usize,
    pub heartbeat_interval: Duration,
    pub idle_timeout: Duration,
    pub subscriber_outbox: usize,
    pub reconnect: ReconnectPolicy,
    pub auto_activate_tenants: bool,
    pub tenants: Vec<String>,
    pub alert_rules: Vec<AlertRule>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Fixed,
    Exponential,
}

/// Reconnect behaviour the server advertises to streaming clients.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectPolicy {
    pub strategy: BackoffStrategy,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Fraction of the delay added as random jitter, 0.0..=1.0.
    pub jitter: f64,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::Fixed,
            initial_delay_ms: 5_000,
            max_delay_ms: 60_000,
            multiplier: 2.0,
            jitter: 0.0,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based), without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let ms = match self.strategy {
            BackoffStrategy::Fixed => self.initial_delay_ms,
            BackoffStrategy::Exponential => {
                let exp = attempt.saturating_sub(1).min(32) as i32;
                let scaled = self.initial_delay_ms as f64 * self.multiplier.max(1.0).powi(exp);
                scaled.min(self.max_delay_ms as f64) as u64
            }
        };
        Duration::from_millis(ms.min(self.max_delay_ms.max(self.initial_delay_ms)))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ingest_http_addr: "127.0.0.1:4318".to_string(),
            ingest_grpc_addr: "127.0.0.1:4317".to_string(),
            query_http_addr: "127.0.0.1:1778".to_string(),
            queue_capacity: 10_000,
            tick_interval: Duration::from_secs(1),
            tick_budget: Duration::from_millis(250),
            trace_idle_timeout: Duration::from_secs(10),
            trace_retention: 10_000,
            bucket_width: Duration::from_secs(1),
            window_buckets: 60,
            top_endpoints: 10,
            service_map_interval: Duration::from_secs(5),
            service_map_lookback: Duration::from_secs(5 * 60),
            service_map_top_operations: 10,
            alert_history: 500,
            heartbeat_interval: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(30),
            subscriber_outbox: 256,
            reconnect: ReconnectPolicy::default(),
            auto_activate_tenants: true,
            tenants: Vec::new(),
            alert_rules: Vec::new(),
        }
    }
}

impl Config {
    pub fn load() -> Result<Self> {
        let mut cfg = Self::default();
        let config_path = config_file_path();
        if let Some(file_overrides) = load_file_overrides(&config_path)? {
            apply_overrides(&mut cfg, file_overrides, "config file")?;
        }
        let env_overrides = load_env_overrides()?;
        apply_overrides(&mut cfg, env_overrides, "environment")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_env() -> Result<Self> {
        let mut cfg = Self::default();
        let env_overrides = load_env_overrides()?;
        apply_overrides(&mut cfg, env_overrides, "environment")?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn window_duration(&self) -> Duration {
        self.bucket_width * self.window_buckets as u32
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("queue_capacity", self.queue_capacity),
            ("window_buckets", self.window_buckets),
            ("subscriber_outbox", self.subscriber_outbox),
            ("trace_retention", self.trace_retention),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(TracepulseError::Config(format!("{name} must be > 0")));
            }
        }
        if self.bucket_width.is_zero() || self.tick_interval.is_zero() {
            return Err(TracepulseError::Config(
                "bucket_width and tick_interval must be > 0".to_string(),
            ));
        }
        if self.heartbeat_interval.is_zero() || self.heartbeat_interval >= self.idle_timeout {
            return Err(TracepulseError::Config(format!(
                "heartbeat_interval ({:?}) must be non-zero and shorter than idle_timeout ({:?})",
                self.heartbeat_interval, self.idle_timeout
            )));
        }
        if !(0.0..=1.0).contains(&self.reconnect.jitter) {
            return Err(TracepulseError::Config(
                "reconnect.jitter must be within 0.0..=1.0".to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Default, Deserialize)]
struct ReconnectOverrides {
    strategy: Option<BackoffStrategy>,
    initial_delay: Option<String>,
    max_delay: Option<String>,
    multiplier: Option<f64>,
    jitter: Option<f64>,
}

#[derive(Debug, Default, Deserialize)]
struct ConfigOverrides {
    ingest_http_addr: Option<String>,
    ingest_grpc_addr: Option<String>,
    query_http_addr: Option<String>,
    queue_capacity: Option<usize>,
    tick_interval: Option<String>,
    tick_budget: Option<String>,
    trace_idle_timeout: Option<String>,
    trace_retention: Option<usize>,
    bucket_width: Option<String>,
    window_buckets: Option<usize>,
    top_endpoints: Option<usize>,
    service_map_interval: Option<String>,
    service_map_lookback: Option<String>,
    service_map_top_operations: Option<usize>,
    alert_history: Option<usize>,
    heartbeat_interval: Option<String>,
    idle_timeout: Option<String>,
    subscriber_outbox: Option<usize>,
    reconnect: Option<ReconnectOverrides>,
    auto_activate_tenants: Option<bool>,
    tenants: Option<Vec<String>>,
    alert_rules: Option<Vec<AlertRule>>,
}

fn config_file_path() -> PathBuf {
    if let Ok(path) = env::var("TRACEPULSE_CONFIG") {
        return PathBuf::from(path);
    }

    let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
    let config_home = env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(home).join(".config"));
    config_home.join("tracepulse/config.toml")
}

fn load_file_overrides(path: &PathBuf) -> Result<Option<ConfigOverrides>> {
    if !path.exists() {
        return Ok(None);
    }

    let raw = fs::read_to_string(path)
        .map_err(|e| TracepulseError::Config(format!("failed reading {}: {e}", path.display())))?;
    parse_file_overrides(&raw)
        .map(Some)
        .map_err(|e| TracepulseError::Config(format!("failed parsing {}: {e}", path.display())))
}

fn parse_file_overrides(raw: &str) -> std::result::Result<ConfigOverrides, toml::de::Error> {
    toml::from_str(raw)
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(v) => v
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| TracepulseError::Config(format!("bad {key} in environment: {e}"))),
        Err(_) => Ok(None),
    }
}

fn load_env_overrides() -> Result<ConfigOverrides> {
    let reconnect_strategy = match env::var("TRACEPULSE_RECONNECT_STRATEGY") {
        Ok(v) => Some(parse_strategy(&v)?),
        Err(_) => None,
    };
    let reconnect = ReconnectOverrides {
        strategy: reconnect_strategy,
        initial_delay: env::var("TRACEPULSE_RECONNECT_INITIAL_DELAY").ok(),
        max_delay: env::var("TRACEPULSE_RECONNECT_MAX_DELAY").ok(),
        multiplier: env_parse("TRACEPULSE_RECONNECT_MULTIPLIER")?,
        jitter: env_parse("TRACEPULSE_RECONNECT_JITTER")?,
    };

    Ok(ConfigOverrides {
        ingest_http_addr: env::var("TRACEPULSE_INGEST_HTTP_ADDR").ok(),
        ingest_grpc_addr: env::var("TRACEPULSE_INGEST_GRPC_ADDR").ok(),
        query_http_addr: env::var("TRACEPULSE_QUERY_HTTP_ADDR").ok(),
        queue_capacity: env_parse("TRACEPULSE_QUEUE_CAPACITY")?,
        tick_interval: env::var("TRACEPULSE_TICK_INTERVAL").ok(),
        tick_budget: None,
        trace_idle_timeout: env::var("TRACEPULSE_TRACE_IDLE_TIMEOUT").ok(),
        trace_retention: env_parse("TRACEPULSE_TRACE_RETENTION")?,
        bucket_width: None,
        window_buckets: None,
        top_endpoints: None,
        service_map_interval: env::var("TRACEPULSE_SERVICE_MAP_INTERVAL").ok(),
        service_map_lookback: None,
        service_map_top_operations: None,
        alert_history: None,
        heartbeat_interval: env::var("TRACEPULSE_HEARTBEAT_INTERVAL").ok(),
        idle_timeout: env::var("TRACEPULSE_IDLE_TIMEOUT").ok(),
        subscriber_outbox: env_parse("TRACEPULSE_SUBSCRIBER_OUTBOX")?,
        reconnect: Some(reconnect),
        auto_activate_tenants: env_parse("TRACEPULSE_AUTO_ACTIVATE_TENANTS")?,
        tenants: env::var("TRACEPULSE_TENANTS").ok().map(|v| parse_list(&v)),
        alert_rules: None,
    })
}

fn parse_strategy(raw: &str) -> Result<BackoffStrategy> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "fixed" => Ok(BackoffStrategy::Fixed),
        "exponential" | "exp" => Ok(BackoffStrategy::Exponential),
        other => Err(TracepulseError::Config(format!(
            "unknown reconnect strategy: {other}"
        ))),
    }
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn parse_duration_field(value: &str, field: &str, source: &str) -> Result<Duration> {
    humantime::parse_duration(value).map_err(|e| {
        TracepulseError::Config(format!("bad {field} in {source}: {e} (value={value})"))
    })
}

fn apply_overrides(cfg: &mut Config, overrides: ConfigOverrides, source: &str) -> Result<()> {
    if let Some(v) = overrides.ingest_http_addr {
        cfg.ingest_http_addr = v;
    }
    if let Some(v) = overrides.ingest_grpc_addr {
        cfg.ingest_grpc_addr = v;
    }
    if let Some(v) = overrides.query_http_addr {
        cfg.query_http_addr = v;
    }
    if let Some(v) = overrides.queue_capacity {
        cfg.queue_capacity = v;
    }
    if let Some(v) = overrides.tick_interval {
        cfg.tick_interval = parse_duration_field(&v, "tick_interval", source)?;
    }
    if let Some(v) = overrides.tick_budget {
        cfg.tick_budget = parse_duration_field(&v, "tick_budget", source)?;
    }
    if let Some(v) = overrides.trace_idle_timeout {
        cfg.trace_idle_timeout = parse_duration_field(&v, "trace_idle_timeout", source)?;
    }
    if let Some(v) = overrides.trace_retention {
        cfg.trace_retention = v;
    }
    if let Some(v) = overrides.bucket_width {
        cfg.bucket_width = parse_duration_field(&v, "bucket_width", source)?;
    }
    if let Some(v) = overrides.window_buckets {
        cfg.window_buckets = v;
    }
    if let Some(v) = overrides.top_endpoints {
        cfg.top_endpoints = v;
    }
    if let Some(v) = overrides.service_map_interval {
        cfg.service_map_interval = parse_duration_field(&v, "service_map_interval", source)?;
    }
    if let Some(v) = overrides.service_map_lookback {
        cfg.service_map_lookback = parse_duration_field(&v, "service_map_lookback", source)?;
    }
    if let Some(v) = overrides.service_map_top_operations {
        cfg.service_map_top_operations = v;
    }
    if let Some(v) = overrides.alert_history {
        cfg.alert_history = v;
    }
    if let Some(v) = overrides.heartbeat_interval {
        cfg.heartbeat_interval = parse_duration_field(&v, "heartbeat_interval", source)?;
    }
    if let Some(v) = overrides.idle_timeout {
        cfg.idle_timeout = parse_duration_field(&v, "idle_timeout", source)?;
    }
    if let Some(v) = overrides.subscriber_outbox {
        cfg.subscriber_outbox = v;
    }
    if let Some(r) = overrides.reconnect {
        if let Some(v) = r.strategy {
            cfg.reconnect.strategy = v;
        }
        if let Some(v) = r.initial_delay {
            cfg.reconnect.initial_delay_ms =
                parse_duration_field(&v, "reconnect.initial_delay", source)?.as_millis() as u64;
        }
        if let Some(v) = r.max_delay {
            cfg.reconnect.max_delay_ms =
                parse_duration_field(&v, "reconnect.max_delay", source)?.as_millis() as u64;
        }
        if let Some(v) = r.multiplier {
            cfg.reconnect.multiplier = v;
        }
        if let Some(v) = r.jitter {
            cfg.reconnect.jitter = v;
        }
    }
    if let Some(v) = overrides.auto_activate_tenants {
        cfg.auto_activate_tenants = v;
    }
    if let Some(v) = overrides.tenants {
        cfg.tenants = v;
    }
    if let Some(v) = overrides.alert_rules {
        cfg.alert_rules = v;
    }
    Ok(())
}
