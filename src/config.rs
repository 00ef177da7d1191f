//! Gateway configuration.
//!
//! Configuration is loaded once at startup from YAML, overlaid with
//! `LANEGATE_*` environment variables, validated, and published through a
//! [`ConfigHandle`]. Readers always see a complete snapshot; a reload swaps
//! the whole snapshot atomically.
//!
//! # Example
//!
//! ```yaml
//! model_revision: main
//! breaker_scope: per_lane
//! plans:
//!   pro: priority
//!   free: free
//! lanes:
//!   priority:
//!     max_concurrent: 2
//!     rate_limit_per_minute: 120
//!     queue_depth_limit: 8
//!     watermark_required: false
//!     cache_ttl: 24h
//!   free:
//!     max_concurrent: 1
//!     rate_limit_per_minute: 30
//!     queue_depth_limit: 4
//!     watermark_required: true
//!     cache_ttl: 24h
//! ```

use crate::lane::Lane;
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "LANEGATE_";

// ============================================================================
// Errors
// ============================================================================

/// Configuration loading and validation errors.
#[derive(Debug, Error, Clone)]
pub enum ConfigError {
    /// Config file could not be read
    #[error("Failed to read config file {path}: {details}")]
    Io {
        /// Path that failed
        path: String,
        /// Underlying I/O error text
        details: String,
    },

    /// Config file is not valid YAML for this schema
    #[error("Config parse error: {details}")]
    Parse {
        /// Parser message
        details: String,
    },

    /// A value parsed but violates a constraint
    #[error("Invalid config value for {field}: {reason}")]
    Invalid {
        /// Dotted path of the offending field
        field: String,
        /// Why it was rejected
        reason: String,
    },
}

impl ConfigError {
    pub(crate) fn invalid(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.into(),
            reason: reason.into(),
        }
    }
}

// ============================================================================
// Durations
// ============================================================================

/// Serde adapter for human-readable durations (`"30s"`, `"10m"`, `"24h"`).
pub mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        humantime::parse_duration(raw.trim()).map_err(serde::de::Error::custom)
    }

    /// Same format for optional fields.
    pub mod option {
        use serde::{Deserialize, Deserializer};
        use std::time::Duration;

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<Duration>, D::Error> {
            Option::<String>::deserialize(deserializer)?
                .map(|raw| humantime::parse_duration(raw.trim()).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}

// ============================================================================
// Lane configuration
// ============================================================================

/// Per-lane capacity and policy. Immutable for the life of a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LaneConfig {
    /// Maximum concurrent backend calls
    pub max_concurrent: usize,
    /// Token bucket capacity and per-minute refill
    pub rate_limit_per_minute: u32,
    /// Waiters allowed once every slot is busy
    pub queue_depth_limit: usize,
    /// Output must carry the watermark, regardless of request flags
    pub watermark_required: bool,
    /// Lifetime of cached artifacts
    #[serde(with = "duration_str")]
    pub cache_ttl: Duration,
    /// Consecutive failures that open the breaker
    pub breaker_failure_threshold: u32,
    /// First open-state cool-down
    #[serde(with = "duration_str")]
    pub breaker_cooldown: Duration,
    /// Upper bound for the doubling cool-down
    #[serde(with = "duration_str")]
    pub breaker_max_cooldown: Duration,
    /// Number of recent calls in the failure-rate window
    pub breaker_window: usize,
    /// Failure fraction over a full window that opens the breaker
    pub breaker_failure_ratio: f64,
    /// Longest a request may wait in the lane queue
    #[serde(with = "duration_str")]
    pub max_queue_wait: Duration,
    /// Local timeout for one backend call
    #[serde(with = "duration_str")]
    pub backend_timeout: Duration,
    /// Service time assumed before any call has completed
    #[serde(with = "duration_str")]
    pub initial_service_time: Duration,
}

impl LaneConfig {
    /// Defaults for paying traffic.
    pub fn priority() -> Self {
        Self {
            max_concurrent: 2,
            rate_limit_per_minute: 120,
            queue_depth_limit: 16,
            watermark_required: false,
            cache_ttl: Duration::from_secs(24 * 60 * 60),
            breaker_failure_threshold: 5,
            breaker_cooldown: Duration::from_secs(30),
            breaker_max_cooldown: Duration::from_secs(5 * 60),
            breaker_window: 20,
            breaker_failure_ratio: 0.5,
            max_queue_wait: Duration::from_secs(30),
            backend_timeout: Duration::from_secs(60),
            initial_service_time: Duration::from_secs(2),
        }
    }

    /// Defaults for free-tier traffic.
    pub fn free() -> Self {
        Self {
            max_concurrent: 1,
            rate_limit_per_minute: 30,
            queue_depth_limit: 8,
            watermark_required: true,
            max_queue_wait: Duration::from_secs(20),
            ..Self::priority()
        }
    }

    fn validate(&self, lane: Lane) -> Result<(), ConfigError> {
        let field = |name: &str| format!("lanes.{lane}.{name}");

        if self.max_concurrent == 0 {
            return Err(ConfigError::invalid(field("max_concurrent"), "must be > 0"));
        }
        if self.rate_limit_per_minute == 0 {
            return Err(ConfigError::invalid(
                field("rate_limit_per_minute"),
                "must be > 0",
            ));
        }
        if self.breaker_failure_threshold == 0 {
            return Err(ConfigError::invalid(
                field("breaker_failure_threshold"),
                "must be > 0",
            ));
        }
        if self.breaker_window == 0 {
            return Err(ConfigError::invalid(field("breaker_window"), "must be > 0"));
        }
        if !(self.breaker_failure_ratio > 0.0 && self.breaker_failure_ratio <= 1.0) {
            return Err(ConfigError::invalid(
                field("breaker_failure_ratio"),
                "must be in (0, 1]",
            ));
        }
        if self.breaker_cooldown.is_zero() {
            return Err(ConfigError::invalid(field("breaker_cooldown"), "must be > 0"));
        }
        if self.breaker_cooldown > self.breaker_max_cooldown {
            return Err(ConfigError::invalid(
                field("breaker_max_cooldown"),
                "must be >= breaker_cooldown",
            ));
        }
        if self.backend_timeout.is_zero() {
            return Err(ConfigError::invalid(field("backend_timeout"), "must be > 0"));
        }
        Ok(())
    }
}

/// Partial lane block as written in YAML.
///
/// Omitted fields fall back to the defaults of the lane being configured, so
/// a `free` block that leaves out `watermark_required` stays watermarked.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct LaneOverrides {
    max_concurrent: Option<usize>,
    rate_limit_per_minute: Option<u32>,
    queue_depth_limit: Option<usize>,
    watermark_required: Option<bool>,
    #[serde(with = "duration_str::option")]
    cache_ttl: Option<Duration>,
    breaker_failure_threshold: Option<u32>,
    #[serde(with = "duration_str::option")]
    breaker_cooldown: Option<Duration>,
    #[serde(with = "duration_str::option")]
    breaker_max_cooldown: Option<Duration>,
    breaker_window: Option<usize>,
    breaker_failure_ratio: Option<f64>,
    #[serde(with = "duration_str::option")]
    max_queue_wait: Option<Duration>,
    #[serde(with = "duration_str::option")]
    backend_timeout: Option<Duration>,
    #[serde(with = "duration_str::option")]
    initial_service_time: Option<Duration>,
}

impl LaneOverrides {
    fn apply(self, base: LaneConfig) -> LaneConfig {
        LaneConfig {
            max_concurrent: self.max_concurrent.unwrap_or(base.max_concurrent),
            rate_limit_per_minute: self
                .rate_limit_per_minute
                .unwrap_or(base.rate_limit_per_minute),
            queue_depth_limit: self.queue_depth_limit.unwrap_or(base.queue_depth_limit),
            watermark_required: self.watermark_required.unwrap_or(base.watermark_required),
            cache_ttl: self.cache_ttl.unwrap_or(base.cache_ttl),
            breaker_failure_threshold: self
                .breaker_failure_threshold
                .unwrap_or(base.breaker_failure_threshold),
            breaker_cooldown: self.breaker_cooldown.unwrap_or(base.breaker_cooldown),
            breaker_max_cooldown: self
                .breaker_max_cooldown
                .unwrap_or(base.breaker_max_cooldown),
            breaker_window: self.breaker_window.unwrap_or(base.breaker_window),
            breaker_failure_ratio: self
                .breaker_failure_ratio
                .unwrap_or(base.breaker_failure_ratio),
            max_queue_wait: self.max_queue_wait.unwrap_or(base.max_queue_wait),
            backend_timeout: self.backend_timeout.unwrap_or(base.backend_timeout),
            initial_service_time: self
                .initial_service_time
                .unwrap_or(base.initial_service_time),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawLaneTable {
    priority: LaneOverrides,
    free: LaneOverrides,
}

impl From<RawLaneTable> for LaneTable {
    fn from(raw: RawLaneTable) -> Self {
        Self {
            priority: raw.priority.apply(LaneConfig::priority()),
            free: raw.free.apply(LaneConfig::free()),
        }
    }
}

/// Exactly one [`LaneConfig`] per [`Lane`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawLaneTable")]
pub struct LaneTable {
    /// Paying traffic
    pub priority: LaneConfig,
    /// Free-tier traffic
    pub free: LaneConfig,
}

impl Default for LaneTable {
    fn default() -> Self {
        Self {
            priority: LaneConfig::priority(),
            free: LaneConfig::free(),
        }
    }
}

impl LaneTable {
    /// Configuration for `lane`.
    pub fn get(&self, lane: Lane) -> &LaneConfig {
        match lane {
            Lane::Priority => &self.priority,
            Lane::Free => &self.free,
        }
    }
}

// ============================================================================
// Gateway configuration
// ============================================================================

/// Whether lanes get independent circuit breakers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerScope {
    /// Each lane trips independently (isolated backend instances).
    #[default]
    PerLane,
    /// One breaker for the whole process (lanes share one physical GPU).
    /// The priority lane's thresholds are used.
    Shared,
}

impl std::str::FromStr for BreakerScope {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "per_lane" | "per-lane" => Ok(BreakerScope::PerLane),
            "shared" => Ok(BreakerScope::Shared),
            other => Err(ConfigError::invalid(
                "breaker_scope",
                format!("expected per_lane or shared, got {other:?}"),
            )),
        }
    }
}

/// Complete configuration snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct GatewayConfig {
    /// Per-lane capacity and policy
    pub lanes: LaneTable,
    /// Plan tag (lowercase) to lane
    pub plans: BTreeMap<String, Lane>,
    /// Model revision folded into every cache key
    pub model_revision: String,
    /// Output format version folded into every cache key
    pub format_version: u32,
    /// Longest accepted text, in characters
    pub max_text_chars: usize,
    /// Texts at least this long get the shorter TTL below
    pub long_text_threshold_chars: usize,
    /// TTL cap for long texts
    #[serde(with = "duration_str")]
    pub long_text_max_ttl: Duration,
    /// Maximum cached artifacts (LRU beyond this)
    pub cache_capacity: usize,
    /// Idle time after which a rate-limit bucket is dropped
    #[serde(with = "duration_str")]
    pub rate_limit_idle_ttl: Duration,
    /// Period of the bucket/cache sweep task
    #[serde(with = "duration_str")]
    pub maintenance_interval: Duration,
    /// Breaker sharing policy
    pub breaker_scope: BreakerScope,
    /// Upstream synthesis endpoint used by the HTTP backend
    pub backend_url: String,
    /// Bind address for the HTTP surface
    pub listen_addr: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        let plans = [
            ("pro", Lane::Priority),
            ("biz", Lane::Priority),
            ("priority", Lane::Priority),
            ("free", Lane::Free),
        ]
        .into_iter()
        .map(|(tag, lane)| (tag.to_string(), lane))
        .collect();

        Self {
            lanes: LaneTable::default(),
            plans,
            model_revision: "main".to_string(),
            format_version: 1,
            max_text_chars: 800,
            long_text_threshold_chars: 200,
            long_text_max_ttl: Duration::from_secs(2 * 60 * 60),
            cache_capacity: 4096,
            rate_limit_idle_ttl: Duration::from_secs(10 * 60),
            maintenance_interval: Duration::from_secs(60),
            breaker_scope: BreakerScope::PerLane,
            backend_url: "http://127.0.0.1:8090/synthesize".to_string(),
            listen_addr: "0.0.0.0:8000".to_string(),
        }
    }
}

impl GatewayConfig {
    /// Parse a YAML document. Missing fields take their defaults.
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let mut config: GatewayConfig =
            serde_yml::from_str(yaml).map_err(|e| ConfigError::Parse {
                details: e.to_string(),
            })?;
        config.normalize();
        Ok(config)
    }

    /// Load from an optional YAML file, apply environment overrides and
    /// validate.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
                    path: path.display().to_string(),
                    details: e.to_string(),
                })?;
                Self::from_yaml_str(&raw)?
            }
            None => Self::default(),
        };
        config.apply_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Overlay process-level fields from a variable lookup.
    ///
    /// Recognized: `LANEGATE_MODEL_REVISION`, `LANEGATE_MAX_TEXT_CHARS`,
    /// `LANEGATE_BACKEND_URL`, `LANEGATE_LISTEN_ADDR`,
    /// `LANEGATE_BREAKER_SCOPE`, `LANEGATE_CACHE_CAPACITY`.
    pub fn apply_overrides(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        let var = |name: &str| lookup(&format!("{ENV_PREFIX}{name}"));

        if let Some(rev) = var("MODEL_REVISION") {
            self.model_revision = rev;
        }
        if let Some(raw) = var("MAX_TEXT_CHARS") {
            self.max_text_chars = raw.trim().parse().map_err(|_| {
                ConfigError::invalid("max_text_chars", format!("not an integer: {raw:?}"))
            })?;
        }
        if let Some(raw) = var("CACHE_CAPACITY") {
            self.cache_capacity = raw.trim().parse().map_err(|_| {
                ConfigError::invalid("cache_capacity", format!("not an integer: {raw:?}"))
            })?;
        }
        if let Some(url) = var("BACKEND_URL") {
            self.backend_url = url;
        }
        if let Some(addr) = var("LISTEN_ADDR") {
            self.listen_addr = addr;
        }
        if let Some(raw) = var("BREAKER_SCOPE") {
            self.breaker_scope = raw.parse()?;
        }
        Ok(())
    }

    /// Check cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for lane in Lane::ALL {
            self.lanes.get(lane).validate(lane)?;
        }
        if self.model_revision.trim().is_empty() {
            return Err(ConfigError::invalid("model_revision", "must not be empty"));
        }
        if self.max_text_chars == 0 {
            return Err(ConfigError::invalid("max_text_chars", "must be > 0"));
        }
        if self.cache_capacity == 0 {
            return Err(ConfigError::invalid("cache_capacity", "must be > 0"));
        }
        if self.maintenance_interval.is_zero() {
            return Err(ConfigError::invalid("maintenance_interval", "must be > 0"));
        }
        if self.plans.is_empty() {
            return Err(ConfigError::invalid("plans", "at least one plan is required"));
        }
        if let Some(tag) = self.plans.keys().find(|tag| tag.trim().is_empty()) {
            return Err(ConfigError::invalid("plans", format!("empty plan tag {tag:?}")));
        }
        url::Url::parse(&self.backend_url)
            .map_err(|e| ConfigError::invalid("backend_url", e.to_string()))?;
        Ok(())
    }

    /// Plan tags are matched case-insensitively.
    fn normalize(&mut self) {
        self.plans = std::mem::take(&mut self.plans)
            .into_iter()
            .map(|(tag, lane)| (tag.trim().to_ascii_lowercase(), lane))
            .collect();
    }
}

// ============================================================================
// Config handle
// ============================================================================

/// Atomically swappable configuration snapshot.
///
/// Capacity structures (semaphores, breakers, the cache) are sized when the
/// gateway is built; a reload changes routing and per-request policy only.
pub struct ConfigHandle {
    current: ArcSwap<GatewayConfig>,
}

impl ConfigHandle {
    /// Publish an initial snapshot.
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            current: ArcSwap::from_pointee(config),
        }
    }

    /// Current snapshot. Cheap; callers may hold it for a whole request.
    pub fn snapshot(&self) -> Arc<GatewayConfig> {
        self.current.load_full()
    }

    /// Validate and publish a replacement snapshot.
    pub fn reload(&self, config: GatewayConfig) -> Result<(), ConfigError> {
        config.validate()?;
        self.current.store(Arc::new(config));
        tracing::info!("Gateway configuration reloaded");
        Ok(())
    }
}
