//! Immutable runtime configuration.
//!
//! A [`WeftConfig`] is built once at startup (from defaults, a builder chain
//! or an in-memory TOML document) and passed by reference into the
//! orchestrator and the stores. Nothing in the core looks configuration up
//! from global state.
//!
//! Durations are written in human-readable form (`"5m"`, `"250ms"`).

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ConfigError;
use crate::types::TopicPattern;

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;
const GIB: u64 = 1024 * MIB;

/// Top-level configuration value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WeftConfig {
    pub communication: CommunicationConfig,
    pub shared_memory: SharedMemoryConfig,
    pub bus: BusConfig,
    pub orchestrator: OrchestratorConfig,
}

impl WeftConfig {
    /// Parse a TOML document and validate it.
    pub fn from_toml_str(document: &str) -> Result<Self, ConfigError> {
        let config: WeftConfig =
            toml::from_str(document).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check every section for unusable values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.communication.validate()?;
        self.shared_memory.validate()?;
        self.bus.validate()?;
        self.orchestrator.validate()?;
        Ok(())
    }
}

// ============================================================================
// Communication (reference store)
// ============================================================================

/// Garbage collection strategy of the reference store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum GcStrategy {
    /// Remove entries whose reference count reached zero.
    #[default]
    RefCounting,
    /// Remove entries past their expiry, regardless of count.
    Ttl,
    /// Never remove automatically; callers delete explicitly.
    Manual,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoPromoteConfig {
    pub enabled: bool,
    pub threshold_bytes: u64,
}

impl Default for AutoPromoteConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            threshold_bytes: 10 * KIB,
        }
    }
}

/// Message types pinned to a tier regardless of size.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TierPolicyConfig {
    pub always_reference: Vec<String>,
    pub always_value: Vec<String>,
}

impl Default for TierPolicyConfig {
    fn default() -> Self {
        Self {
            always_reference: vec![
                "session_state".to_string(),
                "workflow_context".to_string(),
                "collaboration_state".to_string(),
            ],
            always_value: vec!["control".to_string(), "pattern_ref".to_string()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GcConfig {
    pub strategy: GcStrategy,
    #[serde(with = "duration_str")]
    pub interval: Duration,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            strategy: GcStrategy::RefCounting,
            interval: Duration::from_secs(300),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CommunicationConfig {
    pub auto_promote: AutoPromoteConfig,
    pub policies: TierPolicyConfig,
    pub gc: GcConfig,
    /// Expiry applied to references stored without an explicit TTL.
    #[serde(with = "option_duration_str")]
    pub default_ttl: Option<Duration>,
    /// How many collected reference ids are remembered to tell
    /// "collected" apart from "never existed".
    pub tombstone_capacity: usize,
}

impl Default for CommunicationConfig {
    fn default() -> Self {
        Self {
            auto_promote: AutoPromoteConfig::default(),
            policies: TierPolicyConfig::default(),
            gc: GcConfig::default(),
            default_ttl: Some(Duration::from_secs(3600)),
            tombstone_capacity: 10_000,
        }
    }
}

impl CommunicationConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.auto_promote.enabled && self.auto_promote.threshold_bytes == 0 {
            return Err(ConfigError::invalid(
                "communication.auto_promote.threshold_bytes",
                "must be greater than zero when auto promotion is enabled",
            ));
        }
        if self.gc.strategy != GcStrategy::Manual && self.gc.interval.is_zero() {
            return Err(ConfigError::invalid(
                "communication.gc.interval",
                "must be greater than zero",
            ));
        }
        if let Some(overlap) = self
            .policies
            .always_reference
            .iter()
            .find(|t| self.policies.always_value.contains(t))
        {
            return Err(ConfigError::invalid(
                "communication.policies",
                format!("message type '{overlap}' is listed as both always_reference and always_value"),
            ));
        }
        if self.tombstone_capacity == 0 {
            return Err(ConfigError::invalid(
                "communication.tombstone_capacity",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Shared memory
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OverflowConfig {
    pub enabled: bool,
    pub directory: PathBuf,
    pub max_disk_bytes: u64,
}

impl Default for OverflowConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            directory: std::env::temp_dir().join("weft-overflow"),
            max_disk_bytes: 10 * GIB,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SharedMemoryConfig {
    pub max_memory_bytes: u64,
    /// Payloads at or above this size belong in shared memory rather than
    /// inline in messages.
    pub threshold_bytes: u64,
    pub compression_threshold: u64,
    #[serde(with = "duration_str")]
    pub ttl: Duration,
    #[serde(with = "duration_str")]
    pub sweep_interval: Duration,
    pub overflow: OverflowConfig,
}

impl Default for SharedMemoryConfig {
    fn default() -> Self {
        Self {
            max_memory_bytes: GIB,
            threshold_bytes: 2560,
            compression_threshold: MIB,
            ttl: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(60),
            overflow: OverflowConfig::default(),
        }
    }
}

impl SharedMemoryConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_memory_bytes == 0 {
            return Err(ConfigError::invalid(
                "shared_memory.max_memory_bytes",
                "must be greater than zero",
            ));
        }
        if self.sweep_interval.is_zero() {
            return Err(ConfigError::invalid(
                "shared_memory.sweep_interval",
                "must be greater than zero",
            ));
        }
        if self.overflow.enabled && self.overflow.max_disk_bytes == 0 {
            return Err(ConfigError::invalid(
                "shared_memory.overflow.max_disk_bytes",
                "must be greater than zero when overflow is enabled",
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Message bus
// ============================================================================

/// Send behaviour for one class of topics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TopicClassPolicy {
    /// How long a publish may wait on a full subscriber queue.
    #[serde(with = "duration_str")]
    pub send_timeout: Duration,
}

impl Default for TopicClassPolicy {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_millis(100),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeadLetterConfig {
    pub enabled: bool,
    pub max_size: usize,
    #[serde(with = "duration_str")]
    pub ttl: Duration,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size: 1000,
            ttl: Duration::from_secs(3600),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    /// Per-subscriber delivery queue capacity.
    pub buffer_size: usize,
    /// Glob patterns of topics whose publishes must not be dropped.
    pub critical_topics: Vec<String>,
    pub critical: TopicClassPolicy,
    pub non_critical: TopicClassPolicy,
    /// Redeliveries after a negative acknowledgement before dead-lettering.
    pub max_redeliveries: u32,
    pub dead_letter: DeadLetterConfig,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            buffer_size: 100,
            critical_topics: vec!["workflow.restart*".to_string(), "*.restart".to_string()],
            critical: TopicClassPolicy {
                send_timeout: Duration::from_secs(5),
            },
            non_critical: TopicClassPolicy::default(),
            max_redeliveries: 3,
            dead_letter: DeadLetterConfig::default(),
        }
    }
}

impl BusConfig {
    /// Compile the critical topic patterns.
    pub fn critical_patterns(&self) -> Result<Vec<TopicPattern>, ConfigError> {
        self.critical_topics
            .iter()
            .map(|raw| {
                TopicPattern::parse(raw).map_err(|source| ConfigError::Identifier {
                    field: "bus.critical_topics".to_string(),
                    source,
                })
            })
            .collect()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.buffer_size == 0 {
            return Err(ConfigError::invalid(
                "bus.buffer_size",
                "must be greater than zero",
            ));
        }
        self.critical_patterns()?;
        Ok(())
    }
}

// ============================================================================
// Orchestrator
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Capacity of the limiter shared by every agent invocation.
    pub max_concurrent_invocations: usize,
    /// Upper bound on a whole run; `None` waits indefinitely.
    #[serde(with = "option_duration_str")]
    pub run_timeout: Option<Duration>,
    /// How long an iterative run waits for a restart signal between iterations.
    #[serde(with = "duration_str")]
    pub restart_wait: Duration,
    /// Inject communication tools into agents at registration.
    pub tool_injection: bool,
    pub progress_buffer: usize,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_concurrent_invocations: 2,
            run_timeout: None,
            restart_wait: Duration::from_secs(2),
            tool_injection: true,
            progress_buffer: 256,
        }
    }
}

impl OrchestratorConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_concurrent_invocations == 0 {
            return Err(ConfigError::invalid(
                "orchestrator.max_concurrent_invocations",
                "must be greater than zero",
            ));
        }
        if self.progress_buffer == 0 {
            return Err(ConfigError::invalid(
                "orchestrator.progress_buffer",
                "must be greater than zero",
            ));
        }
        Ok(())
    }
}

// ============================================================================
// Human-readable durations
// ============================================================================

mod duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}

mod option_duration_str {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(d) => serializer.serialize_str(&humantime::format_duration(*d).to_string()),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = Option::<String>::deserialize(deserializer)?;
        match s.as_deref() {
            None | Some("") | Some("none") => Ok(None),
            Some(raw) => humantime::parse_duration(raw)
                .map(Some)
                .map_err(serde::de::Error::custom),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = WeftConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.communication.auto_promote.threshold_bytes, 10240);
        assert_eq!(config.communication.gc.strategy, GcStrategy::RefCounting);
        assert_eq!(config.shared_memory.threshold_bytes, 2560);
        assert_eq!(config.bus.buffer_size, 100);
        assert_eq!(config.orchestrator.max_concurrent_invocations, 2);
    }

    #[test]
    fn test_from_toml_with_durations() {
        let config = WeftConfig::from_toml_str(
            r#"
            [communication.gc]
            strategy = "ttl"
            interval = "30s"

            [bus.critical]
            send_timeout = "250ms"

            [orchestrator]
            max_concurrent_invocations = 4
            run_timeout = "2m"
            "#,
        )
        .unwrap();

        assert_eq!(config.communication.gc.strategy, GcStrategy::Ttl);
        assert_eq!(config.communication.gc.interval, Duration::from_secs(30));
        assert_eq!(config.bus.critical.send_timeout, Duration::from_millis(250));
        assert_eq!(config.orchestrator.max_concurrent_invocations, 4);
        assert_eq!(
            config.orchestrator.run_timeout,
            Some(Duration::from_secs(120))
        );
        // untouched sections keep their defaults
        assert_eq!(config.shared_memory, SharedMemoryConfig::default());
    }

    #[test]
    fn test_rejects_zero_limiter() {
        let err = WeftConfig::from_toml_str("[orchestrator]\nmax_concurrent_invocations = 0\n")
            .unwrap_err();
        assert!(err.to_string().contains("max_concurrent_invocations"));
    }

    #[test]
    fn test_rejects_overlapping_policies() {
        let mut config = WeftConfig::default();
        config
            .communication
            .policies
            .always_value
            .push("session_state".to_string());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_critical_pattern() {
        let mut config = WeftConfig::default();
        config.bus.critical_topics = vec!["bad topic".to_string()];
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Identifier { .. })
        ));
    }

    #[test]
    fn test_invalid_duration_is_parse_error() {
        let err = WeftConfig::from_toml_str("[communication.gc]\ninterval = \"soon\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }
}
