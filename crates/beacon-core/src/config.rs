//! Runtime configuration surface: packager/publisher/session_file/
//! server/auth/limits/send_on_exit groups, plus the ambient `logging` group.
//!
//! Durations accept either a humantime string (`"30s"`) or a plain integer
//! count of milliseconds, matching the rest of the ambient config surface.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub(crate) fn deserialize_duration<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum DurationHelper {
        String(String),
        U64(u64),
    }

    match DurationHelper::deserialize(deserializer)? {
        DurationHelper::String(s) => humantime::parse_duration(&s)
            .map_err(|e| serde::de::Error::custom(format!("invalid duration: {e}"))),
        DurationHelper::U64(ms) => Ok(Duration::from_millis(ms)),
    }
}

pub(crate) fn serialize_duration<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    serializer.serialize_u64(duration.as_millis() as u64)
}

/// Application/product identity and the directory the host application
/// writes its own artifacts into.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackagerConfig {
    pub application_name: String,
    pub product_name: String,
    #[serde(default)]
    pub hot_application_directory: Option<String>,
}

/// Publisher queueing and backpressure knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PublisherConfig {
    #[serde(default = "default_queue_soft_cap")]
    pub queue_soft_cap: usize,
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration",
        default = "default_backpressure_deadline"
    )]
    pub backpressure_deadline: Duration,
    #[serde(default)]
    pub force_synchronous: bool,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            queue_soft_cap: default_queue_soft_cap(),
            backpressure_deadline: default_backpressure_deadline(),
            force_synchronous: false,
        }
    }
}

fn default_queue_soft_cap() -> usize {
    10_000
}

fn default_backpressure_deadline() -> Duration {
    Duration::from_millis(500)
}

/// Session file roll-over and flush knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionFileConfig {
    pub root_dir: String,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration",
        default = "default_max_file_age"
    )]
    pub max_file_age: Duration,
    #[serde(default = "default_max_records_per_file")]
    pub max_records_per_file: u64,
    #[serde(
        deserialize_with = "deserialize_duration",
        serialize_with = "serialize_duration",
        default = "default_flush_interval"
    )]
    pub flush_interval: Duration,
}

fn default_max_file_bytes() -> u64 {
    20 * 1024 * 1024
}

fn default_max_file_age() -> Duration {
    Duration::from_secs(24 * 60 * 60)
}

fn default_max_records_per_file() -> u64 {
    100_000
}

fn default_flush_interval() -> Duration {
    Duration::from_secs(5)
}

/// Remote hub selection: either a hosted-service customer name or a fully
/// specified (host, port, tls, base path, repository) tuple.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServerConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub use_hosted_service: bool,
    #[serde(default)]
    pub customer_name: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
    #[serde(default)]
    pub port: Option<u16>,
    #[serde(default)]
    pub tls: Option<bool>,
    #[serde(default)]
    pub base_path: Option<String>,
    #[serde(default)]
    pub repository: Option<String>,
}

/// Pluggable authentication selection.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "provider", rename_all = "snake_case")]
pub enum AuthConfig {
    None,
    Basic { user: String, password: String },
    Custom,
}

impl Default for AuthConfig {
    fn default() -> Self {
        AuthConfig::None
    }
}

/// Disk quota and upload concurrency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitsConfig {
    #[serde(default = "default_disk_cap_bytes")]
    pub disk_cap_bytes: u64,
    #[serde(default = "default_concurrent_uploads")]
    pub concurrent_uploads: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            disk_cap_bytes: default_disk_cap_bytes(),
            concurrent_uploads: default_concurrent_uploads(),
        }
    }
}

fn default_disk_cap_bytes() -> u64 {
    1024 * 1024 * 1024
}

fn default_concurrent_uploads() -> usize {
    2
}

/// Verbosity of the agent's own internal diagnostic channel,
/// independent of the host application's logging.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LoggingConfig {
    #[serde(default)]
    pub verbose: bool,
}

/// Top-level runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    pub packager: PackagerConfig,
    #[serde(default)]
    pub publisher: PublisherConfig,
    pub session_file: SessionFileConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub limits: LimitsConfig,
    #[serde(default)]
    pub send_on_exit: bool,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_json() -> &'static str {
        r#"{
            "packager": {"application_name": "widget", "product_name": "acme"},
            "session_file": {"root_dir": "/tmp/beacon"}
        }"#
    }

    #[test]
    fn minimal_config_fills_in_defaults() {
        let config: AgentConfig = serde_json::from_str(minimal_json()).unwrap();
        assert_eq!(config.publisher.queue_soft_cap, 10_000);
        assert_eq!(config.session_file.max_file_bytes, 20 * 1024 * 1024);
        assert!(!config.send_on_exit);
        assert!(matches!(config.auth, AuthConfig::None));
    }

    #[test]
    fn duration_accepts_humantime_string_and_millis() {
        let json = r#"{
            "packager": {"application_name": "widget", "product_name": "acme"},
            "session_file": {"root_dir": "/tmp/beacon", "flush_interval": "10s"}
        }"#;
        let config: AgentConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.session_file.flush_interval, Duration::from_secs(10));

        let json_millis = r#"{
            "packager": {"application_name": "widget", "product_name": "acme"},
            "session_file": {"root_dir": "/tmp/beacon", "flush_interval": 2500}
        }"#;
        let config: AgentConfig = serde_json::from_str(json_millis).unwrap();
        assert_eq!(config.session_file.flush_interval, Duration::from_millis(2500));
    }

    #[test]
    fn basic_auth_round_trips() {
        let json = r#"{
            "packager": {"application_name": "widget", "product_name": "acme"},
            "session_file": {"root_dir": "/tmp/beacon"},
            "auth": {"provider": "basic", "user": "bot", "password": "secret"}
        }"#;
        let config: AgentConfig = serde_json::from_str(json).unwrap();
        assert!(matches!(config.auth, AuthConfig::Basic { .. }));
    }
}
