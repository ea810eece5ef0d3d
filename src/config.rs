/*!
 * Configuration for courier
 *
 * One optional section per backend plus a `[logging]` section:
 *
 * ```toml
 * [logging]
 * log_level = "info"
 *
 * [amqp]
 * host = "rabbit.internal"
 * exchange = "events"
 * routing_key = "orders.created"
 * max_connections = 8
 * publisher_confirms = true
 *
 * [mqtt]
 * host = "emqx.internal"
 * topic = "sensors/telemetry"
 * header_policy = "drop"
 * ```
 *
 * Every backend section also accepts the shared [`PoolSettings`] keys.
 */

use courier_core_resilience::{
    CircuitBreakerConfig, PipelineConfig, PoolConfig, RateLimiter, RetryPolicy, SizePolicy,
};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Semaphore;

use crate::error::{BrokerError, Result};
use crate::message::Destination;
use crate::transport::BackendKind;

/// Top-level configuration file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CourierConfig {
    pub logging: LoggingConfig,
    pub amqp: Option<AmqpSettings>,
    pub socket: Option<SocketSettings>,
    pub log: Option<LogSettings>,
    pub mqtt: Option<MqttSettings>,
}

impl CourierConfig {
    /// Load and validate configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| {
            BrokerError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml_str(&contents)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let config: CourierConfig = toml::from_str(contents)
            .map_err(|e| BrokerError::Config(format!("invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Render as TOML
    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self)
            .map_err(|e| BrokerError::Config(format!("failed to serialize configuration: {}", e)))
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(amqp) = &self.amqp {
            amqp.validate()?;
        }
        if let Some(socket) = &self.socket {
            socket.validate()?;
        }
        if let Some(log) = &self.log {
            log.validate()?;
        }
        if let Some(mqtt) = &self.mqtt {
            mqtt.validate()?;
        }
        Ok(())
    }

    /// Backends that have a section in this configuration
    pub fn configured_backends(&self) -> Vec<BackendKind> {
        let mut kinds = Vec::new();
        if self.amqp.is_some() {
            kinds.push(BackendKind::Amqp);
        }
        if self.socket.is_some() {
            kinds.push(BackendKind::Socket);
        }
        if self.log.is_some() {
            kinds.push(BackendKind::Log);
        }
        if self.mqtt.is_some() {
            kinds.push(BackendKind::Mqtt);
        }
        kinds
    }
}

/// Process-wide logging output
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub log_level: LogLevel,

    /// Log file path (None = stdout)
    pub log_file: Option<PathBuf>,

    /// Enable verbose logging (shorthand for log_level = debug)
    pub verbose: bool,
}

/// Log level for diagnostic output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    /// Only errors
    Error,

    /// Warnings and errors
    Warn,

    /// Info, warnings, and errors
    #[default]
    Info,

    /// Debug and above
    Debug,

    /// All messages including traces
    Trace,
}

impl LogLevel {
    /// Convert to tracing::Level
    pub fn to_tracing_level(&self) -> tracing::Level {
        match self {
            LogLevel::Error => tracing::Level::ERROR,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Trace => tracing::Level::TRACE,
        }
    }
}

/// How `max_connections` is enforced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum PoolSizePolicy {
    /// Hard cap; callers wait for a free slot up to `acquire_timeout_ms`
    #[default]
    Capped,
    /// Creation is never blocked; the size only bounds the idle set
    Advisory,
}

impl From<PoolSizePolicy> for SizePolicy {
    fn from(policy: PoolSizePolicy) -> Self {
        match policy {
            PoolSizePolicy::Capped => SizePolicy::Capped,
            PoolSizePolicy::Advisory => SizePolicy::Advisory,
        }
    }
}

/// What happens to headers attached to a message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum HeaderPolicy {
    /// Put headers on the wire where the backend supports them
    #[default]
    Forward,
    /// Publish the payload only
    Drop,
}

/// Pool, resilience and throttling keys shared by every backend section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    /// Level at which connection open/close events are logged
    pub log_level: LogLevel,
    pub max_connections: usize,
    /// Total connect or send attempts before giving up (0 behaves like 1)
    pub retry_count: u32,
    pub retry_delay_ms: u64,
    pub acquire_timeout_ms: u64,
    pub size_policy: PoolSizePolicy,
    pub breaker_failure_threshold: u32,
    pub breaker_cooldown_ms: u64,
    pub header_policy: HeaderPolicy,
    /// Publish throttle (0 = unlimited)
    pub max_messages_per_second: u32,
    /// Payloads above this size are logged as a warning (0 = no limit)
    pub max_message_size_kb: u64,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            log_level: LogLevel::Info,
            max_connections: 5,
            retry_count: 3,
            retry_delay_ms: 500,
            acquire_timeout_ms: 30_000,
            size_policy: PoolSizePolicy::Capped,
            breaker_failure_threshold: 5,
            breaker_cooldown_ms: 30_000,
            header_policy: HeaderPolicy::Forward,
            max_messages_per_second: 0,
            max_message_size_kb: 0,
        }
    }
}

impl PoolSettings {
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_size: self.max_connections,
            size_policy: self.size_policy.into(),
            acquire_timeout: Duration::from_millis(self.acquire_timeout_ms),
            ..PoolConfig::default()
        }
    }

    /// Retry and breaker settings, used for both the connect and the publish
    /// pipeline of a backend
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            retry: RetryPolicy::fixed(
                self.retry_count.saturating_sub(1),
                Duration::from_millis(self.retry_delay_ms),
            ),
            breaker: CircuitBreakerConfig {
                failure_threshold: self.breaker_failure_threshold,
                cooldown: Duration::from_millis(self.breaker_cooldown_ms),
            },
        }
    }

    /// Token bucket for publish throttling, if one is configured
    pub fn rate_limiter(&self) -> Result<Option<RateLimiter>> {
        if self.max_messages_per_second == 0 {
            return Ok(None);
        }
        RateLimiter::per_second(self.max_messages_per_second)
            .map(Some)
            .map_err(|e| BrokerError::Config(format!("invalid rate limit: {}", e)))
    }

    /// Size above which a payload triggers a warning
    pub fn max_message_size(&self) -> Option<usize> {
        match self.max_message_size_kb {
            0 => None,
            kb => usize::try_from(kb).ok().and_then(|kb| kb.checked_mul(1024)),
        }
    }

    fn validate(&self, section: &str) -> Result<()> {
        if self.max_connections == 0 {
            return Err(BrokerError::Config(format!(
                "[{}] max_connections must be at least 1",
                section
            )));
        }
        if self.max_connections > Semaphore::MAX_PERMITS {
            return Err(BrokerError::Config(format!(
                "[{}] max_connections must be at most {}",
                section,
                Semaphore::MAX_PERMITS
            )));
        }
        if self.breaker_failure_threshold == 0 {
            return Err(BrokerError::Config(format!(
                "[{}] breaker_failure_threshold must be at least 1",
                section
            )));
        }
        Ok(())
    }
}

/// A secret that never shows up in `Debug` output
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Password(String);

impl Password {
    pub fn new(secret: impl Into<String>) -> Self {
        Password(secret.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Password {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Password(***)")
    }
}

fn require(section: &str, key: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(BrokerError::Config(format!("[{}] {} must not be empty", section, key)));
    }
    Ok(())
}

/// `[amqp]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AmqpSettings {
    pub host: String,
    pub port: u16,
    pub virtual_host: String,
    pub username: String,
    pub password: Password,
    /// Default exchange
    pub exchange: String,
    /// Default routing key
    pub routing_key: String,
    /// Queue consumed by the subscriber
    pub queue: String,
    pub connection_name: String,
    /// Put channels in confirm mode and wait for the broker's ack
    pub publisher_confirms: bool,
    pub confirm_timeout_ms: u64,
    #[serde(flatten)]
    pub pool: PoolSettings,
}

impl Default for AmqpSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5672,
            virtual_host: "/".to_string(),
            username: "guest".to_string(),
            password: Password::new("guest"),
            exchange: String::new(),
            routing_key: String::new(),
            queue: String::new(),
            connection_name: "courier".to_string(),
            publisher_confirms: false,
            confirm_timeout_ms: 5_000,
            pool: PoolSettings::default(),
        }
    }
}

impl AmqpSettings {
    /// Connection URI, credentials included
    pub fn uri(&self) -> String {
        let vhost = match self.virtual_host.as_str() {
            "" | "/" => "%2f".to_string(),
            other => other.trim_start_matches('/').replace('/', "%2f"),
        };
        format!(
            "amqp://{}:{}@{}:{}/{}",
            self.username,
            self.password.expose(),
            self.host,
            self.port,
            vhost
        )
    }

    /// `host:port/vhost`, for logs
    pub fn endpoint(&self) -> String {
        format!("{}:{}{}", self.host, self.port, self.virtual_host)
    }

    pub fn destination(&self) -> Destination {
        Destination::new(self.exchange.clone(), self.routing_key.clone())
    }

    pub fn confirm_timeout(&self) -> Duration {
        Duration::from_millis(self.confirm_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        require("amqp", "host", &self.host)?;
        self.pool.validate("amqp")
    }
}

/// `[socket]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SocketSettings {
    /// Endpoint the PUB socket connects to
    pub endpoint: String,
    /// Default topic
    pub topic: String,
    #[serde(flatten)]
    pub pool: PoolSettings,
}

impl Default for SocketSettings {
    fn default() -> Self {
        Self {
            endpoint: "tcp://127.0.0.1:5556".to_string(),
            topic: String::new(),
            pool: PoolSettings::default(),
        }
    }
}

impl SocketSettings {
    pub fn destination(&self) -> Destination {
        Destination::topic(self.topic.clone())
    }

    pub fn validate(&self) -> Result<()> {
        require("socket", "endpoint", &self.endpoint)?;
        self.pool.validate("socket")
    }
}

/// `[log]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogSettings {
    /// Comma separated `host:port` list
    pub bootstrap_servers: String,
    pub client_id: String,
    /// Default topic
    pub topic: String,
    /// Default record key (tag)
    pub tag: String,
    /// Consumer group used by subscriptions
    pub group_id: String,
    pub send_timeout_ms: u64,
    #[serde(flatten)]
    pub pool: PoolSettings,
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            bootstrap_servers: "localhost:9092".to_string(),
            client_id: "courier".to_string(),
            topic: String::new(),
            tag: String::new(),
            group_id: "courier".to_string(),
            send_timeout_ms: 3_000,
            pool: PoolSettings::default(),
        }
    }
}

impl LogSettings {
    pub fn destination(&self) -> Destination {
        let tag = if self.tag.is_empty() {
            self.topic.clone()
        } else {
            self.tag.clone()
        };
        Destination::new(self.topic.clone(), tag)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        require("log", "bootstrap_servers", &self.bootstrap_servers)?;
        self.pool.validate("log")
    }
}

/// `[mqtt]` section
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    /// Client id prefix; every pooled session gets a unique suffix
    pub client_id: String,
    pub clean_session: bool,
    pub username: String,
    pub password: Password,
    /// Default topic
    pub topic: String,
    /// 0, 1 or 2
    pub qos: u8,
    pub retain: bool,
    pub keep_alive_secs: u64,
    #[serde(flatten)]
    pub pool: PoolSettings,
}

impl Default for MqttSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id: "courier".to_string(),
            clean_session: true,
            username: "guest".to_string(),
            password: Password::new("guest"),
            topic: String::new(),
            qos: 1,
            retain: false,
            keep_alive_secs: 30,
            pool: PoolSettings::default(),
        }
    }
}

static MQTT_SESSION_SEQ: AtomicU64 = AtomicU64::new(0);

impl MqttSettings {
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn destination(&self) -> Destination {
        Destination::topic(self.topic.clone())
    }

    /// A client id no other session of this process uses.
    ///
    /// Brokers disconnect the older session when two share an id.
    pub fn session_client_id(&self) -> String {
        let seq = MQTT_SESSION_SEQ.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}-{}", self.client_id, std::process::id(), seq)
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs)
    }

    pub fn validate(&self) -> Result<()> {
        require("mqtt", "host", &self.host)?;
        if self.qos > 2 {
            return Err(BrokerError::Config(format!(
                "[mqtt] qos must be 0, 1 or 2, got {}",
                self.qos
            )));
        }
        self.pool.validate("mqtt")
    }
}
