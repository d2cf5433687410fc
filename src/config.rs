//! Worker configuration, read once at startup.

use crate::connection::{default_credential, default_vhost, BrokerEndpoint, DEFAULT_PORT};
use crate::dlq::DeadLetterNames;
use crate::error::WorkerError;
use crate::retry::ReconnectConfig;
use crate::topology::{QueueBinding, QueueType};
use config::{Config, Environment, Map};
use serde::Deserialize;

/// Deliveries in flight per consumer. Handlers therefore never overlap.
pub const PREFETCH_COUNT: u16 = 1;

/// What the consumer does when a handler fails with an unrecognized error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnrecognizedErrorPolicy {
    /// Log, dead-letter the message and keep consuming.
    #[default]
    DeadLetter,
    /// Put the message back on the queue and stop the consumer.
    Halt,
}

/// Configuration for a consumer service.
///
/// Use [`WorkerConfig::builder()`] or [`WorkerConfig::from_env()`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerConfig {
    pub endpoint: BrokerEndpoint,
    /// The name of the queue to consume messages from.
    pub queue_name: String,
    /// The topic exchange the queue is bound to.
    pub exchange_name: String,
    /// The binding pattern, e.g. `stoa.request.*`.
    pub topic_pattern: String,
    /// A unique identifier for the consumer on this queue.
    pub consumer_tag: String,
    pub durable: bool,
    pub queue_type: QueueType,
    /// Publish unrecoverable messages to `{queue}_dlq`.
    pub dead_letter: bool,
    /// Dead-letter a message once this many deliveries have failed
    /// recoverably. Needs a queue that reports `x-delivery-count`.
    pub max_deliveries: Option<u32>,
    pub unrecognized_errors: UnrecognizedErrorPolicy,
    pub reconnect: ReconnectConfig,
}

fn default_durable() -> bool {
    true
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

impl WorkerConfig {
    /// Creates a new `WorkerConfigBuilder` to start building the worker configuration.
    ///
    /// # Arguments
    /// * `queue_name` - The name of the queue to consume from.
    /// * `host` - The broker host name.
    pub fn builder(queue_name: impl Into<String>, host: impl Into<String>) -> WorkerConfigBuilder {
        WorkerConfigBuilder::new(queue_name.into(), host.into())
    }

    /// Loads the configuration from `{PREFIX}_*` environment variables.
    ///
    /// Nested fields use `__`, e.g. `WORKER_RECONNECT__MAX_DELAY_MS`.
    pub fn from_env(prefix: &str) -> Result<Self, WorkerError> {
        Self::load(Environment::with_prefix(prefix))
    }

    /// Like [`from_env`](Self::from_env), reading from `vars` instead of the
    /// process environment.
    pub fn from_env_map(prefix: &str, vars: Map<String, String>) -> Result<Self, WorkerError> {
        Self::load(Environment::with_prefix(prefix).source(Some(vars)))
    }

    fn load(source: Environment) -> Result<Self, WorkerError> {
        let raw = Config::builder()
            .add_source(source.prefix_separator("_").separator("__"))
            .build()
            .and_then(|c| c.try_deserialize::<RawWorkerConfig>())
            .map_err(|e| WorkerError::config(e.to_string()))?;
        let config = raw.into_config();
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), WorkerError> {
        self.endpoint.validate()?;
        self.binding().validate()?;
        if self.consumer_tag.trim().is_empty() {
            return Err(WorkerError::config("consumer tag must not be empty"));
        }
        if self.max_deliveries == Some(0) {
            return Err(WorkerError::config("max_deliveries must be at least 1"));
        }
        if self.reconnect.min_delay_ms == 0 {
            return Err(WorkerError::config("reconnect.min_delay_ms must be at least 1"));
        }
        if self.max_deliveries.is_some() && self.queue_type != QueueType::Quorum {
            log::warn!(
                "max_deliveries is set but queue '{}' is not a quorum queue; the limit only applies when the broker sends x-delivery-count",
                self.queue_name
            );
        }
        Ok(())
    }

    /// The topology this configuration describes.
    pub fn binding(&self) -> QueueBinding {
        let binding = QueueBinding::new(&self.exchange_name, &self.queue_name, &self.topic_pattern)
            .durable(self.durable)
            .queue_type(self.queue_type);
        if self.dead_letter {
            binding.dead_letter(DeadLetterNames::for_queue(&self.queue_name))
        } else {
            binding
        }
    }
}

/// Environment shape: everything but the host and queue name is optional
/// and falls back to the builder's defaults.
#[derive(Deserialize)]
struct RawWorkerConfig {
    host: String,
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default = "default_credential")]
    username: String,
    #[serde(default = "default_credential")]
    password: String,
    #[serde(default = "default_vhost")]
    vhost: String,
    queue_name: String,
    exchange_name: Option<String>,
    topic_pattern: Option<String>,
    consumer_tag: Option<String>,
    #[serde(default = "default_durable")]
    durable: bool,
    #[serde(default)]
    queue_type: QueueType,
    #[serde(default)]
    dead_letter: bool,
    #[serde(default)]
    max_deliveries: Option<u32>,
    #[serde(default)]
    unrecognized_errors: UnrecognizedErrorPolicy,
    #[serde(default)]
    reconnect: ReconnectConfig,
}

impl RawWorkerConfig {
    fn into_config(self) -> WorkerConfig {
        let mut builder = WorkerConfig::builder(self.queue_name, self.host)
            .port(self.port)
            .credentials(self.username, self.password)
            .vhost(self.vhost)
            .durable(self.durable)
            .queue_type(self.queue_type)
            .dead_letter(self.dead_letter)
            .unrecognized_errors(self.unrecognized_errors)
            .reconnect(self.reconnect);
        if let Some(exchange_name) = self.exchange_name {
            builder = builder.exchange_name(exchange_name);
        }
        if let Some(topic_pattern) = self.topic_pattern {
            builder = builder.topic_pattern(topic_pattern);
        }
        if let Some(consumer_tag) = self.consumer_tag {
            builder = builder.consumer_tag(consumer_tag);
        }
        if let Some(max) = self.max_deliveries {
            builder = builder.max_deliveries(max);
        }
        builder.build()
    }
}

/// A builder for creating `WorkerConfig` instances.
pub struct WorkerConfigBuilder {
    queue_name: String,
    endpoint: BrokerEndpoint,
    exchange_name: Option<String>,
    topic_pattern: Option<String>,
    consumer_tag: Option<String>,
    durable: bool,
    queue_type: QueueType,
    dead_letter: bool,
    max_deliveries: Option<u32>,
    unrecognized_errors: UnrecognizedErrorPolicy,
    reconnect: Option<ReconnectConfig>,
}

impl WorkerConfigBuilder {
    fn new(queue_name: String, host: String) -> Self {
        Self {
            queue_name,
            endpoint: BrokerEndpoint::new(host, DEFAULT_PORT),
            exchange_name: None,
            topic_pattern: None,
            consumer_tag: None,
            durable: true,
            queue_type: QueueType::Classic,
            dead_letter: false,
            max_deliveries: None,
            unrecognized_errors: UnrecognizedErrorPolicy::default(),
            reconnect: None,
        }
    }

    pub fn port(mut self, port: u16) -> Self {
        self.endpoint.port = port;
        self
    }

    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.endpoint = self.endpoint.credentials(username, password);
        self
    }

    pub fn vhost(mut self, vhost: impl Into<String>) -> Self {
        self.endpoint = self.endpoint.vhost(vhost);
        self
    }

    /// Replaces the whole endpoint, including the host.
    pub fn endpoint(mut self, endpoint: BrokerEndpoint) -> Self {
        self.endpoint = endpoint;
        self
    }

    /// Sets a custom exchange name.
    /// Defaults to `{queue_name}_exchange` if not set.
    pub fn exchange_name(mut self, exchange_name: impl Into<String>) -> Self {
        self.exchange_name = Some(exchange_name.into());
        self
    }

    /// Sets the binding pattern.
    /// Defaults to `{queue_name}.request.*` if not set.
    pub fn topic_pattern(mut self, topic_pattern: impl Into<String>) -> Self {
        self.topic_pattern = Some(topic_pattern.into());
        self
    }

    /// Sets a custom consumer tag.
    /// Defaults to `{queue_name}_consumer` if not set.
    pub fn consumer_tag(mut self, consumer_tag: impl Into<String>) -> Self {
        self.consumer_tag = Some(consumer_tag.into());
        self
    }

    pub fn durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    pub fn queue_type(mut self, queue_type: QueueType) -> Self {
        self.queue_type = queue_type;
        self
    }

    /// Declares `{queue}_dlx`/`{queue}_dlq` and publishes dead letters there.
    pub fn dead_letter(mut self, enabled: bool) -> Self {
        self.dead_letter = enabled;
        self
    }

    pub fn max_deliveries(mut self, max: u32) -> Self {
        self.max_deliveries = Some(max);
        self
    }

    pub fn unrecognized_errors(mut self, policy: UnrecognizedErrorPolicy) -> Self {
        self.unrecognized_errors = policy;
        self
    }

    /// Sets the reconnect backoff.
    /// Defaults to `ReconnectConfig::default()`.
    pub fn reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = Some(reconnect);
        self
    }

    /// Builds the final `WorkerConfig`, applying defaults for any unset options.
    pub fn build(self) -> WorkerConfig {
        let queue_name = self.queue_name;
        WorkerConfig {
            exchange_name: self.exchange_name.unwrap_or_else(|| format!("{}_exchange", queue_name)),
            topic_pattern: self.topic_pattern.unwrap_or_else(|| format!("{}.request.*", queue_name)),
            consumer_tag: self.consumer_tag.unwrap_or_else(|| format!("{}_consumer", queue_name)),
            reconnect: self.reconnect.unwrap_or_default(),
            endpoint: self.endpoint,
            durable: self.durable,
            queue_type: self.queue_type,
            dead_letter: self.dead_letter,
            max_deliveries: self.max_deliveries,
            unrecognized_errors: self.unrecognized_errors,
            queue_name,
        }
    }
}
