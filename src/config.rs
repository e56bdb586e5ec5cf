//! # Component Configuration
//!
//! Every component takes an explicit configuration struct with all
//! recognized options enumerated and defaulted. Validation happens at
//! construction time: a store built from an invalid configuration fails
//! eagerly instead of producing broken SQL later.

use serde::Deserialize;
use thiserror::Error;

/// Configuration validation errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("{field} must be a valid identifier (letters, digits, underscore), got: {value:?}")]
    InvalidIdentifier { field: &'static str, value: String },

    #[error("{field} must not be empty")]
    Empty { field: &'static str },
}

fn default_queue() -> String {
    "default".to_string()
}

fn default_queues() -> Vec<String> {
    vec![default_queue()]
}

fn default_content_type() -> String {
    crate::envelope::property::DEFAULT_CONTENT_TYPE.to_string()
}

fn default_schema() -> String {
    "public".to_string()
}

fn default_table() -> String {
    "message_broker".to_string()
}

fn default_listen_channel() -> String {
    "message_broker".to_string()
}

fn default_queue_check_delay_ms() -> u64 {
    30_000
}

/// Publisher options.
#[derive(Debug, Clone, Deserialize)]
pub struct PublisherConfig {
    /// Queue used when neither an explicit routing key nor a `routing-key`
    /// property is present.
    #[serde(default = "default_queue")]
    pub default_queue: String,

    /// Content type applied to envelopes that do not carry one.
    #[serde(default = "default_content_type")]
    pub content_type: String,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            default_queue: default_queue(),
            content_type: default_content_type(),
        }
    }
}

/// Consumer options.
#[derive(Debug, Clone, Deserialize)]
pub struct ConsumerConfig {
    /// Queues to consume from, in claim priority order. An empty list is
    /// normalized to `["default"]`.
    #[serde(default = "default_queues")]
    pub queues: Vec<String>,
}

impl ConsumerConfig {
    pub fn for_queues(queues: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            queues: queues.into_iter().map(Into::into).collect(),
        }
    }

    pub(crate) fn normalized_queues(&self) -> Vec<String> {
        if self.queues.is_empty() {
            default_queues()
        } else {
            self.queues.clone()
        }
    }
}

impl Default for ConsumerConfig {
    fn default() -> Self {
        Self {
            queues: default_queues(),
        }
    }
}

/// Options for the combined broker facade.
#[derive(Debug, Clone, Deserialize)]
pub struct BrokerConfig {
    /// Single queue the broker publishes to and consumes from.
    #[serde(default = "default_queue")]
    pub queue: String,

    /// Content type applied to envelopes that do not carry one.
    #[serde(default = "default_content_type")]
    pub content_type: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            queue: default_queue(),
            content_type: default_content_type(),
        }
    }
}

/// PostgreSQL store options.
#[derive(Debug, Clone, Deserialize)]
pub struct PgStoreConfig {
    /// Schema holding the queue table.
    #[serde(default = "default_schema")]
    pub schema: String,

    /// Queue table name.
    #[serde(default = "default_table")]
    pub table: String,

    /// Enable the LISTEN/NOTIFY wake-up path. An optimization only: the
    /// cooldown-gated fallback poll keeps running regardless, so a lost
    /// notification can never stall consumption.
    #[serde(default)]
    pub listen_enabled: bool,

    /// Channel used for wake-up notifications.
    #[serde(default = "default_listen_channel")]
    pub listen_channel: String,

    /// Cooldown in milliseconds before re-issuing the classic poll after an
    /// empty result, while awaiting a notification.
    #[serde(default = "default_queue_check_delay_ms")]
    pub queue_check_delay_ms: u64,
}

impl PgStoreConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_identifier("schema", &self.schema)?;
        validate_identifier("table", &self.table)?;
        if self.listen_enabled {
            validate_identifier("listen_channel", &self.listen_channel)?;
        }
        Ok(())
    }
}

impl Default for PgStoreConfig {
    fn default() -> Self {
        Self {
            schema: default_schema(),
            table: default_table(),
            listen_enabled: false,
            listen_channel: default_listen_channel(),
            queue_check_delay_ms: default_queue_check_delay_ms(),
        }
    }
}

/// Identifiers end up interpolated into SQL, so they are restricted to a
/// conservative subset rather than quoted-and-hoped-for.
fn validate_identifier(field: &'static str, value: &str) -> Result<(), ConfigError> {
    let mut chars = value.chars();
    let Some(head) = chars.next() else {
        return Err(ConfigError::Empty { field });
    };
    let head_ok = head.is_ascii_alphabetic() || head == '_';
    if head_ok && chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        Ok(())
    } else {
        Err(ConfigError::InvalidIdentifier {
            field,
            value: value.to_string(),
        })
    }
}
