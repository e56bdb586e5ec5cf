//! # Broker Error Types
//!
//! Structured error handling for the broker core using thiserror.
//!
//! The propagation policy is asymmetric by design: publish-path errors
//! (serialization, storage) always reach the caller unmodified, while
//! consume-path errors are absorbed when they concern one message's payload
//! (the caller gets a [`BrokenEnvelope`](crate::envelope::BrokenEnvelope))
//! and propagated when they concern the fetch mechanism itself, so a poll
//! loop can tell "this message is bad" from "the store is broken".

use thiserror::Error;

use crate::codec::CodecError;
use crate::config::ConfigError;

/// Storage adapter error types
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("header map serialization error: {0}")]
    Headers(#[from] serde_json::Error),

    #[error("store configuration error: {0}")]
    Configuration(#[from] ConfigError),
}

/// Broker orchestration error types
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("storage error: {0}")]
    Store(#[from] StoreError),

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// Fatal failure while turning a claimed record into an envelope. The
    /// record has been marked failed; the poll loop should treat this as a
    /// systemic signal.
    #[error("error while fetching message {id}")]
    Fetch {
        id: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Ack/reject on an envelope lacking the broker-assigned markers. This
    /// is a programmer error and fails loudly instead of silently succeeding.
    #[error("attempting to {operation} a message that does not belong to this broker")]
    Provenance { operation: &'static str },

    #[error("configuration error: {0}")]
    Configuration(#[from] ConfigError),
}

impl BrokerError {
    pub(crate) fn fetch(
        id: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Fetch {
            id: id.into(),
            source: Box::new(source),
        }
    }
}

/// Result type alias for broker operations
pub type Result<T> = std::result::Result<T, BrokerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_carries_context() {
        let err = BrokerError::Provenance { operation: "ack" };
        assert_eq!(
            err.to_string(),
            "attempting to ack a message that does not belong to this broker"
        );

        let err = BrokerError::fetch("abc", CodecError::UnsupportedContentType {
            content_type: "text/csv".to_string(),
        });
        assert!(err.to_string().contains("abc"));
    }

    #[test]
    fn store_errors_convert() {
        let json_err = serde_json::from_str::<serde_json::Value>("{oops").unwrap_err();
        let store_err: StoreError = json_err.into();
        let broker_err: BrokerError = store_err.into();
        assert!(matches!(broker_err, BrokerError::Store(StoreError::Headers(_))));
    }
}
