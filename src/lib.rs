//! # message-broker
//!
//! Durable message-queue abstraction layered on a transactional relational
//! store, providing at-least-once delivery to multiple competing consumer
//! processes.
//!
//! ## Overview
//!
//! The broker normalizes message envelopes, dispatches (de)serialization by
//! content-type/message-type tags, and implements retry-with-backoff and
//! dead-lettering policy independent of the underlying storage engine. The
//! storage engine is an injected port of five atomic primitives; the
//! reference implementation rides PostgreSQL's
//! `UPDATE ... FOR UPDATE SKIP LOCKED` so that N competing pollers each
//! claim a distinct row without blocking each other, with an optional
//! LISTEN/NOTIFY wake-up path for low-latency idle consumers.
//!
//! This is a library, not a server: callers own the poll loop, the
//! connection pool and the cancellation policy. Delivery is at-least-once;
//! ordering is best-effort FIFO per queue by storage serial.
//!
//! ## Module Organization
//!
//! - [`envelope`] - Message envelopes, properties and identifiers
//! - [`codec`] - Serializer and name-map ports, JSON registry codec
//! - [`publisher`] / [`consumer`] / [`broker`] - Orchestration core
//! - [`store`] - Storage adapter port, PostgreSQL and in-memory adapters
//! - [`config`] - Validated per-component configuration
//! - [`error`] - Structured error handling
//! - [`logging`] - tracing-subscriber helpers
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use message_broker::store::MemoryMessageStore;
//! use message_broker::{BrokerConfig, Envelope, JsonCodec, MessageBroker};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Serialize, Deserialize)]
//! struct SendEmail {
//!     to: String,
//! }
//!
//! # async fn example() -> message_broker::Result<()> {
//! let mut codec = JsonCodec::new();
//! codec.register::<SendEmail>("send_email");
//! let codec = Arc::new(codec);
//!
//! let store = Arc::new(MemoryMessageStore::new());
//! let broker = MessageBroker::new(
//!     store,
//!     codec.clone(),
//!     codec,
//!     BrokerConfig::default(),
//! );
//!
//! let mut envelope = Envelope::wrap(SendEmail {
//!     to: "ops@example.com".to_string(),
//! });
//! broker.dispatch(&mut envelope).await?;
//!
//! if let Some(delivery) = broker.get().await? {
//!     broker.ack(&delivery).await?;
//! }
//! # Ok(())
//! # }
//! ```

pub mod broker;
pub mod codec;
pub mod config;
pub mod consumer;
pub mod envelope;
pub mod error;
pub mod logging;
pub mod publisher;
pub mod store;

pub use broker::MessageBroker;
pub use codec::{CodecError, JsonCodec, Message, NameMap, Serializer};
pub use config::{BrokerConfig, ConfigError, ConsumerConfig, PgStoreConfig, PublisherConfig};
pub use consumer::{ConsumerFactory, MessageConsumer};
pub use envelope::{property, BrokenEnvelope, Delivery, Envelope, MessageId, Properties};
pub use error::{BrokerError, Result, StoreError};
pub use publisher::MessagePublisher;
pub use store::{FailureInfo, FetchedRecord, MessageStore};
