//! # Envelope Model
//!
//! Messages travel through the broker wrapped in an [`Envelope`]: the typed
//! payload plus a string property map. Properties double as wire headers and
//! are persisted alongside the serialized body, so everything in here must
//! stay representable as `map<string, string>`.
//!
//! A payload that cannot be decoded (missing type metadata, codec failure)
//! is handed back as a [`BrokenEnvelope`] carrying the raw stored bytes and
//! the original headers. Both variants are unified by [`Delivery`], the type
//! returned from a consumer `get()`.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::codec::Message;

/// Well-known property (header) names and defaults.
///
/// Property names are the wire names: they are persisted verbatim in the
/// stored header map and must not change without a migration.
pub mod property {
    /// Unique identifier of one delivery attempt, assigned by the broker.
    pub const MESSAGE_ID: &str = "message-id";
    /// Wire tag identifying the payload type, resolved via the name map.
    pub const MESSAGE_TYPE: &str = "message-type";
    /// MIME type of the serialized body.
    pub const CONTENT_TYPE: &str = "content-type";
    /// Encoding of the serialized body.
    pub const CONTENT_ENCODING: &str = "content-encoding";
    /// Number of retries attempted so far, broker-authoritative after `get`.
    pub const RETRY_COUNT: &str = "retry-count";
    /// Retry budget, after which the message is dead-lettered.
    pub const RETRY_MAX: &str = "retry-max";
    /// Delay in milliseconds before a rejected message becomes eligible again.
    pub const RETRY_DELAY: &str = "retry-delay";
    /// Queue hint used by the publisher when no explicit routing key is given.
    pub const ROUTING_KEY: &str = "routing-key";
    /// Broker-local storage sequence number, kept for backward compatibility
    /// and used as the provenance marker for ack/reject.
    pub const SERIAL: &str = "x-serial";

    /// Legacy alias honored on dispatch for symfony/messenger compatibility.
    pub const LEGACY_CONTENT_TYPE: &str = "Content-Type";

    pub const DEFAULT_CONTENT_TYPE: &str = "application/json";
    pub const DEFAULT_CONTENT_ENCODING: &str = "UTF-8";
    pub const DEFAULT_RETRY_MAX: i64 = 4;
}

/// Opaque unique message identifier.
///
/// Assigned once per logical dispatch: re-dispatching a message always
/// allocates a new id, only a retry-requeue of the same delivery keeps it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Generate a fresh random identifier.
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }

    /// Parse an identifier from its canonical string form.
    pub fn parse(value: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(value)?))
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for MessageId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<Uuid> for MessageId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

/// Shared property contract of [`Envelope`], [`BrokenEnvelope`] and
/// [`Delivery`].
///
/// No validation is performed on property values beyond string coercion;
/// callers are responsible for semantic correctness (numeric strings for
/// counts and delays).
pub trait Properties {
    /// Full property map, as it will be persisted.
    fn properties(&self) -> &HashMap<String, String>;

    fn property(&self, name: &str) -> Option<&str> {
        self.properties().get(name).map(String::as_str)
    }

    fn property_or<'a>(&'a self, name: &str, default: &'a str) -> &'a str {
        self.property(name).unwrap_or(default)
    }

    fn has_property(&self, name: &str) -> bool {
        self.properties().contains_key(name)
    }

    /// Broker-assigned message identifier, if present and well formed.
    fn message_id(&self) -> Option<MessageId> {
        self.property(property::MESSAGE_ID)
            .and_then(|value| MessageId::parse(value).ok())
    }

    /// Broker-local serial, if this instance came out of a `get()`.
    fn serial(&self) -> Option<i64> {
        self.property(property::SERIAL)
            .and_then(|value| value.parse().ok())
    }
}

/// A typed message plus its property map.
///
/// The envelope is a mutable value owned by the caller for one call chain.
/// The broker is the sole writer of `message-id`, `x-serial` and
/// `retry-count` during `get()`; mutating those yourself and feeding the
/// envelope back is undefined behavior.
#[derive(Debug)]
pub struct Envelope {
    message: Box<dyn Message>,
    properties: HashMap<String, String>,
}

impl Envelope {
    /// Wrap a message with an empty property map.
    pub fn wrap(message: impl Message) -> Self {
        Self {
            message: Box::new(message),
            properties: HashMap::new(),
        }
    }

    /// Wrap a message with an initial property map.
    pub fn wrap_with_properties(
        message: Box<dyn Message>,
        properties: HashMap<String, String>,
    ) -> Self {
        Self { message, properties }
    }

    /// Merge properties into the existing map. New keys win on conflict.
    pub fn with_properties(
        &mut self,
        properties: impl IntoIterator<Item = (String, String)>,
    ) -> &mut Self {
        self.properties.extend(properties);
        self
    }

    /// Set (or replace) the message identifier property.
    pub fn with_message_id(&mut self, id: MessageId) -> &mut Self {
        self.properties
            .insert(property::MESSAGE_ID.to_string(), id.to_string());
        self
    }

    pub fn message(&self) -> &dyn Message {
        self.message.as_ref()
    }

    /// Downcast the payload to a concrete type.
    pub fn downcast_ref<T: Message>(&self) -> Option<&T> {
        self.message.as_any().downcast_ref::<T>()
    }
}

impl Properties for Envelope {
    fn properties(&self) -> &HashMap<String, String> {
        &self.properties
    }
}

/// Degraded envelope variant for payloads that were never decoded.
///
/// Produced when `message-type` or `content-type` metadata is absent, or
/// when the codec failed. Carries the raw stored bytes instead of a typed
/// payload; the original headers are preserved so the caller can still
/// route, log or requeue it.
#[derive(Debug, Clone)]
pub struct BrokenEnvelope {
    body: Vec<u8>,
    properties: HashMap<String, String>,
}

impl BrokenEnvelope {
    pub fn wrap(body: Vec<u8>, properties: HashMap<String, String>) -> Self {
        Self { body, properties }
    }

    /// The raw body bytes, exactly as stored.
    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn body_utf8_lossy(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

impl Properties for BrokenEnvelope {
    fn properties(&self) -> &HashMap<String, String> {
        &self.properties
    }
}

/// Result of a successful claim: either a decoded envelope or a broken one.
#[derive(Debug)]
pub enum Delivery {
    Decoded(Envelope),
    Broken(BrokenEnvelope),
}

impl Delivery {
    pub fn is_broken(&self) -> bool {
        matches!(self, Delivery::Broken(_))
    }

    pub fn envelope(&self) -> Option<&Envelope> {
        match self {
            Delivery::Decoded(envelope) => Some(envelope),
            Delivery::Broken(_) => None,
        }
    }

    pub fn broken(&self) -> Option<&BrokenEnvelope> {
        match self {
            Delivery::Decoded(_) => None,
            Delivery::Broken(broken) => Some(broken),
        }
    }
}

impl Properties for Delivery {
    fn properties(&self) -> &HashMap<String, String> {
        match self {
            Delivery::Decoded(envelope) => envelope.properties(),
            Delivery::Broken(broken) => broken.properties(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct Ping;

    #[test]
    fn message_id_round_trip() {
        let id = MessageId::generate();
        let parsed = MessageId::parse(&id.to_string()).unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn message_id_rejects_garbage() {
        assert!(MessageId::parse("not-a-uuid").is_err());
    }

    #[test]
    fn properties_merge_new_keys_win() {
        let mut envelope = Envelope::wrap(Ping);
        envelope.with_properties([("x-foo".to_string(), "bar".to_string())]);
        envelope.with_properties([
            ("x-foo".to_string(), "baz".to_string()),
            ("x-other".to_string(), "1".to_string()),
        ]);

        assert_eq!(envelope.property("x-foo"), Some("baz"));
        assert_eq!(envelope.property("x-other"), Some("1"));
        assert_eq!(envelope.property_or("missing", "fallback"), "fallback");
        assert!(!envelope.has_property("missing"));
    }

    #[test]
    fn with_message_id_sets_property() {
        let id = MessageId::generate();
        let mut envelope = Envelope::wrap(Ping);
        envelope.with_message_id(id);

        assert_eq!(envelope.message_id(), Some(id));
        assert_eq!(
            envelope.property(property::MESSAGE_ID),
            Some(id.to_string().as_str())
        );
    }

    #[test]
    fn downcast_returns_payload() {
        let envelope = Envelope::wrap(Ping);
        assert!(envelope.downcast_ref::<Ping>().is_some());
        assert!(envelope.downcast_ref::<String>().is_none());
    }

    #[test]
    fn broken_envelope_exposes_raw_body() {
        let mut headers = HashMap::new();
        headers.insert("content-type".to_string(), "application/json".to_string());
        let broken = BrokenEnvelope::wrap(b"{}".to_vec(), headers);

        assert_eq!(broken.body(), b"{}");
        assert_eq!(broken.body_utf8_lossy(), "{}");
        assert_eq!(broken.property("content-type"), Some("application/json"));
    }

    #[test]
    fn delivery_delegates_properties() {
        let mut headers = HashMap::new();
        headers.insert(property::SERIAL.to_string(), "42".to_string());
        let delivery = Delivery::Broken(BrokenEnvelope::wrap(vec![], headers));

        assert!(delivery.is_broken());
        assert_eq!(delivery.serial(), Some(42));
        assert!(delivery.envelope().is_none());
        assert!(delivery.broken().is_some());
    }
}
