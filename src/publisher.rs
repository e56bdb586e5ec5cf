//! # Message Publisher
//!
//! Dispatch-side orchestration: assigns the message identifier, resolves
//! the type tag and content type, serializes the payload and hands the
//! result to the storage port. No retries and no partial-failure handling
//! live here; serialization or storage errors propagate synchronously to
//! the caller.

use std::sync::Arc;

use tracing::debug;

use crate::codec::{NameMap, Serializer};
use crate::config::PublisherConfig;
use crate::envelope::{property, Envelope, MessageId, Properties};
use crate::error::Result;
use crate::store::MessageStore;

/// Publishes messages, whatever the routing.
pub struct MessagePublisher {
    store: Arc<dyn MessageStore>,
    serializer: Arc<dyn Serializer>,
    name_map: Arc<dyn NameMap>,
    config: PublisherConfig,
}

impl MessagePublisher {
    pub fn new(
        store: Arc<dyn MessageStore>,
        serializer: Arc<dyn Serializer>,
        name_map: Arc<dyn NameMap>,
        config: PublisherConfig,
    ) -> Self {
        Self {
            store,
            serializer,
            name_map,
            config,
        }
    }

    /// Send a message.
    ///
    /// Always allocates a fresh [`MessageId`] and writes it onto the
    /// envelope: an application may resend any message as a new one at any
    /// time, and the identifier is the unique key of one delivery attempt.
    /// The resolved `message-type` and `content-type` are persisted back
    /// onto the envelope as well.
    ///
    /// The routing key hint wins over the `routing-key` property, which
    /// wins over the configured default queue.
    pub async fn dispatch(
        &self,
        envelope: &mut Envelope,
        routing_key: Option<&str>,
    ) -> Result<MessageId> {
        let id = MessageId::generate();
        envelope.with_message_id(id);

        if !envelope.has_property(property::MESSAGE_TYPE) {
            let tag = self.name_map.from_message(envelope.message());
            envelope.with_properties([(property::MESSAGE_TYPE.to_string(), tag)]);
        }

        let content_type = self.resolve_content_type(envelope);

        let queue = routing_key
            .map(str::to_string)
            .or_else(|| {
                envelope
                    .property(property::ROUTING_KEY)
                    .map(str::to_string)
            })
            .unwrap_or_else(|| self.config.default_queue.clone());

        let body = self
            .serializer
            .serialize(envelope.message(), &content_type)?;

        self.store
            .insert(&id, &queue, envelope.properties(), &body)
            .await?;

        debug!(
            message_id = %id,
            queue = %queue,
            message_type = envelope.property(property::MESSAGE_TYPE),
            "message dispatched"
        );

        Ok(id)
    }

    /// Priority order: explicit property, legacy `Content-Type` alias,
    /// configured default, then the literal `application/json` fallback.
    fn resolve_content_type(&self, envelope: &mut Envelope) -> String {
        if let Some(content_type) = envelope.property(property::CONTENT_TYPE) {
            return content_type.to_string();
        }

        let mut content_type = envelope
            .property(property::LEGACY_CONTENT_TYPE)
            .map(str::to_string)
            .unwrap_or_else(|| self.config.content_type.clone());

        if content_type.is_empty() {
            content_type = property::DEFAULT_CONTENT_TYPE.to_string();
        }

        envelope.with_properties([(property::CONTENT_TYPE.to_string(), content_type.clone())]);
        content_type
    }
}

impl std::fmt::Debug for MessagePublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessagePublisher")
            .field("config", &self.config)
            .finish()
    }
}
