//! # Message Consumer
//!
//! Consume-side orchestration: atomic claim, authoritative header
//! reconstruction, deserialization dispatch with graceful degradation, and
//! the retry/dead-letter state machine.
//!
//! Failure handling follows one rule: a failure about a single message's
//! payload is absorbed (the record is dead-lettered, the caller gets a
//! [`BrokenEnvelope`]) so the poll loop keeps running; a failure of the
//! fetch mechanism itself is propagated so the loop can restart.

use std::sync::Arc;

use tracing::{debug, warn};

use crate::codec::{NameMap, Serializer};
use crate::config::ConsumerConfig;
use crate::envelope::{property, BrokenEnvelope, Delivery, Envelope, MessageId, Properties};
use crate::error::{BrokerError, Result};
use crate::store::{FailureInfo, FetchedRecord, MessageStore};

/// Consume messages from one or more queues.
///
/// Synchronous and stateless between calls: concurrency comes from running
/// several consumers against the same store, each driving its own
/// caller-owned poll loop.
pub struct MessageConsumer {
    store: Arc<dyn MessageStore>,
    serializer: Arc<dyn Serializer>,
    name_map: Arc<dyn NameMap>,
    queues: Vec<String>,
}

impl MessageConsumer {
    pub fn new(
        store: Arc<dyn MessageStore>,
        serializer: Arc<dyn Serializer>,
        name_map: Arc<dyn NameMap>,
        config: ConsumerConfig,
    ) -> Self {
        Self {
            store,
            serializer,
            name_map,
            queues: config.normalized_queues(),
        }
    }

    /// Queues this consumer claims from.
    pub fn queues(&self) -> &[String] {
        &self.queues
    }

    /// Fetch the next awaiting message, `None` when no record is eligible.
    ///
    /// Headers on which the broker is authoritative (`message-id`,
    /// `x-serial`, `retry-count`) are overwritten from the claimed row and
    /// must not be trusted from stored headers.
    ///
    /// Codec failures never surface here: the record is marked failed and
    /// returned as [`Delivery::Broken`]. Missing type metadata also yields
    /// a broken delivery, without a failure record. Anything that prevents
    /// the record from being interpreted at all (malformed id) marks the
    /// record failed and is then propagated, wrapped.
    pub async fn get(&self) -> Result<Option<Delivery>> {
        let Some(record) = self.store.fetch_next(&self.queues).await? else {
            return Ok(None);
        };

        let raw_id = record.id.clone();

        match self.build_delivery(record).await {
            Ok(delivery) => Ok(Some(delivery)),
            Err(error) => {
                let failure = FailureInfo::from_error(&error);
                if let Err(mark_error) = self.store.mark_failed(&raw_id, Some(&failure)).await {
                    warn!(raw_id = %raw_id, error = %mark_error, "could not dead-letter unreadable record");
                }

                // build_delivery may have wrapped already; keep one layer.
                match error {
                    wrapped @ BrokerError::Fetch { .. } => Err(wrapped),
                    other => Err(BrokerError::fetch(raw_id, other)),
                }
            }
        }
    }

    async fn build_delivery(&self, record: FetchedRecord) -> Result<Delivery> {
        let FetchedRecord {
            id: raw_id,
            serial,
            mut headers,
            body,
            retry_count,
        } = record;

        let id = MessageId::parse(&raw_id)
            .map_err(|error| BrokerError::fetch(raw_id.clone(), error))?;

        // Restore the properties on which we are authoritative.
        headers.insert(property::MESSAGE_ID.to_string(), id.to_string());
        headers.insert(property::SERIAL.to_string(), serial.to_string());
        if let Some(retry_count) = retry_count {
            headers.insert(property::RETRY_COUNT.to_string(), retry_count.to_string());
        }

        let tag = headers.get(property::MESSAGE_TYPE).cloned();
        let content_type = headers.get(property::CONTENT_TYPE).cloned();

        let (Some(tag), Some(content_type)) = (tag, content_type) else {
            // Unroutable, but not a hard failure: the caller decides.
            debug!(message_id = %id, "missing type metadata, returning broken envelope");
            return Ok(Delivery::Broken(BrokenEnvelope::wrap(body, headers)));
        };

        let type_name = self.name_map.to_type_name(&tag);

        match self
            .serializer
            .deserialize(&type_name, &content_type, &body)
        {
            Ok(message) => Ok(Delivery::Decoded(Envelope::wrap_with_properties(
                message, headers,
            ))),
            Err(error) => {
                // The codec is untrusted and may raise anything; absorb it,
                // dead-letter the record and keep the poll loop alive.
                warn!(message_id = %id, %error, "payload decode failed, dead-lettering");
                let failure = FailureInfo::from_error(&error);
                self.store.mark_failed(&raw_id, Some(&failure)).await?;
                Ok(Delivery::Broken(BrokenEnvelope::wrap(body, headers)))
            }
        }
    }

    /// Acknowledge a single message.
    ///
    /// The envelope must carry the broker-assigned `x-serial` marker;
    /// acknowledging anything else is a programmer error.
    pub async fn ack(&self, delivery: &impl Properties) -> Result<()> {
        let id = self.provenance("ack", delivery)?;
        self.store.ack(&id).await?;
        debug!(message_id = %id, "message acknowledged");
        Ok(())
    }

    /// Reject or requeue a single message; requeuing is decided from the
    /// envelope properties.
    ///
    /// With a non-zero `retry-count` below `retry-max` (default 4) the
    /// record is released for another attempt after `retry-delay`
    /// milliseconds. A zero count is treated as "no retry requested", as is
    /// a missing count; both dead-letter immediately, recording the
    /// supplied error's diagnostics when present. An exhausted budget
    /// dead-letters without diagnostics.
    pub async fn reject(
        &self,
        delivery: &impl Properties,
        error: Option<&(dyn std::error::Error + 'static)>,
    ) -> Result<()> {
        let id = self.provenance("reject", delivery)?;

        if delivery.has_property(property::RETRY_COUNT) {
            // The caller set the count; it is bumped by the store, never
            // decremented, whatever value the caller supplies.
            let count: i64 = delivery
                .property_or(property::RETRY_COUNT, "0")
                .parse()
                .unwrap_or(0);
            let max: i64 = delivery
                .property_or(property::RETRY_MAX, "4")
                .parse()
                .unwrap_or(property::DEFAULT_RETRY_MAX);

            // A literal zero must not force a retry.
            if count != 0 {
                if count >= max {
                    debug!(message_id = %id, count, max, "retry budget exhausted, dead-lettering");
                    self.store.mark_failed(&id.to_string(), None).await?;
                } else {
                    let delay_ms: i64 = delivery
                        .property_or(property::RETRY_DELAY, "0")
                        .parse()
                        .unwrap_or(0);
                    self.store
                        .mark_for_retry(&id, delivery.properties(), count, delay_ms)
                        .await?;
                }
                return Ok(());
            }
        }

        let failure = error.map(FailureInfo::from_error);
        self.store
            .mark_failed(&id.to_string(), failure.as_ref())
            .await?;
        debug!(message_id = %id, "message dead-lettered");
        Ok(())
    }

    fn provenance(
        &self,
        operation: &'static str,
        delivery: &impl Properties,
    ) -> Result<MessageId> {
        if !delivery.has_property(property::SERIAL) {
            return Err(BrokerError::Provenance { operation });
        }

        delivery
            .message_id()
            .ok_or(BrokerError::Provenance { operation })
    }
}

impl std::fmt::Debug for MessageConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageConsumer")
            .field("queues", &self.queues)
            .finish()
    }
}

/// Builds consumers plugged to queue sets over one shared backend.
pub struct ConsumerFactory {
    store: Arc<dyn MessageStore>,
    serializer: Arc<dyn Serializer>,
    name_map: Arc<dyn NameMap>,
}

impl ConsumerFactory {
    pub fn new(
        store: Arc<dyn MessageStore>,
        serializer: Arc<dyn Serializer>,
        name_map: Arc<dyn NameMap>,
    ) -> Self {
        Self {
            store,
            serializer,
            name_map,
        }
    }

    /// Create a consumer for the given queues; `None` means `["default"]`.
    pub fn consumer(&self, queues: Option<Vec<String>>) -> MessageConsumer {
        let config = match queues {
            Some(queues) => ConsumerConfig { queues },
            None => ConsumerConfig::default(),
        };

        MessageConsumer::new(
            Arc::clone(&self.store),
            Arc::clone(&self.serializer),
            Arc::clone(&self.name_map),
            config,
        )
    }
}
