//! # Combined Broker Facade
//!
//! A publisher and a consumer over one shared store and one queue, for
//! applications that produce and consume from the same process. The split
//! [`MessagePublisher`]/[`MessageConsumer`] pair remains the primary API
//! when the two sides live in different processes.

use std::sync::Arc;

use crate::codec::{NameMap, Serializer};
use crate::config::{BrokerConfig, ConsumerConfig, PublisherConfig};
use crate::consumer::MessageConsumer;
use crate::envelope::{Delivery, Envelope, MessageId, Properties};
use crate::error::Result;
use crate::publisher::MessagePublisher;
use crate::store::MessageStore;

/// Simple message broker bound to a single queue.
#[derive(Debug)]
pub struct MessageBroker {
    publisher: MessagePublisher,
    consumer: MessageConsumer,
}

impl MessageBroker {
    pub fn new(
        store: Arc<dyn MessageStore>,
        serializer: Arc<dyn Serializer>,
        name_map: Arc<dyn NameMap>,
        config: BrokerConfig,
    ) -> Self {
        let publisher = MessagePublisher::new(
            Arc::clone(&store),
            Arc::clone(&serializer),
            Arc::clone(&name_map),
            PublisherConfig {
                default_queue: config.queue.clone(),
                content_type: config.content_type.clone(),
            },
        );
        let consumer = MessageConsumer::new(
            store,
            serializer,
            name_map,
            ConsumerConfig {
                queues: vec![config.queue],
            },
        );

        Self {
            publisher,
            consumer,
        }
    }

    /// Send a message to the broker's queue.
    pub async fn dispatch(&self, envelope: &mut Envelope) -> Result<MessageId> {
        self.publisher.dispatch(envelope, None).await
    }

    /// Fetch the next awaiting message from the queue.
    pub async fn get(&self) -> Result<Option<Delivery>> {
        self.consumer.get().await
    }

    /// Acknowledge a single message.
    pub async fn ack(&self, delivery: &impl Properties) -> Result<()> {
        self.consumer.ack(delivery).await
    }

    /// Reject or requeue a single message.
    pub async fn reject(
        &self,
        delivery: &impl Properties,
        error: Option<&(dyn std::error::Error + 'static)>,
    ) -> Result<()> {
        self.consumer.reject(delivery, error).await
    }
}
