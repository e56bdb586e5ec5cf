//! # In-Memory Store
//!
//! Contract-equivalent double of the PostgreSQL store: an ordered pending
//! list plus a consumed map keyed by id, guarded by one mutex. Reproduces
//! the claim-once, retry-requeue and dead-letter semantics without external
//! timing dependencies, so the orchestration core can be exercised in plain
//! unit tests.
//!
//! Retry delays are honored against the wall clock at claim time; there are
//! no background timers.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use tracing::debug;

use crate::envelope::MessageId;
use crate::error::StoreError;
use crate::store::{FailureInfo, FetchedRecord, MessageStore};

#[derive(Debug, Clone)]
struct StoredMessage {
    id: String,
    serial: i64,
    queue: String,
    headers: HashMap<String, String>,
    body: Vec<u8>,
    retry_count: i64,
    retry_at: Option<DateTime<Utc>>,
    has_failed: bool,
    acked: bool,
    failure: Option<FailureInfo>,
}

#[derive(Debug, Default)]
struct State {
    next_serial: i64,
    waiting: Vec<StoredMessage>,
    consumed: HashMap<String, StoredMessage>,
}

/// In-process reference implementation of [`MessageStore`].
#[derive(Debug, Default)]
pub struct MemoryMessageStore {
    state: Mutex<State>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an arbitrary raw record, bypassing the publisher. Intended
    /// for tests that need records with missing or hostile metadata.
    pub fn push_raw(
        &self,
        id: impl Into<String>,
        queue: impl Into<String>,
        headers: HashMap<String, String>,
        body: Vec<u8>,
    ) {
        let mut state = self.state.lock();
        state.next_serial += 1;
        let serial = state.next_serial;
        state.waiting.push(StoredMessage {
            id: id.into(),
            serial,
            queue: queue.into(),
            headers,
            body,
            retry_count: 0,
            retry_at: None,
            has_failed: false,
            acked: false,
            failure: None,
        });
    }

    /// Number of records waiting to be claimed (eligible or delayed).
    pub fn pending_count(&self) -> usize {
        self.state.lock().waiting.len()
    }

    pub fn is_acked(&self, id: &str) -> bool {
        self.state
            .lock()
            .consumed
            .get(id)
            .is_some_and(|message| message.acked)
    }

    pub fn is_failed(&self, id: &str) -> bool {
        let state = self.state.lock();
        state
            .consumed
            .get(id)
            .map(|message| message.has_failed)
            .or_else(|| {
                state
                    .waiting
                    .iter()
                    .find(|message| message.id == id)
                    .map(|message| message.has_failed)
            })
            .unwrap_or(false)
    }

    /// Diagnostics recorded by `mark_failed`, if any.
    pub fn failure_of(&self, id: &str) -> Option<FailureInfo> {
        self.state
            .lock()
            .consumed
            .get(id)
            .and_then(|message| message.failure.clone())
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn fetch_next(&self, queues: &[String]) -> Result<Option<FetchedRecord>, StoreError> {
        let mut state = self.state.lock();
        let now = Utc::now();

        // Lowest serial first, matching the SQL adapter's claim order.
        let position = state
            .waiting
            .iter()
            .enumerate()
            .filter(|(_, message)| {
                queues.contains(&message.queue)
                    && message.retry_at.is_none_or(|retry_at| retry_at <= now)
            })
            .min_by_key(|(_, message)| message.serial)
            .map(|(position, _)| position);

        let Some(position) = position else {
            return Ok(None);
        };

        let message = state.waiting.remove(position);
        let record = FetchedRecord {
            id: message.id.clone(),
            serial: message.serial,
            headers: message.headers.clone(),
            body: message.body.clone(),
            retry_count: Some(message.retry_count),
        };
        state.consumed.insert(message.id.clone(), message);

        Ok(Some(record))
    }

    async fn insert(
        &self,
        id: &MessageId,
        queue: &str,
        headers: &HashMap<String, String>,
        body: &[u8],
    ) -> Result<(), StoreError> {
        self.push_raw(id.to_string(), queue, headers.clone(), body.to_vec());
        debug!(message_id = %id, queue, "message stored in memory");
        Ok(())
    }

    async fn ack(&self, id: &MessageId) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        if let Some(message) = state.consumed.get_mut(&id.to_string()) {
            message.acked = true;
        }
        Ok(())
    }

    async fn mark_for_retry(
        &self,
        id: &MessageId,
        headers: &HashMap<String, String>,
        retry_count: i64,
        delay_ms: i64,
    ) -> Result<(), StoreError> {
        let mut state = self.state.lock();
        let key = id.to_string();

        if let Some(mut message) = state.consumed.remove(&key) {
            message.headers = headers.clone();
            message.retry_count = (message.retry_count + 1).max(retry_count);
            message.retry_at = (delay_ms > 0)
                .then(|| Utc::now() + ChronoDuration::milliseconds(delay_ms));
            message.has_failed = true;
            debug!(message_id = %id, retry_count = message.retry_count, "message requeued");
            state.waiting.push(message);
        }

        Ok(())
    }

    async fn mark_failed(&self, id: &str, failure: Option<&FailureInfo>) -> Result<(), StoreError> {
        let mut state = self.state.lock();

        if let Some(message) = state.consumed.get_mut(id) {
            message.has_failed = true;
            message.failure = failure.cloned();
        } else if let Some(message) = state.waiting.iter_mut().find(|message| message.id == id) {
            // Mirrors the SQL adapter: flagging an unclaimed row does not
            // change its eligibility.
            message.has_failed = true;
            message.failure = failure.cloned();
        }

        Ok(())
    }
}
