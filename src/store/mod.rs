//! # Storage Adapter Port
//!
//! Five primitives that any backing store must implement atomically. The
//! orchestration core takes this interface by composition and never runs
//! multi-statement transactions of its own: each primitive is one atomic
//! round trip, or fully failed.
//!
//! Two adapters ship with the crate: [`postgres::PgMessageStore`], the
//! reference implementation built on `UPDATE ... FOR UPDATE SKIP LOCKED`,
//! and [`memory::MemoryMessageStore`], a contract-equivalent in-process
//! double for exercising the core without a database.

pub mod memory;
pub mod postgres;

use std::collections::HashMap;

use async_trait::async_trait;

use crate::envelope::MessageId;
use crate::error::StoreError;

pub use memory::MemoryMessageStore;
pub use postgres::PgMessageStore;

/// One claimed queue record, as handed back by [`MessageStore::fetch_next`].
///
/// The `id` is the driver-level identifier as text: keeping it opaque here
/// lets the consumer dead-letter a record whose id turns out to be
/// malformed, instead of losing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedRecord {
    pub id: String,
    /// Monotonically increasing per-store sequence, FIFO tie-break.
    pub serial: i64,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
    pub retry_count: Option<i64>,
}

/// Diagnostics recorded when a message is dead-lettered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureInfo {
    pub code: i64,
    pub message: String,
    /// Normalized multi-cause trace, one cause per line.
    pub trace: String,
}

impl FailureInfo {
    pub fn new(code: i64, message: impl Into<String>, trace: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            trace: trace.into(),
        }
    }

    /// Build diagnostics from an error, walking its `source()` chain.
    pub fn from_error(error: &(dyn std::error::Error + 'static)) -> Self {
        let mut trace = String::new();
        let mut current: Option<&(dyn std::error::Error + 'static)> = Some(error);
        while let Some(cause) = current {
            if !trace.is_empty() {
                trace.push('\n');
            }
            trace.push_str(&cause.to_string());
            current = cause.source();
        }

        Self {
            code: 0,
            message: error.to_string(),
            trace,
        }
    }
}

/// Atomic storage primitives backing the broker.
///
/// Lifecycle of a record: inserted unclaimed, repeatedly claimed/released
/// across retries, then terminally acknowledged or marked failed. Records
/// are never deleted by this port; archival is a store concern.
#[async_trait]
pub trait MessageStore: Send + Sync {
    /// Atomically claim the next eligible record from the given queues.
    ///
    /// Eligible means unclaimed and not retry-delayed; candidates are taken
    /// in ascending serial order. The same record must never be returned to
    /// two concurrent callers. `None` when nothing is eligible.
    async fn fetch_next(&self, queues: &[String]) -> Result<Option<FetchedRecord>, StoreError>;

    /// Atomically append a new unclaimed record.
    async fn insert(
        &self,
        id: &MessageId,
        queue: &str,
        headers: &HashMap<String, String>,
        body: &[u8],
    ) -> Result<(), StoreError>;

    /// Finalize a previously claimed record. May be a no-op when claiming
    /// already committed consumption; must be idempotent.
    async fn ack(&self, id: &MessageId) -> Result<(), StoreError>;

    /// Atomically release a claimed record for another attempt: clear the
    /// claim, persist the updated headers, advance the retry counter
    /// monotonically (never below `retry_count`), and delay eligibility by
    /// `delay_ms`.
    async fn mark_for_retry(
        &self,
        id: &MessageId,
        headers: &HashMap<String, String>,
        retry_count: i64,
        delay_ms: i64,
    ) -> Result<(), StoreError>;

    /// Atomically flip the terminal-failure flag, optionally recording
    /// diagnostics. Takes the raw record id because the failure may have
    /// happened before a typed id could be constructed.
    async fn mark_failed(&self, id: &str, failure: Option<&FailureInfo>)
        -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CodecError;

    #[test]
    fn failure_info_walks_cause_chain() {
        let source = serde_json::from_str::<serde_json::Value>("nope").unwrap_err();
        let err = CodecError::Decode {
            type_name: "Mock".to_string(),
            source,
        };

        let info = FailureInfo::from_error(&err);
        assert_eq!(info.code, 0);
        assert!(info.message.contains("failed to decode Mock"));

        let lines: Vec<&str> = info.trace.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("failed to decode Mock"));
        assert!(lines[1].contains("expected"));
    }
}
