//! # PostgreSQL Store
//!
//! Reference implementation of the storage port on a PostgreSQL-only
//! dialect. Claiming is a single `UPDATE` whose `WHERE` clause subqueries
//! the oldest eligible row `FOR UPDATE SKIP LOCKED` and returns the updated
//! columns in one round trip: N concurrent pollers each grab a distinct row
//! without blocking on each other's in-flight transactions, trading strict
//! FIFO for lock-free throughput.
//!
//! With `listen_enabled`, inserts additionally `pg_notify` the configured
//! channel and an idle consumer parks on that channel between polls. The
//! wait is always bounded by `queue_check_delay_ms`, so a lost notification
//! costs latency, never liveness.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use sqlx::postgres::PgListener;
use sqlx::{PgPool, Row};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::PgStoreConfig;
use crate::envelope::MessageId;
use crate::error::StoreError;
use crate::store::{FailureInfo, FetchedRecord, MessageStore};

/// Decode a stored `headers` jsonb value leniently.
///
/// Rows written by other producers may carry scalar header values (an
/// integer serial, a boolean flag); those are stringified instead of
/// rejected. Only a top-level value that is not an object is an error.
fn headers_from_value(
    value: serde_json::Value,
) -> Result<HashMap<String, String>, serde_json::Error> {
    use serde::de::Error as _;

    let serde_json::Value::Object(map) = value else {
        return Err(serde_json::Error::custom("header map is not a JSON object"));
    };

    Ok(map
        .into_iter()
        .map(|(name, value)| {
            let value = match value {
                serde_json::Value::String(value) => value,
                other => other.to_string(),
            };
            (name, value)
        })
        .collect())
}

/// PostgreSQL-backed message store.
pub struct PgMessageStore {
    pool: PgPool,
    config: PgStoreConfig,
    /// Fully qualified, quoted table reference. Identifiers are validated
    /// at construction, quoting here is belt and braces.
    table: String,
    /// Set when the last classic poll came back empty; gates the
    /// notification wait so a busy queue is never slowed down by it.
    emptied_at: parking_lot::Mutex<Option<Instant>>,
    /// Lazily connected notification listener. tokio mutex because the
    /// guard is held across `recv().await`.
    listener: tokio::sync::Mutex<Option<PgListener>>,
}

impl PgMessageStore {
    /// Build a store over an existing connection pool.
    pub fn new(pool: PgPool, config: PgStoreConfig) -> Result<Self, StoreError> {
        config.validate()?;
        let table = format!("\"{}\".\"{}\"", config.schema, config.table);

        Ok(Self {
            pool,
            config,
            table,
            emptied_at: parking_lot::Mutex::new(None),
            listener: tokio::sync::Mutex::new(None),
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Create the queue table if it does not exist yet.
    pub async fn setup(&self) -> Result<(), StoreError> {
        let ddl = format!(
            r#"
            CREATE TABLE IF NOT EXISTS {table} (
                "id" uuid NOT NULL,
                "serial" bigserial NOT NULL,
                "queue" varchar(500) NOT NULL DEFAULT 'default',
                "created_at" timestamptz NOT NULL DEFAULT now(),
                "consumed_at" timestamptz DEFAULT NULL,
                "has_failed" bool DEFAULT false,
                "headers" jsonb NOT NULL DEFAULT '{{}}'::jsonb,
                "body" bytea NOT NULL,
                "error_code" bigint DEFAULT NULL,
                "error_message" varchar(500) DEFAULT NULL,
                "error_trace" text DEFAULT NULL,
                "retry_count" bigint DEFAULT 0,
                "retry_at" timestamptz DEFAULT NULL,
                PRIMARY KEY ("serial")
            )
            "#,
            table = self.table,
        );

        sqlx::query(&ddl).execute(&self.pool).await?;
        debug!(table = %self.table, "queue table ready");
        Ok(())
    }

    async fn fetch_classic(&self, queues: &[String]) -> Result<Option<FetchedRecord>, StoreError> {
        let sql = format!(
            r#"
            UPDATE {table}
            SET "consumed_at" = current_timestamp
            WHERE "id" IN (
                SELECT "id"
                FROM {table}
                WHERE
                    "queue" = ANY($1)
                    AND "consumed_at" IS NULL
                    AND ("retry_at" IS NULL OR "retry_at" <= current_timestamp)
                ORDER BY "serial" ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING "id", "serial", "headers", "body", "retry_count"
            "#,
            table = self.table,
        );

        let row = sqlx::query(&sql)
            .bind(queues)
            .fetch_optional(&self.pool)
            .await?;

        let Some(row) = row else {
            *self.emptied_at.lock() = Some(Instant::now());
            return Ok(None);
        };
        *self.emptied_at.lock() = None;

        let id: Uuid = row.try_get("id")?;
        let serial: i64 = row.try_get("serial")?;
        let headers: serde_json::Value = row.try_get("headers")?;
        let headers = match headers_from_value(headers) {
            Ok(headers) => headers,
            Err(error) => {
                // The row is already claimed at this point; dead-letter it
                // so it does not stay consumed without a trace.
                warn!(message_id = %id, %error, "unreadable header map, dead-lettering");
                let failure = FailureInfo::from_error(&error);
                self.mark_failed(&id.to_string(), Some(&failure)).await?;
                return Err(StoreError::Headers(error));
            }
        };
        let body: Vec<u8> = row.try_get("body")?;
        let retry_count: Option<i64> = row.try_get("retry_count")?;

        debug!(message_id = %id, serial, "claimed message");

        Ok(Some(FetchedRecord {
            id: id.to_string(),
            serial,
            headers,
            body,
            retry_count,
        }))
    }

    /// How long the consumer should park on the notification channel, if at
    /// all: only while the cooldown window opened by an empty poll is open.
    fn notification_wait(&self) -> Option<Duration> {
        let cooldown = Duration::from_millis(self.config.queue_check_delay_ms);
        let emptied_at = (*self.emptied_at.lock())?;
        cooldown.checked_sub(emptied_at.elapsed())
    }

    /// Park on the wake-up channel for at most `limit`. Failures here are
    /// never fatal: the classic poll runs afterwards regardless.
    async fn await_notification(&self, limit: Duration) {
        let mut guard = self.listener.lock().await;

        if guard.is_none() {
            match PgListener::connect_with(&self.pool).await {
                Ok(mut listener) => match listener.listen(&self.config.listen_channel).await {
                    Ok(()) => {
                        debug!(channel = %self.config.listen_channel, "listening for queue wake-ups");
                        *guard = Some(listener);
                    }
                    Err(error) => {
                        warn!(channel = %self.config.listen_channel, %error, "LISTEN failed, falling back to polling");
                        return;
                    }
                },
                Err(error) => {
                    warn!(%error, "could not open notification connection, falling back to polling");
                    return;
                }
            }
        }

        let Some(listener) = guard.as_mut() else {
            return;
        };
        match tokio::time::timeout(limit, listener.recv()).await {
            Ok(Ok(notification)) => {
                debug!(
                    channel = notification.channel(),
                    payload = notification.payload(),
                    "queue wake-up received"
                );
            }
            Ok(Err(error)) => {
                // Drop the connection, the next call reconnects.
                warn!(%error, "notification listener failed, reconnecting on next poll");
                *guard = None;
            }
            Err(_elapsed) => {
                debug!("no wake-up within cooldown, issuing fallback poll");
            }
        }
    }

    async fn notify(&self, queue: &str) -> Result<(), StoreError> {
        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(&self.config.listen_channel)
            .bind(queue)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl MessageStore for PgMessageStore {
    async fn fetch_next(&self, queues: &[String]) -> Result<Option<FetchedRecord>, StoreError> {
        if self.config.listen_enabled {
            if let Some(limit) = self.notification_wait() {
                self.await_notification(limit).await;
            }
        }

        self.fetch_classic(queues).await
    }

    async fn insert(
        &self,
        id: &MessageId,
        queue: &str,
        headers: &HashMap<String, String>,
        body: &[u8],
    ) -> Result<(), StoreError> {
        let sql = format!(
            r#"
            INSERT INTO {table} ("id", "queue", "headers", "body")
            VALUES ($1, $2, $3, $4)
            "#,
            table = self.table,
        );

        sqlx::query(&sql)
            .bind(id.as_uuid())
            .bind(queue)
            .bind(sqlx::types::Json(headers))
            .bind(body)
            .execute(&self.pool)
            .await?;

        debug!(message_id = %id, queue, "message stored");

        if self.config.listen_enabled {
            self.notify(queue).await?;
        }

        Ok(())
    }

    async fn ack(&self, _id: &MessageId) -> Result<(), StoreError> {
        // Nothing to do, the claim already committed consumption in the
        // UPDATE/RETURNING round trip.
        Ok(())
    }

    async fn mark_for_retry(
        &self,
        id: &MessageId,
        headers: &HashMap<String, String>,
        retry_count: i64,
        delay_ms: i64,
    ) -> Result<(), StoreError> {
        let sql = format!(
            r#"
            UPDATE {table}
            SET
                "consumed_at" = NULL,
                "has_failed" = true,
                "headers" = $1,
                "retry_at" = current_timestamp + ($2::bigint * interval '1 millisecond'),
                "retry_count" = GREATEST("retry_count" + 1, $3)
            WHERE "id" = $4
            "#,
            table = self.table,
        );

        sqlx::query(&sql)
            .bind(sqlx::types::Json(headers))
            .bind(delay_ms)
            .bind(retry_count)
            .bind(id.as_uuid())
            .execute(&self.pool)
            .await?;

        debug!(message_id = %id, retry_count, delay_ms, "message released for retry");
        Ok(())
    }

    async fn mark_failed(
        &self,
        id: &str,
        failure: Option<&FailureInfo>,
    ) -> Result<(), StoreError> {
        let uuid = match Uuid::parse_str(id) {
            Ok(uuid) => uuid,
            Err(error) => {
                // No such row can exist, there is nothing to flag.
                warn!(raw_id = id, %error, "cannot mark malformed id as failed");
                return Ok(());
            }
        };

        match failure {
            Some(failure) => {
                let sql = format!(
                    r#"
                    UPDATE {table}
                    SET
                        "has_failed" = true,
                        "error_code" = $1,
                        "error_message" = $2,
                        "error_trace" = $3
                    WHERE "id" = $4
                    "#,
                    table = self.table,
                );

                let message: String = failure.message.chars().take(500).collect();

                sqlx::query(&sql)
                    .bind(failure.code)
                    .bind(message)
                    .bind(&failure.trace)
                    .bind(uuid)
                    .execute(&self.pool)
                    .await?;
            }
            None => {
                let sql = format!(
                    r#"
                    UPDATE {table}
                    SET "has_failed" = true
                    WHERE "id" = $1
                    "#,
                    table = self.table,
                );

                sqlx::query(&sql).bind(uuid).execute(&self.pool).await?;
            }
        }

        debug!(message_id = %uuid, "message dead-lettered");
        Ok(())
    }
}

impl std::fmt::Debug for PgMessageStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgMessageStore")
            .field("table", &self.table)
            .field("listen_enabled", &self.config.listen_enabled)
            .finish()
    }
}
