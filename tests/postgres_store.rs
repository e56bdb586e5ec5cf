//! Integration suite for the PostgreSQL store.
//!
//! Requires a reachable database; set `TEST_DATABASE_URL` to run, otherwise
//! every test skips. Each test creates its own uniquely named queue table
//! and drops it on the way out, so the suite is safe to run concurrently
//! against a shared database.

mod common;

use std::collections::HashSet;
use std::sync::Arc;

use futures::future::join_all;
use message_broker::store::PgMessageStore;
use message_broker::{
    property, ConsumerFactory, Delivery, Envelope, MessagePublisher, PgStoreConfig, Properties,
    PublisherConfig,
};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use uuid::Uuid;

use common::{codec, MockMessage};

struct TestStore {
    store: Arc<PgMessageStore>,
    table: String,
}

impl TestStore {
    async fn teardown(&self) {
        let _ = sqlx::query(&format!(r#"DROP TABLE IF EXISTS "public"."{}""#, self.table))
            .execute(self.store.pool())
            .await;
    }
}

async fn test_pool() -> Option<PgPool> {
    let Ok(url) = std::env::var("TEST_DATABASE_URL") else {
        eprintln!("TEST_DATABASE_URL not set, skipping PostgreSQL integration test");
        return None;
    };

    let pool = PgPoolOptions::new()
        .max_connections(8)
        .connect(&url)
        .await
        .expect("connect to test database");
    Some(pool)
}

async fn test_store(pool: PgPool, listen_enabled: bool) -> TestStore {
    let table = format!("mb_test_{}", Uuid::new_v4().simple());
    let config = PgStoreConfig {
        table: table.clone(),
        listen_channel: table.clone(),
        listen_enabled,
        queue_check_delay_ms: 200,
        ..PgStoreConfig::default()
    };

    let store = PgMessageStore::new(pool, config).expect("valid store config");
    store.setup().await.expect("create queue table");
    TestStore {
        store: Arc::new(store),
        table,
    }
}

#[tokio::test]
async fn round_trip_is_fifo_and_ack_is_terminal() {
    let Some(pool) = test_pool().await else {
        return;
    };
    let fixture = test_store(pool, false).await;
    let store = fixture.store.clone();
    let codec = codec();

    let publisher = MessagePublisher::new(
        store.clone(),
        codec.clone(),
        codec.clone(),
        PublisherConfig::default(),
    );
    let consumer = ConsumerFactory::new(store, codec.clone(), codec.clone()).consumer(None);

    let first = publisher
        .dispatch(&mut Envelope::wrap(MockMessage::new(1)), None)
        .await
        .unwrap();
    let second = publisher
        .dispatch(&mut Envelope::wrap(MockMessage::new(2)), None)
        .await
        .unwrap();

    let delivery = consumer.get().await.unwrap().expect("first message");
    assert_eq!(delivery.message_id(), Some(first));
    let envelope = delivery.envelope().expect("decoded");
    assert_eq!(
        envelope.downcast_ref::<MockMessage>(),
        Some(&MockMessage::new(1))
    );
    consumer.ack(&delivery).await.unwrap();

    let delivery = consumer.get().await.unwrap().expect("second message");
    assert_eq!(delivery.message_id(), Some(second));
    consumer.ack(&delivery).await.unwrap();

    assert!(consumer.get().await.unwrap().is_none());

    fixture.teardown().await;
}

#[tokio::test]
async fn retry_requeue_keeps_identity_and_bumps_count() {
    let Some(pool) = test_pool().await else {
        return;
    };
    let fixture = test_store(pool, false).await;
    let store = fixture.store.clone();
    let codec = codec();

    let publisher = MessagePublisher::new(
        store.clone(),
        codec.clone(),
        codec.clone(),
        PublisherConfig::default(),
    );
    let consumer = ConsumerFactory::new(store, codec.clone(), codec.clone()).consumer(None);

    let id = publisher
        .dispatch(&mut Envelope::wrap(MockMessage::new(1)), None)
        .await
        .unwrap();

    let delivery = consumer.get().await.unwrap().expect("message");
    let serial = delivery.serial().expect("serial");

    let Delivery::Decoded(mut envelope) = delivery else {
        panic!("expected decoded envelope");
    };
    envelope.with_properties([(property::RETRY_COUNT.to_string(), "1".to_string())]);
    consumer.reject(&envelope, None).await.unwrap();

    let requeued = consumer.get().await.unwrap().expect("requeued message");
    assert_eq!(requeued.message_id(), Some(id));
    assert_eq!(requeued.serial(), Some(serial));
    assert_eq!(requeued.property(property::RETRY_COUNT), Some("1"));

    // A far-future delay takes the record out of circulation.
    let Delivery::Decoded(mut envelope) = requeued else {
        panic!("expected decoded envelope");
    };
    envelope.with_properties([
        (property::RETRY_COUNT.to_string(), "2".to_string()),
        (property::RETRY_DELAY.to_string(), "100000000".to_string()),
    ]);
    consumer.reject(&envelope, None).await.unwrap();

    assert!(consumer.get().await.unwrap().is_none());

    fixture.teardown().await;
}

#[tokio::test]
async fn dead_lettered_message_is_not_returned() {
    let Some(pool) = test_pool().await else {
        return;
    };
    let fixture = test_store(pool, false).await;
    let store = fixture.store.clone();
    let codec = codec();

    let publisher = MessagePublisher::new(
        store.clone(),
        codec.clone(),
        codec.clone(),
        PublisherConfig::default(),
    );
    let consumer = ConsumerFactory::new(store.clone(), codec.clone(), codec.clone()).consumer(None);

    let id = publisher
        .dispatch(&mut Envelope::wrap(MockMessage::new(1)), None)
        .await
        .unwrap();

    let delivery = consumer.get().await.unwrap().expect("message");
    let error = std::io::Error::other("handler exploded");
    consumer
        .reject(&delivery, Some(&error as &(dyn std::error::Error + 'static)))
        .await
        .unwrap();

    assert!(consumer.get().await.unwrap().is_none());

    let (has_failed, message): (bool, Option<String>) = sqlx::query_as(&format!(
        r#"SELECT "has_failed", "error_message" FROM "public"."{}" WHERE "id" = $1"#,
        fixture.table,
    ))
    .bind(id.as_uuid())
    .fetch_one(store.pool())
    .await
    .unwrap();

    assert!(has_failed);
    assert_eq!(message.as_deref(), Some("handler exploded"));

    fixture.teardown().await;
}

#[tokio::test]
async fn competing_consumers_claim_distinct_rows() {
    let Some(pool) = test_pool().await else {
        return;
    };
    let fixture = test_store(pool, false).await;
    let store = fixture.store.clone();
    let codec = codec();

    let publisher = MessagePublisher::new(
        store.clone(),
        codec.clone(),
        codec.clone(),
        PublisherConfig::default(),
    );

    let message_count = 3usize;
    for order_id in 0..message_count {
        publisher
            .dispatch(&mut Envelope::wrap(MockMessage::new(order_id as i64)), None)
            .await
            .unwrap();
    }

    let factory = ConsumerFactory::new(store, codec.clone(), codec.clone());
    let tasks: Vec<_> = (0..4)
        .map(|_| {
            let consumer = factory.consumer(None);
            tokio::spawn(async move {
                let mut seen = Vec::new();
                while let Some(delivery) = consumer.get().await.unwrap() {
                    let id = delivery.message_id().expect("id");
                    consumer.ack(&delivery).await.unwrap();
                    seen.push(id);
                }
                seen
            })
        })
        .collect();

    let mut all = Vec::new();
    for result in join_all(tasks).await {
        all.extend(result.unwrap());
    }

    let distinct: HashSet<_> = all.iter().copied().collect();
    assert_eq!(all.len(), message_count, "no message lost");
    assert_eq!(distinct.len(), message_count, "no duplicates");

    fixture.teardown().await;
}

#[tokio::test]
async fn listen_mode_still_drains_the_queue() {
    let Some(pool) = test_pool().await else {
        return;
    };
    let fixture = test_store(pool, true).await;
    let store = fixture.store.clone();
    let codec = codec();

    let publisher = MessagePublisher::new(
        store.clone(),
        codec.clone(),
        codec.clone(),
        PublisherConfig::default(),
    );
    let consumer = ConsumerFactory::new(store, codec.clone(), codec.clone()).consumer(None);

    // Open the cooldown window with an empty poll, then dispatch. The next
    // poll must find the message whether the notification arrives or the
    // bounded wait simply elapses.
    assert!(consumer.get().await.unwrap().is_none());

    publisher
        .dispatch(&mut Envelope::wrap(MockMessage::new(1)), None)
        .await
        .unwrap();

    let delivery = consumer
        .get()
        .await
        .unwrap()
        .expect("message after wake-up");
    consumer.ack(&delivery).await.unwrap();
    assert!(consumer.get().await.unwrap().is_none());

    fixture.teardown().await;
}

#[tokio::test]
async fn scalar_header_values_from_other_producers_are_tolerated() {
    let Some(pool) = test_pool().await else {
        return;
    };
    let fixture = test_store(pool, false).await;
    let store = fixture.store.clone();
    let codec = codec();

    // Other producers may store non-string header values, an integer
    // serial being the common case. Claiming such a row must stringify
    // the values instead of abandoning it mid-claim.
    sqlx::query(&format!(
        r#"
        INSERT INTO "public"."{}" ("id", "headers", "body")
        VALUES ($1, $2, $3)
        "#,
        fixture.table,
    ))
    .bind(Uuid::new_v4())
    .bind(sqlx::types::Json(serde_json::json!({
        "message-type": "mock_message",
        "content-type": "application/json",
        "x-serial": 7,
        "retry-count": 0,
    })))
    .bind(br#"{"order_id":9}"#.as_slice())
    .execute(store.pool())
    .await
    .unwrap();

    let consumer = ConsumerFactory::new(store, codec.clone(), codec.clone()).consumer(None);
    let delivery = consumer.get().await.unwrap().expect("delivery");
    let envelope = delivery.envelope().expect("decoded envelope");

    assert_eq!(
        envelope.downcast_ref::<MockMessage>(),
        Some(&MockMessage::new(9))
    );
    assert!(delivery.serial().is_some());
    consumer.ack(&delivery).await.unwrap();

    fixture.teardown().await;
}

#[tokio::test]
async fn record_without_type_metadata_degrades_to_broken() {
    let Some(pool) = test_pool().await else {
        return;
    };
    let fixture = test_store(pool, false).await;
    let store = fixture.store.clone();
    let codec = codec();

    sqlx::query(&format!(
        r#"
        INSERT INTO "public"."{}" ("id", "headers", "body")
        VALUES ($1, $2, $3)
        "#,
        fixture.table,
    ))
    .bind(Uuid::new_v4())
    .bind(sqlx::types::Json(serde_json::json!({
        "content-type": "application/json",
    })))
    .bind(b"{}".as_slice())
    .execute(store.pool())
    .await
    .unwrap();

    let consumer = ConsumerFactory::new(store, codec.clone(), codec.clone()).consumer(None);
    let delivery = consumer.get().await.unwrap().expect("delivery");
    let broken = delivery.broken().expect("broken envelope");

    assert_eq!(broken.body(), b"{}");
    assert!(delivery.message_id().is_some());
    assert!(delivery.serial().is_some());

    fixture.teardown().await;
}
