//! Shared fixtures for the behavioral test suites.

#![allow(dead_code)]

use std::sync::Arc;

use message_broker::JsonCodec;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MockMessage {
    pub order_id: i64,
}

impl MockMessage {
    pub fn new(order_id: i64) -> Self {
        Self { order_id }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OtherMessage {
    pub note: String,
}

/// Codec with both mock payload types registered.
pub fn codec() -> Arc<JsonCodec> {
    let mut codec = JsonCodec::new();
    codec.register::<MockMessage>("mock_message");
    codec.register::<OtherMessage>("other_message");
    Arc::new(codec)
}
