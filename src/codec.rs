//! # Serialization Ports
//!
//! The broker core never decides how payloads look on the wire. It consumes
//! two capabilities: a [`Serializer`] turning typed messages into bytes (and
//! back) for a given content type, and a [`NameMap`] translating between
//! runtime types and wire type tags.
//!
//! Both are intentionally treated as untrusted by the consumer side: a codec
//! may raise arbitrary errors and the broker absorbs them by dead-lettering
//! the record and handing back a broken envelope instead of propagating.
//!
//! [`JsonCodec`] is the batteries-included implementation of both ports,
//! backed by an explicit type registry and `serde_json`.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::envelope::property;

/// Object-safe payload contract.
///
/// Blanket-implemented for every `'static + Send + Sync + Debug` type, so
/// plain structs qualify without ceremony.
pub trait Message: Any + Send + Sync + fmt::Debug {
    fn as_any(&self) -> &dyn Any;

    /// Fully qualified runtime type name, used as the last-resort wire tag.
    fn type_name(&self) -> &'static str;
}

impl<T> Message for T
where
    T: Any + Send + Sync + fmt::Debug,
{
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

/// Codec error types
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("unsupported content type: {content_type}")]
    UnsupportedContentType { content_type: String },

    #[error("unknown message type: {type_name}")]
    UnknownType { type_name: String },

    #[error("failed to encode {type_name}: {source}")]
    Encode {
        type_name: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to decode {type_name}: {source}")]
    Decode {
        type_name: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Turns a typed message into bytes and back for a given content type.
pub trait Serializer: Send + Sync {
    fn serialize(&self, message: &dyn Message, content_type: &str) -> Result<Vec<u8>, CodecError>;

    fn deserialize(
        &self,
        type_name: &str,
        content_type: &str,
        body: &[u8],
    ) -> Result<Box<dyn Message>, CodecError>;
}

/// Maps runtime types to wire type tags and back.
pub trait NameMap: Send + Sync {
    /// Resolve a wire tag to the canonical type name understood by the
    /// serializer. Unknown tags pass through unchanged.
    fn to_type_name(&self, tag: &str) -> String;

    /// Derive the wire tag for a message from its runtime type.
    fn from_message(&self, message: &dyn Message) -> String;
}

struct TypeEntry {
    tag: String,
    type_name: &'static str,
    encode: Box<dyn Fn(&dyn Message) -> Result<Vec<u8>, CodecError> + Send + Sync>,
    decode: Box<dyn Fn(&[u8]) -> Result<Box<dyn Message>, CodecError> + Send + Sync>,
}

/// JSON implementation of [`Serializer`] and [`NameMap`] over an explicit
/// type registry.
///
/// Every payload type must be registered with its wire tag before messages
/// of that type can round-trip. Outbound messages of unregistered types
/// still get a tag (their runtime type name) so the failure surfaces on the
/// publish path, not silently at consume time.
#[derive(Default)]
pub struct JsonCodec {
    entries: Vec<TypeEntry>,
    by_tag: HashMap<String, usize>,
    by_type_name: HashMap<&'static str, usize>,
    by_type_id: HashMap<TypeId, usize>,
}

impl JsonCodec {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a payload type under a wire tag.
    ///
    /// Later registrations win when a tag is reused.
    pub fn register<T>(&mut self, tag: &str) -> &mut Self
    where
        T: Message + Serialize + DeserializeOwned,
    {
        let type_name = std::any::type_name::<T>();
        let entry = TypeEntry {
            tag: tag.to_string(),
            type_name,
            encode: Box::new(move |message| {
                let concrete = message
                    .as_any()
                    .downcast_ref::<T>()
                    .ok_or_else(|| CodecError::UnknownType {
                        type_name: message.type_name().to_string(),
                    })?;
                serde_json::to_vec(concrete).map_err(|source| CodecError::Encode {
                    type_name: type_name.to_string(),
                    source,
                })
            }),
            decode: Box::new(move |body| {
                let concrete: T =
                    serde_json::from_slice(body).map_err(|source| CodecError::Decode {
                        type_name: type_name.to_string(),
                        source,
                    })?;
                Ok(Box::new(concrete) as Box<dyn Message>)
            }),
        };

        let index = self.entries.len();
        self.by_tag.insert(entry.tag.clone(), index);
        self.by_type_name.insert(type_name, index);
        self.by_type_id.insert(TypeId::of::<T>(), index);
        self.entries.push(entry);
        self
    }

    fn check_content_type(content_type: &str) -> Result<(), CodecError> {
        if content_type == property::DEFAULT_CONTENT_TYPE {
            Ok(())
        } else {
            Err(CodecError::UnsupportedContentType {
                content_type: content_type.to_string(),
            })
        }
    }

    fn entry_for_name(&self, type_name: &str) -> Option<&TypeEntry> {
        self.by_type_name
            .get(type_name)
            .or_else(|| self.by_tag.get(type_name))
            .map(|index| &self.entries[*index])
    }
}

impl Serializer for JsonCodec {
    fn serialize(&self, message: &dyn Message, content_type: &str) -> Result<Vec<u8>, CodecError> {
        Self::check_content_type(content_type)?;

        let entry = self
            .by_type_id
            .get(&message.as_any().type_id())
            .map(|index| &self.entries[*index])
            .ok_or_else(|| CodecError::UnknownType {
                type_name: message.type_name().to_string(),
            })?;

        (entry.encode)(message)
    }

    fn deserialize(
        &self,
        type_name: &str,
        content_type: &str,
        body: &[u8],
    ) -> Result<Box<dyn Message>, CodecError> {
        Self::check_content_type(content_type)?;

        let entry = self
            .entry_for_name(type_name)
            .ok_or_else(|| CodecError::UnknownType {
                type_name: type_name.to_string(),
            })?;

        (entry.decode)(body)
    }
}

impl NameMap for JsonCodec {
    fn to_type_name(&self, tag: &str) -> String {
        match self.by_tag.get(tag) {
            Some(index) => self.entries[*index].type_name.to_string(),
            None => tag.to_string(),
        }
    }

    fn from_message(&self, message: &dyn Message) -> String {
        match self.by_type_id.get(&message.as_any().type_id()) {
            Some(index) => self.entries[*index].tag.clone(),
            None => message.type_name().to_string(),
        }
    }
}

impl fmt::Debug for JsonCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JsonCodec")
            .field("registered", &self.by_tag.keys().collect::<Vec<_>>())
            .finish()
    }
}
