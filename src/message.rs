// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Messages
//!
//! `Message` is the envelope exchanged by producers and consumers: a payload viewed
//! either as raw bytes or as text, a correlation id, an optional reply-to routing key
//! and the delivery tag of the delivery it came from.
//!
//! Both payload views are computed at most once. A message built from text derives
//! its bytes on first use, a delivered message derives its text on first use.
//!
//! `TypedMessage<T>` adds a JSON value view. Outbound messages encode the value once
//! at construction; inbound messages decode it on first access.

use crate::{backup, channel::Delivery, errors::AmqpError};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{fmt, ops::Deref, path::Path, sync::OnceLock};
use uuid::Uuid;

/// Generates a new correlation id.
pub fn new_correlation_id() -> String {
    Uuid::new_v4().simple().to_string()
}

/// Message envelope.
#[derive(Debug, Clone, Default)]
pub struct Message {
    body: OnceLock<Vec<u8>>,
    content: OnceLock<String>,
    delivery_tag: u64,
    reply_to: Option<String>,
    correlation_id: String,
}

impl Message {
    /// Creates an outbound message. A correlation id is generated when none is given.
    pub fn new(content: impl Into<String>, correlation_id: Option<String>) -> Self {
        Message {
            body: OnceLock::new(),
            content: OnceLock::from(content.into()),
            delivery_tag: 0,
            reply_to: None,
            correlation_id: correlation_id.unwrap_or_else(new_correlation_id),
        }
    }

    /// Wraps a delivered message.
    pub fn from_delivery(delivery: &Delivery) -> Self {
        Message {
            body: OnceLock::from(delivery.data.clone()),
            content: OnceLock::new(),
            delivery_tag: delivery.delivery_tag,
            reply_to: delivery
                .properties
                .reply_to()
                .as_ref()
                .map(|r| r.as_str().to_owned())
                .filter(|r| !r.is_empty()),
            correlation_id: delivery
                .properties
                .correlation_id()
                .as_ref()
                .map(|c| c.as_str().to_owned())
                .unwrap_or_default(),
        }
    }

    pub fn content(&self) -> &str {
        self.content.get_or_init(|| {
            let body = self.body.get().map(Vec::as_slice).unwrap_or_default();
            String::from_utf8_lossy(body).into_owned()
        })
    }

    pub fn body(&self) -> &[u8] {
        self.body.get_or_init(|| {
            self.content
                .get()
                .map(|c| c.as_bytes().to_vec())
                .unwrap_or_default()
        })
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn reply_to(&self) -> Option<&str> {
        self.reply_to.as_deref()
    }

    pub fn delivery_tag(&self) -> u64 {
        self.delivery_tag
    }

    pub(crate) fn with_reply_to(mut self, reply_to: Option<String>) -> Self {
        self.reply_to = reply_to;
        self
    }

    /// Typed view of this message, decoded on first access.
    pub fn cast<T>(&self) -> TypedMessage<T> {
        TypedMessage {
            message: self.clone(),
            value: OnceLock::new(),
        }
    }

    /// Serializable snapshot used by the backup files.
    pub fn snapshot(&self) -> MessageRecord {
        MessageRecord {
            delivery_tag: self.delivery_tag,
            reply_to: self.reply_to.clone(),
            correlation_id: self.correlation_id.clone(),
            content: self.content().to_owned(),
        }
    }

    /// Appends a snapshot of the message to `path`.
    pub async fn backup(&self, path: &Path) -> Result<(), AmqpError> {
        let line = serde_json::to_string(&self.snapshot())
            .map_err(|err| AmqpError::SerializePayloadError(err.to_string()))?;
        backup::append_line(path, &line).await
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.content())
    }
}

/// One line of a backup file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    pub delivery_tag: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    pub correlation_id: String,
    pub content: String,
}

/// A message with a JSON decoded value of type `T`.
#[derive(Debug, Clone)]
pub struct TypedMessage<T> {
    message: Message,
    value: OnceLock<T>,
}

impl<T: Serialize> TypedMessage<T> {
    /// Creates an outbound message, encoding `value` once.
    pub fn new(value: T, correlation_id: Option<String>) -> Result<Self, AmqpError> {
        let content = serde_json::to_string(&value)
            .map_err(|err| AmqpError::SerializePayloadError(err.to_string()))?;

        Ok(TypedMessage {
            message: Message::new(content, correlation_id),
            value: OnceLock::from(value),
        })
    }
}

impl<T: DeserializeOwned> TypedMessage<T> {
    /// The decoded value. Decoding happens at most once.
    pub fn value(&self) -> Result<&T, AmqpError> {
        if let Some(value) = self.value.get() {
            return Ok(value);
        }

        let decoded = decode::<T>(self.message.content())?;
        Ok(self.value.get_or_init(|| decoded))
    }

    pub fn into_value(self) -> Result<T, AmqpError> {
        match self.value.into_inner() {
            Some(value) => Ok(value),
            None => decode(self.message.content()),
        }
    }
}

impl<T> TypedMessage<T> {
    pub(crate) fn with_reply_to(mut self, reply_to: Option<String>) -> Self {
        self.message = self.message.with_reply_to(reply_to);
        self
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn into_message(self) -> Message {
        self.message
    }
}

impl<T> Deref for TypedMessage<T> {
    type Target = Message;

    fn deref(&self) -> &Message {
        &self.message
    }
}

fn decode<T: DeserializeOwned>(content: &str) -> Result<T, AmqpError> {
    serde_json::from_str(content).map_err(|err| AmqpError::ParsePayloadError(err.to_string()))
}
