// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Message Model
//!
//! Broker independent representation of outgoing messages and incoming
//! deliveries. Headers are a string keyed map of scalar or structured values;
//! the lapin binding converts them to and from AMQP field tables.

use crate::errors::AmqpError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::error;

/// Default content type for structured payloads
pub const JSON_CONTENT_TYPE: &str = "application/json";

/// Message headers, ordered by key.
pub type Headers = BTreeMap<String, HeaderValue>;

/// A single header value.
///
/// Deserializes untagged from plain config values. Integers prefer `Int` and
/// fall back to `UInt` above `i64::MAX`; `Bytes` is never produced this way.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum HeaderValue {
    Bool(bool),
    Int(i64),
    UInt(u64),
    Float(f64),
    String(String),
    #[serde(skip_deserializing)]
    Bytes(Vec<u8>),
    Array(Vec<HeaderValue>),
    Table(Headers),
}

impl HeaderValue {
    /// Returns the value as an unsigned integer when it holds a non-negative integer.
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            HeaderValue::Int(v) => u64::try_from(*v).ok(),
            HeaderValue::UInt(v) => Some(*v),
            _ => None,
        }
    }

    /// Returns the value as a string slice when it holds a string.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            HeaderValue::String(v) => Some(v),
            _ => None,
        }
    }
}

impl From<bool> for HeaderValue {
    fn from(value: bool) -> Self {
        HeaderValue::Bool(value)
    }
}

impl From<i64> for HeaderValue {
    fn from(value: i64) -> Self {
        HeaderValue::Int(value)
    }
}

impl From<u32> for HeaderValue {
    fn from(value: u32) -> Self {
        HeaderValue::Int(i64::from(value))
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        HeaderValue::String(value.to_owned())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        HeaderValue::String(value)
    }
}

/// Application data handed to the publisher.
///
/// Raw bytes are sent as they are; structured values go through the JSON codec
/// in [`Payload::encode`], which is the only place application data becomes a
/// transport body.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    RawBytes(Vec<u8>),
    StructuredValue(serde_json::Value),
}

impl Payload {
    /// Builds a structured payload from any serializable value.
    pub fn structured<T>(value: &T) -> Result<Payload, AmqpError>
    where
        T: Serialize + ?Sized,
    {
        match serde_json::to_value(value) {
            Ok(v) => Ok(Payload::StructuredValue(v)),
            Err(err) => {
                error!(error = err.to_string(), "failure to serialize payload");
                Err(AmqpError::ParsePayloadError)
            }
        }
    }

    /// Converts the payload into a transport body and its content type.
    pub fn encode(self) -> Result<(Vec<u8>, Option<String>), AmqpError> {
        match self {
            Payload::RawBytes(bytes) => Ok((bytes, None)),
            Payload::StructuredValue(value) => match serde_json::to_vec(&value) {
                Ok(bytes) => Ok((bytes, Some(JSON_CONTENT_TYPE.to_owned()))),
                Err(err) => {
                    error!(error = err.to_string(), "failure to encode payload");
                    Err(AmqpError::ParsePayloadError)
                }
            },
        }
    }
}

impl From<Vec<u8>> for Payload {
    fn from(value: Vec<u8>) -> Self {
        Payload::RawBytes(value)
    }
}

impl From<&[u8]> for Payload {
    fn from(value: &[u8]) -> Self {
        Payload::RawBytes(value.to_vec())
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        Payload::StructuredValue(value)
    }
}

/// A message ready to be sent, or the content of a delivery.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub body: Vec<u8>,
    pub headers: Headers,
    pub content_type: Option<String>,
    pub persistent: bool,
}

impl Message {
    /// Creates a persistent message with the given body and no headers.
    pub fn new(body: impl Into<Vec<u8>>) -> Message {
        Message {
            body: body.into(),
            headers: Headers::default(),
            content_type: None,
            persistent: true,
        }
    }

    /// Encodes a payload into a persistent message carrying `headers`.
    pub fn from_payload(payload: Payload, headers: Headers) -> Result<Message, AmqpError> {
        let (body, content_type) = payload.encode()?;

        Ok(Message {
            body,
            headers,
            content_type,
            persistent: true,
        })
    }

    /// Sets header `key`.
    pub fn header(mut self, key: &str, value: impl Into<HeaderValue>) -> Self {
        self.headers.insert(key.to_owned(), value.into());
        self
    }

    /// Inserts every header of `extra`, overriding existing keys.
    pub fn with_headers(mut self, extra: &Headers) -> Self {
        for (key, value) in extra {
            self.headers.insert(key.clone(), value.clone());
        }
        self
    }

    /// Returns `true` if the body has no bytes.
    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }
}

/// One delivery of a message, identified by its broker assigned tag.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub redelivered: bool,
    pub exchange: String,
    pub routing_key: String,
    pub message: Message,
}

impl Delivery {
    /// Creates a first-time delivery with no exchange or routing key.
    pub fn new(delivery_tag: u64, message: Message) -> Delivery {
        Delivery {
            delivery_tag,
            redelivered: false,
            exchange: String::new(),
            routing_key: String::new(),
            message,
        }
    }
}
