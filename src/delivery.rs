// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Delivery Attempt Tracking
//!
//! The attempt counter travels inside the message headers, so retry state
//! survives process restarts and broker redelivery without any external store.

use crate::message::{HeaderValue, Message};

/// Header carrying how many times a message lineage has been retried
pub const AMQP_HEADERS_DELIVERY_ATTEMPTS: &str = "x-delivery-attempts";

/// Reads and advances the attempt counter and decides retry versus quarantine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeliveryTracker {
    max_delivery_limit: u32,
    strip_on_quarantine: bool,
}

impl DeliveryTracker {
    /// Creates a tracker allowing `max_delivery_limit` attempts before quarantine.
    pub fn new(max_delivery_limit: u32) -> DeliveryTracker {
        DeliveryTracker {
            max_delivery_limit,
            strip_on_quarantine: true,
        }
    }

    /// Keeps the attempt header on quarantined copies when `strip` is false.
    pub fn strip_on_quarantine(mut self, strip: bool) -> Self {
        self.strip_on_quarantine = strip;
        self
    }

    /// Highest attempt count still handed to a handler.
    pub fn max_delivery_limit(&self) -> u32 {
        self.max_delivery_limit
    }

    /// Attempts recorded on the message; absent, negative or non-integer values count as 0.
    pub fn attempts(&self, message: &Message) -> u32 {
        message
            .headers
            .get(AMQP_HEADERS_DELIVERY_ATTEMPTS)
            .and_then(HeaderValue::as_u64)
            .map(|v| u32::try_from(v).unwrap_or(u32::MAX))
            .unwrap_or_default()
    }

    /// Returns a copy with the same body and headers, and the counter advanced by one.
    pub fn increment_attempts(&self, message: &Message) -> Message {
        let attempts = self.attempts(message).saturating_add(1);

        message
            .clone()
            .header(AMQP_HEADERS_DELIVERY_ATTEMPTS, attempts)
    }

    /// A message may reach the handler while it has a body and its counter is
    /// within the delivery limit.
    pub fn is_retryable(&self, message: &Message) -> bool {
        !message.is_empty() && self.attempts(message) <= self.max_delivery_limit
    }

    /// Negation of [`DeliveryTracker::is_retryable`].
    pub fn is_quarantine_candidate(&self, message: &Message) -> bool {
        !self.is_retryable(message)
    }

    /// The copy published to the dead-letter target.
    pub fn quarantine_copy(&self, message: &Message) -> Message {
        let mut copy = message.clone();
        if self.strip_on_quarantine {
            copy.headers.remove(AMQP_HEADERS_DELIVERY_ATTEMPTS);
        }
        copy
    }
}
