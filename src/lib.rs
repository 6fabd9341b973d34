// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

mod otel;
#[cfg(test)]
mod testing;

pub mod channel;
pub mod client;
pub mod configs;
pub mod consumer;
pub mod delivery;
pub mod errors;
pub mod exchange;
pub mod lapin_client;
pub mod message;
pub mod publisher;
pub mod queue;
pub mod status;
pub mod topology;
