// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! In-process message bus connecting channel adapters to the agent loop.
//!
//! Two FIFO queues (inbound, outbound) with depth introspection for the
//! health endpoint. Per consumer, delivery order matches publish order.

pub mod events;
pub mod queue;

pub use events::{InboundMessage, OutboundMessage};
pub use queue::MessageBus;
