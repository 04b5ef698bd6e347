// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;

use crate::{InboundMessage, OutboundMessage};

/// FIFO queue with async consume and O(1) depth introspection.
///
/// A plain `VecDeque` behind a mutex (rather than an mpsc channel) because
/// the health endpoint needs to report queue depths.
struct Fifo<T> {
    items: Mutex<VecDeque<T>>,
    notify: Notify,
}

impl<T> Fifo<T> {
    fn new() -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
        }
    }

    fn push(&self, item: T) {
        self.items.lock().unwrap().push_back(item);
        self.notify.notify_one();
    }

    async fn pop(&self) -> T {
        loop {
            // Register for notification before re-checking, so a push between
            // the check and the await cannot be missed.
            let notified = self.notify.notified();
            if let Some(item) = self.items.lock().unwrap().pop_front() {
                return item;
            }
            notified.await;
        }
    }

    fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }
}

/// The two logical queues connecting channels and the agent loop.
pub struct MessageBus {
    inbound: Fifo<InboundMessage>,
    outbound: Fifo<OutboundMessage>,
}

impl MessageBus {
    pub fn new() -> Self {
        Self {
            inbound: Fifo::new(),
            outbound: Fifo::new(),
        }
    }

    pub fn publish_inbound(&self, msg: InboundMessage) {
        self.inbound.push(msg);
    }

    pub async fn consume_inbound(&self) -> InboundMessage {
        self.inbound.pop().await
    }

    pub fn publish_outbound(&self, msg: OutboundMessage) {
        self.outbound.push(msg);
    }

    pub async fn consume_outbound(&self) -> OutboundMessage {
        self.outbound.pop().await
    }

    pub fn inbound_depth(&self) -> usize {
        self.inbound.len()
    }

    pub fn outbound_depth(&self) -> usize {
        self.outbound.len()
    }
}

impl Default for MessageBus {
    fn default() -> Self {
        Self::new()
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn inbound_is_fifo() {
        let bus = MessageBus::new();
        bus.publish_inbound(InboundMessage::new("cli", "u", "1", "first"));
        bus.publish_inbound(InboundMessage::new("cli", "u", "1", "second"));
        assert_eq!(bus.consume_inbound().await.content, "first");
        assert_eq!(bus.consume_inbound().await.content, "second");
    }

    #[tokio::test]
    async fn depth_tracks_publish_and_consume() {
        let bus = MessageBus::new();
        assert_eq!(bus.inbound_depth(), 0);
        bus.publish_inbound(InboundMessage::new("cli", "u", "1", "x"));
        bus.publish_outbound(OutboundMessage::new("cli", "1", "y"));
        assert_eq!(bus.inbound_depth(), 1);
        assert_eq!(bus.outbound_depth(), 1);
        let _ = bus.consume_inbound().await;
        assert_eq!(bus.inbound_depth(), 0);
    }

    #[tokio::test]
    async fn consumer_wakes_on_later_publish() {
        let bus = std::sync::Arc::new(MessageBus::new());
        let waiter = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.consume_inbound().await.content })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        bus.publish_inbound(InboundMessage::new("cli", "u", "1", "late"));
        assert_eq!(waiter.await.unwrap(), "late");
    }
}
