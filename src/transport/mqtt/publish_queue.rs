//! Bounded publish retry queue
//!
//! Messages that could not be handed to the broker wait here in arrival
//! order. When full, the oldest message is dropped and the drop is logged.

use std::collections::VecDeque;
use tokio::time::Instant;
use tracing::warn;

/// A message waiting for the broker
#[derive(Debug, Clone, PartialEq)]
pub struct QueuedPublish {
    pub topic: String,
    pub payload: Vec<u8>,
    pub queued_at: Instant,
}

impl QueuedPublish {
    pub fn new(topic: String, payload: Vec<u8>) -> Self {
        Self {
            topic,
            payload,
            queued_at: Instant::now(),
        }
    }
}

/// FIFO with drop-oldest overflow
#[derive(Debug)]
pub struct PublishQueue {
    items: VecDeque<QueuedPublish>,
    capacity: usize,
    dropped: u64,
}

impl PublishQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            items: VecDeque::with_capacity(capacity),
            capacity,
            dropped: 0,
        }
    }

    /// Append a message, returning the evicted oldest message if the queue was full
    pub fn push(&mut self, message: QueuedPublish) -> Option<QueuedPublish> {
        let evicted = if self.items.len() >= self.capacity {
            self.items.pop_front()
        } else {
            None
        };

        if let Some(old) = &evicted {
            self.record_drop(old);
        }

        self.items.push_back(message);
        evicted
    }

    /// Put messages back ahead of everything queued, keeping their order
    ///
    /// Overflow still drops the oldest messages. Returns how many were dropped.
    pub fn requeue_front(&mut self, messages: Vec<QueuedPublish>) -> usize {
        for message in messages.into_iter().rev() {
            self.items.push_front(message);
        }

        let mut evicted = 0;
        while self.items.len() > self.capacity {
            if let Some(old) = self.items.pop_front() {
                self.record_drop(&old);
                evicted += 1;
            }
        }
        evicted
    }

    fn record_drop(&mut self, old: &QueuedPublish) {
        self.dropped += 1;
        warn!(
            topic = %old.topic,
            capacity = self.capacity,
            waited_ms = old.queued_at.elapsed().as_millis() as u64,
            total_dropped = self.dropped,
            "Publish retry queue full, dropped oldest message"
        );
    }

    pub fn front(&self) -> Option<&QueuedPublish> {
        self.items.front()
    }

    pub fn pop_front(&mut self) -> Option<QueuedPublish> {
        self.items.pop_front()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Messages dropped since creation
    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}
