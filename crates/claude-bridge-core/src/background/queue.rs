//! Outbound message queue
//!
//! Holds envelopes while the desktop app is unreachable. Bounded FIFO:
//! overflow evicts the oldest entry, stale entries are dropped on flush.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::config::QueueConfig;
use crate::error::BridgeResult;
use crate::protocol::Envelope;

/// Destination for a queue flush
#[async_trait]
pub trait MessageSink: Send {
    async fn send_envelope(&mut self, envelope: &Envelope) -> BridgeResult<()>;
}

#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub envelope: Envelope,
    pub queued_at: Instant,
}

/// Result of a successful flush
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub sent: usize,
    pub expired: usize,
}

#[derive(Debug)]
pub struct OutboundQueue {
    entries: VecDeque<QueuedMessage>,
    capacity: usize,
    max_age: Duration,
}

impl OutboundQueue {
    pub fn new(config: &QueueConfig) -> Self {
        Self {
            entries: VecDeque::with_capacity(config.capacity),
            capacity: config.capacity.max(1),
            max_age: config.max_age(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Queue an envelope; returns the evicted one if the queue was full
    pub fn push(&mut self, envelope: Envelope) -> Option<Envelope> {
        let evicted = if self.entries.len() >= self.capacity {
            self.entries.pop_front().map(|m| m.envelope)
        } else {
            None
        };
        if let Some(old) = &evicted {
            warn!(kind = %old.kind, capacity = self.capacity, "Outbound queue full, dropping oldest message");
        }
        self.entries.push_back(QueuedMessage {
            envelope,
            queued_at: Instant::now(),
        });
        evicted
    }

    /// Send everything in order. On a send error the failed entry and all
    /// later ones stay queued.
    pub async fn flush<S: MessageSink + ?Sized>(&mut self, sink: &mut S) -> BridgeResult<FlushReport> {
        let mut report = FlushReport::default();

        while let Some(message) = self.entries.pop_front() {
            let age = message.queued_at.elapsed();
            if age > self.max_age {
                debug!(kind = %message.envelope.kind, age_ms = age.as_millis() as u64, "Dropping stale queued message");
                report.expired += 1;
                continue;
            }

            if let Err(e) = sink.send_envelope(&message.envelope).await {
                self.entries.push_front(message);
                warn!(error = %e, remaining = self.entries.len(), "Queue flush interrupted");
                return Err(e);
            }
            report.sent += 1;
        }

        if report.sent > 0 || report.expired > 0 {
            debug!(sent = report.sent, expired = report.expired, "Outbound queue flushed");
        }
        Ok(report)
    }
}
