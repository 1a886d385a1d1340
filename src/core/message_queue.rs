//! FIFO message queues connecting the application, routers and engines
//!
//! A queue is split into a cloneable producer half ([`MessageQueue`]) and a
//! single consumer half ([`MessageStream`]). Queues are unbounded: flow
//! control is left to the socket buffers.

use crate::core::message::Message;
use crate::error::{NetworkError, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Notify};

/// Create a new queue
#[must_use]
pub fn message_queue() -> (MessageQueue, MessageStream) {
    build(None)
}

/// Create a queue whose every enqueue also signals `waker`
///
/// Lets one consumer wait on many queues at once by waiting on the shared
/// `Notify` instead of on each stream.
#[must_use]
pub fn message_queue_with_waker(waker: Arc<Notify>) -> (MessageQueue, MessageStream) {
    build(Some(waker))
}

fn build(waker: Option<Arc<Notify>>) -> (MessageQueue, MessageStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    let counters = Arc::new(QueueCounters::default());

    (
        MessageQueue {
            tx,
            counters: Arc::clone(&counters),
            waker,
        },
        MessageStream { rx, counters },
    )
}

#[derive(Debug, Default)]
struct QueueCounters {
    enqueued: AtomicU64,
    dequeued: AtomicU64,
    dropped: AtomicU64,
}

impl QueueCounters {
    fn snapshot(&self) -> MessageQueueStats {
        let enqueued = self.enqueued.load(Ordering::Relaxed);
        let dequeued = self.dequeued.load(Ordering::Relaxed);

        MessageQueueStats {
            depth: enqueued.saturating_sub(dequeued),
            enqueued,
            dequeued,
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Producer half of a queue
#[derive(Debug, Clone)]
pub struct MessageQueue {
    tx: mpsc::UnboundedSender<Message>,
    counters: Arc<QueueCounters>,
    waker: Option<Arc<Notify>>,
}

impl MessageQueue {
    /// Append a message
    ///
    /// # Errors
    ///
    /// Fails once the consumer half has been dropped; the message is counted
    /// as dropped.
    pub fn enqueue(&self, message: Message) -> Result<()> {
        if self.tx.send(message).is_err() {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return Err(NetworkError::channel("Message queue closed"));
        }

        self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
        if let Some(waker) = &self.waker {
            waker.notify_one();
        }
        Ok(())
    }

    /// Check whether the consumer half is gone
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    /// Get queue statistics
    #[must_use]
    pub fn stats(&self) -> MessageQueueStats {
        self.counters.snapshot()
    }
}

/// Consumer half of a queue
#[derive(Debug)]
pub struct MessageStream {
    rx: mpsc::UnboundedReceiver<Message>,
    counters: Arc<QueueCounters>,
}

impl MessageStream {
    /// Wait for the next message
    ///
    /// Returns `None` once every producer has been dropped and the queue is
    /// drained. Cancel safe.
    pub async fn dequeue(&mut self) -> Option<Message> {
        let message = self.rx.recv().await;
        if message.is_some() {
            self.counters.dequeued.fetch_add(1, Ordering::Relaxed);
        }
        message
    }

    /// Take the next message if one is already queued
    pub fn try_dequeue(&mut self) -> Option<Message> {
        let message = self.rx.try_recv().ok();
        if message.is_some() {
            self.counters.dequeued.fetch_add(1, Ordering::Relaxed);
        }
        message
    }

    /// Wait at most `timeout` for the next message
    pub async fn dequeue_timeout(&mut self, timeout: Duration) -> Option<Message> {
        tokio::time::timeout(timeout, self.dequeue())
            .await
            .ok()
            .flatten()
    }

    /// Get queue statistics
    #[must_use]
    pub fn stats(&self) -> MessageQueueStats {
        self.counters.snapshot()
    }

    /// Check if queue is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stats().depth == 0
    }
}

/// Statistics for a message queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageQueueStats {
    /// Current number of messages in queue
    pub depth: u64,
    /// Total messages enqueued
    pub enqueued: u64,
    /// Total messages dequeued
    pub dequeued: u64,
    /// Total messages rejected because the consumer was gone
    pub dropped: u64,
}
