//! Work queue abstraction — the broker boundary.
//!
//! The queue carries transient `WorkItem` instructions from the dispatcher to
//! worker runtimes with at-least-once delivery: a consumer that nacks (or
//! dies holding) a delivery gets it redelivered. Consumers run with an
//! effective prefetch of 1 — exactly one outstanding unacknowledged delivery
//! at a time — which is what keeps the busy/available agent invariant
//! correct.

mod memory;

use async_trait::async_trait;

pub use memory::MemoryBroker;

use crate::error::QueueError;
use crate::model::WorkItem;

/// The global fallback queue name.
pub const TASK_QUEUE: &str = "task_queue";

/// Per-agent queue name.
pub fn queue_name_for(agent: &str) -> String {
    format!("agent_{agent}")
}

/// A named-channel message broker.
#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Declare a durable queue. Idempotent.
    async fn declare(&self, queue: &str) -> Result<(), QueueError>;

    /// Publish a work item to a queue in persistent delivery mode.
    async fn publish(&self, queue: &str, item: &WorkItem) -> Result<(), QueueError>;

    /// Start consuming from a queue with prefetch 1.
    async fn consume(&self, queue: &str) -> Result<Box<dyn QueueConsumer>, QueueError>;
}

/// A subscription to one queue.
#[async_trait]
pub trait QueueConsumer: Send {
    /// Wait for the next delivery. Does not yield a second delivery until
    /// the previous one has been acked or nacked.
    async fn next(&mut self) -> Result<Delivery, QueueError>;
}

/// One in-flight message. Must be settled exactly once; a delivery dropped
/// unsettled (consumer crash) is returned to its queue for redelivery.
pub struct Delivery {
    pub item: WorkItem,
    /// How many times this message has been delivered before. 0 on first
    /// delivery.
    pub redelivery_count: u32,
    acker: Box<dyn Acker>,
}

impl Delivery {
    pub(crate) fn new(item: WorkItem, redelivery_count: u32, acker: Box<dyn Acker>) -> Self {
        Self {
            item,
            redelivery_count,
            acker,
        }
    }

    /// Acknowledge: the work is done, the broker forgets the message.
    pub async fn ack(self) -> Result<(), QueueError> {
        self.acker.settle(Settle::Ack).await
    }

    /// Negatively acknowledge. With `requeue`, the broker redelivers the
    /// message (to this or another consumer); without, it is discarded.
    pub async fn nack(self, requeue: bool) -> Result<(), QueueError> {
        self.acker
            .settle(if requeue {
                Settle::NackRequeue
            } else {
                Settle::NackDiscard
            })
            .await
    }
}

pub(crate) enum Settle {
    Ack,
    NackRequeue,
    NackDiscard,
}

#[async_trait]
pub(crate) trait Acker: Send {
    async fn settle(self: Box<Self>, how: Settle) -> Result<(), QueueError>;
}
