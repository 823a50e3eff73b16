//! In-process broker backing the `WorkQueue` trait.
//!
//! Per-queue FIFO with an unacked set, built on tokio primitives. Deliveries
//! dropped unsettled go back to their queue, so at-least-once semantics hold
//! even when a consumer task dies mid-message. The trait seam is where an
//! out-of-process broker client would slot in.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::error::QueueError;
use crate::model::WorkItem;
use crate::queue::{Acker, Delivery, QueueConsumer, Settle, WorkQueue};

#[derive(Debug, Clone)]
struct Message {
    item: WorkItem,
    redelivery_count: u32,
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<Message>,
    unacked: HashMap<u64, Message>,
    next_tag: u64,
}

struct BrokerState {
    queues: Mutex<HashMap<String, QueueState>>,
    /// One broker-wide wakeup channel; consumers re-check their queue on
    /// every signal. Coarse but correct.
    notify: Notify,
}

/// Shared in-process broker handle.
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<BrokerState>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(BrokerState {
                queues: Mutex::new(HashMap::new()),
                notify: Notify::new(),
            }),
        }
    }

    /// Number of ready (undelivered) messages in a queue. Test hook.
    pub fn depth(&self, queue: &str) -> usize {
        self.state
            .queues
            .lock()
            .expect("broker mutex poisoned")
            .get(queue)
            .map(|q| q.ready.len())
            .unwrap_or(0)
    }

    /// Number of delivered-but-unsettled messages in a queue. Test hook.
    pub fn unacked(&self, queue: &str) -> usize {
        self.state
            .queues
            .lock()
            .expect("broker mutex poisoned")
            .get(queue)
            .map(|q| q.unacked.len())
            .unwrap_or(0)
    }
}

#[async_trait]
impl WorkQueue for MemoryBroker {
    async fn declare(&self, queue: &str) -> Result<(), QueueError> {
        let mut queues = self.state.queues.lock().expect("broker mutex poisoned");
        queues.entry(queue.to_string()).or_default();
        Ok(())
    }

    async fn publish(&self, queue: &str, item: &WorkItem) -> Result<(), QueueError> {
        // Round-trip through JSON: the wire format is the contract even
        // in-process.
        let encoded = serde_json::to_vec(item)?;
        let item: WorkItem = serde_json::from_slice(&encoded)
            .map_err(QueueError::Encode)?;

        {
            let mut queues = self.state.queues.lock().expect("broker mutex poisoned");
            let q = queues
                .get_mut(queue)
                .ok_or_else(|| QueueError::UnknownQueue {
                    name: queue.to_string(),
                })?;
            q.ready.push_back(Message {
                item,
                redelivery_count: 0,
            });
        }
        self.state.notify.notify_waiters();
        Ok(())
    }

    async fn consume(&self, queue: &str) -> Result<Box<dyn QueueConsumer>, QueueError> {
        {
            let queues = self.state.queues.lock().expect("broker mutex poisoned");
            if !queues.contains_key(queue) {
                return Err(QueueError::UnknownQueue {
                    name: queue.to_string(),
                });
            }
        }
        Ok(Box::new(MemoryConsumer {
            state: Arc::clone(&self.state),
            queue: queue.to_string(),
            slot: Arc::new(ConsumerSlot::default()),
        }))
    }
}

/// Prefetch-1 slot shared between a consumer and its outstanding delivery.
#[derive(Default)]
struct ConsumerSlot {
    outstanding: Mutex<bool>,
    settled: Notify,
}

struct MemoryConsumer {
    state: Arc<BrokerState>,
    queue: String,
    slot: Arc<ConsumerSlot>,
}

#[async_trait]
impl QueueConsumer for MemoryConsumer {
    async fn next(&mut self) -> Result<Delivery, QueueError> {
        // Prefetch 1: block until the previous delivery is settled.
        loop {
            let settled = self.slot.settled.notified();
            tokio::pin!(settled);
            // notify_waiters only wakes already-registered waiters, so the
            // future must be enabled before the condition check.
            settled.as_mut().enable();
            if !*self.slot.outstanding.lock().expect("slot mutex poisoned") {
                break;
            }
            settled.await;
        }

        loop {
            let waiter = self.state.notify.notified();
            tokio::pin!(waiter);
            waiter.as_mut().enable();
            {
                let mut queues = self.state.queues.lock().expect("broker mutex poisoned");
                let q = queues
                    .get_mut(&self.queue)
                    .ok_or_else(|| QueueError::ConsumerClosed {
                        name: self.queue.clone(),
                    })?;
                if let Some(msg) = q.ready.pop_front() {
                    let tag = q.next_tag;
                    q.next_tag += 1;
                    q.unacked.insert(tag, msg.clone());
                    *self.slot.outstanding.lock().expect("slot mutex poisoned") = true;

                    return Ok(Delivery::new(
                        msg.item,
                        msg.redelivery_count,
                        Box::new(MemoryAcker {
                            state: Arc::clone(&self.state),
                            queue: self.queue.clone(),
                            tag,
                            slot: Arc::clone(&self.slot),
                            done: false,
                        }),
                    ));
                }
            }
            waiter.await;
        }
    }
}

struct MemoryAcker {
    state: Arc<BrokerState>,
    queue: String,
    tag: u64,
    slot: Arc<ConsumerSlot>,
    done: bool,
}

impl MemoryAcker {
    fn settle_sync(&mut self, how: Settle) {
        if self.done {
            return;
        }
        self.done = true;

        {
            let mut queues = self.state.queues.lock().expect("broker mutex poisoned");
            if let Some(q) = queues.get_mut(&self.queue) {
                let msg = q.unacked.remove(&self.tag);
                if let (Some(mut msg), Settle::NackRequeue) = (msg, &how) {
                    // Redelivery position is unspecified; back of the queue.
                    msg.redelivery_count += 1;
                    q.ready.push_back(msg);
                }
            }
        }

        *self.slot.outstanding.lock().expect("slot mutex poisoned") = false;
        self.slot.settled.notify_waiters();
        self.state.notify.notify_waiters();
    }
}

#[async_trait]
impl Acker for MemoryAcker {
    async fn settle(mut self: Box<Self>, how: Settle) -> Result<(), QueueError> {
        self.settle_sync(how);
        Ok(())
    }
}

impl Drop for MemoryAcker {
    fn drop(&mut self) {
        // Consumer died holding the delivery; requeue it.
        if !self.done {
            self.settle_sync(Settle::NackRequeue);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use uuid::Uuid;

    fn item(desc: &str) -> WorkItem {
        WorkItem {
            task_id: Uuid::new_v4(),
            description: desc.to_string(),
            project_id: None,
        }
    }

    #[tokio::test]
    async fn publish_and_consume_fifo() {
        let broker = MemoryBroker::new();
        broker.declare("q").await.unwrap();
        broker.publish("q", &item("first")).await.unwrap();
        broker.publish("q", &item("second")).await.unwrap();

        let mut consumer = broker.consume("q").await.unwrap();
        let d1 = consumer.next().await.unwrap();
        assert_eq!(d1.item.description, "first");
        assert_eq!(d1.redelivery_count, 0);
        d1.ack().await.unwrap();

        let d2 = consumer.next().await.unwrap();
        assert_eq!(d2.item.description, "second");
        d2.ack().await.unwrap();

        assert_eq!(broker.depth("q"), 0);
        assert_eq!(broker.unacked("q"), 0);
    }

    #[tokio::test]
    async fn publish_to_undeclared_queue_fails() {
        let broker = MemoryBroker::new();
        let err = broker.publish("nope", &item("x")).await.unwrap_err();
        assert!(matches!(err, QueueError::UnknownQueue { .. }));
    }

    #[tokio::test]
    async fn declare_is_idempotent() {
        let broker = MemoryBroker::new();
        broker.declare("q").await.unwrap();
        broker.publish("q", &item("kept")).await.unwrap();
        broker.declare("q").await.unwrap();
        assert_eq!(broker.depth("q"), 1);
    }

    #[tokio::test]
    async fn nack_requeue_redelivers_with_count() {
        let broker = MemoryBroker::new();
        broker.declare("q").await.unwrap();
        broker.publish("q", &item("retry me")).await.unwrap();

        let mut consumer = broker.consume("q").await.unwrap();
        let d = consumer.next().await.unwrap();
        d.nack(true).await.unwrap();

        let d = consumer.next().await.unwrap();
        assert_eq!(d.item.description, "retry me");
        assert_eq!(d.redelivery_count, 1);
        d.ack().await.unwrap();
    }

    #[tokio::test]
    async fn nack_discard_drops_message() {
        let broker = MemoryBroker::new();
        broker.declare("q").await.unwrap();
        broker.publish("q", &item("dead")).await.unwrap();

        let mut consumer = broker.consume("q").await.unwrap();
        let d = consumer.next().await.unwrap();
        d.nack(false).await.unwrap();

        assert_eq!(broker.depth("q"), 0);
        assert_eq!(broker.unacked("q"), 0);
    }

    #[tokio::test]
    async fn dropped_delivery_is_redelivered() {
        let broker = MemoryBroker::new();
        broker.declare("q").await.unwrap();
        broker.publish("q", &item("orphan")).await.unwrap();

        let mut consumer = broker.consume("q").await.unwrap();
        let d = consumer.next().await.unwrap();
        drop(d); // consumer crash

        let d = consumer.next().await.unwrap();
        assert_eq!(d.item.description, "orphan");
        assert_eq!(d.redelivery_count, 1);
        d.ack().await.unwrap();
    }

    #[tokio::test]
    async fn consumer_blocks_until_publish() {
        let broker = MemoryBroker::new();
        broker.declare("q").await.unwrap();
        let mut consumer = broker.consume("q").await.unwrap();

        let producer = broker.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.publish("q", &item("late")).await.unwrap();
        });

        let d = tokio::time::timeout(Duration::from_secs(2), consumer.next())
            .await
            .expect("consumer should wake on publish")
            .unwrap();
        assert_eq!(d.item.description, "late");
        d.ack().await.unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn interleaved_publish_and_consume_never_stalls() {
        let broker = MemoryBroker::new();
        broker.declare("q").await.unwrap();

        // Publisher races the consumer's empty-check; a consumer that parks
        // without being registered for the wakeup strands the last message.
        let producer = broker.clone();
        let publisher = tokio::spawn(async move {
            for i in 0..200 {
                producer.publish("q", &item(&format!("m{i}"))).await.unwrap();
                tokio::task::yield_now().await;
            }
        });

        let mut consumer = broker.consume("q").await.unwrap();
        for _ in 0..200 {
            let d = tokio::time::timeout(Duration::from_secs(5), consumer.next())
                .await
                .expect("consumer stalled with a message ready")
                .unwrap();
            d.ack().await.unwrap();
        }
        publisher.await.unwrap();

        assert_eq!(broker.depth("q"), 0);
        assert_eq!(broker.unacked("q"), 0);
    }

    #[tokio::test]
    async fn second_consumer_picks_up_requeued_message() {
        let broker = MemoryBroker::new();
        broker.declare("q").await.unwrap();
        broker.publish("q", &item("shared")).await.unwrap();

        let mut c1 = broker.consume("q").await.unwrap();
        let d = c1.next().await.unwrap();
        d.nack(true).await.unwrap();

        let mut c2 = broker.consume("q").await.unwrap();
        let d = tokio::time::timeout(Duration::from_secs(2), c2.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(d.item.description, "shared");
        assert_eq!(d.redelivery_count, 1);
        d.ack().await.unwrap();
    }

    #[tokio::test]
    async fn queues_are_isolated() {
        let broker = MemoryBroker::new();
        broker.declare(&crate::queue::queue_name_for("a")).await.unwrap();
        broker.declare(&crate::queue::queue_name_for("b")).await.unwrap();

        broker
            .publish("agent_a", &item("for a"))
            .await
            .unwrap();
        assert_eq!(broker.depth("agent_a"), 1);
        assert_eq!(broker.depth("agent_b"), 0);
    }
}
