//! Dispatcher — moves tasks from `pending` to `assigned` and onto the queue.
//!
//! Best-effort immediate: runs inline in the request path that created the
//! tasks, with no polling loop. A task that finds no live agent simply stays
//! `pending` until the next dispatch trigger (another creation, or an
//! explicit re-dispatch call).

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, StoreError};
use crate::model::{Task, WorkItem};
use crate::queue::{WorkQueue, queue_name_for};
use crate::store::TaskStore;

/// Outcome of one dispatch pass.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Tasks bound to an agent and published.
    pub assigned: usize,
    /// Tasks left `pending` for lack of a live agent.
    pub deferred: usize,
    /// Tasks assigned whose publish failed; the recovery sweep returns them
    /// to `pending` once they exceed the stuck threshold.
    pub failed: usize,
    /// Stale `assigned` tasks returned to `pending` by the recovery sweep.
    pub recovered: usize,
}

pub struct Dispatcher {
    store: Arc<dyn TaskStore>,
    queue: Arc<dyn WorkQueue>,
    liveness_window: Duration,
    stuck_assigned_threshold: Duration,
}

impl Dispatcher {
    pub fn new(
        store: Arc<dyn TaskStore>,
        queue: Arc<dyn WorkQueue>,
        liveness_window: Duration,
        stuck_assigned_threshold: Duration,
    ) -> Self {
        Self {
            store,
            queue,
            liveness_window,
            stuck_assigned_threshold,
        }
    }

    /// Dispatch every pending task in the store.
    pub async fn dispatch_pending(&self) -> Result<DispatchReport, Error> {
        let mut report = self.recover_stuck_assignments().await?;
        let pending = self.store.list_pending_tasks().await?;
        self.dispatch_batch(&pending, &mut report).await?;
        Ok(report)
    }

    /// Dispatch the pending tasks of one project.
    pub async fn dispatch_project(&self, project_id: Uuid) -> Result<DispatchReport, Error> {
        let mut report = self.recover_stuck_assignments().await?;
        let tasks = self.store.list_tasks_for_project(project_id).await?;
        let pending: Vec<Task> = tasks
            .into_iter()
            .filter(|t| t.status == crate::model::TaskStatus::Pending)
            .collect();
        self.dispatch_batch(&pending, &mut report).await?;
        Ok(report)
    }

    async fn dispatch_batch(
        &self,
        tasks: &[Task],
        report: &mut DispatchReport,
    ) -> Result<(), Error> {
        for task in tasks {
            match self.dispatch_one(task).await {
                Ok(true) => report.assigned += 1,
                Ok(false) => report.deferred += 1,
                // Lost a race for the agent or the task; the task is still
                // pending (or was taken by a concurrent dispatch) and will
                // be retried on the next trigger.
                Err(Error::Store(StoreError::AgentTaken { name })) => {
                    debug!(task_id = %task.id, agent = %name, "Agent taken by concurrent dispatch");
                    report.deferred += 1;
                }
                Err(Error::Store(StoreError::StatusConflict { .. })) => {
                    debug!(task_id = %task.id, "Task no longer pending, skipping");
                }
                // Already logged by dispatch_one. The task sits in `assigned`
                // until the sweep; the rest of the batch still gets a chance.
                Err(Error::Queue(_)) => report.failed += 1,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Bind one pending task to a live agent and publish its work item.
    ///
    /// Returns `Ok(false)` when no agent qualifies — not an error, the task
    /// stays pending.
    async fn dispatch_one(&self, task: &Task) -> Result<bool, Error> {
        let Some(agent) = self
            .store
            .select_available_agent(None, self.liveness_window)
            .await?
        else {
            debug!(task_id = %task.id, "No live agent available, task stays pending");
            return Ok(false);
        };

        self.store.assign_task(task.id, &agent.name).await?;

        let queue_name = queue_name_for(&agent.name);
        let item = WorkItem::for_task(task);
        self.queue.declare(&queue_name).await?;
        if let Err(e) = self.queue.publish(&queue_name, &item).await {
            // Partial failure: the task is now `assigned` in the store but
            // never reached the queue. The recovery sweep returns it to
            // `pending` once it exceeds the stuck threshold.
            warn!(
                task_id = %task.id,
                agent = %agent.name,
                error = %e,
                "Publish failed after assignment; task will be recovered by the sweep"
            );
            return Err(e.into());
        }

        info!(
            task_id = %task.id,
            agent = %agent.name,
            queue = %queue_name,
            "Task dispatched"
        );
        Ok(true)
    }

    /// Return tasks stuck in `assigned` longer than the threshold to
    /// `pending`. Covers dispatches that crashed or failed between the
    /// assignment commit and the publish.
    pub async fn recover_stuck_assignments(&self) -> Result<DispatchReport, Error> {
        let reset = self
            .store
            .reset_stale_assigned(self.stuck_assigned_threshold)
            .await?;

        if !reset.is_empty() {
            info!(count = reset.len(), "Recovered stuck assigned tasks to pending");
        }

        Ok(DispatchReport {
            recovered: reset.len(),
            ..Default::default()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::QueueError;
    use crate::model::TaskStatus;
    use crate::queue::{MemoryBroker, QueueConsumer};
    use crate::store::LibSqlStore;

    const WINDOW: Duration = Duration::from_secs(90);
    const STUCK: Duration = Duration::from_secs(300);

    async fn setup() -> (Arc<dyn TaskStore>, MemoryBroker, Dispatcher) {
        let store: Arc<dyn TaskStore> = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let broker = MemoryBroker::new();
        let dispatcher = Dispatcher::new(
            Arc::clone(&store),
            Arc::new(broker.clone()),
            WINDOW,
            STUCK,
        );
        (store, broker, dispatcher)
    }

    #[tokio::test]
    async fn dispatch_assigns_and_publishes() {
        let (store, broker, dispatcher) = setup().await;
        store.heartbeat("worker-1", &[]).await.unwrap();
        let task = store.create_task(None, "t").await.unwrap();

        let report = dispatcher.dispatch_pending().await.unwrap();
        assert_eq!(report.assigned, 1);
        assert_eq!(report.deferred, 0);

        let loaded = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Assigned);
        assert_eq!(broker.depth("agent_worker-1"), 1);
    }

    #[tokio::test]
    async fn no_agent_leaves_task_pending() {
        let (store, _broker, dispatcher) = setup().await;
        let task = store.create_task(None, "t").await.unwrap();

        let report = dispatcher.dispatch_pending().await.unwrap();
        assert_eq!(report.assigned, 0);
        assert_eq!(report.deferred, 1);

        let loaded = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, TaskStatus::Pending);

        // An agent registers; the next trigger picks the task up.
        store.heartbeat("worker-1", &[]).await.unwrap();
        let report = dispatcher.dispatch_pending().await.unwrap();
        assert_eq!(report.assigned, 1);
    }

    #[tokio::test]
    async fn two_tasks_one_agent_assigns_once() {
        let (store, broker, dispatcher) = setup().await;
        store.heartbeat("worker-1", &[]).await.unwrap();
        store.create_task(None, "a").await.unwrap();
        store.create_task(None, "b").await.unwrap();

        let report = dispatcher.dispatch_pending().await.unwrap();
        assert_eq!(report.assigned, 1);
        assert_eq!(report.deferred, 1);
        assert_eq!(broker.depth("agent_worker-1"), 1);
    }

    #[tokio::test]
    async fn two_tasks_two_agents_both_assigned() {
        let (store, broker, dispatcher) = setup().await;
        store.heartbeat("worker-1", &[]).await.unwrap();
        store.heartbeat("worker-2", &[]).await.unwrap();
        store.create_task(None, "a").await.unwrap();
        store.create_task(None, "b").await.unwrap();

        let report = dispatcher.dispatch_pending().await.unwrap();
        assert_eq!(report.assigned, 2);
        assert_eq!(
            broker.depth("agent_worker-1") + broker.depth("agent_worker-2"),
            2
        );
        // Each agent got exactly one task before going busy.
        assert_eq!(broker.depth("agent_worker-1"), 1);
        assert_eq!(broker.depth("agent_worker-2"), 1);
    }

    /// Broker that accepts declares but can never deliver anything.
    struct DeadBroker;

    #[async_trait::async_trait]
    impl WorkQueue for DeadBroker {
        async fn declare(&self, _queue: &str) -> Result<(), QueueError> {
            Ok(())
        }

        async fn publish(&self, _queue: &str, _item: &WorkItem) -> Result<(), QueueError> {
            Err(QueueError::Unavailable("broker down".to_string()))
        }

        async fn consume(&self, _queue: &str) -> Result<Box<dyn QueueConsumer>, QueueError> {
            Err(QueueError::Unavailable("broker down".to_string()))
        }
    }

    #[tokio::test]
    async fn publish_failure_does_not_abort_the_batch() {
        let store: Arc<dyn TaskStore> = Arc::new(LibSqlStore::new_memory().await.unwrap());
        store.heartbeat("worker-1", &[]).await.unwrap();
        store.heartbeat("worker-2", &[]).await.unwrap();
        store.create_task(None, "a").await.unwrap();
        store.create_task(None, "b").await.unwrap();

        let dispatcher = Dispatcher::new(Arc::clone(&store), Arc::new(DeadBroker), WINDOW, STUCK);
        let report = dispatcher.dispatch_pending().await.unwrap();
        assert_eq!(report.assigned, 0);
        assert_eq!(report.failed, 2);

        // Both assignments are stuck until the sweep returns them to pending.
        let sweeper = Dispatcher::new(
            Arc::clone(&store),
            Arc::new(DeadBroker),
            WINDOW,
            Duration::ZERO,
        );
        let report = sweeper.recover_stuck_assignments().await.unwrap();
        assert_eq!(report.recovered, 2);
        for task in store.list_pending_tasks().await.unwrap() {
            assert!(task.assigned_agent.is_none());
        }
    }

    #[tokio::test]
    async fn dispatch_project_scopes_to_project() {
        let (store, broker, dispatcher) = setup().await;
        store.heartbeat("worker-1", &[]).await.unwrap();
        let project = store.create_project("P", "d").await.unwrap();
        store.create_task(Some(project.id), "in").await.unwrap();
        let outside = store.create_task(None, "out").await.unwrap();

        let report = dispatcher.dispatch_project(project.id).await.unwrap();
        assert_eq!(report.assigned, 1);

        let outside = store.get_task(outside.id).await.unwrap().unwrap();
        assert_eq!(outside.status, TaskStatus::Pending);
        assert_eq!(broker.depth("agent_worker-1"), 1);
    }
}
