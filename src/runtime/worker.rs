//! Per-agent worker execution.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::completion::{self, CompletionPolicy};
use crate::error::Error;
use crate::generate::{self, Generator};
use crate::model::{AgentStatus, WorkItem};
use crate::queue::{Delivery, WorkQueue, queue_name_for};
use crate::store::TaskStore;

/// Shared dependencies and tunables for a worker runtime.
#[derive(Clone)]
pub struct WorkerDeps {
    pub store: Arc<dyn TaskStore>,
    pub queue: Arc<dyn WorkQueue>,
    pub generator: Arc<dyn Generator>,
    pub heartbeat_interval: Duration,
    pub reconnect_backoff: Duration,
    pub completion_policy: CompletionPolicy,
}

/// A running worker runtime.
///
/// Dropping the handle does not stop the worker; call [`WorkerHandle::shutdown`]
/// for a graceful exit that marks the agent offline.
pub struct WorkerHandle {
    pub name: String,
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
    heartbeat: JoinHandle<()>,
}

impl WorkerHandle {
    /// Signal the worker to stop and wait for it to finish its in-flight
    /// delivery.
    pub async fn shutdown(self) {
        let _ = self.shutdown_tx.send(true);
        self.heartbeat.abort();
        if let Err(e) = self.join.await {
            if !e.is_cancelled() {
                warn!(error = %e, "Worker task panicked during shutdown");
            }
        }
    }
}

pub struct WorkerRuntime {
    name: String,
    capabilities: Vec<String>,
    deps: WorkerDeps,
}

impl WorkerRuntime {
    /// Create a runtime with a generated identity, the model it serves as its
    /// one capability.
    pub fn new(deps: WorkerDeps) -> Self {
        let name = format!("worker-{}", Uuid::new_v4());
        let capabilities = vec![deps.generator.model_name().to_string()];
        Self {
            name,
            capabilities,
            deps,
        }
    }

    /// Create a runtime with an explicit name. Names are agent identity: a
    /// restart under the same name reuses the registry row and queue.
    pub fn with_name(name: impl Into<String>, deps: WorkerDeps) -> Self {
        let capabilities = vec![deps.generator.model_name().to_string()];
        Self {
            name: name.into(),
            capabilities,
            deps,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register, start the heartbeat loop, and start consuming.
    pub async fn spawn(self) -> Result<WorkerHandle, Error> {
        let queue_name = queue_name_for(&self.name);

        // Registration is the first heartbeat.
        self.deps
            .store
            .heartbeat(&self.name, &self.capabilities)
            .await?;
        self.deps.queue.declare(&queue_name).await?;

        info!(agent = %self.name, queue = %queue_name, "Worker runtime starting");

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let name = self.name.clone();

        let heartbeat = spawn_heartbeat(
            Arc::clone(&self.deps.store),
            self.name.clone(),
            self.capabilities.clone(),
            self.deps.heartbeat_interval,
        );

        let join = tokio::spawn(self.run(queue_name, shutdown_rx));

        Ok(WorkerHandle {
            name,
            shutdown_tx,
            join,
            heartbeat,
        })
    }

    async fn run(self, queue_name: String, mut shutdown_rx: watch::Receiver<bool>) {
        'outer: loop {
            let mut consumer = match self.deps.queue.consume(&queue_name).await {
                Ok(c) => c,
                Err(e) => {
                    warn!(
                        agent = %self.name,
                        error = %e,
                        backoff_secs = self.deps.reconnect_backoff.as_secs(),
                        "Broker connection failed, retrying"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(self.deps.reconnect_backoff) => continue,
                        _ = shutdown_rx.changed() => break 'outer,
                    }
                }
            };

            loop {
                let delivery = tokio::select! {
                    d = consumer.next() => d,
                    _ = shutdown_rx.changed() => break 'outer,
                };

                match delivery {
                    Ok(delivery) => self.handle_delivery(delivery).await,
                    Err(e) => {
                        warn!(agent = %self.name, error = %e, "Consumer lost, reconnecting");
                        tokio::select! {
                            _ = tokio::time::sleep(self.deps.reconnect_backoff) => continue 'outer,
                            _ = shutdown_rx.changed() => break 'outer,
                        }
                    }
                }
            }
        }

        // Graceful exit only; a crashed worker is detected by heartbeat
        // staleness instead.
        if let Err(e) = self
            .deps
            .store
            .set_agent_status(&self.name, AgentStatus::Offline)
            .await
        {
            warn!(agent = %self.name, error = %e, "Failed to mark agent offline");
        }
        info!(agent = %self.name, "Worker runtime stopped");
    }

    /// Drive one delivery through the task lifecycle, then settle it.
    async fn handle_delivery(&self, delivery: Delivery) {
        let item = delivery.item.clone();
        let task_id = item.task_id;

        if delivery.redelivery_count > 0 {
            debug!(
                agent = %self.name,
                task_id = %task_id,
                redeliveries = delivery.redelivery_count,
                "Handling redelivered work item"
            );
        }

        // The store row is the truth; the queue message is only the trigger.
        let task = match self.deps.store.get_task(task_id).await {
            Ok(Some(task)) => task,
            Ok(None) => {
                // Deleted after dispatch (project teardown). Nothing to do.
                warn!(agent = %self.name, task_id = %task_id, "Task no longer exists, discarding");
                settle_ack(delivery, &self.name, task_id).await;
                return;
            }
            Err(e) => {
                warn!(agent = %self.name, task_id = %task_id, error = %e, "Store lookup failed, requeueing");
                settle_nack(delivery, &self.name, task_id, true).await;
                return;
            }
        };

        if task.status.is_terminal() {
            // Redelivery of work that already finished. At-least-once makes
            // this normal; acking drops the duplicate.
            info!(
                agent = %self.name,
                task_id = %task_id,
                status = %task.status,
                "Task already settled, ignoring duplicate delivery"
            );
            settle_ack(delivery, &self.name, task_id).await;
            return;
        }

        if let Err(e) = self.deps.store.mark_processing(task_id).await {
            if e.is_transient() {
                warn!(agent = %self.name, task_id = %task_id, error = %e, "Store unavailable, requeueing");
                settle_nack(delivery, &self.name, task_id, true).await;
            } else {
                warn!(agent = %self.name, task_id = %task_id, error = %e, "Cannot start task, discarding");
                settle_ack(delivery, &self.name, task_id).await;
            }
            return;
        }

        info!(agent = %self.name, task_id = %task_id, "Processing task");

        match self.execute(&item).await {
            Ok(result) => {
                if let Err(e) = self.deps.store.mark_completed(task_id, &result).await {
                    error!(agent = %self.name, task_id = %task_id, error = %e, "Failed to record completion, requeueing");
                    settle_nack(delivery, &self.name, task_id, true).await;
                    return;
                }
                info!(agent = %self.name, task_id = %task_id, "Task completed");
                self.refresh_owner(&item).await;
                settle_ack(delivery, &self.name, task_id).await;
            }
            Err(e) => {
                warn!(agent = %self.name, task_id = %task_id, error = %e, "Task execution failed");
                if let Err(store_err) =
                    self.deps.store.mark_failed(task_id, &e.to_string()).await
                {
                    error!(agent = %self.name, task_id = %task_id, error = %store_err, "Failed to record failure");
                }
                self.refresh_owner(&item).await;
                // Requeue: the redelivery finds the task `failed` (terminal)
                // and acks, unless it was requeued to `pending` in between.
                settle_nack(delivery, &self.name, task_id, true).await;
            }
        }
    }

    async fn execute(&self, item: &WorkItem) -> Result<String, Error> {
        let prompt = generate::execution_prompt(&item.description);
        let result = self.deps.generator.generate(&prompt).await?;
        Ok(result)
    }

    /// Roll the outcome up to the owning project, if any. Best effort: the
    /// next terminal transition in the project recomputes from scratch anyway.
    async fn refresh_owner(&self, item: &WorkItem) {
        let Some(project_id) = item.project_id else {
            return;
        };
        if let Err(e) = completion::refresh_project(
            &self.deps.store,
            project_id,
            self.deps.completion_policy,
        )
        .await
        {
            warn!(
                agent = %self.name,
                project_id = %project_id,
                error = %e,
                "Project completion refresh failed"
            );
        }
    }
}

async fn settle_ack(delivery: Delivery, agent: &str, task_id: Uuid) {
    if let Err(e) = delivery.ack().await {
        warn!(agent = %agent, task_id = %task_id, error = %e, "Ack failed");
    }
}

async fn settle_nack(delivery: Delivery, agent: &str, task_id: Uuid, requeue: bool) {
    if let Err(e) = delivery.nack(requeue).await {
        warn!(agent = %agent, task_id = %task_id, error = %e, "Nack failed");
    }
}

fn spawn_heartbeat(
    store: Arc<dyn TaskStore>,
    name: String,
    capabilities: Vec<String>,
    interval: Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The registration beat already happened; skip the immediate tick.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            if let Err(e) = store.heartbeat(&name, &capabilities).await {
                warn!(agent = %name, error = %e, "Heartbeat failed");
            }
        }
    })
}

/// Spawn `count` worker runtimes sharing one set of dependencies.
pub async fn spawn_workers(count: usize, deps: WorkerDeps) -> Result<Vec<WorkerHandle>, Error> {
    let mut handles = Vec::with_capacity(count);
    for _ in 0..count {
        let runtime = WorkerRuntime::new(deps.clone());
        handles.push(runtime.spawn().await?);
    }
    Ok(handles)
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::dispatch::Dispatcher;
    use crate::error::GenerateError;
    use crate::model::{ProjectStatus, TaskStatus};
    use crate::queue::MemoryBroker;
    use crate::store::LibSqlStore;

    struct FixedGenerator {
        response: Result<String, String>,
        calls: AtomicUsize,
    }

    impl FixedGenerator {
        fn ok(text: &str) -> Self {
            Self {
                response: Ok(text.to_string()),
                calls: AtomicUsize::new(0),
            }
        }

        fn failing(reason: &str) -> Self {
            Self {
                response: Err(reason.to_string()),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl Generator for FixedGenerator {
        async fn generate(&self, _prompt: &str) -> Result<String, GenerateError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.response {
                Ok(text) => Ok(text.clone()),
                Err(reason) => Err(GenerateError::RequestFailed {
                    provider: "fixed".to_string(),
                    reason: reason.clone(),
                }),
            }
        }

        fn model_name(&self) -> &str {
            "fixed"
        }

        fn provider_name(&self) -> &str {
            "fixed"
        }
    }

    async fn deps(generator: Arc<dyn Generator>) -> (Arc<dyn TaskStore>, MemoryBroker, WorkerDeps) {
        let store: Arc<dyn TaskStore> = Arc::new(LibSqlStore::new_memory().await.unwrap());
        let broker = MemoryBroker::new();
        let deps = WorkerDeps {
            store: Arc::clone(&store),
            queue: Arc::new(broker.clone()),
            generator,
            heartbeat_interval: Duration::from_secs(30),
            reconnect_backoff: Duration::from_millis(50),
            completion_policy: CompletionPolicy::default(),
        };
        (store, broker, deps)
    }

    async fn wait_for_status(store: &Arc<dyn TaskStore>, task_id: Uuid, status: TaskStatus) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let task = store.get_task(task_id).await.unwrap().unwrap();
            if task.status == status {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "task {task_id} never reached {status}, stuck at {}",
                task.status
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn worker_completes_dispatched_task() {
        let (store, broker, deps) = deps(Arc::new(FixedGenerator::ok("the answer"))).await;

        let runtime = WorkerRuntime::with_name("worker-1", deps);
        let handle = runtime.spawn().await.unwrap();

        let project = store.create_project("P", "d").await.unwrap();
        let task = store.create_task(Some(project.id), "compute").await.unwrap();

        let dispatcher = Dispatcher::new(
            Arc::clone(&store),
            Arc::new(broker.clone()),
            Duration::from_secs(90),
            Duration::from_secs(300),
        );
        let report = dispatcher.dispatch_pending().await.unwrap();
        assert_eq!(report.assigned, 1);

        wait_for_status(&store, task.id, TaskStatus::Completed).await;

        let task = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(task.outcome.result.as_deref(), Some("the answer"));
        assert_eq!(task.assigned_agent.as_deref(), Some("worker-1"));

        // Single-task project finished with it.
        let project = store.get_project(project.id).await.unwrap().unwrap();
        assert_eq!(project.status, ProjectStatus::Completed);

        // Agent released for the next assignment.
        let agent = store.get_agent("worker-1").await.unwrap().unwrap();
        assert_eq!(agent.status, AgentStatus::Available);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn failed_generation_marks_task_failed() {
        let (store, broker, deps) = deps(Arc::new(FixedGenerator::failing("model down"))).await;

        let runtime = WorkerRuntime::with_name("worker-1", deps);
        let handle = runtime.spawn().await.unwrap();

        let task = store.create_task(None, "doomed").await.unwrap();
        let dispatcher = Dispatcher::new(
            Arc::clone(&store),
            Arc::new(broker.clone()),
            Duration::from_secs(90),
            Duration::from_secs(300),
        );
        dispatcher.dispatch_pending().await.unwrap();

        wait_for_status(&store, task.id, TaskStatus::Failed).await;

        let task = store.get_task(task.id).await.unwrap().unwrap();
        assert!(task.outcome.error.as_deref().unwrap().contains("model down"));

        let agent = store.get_agent("worker-1").await.unwrap().unwrap();
        assert_eq!(agent.status, AgentStatus::Available);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn duplicate_delivery_of_settled_task_is_ignored() {
        let generator = Arc::new(FixedGenerator::ok("done"));
        let (store, broker, deps) = deps(generator.clone() as Arc<dyn Generator>).await;

        let runtime = WorkerRuntime::with_name("worker-1", deps);
        let handle = runtime.spawn().await.unwrap();

        let task = store.create_task(None, "once").await.unwrap();
        store.assign_task(task.id, "worker-1").await.unwrap();

        let item = WorkItem::for_task(&store.get_task(task.id).await.unwrap().unwrap());
        broker.publish("agent_worker-1", &item).await.unwrap();
        wait_for_status(&store, task.id, TaskStatus::Completed).await;

        // The same message arrives again.
        broker.publish("agent_worker-1", &item).await.unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while broker.depth("agent_worker-1") + broker.unacked("agent_worker-1") > 0 {
            assert!(tokio::time::Instant::now() < deadline, "duplicate never drained");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // Only the first delivery hit the model.
        assert_eq!(generator.calls.load(Ordering::SeqCst), 1);
        let task = store.get_task(task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Completed);

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn delivery_for_deleted_task_is_discarded() {
        let (store, broker, deps) = deps(Arc::new(FixedGenerator::ok("unused"))).await;

        let runtime = WorkerRuntime::with_name("worker-1", deps);
        let handle = runtime.spawn().await.unwrap();

        let item = WorkItem {
            task_id: Uuid::new_v4(),
            description: "ghost".to_string(),
            project_id: None,
        };
        broker.publish("agent_worker-1", &item).await.unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while broker.depth("agent_worker-1") + broker.unacked("agent_worker-1") > 0 {
            assert!(tokio::time::Instant::now() < deadline, "ghost delivery never drained");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        handle.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_marks_agent_offline() {
        let (store, _broker, deps) = deps(Arc::new(FixedGenerator::ok("unused"))).await;

        let runtime = WorkerRuntime::with_name("worker-1", deps);
        let handle = runtime.spawn().await.unwrap();

        let agent = store.get_agent("worker-1").await.unwrap().unwrap();
        assert_eq!(agent.status, AgentStatus::Available);

        handle.shutdown().await;

        let agent = store.get_agent("worker-1").await.unwrap().unwrap();
        assert_eq!(agent.status, AgentStatus::Offline);
    }

    #[tokio::test]
    async fn spawn_workers_registers_each() {
        let (store, _broker, deps) = deps(Arc::new(FixedGenerator::ok("unused"))).await;

        let handles = spawn_workers(3, deps).await.unwrap();
        assert_eq!(store.list_agents().await.unwrap().len(), 3);

        for handle in handles {
            handle.shutdown().await;
        }
    }
}
