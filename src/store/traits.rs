//! `TaskStore` trait — single async interface over the task store and agent
//! registry. Each operation commits as one transaction; the database is the
//! only strongly-consistent shared resource, so all cross-agent coordination
//! goes through here.

use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::completion::CompletionPolicy;
use crate::error::StoreError;
use crate::model::{Agent, AgentStatus, Project, ProjectStatus, Task};

#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Run all pending schema migrations.
    async fn init_schema(&self) -> Result<(), StoreError>;

    // ── Projects ────────────────────────────────────────────────────

    /// Insert a new project with status `pending`.
    async fn create_project(&self, name: &str, description: &str) -> Result<Project, StoreError>;

    async fn get_project(&self, id: Uuid) -> Result<Option<Project>, StoreError>;

    async fn set_project_status(
        &self,
        id: Uuid,
        status: ProjectStatus,
    ) -> Result<(), StoreError>;

    /// Delete a project and all its tasks.
    async fn delete_project(&self, id: Uuid) -> Result<(), StoreError>;

    // ── Tasks ───────────────────────────────────────────────────────

    /// Insert a new task with status `pending`. `project_id` is optional:
    /// tasks may be standalone.
    async fn create_task(
        &self,
        project_id: Option<Uuid>,
        description: &str,
    ) -> Result<Task, StoreError>;

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, StoreError>;

    async fn list_tasks_for_project(&self, project_id: Uuid) -> Result<Vec<Task>, StoreError>;

    /// All `pending` tasks, oldest first.
    async fn list_pending_tasks(&self) -> Result<Vec<Task>, StoreError>;

    /// Bind a pending task to an agent: task → `assigned`, agent → `busy`.
    ///
    /// One transaction that re-checks the agent is still `available` before
    /// committing, so two concurrent dispatches can never bind the same
    /// agent. Fails with `AgentTaken` when raced.
    async fn assign_task(&self, task_id: Uuid, agent: &str) -> Result<(), StoreError>;

    /// Task `assigned` → `processing`. A repeat call on an already-processing
    /// task is a benign duplicate (redelivery).
    async fn mark_processing(&self, task_id: Uuid) -> Result<(), StoreError>;

    /// Task → `completed` with result text; releases the agent back to
    /// `available`. Re-completing an already-completed task is a no-op.
    async fn mark_completed(&self, task_id: Uuid, result: &str) -> Result<(), StoreError>;

    /// Task → `failed` with error text; releases the agent back to
    /// `available`. Re-failing an already-failed task is a no-op.
    async fn mark_failed(&self, task_id: Uuid, error: &str) -> Result<(), StoreError>;

    /// Return a `failed` task to `pending` for another attempt.
    async fn requeue_failed(&self, task_id: Uuid) -> Result<(), StoreError>;

    /// Number of tasks still counting against project completion under the
    /// given policy.
    async fn remaining_for_project(
        &self,
        project_id: Uuid,
        policy: CompletionPolicy,
    ) -> Result<u64, StoreError>;

    /// Total number of tasks in the project.
    async fn count_tasks_for_project(&self, project_id: Uuid) -> Result<u64, StoreError>;

    /// Reset tasks stuck in `assigned` longer than `older_than` back to
    /// `pending` (publish-failure reconciliation). Returns the reset ids.
    async fn reset_stale_assigned(&self, older_than: Duration) -> Result<Vec<Uuid>, StoreError>;

    // ── Agents ──────────────────────────────────────────────────────

    /// Refresh an agent's heartbeat. Upserts on first call: this is how a
    /// worker registers. Registration sets status `available`; later beats
    /// leave the status untouched.
    async fn heartbeat(&self, name: &str, capabilities: &[String]) -> Result<(), StoreError>;

    /// One live agent with status `available`, freshest heartbeat first, or
    /// `None`. An agent whose heartbeat is older than `liveness_window` is
    /// never returned, whatever its stored status says.
    async fn select_available_agent(
        &self,
        capability: Option<&str>,
        liveness_window: Duration,
    ) -> Result<Option<Agent>, StoreError>;

    async fn set_agent_status(&self, name: &str, status: AgentStatus) -> Result<(), StoreError>;

    async fn get_agent(&self, name: &str) -> Result<Option<Agent>, StoreError>;

    async fn list_agents(&self) -> Result<Vec<Agent>, StoreError>;
}
