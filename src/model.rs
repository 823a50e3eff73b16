//! Core data model: tasks, projects, agents, and the wire work item.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a task.
///
/// `pending` tasks are owned by the dispatcher; everything after `assigned`
/// is driven by a worker runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Assigned,
    Processing,
    Completed,
    Failed,
}

impl TaskStatus {
    /// Check if this status allows transitioning to another status.
    ///
    /// `Failed -> Pending` is the requeue path: a failed task may be returned
    /// to the pool for another attempt.
    pub fn can_transition_to(&self, target: TaskStatus) -> bool {
        use TaskStatus::*;

        matches!(
            (self, target),
            (Pending, Assigned)
                | (Assigned, Processing)
                | (Assigned, Pending) // reconciliation: publish failed after assign
                | (Processing, Completed)
                | (Processing, Failed)
                | (Failed, Pending)
        )
    }

    /// Terminal statuses are never left except via explicit requeue.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether a task in this status must carry an assigned agent.
    pub fn requires_agent(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Assigned => "assigned",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    /// Parse the storage representation. Status columns are plain text, so
    /// readers validate here.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "assigned" => Some(Self::Assigned),
            "processing" => Some(Self::Processing),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Status of a project, derived from its tasks by the completion aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Pending,
    Active,
    Completed,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Completed => "completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "active" => Some(Self::Active),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }
}

impl std::fmt::Display for ProjectStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Availability state of a worker agent.
///
/// `Offline` is only written on graceful shutdown; a crashed worker is
/// detected by heartbeat staleness, never by an explicit state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Available,
    Busy,
    Offline,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Available => "available",
            Self::Busy => "busy",
            Self::Offline => "offline",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "available" => Some(Self::Available),
            "busy" => Some(Self::Busy),
            "offline" => Some(Self::Offline),
            _ => None,
        }
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Result or error text recorded on a task when it reaches a terminal status.
///
/// Serializes to the legacy `{"result": …, "error": …}` metadata shape, but
/// the fields are fixed rather than an open map.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOutcome {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskOutcome {
    pub fn success(result: impl Into<String>) -> Self {
        Self {
            result: Some(result.into()),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            result: None,
            error: Some(error.into()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.result.is_none() && self.error.is_none()
    }
}

/// A unit of work with a lifecycle status, optionally owned by a project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    /// Owning project, if any. Standalone tasks have none.
    pub project_id: Option<Uuid>,
    pub description: String,
    pub status: TaskStatus,
    /// Name of the agent the task is bound to. Non-null iff the status is
    /// past `pending`.
    pub assigned_agent: Option<String>,
    pub completion_percentage: u8,
    pub outcome: TaskOutcome,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// The assigned-agent invariant: an agent is recorded exactly when the
    /// status requires one.
    pub fn invariants_hold(&self) -> bool {
        self.assigned_agent.is_some() == self.status.requires_agent()
    }
}

/// A grouping of tasks with its own status derived from its tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub name: String,
    pub description: String,
    pub status: ProjectStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A worker agent as tracked in the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Agent {
    /// Stable identity across restarts (typically a generated worker id).
    pub name: String,
    pub status: AgentStatus,
    /// Task-type tags this agent can run (e.g. the model it serves).
    pub capabilities: Vec<String>,
    pub last_heartbeat: DateTime<Utc>,
}

impl Agent {
    /// Liveness is heartbeat age, not the persisted status: an `available`
    /// row with a stale heartbeat is dead to selection logic.
    pub fn is_live(&self, window: std::time::Duration, now: DateTime<Utc>) -> bool {
        let age = now.signed_duration_since(self.last_heartbeat);
        age.num_milliseconds() >= 0 && age.to_std().map(|a| a <= window).unwrap_or(false)
    }
}

/// Transient wire payload carrying one task assignment over the queue.
///
/// The task row is the durable truth; this is only the instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkItem {
    pub task_id: Uuid,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_id: Option<Uuid>,
}

impl WorkItem {
    pub fn for_task(task: &Task) -> Self {
        Self {
            task_id: task.id,
            description: task.description.clone(),
            project_id: task.project_id,
        }
    }
}
