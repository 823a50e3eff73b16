//! Completion aggregator — rolls task state up to the owning project.
//!
//! Always a fresh recount, never an incremental counter: concurrent
//! completions and tasks added after the fact both resolve correctly because
//! the recompute is authoritative on every invocation.

use std::sync::Arc;

use uuid::Uuid;

use crate::error::StoreError;
use crate::model::{ProjectStatus, TaskStatus};
use crate::store::TaskStore;

/// When a project counts as complete.
///
/// The original system was inconsistent about whether `failed` tasks block
/// completion; this makes the choice explicit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionPolicy {
    /// Only `completed` tasks count as done — a permanently failed task
    /// blocks its project forever. Compatibility mode.
    CompletedOnly,
    /// Both `completed` and `failed` are done; the project finishes once no
    /// task can still make progress. The default.
    CompletedOrFailed,
}

impl Default for CompletionPolicy {
    fn default() -> Self {
        Self::CompletedOrFailed
    }
}

impl CompletionPolicy {
    /// Whether a task in this status still counts against completion.
    pub fn counts_as_remaining(&self, status: TaskStatus) -> bool {
        match self {
            Self::CompletedOnly => status != TaskStatus::Completed,
            Self::CompletedOrFailed => !status.is_terminal(),
        }
    }
}

impl std::str::FromStr for CompletionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "completed_only" => Ok(Self::CompletedOnly),
            "completed_or_failed" => Ok(Self::CompletedOrFailed),
            other => Err(format!("unknown completion policy: {other}")),
        }
    }
}

impl std::fmt::Display for CompletionPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::CompletedOnly => "completed_only",
            Self::CompletedOrFailed => "completed_or_failed",
        };
        write!(f, "{s}")
    }
}

/// Re-derive a project's status from a fresh task count.
///
/// A project is `completed` iff it has at least one task and zero tasks
/// remaining under the policy. A previously-completed project that gained a
/// new pending task reverts to `active`. Returns the resulting status, or
/// `None` when the project no longer exists (deleted concurrently — not an
/// error here, the caller holds only a stale reference).
pub async fn refresh_project(
    store: &Arc<dyn TaskStore>,
    project_id: Uuid,
    policy: CompletionPolicy,
) -> Result<Option<ProjectStatus>, StoreError> {
    let Some(project) = store.get_project(project_id).await? else {
        return Ok(None);
    };

    let total = store.count_tasks_for_project(project_id).await?;
    let remaining = store.remaining_for_project(project_id, policy).await?;

    let derived = if total > 0 && remaining == 0 {
        ProjectStatus::Completed
    } else if project.status == ProjectStatus::Completed {
        // Completion no longer holds — a task was added or requeued.
        ProjectStatus::Active
    } else {
        project.status
    };

    if derived != project.status {
        store.set_project_status(project_id, derived).await?;
        tracing::info!(
            project_id = %project_id,
            from = %project.status,
            to = %derived,
            remaining,
            "Project status recomputed"
        );
    }

    Ok(Some(derived))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completed_only_counts_failed_as_remaining() {
        let p = CompletionPolicy::CompletedOnly;
        assert!(p.counts_as_remaining(TaskStatus::Failed));
        assert!(p.counts_as_remaining(TaskStatus::Pending));
        assert!(!p.counts_as_remaining(TaskStatus::Completed));
    }

    #[test]
    fn completed_or_failed_treats_failed_as_done() {
        let p = CompletionPolicy::CompletedOrFailed;
        assert!(!p.counts_as_remaining(TaskStatus::Failed));
        assert!(!p.counts_as_remaining(TaskStatus::Completed));
        assert!(p.counts_as_remaining(TaskStatus::Processing));
    }

    #[test]
    fn policy_parse() {
        assert_eq!(
            "completed_only".parse::<CompletionPolicy>().unwrap(),
            CompletionPolicy::CompletedOnly
        );
        assert!("strict".parse::<CompletionPolicy>().is_err());
    }
}
