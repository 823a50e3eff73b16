//! libSQL store — async `TaskStore` implementation.
//!
//! Backs both the task store and the agent registry with one database.
//! Supports local file and in-memory databases.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::info;
use uuid::Uuid;

use crate::completion::CompletionPolicy;
use crate::error::StoreError;
use crate::model::{Agent, AgentStatus, Project, ProjectStatus, Task, TaskOutcome, TaskStatus};
use crate::store::migrations;
use crate::store::traits::TaskStore;

/// libSQL task store backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Unavailable(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| StoreError::Unavailable(format!("Failed to open database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| StoreError::Unavailable(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        store.init_schema().await?;
        info!(path = %path.display(), "Task store opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, StoreError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                StoreError::Unavailable(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| StoreError::Unavailable(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
        };
        store.init_schema().await?;
        Ok(store)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Terminal transition shared by `mark_completed` / `mark_failed`:
    /// conditional status write plus agent release, idempotent under
    /// redelivery.
    async fn mark_terminal(
        &self,
        task_id: Uuid,
        target: TaskStatus,
        outcome: &TaskOutcome,
    ) -> Result<(), StoreError> {
        let conn = self.conn();
        let now = fmt_ts(Utc::now());

        let affected = conn
            .execute(
                "UPDATE tasks
                 SET status = ?1, result = ?2, error = ?3,
                     completion_percentage = ?4, updated_at = ?5
                 WHERE id = ?6 AND status IN ('assigned', 'processing')",
                params![
                    target.as_str(),
                    opt_text(outcome.result.as_deref()),
                    opt_text(outcome.error.as_deref()),
                    if target == TaskStatus::Completed { 100i64 } else { 0i64 },
                    now,
                    task_id.to_string()
                ],
            )
            .await
            .map_err(query_err)?;

        if affected == 0 {
            // Either the task is gone, or this is a duplicate delivery of an
            // already-terminal task. The duplicate is benign; anything else
            // is a conflict.
            let task = self
                .get_task(task_id)
                .await?
                .ok_or_else(|| StoreError::NotFound {
                    entity: "task",
                    id: task_id.to_string(),
                })?;
            if task.status == target {
                return Ok(());
            }
            return Err(StoreError::StatusConflict {
                task_id,
                expected: "assigned or processing",
                actual: task.status.to_string(),
            });
        }

        // Release the agent back to service.
        let mut rows = conn
            .query(
                "SELECT assigned_agent FROM tasks WHERE id = ?1",
                params![task_id.to_string()],
            )
            .await
            .map_err(query_err)?;
        if let Some(row) = rows.next().await.map_err(query_err)? {
            let agent: Option<String> = row.get(0).ok();
            if let Some(agent) = agent {
                conn.execute(
                    "UPDATE worker_agents SET status = 'available'
                     WHERE name = ?1 AND status = 'busy'",
                    params![agent],
                )
                .await
                .map_err(query_err)?;
            }
        }

        Ok(())
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical timestamp format: fixed-width RFC 3339 so that string
/// comparison in SQL matches chronological order.
fn fmt_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parse a stored RFC 3339 timestamp.
fn parse_ts(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn query_err(e: libsql::Error) -> StoreError {
    StoreError::Query(e.to_string())
}

/// Convert `Option<&str>` to a libsql value.
fn opt_text(s: Option<&str>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s.to_string()),
        None => libsql::Value::Null,
    }
}

fn parse_uuid(s: &str) -> Uuid {
    Uuid::parse_str(s).unwrap_or_else(|_| Uuid::nil())
}

const TASK_COLUMNS: &str = "id, project_id, description, status, assigned_agent, \
                            completion_percentage, result, error, created_at, updated_at";

const AGENT_COLUMNS: &str = "name, status, capabilities, last_heartbeat";

/// Map a libsql row (in `TASK_COLUMNS` order) to a Task.
fn row_to_task(row: &libsql::Row) -> Result<Task, StoreError> {
    let id: String = row.get(0).map_err(query_err)?;
    let project_id: Option<String> = row.get(1).ok();
    let description: String = row.get(2).map_err(query_err)?;
    let status_str: String = row.get(3).map_err(query_err)?;
    let assigned_agent: Option<String> = row.get(4).ok();
    let completion: i64 = row.get(5).unwrap_or(0);
    let result: Option<String> = row.get(6).ok();
    let error: Option<String> = row.get(7).ok();
    let created_str: String = row.get(8).map_err(query_err)?;
    let updated_str: String = row.get(9).map_err(query_err)?;

    let status =
        TaskStatus::parse(&status_str).ok_or_else(|| StoreError::InvalidStatus(status_str))?;

    Ok(Task {
        id: parse_uuid(&id),
        project_id: project_id.as_deref().map(parse_uuid),
        description,
        status,
        assigned_agent,
        completion_percentage: completion.clamp(0, 100) as u8,
        outcome: TaskOutcome { result, error },
        created_at: parse_ts(&created_str),
        updated_at: parse_ts(&updated_str),
    })
}

fn row_to_project(row: &libsql::Row) -> Result<Project, StoreError> {
    let id: String = row.get(0).map_err(query_err)?;
    let name: String = row.get(1).map_err(query_err)?;
    let description: String = row.get(2).map_err(query_err)?;
    let status_str: String = row.get(3).map_err(query_err)?;
    let created_str: String = row.get(4).map_err(query_err)?;
    let updated_str: String = row.get(5).map_err(query_err)?;

    let status =
        ProjectStatus::parse(&status_str).ok_or_else(|| StoreError::InvalidStatus(status_str))?;

    Ok(Project {
        id: parse_uuid(&id),
        name,
        description,
        status,
        created_at: parse_ts(&created_str),
        updated_at: parse_ts(&updated_str),
    })
}

/// Map a libsql row (in `AGENT_COLUMNS` order) to an Agent.
fn row_to_agent(row: &libsql::Row) -> Result<Agent, StoreError> {
    let name: String = row.get(0).map_err(query_err)?;
    let status_str: String = row.get(1).map_err(query_err)?;
    let capabilities_str: String = row.get(2).unwrap_or_else(|_| "[]".into());
    let heartbeat_str: String = row.get(3).map_err(query_err)?;

    let status =
        AgentStatus::parse(&status_str).ok_or_else(|| StoreError::InvalidStatus(status_str))?;
    let capabilities: Vec<String> = serde_json::from_str(&capabilities_str)
        .map_err(|e| StoreError::Serialization(format!("Bad capabilities JSON: {e}")))?;

    Ok(Agent {
        name,
        status,
        capabilities,
        last_heartbeat: parse_ts(&heartbeat_str),
    })
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl TaskStore for LibSqlStore {
    async fn init_schema(&self) -> Result<(), StoreError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Projects ────────────────────────────────────────────────────

    async fn create_project(&self, name: &str, description: &str) -> Result<Project, StoreError> {
        let now = Utc::now();
        let project = Project {
            id: Uuid::new_v4(),
            name: name.to_string(),
            description: description.to_string(),
            status: ProjectStatus::Pending,
            created_at: now,
            updated_at: now,
        };

        self.conn()
            .execute(
                "INSERT INTO projects (id, name, description, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    project.id.to_string(),
                    name,
                    description,
                    project.status.as_str(),
                    fmt_ts(now),
                    fmt_ts(now)
                ],
            )
            .await
            .map_err(query_err)?;

        Ok(project)
    }

    async fn get_project(&self, id: Uuid) -> Result<Option<Project>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT id, name, description, status, created_at, updated_at
                 FROM projects WHERE id = ?1",
                params![id.to_string()],
            )
            .await
            .map_err(query_err)?;

        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(row_to_project(&row)?)),
            None => Ok(None),
        }
    }

    async fn set_project_status(
        &self,
        id: Uuid,
        status: ProjectStatus,
    ) -> Result<(), StoreError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE projects SET status = ?1, updated_at = ?2 WHERE id = ?3",
                params![status.as_str(), fmt_ts(Utc::now()), id.to_string()],
            )
            .await
            .map_err(query_err)?;

        if affected == 0 {
            return Err(StoreError::NotFound {
                entity: "project",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn delete_project(&self, id: Uuid) -> Result<(), StoreError> {
        let conn = self.conn();
        // Foreign keys may be off by default; cascade explicitly.
        conn.execute(
            "DELETE FROM tasks WHERE project_id = ?1",
            params![id.to_string()],
        )
        .await
        .map_err(query_err)?;

        let affected = conn
            .execute("DELETE FROM projects WHERE id = ?1", params![id.to_string()])
            .await
            .map_err(query_err)?;

        if affected == 0 {
            return Err(StoreError::NotFound {
                entity: "project",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    // ── Tasks ───────────────────────────────────────────────────────

    async fn create_task(
        &self,
        project_id: Option<Uuid>,
        description: &str,
    ) -> Result<Task, StoreError> {
        let now = Utc::now();
        let task = Task {
            id: Uuid::new_v4(),
            project_id,
            description: description.to_string(),
            status: TaskStatus::Pending,
            assigned_agent: None,
            completion_percentage: 0,
            outcome: TaskOutcome::default(),
            created_at: now,
            updated_at: now,
        };

        self.conn()
            .execute(
                "INSERT INTO tasks (id, project_id, description, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, 'pending', ?4, ?5)",
                params![
                    task.id.to_string(),
                    opt_text(project_id.map(|p| p.to_string()).as_deref()),
                    description,
                    fmt_ts(now),
                    fmt_ts(now)
                ],
            )
            .await
            .map_err(query_err)?;

        Ok(task)
    }

    async fn get_task(&self, id: Uuid) -> Result<Option<Task>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(query_err)?;

        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(row_to_task(&row)?)),
            None => Ok(None),
        }
    }

    async fn list_tasks_for_project(&self, project_id: Uuid) -> Result<Vec<Task>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks
                     WHERE project_id = ?1 ORDER BY created_at"
                ),
                params![project_id.to_string()],
            )
            .await
            .map_err(query_err)?;

        let mut tasks = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            tasks.push(row_to_task(&row)?);
        }
        Ok(tasks)
    }

    async fn list_pending_tasks(&self) -> Result<Vec<Task>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks
                     WHERE status = 'pending' ORDER BY created_at"
                ),
                (),
            )
            .await
            .map_err(query_err)?;

        let mut tasks = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            tasks.push(row_to_task(&row)?);
        }
        Ok(tasks)
    }

    async fn assign_task(&self, task_id: Uuid, agent: &str) -> Result<(), StoreError> {
        let conn = self.conn();
        let now = fmt_ts(Utc::now());

        let tx = conn
            .transaction()
            .await
            .map_err(|e| StoreError::Unavailable(format!("Failed to begin transaction: {e}")))?;

        // Re-check the agent is still free; this is what serializes two
        // concurrent dispatch attempts.
        let agent_claimed = tx
            .execute(
                "UPDATE worker_agents SET status = 'busy'
                 WHERE name = ?1 AND status = 'available'",
                params![agent],
            )
            .await
            .map_err(query_err)?;

        if agent_claimed == 0 {
            tx.rollback().await.ok();
            return Err(StoreError::AgentTaken {
                name: agent.to_string(),
            });
        }

        let task_claimed = tx
            .execute(
                "UPDATE tasks SET status = 'assigned', assigned_agent = ?1, updated_at = ?2
                 WHERE id = ?3 AND status = 'pending'",
                params![agent, now, task_id.to_string()],
            )
            .await
            .map_err(query_err)?;

        if task_claimed == 0 {
            tx.rollback().await.ok();
            let task = self.get_task(task_id).await?;
            return match task {
                None => Err(StoreError::NotFound {
                    entity: "task",
                    id: task_id.to_string(),
                }),
                Some(t) => Err(StoreError::StatusConflict {
                    task_id,
                    expected: "pending",
                    actual: t.status.to_string(),
                }),
            };
        }

        tx.commit()
            .await
            .map_err(|e| StoreError::Unavailable(format!("Failed to commit assignment: {e}")))?;
        Ok(())
    }

    async fn mark_processing(&self, task_id: Uuid) -> Result<(), StoreError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE tasks SET status = 'processing', updated_at = ?1
                 WHERE id = ?2 AND status = 'assigned'",
                params![fmt_ts(Utc::now()), task_id.to_string()],
            )
            .await
            .map_err(query_err)?;

        if affected == 0 {
            let task = self
                .get_task(task_id)
                .await?
                .ok_or_else(|| StoreError::NotFound {
                    entity: "task",
                    id: task_id.to_string(),
                })?;
            // Redelivered work item for a task already being processed.
            if task.status == TaskStatus::Processing {
                return Ok(());
            }
            return Err(StoreError::StatusConflict {
                task_id,
                expected: "assigned",
                actual: task.status.to_string(),
            });
        }
        Ok(())
    }

    async fn mark_completed(&self, task_id: Uuid, result: &str) -> Result<(), StoreError> {
        self.mark_terminal(task_id, TaskStatus::Completed, &TaskOutcome::success(result))
            .await
    }

    async fn mark_failed(&self, task_id: Uuid, error: &str) -> Result<(), StoreError> {
        self.mark_terminal(task_id, TaskStatus::Failed, &TaskOutcome::failure(error))
            .await
    }

    async fn requeue_failed(&self, task_id: Uuid) -> Result<(), StoreError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE tasks SET status = 'pending', assigned_agent = NULL,
                        error = NULL, updated_at = ?1
                 WHERE id = ?2 AND status = 'failed'",
                params![fmt_ts(Utc::now()), task_id.to_string()],
            )
            .await
            .map_err(query_err)?;

        if affected == 0 {
            let task = self
                .get_task(task_id)
                .await?
                .ok_or_else(|| StoreError::NotFound {
                    entity: "task",
                    id: task_id.to_string(),
                })?;
            return Err(StoreError::StatusConflict {
                task_id,
                expected: "failed",
                actual: task.status.to_string(),
            });
        }
        Ok(())
    }

    async fn remaining_for_project(
        &self,
        project_id: Uuid,
        policy: CompletionPolicy,
    ) -> Result<u64, StoreError> {
        let sql = match policy {
            CompletionPolicy::CompletedOnly => {
                "SELECT COUNT(*) FROM tasks WHERE project_id = ?1 AND status != 'completed'"
            }
            CompletionPolicy::CompletedOrFailed => {
                "SELECT COUNT(*) FROM tasks
                 WHERE project_id = ?1 AND status NOT IN ('completed', 'failed')"
            }
        };

        let mut rows = self
            .conn()
            .query(sql, params![project_id.to_string()])
            .await
            .map_err(query_err)?;

        let row = rows.next().await.map_err(query_err)?;
        let count: i64 = row.map(|r| r.get(0).unwrap_or(0)).unwrap_or(0);
        Ok(count.max(0) as u64)
    }

    async fn count_tasks_for_project(&self, project_id: Uuid) -> Result<u64, StoreError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT COUNT(*) FROM tasks WHERE project_id = ?1",
                params![project_id.to_string()],
            )
            .await
            .map_err(query_err)?;

        let row = rows.next().await.map_err(query_err)?;
        let count: i64 = row.map(|r| r.get(0).unwrap_or(0)).unwrap_or(0);
        Ok(count.max(0) as u64)
    }

    async fn reset_stale_assigned(&self, older_than: Duration) -> Result<Vec<Uuid>, StoreError> {
        let cutoff = fmt_ts(Utc::now() - chrono::Duration::from_std(older_than).unwrap_or_default());

        let mut rows = self
            .conn()
            .query(
                "SELECT id, assigned_agent FROM tasks
                 WHERE status = 'assigned' AND updated_at < ?1",
                params![cutoff.clone()],
            )
            .await
            .map_err(query_err)?;

        let mut stale = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            let id: String = row.get(0).map_err(query_err)?;
            let agent: Option<String> = row.get(1).ok();
            stale.push((parse_uuid(&id), agent));
        }

        let mut reset = Vec::new();
        for (id, agent) in stale {
            // Conditional write: the worker may have started processing
            // between the scan and this update.
            let affected = self
                .conn()
                .execute(
                    "UPDATE tasks SET status = 'pending', assigned_agent = NULL, updated_at = ?1
                     WHERE id = ?2 AND status = 'assigned' AND updated_at < ?3",
                    params![fmt_ts(Utc::now()), id.to_string(), cutoff.clone()],
                )
                .await
                .map_err(query_err)?;
            if affected > 0 {
                // The binding is undone, so the agent goes back to the pool.
                if let Some(agent) = agent {
                    self.conn()
                        .execute(
                            "UPDATE worker_agents SET status = 'available'
                             WHERE name = ?1 AND status = 'busy'",
                            params![agent],
                        )
                        .await
                        .map_err(query_err)?;
                }
                reset.push(id);
            }
        }
        Ok(reset)
    }

    // ── Agents ──────────────────────────────────────────────────────

    async fn heartbeat(&self, name: &str, capabilities: &[String]) -> Result<(), StoreError> {
        let caps_json = serde_json::to_string(capabilities)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        // Upsert: first call registers the agent as available. Later beats
        // only refresh the timestamp, except that an `offline` agent
        // restarting under the same name comes back `available`. A `busy`
        // agent's status is never clobbered by its own heartbeat.
        self.conn()
            .execute(
                "INSERT INTO worker_agents (id, name, status, capabilities, last_heartbeat)
                 VALUES (?1, ?2, 'available', ?3, ?4)
                 ON CONFLICT(name) DO UPDATE SET
                     last_heartbeat = excluded.last_heartbeat,
                     capabilities = excluded.capabilities,
                     status = CASE WHEN worker_agents.status = 'offline'
                                   THEN 'available' ELSE worker_agents.status END",
                params![
                    Uuid::new_v4().to_string(),
                    name,
                    caps_json,
                    fmt_ts(Utc::now())
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn select_available_agent(
        &self,
        capability: Option<&str>,
        liveness_window: Duration,
    ) -> Result<Option<Agent>, StoreError> {
        let cutoff = fmt_ts(
            Utc::now() - chrono::Duration::from_std(liveness_window).unwrap_or_default(),
        );

        // Freshest heartbeat first: prefer the agent most likely still alive.
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {AGENT_COLUMNS} FROM worker_agents
                     WHERE status = 'available' AND last_heartbeat >= ?1
                     ORDER BY last_heartbeat DESC"
                ),
                params![cutoff],
            )
            .await
            .map_err(query_err)?;

        while let Some(row) = rows.next().await.map_err(query_err)? {
            let agent = row_to_agent(&row)?;
            match capability {
                Some(cap) if !agent.capabilities.iter().any(|c| c == cap) => continue,
                _ => return Ok(Some(agent)),
            }
        }
        Ok(None)
    }

    async fn set_agent_status(&self, name: &str, status: AgentStatus) -> Result<(), StoreError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE worker_agents SET status = ?1 WHERE name = ?2",
                params![status.as_str(), name],
            )
            .await
            .map_err(query_err)?;

        if affected == 0 {
            return Err(StoreError::NotFound {
                entity: "agent",
                id: name.to_string(),
            });
        }
        Ok(())
    }

    async fn get_agent(&self, name: &str) -> Result<Option<Agent>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {AGENT_COLUMNS} FROM worker_agents WHERE name = ?1"),
                params![name],
            )
            .await
            .map_err(query_err)?;

        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(row_to_agent(&row)?)),
            None => Ok(None),
        }
    }

    async fn list_agents(&self) -> Result<Vec<Agent>, StoreError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {AGENT_COLUMNS} FROM worker_agents ORDER BY last_heartbeat DESC"
                ),
                (),
            )
            .await
            .map_err(query_err)?;

        let mut agents = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            agents.push(row_to_agent(&row)?);
        }
        Ok(agents)
    }
}
