//! Task dependency edges with acyclicity enforcement.

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};

use super::{fmt_ts, Store};
use crate::error::CoreError;
use crate::types::{DependencyKind, TaskDependency, UserId};

impl Store {
    /// Add a dependency edge: `task` is blocked by `blocked_by`.
    ///
    /// Self-edges and edges that would close a cycle are rejected. The
    /// cycle check walks the existing edges inside the insert transaction,
    /// so two racing inserts cannot sneak a cycle past it on one pool.
    ///
    /// # Errors
    ///
    /// Returns `InvalidRequest` on a self-edge or cycle; `NotFound` when
    /// either task does not belong to this user.
    pub async fn add_dependency(
        &self,
        user: &UserId,
        task_id: &str,
        blocked_by_task_id: &str,
        kind: DependencyKind,
        now: DateTime<Utc>,
    ) -> Result<(), CoreError> {
        if task_id == blocked_by_task_id {
            return Err(CoreError::invalid("a task cannot block itself"));
        }

        let mut tx = self.pool().begin().await?;

        for id in [task_id, blocked_by_task_id] {
            let exists: Option<(i64,)> =
                sqlx::query_as("SELECT 1 FROM tasks WHERE id = ?1 AND user_id = ?2")
                    .bind(id)
                    .bind(user.as_str())
                    .fetch_optional(&mut *tx)
                    .await?;
            if exists.is_none() {
                return Err(CoreError::NotFound(format!("task {id}")));
            }
        }

        // Walk blocked_by -> its blockers; reaching task_id means the new
        // edge would close a cycle.
        let edges: Vec<(String, String)> = sqlx::query_as(
            "SELECT d.task_id, d.blocked_by_task_id FROM task_dependencies d \
             JOIN tasks t ON t.id = d.task_id WHERE t.user_id = ?1",
        )
        .bind(user.as_str())
        .fetch_all(&mut *tx)
        .await?;

        let mut adjacency: HashMap<&str, Vec<&str>> = HashMap::new();
        for (task, blocker) in &edges {
            adjacency.entry(task.as_str()).or_default().push(blocker.as_str());
        }
        let mut seen: HashSet<&str> = HashSet::new();
        let mut queue: VecDeque<&str> = VecDeque::from([blocked_by_task_id]);
        while let Some(current) = queue.pop_front() {
            if current == task_id {
                return Err(CoreError::invalid(format!(
                    "dependency {task_id} -> {blocked_by_task_id} would create a cycle"
                )));
            }
            if seen.insert(current) {
                if let Some(next) = adjacency.get(current) {
                    queue.extend(next.iter().copied());
                }
            }
        }

        sqlx::query(
            "INSERT OR IGNORE INTO task_dependencies \
             (task_id, blocked_by_task_id, kind, created_at) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(task_id)
        .bind(blocked_by_task_id)
        .bind(kind.as_str())
        .bind(fmt_ts(now))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Dependencies for one task.
    ///
    /// # Errors
    ///
    /// Returns `Internal` on storage failure.
    pub async fn dependencies_of(&self, task_id: &str) -> Result<Vec<TaskDependency>, CoreError> {
        let rows: Vec<(String, String, String, String)> = sqlx::query_as(
            "SELECT task_id, blocked_by_task_id, kind, created_at \
             FROM task_dependencies WHERE task_id = ?1",
        )
        .bind(task_id)
        .fetch_all(self.pool())
        .await?;
        rows.into_iter()
            .map(|(task, blocker, kind, created)| {
                Ok(TaskDependency {
                    task_id: task,
                    blocked_by_task_id: blocker,
                    kind: DependencyKind::parse(&kind)?,
                    created_at: super::parse_ts(&created)?,
                })
            })
            .collect()
    }

    /// The subset of `task_ids` that have at least one open (not
    /// completed) blocking task.
    ///
    /// # Errors
    ///
    /// Returns `Internal` on storage failure.
    pub async fn tasks_with_open_blockers(
        &self,
        user: &UserId,
        task_ids: &[String],
    ) -> Result<HashSet<String>, CoreError> {
        let mut blocked = HashSet::new();
        for task_id in task_ids {
            let open: Option<(i64,)> = sqlx::query_as(
                "SELECT 1 FROM task_dependencies d \
                 JOIN tasks b ON b.id = d.blocked_by_task_id \
                 WHERE d.task_id = ?1 AND d.kind != ?2 \
                 AND b.user_id = ?3 AND b.is_completed = 0 \
                 LIMIT 1",
            )
            .bind(task_id)
            .bind(DependencyKind::RelatedTo.as_str())
            .bind(user.as_str())
            .fetch_optional(self.pool())
            .await?;
            if open.is_some() {
                blocked.insert(task_id.clone());
            }
        }
        Ok(blocked)
    }
}
