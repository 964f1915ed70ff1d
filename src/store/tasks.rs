//! Durable task records with a status state machine and priority ordering.

use std::collections::HashMap;
use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{JsonDocument, StoreError};

/// Task lifecycle states.
///
/// Legal transitions are `pending → processing`,
/// `processing → completed | failed`, and
/// `pending | processing → cancelled`. Terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl TaskStatus {
    /// Whether the status is terminal.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Whether a transition to `next` is legal.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        match (self, next) {
            (Self::Pending, Self::Processing) => true,
            (Self::Processing, Self::Completed | Self::Failed) => true,
            (Self::Pending | Self::Processing, Self::Cancelled) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Execution options carried alongside a task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_budget_usd: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_tools: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disallowed_tools: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mcp_config: Option<String>,
}

/// A durable unit of asynchronous work dispatched by the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub status: TaskStatus,
    pub priority: u8,
    pub prompt: String,
    pub project_path: String,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub cost_usd: f64,
    #[serde(default)]
    pub metadata: TaskMetadata,
}

/// Fields accepted when enqueuing a task.
#[derive(Debug, Clone, Default)]
pub struct NewTask {
    pub prompt: String,
    pub project_path: String,
    pub model: String,
    pub priority: Option<u8>,
    pub metadata: TaskMetadata,
}

/// Partial update applied by [`TaskStore::update`]. Status changes go
/// through the dedicated transition methods instead.
#[derive(Debug, Clone, Default)]
pub struct TaskPatch {
    pub priority: Option<u8>,
    pub metadata: Option<TaskMetadata>,
}

/// Per-status task counts reported by [`TaskStore::counts`].
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct TaskCounts {
    pub total: usize,
    pub pending: usize,
    pub processing: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
}

/// Filters for [`TaskStore::list`].
#[derive(Debug, Clone, Default)]
pub struct TaskFilter {
    pub status: Option<TaskStatus>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct TasksDoc {
    #[serde(default)]
    tasks: HashMap<Uuid, Task>,
}

/// Store for task records, backed by `tasks.json`.
pub struct TaskStore {
    doc: JsonDocument<TasksDoc>,
}

/// Priority ordering used by `list` and `get_next_pending`: higher priority
/// first, FIFO by creation time within a priority.
fn dispatch_order(a: &Task, b: &Task) -> std::cmp::Ordering {
    b.priority
        .cmp(&a.priority)
        .then_with(|| a.created_at.cmp(&b.created_at))
}

impl TaskStore {
    /// Open (or create) the store at `dir/tasks.json`.
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        Ok(Self {
            doc: JsonDocument::open(dir.join("tasks.json"))?,
        })
    }

    /// Persist a new task in `pending` state. Priority is clamped to 1..=10.
    pub async fn create(&self, new: NewTask) -> Result<Task, StoreError> {
        let now = Utc::now();
        let task = Task {
            id: Uuid::new_v4(),
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            status: TaskStatus::Pending,
            priority: new.priority.unwrap_or(5).clamp(1, 10),
            prompt: new.prompt,
            project_path: new.project_path,
            model: new.model,
            result: None,
            error: None,
            duration_ms: None,
            cost_usd: 0.0,
            metadata: new.metadata,
        };

        let stored = task.clone();
        self.doc
            .with_lock(move |doc| {
                doc.tasks.insert(stored.id, stored);
            })
            .await?;

        Ok(task)
    }

    /// Fetch a task by id.
    pub async fn get(&self, id: Uuid) -> Result<Option<Task>, StoreError> {
        self.doc.read(|doc| doc.tasks.get(&id).cloned()).await
    }

    /// Remove a task record outright. Returns `true` when one was deleted.
    pub async fn delete(&self, id: Uuid) -> Result<bool, StoreError> {
        self.doc
            .with_lock(move |doc| doc.tasks.remove(&id).is_some())
            .await
    }

    /// List tasks in dispatch order.
    pub async fn list(&self, filter: TaskFilter) -> Result<Vec<Task>, StoreError> {
        self.doc
            .read(|doc| {
                let mut tasks: Vec<Task> = doc
                    .tasks
                    .values()
                    .filter(|t| filter.status.map_or(true, |status| t.status == status))
                    .cloned()
                    .collect();
                tasks.sort_by(dispatch_order);
                if let Some(limit) = filter.limit {
                    tasks.truncate(limit);
                }
                tasks
            })
            .await
    }

    /// The next `pending` task in dispatch order, if any.
    ///
    /// Not atomic with [`TaskStore::mark_processing`]; the queue reserves
    /// its concurrency slot before marking.
    pub async fn get_next_pending(&self) -> Result<Option<Task>, StoreError> {
        self.doc
            .read(|doc| {
                doc.tasks
                    .values()
                    .filter(|t| t.status == TaskStatus::Pending)
                    .min_by(|a, b| dispatch_order(a, b))
                    .cloned()
            })
            .await
    }

    /// Transition `pending → processing`, stamping `started_at`.
    /// Returns `None` when the task is missing or not pending.
    pub async fn mark_processing(&self, id: Uuid) -> Result<Option<Task>, StoreError> {
        self.transition(id, TaskStatus::Processing, |task| {
            task.started_at = Some(Utc::now());
        })
        .await
    }

    /// Transition `processing → completed`, storing the result and cost.
    pub async fn mark_completed(
        &self,
        id: Uuid,
        result: &str,
        cost_usd: f64,
    ) -> Result<Option<Task>, StoreError> {
        let result = result.to_string();
        self.transition(id, TaskStatus::Completed, move |task| {
            let now = Utc::now();
            task.result = Some(result);
            task.cost_usd = cost_usd;
            task.completed_at = Some(now);
            task.duration_ms = task
                .started_at
                .map(|started| (now - started).num_milliseconds().max(0) as u64);
        })
        .await
    }

    /// Transition `processing → failed`, storing the error.
    pub async fn mark_failed(&self, id: Uuid, error: &str) -> Result<Option<Task>, StoreError> {
        let error = error.to_string();
        self.transition(id, TaskStatus::Failed, move |task| {
            let now = Utc::now();
            task.error = Some(error);
            task.completed_at = Some(now);
            task.duration_ms = task
                .started_at
                .map(|started| (now - started).num_milliseconds().max(0) as u64);
        })
        .await
    }

    /// Cancel a task. Succeeds only from `pending` or `processing`;
    /// returns `None` otherwise.
    pub async fn cancel(&self, id: Uuid) -> Result<Option<Task>, StoreError> {
        self.transition(id, TaskStatus::Cancelled, |task| {
            task.completed_at = Some(Utc::now());
        })
        .await
    }

    /// Apply a partial update, allowed only while the task is not in a
    /// terminal state. Returns `None` when the id is unknown or the task
    /// is already terminal.
    pub async fn update(&self, id: Uuid, patch: TaskPatch) -> Result<Option<Task>, StoreError> {
        self.doc
            .with_lock(move |doc| {
                let task = doc.tasks.get_mut(&id)?;
                if task.status.is_terminal() {
                    return None;
                }
                if let Some(priority) = patch.priority {
                    task.priority = priority.clamp(1, 10);
                }
                if let Some(metadata) = patch.metadata {
                    task.metadata = metadata;
                }
                task.updated_at = Utc::now();
                Some(task.clone())
            })
            .await
    }

    /// Change priority, allowed only while the task can still be (re)ordered.
    pub async fn set_priority(&self, id: Uuid, priority: u8) -> Result<Option<Task>, StoreError> {
        self.update(
            id,
            TaskPatch {
                priority: Some(priority),
                metadata: None,
            },
        )
        .await
    }

    /// Reset any `processing` task back to `pending`. Used by queue
    /// startup to recover work interrupted by a crash. Returns the ids
    /// that were reset.
    pub async fn reset_processing_to_pending(&self) -> Result<Vec<Uuid>, StoreError> {
        self.doc
            .with_lock(|doc| {
                let mut reset = Vec::new();
                for task in doc.tasks.values_mut() {
                    if task.status == TaskStatus::Processing {
                        task.status = TaskStatus::Pending;
                        task.updated_at = Utc::now();
                        reset.push(task.id);
                    }
                }
                reset
            })
            .await
    }

    /// Per-status counts across all stored tasks.
    pub async fn counts(&self) -> Result<TaskCounts, StoreError> {
        self.doc
            .read(|doc| {
                let mut counts = TaskCounts {
                    total: doc.tasks.len(),
                    ..Default::default()
                };
                for task in doc.tasks.values() {
                    match task.status {
                        TaskStatus::Pending => counts.pending += 1,
                        TaskStatus::Processing => counts.processing += 1,
                        TaskStatus::Completed => counts.completed += 1,
                        TaskStatus::Failed => counts.failed += 1,
                        TaskStatus::Cancelled => counts.cancelled += 1,
                    }
                }
                counts
            })
            .await
    }

    /// Delete terminal tasks whose `completed_at` is older than the
    /// retention window. Non-terminal tasks are never auto-deleted.
    pub async fn cleanup(&self, retention_days: u32) -> Result<usize, StoreError> {
        let cutoff = Utc::now() - Duration::days(i64::from(retention_days));
        self.doc
            .with_lock(move |doc| {
                let before = doc.tasks.len();
                doc.tasks.retain(|_, t| {
                    !(t.status.is_terminal()
                        && t.completed_at.map_or(false, |at| at < cutoff))
                });
                before - doc.tasks.len()
            })
            .await
    }

    async fn transition(
        &self,
        id: Uuid,
        next: TaskStatus,
        apply: impl FnOnce(&mut Task) + Send,
    ) -> Result<Option<Task>, StoreError> {
        self.doc
            .with_lock(move |doc| {
                let task = doc.tasks.get_mut(&id)?;
                if !task.status.can_transition_to(next) {
                    return None;
                }
                task.status = next;
                task.updated_at = Utc::now();
                apply(task);
                Some(task.clone())
            })
            .await
    }
}
