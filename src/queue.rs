//! Priority task queue with bounded concurrency, recovery, timeouts, and
//! cancellation.
//!
//! The scheduler loop is the single reservation point: it inserts a task id
//! into the active map synchronously, before `mark_processing` and before
//! any spawn, so the concurrency cap holds without a store-level
//! compare-and-swap. The loop is kicked on every enqueue and backed by a
//! one-second safety tick.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::{broadcast, Notify};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::executor::{ExecuteOptions, Executor};
use crate::store::tasks::{NewTask, Task, TaskCounts, TaskStore};
use crate::store::StoreError;
use crate::webhook::WebhookNotifier;

/// Interval of the safety tick that picks up work the enqueue kick missed.
const TICK_INTERVAL: Duration = Duration::from_secs(1);
/// How long `stop` waits for active tasks to drain.
const DRAIN_DEADLINE: Duration = Duration::from_secs(10);
/// Polling interval while draining.
const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Error text persisted when a task outlives its timeout.
const TIMEOUT_ERROR: &str = "Task execution timeout";

/// Lifecycle events emitted by the queue.
#[derive(Debug, Clone)]
pub enum QueueEvent {
    TaskCompleted { task_id: Uuid, result: String },
    TaskFailed { task_id: Uuid, error: String },
    TaskCancelled { task_id: Uuid },
}

/// Queue metrics returned by [`TaskQueue::status`].
#[derive(Debug, Clone, serde::Serialize)]
pub struct QueueStatus {
    pub running: bool,
    pub concurrency: usize,
    pub active_tasks: usize,
    #[serde(flatten)]
    pub counts: TaskCounts,
}

struct ActiveTask {
    started_at: Instant,
    cancel: CancellationToken,
}

struct QueueInner {
    tasks: Arc<TaskStore>,
    executor: Arc<dyn Executor>,
    webhooks: Arc<WebhookNotifier>,
    running: AtomicBool,
    concurrency: AtomicUsize,
    default_timeout_ms: AtomicU64,
    active: Mutex<HashMap<Uuid, ActiveTask>>,
    wake: Notify,
    events: broadcast::Sender<QueueEvent>,
}

/// Priority-ordered, bounded-concurrency scheduler over the task store.
#[derive(Clone)]
pub struct TaskQueue {
    inner: Arc<QueueInner>,
}

impl TaskQueue {
    pub fn new(
        tasks: Arc<TaskStore>,
        executor: Arc<dyn Executor>,
        webhooks: Arc<WebhookNotifier>,
        concurrency: usize,
        default_timeout_ms: u64,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(QueueInner {
                tasks,
                executor,
                webhooks,
                running: AtomicBool::new(false),
                concurrency: AtomicUsize::new(concurrency.max(1)),
                default_timeout_ms: AtomicU64::new(default_timeout_ms),
                active: Mutex::new(HashMap::new()),
                wake: Notify::new(),
                events,
            }),
        }
    }

    /// Recover interrupted work and start the scheduler loop.
    pub async fn start(&self) -> Result<(), StoreError> {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // Any task still marked processing belongs to a previous run of
        // this process; make it eligible for dispatch again.
        let recovered = self.inner.tasks.reset_processing_to_pending().await?;
        if !recovered.is_empty() {
            tracing::info!(
                "Recovered {} task(s) left in processing by a previous run",
                recovered.len()
            );
        }

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            while inner.running.load(Ordering::SeqCst) {
                if let Err(err) = Self::tick(&inner).await {
                    tracing::warn!("Scheduler tick failed: {}", err);
                }
                tokio::select! {
                    _ = inner.wake.notified() => {}
                    _ = tokio::time::sleep(TICK_INTERVAL) => {}
                }
            }
        });

        tracing::info!(
            "Task queue started (concurrency {})",
            self.inner.concurrency.load(Ordering::SeqCst)
        );
        Ok(())
    }

    /// Persist a new task as pending and kick the scheduler.
    pub async fn add_task(&self, new: NewTask) -> Result<Task, StoreError> {
        let task = self.inner.tasks.create(new).await?;
        self.inner.wake.notify_one();
        Ok(task)
    }

    /// Cancel a pending or processing task. Returns the cancelled record,
    /// or `None` when the task cannot be cancelled.
    pub async fn cancel(&self, id: Uuid) -> Result<Option<Task>, StoreError> {
        let Some(task) = self.inner.tasks.cancel(id).await? else {
            return Ok(None);
        };

        // Abort in-flight work and free the slot immediately. A late
        // executor completion is dropped because the terminal status is
        // final in the store.
        if let Some(active) = self.inner.active.lock().unwrap().remove(&id) {
            active.cancel.cancel();
        }

        let _ = self
            .inner
            .events
            .send(QueueEvent::TaskCancelled { task_id: id });
        self.inner.webhooks.task_cancelled(&task).await;
        self.inner.wake.notify_one();

        Ok(Some(task))
    }

    /// Stop taking new work and wait up to ten seconds for active tasks
    /// to drain.
    pub async fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        self.inner.wake.notify_one();

        let deadline = Instant::now() + DRAIN_DEADLINE;
        loop {
            let active = self.inner.active.lock().unwrap().len();
            if active == 0 {
                tracing::info!("Task queue stopped");
                return;
            }
            if Instant::now() >= deadline {
                tracing::warn!(
                    "Task queue stopped with {} task(s) still active after {}s drain window",
                    active,
                    DRAIN_DEADLINE.as_secs()
                );
                return;
            }
            tokio::time::sleep(DRAIN_POLL_INTERVAL).await;
        }
    }

    /// Queue metrics plus task store counts.
    pub async fn status(&self) -> Result<QueueStatus, StoreError> {
        let active_tasks = self.inner.active.lock().unwrap().len();
        Ok(QueueStatus {
            running: self.inner.running.load(Ordering::SeqCst),
            concurrency: self.inner.concurrency.load(Ordering::SeqCst),
            active_tasks,
            counts: self.inner.tasks.counts().await?,
        })
    }

    /// Subscribe to lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.inner.events.subscribe()
    }

    /// Live-update the concurrency cap (hot reload).
    pub fn set_concurrency(&self, concurrency: usize) {
        self.inner
            .concurrency
            .store(concurrency.max(1), Ordering::SeqCst);
        self.inner.wake.notify_one();
    }

    /// Live-update the per-task timeout (hot reload).
    pub fn set_default_timeout(&self, timeout_ms: u64) {
        self.inner
            .default_timeout_ms
            .store(timeout_ms, Ordering::SeqCst);
    }

    pub fn concurrency(&self) -> usize {
        self.inner.concurrency.load(Ordering::SeqCst)
    }

    pub fn default_timeout_ms(&self) -> u64 {
        self.inner.default_timeout_ms.load(Ordering::SeqCst)
    }

    /// One scheduler pass: reserve slots and dispatch pending tasks until
    /// the cap is reached or the store runs dry.
    async fn tick(inner: &Arc<QueueInner>) -> Result<(), StoreError> {
        loop {
            if !inner.running.load(Ordering::SeqCst) {
                return Ok(());
            }
            {
                let active = inner.active.lock().unwrap();
                if active.len() >= inner.concurrency.load(Ordering::SeqCst) {
                    return Ok(());
                }
            }

            let Some(task) = inner.tasks.get_next_pending().await? else {
                return Ok(());
            };

            // Reserve the slot before marking or spawning. The scheduler
            // loop is the only writer, so the id cannot be taken twice.
            let cancel = CancellationToken::new();
            {
                let mut active = inner.active.lock().unwrap();
                if active.len() >= inner.concurrency.load(Ordering::SeqCst) {
                    return Ok(());
                }
                active.insert(
                    task.id,
                    ActiveTask {
                        started_at: Instant::now(),
                        cancel: cancel.clone(),
                    },
                );
            }

            match inner.tasks.mark_processing(task.id).await {
                Ok(Some(task)) => {
                    let inner = Arc::clone(inner);
                    tokio::spawn(async move {
                        Self::run_task(inner, task, cancel).await;
                    });
                }
                Ok(None) => {
                    // Cancelled between fetch and mark; release the slot.
                    inner.active.lock().unwrap().remove(&task.id);
                }
                Err(err) => {
                    inner.active.lock().unwrap().remove(&task.id);
                    return Err(err);
                }
            }
        }
    }

    /// Execute one task: race the executor against the timeout and the
    /// cancellation handle, persist the terminal state, emit the event,
    /// attempt the webhook, then release the slot.
    async fn run_task(inner: Arc<QueueInner>, task: Task, cancel: CancellationToken) {
        let timeout = Duration::from_millis(inner.default_timeout_ms.load(Ordering::SeqCst));
        let opts = ExecuteOptions {
            prompt: task.prompt.clone(),
            project_path: task.project_path.clone(),
            model: task.model.clone(),
            session_id: task.metadata.session_id,
            system_prompt: task.metadata.system_prompt.clone(),
            max_budget_usd: task.metadata.max_budget_usd,
            allowed_tools: task.metadata.allowed_tools.clone(),
            disallowed_tools: task.metadata.disallowed_tools.clone(),
            agent: task.metadata.agent.clone(),
            mcp_config: task.metadata.mcp_config.clone(),
        };

        enum Finish {
            Done(crate::executor::ExecutionOutcome),
            TimedOut,
            Cancelled,
        }

        let finish = tokio::select! {
            outcome = inner.executor.execute(opts) => Finish::Done(outcome),
            _ = tokio::time::sleep(timeout) => Finish::TimedOut,
            _ = cancel.cancelled() => Finish::Cancelled,
        };

        match finish {
            Finish::Done(outcome) if outcome.success => {
                let result = outcome.result.unwrap_or_default();
                match inner
                    .tasks
                    .mark_completed(task.id, &result, outcome.cost_usd)
                    .await
                {
                    Ok(Some(task)) => {
                        let _ = inner.events.send(QueueEvent::TaskCompleted {
                            task_id: task.id,
                            result,
                        });
                        inner.webhooks.task_completed(&task).await;
                    }
                    Ok(None) => {
                        tracing::debug!(
                            "Dropping result of task {}: already in a terminal state",
                            task.id
                        );
                    }
                    Err(err) => {
                        // Leave the task processing; a later tick cannot
                        // retry it, but the state is at least truthful.
                        tracing::error!("Failed to persist completion of {}: {}", task.id, err);
                    }
                }
            }
            Finish::Done(outcome) => {
                let error = outcome
                    .error
                    .unwrap_or_else(|| "execution failed".to_string());
                match inner.tasks.mark_failed(task.id, &error).await {
                    Ok(Some(task)) => {
                        let _ = inner.events.send(QueueEvent::TaskFailed {
                            task_id: task.id,
                            error,
                        });
                        inner.webhooks.task_failed(&task).await;
                    }
                    Ok(None) => {}
                    Err(err) => {
                        tracing::error!("Failed to persist failure of {}: {}", task.id, err);
                    }
                }
            }
            Finish::TimedOut => {
                tracing::warn!(
                    "Task {} exceeded its {}ms timeout",
                    task.id,
                    timeout.as_millis()
                );
                match inner.tasks.mark_failed(task.id, TIMEOUT_ERROR).await {
                    Ok(Some(task)) => {
                        let _ = inner.events.send(QueueEvent::TaskFailed {
                            task_id: task.id,
                            error: TIMEOUT_ERROR.to_string(),
                        });
                        inner.webhooks.task_timeout(&task).await;
                    }
                    Ok(None) => {}
                    Err(err) => {
                        tracing::error!("Failed to persist timeout of {}: {}", task.id, err);
                    }
                }
            }
            Finish::Cancelled => {
                // The cancel path already persisted the terminal state,
                // emitted the event, and released the slot.
                return;
            }
        }

        inner.active.lock().unwrap().remove(&task.id);
        inner.wake.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use async_trait::async_trait;
    use tempfile::tempdir;

    use super::*;
    use crate::config::WebhookConfig;
    use crate::executor::ExecutionOutcome;
    use crate::store::tasks::{TaskMetadata, TaskStatus};

    /// Executor stub with a configurable delay, tracking peak concurrency
    /// and the order prompts were dispatched in.
    struct StubExecutor {
        delay: Duration,
        in_flight: AtomicUsize,
        peak: AtomicUsize,
        order: Mutex<Vec<String>>,
        fail: bool,
    }

    impl StubExecutor {
        fn new(delay: Duration) -> Self {
            Self {
                delay,
                in_flight: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                order: Mutex::new(Vec::new()),
                fail: false,
            }
        }

        fn failing(delay: Duration) -> Self {
            Self {
                fail: true,
                ..Self::new(delay)
            }
        }
    }

    #[async_trait]
    impl Executor for StubExecutor {
        async fn execute(&self, opts: ExecuteOptions) -> ExecutionOutcome {
            let current = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(current, Ordering::SeqCst);
            self.order.lock().unwrap().push(opts.prompt.clone());

            tokio::time::sleep(self.delay).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);

            if self.fail {
                ExecutionOutcome {
                    success: false,
                    error: Some("stub failure".to_string()),
                    ..Default::default()
                }
            } else {
                ExecutionOutcome {
                    success: true,
                    result: Some(format!("echo: {}", opts.prompt)),
                    cost_usd: 0.01,
                    ..Default::default()
                }
            }
        }
    }

    fn notifier() -> Arc<WebhookNotifier> {
        // No default URL: deliveries short-circuit with no_url.
        Arc::new(WebhookNotifier::new(WebhookConfig {
            enabled: true,
            default_url: None,
            timeout: 1_000,
            retries: 1,
        }))
    }

    fn new_task(prompt: &str, priority: u8) -> NewTask {
        NewTask {
            prompt: prompt.to_string(),
            project_path: "/tmp".to_string(),
            model: "claude-sonnet-4".to_string(),
            priority: Some(priority),
            metadata: TaskMetadata::default(),
        }
    }

    async fn wait_for_status(
        store: &TaskStore,
        id: Uuid,
        status: TaskStatus,
        deadline: Duration,
    ) -> Task {
        let end = Instant::now() + deadline;
        loop {
            let task = store.get(id).await.unwrap().unwrap();
            if task.status == status {
                return task;
            }
            assert!(
                Instant::now() < end,
                "task {id} stuck in {:?} waiting for {status:?}",
                task.status
            );
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    #[tokio::test]
    async fn test_concurrency_cap_is_never_exceeded() {
        let dir = tempdir().unwrap();
        let store = Arc::new(TaskStore::open(dir.path()).unwrap());
        let executor = Arc::new(StubExecutor::new(Duration::from_millis(100)));
        let queue = TaskQueue::new(
            Arc::clone(&store),
            Arc::clone(&executor) as Arc<dyn Executor>,
            notifier(),
            2,
            60_000,
        );
        queue.start().await.unwrap();

        let mut ids = Vec::new();
        for i in 0..6 {
            let task = queue.add_task(new_task(&format!("t{i}"), 5)).await.unwrap();
            ids.push(task.id);
        }
        for id in ids {
            wait_for_status(&store, id, TaskStatus::Completed, Duration::from_secs(5)).await;
        }

        assert!(executor.peak.load(Ordering::SeqCst) <= 2);
        queue.stop().await;
    }

    #[tokio::test]
    async fn test_priority_then_fifo_dispatch_order() {
        let dir = tempdir().unwrap();
        let store = Arc::new(TaskStore::open(dir.path()).unwrap());
        let executor = Arc::new(StubExecutor::new(Duration::from_millis(10)));
        let queue = TaskQueue::new(
            Arc::clone(&store),
            Arc::clone(&executor) as Arc<dyn Executor>,
            notifier(),
            1,
            60_000,
        );

        // Enqueue before starting so the whole batch is visible at the
        // first dispatch.
        let t1 = queue.add_task(new_task("t1", 5)).await.unwrap();
        let t2 = queue.add_task(new_task("t2", 9)).await.unwrap();
        let t3 = queue.add_task(new_task("t3", 5)).await.unwrap();
        queue.start().await.unwrap();

        for id in [t1.id, t2.id, t3.id] {
            wait_for_status(&store, id, TaskStatus::Completed, Duration::from_secs(5)).await;
        }

        let order = executor.order.lock().unwrap().clone();
        assert_eq!(order, vec!["t2", "t1", "t3"]);
        queue.stop().await;
    }

    #[tokio::test]
    async fn test_recovery_resets_processing_tasks() {
        let dir = tempdir().unwrap();
        let store = Arc::new(TaskStore::open(dir.path()).unwrap());

        // Simulate a crash: a task persisted as processing with no worker.
        let task = store.create(new_task("interrupted", 5)).await.unwrap();
        store.mark_processing(task.id).await.unwrap();

        let executor = Arc::new(StubExecutor::new(Duration::from_millis(10)));
        let queue = TaskQueue::new(
            Arc::clone(&store),
            executor as Arc<dyn Executor>,
            notifier(),
            1,
            60_000,
        );
        queue.start().await.unwrap();

        wait_for_status(&store, task.id, TaskStatus::Completed, Duration::from_secs(5)).await;
        queue.stop().await;
    }

    #[tokio::test]
    async fn test_timeout_marks_task_failed() {
        let dir = tempdir().unwrap();
        let store = Arc::new(TaskStore::open(dir.path()).unwrap());
        let executor = Arc::new(StubExecutor::new(Duration::from_millis(500)));
        let queue = TaskQueue::new(
            Arc::clone(&store),
            executor as Arc<dyn Executor>,
            notifier(),
            1,
            50,
        );
        queue.start().await.unwrap();

        let task = queue.add_task(new_task("slow", 5)).await.unwrap();
        let failed =
            wait_for_status(&store, task.id, TaskStatus::Failed, Duration::from_secs(5)).await;

        assert!(failed.error.unwrap().contains("timeout"));
        assert_eq!(failed.cost_usd, 0.0);
        queue.stop().await;
    }

    #[tokio::test]
    async fn test_cancel_pending_task_never_runs() {
        let dir = tempdir().unwrap();
        let store = Arc::new(TaskStore::open(dir.path()).unwrap());
        let executor = Arc::new(StubExecutor::new(Duration::from_millis(200)));
        let queue = TaskQueue::new(
            Arc::clone(&store),
            Arc::clone(&executor) as Arc<dyn Executor>,
            notifier(),
            1,
            60_000,
        );
        queue.start().await.unwrap();

        // Occupy the single slot, then cancel a queued task before it
        // can be dispatched.
        let blocker = queue.add_task(new_task("blocker", 9)).await.unwrap();
        let victim = queue.add_task(new_task("victim", 1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let cancelled = queue.cancel(victim.id).await.unwrap().unwrap();
        assert_eq!(cancelled.status, TaskStatus::Cancelled);
        assert!(cancelled.started_at.is_none());

        wait_for_status(&store, blocker.id, TaskStatus::Completed, Duration::from_secs(5)).await;
        let order = executor.order.lock().unwrap().clone();
        assert_eq!(order, vec!["blocker"]);
        queue.stop().await;
    }

    #[tokio::test]
    async fn test_cancel_during_execution_discards_late_result() {
        let dir = tempdir().unwrap();
        let store = Arc::new(TaskStore::open(dir.path()).unwrap());
        let executor = Arc::new(StubExecutor::new(Duration::from_millis(300)));
        let queue = TaskQueue::new(
            Arc::clone(&store),
            executor as Arc<dyn Executor>,
            notifier(),
            1,
            60_000,
        );
        queue.start().await.unwrap();

        let task = queue.add_task(new_task("doomed", 5)).await.unwrap();
        wait_for_status(&store, task.id, TaskStatus::Processing, Duration::from_secs(5)).await;

        let mut events = queue.subscribe();
        queue.cancel(task.id).await.unwrap().unwrap();

        // Give the (aborted) execution window time to elapse; the record
        // must stay cancelled with no result attached.
        tokio::time::sleep(Duration::from_millis(400)).await;
        let task = store.get(task.id).await.unwrap().unwrap();
        assert_eq!(task.status, TaskStatus::Cancelled);
        assert!(task.result.is_none());

        match events.try_recv() {
            Ok(QueueEvent::TaskCancelled { task_id }) => assert_eq!(task_id, task.id),
            other => panic!("expected TaskCancelled event, got {other:?}"),
        }
        queue.stop().await;
    }

    #[tokio::test]
    async fn test_failed_execution_persists_error_and_event() {
        let dir = tempdir().unwrap();
        let store = Arc::new(TaskStore::open(dir.path()).unwrap());
        let executor = Arc::new(StubExecutor::failing(Duration::from_millis(10)));
        let queue = TaskQueue::new(
            Arc::clone(&store),
            executor as Arc<dyn Executor>,
            notifier(),
            1,
            60_000,
        );
        let mut events = queue.subscribe();
        queue.start().await.unwrap();

        let task = queue.add_task(new_task("bad", 5)).await.unwrap();
        let failed =
            wait_for_status(&store, task.id, TaskStatus::Failed, Duration::from_secs(5)).await;
        assert_eq!(failed.error.as_deref(), Some("stub failure"));

        match events.recv().await {
            Ok(QueueEvent::TaskFailed { task_id, error }) => {
                assert_eq!(task_id, task.id);
                assert_eq!(error, "stub failure");
            }
            other => panic!("expected TaskFailed event, got {other:?}"),
        }
        queue.stop().await;
    }

    #[tokio::test]
    async fn test_stop_drains_active_work() {
        let dir = tempdir().unwrap();
        let store = Arc::new(TaskStore::open(dir.path()).unwrap());
        let executor = Arc::new(StubExecutor::new(Duration::from_millis(200)));
        let queue = TaskQueue::new(
            Arc::clone(&store),
            executor as Arc<dyn Executor>,
            notifier(),
            2,
            60_000,
        );
        queue.start().await.unwrap();

        let a = queue.add_task(new_task("a", 5)).await.unwrap();
        let b = queue.add_task(new_task("b", 5)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        queue.stop().await;

        for id in [a.id, b.id] {
            let task = store.get(id).await.unwrap().unwrap();
            assert_eq!(task.status, TaskStatus::Completed);
        }
        let status = queue.status().await.unwrap();
        assert!(!status.running);
        assert_eq!(status.active_tasks, 0);
    }

    #[tokio::test]
    async fn test_set_concurrency_applies_live() {
        let dir = tempdir().unwrap();
        let store = Arc::new(TaskStore::open(dir.path()).unwrap());
        let executor = Arc::new(StubExecutor::new(Duration::from_millis(50)));
        let queue = TaskQueue::new(
            Arc::clone(&store),
            Arc::clone(&executor) as Arc<dyn Executor>,
            notifier(),
            1,
            60_000,
        );
        queue.start().await.unwrap();
        assert_eq!(queue.concurrency(), 1);

        queue.set_concurrency(4);
        assert_eq!(queue.concurrency(), 4);

        let mut ids = Vec::new();
        for i in 0..4 {
            ids.push(queue.add_task(new_task(&format!("t{i}"), 5)).await.unwrap().id);
        }
        for id in ids {
            wait_for_status(&store, id, TaskStatus::Completed, Duration::from_secs(5)).await;
        }
        assert!(executor.peak.load(Ordering::SeqCst) > 1);
        queue.stop().await;
    }
}
