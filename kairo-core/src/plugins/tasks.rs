use chrono::{DateTime, Utc};
use futures::FutureExt;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{KairoError, KairoResult};

use super::guard::panic_message;
use super::traits::AsynchronousPlugin;
use super::types::{ExecutionContext, ExecutionResult};

struct TaskRecord {
    plugin_id: String,
    plugin: Arc<dyn AsynchronousPlugin>,
    submitted_at: DateTime<Utc>,
    started: Instant,
    token: CancellationToken,
    handle: JoinHandle<()>,
    done: watch::Receiver<Option<ExecutionResult>>,
    claimed: Arc<AtomicBool>,
}

impl TaskRecord {
    fn abort(&self) {
        self.token.cancel();
        self.handle.abort();
    }

    fn is_finished(&self) -> bool {
        self.done.borrow().is_some() || self.handle.is_finished()
    }
}

/// Releases a claim on a task result if the waiter goes away before the
/// result is handed out.
struct Claim {
    flag: Arc<AtomicBool>,
    armed: bool,
}

impl Claim {
    fn take(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self {
                flag: flag.clone(),
                armed: true,
            })
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        if self.armed {
            self.flag.store(false, Ordering::SeqCst);
        }
    }
}

/// Snapshot of a tracked task for listing.
#[derive(Debug, Clone)]
pub struct TaskSummary {
    pub task_id: Uuid,
    pub plugin_id: String,
    pub submitted_at: DateTime<Utc>,
    pub finished: bool,
}

/// Owns every asynchronous plugin task. Results are handed out once, either
/// to `get_result` or consumed by a granted cancellation. A record stays in
/// the table until its result is in hand, so a task somebody is waiting on
/// can still be cancelled or purged.
pub struct AsyncTaskManager {
    tasks: Mutex<HashMap<Uuid, TaskRecord>>,
}

impl Default for AsyncTaskManager {
    fn default() -> Self {
        Self::new()
    }
}

impl AsyncTaskManager {
    pub fn new() -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
        }
    }

    pub async fn start(
        &self,
        plugin_id: &str,
        plugin: Arc<dyn AsynchronousPlugin>,
        ctx: ExecutionContext,
    ) -> Uuid {
        let task_id = Uuid::new_v4();
        let token = CancellationToken::new();
        let (tx, done) = watch::channel(None);

        let runner = plugin.clone();
        let child = token.child_token();
        let handle = tokio::spawn(async move {
            let started = Instant::now();
            let outcome = AssertUnwindSafe(runner.execute_async(ctx, child))
                .catch_unwind()
                .await;
            let elapsed = started.elapsed().as_millis() as u64;

            let result = match outcome {
                Ok(Ok(output)) => ExecutionResult::ok(Some(output), elapsed),
                Ok(Err(e)) => ExecutionResult::failed(e.to_string(), elapsed)
                    .with_metadata("errorCode", json!(e.error_code())),
                Err(payload) => {
                    let err = KairoError::TaskPanicked {
                        task_id,
                        message: panic_message(payload.as_ref()),
                    };
                    err.log();
                    ExecutionResult::failed(err.to_string(), elapsed)
                        .with_metadata("errorCode", json!(err.error_code()))
                }
            };
            let _ = tx.send(Some(result));
        });

        let record = TaskRecord {
            plugin_id: plugin_id.to_string(),
            plugin,
            submitted_at: Utc::now(),
            started: Instant::now(),
            token,
            handle,
            done,
            claimed: Arc::new(AtomicBool::new(false)),
        };

        self.tasks.lock().await.insert(task_id, record);
        debug!(task_id = %task_id, plugin_id = %plugin_id, "Started async task");
        task_id
    }

    /// Waits for the task and returns its result. A task can be collected
    /// once; later calls, and calls racing a waiter, fail with `TaskNotFound`.
    /// A task cancelled or purged while waited on yields `TaskCancelled`.
    pub async fn get_result(&self, task_id: Uuid) -> KairoResult<ExecutionResult> {
        let (claim, mut done, plugin_id) = {
            let tasks = self.tasks.lock().await;
            let record = tasks.get(&task_id).ok_or(KairoError::TaskNotFound(task_id))?;
            let claim = Claim::take(&record.claimed).ok_or(KairoError::TaskNotFound(task_id))?;
            (claim, record.done.clone(), record.plugin_id.clone())
        };

        let result = match done.wait_for(Option::is_some).await {
            Ok(result) => result.clone(),
            Err(_) => None,
        };
        let Some(result) = result else {
            return Err(KairoError::TaskCancelled(task_id));
        };

        if self.tasks.lock().await.remove(&task_id).is_none() {
            // Purged or swept between completion and collection.
            return Err(KairoError::TaskCancelled(task_id));
        }
        claim.disarm();

        Ok(result
            .with_metadata("taskId", json!(task_id.to_string()))
            .with_metadata("pluginId", json!(plugin_id)))
    }

    /// Cancels a task that is still running and whose plugin accepts the
    /// request. Finished or unknown tasks are left alone and yield `false`.
    pub async fn cancel(&self, task_id: Uuid) -> bool {
        let plugin = {
            let tasks = self.tasks.lock().await;
            match tasks.get(&task_id) {
                Some(record) if !record.is_finished() => record.plugin.clone(),
                _ => return false,
            }
        };

        if !plugin.accept_cancel(task_id).await {
            debug!(task_id = %task_id, "Plugin declined cancellation");
            return false;
        }

        let mut tasks = self.tasks.lock().await;
        match tasks.get(&task_id) {
            Some(record) if !record.is_finished() => {}
            _ => return false,
        }

        if let Some(record) = tasks.remove(&task_id) {
            record.abort();
            info!(task_id = %task_id, plugin_id = %record.plugin_id, "Cancelled async task");
            true
        } else {
            false
        }
    }

    /// Drops every record owned by `plugin_id`, aborting the ones still running.
    pub async fn purge_plugin(&self, plugin_id: &str) -> usize {
        let mut tasks = self.tasks.lock().await;
        let ids: Vec<Uuid> = tasks
            .iter()
            .filter(|(_, record)| record.plugin_id == plugin_id)
            .map(|(id, _)| *id)
            .collect();

        for id in &ids {
            if let Some(record) = tasks.remove(id) {
                record.abort();
            }
        }

        if !ids.is_empty() {
            debug!(plugin_id = %plugin_id, count = ids.len(), "Purged async tasks");
        }
        ids.len()
    }

    /// Removes records older than `retention`, finished or not.
    pub async fn sweep_expired(&self, retention: Duration) -> usize {
        let mut tasks = self.tasks.lock().await;
        let expired: Vec<Uuid> = tasks
            .iter()
            .filter(|(_, record)| record.started.elapsed() >= retention)
            .map(|(id, _)| *id)
            .collect();

        for id in &expired {
            if let Some(record) = tasks.remove(id) {
                if !record.is_finished() {
                    warn!(task_id = %id, plugin_id = %record.plugin_id, "Expired task still running, aborting");
                }
                record.abort();
            }
        }
        expired.len()
    }

    /// Tasks that have not finished yet.
    pub async fn pending_count(&self) -> usize {
        self.tasks
            .lock()
            .await
            .values()
            .filter(|record| !record.is_finished())
            .count()
    }

    /// Every tracked record, finished or not.
    pub async fn len(&self) -> usize {
        self.tasks.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tasks.lock().await.is_empty()
    }

    pub async fn contains(&self, task_id: Uuid) -> bool {
        self.tasks.lock().await.contains_key(&task_id)
    }

    pub async fn list(&self) -> Vec<TaskSummary> {
        let tasks = self.tasks.lock().await;
        let mut summaries: Vec<TaskSummary> = tasks
            .iter()
            .map(|(id, record)| TaskSummary {
                task_id: *id,
                plugin_id: record.plugin_id.clone(),
                submitted_at: record.submitted_at,
                finished: record.is_finished(),
            })
            .collect();
        summaries.sort_by_key(|s| s.submitted_at);
        summaries
    }

    /// Periodically sweeps expired records until `shutdown` fires.
    pub fn spawn_sweeper(
        self: Arc<Self>,
        every: Duration,
        retention: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = interval(every);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let swept = self.sweep_expired(retention).await;
                        if swept > 0 {
                            info!(count = swept, "Swept expired async tasks");
                        }
                    }
                    _ = shutdown.cancelled() => {
                        debug!("Async task sweeper shutting down");
                        break;
                    }
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::traits::Plugin;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct Sleeper {
        delay: Duration,
        accept: bool,
        finished: Arc<AtomicBool>,
    }

    impl Sleeper {
        fn new(delay: Duration, accept: bool) -> Self {
            Self {
                delay,
                accept,
                finished: Arc::new(AtomicBool::new(false)),
            }
        }
    }

    #[async_trait]
    impl Plugin for Sleeper {}

    #[async_trait]
    impl AsynchronousPlugin for Sleeper {
        async fn execute_async(
            &self,
            ctx: ExecutionContext,
            _cancel: CancellationToken,
        ) -> KairoResult<Value> {
            tokio::time::sleep(self.delay).await;
            self.finished.store(true, Ordering::SeqCst);
            if ctx.input == json!("fail") {
                return Err(KairoError::execution(ctx.plugin_id, "asked to fail"));
            }
            Ok(json!({"echo": ctx.input}))
        }

        async fn accept_cancel(&self, _task_id: Uuid) -> bool {
            self.accept
        }
    }

    fn ctx(input: Value) -> ExecutionContext {
        ExecutionContext::new("req-1", "sleeper", input)
    }

    #[tokio::test]
    async fn test_result_retrieved_once() {
        let manager = AsyncTaskManager::new();
        let plugin = Arc::new(Sleeper::new(Duration::from_millis(5), true));
        let id = manager.start("sleeper", plugin, ctx(json!(1))).await;

        let result = manager.get_result(id).await.unwrap();
        assert!(result.success);
        assert_eq!(result.output, Some(json!({"echo": 1})));

        assert!(matches!(
            manager.get_result(id).await,
            Err(KairoError::TaskNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_plugin_failure_is_reported_in_result() {
        let manager = AsyncTaskManager::new();
        let plugin = Arc::new(Sleeper::new(Duration::from_millis(1), true));
        let id = manager.start("sleeper", plugin, ctx(json!("fail"))).await;

        let result = manager.get_result(id).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.metadata["errorCode"], json!("E1008"));
    }

    #[tokio::test]
    async fn test_cancel_pending_task() {
        let manager = AsyncTaskManager::new();
        let plugin = Arc::new(Sleeper::new(Duration::from_millis(200), true));
        let finished = plugin.finished.clone();
        let id = manager.start("sleeper", plugin, ctx(json!(1))).await;

        assert!(manager.cancel(id).await);
        assert!(!manager.cancel(id).await);
        assert!(manager.get_result(id).await.is_err());

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_cancel_declined() {
        let manager = AsyncTaskManager::new();
        let plugin = Arc::new(Sleeper::new(Duration::from_millis(20), false));
        let id = manager.start("sleeper", plugin, ctx(json!(1))).await;

        assert!(!manager.cancel(id).await);
        assert!(manager.get_result(id).await.unwrap().success);
    }

    #[tokio::test]
    async fn test_cancel_finished_task_returns_false() {
        let manager = AsyncTaskManager::new();
        let plugin = Arc::new(Sleeper::new(Duration::from_millis(1), true));
        let id = manager.start("sleeper", plugin, ctx(json!(1))).await;

        while manager.pending_count().await > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        assert!(!manager.cancel(id).await);
        assert!(manager.get_result(id).await.unwrap().success);
    }

    #[tokio::test]
    async fn test_waited_on_task_stays_cancellable() {
        let manager = Arc::new(AsyncTaskManager::new());
        let plugin = Arc::new(Sleeper::new(Duration::from_millis(500), true));
        let finished = plugin.finished.clone();
        let id = manager.start("sleeper", plugin, ctx(json!(1))).await;

        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.get_result(id).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(manager.pending_count().await, 1);
        assert!(manager.contains(id).await);
        assert!(matches!(
            manager.get_result(id).await,
            Err(KairoError::TaskNotFound(_))
        ));

        assert!(manager.cancel(id).await);
        let outcome = waiter.await.unwrap();
        assert!(matches!(outcome, Err(KairoError::TaskCancelled(t)) if t == id));
        assert_eq!(manager.pending_count().await, 0);

        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(!finished.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_purge_reaches_waited_on_task() {
        let manager = Arc::new(AsyncTaskManager::new());
        let plugin = Arc::new(Sleeper::new(Duration::from_secs(5), true));
        let id = manager.start("slow", plugin, ctx(json!(1))).await;

        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.get_result(id).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(manager.purge_plugin("slow").await, 1);
        assert!(matches!(
            waiter.await.unwrap(),
            Err(KairoError::TaskCancelled(_))
        ));
    }

    #[tokio::test]
    async fn test_dropped_waiter_leaves_result_collectable() {
        let manager = AsyncTaskManager::new();
        let plugin = Arc::new(Sleeper::new(Duration::from_millis(50), true));
        let id = manager.start("sleeper", plugin, ctx(json!(7))).await;

        let gave_up =
            tokio::time::timeout(Duration::from_millis(5), manager.get_result(id)).await;
        assert!(gave_up.is_err());
        assert!(manager.contains(id).await);

        let result = manager.get_result(id).await.unwrap();
        assert_eq!(result.output, Some(json!({"echo": 7})));
        assert!(!manager.contains(id).await);
    }

    struct Exploder;

    #[async_trait]
    impl Plugin for Exploder {}

    #[async_trait]
    impl AsynchronousPlugin for Exploder {
        async fn execute_async(
            &self,
            _ctx: ExecutionContext,
            _cancel: CancellationToken,
        ) -> KairoResult<Value> {
            panic!("index out of range")
        }
    }

    #[tokio::test]
    async fn test_panicking_task_reports_failure() {
        let manager = AsyncTaskManager::new();
        let id = manager.start("exploder", Arc::new(Exploder), ctx(json!(1))).await;

        let result = manager.get_result(id).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.metadata["errorCode"], json!("E2003"));
        assert!(result.error.unwrap().contains("index out of range"));
    }

    #[tokio::test]
    async fn test_purge_plugin() {
        let manager = AsyncTaskManager::new();
        let slow = Arc::new(Sleeper::new(Duration::from_secs(5), true));
        let a = manager.start("slow", slow.clone(), ctx(json!(1))).await;
        let b = manager.start("slow", slow, ctx(json!(2))).await;
        let other = manager
            .start("other", Arc::new(Sleeper::new(Duration::from_millis(1), true)), ctx(json!(3)))
            .await;

        assert_eq!(manager.purge_plugin("slow").await, 2);
        assert!(!manager.contains(a).await);
        assert!(!manager.contains(b).await);
        assert!(manager.contains(other).await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_expired() {
        let manager = AsyncTaskManager::new();
        let plugin = Arc::new(Sleeper::new(Duration::from_secs(3600), true));
        manager.start("sleeper", plugin, ctx(json!(1))).await;

        assert_eq!(manager.sweep_expired(Duration::from_secs(300)).await, 0);
        tokio::time::advance(Duration::from_secs(301)).await;
        assert_eq!(manager.sweep_expired(Duration::from_secs(300)).await, 1);
        assert!(manager.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_loop_stops_on_shutdown() {
        let manager = Arc::new(AsyncTaskManager::new());
        let plugin = Arc::new(Sleeper::new(Duration::from_secs(3600), true));
        manager.start("sleeper", plugin, ctx(json!(1))).await;

        let shutdown = CancellationToken::new();
        let handle = manager.clone().spawn_sweeper(
            Duration::from_secs(10),
            Duration::from_secs(30),
            shutdown.clone(),
        );

        tokio::time::sleep(Duration::from_secs(45)).await;
        assert!(manager.is_empty().await);

        shutdown.cancel();
        handle.await.unwrap();
    }
}
