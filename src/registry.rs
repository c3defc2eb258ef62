//! Process-wide task store.
//!
//! One [`TaskRegistry`] is built at process start and handed by `Arc` to the
//! orchestrator and to every request handler, so any caller can look up any
//! task. The registry never changes a task's state on its own: all mutation
//! goes through [`TaskRegistry::update`], which runs the caller's closure
//! under the write lock so concurrent readers only ever see whole updates.
//!
//! Each entry also carries the task's [`CancellationToken`]. Removing a task
//! cancels it, so an orphaned run stops at its next suspension point.
//! Retention only evicts tasks that have already completed or failed.

use crate::broadcast::ProgressBroadcaster;
use crate::error::Pdf2HtmlError;
use crate::task::{ConversionTask, TaskId, TaskSnapshot};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

struct Entry {
    task: ConversionTask,
    cancel: CancellationToken,
}

/// Lifecycle store of conversion tasks, keyed by [`TaskId`].
pub struct TaskRegistry {
    tasks: RwLock<HashMap<TaskId, Entry>>,
    broadcaster: Arc<ProgressBroadcaster>,
}

impl TaskRegistry {
    pub fn new(broadcaster: Arc<ProgressBroadcaster>) -> Self {
        Self {
            tasks: RwLock::new(HashMap::new()),
            broadcaster,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<TaskId, Entry>> {
        self.tasks.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<TaskId, Entry>> {
        self.tasks.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn broadcaster(&self) -> &Arc<ProgressBroadcaster> {
        &self.broadcaster
    }

    /// Register a new task in `Created` and open its event channel.
    pub fn create(&self, source: impl Into<String>) -> TaskId {
        let task = ConversionTask::new(source);
        let id = task.id;
        self.broadcaster.open(id);
        self.write().insert(
            id,
            Entry {
                task,
                cancel: CancellationToken::new(),
            },
        );
        debug!(task_id = %id, "task registered");
        id
    }

    /// Clone of the task's current state.
    pub fn get(&self, id: TaskId) -> Option<ConversionTask> {
        self.read().get(&id).map(|e| e.task.clone())
    }

    pub fn snapshot(&self, id: TaskId) -> Option<TaskSnapshot> {
        self.read().get(&id).map(|e| e.task.snapshot())
    }

    /// Apply `mutator` to the task atomically.
    pub fn update<R>(
        &self,
        id: TaskId,
        mutator: impl FnOnce(&mut ConversionTask) -> R,
    ) -> Result<R, Pdf2HtmlError> {
        let mut tasks = self.write();
        let entry = tasks.get_mut(&id).ok_or(Pdf2HtmlError::TaskNotFound(id))?;
        Ok(mutator(&mut entry.task))
    }

    /// Drop every trace of a task: registry entry, subscribers and history.
    /// A task still running is cancelled.
    pub fn remove(&self, id: TaskId) -> bool {
        let removed = self.write().remove(&id);
        self.broadcaster.drop_task(id);
        match removed {
            Some(entry) => {
                entry.cancel.cancel();
                debug!(task_id = %id, "task removed");
                true
            }
            None => false,
        }
    }

    /// Tasks created within `max_age`, newest first.
    pub fn list_active(&self, max_age: Duration) -> Vec<TaskSnapshot> {
        let cutoff = cutoff(max_age);
        let mut out: Vec<TaskSnapshot> = self
            .read()
            .values()
            .filter(|e| e.task.created_at > cutoff)
            .map(|e| e.task.snapshot())
            .collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        out
    }

    /// Remove tasks that completed or failed `max_age` or longer ago.
    /// Running tasks stay regardless of age. Returns how many went.
    pub fn evict_expired(&self, max_age: Duration) -> usize {
        let cutoff = cutoff(max_age);
        let expired: Vec<TaskId> = self
            .read()
            .values()
            .filter(|e| e.task.status().is_terminal())
            .filter(|e| e.task.completed_at().is_some_and(|at| at <= cutoff))
            .map(|e| e.task.id)
            .collect();
        for id in &expired {
            self.remove(*id);
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "evicted expired tasks");
        }
        expired.len()
    }

    /// Fire the task's cancellation token. `false` if the task is unknown.
    pub fn cancel(&self, id: TaskId) -> bool {
        match self.read().get(&id) {
            Some(entry) => {
                entry.cancel.cancel();
                info!(task_id = %id, "cancellation requested");
                true
            }
            None => false,
        }
    }

    pub fn cancellation_token(&self, id: TaskId) -> Option<CancellationToken> {
        self.read().get(&id).map(|e| e.cancel.clone())
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Run [`TaskRegistry::evict_expired`] every `every` until `shutdown` fires.
    pub fn spawn_retention_sweeper(
        self: &Arc<Self>,
        max_age: Duration,
        every: Duration,
        shutdown: CancellationToken,
    ) -> JoinHandle<()> {
        let registry = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        registry.evict_expired(max_age);
                    }
                }
            }
            debug!("retention sweeper stopped");
        })
    }
}

/// Timestamp at or before which an event is older than `max_age`.
fn cutoff(max_age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(max_age)
        .ok()
        .and_then(|age| Utc::now().checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::ProgressEvent;
    use crate::task::TaskStatus;

    fn registry() -> TaskRegistry {
        TaskRegistry::new(Arc::new(ProgressBroadcaster::default()))
    }

    #[test]
    fn create_get_update() {
        let r = registry();
        let id = r.create("doc.pdf");
        assert_eq!(r.get(id).unwrap().status(), TaskStatus::Created);
        r.update(id, |t| t.advance(TaskStatus::Extracting))
            .unwrap()
            .unwrap();
        assert_eq!(r.snapshot(id).unwrap().status, TaskStatus::Extracting);
        assert_eq!(r.len(), 1);
    }

    #[test]
    fn update_unknown_task_errors() {
        let r = registry();
        let err = r.update(TaskId::new(), |_| ()).unwrap_err();
        assert!(matches!(err, Pdf2HtmlError::TaskNotFound(_)));
    }

    #[test]
    fn remove_clears_broadcaster_and_cancels() {
        let r = registry();
        let id = r.create("doc.pdf");
        let token = r.cancellation_token(id).unwrap();
        r.broadcaster().publish(ProgressEvent::message(id, "x"));
        assert_eq!(r.broadcaster().history(id).len(), 1);

        assert!(r.remove(id));
        assert!(token.is_cancelled());
        assert!(r.get(id).is_none());
        assert!(!r.broadcaster().is_open(id));
        assert!(!r.remove(id));
    }

    #[test]
    fn list_active_newest_first() {
        let r = registry();
        let a = r.create("a.pdf");
        std::thread::sleep(std::time::Duration::from_millis(5));
        let b = r.create("b.pdf");
        let listed: Vec<_> = r
            .list_active(Duration::from_secs(3600))
            .into_iter()
            .map(|s| s.task_id)
            .collect();
        assert_eq!(listed, [b, a]);
        assert!(r.list_active(Duration::ZERO).is_empty());
    }

    fn fail(r: &TaskRegistry, id: TaskId) {
        r.update(id, |t| {
            t.advance(TaskStatus::Extracting)?;
            t.fail("bad xref")
        })
        .unwrap()
        .unwrap();
    }

    #[test]
    fn evict_expired_removes_old_finished_tasks() {
        let r = registry();
        let id = r.create("a.pdf");
        fail(&r, id);
        assert_eq!(r.evict_expired(Duration::from_secs(3600)), 0);
        assert_eq!(r.evict_expired(Duration::ZERO), 1);
        assert!(r.is_empty());
    }

    #[test]
    fn evict_expired_keeps_running_tasks() {
        let r = registry();
        let running = r.create("a.pdf");
        r.update(running, |t| t.advance(TaskStatus::Extracting))
            .unwrap()
            .unwrap();
        let idle = r.create("b.pdf");
        let token = r.cancellation_token(running).unwrap();

        assert_eq!(r.evict_expired(Duration::ZERO), 0);
        assert!(r.snapshot(running).is_some());
        assert!(r.snapshot(idle).is_some());
        assert!(!token.is_cancelled());

        fail(&r, running);
        assert_eq!(r.evict_expired(Duration::ZERO), 1);
        assert!(r.snapshot(running).is_none());
        assert!(token.is_cancelled());
    }

    #[test]
    fn cancel_fires_token() {
        let r = registry();
        let id = r.create("a.pdf");
        assert!(r.cancel(id));
        assert!(r.cancellation_token(id).unwrap().is_cancelled());
        assert!(!r.cancel(TaskId::new()));
    }

    #[tokio::test]
    async fn sweeper_stops_on_shutdown() {
        let r = Arc::new(registry());
        let done = r.create("a.pdf");
        fail(&r, done);
        let running = r.create("b.pdf");
        let shutdown = CancellationToken::new();
        let handle =
            r.spawn_retention_sweeper(Duration::ZERO, Duration::from_millis(10), shutdown.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();
        handle.await.unwrap();
        assert!(r.snapshot(done).is_none());
        assert!(r.snapshot(running).is_some());
        assert_eq!(r.len(), 1);
    }
}
