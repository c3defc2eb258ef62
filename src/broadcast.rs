//! Per-task fan-out of [`ProgressEvent`]s.
//!
//! Every task gets a channel entry when it is registered. An entry holds:
//!
//! * a set of subscribers, each an unbounded mpsc sender, so any number of
//!   observers (a WebSocket, an NDJSON stream, the CLI progress bar) can
//!   watch one task and a reconnecting client never evicts another;
//! * a rolling history of the last `capacity` events, replayed to every new
//!   subscriber so a late observer still sees how the task got here.
//!
//! ## Why a sync mutex?
//!
//! `publish` is called from the orchestrator between collaborator calls and
//! must never wait on an observer. The critical sections only push into
//! unbounded channels and a `VecDeque`, so a `std::sync::Mutex` held for
//! microseconds is cheaper than an async lock and keeps `publish` callable
//! from non-async code.
//!
//! Delivery is best-effort: a subscriber whose receiver is gone is pruned on
//! the next publish and the failure is only logged.

use crate::error::Pdf2HtmlError;
use crate::progress::ProgressEvent;
use crate::task::TaskId;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

/// Default number of events retained per task.
pub const DEFAULT_HISTORY_CAPACITY: usize = 50;

struct Subscriber {
    id: u64,
    sender: mpsc::UnboundedSender<ProgressEvent>,
}

#[derive(Default)]
struct TaskChannel {
    subscribers: Vec<Subscriber>,
    history: VecDeque<ProgressEvent>,
    last_timestamp: Option<DateTime<Utc>>,
    /// Set once a terminal event went out; later subscribers get the
    /// replay and an ended stream.
    finished: bool,
}

/// Multi-subscriber event fan-out with bounded per-task history.
pub struct ProgressBroadcaster {
    tasks: Mutex<HashMap<TaskId, TaskChannel>>,
    capacity: usize,
    next_subscriber: AtomicU64,
}

impl ProgressBroadcaster {
    pub fn new(capacity: usize) -> Self {
        Self {
            tasks: Mutex::new(HashMap::new()),
            capacity: capacity.max(1),
            next_subscriber: AtomicU64::new(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TaskId, TaskChannel>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start tracking a task. Idempotent.
    pub fn open(&self, task_id: TaskId) {
        self.lock().entry(task_id).or_default();
    }

    /// Record `event` in its task's history and deliver it to every live
    /// subscriber, in publish order.
    ///
    /// Publishing for a task that is not open (never registered, or already
    /// cleaned up) is a no-op. Timestamps are clamped so a task's stream
    /// never goes backwards even if the wall clock does.
    pub fn publish(&self, mut event: ProgressEvent) {
        let task_id = event.task_id();
        let mut tasks = self.lock();
        let Some(channel) = tasks.get_mut(&task_id) else {
            debug!(task_id = %task_id, kind = event.kind(), "publish for unknown task dropped");
            return;
        };

        if let Some(last) = channel.last_timestamp {
            if event.timestamp() < last {
                event.set_timestamp(last);
            }
        }
        channel.last_timestamp = Some(event.timestamp());

        channel.history.push_back(event.clone());
        while channel.history.len() > self.capacity {
            channel.history.pop_front();
        }

        channel.subscribers.retain(|sub| match sub.sender.send(event.clone()) {
            Ok(()) => true,
            Err(_) => {
                debug!(task_id = %task_id, subscriber = sub.id, "subscriber gone, pruning");
                false
            }
        });

        if event.is_terminal() {
            channel.finished = true;
            // Dropping the senders ends every subscriber's stream after the
            // terminal event.
            channel.subscribers.clear();
        }
    }

    /// Attach a new observer to `task_id`.
    ///
    /// The observer first receives a `Connected` event, then the retained
    /// history, then every event published afterwards. Both happen under the
    /// same lock as `publish`, so nothing is missed or duplicated in between.
    pub fn subscribe(&self, task_id: TaskId) -> Result<Subscription, Pdf2HtmlError> {
        let mut tasks = self.lock();
        let channel = tasks
            .get_mut(&task_id)
            .ok_or(Pdf2HtmlError::TaskNotFound(task_id))?;

        let (sender, receiver) = mpsc::unbounded_channel();
        let id = self.next_subscriber.fetch_add(1, Ordering::Relaxed);

        // Stamp no later than the first replayed event so the stream this
        // subscriber sees stays non-decreasing.
        let mut connected = ProgressEvent::connected(task_id);
        if let Some(first) = channel.history.front() {
            if first.timestamp() < connected.timestamp() {
                connected.set_timestamp(first.timestamp());
            }
        }

        // The receiver is still in scope, so these sends cannot fail.
        let _ = sender.send(connected);
        for event in &channel.history {
            let _ = sender.send(event.clone());
        }

        if !channel.finished {
            channel.subscribers.push(Subscriber { id, sender });
        }
        debug!(task_id = %task_id, subscriber = id, "subscriber attached");

        Ok(Subscription {
            task_id,
            id,
            receiver,
        })
    }

    /// Detach every observer of `task_id`, keeping its history.
    pub fn unsubscribe(&self, task_id: TaskId) {
        if let Some(channel) = self.lock().get_mut(&task_id) {
            channel.subscribers.clear();
        }
    }

    /// Detach a single observer.
    pub fn detach(&self, task_id: TaskId, subscriber_id: u64) {
        if let Some(channel) = self.lock().get_mut(&task_id) {
            channel.subscribers.retain(|s| s.id != subscriber_id);
        }
    }

    /// Forget a task entirely: subscribers and history.
    pub fn drop_task(&self, task_id: TaskId) {
        self.lock().remove(&task_id);
    }

    /// Copy of the retained history, oldest first.
    pub fn history(&self, task_id: TaskId) -> Vec<ProgressEvent> {
        self.lock()
            .get(&task_id)
            .map(|c| c.history.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Live observers of `task_id` (closed ones are counted until the next publish).
    pub fn subscriber_count(&self, task_id: TaskId) -> usize {
        self.lock()
            .get(&task_id)
            .map(|c| c.subscribers.len())
            .unwrap_or(0)
    }

    pub fn is_open(&self, task_id: TaskId) -> bool {
        self.lock().contains_key(&task_id)
    }
}

impl Default for ProgressBroadcaster {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_CAPACITY)
    }
}

/// Receiving end of one observer.
#[derive(Debug)]
pub struct Subscription {
    task_id: TaskId,
    id: u64,
    receiver: mpsc::UnboundedReceiver<ProgressEvent>,
}

impl Subscription {
    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next event, or `None` once the stream has ended.
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        self.receiver.recv().await
    }

    /// Non-blocking poll; `None` if nothing is queued right now.
    pub fn try_recv(&mut self) -> Option<ProgressEvent> {
        self.receiver.try_recv().ok()
    }

    pub fn into_stream(self) -> UnboundedReceiverStream<ProgressEvent> {
        UnboundedReceiverStream::new(self.receiver)
    }
}
