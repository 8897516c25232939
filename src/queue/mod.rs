//! Work Queue Module
//!
//! An ordered backlog of tasks that is only dispatched while the peer is
//! master, and pruned on slaves as the master reports finished work.
//!
//! The worker is expected to always settle. `Ok(true)` removes the task
//! from the backlog; `Ok(false)` keeps it at the head and stops dispatching
//! until the next submission or promotion. An error or a panic inside the
//! worker is treated like `Ok(false)`, so the worker decides which failures
//! are retried and which are dropped.

mod managed;

use std::collections::VecDeque;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use async_trait::async_trait;
use futures::FutureExt;
use serde::Serialize;

use crate::error::Result;
use crate::state::{Event, Failover, StateKind};

pub use managed::ManagedFailover;

/// Processes one task, `Ok(true)` when it is done
#[async_trait]
pub trait Worker<T>: Send + Sync {
    async fn work(&self, task: T) -> Result<bool>;
}

#[async_trait]
impl<T, F, Fut> Worker<T> for F
where
    T: Send + 'static,
    F: Fn(T) -> Fut + Send + Sync,
    Fut: Future<Output = Result<bool>> + Send + 'static,
{
    async fn work(&self, task: T) -> Result<bool> {
        (self)(task).await
    }
}

/// Derives the id of a task, equal for equal tasks on every peer
pub struct TaskKey<T> {
    extract: Arc<dyn Fn(&T) -> Option<String> + Send + Sync>,
}

impl<T> Clone for TaskKey<T> {
    fn clone(&self) -> Self {
        Self {
            extract: Arc::clone(&self.extract),
        }
    }
}

impl<T: 'static> TaskKey<T> {
    /// Id computed by a function
    pub fn from_fn(extract: impl Fn(&T) -> Option<String> + Send + Sync + 'static) -> Self {
        Self {
            extract: Arc::new(extract),
        }
    }

    /// Id of `task`
    pub fn id_of(&self, task: &T) -> Option<String> {
        (self.extract)(task)
    }
}

impl<T: Serialize + 'static> TaskKey<T> {
    /// Id read from a field of the serialized task. Strings are used as
    /// they are, other values as their JSON text; null or missing fields
    /// give no id.
    pub fn field(name: impl Into<String>) -> Self {
        let name = name.into();
        Self::from_fn(move |task: &T| {
            let value = match serde_json::to_value(task) {
                Ok(value) => value,
                Err(e) => {
                    tracing::debug!("Cannot serialize task for key {}: {}", name, e);
                    return None;
                }
            };

            match value.get(&name)? {
                serde_json::Value::Null => None,
                serde_json::Value::String(s) => Some(s.clone()),
                other => Some(other.to_string()),
            }
        })
    }
}

/// A queued task
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem<T> {
    pub id: Option<String>,
    pub task: T,
}

impl<T> WorkItem<T> {
    fn label(&self) -> &str {
        self.id.as_deref().unwrap_or("<none>")
    }
}

/// Releases the drain lock when dropped
struct DrainLock<'a>(&'a AtomicBool);

impl DrainLock<'_> {
    fn release(self) {
        self.0.store(false, Ordering::Release);
        std::mem::forget(self);
    }
}

impl Drop for DrainLock<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Backlog of one peer, dispatched to the worker while master
pub struct WorkQueue<T> {
    key: TaskKey<T>,
    worker: Arc<dyn Worker<T>>,
    failover: Failover,
    backlog: Mutex<VecDeque<WorkItem<T>>>,
    /// At most one active drain
    draining: AtomicBool,
    /// Set only from state change events
    master: AtomicBool,
}

impl<T> WorkQueue<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Create an empty queue reporting finished work through `failover`
    pub fn new(failover: Failover, key: TaskKey<T>, worker: Arc<dyn Worker<T>>) -> Self {
        Self {
            key,
            worker,
            failover,
            backlog: Mutex::new(VecDeque::new()),
            draining: AtomicBool::new(false),
            master: AtomicBool::new(false),
        }
    }

    /// Append a task, dispatching right away if master. Never fails.
    pub fn submit_work(self: &Arc<Self>, task: T) {
        let id = self.key.id_of(&task);
        tracing::debug!("New task with id {:?} received", id);
        self.backlog().push_back(WorkItem { id, task });

        if self.is_master() {
            self.spawn_drain();
        }
    }

    /// Whether the last state change entered master
    pub fn is_master(&self) -> bool {
        self.master.load(Ordering::SeqCst)
    }

    /// Ids of the queued tasks, head first
    pub fn pending(&self) -> Vec<Option<String>> {
        self.backlog().iter().map(|item| item.id.clone()).collect()
    }

    /// Number of queued tasks
    pub fn len(&self) -> usize {
        self.backlog().len()
    }

    /// Whether the backlog is empty
    pub fn is_empty(&self) -> bool {
        self.backlog().is_empty()
    }

    /// React to a failover event
    pub fn handle_event(self: &Arc<Self>, event: &Event) {
        match event {
            Event::StateChange { to, .. } => {
                if self.set_master(*to == StateKind::Master) {
                    self.spawn_drain();
                }
            }
            Event::Synchronize(id) => self.sync(id.as_deref()),
            _ => {}
        }
    }

    /// Align the master flag with the peer's current state after state
    /// change events were missed
    pub fn reconcile(self: &Arc<Self>, state: Option<StateKind>) {
        let master = state == Some(StateKind::Master);
        if master != self.is_master() {
            tracing::debug!("Work queue master flag was stale, now {}", master);
        }
        if self.set_master(master) {
            self.spawn_drain();
        }
    }

    fn set_master(&self, master: bool) -> bool {
        self.master.store(master, Ordering::SeqCst);
        master
    }

    /// Drop every task up to and including the one with `id`, which the
    /// master reported as done. Ignored while master.
    pub fn sync(&self, id: Option<&str>) {
        if self.is_master() {
            return;
        }
        let id = match id {
            Some(id) => id,
            None => return,
        };

        tracing::debug!("Slave received synchronize event with id {}", id);
        let mut backlog = self.backlog();
        if let Some(position) = backlog.iter().position(|item| item.id.as_deref() == Some(id)) {
            tracing::debug!("Slave clearing {} tasks...", position + 1);
            backlog.drain(..=position);
        }
    }

    fn spawn_drain(self: &Arc<Self>) {
        if tokio::runtime::Handle::try_current().is_err() {
            tracing::debug!("No runtime to drain on, waiting for the next promotion");
            return;
        }

        let queue = Arc::clone(self);
        tokio::spawn(async move { queue.drain().await });
    }

    /// Dispatch queued tasks until the backlog is empty or a task is not
    /// done. Returns at once if another drain is active.
    pub async fn drain(&self) {
        if self
            .draining
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return;
        }
        let lock = DrainLock(&self.draining);

        // tasks may be added while draining, so pop until empty
        loop {
            let item = {
                let mut backlog = self.backlog();
                match backlog.pop_front() {
                    Some(item) => item,
                    None => {
                        // released under the backlog lock: a concurrent
                        // submission is either popped here or finds the
                        // drain lock free
                        lock.release();
                        return;
                    }
                }
            };
            tracing::debug!("Master delegating task {}...", item.label());

            let outcome = AssertUnwindSafe(self.worker.work(item.task.clone()))
                .catch_unwind()
                .await;

            match outcome {
                Ok(Ok(true)) if self.is_master() => {
                    self.failover.synchronize(item.id.clone());
                }
                Ok(Ok(true)) => {
                    // worker outlived our leadership
                    tracing::debug!("Lost master mode while task {} was processed", item.label());
                    self.requeue(item);
                    break;
                }
                Ok(Ok(false)) => {
                    tracing::debug!("Worker returned failure, putting task {} back into the queue", item.label());
                    self.requeue(item);
                    break;
                }
                Ok(Err(e)) => {
                    tracing::debug!(
                        "Received unexpected worker error for task {}, putting the task back into the queue: {}",
                        item.label(),
                        e
                    );
                    self.requeue(item);
                    break;
                }
                Err(_) => {
                    tracing::debug!("Worker panicked on task {}, putting the task back into the queue", item.label());
                    self.requeue(item);
                    break;
                }
            }
        }
    }

    fn requeue(&self, item: WorkItem<T>) {
        self.backlog().push_front(item);
    }

    fn backlog(&self) -> MutexGuard<'_, VecDeque<WorkItem<T>>> {
        self.backlog.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::time::Duration;
    use serde::Deserialize;
    use tokio::sync::broadcast;

    use crate::config::{ElectionConfig, IntervalConfig};
    use crate::error::Error;
    use crate::store::Backend;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Task {
        id: u64,
        name: String,
    }

    fn task(id: u64) -> Task {
        Task {
            id,
            name: format!("task-{}", id),
        }
    }

    #[derive(Clone, Copy)]
    enum Reply {
        Done,
        Retry,
        Fail,
        Panic,
        SlowDone,
    }

    /// Worker answering from a script, `Done` for unscripted tasks
    #[derive(Default)]
    struct ScriptedWorker {
        script: Mutex<HashMap<u64, Reply>>,
        seen: Mutex<Vec<u64>>,
    }

    impl ScriptedWorker {
        fn with(replies: &[(u64, Reply)]) -> Arc<Self> {
            let worker = Self::default();
            worker.script.lock().unwrap().extend(replies.iter().copied());
            Arc::new(worker)
        }

        fn seen(&self) -> Vec<u64> {
            self.seen.lock().unwrap().clone()
        }

        fn answer(&self, id: u64, reply: Reply) {
            self.script.lock().unwrap().insert(id, reply);
        }
    }

    #[async_trait]
    impl Worker<Task> for ScriptedWorker {
        async fn work(&self, task: Task) -> Result<bool> {
            self.seen.lock().unwrap().push(task.id);
            let reply = self.script.lock().unwrap().get(&task.id).copied().unwrap_or(Reply::Done);
            match reply {
                Reply::Done => Ok(true),
                Reply::Retry => Ok(false),
                Reply::Fail => Err(Error::WorkerRejected {
                    id: task.id.to_string(),
                    reason: "demo".to_string(),
                }),
                Reply::Panic => panic!("worker blew up"),
                Reply::SlowDone => {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    Ok(true)
                }
            }
        }
    }

    fn queue(worker: Arc<ScriptedWorker>) -> (Arc<WorkQueue<Task>>, broadcast::Receiver<Event>) {
        let failover = Failover::new(
            ElectionConfig::new("jobs").with_member("a"),
            IntervalConfig::default(),
            Backend::Counter,
        );
        let events = failover.subscribe();
        let queue = Arc::new(WorkQueue::new(failover, TaskKey::field("id"), worker));
        (queue, events)
    }

    fn ids(values: &[u64]) -> Vec<Option<String>> {
        values.iter().map(|v| Some(v.to_string())).collect()
    }

    fn synchronized(events: &mut broadcast::Receiver<Event>) -> Vec<Option<String>> {
        let mut ids = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let Event::Synchronize(id) = event {
                ids.push(id);
            }
        }
        ids
    }

    #[tokio::test]
    async fn test_drain_in_fifo_order() {
        let worker = ScriptedWorker::with(&[]);
        let (queue, mut events) = queue(Arc::clone(&worker));

        for id in 1..=4 {
            queue.submit_work(task(id));
        }
        assert!(worker.seen().is_empty());

        queue.set_master(true);
        queue.drain().await;

        assert_eq!(worker.seen(), vec![1, 2, 3, 4]);
        assert!(queue.is_empty());
        assert_eq!(synchronized(&mut events), ids(&[1, 2, 3, 4]));
        assert_eq!(queue.failover.payload().identifier.as_deref(), Some("4"));
    }

    #[tokio::test]
    async fn test_retry_keeps_task_at_head() {
        let worker = ScriptedWorker::with(&[(2, Reply::Retry)]);
        let (queue, mut events) = queue(Arc::clone(&worker));

        for id in 1..=3 {
            queue.submit_work(task(id));
        }
        queue.set_master(true);
        queue.drain().await;

        assert_eq!(worker.seen(), vec![1, 2]);
        assert_eq!(queue.pending(), ids(&[2, 3]));
        assert_eq!(synchronized(&mut events), ids(&[1]));

        // the next drain retries the same head
        worker.answer(2, Reply::Done);
        queue.drain().await;
        assert_eq!(worker.seen(), vec![1, 2, 2, 3]);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_worker_error_and_panic_requeue() {
        let worker = ScriptedWorker::with(&[(1, Reply::Fail), (2, Reply::Panic)]);
        let (queue, mut events) = queue(Arc::clone(&worker));

        queue.submit_work(task(1));
        queue.submit_work(task(2));
        queue.set_master(true);

        queue.drain().await;
        assert_eq!(queue.pending(), ids(&[1, 2]));

        worker.answer(1, Reply::Done);
        queue.drain().await;
        assert_eq!(worker.seen(), vec![1, 1, 2]);
        assert_eq!(queue.pending(), ids(&[2]));
        assert_eq!(synchronized(&mut events), ids(&[1]));

        // the drain lock was released despite the panic
        worker.answer(2, Reply::Done);
        queue.drain().await;
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_master_requeues_without_synchronize() {
        let worker = ScriptedWorker::with(&[(2, Reply::SlowDone)]);
        let (queue, mut events) = queue(Arc::clone(&worker));

        for id in 1..=3 {
            queue.submit_work(task(id));
        }
        queue.set_master(true);

        tokio::join!(queue.drain(), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            queue.set_master(false);
        });

        assert_eq!(worker.seen(), vec![1, 2]);
        assert_eq!(queue.pending(), ids(&[2, 3]));
        assert_eq!(synchronized(&mut events), ids(&[1]));
    }

    #[tokio::test(start_paused = true)]
    async fn test_single_active_drain() {
        let worker = ScriptedWorker::with(&[(1, Reply::SlowDone)]);
        let (queue, _events) = queue(Arc::clone(&worker));

        queue.submit_work(task(1));
        queue.submit_work(task(2));
        queue.set_master(true);

        tokio::join!(queue.drain(), queue.drain());
        assert_eq!(worker.seen(), vec![1, 2]);
        assert!(queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_submissions_during_drain_are_picked_up() {
        let worker = ScriptedWorker::with(&[(1, Reply::SlowDone)]);
        let (queue, _events) = queue(Arc::clone(&worker));

        queue.submit_work(task(1));
        queue.set_master(true);

        tokio::join!(queue.drain(), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            queue.submit_work(task(2));
        });

        assert_eq!(worker.seen(), vec![1, 2]);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_promotion_triggers_drain() {
        let worker = ScriptedWorker::with(&[]);
        let (queue, _events) = queue(Arc::clone(&worker));

        queue.submit_work(task(1));
        queue.submit_work(task(2));
        queue.handle_event(&Event::StateChange {
            from: Some(StateKind::Ticking),
            to: StateKind::Master,
        });
        assert!(queue.is_master());

        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(worker.seen(), vec![1, 2]);
        assert!(queue.is_empty());

        queue.handle_event(&Event::StateChange {
            from: Some(StateKind::Master),
            to: StateKind::Slave,
        });
        assert!(!queue.is_master());
        queue.submit_work(task(3));
        tokio::task::yield_now().await;
        assert_eq!(worker.seen(), vec![1, 2]);
        assert_eq!(queue.pending(), ids(&[3]));
    }

    #[tokio::test]
    async fn test_reconcile_follows_current_state() {
        let worker = ScriptedWorker::with(&[]);
        let (queue, _events) = queue(Arc::clone(&worker));
        queue.submit_work(task(1));

        // missed the demotion
        queue.set_master(true);
        queue.reconcile(Some(StateKind::Slave));
        assert!(!queue.is_master());
        queue.reconcile(None);
        assert!(!queue.is_master());

        // missed the promotion
        queue.reconcile(Some(StateKind::Master));
        assert!(queue.is_master());
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        assert_eq!(worker.seen(), vec![1]);
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_drain_lock_released_when_backlog_empties() {
        let worker = ScriptedWorker::with(&[]);
        let (queue, _events) = queue(Arc::clone(&worker));
        queue.submit_work(task(1));
        queue.set_master(true);

        queue.drain().await;
        assert!(!queue.draining.load(Ordering::SeqCst));

        queue.submit_work(task(2));
        queue.drain().await;
        assert_eq!(worker.seen(), vec![1, 2]);
        assert!(!queue.draining.load(Ordering::SeqCst));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_submissions_are_all_dispatched() {
        let worker = ScriptedWorker::with(&[]);
        let (queue, _events) = queue(Arc::clone(&worker));
        queue.set_master(true);

        for round in 0..200u64 {
            let submitters: Vec<_> = (0..4u64)
                .map(|i| {
                    let queue = Arc::clone(&queue);
                    tokio::spawn(async move { queue.submit_work(task(round * 4 + i)) })
                })
                .collect();
            for submitter in submitters {
                submitter.await.unwrap();
            }

            // a submission stranded behind a finishing drain would stay queued
            tokio::time::timeout(Duration::from_secs(5), async {
                while !queue.is_empty() {
                    tokio::time::sleep(Duration::from_millis(1)).await;
                }
            })
            .await
            .expect("backlog left behind while master");
        }

        tokio::time::timeout(Duration::from_secs(5), async {
            while worker.seen().len() < 800 {
                tokio::time::sleep(Duration::from_millis(1)).await;
            }
        })
        .await
        .unwrap();
        let mut seen = worker.seen();
        seen.sort_unstable();
        assert_eq!(seen, (0..800).collect::<Vec<u64>>());
    }

    #[tokio::test]
    async fn test_sync_prunes_up_to_matching_id() {
        let (queue, _events) = queue(ScriptedWorker::with(&[]));
        for id in 1..=4 {
            queue.submit_work(task(id));
        }

        queue.sync(Some("3"));
        assert_eq!(queue.pending(), ids(&[4]));

        // idempotent
        queue.sync(Some("3"));
        assert_eq!(queue.pending(), ids(&[4]));

        // unknown ids and null are ignored
        queue.sync(Some("9"));
        queue.sync(None);
        assert_eq!(queue.pending(), ids(&[4]));
    }

    #[tokio::test]
    async fn test_sync_ignored_while_master() {
        let (queue, _events) = queue(ScriptedWorker::with(&[]));
        for id in 1..=4 {
            queue.submit_work(task(id));
        }
        queue.set_master(true);

        queue.sync(Some("3"));
        assert_eq!(queue.pending(), ids(&[1, 2, 3, 4]));
    }

    #[tokio::test]
    async fn test_synchronize_event_prunes_slave() {
        let (queue, _events) = queue(ScriptedWorker::with(&[]));
        for id in 1..=3 {
            queue.submit_work(task(id));
        }

        queue.handle_event(&Event::Synchronize(Some("2".to_string())));
        assert_eq!(queue.pending(), ids(&[3]));
        queue.handle_event(&Event::Synchronize(None));
        assert_eq!(queue.pending(), ids(&[3]));
    }

    #[test]
    fn test_task_keys() {
        let by_id: TaskKey<Task> = TaskKey::field("id");
        assert_eq!(by_id.id_of(&task(7)).as_deref(), Some("7"));

        let by_name: TaskKey<Task> = TaskKey::field("name");
        assert_eq!(by_name.id_of(&task(7)).as_deref(), Some("task-7"));

        let missing: TaskKey<Task> = TaskKey::field("owner");
        assert_eq!(missing.id_of(&task(7)), None);

        let null: TaskKey<serde_json::Value> = TaskKey::field("id");
        assert_eq!(null.id_of(&serde_json::json!({ "id": null })), None);

        let extracted: TaskKey<Task> = TaskKey::from_fn(|t: &Task| Some(format!("{}#{}", t.name, t.id)));
        assert_eq!(extracted.clone().id_of(&task(3)).as_deref(), Some("task-3#3"));
    }

    #[tokio::test]
    async fn test_closure_worker() {
        let failover = Failover::new(
            ElectionConfig::new("jobs").with_member("a"),
            IntervalConfig::default(),
            Backend::Counter,
        );
        let worker = |t: Task| async move { Ok::<bool, Error>(t.id % 2 == 0) };
        let queue = Arc::new(WorkQueue::new(failover, TaskKey::field("id"), Arc::new(worker)));

        queue.submit_work(task(2));
        queue.submit_work(task(3));
        queue.set_master(true);
        queue.drain().await;
        assert_eq!(queue.pending(), ids(&[3]));
    }
}
