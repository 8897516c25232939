//! Managed Failover
//!
//! A failover peer with a work queue attached: tasks submitted on every
//! peer are only dispatched on the master, and slaves drop the tasks the
//! master reports as done.

use std::sync::Arc;
use tokio::sync::broadcast;

use crate::config::FailoverConfig;
use crate::error::Result;
use crate::queue::{TaskKey, WorkQueue, Worker};
use crate::state::election::AbortOnDrop;
use crate::state::{Event, Failover};
use crate::store::Backend;

/// Failover peer dispatching queued work while master
pub struct ManagedFailover<T> {
    failover: Failover,
    queue: Arc<WorkQueue<T>>,
}

impl<T> ManagedFailover<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// Attach a work queue to `failover`
    pub fn new(failover: Failover, key: TaskKey<T>, worker: impl Worker<T> + 'static) -> Self {
        let queue = Arc::new(WorkQueue::new(failover.clone(), key, Arc::new(worker)));
        Self { failover, queue }
    }

    /// Build the peer and its heartbeat backend from configuration
    pub fn from_config(
        config: &FailoverConfig,
        key: TaskKey<T>,
        worker: impl Worker<T> + 'static,
    ) -> Result<Self> {
        config.validate()?;
        let backend = Backend::open(&config.store, config.election.test_mode)?;
        let failover = Failover::new(config.election.clone(), config.intervals.clone(), backend);
        Ok(Self::new(failover, key, worker))
    }

    /// The underlying election peer
    pub fn failover(&self) -> &Failover {
        &self.failover
    }

    /// The work queue
    pub fn queue(&self) -> &Arc<WorkQueue<T>> {
        &self.queue
    }

    /// Subscribe to the failover events
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.failover.subscribe()
    }

    /// Queue a task on this peer
    pub fn submit_work(&self, task: T) {
        self.queue.submit_work(task);
    }

    /// Ids of the tasks still queued on this peer
    pub fn pending(&self) -> Vec<Option<String>> {
        self.queue.pending()
    }

    /// Run the election with the queue following its events. Only returns
    /// on an unrecoverable error.
    pub async fn run(&self) -> Result<()> {
        let _listener = self.listen();
        self.failover.run().await
    }

    fn listen(&self) -> AbortOnDrop {
        // subscribe before the first state is entered
        let mut events = self.failover.subscribe();
        let queue = Arc::clone(&self.queue);
        let failover = self.failover.clone();

        let handle = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => queue.handle_event(&event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Work queue missed {} failover events", skipped);
                        queue.reconcile(failover.state());
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        AbortOnDrop(handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;
    use serde::{Deserialize, Serialize};

    use crate::clock::Clock;
    use crate::config::{ElectionConfig, IntervalConfig};
    use crate::error::Error;
    use crate::state::StateKind;
    use crate::store::MemoryStore;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Job {
        id: u64,
    }

    /// Worker recording the ids it was handed
    #[derive(Clone, Default)]
    struct Recorder {
        seen: Arc<Mutex<Vec<u64>>>,
    }

    impl Recorder {
        fn seen(&self) -> Vec<u64> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl Worker<Job> for Recorder {
        async fn work(&self, job: Job) -> std::result::Result<bool, Error> {
            self.seen.lock().unwrap().push(job.id);
            Ok(true)
        }
    }

    fn peer(member: &str, backend: Backend, clock: Clock, worker: Recorder) -> Arc<ManagedFailover<Job>> {
        let failover = Failover::with_clock(
            ElectionConfig::new("jobs").with_member(member),
            IntervalConfig::default(),
            backend,
            clock,
        );
        Arc::new(ManagedFailover::new(failover, TaskKey::field("id"), worker))
    }

    fn start(peer: &Arc<ManagedFailover<Job>>) -> AbortOnDrop {
        let peer = Arc::clone(peer);
        AbortOnDrop(tokio::spawn(async move {
            let _ = peer.run().await;
        }))
    }

    #[tokio::test(start_paused = true)]
    async fn test_promotion_dispatches_backlog() {
        let worker = Recorder::default();
        let managed = peer("a", Backend::Counter, Clock::system(), worker.clone());

        managed.submit_work(Job { id: 1 });
        managed.submit_work(Job { id: 2 });

        let mut state = managed.failover().watch_state();
        let _running = start(&managed);
        state.wait_for(|s| *s == Some(StateKind::Master)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        assert_eq!(worker.seen(), vec![1, 2]);
        assert!(managed.pending().is_empty());
        assert_eq!(managed.failover().payload().identifier.as_deref(), Some("2"));

        managed.submit_work(Job { id: 3 });
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(worker.seen(), vec![1, 2, 3]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_slave_prunes_work_done_by_master() {
        let clock = Clock::system();
        let store = MemoryStore::with_clock(Duration::from_secs(600), clock);

        let worker_a = Recorder::default();
        let a = peer("a", Backend::store(store.clone()), clock, worker_a.clone());
        a.submit_work(Job { id: 1 });
        let _running_a = start(&a);
        tokio::time::sleep(Duration::from_millis(700)).await;

        let worker_b = Recorder::default();
        let b = peer("b", Backend::store(store.clone()), clock, worker_b.clone());
        b.submit_work(Job { id: 1 });
        let _running_b = start(&b);

        // a renews at 4000 carrying identifier 1, b reads it at 5700
        tokio::time::sleep(Duration::from_millis(7300)).await;

        assert_eq!(a.failover().state(), Some(StateKind::Master));
        assert_eq!(b.failover().state(), Some(StateKind::Slave));
        assert_eq!(worker_a.seen(), vec![1]);
        assert!(worker_b.seen().is_empty());
        assert!(a.pending().is_empty());
        assert!(b.pending().is_empty());
        assert_eq!(b.failover().payload().identifier.as_deref(), Some("1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_slave_keeps_work_not_yet_done() {
        let clock = Clock::system();
        let store = MemoryStore::with_clock(Duration::from_secs(600), clock);

        let a = peer("a", Backend::store(store.clone()), clock, Recorder::default());
        a.submit_work(Job { id: 1 });
        let _running_a = start(&a);
        tokio::time::sleep(Duration::from_millis(700)).await;

        let b = peer("b", Backend::store(store.clone()), clock, Recorder::default());
        b.submit_work(Job { id: 1 });
        b.submit_work(Job { id: 2 });
        let _running_b = start(&b);

        tokio::time::sleep(Duration::from_millis(7300)).await;
        assert_eq!(b.pending(), vec![Some("2".to_string())]);
    }

    #[test]
    fn test_from_config_in_test_mode() {
        let mut config = FailoverConfig::new("jobs");
        config.election.test_mode = true;

        let managed: ManagedFailover<Job> =
            ManagedFailover::from_config(&config, TaskKey::field("id"), Recorder::default()).unwrap();
        assert_eq!(managed.failover().state(), None);
        assert_eq!(managed.failover().payload().name, "jobs");
        assert!(!managed.queue().is_master());
    }

    #[test]
    fn test_from_config_rejects_invalid_intervals() {
        let mut config = FailoverConfig::new("jobs");
        config.election.test_mode = true;
        config.intervals.master_ms = 0;

        let result = ManagedFailover::<Job>::from_config(&config, TaskKey::field("id"), Recorder::default());
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
