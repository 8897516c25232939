//! Leader Election
//!
//! Heartbeat-based master election over a shared store. Every peer runs
//! the same state machine; the only cross-peer write is the store's
//! conditional insert of a heartbeat record.
//!
//! # Init race
//!
//! If peers start while the store is unreachable, their first insert only
//! returns once the store is back. Two peers started more than one master
//! interval apart each compute the freshness window from their own stale
//! "now", and both inserts can succeed. A successful `init` therefore goes
//! to `ticking` for one more observation cycle instead of straight to
//! `master`.
//!
//! # Runtime race
//!
//! A worker that blocks longer than roughly the slave plus ticking
//! intervals lets a slave promote itself while the master is still
//! processing, so a task can be dispatched twice. Work must be idempotent
//! or retryable.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use chrono::{DateTime, Utc};
use tokio::sync::{broadcast, watch};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval_at, Instant, MissedTickBehavior};

use crate::clock::Clock;
use crate::config::{ElectionConfig, IntervalConfig};
use crate::error::{Error, Result};
use crate::state::events::{origin_name, Event};
use crate::state::machine::{Outcome, Runner, StateDescriptor, StateKind, Strategy};
use crate::store::{Backend, HeartbeatRecord, StoreEvent};

/// Capacity of the event channel per subscriber
const EVENT_CAPACITY: usize = 1024;

/// What a peer claims in heartbeat records
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    /// Election group
    pub name: String,
    /// This peer's identity
    pub member: String,
    /// Current fencing identifier
    pub identifier: Option<String>,
}

/// Result of driving a state
struct Settled {
    outcome: Outcome,
    error: Option<Arc<Error>>,
}

/// Aborts a background task when dropped
pub(crate) struct AbortOnDrop(pub(crate) JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

struct FailoverInner {
    payload: Mutex<Payload>,
    intervals: IntervalConfig,
    backend: Backend,
    /// Deterministic test-mode runner state
    counter: AtomicI64,
    clock: Clock,
    events: broadcast::Sender<Event>,
    state: watch::Sender<Option<StateKind>>,
    last_error: Mutex<Option<Arc<Error>>>,
}

/// Election state machine of one peer
///
/// Cloning yields another handle to the same peer.
#[derive(Clone)]
pub struct Failover {
    inner: Arc<FailoverInner>,
}

impl Failover {
    /// Create a peer contending in `election.name`
    pub fn new(election: ElectionConfig, intervals: IntervalConfig, backend: Backend) -> Self {
        Self::with_clock(election, intervals, backend, Clock::system())
    }

    /// Create a peer stamping heartbeats with `clock`
    pub fn with_clock(
        election: ElectionConfig,
        intervals: IntervalConfig,
        backend: Backend,
        clock: Clock,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (state, _) = watch::channel(None);

        Self {
            inner: Arc::new(FailoverInner {
                payload: Mutex::new(Payload {
                    name: election.name,
                    member: election.member,
                    identifier: election.identifier,
                }),
                intervals,
                backend,
                counter: AtomicI64::new(0),
                clock,
                events,
                state,
                last_error: Mutex::new(None),
            }),
        }
    }

    /// Subscribe to events emitted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.inner.events.subscribe()
    }

    /// Watch the current state (`None` before `run`)
    pub fn watch_state(&self) -> watch::Receiver<Option<StateKind>> {
        self.inner.state.subscribe()
    }

    /// Current state (`None` before `run`)
    pub fn state(&self) -> Option<StateKind> {
        *self.inner.state.borrow()
    }

    /// Current payload
    pub fn payload(&self) -> Payload {
        self.inner.payload().clone()
    }

    /// Error that led into the current state, if any
    pub fn last_error(&self) -> Option<Arc<Error>> {
        lock(&self.inner.last_error).clone()
    }

    /// Intervals this peer runs with
    pub fn intervals(&self) -> &IntervalConfig {
        &self.inner.intervals
    }

    /// Adopt `identifier` as this peer's fencing identifier. It is stamped
    /// into the next heartbeat record this peer inserts.
    pub fn synchronize(&self, identifier: Option<String>) {
        tracing::debug!("Synchronizing identifier {:?}", identifier);
        self.inner.payload().identifier = identifier.clone();
        self.inner.emit(Event::Synchronize(identifier));
    }

    /// Run the state machine. Only returns on an unrecoverable error.
    pub async fn run(&self) -> Result<()> {
        tracing::info!("Initializing failover for {}", self.inner.payload().name);
        let start = StateDescriptor::regular(StateKind::Init, &self.inner.intervals);
        self.run_from(start).await
    }

    pub(crate) async fn run_from(&self, start: StateDescriptor) -> Result<()> {
        // a zero run-until-change interval would spin the ticker
        self.inner.intervals.validate()?;
        let _notices = self.forward_store_events();

        let mut previous: Option<StateKind> = None;
        let mut current = start;
        let mut carried: Option<Arc<Error>> = None;

        loop {
            self.enter(previous, &current, carried.take());

            let settled = match self.drive(&current).await {
                Ok(settled) => settled,
                Err(e) => return Err(self.panic(e)),
            };

            let next = match current.table.next(settled.outcome) {
                Some(next) => next,
                None => {
                    return Err(self.panic(Error::UnknownTransition {
                        state: current.kind.to_string(),
                        outcome: settled.outcome.to_string(),
                    }))
                }
            };

            previous = Some(current.kind);
            carried = settled.error;
            current = current.successor(next, &self.inner.intervals);
        }
    }

    fn enter(&self, from: Option<StateKind>, to: &StateDescriptor, error: Option<Arc<Error>>) {
        tracing::info!("Changing state from {} to {}", origin_name(from), to.kind);

        *lock(&self.inner.last_error) = error.clone();
        self.inner.state.send_replace(Some(to.kind));

        self.inner.emit(Event::StateChange { from, to: to.kind });
        self.inner.emit(Event::Entered {
            state: to.kind,
            error: error.clone(),
        });

        if to.kind == StateKind::Error {
            if let Some(error) = error {
                tracing::warn!("Heartbeat store failing on {}: {}", origin_name(to.origin), error);
                self.inner.emit(Event::Error(error));
            }
        }
    }

    fn panic(&self, error: Error) -> Error {
        tracing::error!("Unrecoverable failover error: {}", error);
        let error = Arc::new(error);
        self.inner.emit(Event::Panic(Arc::clone(&error)));
        Error::Fatal(error)
    }

    async fn drive(&self, state: &StateDescriptor) -> Result<Settled> {
        let runner = state.runner.ok_or_else(|| Error::RunnerFailed {
            state: state.kind.to_string(),
            reason: "no runner assigned".to_string(),
        })?;

        match state.strategy {
            Strategy::RunOnce => Ok(self.run_once(state, runner).await),
            Strategy::RunUntilChange => self.run_until_change(state, runner).await,
        }
    }

    /// Wait one interval, run the test once
    async fn run_once(&self, state: &StateDescriptor, runner: Runner) -> Settled {
        tokio::time::sleep(state.interval).await;
        settle(self.inner.test(runner).await)
    }

    /// Run the test every interval until its result differs from the
    /// state's declared result. Overlapping tests are tolerated, the first
    /// one to settle wins and the rest are abandoned.
    async fn run_until_change(&self, state: &StateDescriptor, runner: Runner) -> Result<Settled> {
        let mut ticker = interval_at(Instant::now() + state.interval, state.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut inflight = JoinSet::new();

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let inner = Arc::clone(&self.inner);
                    inflight.spawn(async move { inner.test(runner).await });
                }
                Some(joined) = inflight.join_next() => {
                    let result = joined.map_err(|e| Error::RunnerFailed {
                        state: state.kind.to_string(),
                        reason: e.to_string(),
                    })?;

                    let settled = settle(result);
                    if state.settles_on(settled.outcome) {
                        return Ok(settled);
                    }
                    if let Some(error) = settled.error {
                        tracing::debug!("Heartbeat store still failing: {}", error);
                    }
                }
            }
        }
    }

    /// Re-emit store connectivity notices while running
    fn forward_store_events(&self) -> Option<AbortOnDrop> {
        let mut notices = match &self.inner.backend {
            Backend::Store(store) => store.subscribe()?,
            Backend::Counter => return None,
        };

        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            loop {
                let notice = match notices.recv().await {
                    Ok(notice) => notice,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!("Missed {} store notices", skipped);
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };

                let failing = *inner.state.borrow() == Some(StateKind::Error);
                match notice {
                    StoreEvent::Connected => {
                        tracing::debug!("Heartbeat store connected");
                        inner.emit(Event::Info("connected".to_string()));
                    }
                    StoreEvent::Disconnected(reason) => {
                        tracing::debug!("Heartbeat store disconnected: {}", reason);
                        if !failing {
                            inner.emit(Event::Error(Arc::new(Error::StoreUnavailable(reason))));
                        }
                    }
                    StoreEvent::Timeout => {
                        tracing::debug!("Heartbeat store timeout");
                        if !failing {
                            inner.emit(Event::Error(Arc::new(Error::StoreTimeout)));
                        }
                    }
                }
            }
        });

        Some(AbortOnDrop(handle))
    }
}

impl FailoverInner {
    fn payload(&self) -> MutexGuard<'_, Payload> {
        lock(&self.payload)
    }

    fn emit(&self, event: Event) {
        // no subscribers is fine
        let _ = self.events.send(event);
    }

    fn since(&self) -> DateTime<Utc> {
        let window = chrono::Duration::from_std(self.intervals.freshness_window())
            .unwrap_or(chrono::Duration::zero());
        self.clock.now() - window
    }

    async fn test(&self, runner: Runner) -> Result<bool> {
        match runner {
            Runner::MasterTest => self.master_test().await,
            Runner::SlaveTest => self.slave_test().await,
        }
    }

    /// TRUE if this peer owns the fresh heartbeat record, inserting one if
    /// there is none
    async fn master_test(&self) -> Result<bool> {
        tracing::debug!("Testing master mode");
        let store = match &self.backend {
            Backend::Store(store) => store,
            Backend::Counter => return Ok(self.counter.fetch_add(1, Ordering::SeqCst) != 5),
        };

        let payload = self.payload().clone();
        let now = self.clock.now();
        let defaults = HeartbeatRecord {
            name: payload.name.clone(),
            member: payload.member.clone(),
            identifier: payload.identifier.clone(),
            last_seen: now,
        };

        let record = store.find_or_insert(&payload.name, self.since(), defaults).await?;
        let leading = record.member == payload.member;
        if leading {
            self.emit(Event::Synchronize(record.identifier));
        } else {
            tracing::debug!("Heartbeat record of {} is held by {}", payload.name, record.member);
        }
        Ok(leading)
    }

    /// TRUE if anyone owns a fresh heartbeat record; adopts its identifier
    async fn slave_test(&self) -> Result<bool> {
        tracing::debug!("Testing slave mode");
        let store = match &self.backend {
            Backend::Store(store) => store,
            Backend::Counter => return Ok(self.counter.fetch_sub(1, Ordering::SeqCst) != 0),
        };

        let name = self.payload().name.clone();
        let record = match store.find_fresh(&name, self.since()).await? {
            Some(record) => record,
            None => return Ok(false),
        };

        let changed = {
            let mut payload = self.payload();
            if payload.identifier != record.identifier {
                payload.identifier = record.identifier.clone();
                true
            } else {
                false
            }
        };
        if changed {
            self.emit(Event::Synchronize(record.identifier));
        }
        Ok(true)
    }
}

fn settle(result: Result<bool>) -> Settled {
    match result {
        Ok(value) => Settled {
            outcome: Outcome::from(value),
            error: None,
        },
        Err(e) => Settled {
            outcome: Outcome::Error,
            error: Some(Arc::new(e)),
        },
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
