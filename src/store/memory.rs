//! In-Memory Heartbeat Store
//!
//! Shared by clones, so several peers inside one process can contend for
//! the same election group. An availability switch simulates outages.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::broadcast;

use crate::clock::Clock;
use crate::error::{Error, Result};
use crate::store::{HeartbeatRecord, HeartbeatStore, StoreEvent};

struct MemoryInner {
    /// All records per election group, oldest first
    records: Mutex<HashMap<String, Vec<HeartbeatRecord>>>,
    /// Whether operations currently succeed
    available: AtomicBool,
    /// Number of inserted records
    inserts: AtomicU64,
    /// Idle expiry of records
    expire_after: Duration,
    clock: Clock,
    events: broadcast::Sender<StoreEvent>,
}

/// Heartbeat store kept in process memory
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<MemoryInner>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new(expire_after: Duration) -> Self {
        Self::with_clock(expire_after, Clock::system())
    }

    /// Create an empty store purging by `clock`
    pub fn with_clock(expire_after: Duration, clock: Clock) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            inner: Arc::new(MemoryInner {
                records: Mutex::new(HashMap::new()),
                available: AtomicBool::new(true),
                inserts: AtomicU64::new(0),
                expire_after,
                clock,
                events,
            }),
        }
    }

    /// Simulate losing or regaining the store
    pub fn set_available(&self, available: bool) {
        let was = self.inner.available.swap(available, Ordering::SeqCst);
        if was == available {
            return;
        }

        let event = if available {
            StoreEvent::Connected
        } else {
            StoreEvent::Disconnected("memory store switched off".to_string())
        };
        tracing::debug!("Memory store availability changed: {:?}", event);
        let _ = self.inner.events.send(event);
    }

    /// Number of records inserted so far
    pub fn insert_count(&self) -> u64 {
        self.inner.inserts.load(Ordering::SeqCst)
    }

    /// Records currently held for `name`, oldest first
    pub fn records(&self, name: &str) -> Vec<HeartbeatRecord> {
        self.lock().get(name).cloned().unwrap_or_default()
    }

    /// Drop records idle for longer than the expiry
    pub fn purge_expired(&self) -> u64 {
        let mut records = self.lock();
        Self::purge(&mut records, self.expiry_cutoff())
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Vec<HeartbeatRecord>>> {
        self.inner.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn expiry_cutoff(&self) -> DateTime<Utc> {
        let now = self.inner.clock.now();
        chrono::Duration::from_std(self.inner.expire_after)
            .ok()
            .and_then(|expire_after| now.checked_sub_signed(expire_after))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    fn purge(records: &mut HashMap<String, Vec<HeartbeatRecord>>, cutoff: DateTime<Utc>) -> u64 {
        let mut purged = 0;
        records.retain(|_, group| {
            let before = group.len();
            group.retain(|record| record.last_seen >= cutoff);
            purged += (before - group.len()) as u64;
            !group.is_empty()
        });
        purged
    }

    fn check_available(&self) -> Result<()> {
        if self.inner.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::StoreUnavailable("memory store switched off".to_string()))
        }
    }

    fn latest_fresh(group: Option<&Vec<HeartbeatRecord>>, since: DateTime<Utc>) -> Option<HeartbeatRecord> {
        group?
            .iter()
            .filter(|record| record.is_fresh(since))
            .max_by_key(|record| record.last_seen)
            .cloned()
    }
}

#[async_trait]
impl HeartbeatStore for MemoryStore {
    async fn find_fresh(&self, name: &str, since: DateTime<Utc>) -> Result<Option<HeartbeatRecord>> {
        self.check_available()?;
        let records = self.lock();
        Ok(Self::latest_fresh(records.get(name), since))
    }

    async fn find_or_insert(
        &self,
        name: &str,
        since: DateTime<Utc>,
        defaults: HeartbeatRecord,
    ) -> Result<HeartbeatRecord> {
        self.check_available()?;
        let cutoff = self.expiry_cutoff();
        let mut records = self.lock();
        Self::purge(&mut records, cutoff);

        if let Some(existing) = Self::latest_fresh(records.get(name), since) {
            return Ok(existing);
        }

        let record = HeartbeatRecord {
            name: name.to_string(),
            ..defaults
        };
        records.entry(name.to_string()).or_default().push(record.clone());
        self.inner.inserts.fetch_add(1, Ordering::SeqCst);
        Ok(record)
    }

    fn subscribe(&self) -> Option<broadcast::Receiver<StoreEvent>> {
        Some(self.inner.events.subscribe())
    }
}
