//! Heartbeat Store Module
//!
//! Durable heartbeat records with idle expiry and a single atomic
//! conditional upsert. The election state machine only talks to the
//! store through [`HeartbeatStore`].

mod memory;
mod sqlite;

use std::sync::Arc;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::config::{StoreBackend, StoreConfig};
use crate::error::Result;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Heartbeat of the peer claiming leadership of an election group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatRecord {
    /// Election group
    pub name: String,
    /// Peer that wrote the record
    pub member: String,
    /// Fencing identifier of the current batch of work
    pub identifier: Option<String>,
    /// Time of the heartbeat
    pub last_seen: DateTime<Utc>,
}

impl HeartbeatRecord {
    /// Whether the record is newer than `since`
    pub fn is_fresh(&self, since: DateTime<Utc>) -> bool {
        self.last_seen > since
    }
}

/// Connectivity notice published by a store backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    Connected,
    Disconnected(String),
    Timeout,
}

/// Storage contract for heartbeat records
#[async_trait]
pub trait HeartbeatStore: Send + Sync {
    /// Latest record of `name` newer than `since`, never writes
    async fn find_fresh(&self, name: &str, since: DateTime<Utc>) -> Result<Option<HeartbeatRecord>>;

    /// Return the record of `name` newer than `since` unmodified, or insert
    /// `defaults` and return it. Must be atomic across peers.
    async fn find_or_insert(
        &self,
        name: &str,
        since: DateTime<Utc>,
        defaults: HeartbeatRecord,
    ) -> Result<HeartbeatRecord>;

    /// Connectivity notices, if the backend publishes any
    fn subscribe(&self) -> Option<broadcast::Receiver<StoreEvent>> {
        None
    }
}

/// Where the election runners get their results from
#[derive(Clone)]
pub enum Backend {
    /// Real heartbeat store
    Store(Arc<dyn HeartbeatStore>),
    /// Deterministic counters instead of store round-trips (test mode)
    Counter,
}

impl Backend {
    /// Backend for a heartbeat store
    pub fn store(store: impl HeartbeatStore + 'static) -> Self {
        Backend::Store(Arc::new(store))
    }

    /// Open the backend described by the configuration
    pub fn open(config: &StoreConfig, test_mode: bool) -> Result<Self> {
        if test_mode {
            tracing::info!("Test mode: store tests replaced by counters");
            return Ok(Backend::Counter);
        }

        match config.backend {
            StoreBackend::Memory => Ok(Backend::store(MemoryStore::new(config.expire_after()))),
            StoreBackend::Sqlite => Ok(Backend::store(SqliteStore::open(
                &config.path,
                config.expire_after(),
            )?)),
        }
    }
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Backend::Store(_) => write!(f, "Backend::Store"),
            Backend::Counter => write!(f, "Backend::Counter"),
        }
    }
}
