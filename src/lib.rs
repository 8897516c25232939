//! WolfFailover - Heartbeat Leader Election with a Synchronized Work Queue
//!
//! Peers sharing an election name contend for mastership through a shared
//! heartbeat store. The master renews its heartbeat record, slaves watch it
//! and take over once it goes stale.
//!
//! # Architecture
//!
//! Every peer runs the same small state machine (`init`, `master`,
//! `slave`, `ticking` and an `error` overlay). The only cross-peer write is
//! the store's conditional insert of a heartbeat record, so there is no
//! peer-to-peer messaging.
//!
//! # Features
//!
//! - Heartbeat stores: in-process memory or a shared SQLite file
//! - Error overlay that retries a failing store and resumes where it left off
//! - Work queue dispatched only on the master
//! - Fencing identifier propagated from master to slaves through the
//!   heartbeat record, letting slaves drop work the master has done
//! - Deterministic test mode without a store

pub mod config;
pub mod error;
pub mod clock;
pub mod store;
pub mod state;
pub mod queue;

pub use config::FailoverConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::FailoverConfig;
    pub use crate::error::{Error, Result};
    pub use crate::state::{Event, Failover, StateKind};
    pub use crate::store::{Backend, HeartbeatRecord, HeartbeatStore, MemoryStore, SqliteStore};
    pub use crate::queue::{ManagedFailover, TaskKey, Worker};
}
