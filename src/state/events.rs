//! Failover Events
//!
//! Everything a peer reports to the outside world. Delivered in emission
//! order to every subscriber.

use std::sync::Arc;

use crate::error::Error;
use crate::state::StateKind;

/// Lifecycle notification of a failover peer
#[derive(Debug, Clone)]
pub enum Event {
    /// The peer switched states (`from` is `None` on boot)
    StateChange {
        from: Option<StateKind>,
        to: StateKind,
    },
    /// Emitted right after `StateChange`, carrying the error the previous
    /// state captured
    Entered {
        state: StateKind,
        error: Option<Arc<Error>>,
    },
    /// Fencing identifier observed or assigned
    Synchronize(Option<String>),
    /// Recoverable error
    Error(Arc<Error>),
    /// Informational notice (store connectivity)
    Info(String),
    /// Unrecoverable error, the peer stopped
    Panic(Arc<Error>),
}

impl Event {
    /// Short name of the event
    pub fn type_name(&self) -> &'static str {
        match self {
            Event::StateChange { .. } => "statechange",
            Event::Entered { state, .. } => state.name(),
            Event::Synchronize(_) => "synchronize",
            Event::Error(_) => "error",
            Event::Info(_) => "info",
            Event::Panic(_) => "panic",
        }
    }
}

/// Display name of a state change origin
pub fn origin_name(from: Option<StateKind>) -> &'static str {
    from.map(|state| state.name()).unwrap_or("boot")
}
