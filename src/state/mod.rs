//! Election State Module
//!
//! The per-peer election state machine: state descriptors, the drive
//! loop running them against the heartbeat store, and the events it emits.

mod machine;
mod events;
pub mod election;

pub use machine::{Outcome, Runner, StateDescriptor, StateKind, Strategy, TransitionTable};
pub use events::{origin_name, Event};
pub use election::{Failover, Payload};
