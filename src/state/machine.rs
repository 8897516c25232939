//! State Descriptors
//!
//! The fixed table of election states: which test each state runs, how
//! often it runs it, and where each result leads.

use std::time::Duration;
use serde::{Deserialize, Serialize};

use crate::config::IntervalConfig;
use crate::error::{Error, Result};

/// Election state of a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StateKind {
    /// First test after boot
    Init,
    /// Holding the heartbeat record, dispatching work
    Master,
    /// Hot standby watching the master's heartbeats
    Slave,
    /// One extra observation cycle before becoming master
    Ticking,
    /// Store failure overlay on top of the state that failed
    Error,
}

impl StateKind {
    pub const ALL: [StateKind; 5] = [
        StateKind::Init,
        StateKind::Master,
        StateKind::Slave,
        StateKind::Ticking,
        StateKind::Error,
    ];

    /// Lowercase state name, as used in events and configuration
    pub fn name(&self) -> &'static str {
        match self {
            StateKind::Init => "init",
            StateKind::Master => "master",
            StateKind::Slave => "slave",
            StateKind::Ticking => "ticking",
            StateKind::Error => "error",
        }
    }

    /// Parse a state name, ignoring case
    pub fn parse(name: &str) -> Result<Self> {
        let lower = name.trim().to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|kind| kind.name() == lower)
            .ok_or_else(|| Error::UnknownState(name.to_string()))
    }
}

impl std::fmt::Display for StateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Tri-state result of a runner
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    True,
    False,
    Error,
}

impl From<bool> for Outcome {
    fn from(value: bool) -> Self {
        if value {
            Outcome::True
        } else {
            Outcome::False
        }
    }
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::True => write!(f, "TRUE"),
            Outcome::False => write!(f, "FALSE"),
            Outcome::Error => write!(f, "ERROR"),
        }
    }
}

/// How often a state's runner is invoked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Wait one interval, run once
    RunOnce,
    /// Run every interval until the result differs from the declared one
    RunUntilChange,
}

/// Test executed against the heartbeat store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Runner {
    /// Read-or-insert the heartbeat record, TRUE if we own it
    MasterTest,
    /// Read the heartbeat record, TRUE if anyone owns it
    SlaveTest,
}

/// Next state for each runner result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionTable {
    pub on_true: Option<StateKind>,
    pub on_false: Option<StateKind>,
    pub on_error: Option<StateKind>,
}

impl TransitionTable {
    /// Table with no transitions at all
    pub const EMPTY: TransitionTable = TransitionTable {
        on_true: None,
        on_false: None,
        on_error: None,
    };

    const fn new(on_true: StateKind, on_false: StateKind) -> Self {
        Self {
            on_true: Some(on_true),
            on_false: Some(on_false),
            on_error: Some(StateKind::Error),
        }
    }

    /// Table of a regular (non-overlay) state
    pub fn of(kind: StateKind) -> Self {
        match kind {
            // init never leads straight to master, see `Failover` docs
            StateKind::Init => Self::new(StateKind::Ticking, StateKind::Slave),
            StateKind::Master => Self::new(StateKind::Master, StateKind::Slave),
            StateKind::Slave => Self::new(StateKind::Slave, StateKind::Ticking),
            StateKind::Ticking => Self::new(StateKind::Master, StateKind::Slave),
            // assigned on entry from the state that failed
            StateKind::Error => Self::EMPTY,
        }
    }

    /// Look up the next state, `None` for an unrecognized result
    pub fn next(&self, outcome: Outcome) -> Option<StateKind> {
        match outcome {
            Outcome::True => self.on_true,
            Outcome::False => self.on_false,
            Outcome::Error => self.on_error,
        }
    }
}

/// A state as it is being driven
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateDescriptor {
    pub kind: StateKind,
    pub interval: Duration,
    pub strategy: Strategy,
    /// Result the state stands for; run-until-change waits for a different one
    pub declared: Option<Outcome>,
    pub runner: Option<Runner>,
    pub table: TransitionTable,
    /// State the error overlay was entered from
    pub origin: Option<StateKind>,
}

impl StateDescriptor {
    /// Descriptor of a regular state
    pub fn regular(kind: StateKind, intervals: &IntervalConfig) -> Self {
        let (strategy, declared, runner) = match kind {
            StateKind::Init => (Strategy::RunOnce, None, Some(Runner::MasterTest)),
            StateKind::Master => (Strategy::RunUntilChange, Some(Outcome::True), Some(Runner::MasterTest)),
            StateKind::Slave => (Strategy::RunUntilChange, Some(Outcome::True), Some(Runner::SlaveTest)),
            StateKind::Ticking => (Strategy::RunOnce, Some(Outcome::False), Some(Runner::MasterTest)),
            StateKind::Error => (Strategy::RunUntilChange, Some(Outcome::Error), None),
        };

        Self {
            kind,
            interval: intervals.for_state(kind),
            strategy,
            declared,
            runner,
            table: TransitionTable::of(kind),
            origin: None,
        }
    }

    /// Error overlay entered from `from`: keeps its runner and table
    pub fn error_overlay(from: &StateDescriptor, intervals: &IntervalConfig) -> Self {
        if from.kind == StateKind::Error {
            return *from;
        }

        Self {
            runner: from.runner,
            table: from.table,
            origin: Some(from.kind),
            ..Self::regular(StateKind::Error, intervals)
        }
    }

    /// Descriptor for the state `next` reached from `self`
    pub fn successor(&self, next: StateKind, intervals: &IntervalConfig) -> Self {
        if next == StateKind::Error {
            Self::error_overlay(self, intervals)
        } else {
            Self::regular(next, intervals)
        }
    }

    /// Whether a run-until-change invocation with this result ends the state
    pub fn settles_on(&self, outcome: Outcome) -> bool {
        match outcome {
            // a failure while already failing is not a new error entry
            Outcome::Error => self.kind != StateKind::Error,
            _ => Some(outcome) != self.declared,
        }
    }
}
