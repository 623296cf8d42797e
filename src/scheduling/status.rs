//! Lifecycle status shared by clients and processors.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Lifecycle of a running program.
///
/// `Initialized → Starting → Idle ⇄ Processing → ShuttingDown → ShutDown`,
/// with `NotResponding` reachable from every non-terminal state and
/// recovering to `Idle`, or to `Processing` when work is still assigned.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessorStatus {
    #[default]
    Initialized,
    Starting,
    Idle,
    Processing,
    ShuttingDown,
    ShutDown,
    NotResponding,
}

/// Clients follow the same lifecycle as processors.
pub type ClientStatus = ProcessorStatus;

impl ProcessorStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProcessorStatus::ShutDown)
    }

    /// Whether work may be routed to a program in this state.
    pub fn is_available(&self) -> bool {
        matches!(self, ProcessorStatus::Idle | ProcessorStatus::Processing)
    }

    pub fn can_transition_to(&self, next: ProcessorStatus) -> bool {
        use ProcessorStatus::*;

        if *self == next {
            return true;
        }
        match (self, next) {
            (ShutDown, _) => false,
            (_, NotResponding) => true,
            (_, ShuttingDown) => true,
            (Initialized, Starting) => true,
            (Starting, Idle) => true,
            (Idle, Processing) | (Processing, Idle) => true,
            (NotResponding, Idle) | (NotResponding, Processing) => true,
            (ShuttingDown, ShutDown) => true,
            // A process that exits on its own skips the shutdown request.
            (_, ShutDown) => true,
            _ => false,
        }
    }
}

impl fmt::Display for ProcessorStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ProcessorStatus::Initialized => "initialized",
            ProcessorStatus::Starting => "starting",
            ProcessorStatus::Idle => "idle",
            ProcessorStatus::Processing => "processing",
            ProcessorStatus::ShuttingDown => "shutting_down",
            ProcessorStatus::ShutDown => "shut_down",
            ProcessorStatus::NotResponding => "not_responding",
        };
        f.write_str(name)
    }
}
