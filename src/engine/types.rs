use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::chess::PositionKey;

// =============================================================================
// Constants
// =============================================================================

/// Timeout for the `uci` / `isready` handshake
pub const ENGINE_INIT_TIMEOUT: Duration = Duration::from_secs(10);

/// Grace period between `quit` and a forced kill
pub const ENGINE_QUIT_GRACE: Duration = Duration::from_millis(100);

/// Capacity of the worker command queue
pub const COMMAND_CHANNEL_CAPACITY: usize = 32;

/// Capacity of the evaluation broadcast; slow subscribers skip older evaluations
pub const EVALUATION_CHANNEL_CAPACITY: usize = 64;

// =============================================================================
// Error Types
// =============================================================================

/// Errors raised while driving a UCI engine
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Engine initialization timeout")]
    InitTimeout,

    #[error("No engine path configured")]
    NoEnginePath,

    #[error("No stdin handle available")]
    NoStdin,

    #[error("No stdout handle available")]
    NoStdout,

    #[error("Invalid state transition: from {from:?} to {to:?}")]
    InvalidTransition { from: EngineState, to: EngineState },

    #[error("Broken pipe")]
    BrokenPipe,

    #[error("Engine closed its output during initialization")]
    UnexpectedEof,

    #[error("Engine worker has stopped")]
    WorkerStopped,
}

pub type EngineResult<T> = Result<T, EngineError>;

// =============================================================================
// Core Engine Types
// =============================================================================

/// Engine operational states
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineState {
    /// Engine is ready to receive commands
    Idle,
    /// Engine is searching a position
    Analyzing,
    /// `stop` was sent, waiting for `bestmove`
    Stopping,
    /// Engine process has been terminated
    Terminated,
}

/// Commands accepted by the engine worker
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCommand {
    /// Abandon the current search (if any) and analyze this position
    Analyze(PositionKey),
    /// Stop searching without starting anything new
    Stop,
    /// Stop and terminate the engine process
    Quit,
}
