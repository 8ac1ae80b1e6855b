// =============================================================================
// Engine Analysis Module
// =============================================================================
//
// One persistent UCI engine, driven by a worker task.
//
// ```
// ┌──────────────────┐  Analyze/Stop/Quit  ┌──────────────────┐
// │ UciEngineService │────────────────────▶│      Worker      │
// │    (service)     │◀────────────────────│ (SearchScheduler)│
// └──────────────────┘  EngineEvaluation   └──────────────────┘
//                         (broadcast)          │          │
//                          ┌──────────────────┐ ┌──────────────────┐
//                          │     Process      │ │  Communication   │
//                          │  (stdin, state)  │ │ (stdout, parse)  │
//                          └──────────────────┘ └──────────────────┘
// ```
//
// - **types**: constants, errors, states and worker commands
// - **process**: spawning, UCI handshake, search/stop commands, termination
// - **communication**: stdout reading and `info`/`bestmove` parsing
// - **service**: the `EngineAnalysisService` seam and its UCI implementation

pub mod communication;
pub mod process;
pub mod service;
pub mod types;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use communication::{parse_info_line, UciCommunicator};
pub use process::EngineProcess;
pub use service::{EngineAnalysisService, SearchAction, SearchScheduler, UciEngineService};
pub use types::{EngineCommand, EngineError, EngineResult, EngineState};
