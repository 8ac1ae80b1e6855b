//! Endgame trainer core: move validation against a tablebase, dual-source evaluation
//! and the training session state machine.

pub mod aggregator;
pub mod chess;
pub mod config;
pub mod engine;
pub mod error;
pub mod evaluation;
pub mod session;
pub mod tablebase;
pub mod validator;

#[cfg(test)]
pub(crate) mod test_support;

use std::sync::Arc;

use log::{info, warn};

pub use aggregator::{AggregatedEvaluation, EvaluationAggregator, EvaluationView, TablebaseState};
pub use chess::{Move, PositionKey, RulesEngine, StandardRules};
pub use config::TrainerConfig;
pub use error::{TrainerError, TrainerResult};
pub use session::{SessionController, SessionError, SubmitOutcome, TrainingSession};
pub use validator::{InterceptionState, OutcomeValidator, ValidationOutcome, ValidatorState};

use engine::{EngineAnalysisService, UciEngineService};
use tablebase::LichessTablebase;

// ============================================================================
// APPLICATION WIRING
// ============================================================================

/// A session controller wired to the production providers.
pub struct Trainer {
    pub controller: SessionController,
    engine: Option<Arc<UciEngineService>>,
}

impl Trainer {
    /// Build providers from `config` and open a session at `fen`.
    ///
    /// An engine that fails to start is logged and skipped; the trainer then runs on
    /// tablebase data alone.
    pub async fn start(config: &TrainerConfig, fen: &str) -> TrainerResult<Self> {
        let initial = PositionKey::from_fen(fen)?;
        let tablebase = Arc::new(LichessTablebase::new(&config.tablebase)?);

        let engine = match &config.engine.path {
            Some(_) => match UciEngineService::spawn(&config.engine).await {
                Ok(engine) => Some(Arc::new(engine)),
                Err(e) => {
                    warn!("Engine unavailable, continuing without it: {}", e);
                    None
                }
            },
            None => {
                info!("No engine configured");
                None
            }
        };

        let aggregator = Arc::new(EvaluationAggregator::new(
            tablebase,
            engine.clone().map(|e| e as Arc<dyn EngineAnalysisService>),
            config.tablebase.clone(),
        ));
        let controller = SessionController::new(
            Arc::new(StandardRules::new()),
            aggregator,
            config.validation.clone(),
            initial,
        )
        .await;

        Ok(Self { controller, engine })
    }

    pub async fn shutdown(&self) {
        if let Some(engine) = &self.engine {
            engine.shutdown().await;
        }
    }
}
