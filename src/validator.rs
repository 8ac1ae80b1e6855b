//! Outcome validator.
//!
//! Decides whether a legal candidate move is committed or intercepted. Only a
//! tablebase-backed verdict on both sides can intercept; missing coverage, timeouts and
//! provider errors always commit.

use std::sync::Arc;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::aggregator::EvaluationAggregator;
use crate::chess::{Move, PositionKey};
use crate::config::ValidationConfig;
use crate::evaluation::{
    classify, classify_engine, ClassifierInput, MoveQualityResult, TablebaseMove, Wdl,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ValidatorState {
    Idle,
    Evaluating,
    Commit,
    Intercepted,
}

/// An outcome-degrading move waiting for the user's decision.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InterceptionState {
    /// Mover's WDL before the move.
    pub wdl_before: Wdl,
    /// Mover's WDL after the move.
    pub wdl_after: Wdl,
    pub best_alternative_move: Option<TablebaseMove>,
    /// Further alternatives, best first, never including the rejected move.
    pub alternatives: Vec<TablebaseMove>,
    pub rejected_move: Move,
    pub verdict: MoveQualityResult,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationOutcome {
    /// Append the move. `verdict` is `None` when no provider covered both sides.
    Commit { verdict: Option<MoveQualityResult> },
    Intercept(InterceptionState),
}

pub struct OutcomeValidator {
    aggregator: Arc<EvaluationAggregator>,
    config: ValidationConfig,
    state: watch::Sender<ValidatorState>,
}

impl OutcomeValidator {
    pub fn new(aggregator: Arc<EvaluationAggregator>, config: ValidationConfig) -> Self {
        let (state, _) = watch::channel(ValidatorState::Idle);
        Self {
            aggregator,
            config,
            state,
        }
    }

    pub fn state(&self) -> ValidatorState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ValidatorState> {
        self.state.subscribe()
    }

    /// Judge `candidate`, played from `before`.
    pub async fn validate(&self, before: &PositionKey, candidate: &Move) -> ValidationOutcome {
        self.state.send_replace(ValidatorState::Evaluating);
        let timeout = self.config.evaluation_timeout();
        let mover = before.turn();

        let (eval_before, eval_after) = tokio::join!(
            self.aggregator.evaluate(before, timeout),
            self.aggregator.evaluate(&candidate.resulting_position, timeout),
        );

        let outcome = match (eval_before.tablebase_result(), eval_after.tablebase_result()) {
            (Some(tb_before), Some(tb_after)) => {
                let input = ClassifierInput::from_tablebase(tb_before, tb_after, mover);
                let verdict = classify(&input);
                debug!(
                    "{} classified {:?} ({} -> {})",
                    candidate, verdict.symbol_class, input.wdl_before, input.wdl_after
                );

                if verdict.symbol_class.is_outcome_degrading() {
                    let alternatives = self.alternatives(before, candidate).await;
                    info!("Intercepted {}: {}", candidate, verdict.rationale);
                    ValidationOutcome::Intercept(InterceptionState {
                        wdl_before: input.wdl_before,
                        wdl_after: input.wdl_after,
                        best_alternative_move: alternatives.first().cloned(),
                        alternatives,
                        rejected_move: candidate.clone(),
                        verdict,
                    })
                } else {
                    ValidationOutcome::Commit { verdict: Some(verdict) }
                }
            }
            _ => match (&eval_before.engine, &eval_after.engine) {
                (Some(engine_before), Some(engine_after)) => ValidationOutcome::Commit {
                    verdict: Some(classify_engine(engine_before, engine_after, mover)),
                },
                _ => {
                    debug!("No coverage for {}, committing without verdict", candidate);
                    ValidationOutcome::Commit { verdict: None }
                }
            },
        };

        self.state.send_replace(match outcome {
            ValidationOutcome::Commit { .. } => ValidatorState::Commit,
            ValidationOutcome::Intercept(_) => ValidatorState::Intercepted,
        });
        outcome
    }

    /// Return to `Idle` once the outcome has been applied or the interception resolved.
    pub fn resolve(&self) {
        self.state.send_replace(ValidatorState::Idle);
    }

    async fn alternatives(&self, before: &PositionKey, rejected: &Move) -> Vec<TablebaseMove> {
        let wanted = self.config.top_moves.max(1);
        let lookup = self.aggregator.top_moves(before, wanted + 1);

        match tokio::time::timeout(self.config.evaluation_timeout(), lookup).await {
            Ok(Ok(moves)) => moves
                .into_iter()
                .filter(|m| m.uci != rejected.uci)
                .take(wanted)
                .collect(),
            Ok(Err(e)) => {
                warn!("Could not fetch alternatives for {}: {}", before, e);
                Vec::new()
            }
            Err(_) => {
                warn!("Fetching alternatives for {} timed out", before);
                Vec::new()
            }
        }
    }
}
