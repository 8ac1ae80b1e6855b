//! Training session state machine.
//!
//! [`SessionController`] is the single writer of the move history. Validation runs
//! without holding the session lock; a generation counter detects history changes that
//! happened meanwhile, and such stale validations are dropped as `Superseded`.

use std::sync::{
    atomic::{AtomicBool, AtomicU64, Ordering},
    Arc,
};

use log::{debug, info};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use uuid::Uuid;

use crate::aggregator::{AggregatedEvaluation, EvaluationAggregator};
use crate::chess::{Move, PositionKey, RulesEngine, RulesResult};
use crate::config::ValidationConfig;
use crate::evaluation::MoveQualityResult;
use crate::validator::{InterceptionState, OutcomeValidator, ValidationOutcome};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("No interception is pending")]
    NoPendingInterception,

    #[error("Ply {index} is out of range (history has {len} moves)")]
    OutOfRange { index: usize, len: usize },
}

pub type SessionResult<T> = Result<T, SessionError>;

// =============================================================================
// Session data
// =============================================================================

/// A committed move and the verdict it was committed with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub played: Move,
    pub verdict: Option<MoveQualityResult>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrainingSession {
    pub id: Uuid,
    pub initial_position: PositionKey,
    /// Index is the ply.
    pub move_history: Vec<HistoryEntry>,
    /// `None` is the initial position.
    pub current_move_index: Option<usize>,
    pub pending_interception: Option<InterceptionState>,
}

impl TrainingSession {
    pub fn new(initial_position: PositionKey) -> Self {
        Self {
            id: Uuid::new_v4(),
            initial_position,
            move_history: Vec::new(),
            current_move_index: None,
            pending_interception: None,
        }
    }

    pub fn current_position(&self) -> &PositionKey {
        match self.current_move_index.and_then(|i| self.move_history.get(i)) {
            Some(entry) => &entry.played.resulting_position,
            None => &self.initial_position,
        }
    }

    pub fn is_at_end(&self) -> bool {
        self.current_move_index.map_or(0, |i| i + 1) == self.move_history.len()
    }

    /// Drop everything after the current ply, then append. Returns the new ply.
    fn commit(&mut self, played: Move, verdict: Option<MoveQualityResult>) -> usize {
        let keep = self.current_move_index.map_or(0, |i| i + 1);
        if keep < self.move_history.len() {
            debug!("Truncating history from {} to {} plies", self.move_history.len(), keep);
            self.move_history.truncate(keep);
        }
        self.move_history.push(HistoryEntry { played, verdict });
        let ply = self.move_history.len() - 1;
        self.current_move_index = Some(ply);
        ply
    }

    fn last_index(&self) -> Option<usize> {
        self.move_history.len().checked_sub(1)
    }
}

/// Result of submitting a candidate move.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Committed {
        ply: usize,
        verdict: Option<MoveQualityResult>,
    },
    Intercepted(InterceptionState),
    /// Rejected by the rules engine; never validated.
    Illegal(String),
    /// An interception is pending or another validation is running.
    Busy,
    /// The history changed while the move was being validated.
    Superseded,
}

/// Clears the in-flight flag when dropped.
struct InFlight<'a>(&'a AtomicBool);

impl<'a> InFlight<'a> {
    fn try_acquire(flag: &'a AtomicBool) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| Self(flag))
    }
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

// =============================================================================
// Controller
// =============================================================================

pub struct SessionController {
    rules: Arc<dyn RulesEngine>,
    aggregator: Arc<EvaluationAggregator>,
    validator: OutcomeValidator,
    session: Mutex<TrainingSession>,
    validating: AtomicBool,
    generation: AtomicU64,
}

impl SessionController {
    pub async fn new(
        rules: Arc<dyn RulesEngine>,
        aggregator: Arc<EvaluationAggregator>,
        config: ValidationConfig,
        initial_position: PositionKey,
    ) -> Self {
        aggregator.set_position(initial_position.clone()).await;
        let session = TrainingSession::new(initial_position);
        info!("Training session {} started at {}", session.id, session.initial_position);

        Self {
            rules,
            validator: OutcomeValidator::new(aggregator.clone(), config),
            aggregator,
            session: Mutex::new(session),
            validating: AtomicBool::new(false),
            generation: AtomicU64::new(0),
        }
    }

    /// Validate and apply a UCI move from the current position.
    pub async fn submit_move(&self, uci: &str) -> SubmitOutcome {
        let Some(_in_flight) = InFlight::try_acquire(&self.validating) else {
            debug!("Rejecting {}: validation in flight", uci);
            return SubmitOutcome::Busy;
        };

        let (before, generation) = {
            let session = self.session.lock().await;
            if session.pending_interception.is_some() {
                debug!("Rejecting {}: interception pending", uci);
                return SubmitOutcome::Busy;
            }
            (session.current_position().clone(), self.generation.load(Ordering::Acquire))
        };

        let candidate = match self.rules.apply_move(&before, uci) {
            Ok(candidate) => candidate,
            Err(e) => return SubmitOutcome::Illegal(e.to_string()),
        };

        let outcome = self.validator.validate(&before, &candidate).await;

        let mut session = self.session.lock().await;
        if self.generation.load(Ordering::Acquire) != generation {
            info!("Discarding validation of {}: history changed", candidate);
            self.validator.resolve();
            return SubmitOutcome::Superseded;
        }

        match outcome {
            ValidationOutcome::Commit { verdict } => {
                let next = candidate.resulting_position.clone();
                let ply = session.commit(candidate, verdict.clone());
                self.bump_generation();
                self.aggregator.set_position(next).await;
                self.validator.resolve();
                SubmitOutcome::Committed { ply, verdict }
            }
            ValidationOutcome::Intercept(interception) => {
                session.pending_interception = Some(interception.clone());
                SubmitOutcome::Intercepted(interception)
            }
        }
    }

    /// Remove the last committed move. Returns it, or `None` on an empty history.
    pub async fn undo(&self) -> Option<Move> {
        let mut session = self.session.lock().await;
        let removed = session.move_history.pop()?.played;
        if session.current_move_index.is_some_and(|i| i >= session.move_history.len()) {
            session.current_move_index = session.last_index();
        }
        debug!("Undid {}", removed);
        self.after_navigation(&mut session).await;
        Some(removed)
    }

    /// Point the board at `index` (`None` for the initial position). History is untouched.
    pub async fn go_to_move(&self, index: Option<usize>) -> SessionResult<()> {
        let mut session = self.session.lock().await;
        if let Some(index) = index {
            let len = session.move_history.len();
            if index >= len {
                return Err(SessionError::OutOfRange { index, len });
            }
        }
        session.current_move_index = index;
        self.after_navigation(&mut session).await;
        Ok(())
    }

    /// Clear the history and return to the initial position.
    pub async fn reset(&self) {
        let mut session = self.session.lock().await;
        session.move_history.clear();
        session.current_move_index = None;
        self.after_navigation(&mut session).await;
    }

    /// Discard the intercepted move.
    pub async fn take_back(&self) -> SessionResult<Move> {
        let mut session = self.session.lock().await;
        let interception = session
            .pending_interception
            .take()
            .ok_or(SessionError::NoPendingInterception)?;
        self.validator.resolve();
        debug!("Took back {}", interception.rejected_move);
        Ok(interception.rejected_move)
    }

    /// Resolve the interception by starting over from the initial position.
    pub async fn restart(&self) -> SessionResult<()> {
        let mut session = self.session.lock().await;
        if session.pending_interception.is_none() {
            return Err(SessionError::NoPendingInterception);
        }
        session.move_history.clear();
        session.current_move_index = None;
        self.after_navigation(&mut session).await;
        Ok(())
    }

    /// Commit the intercepted move anyway. Returns its ply.
    pub async fn accept_anyway(&self) -> SessionResult<usize> {
        let mut session = self.session.lock().await;
        let interception = session
            .pending_interception
            .take()
            .ok_or(SessionError::NoPendingInterception)?;

        info!("Accepted {} despite interception", interception.rejected_move);
        let next = interception.rejected_move.resulting_position.clone();
        let ply = session.commit(interception.rejected_move, Some(interception.verdict));
        self.bump_generation();
        self.aggregator.set_position(next).await;
        self.validator.resolve();
        Ok(ply)
    }

    /// Replace the session with a fresh one at `fen`.
    pub async fn load_position(&self, fen: &str) -> RulesResult<Uuid> {
        let position = PositionKey::from_fen(fen)?;
        let mut session = self.session.lock().await;
        *session = TrainingSession::new(position);
        self.aggregator.clear_engine_cache();
        info!("Training session {} started at {}", session.id, session.initial_position);
        self.after_navigation(&mut session).await;
        Ok(session.id)
    }

    pub async fn snapshot(&self) -> TrainingSession {
        self.session.lock().await.clone()
    }

    pub async fn pending_interception(&self) -> Option<InterceptionState> {
        self.session.lock().await.pending_interception.clone()
    }

    pub fn evaluation(&self) -> Option<AggregatedEvaluation> {
        self.aggregator.current()
    }

    pub fn subscribe_evaluation(&self) -> watch::Receiver<Option<AggregatedEvaluation>> {
        self.aggregator.subscribe()
    }

    pub fn legal_moves(&self, position: &PositionKey) -> RulesResult<Vec<Move>> {
        self.rules.legal_moves(position)
    }

    fn bump_generation(&self) {
        self.generation.fetch_add(1, Ordering::AcqRel);
    }

    /// The board moved: drop any pending interception, invalidate in-flight
    /// validations and move the aggregator.
    async fn after_navigation(&self, session: &mut TrainingSession) {
        session.pending_interception = None;
        self.bump_generation();
        self.validator.resolve();
        self.aggregator.set_position(session.current_position().clone()).await;
    }
}
