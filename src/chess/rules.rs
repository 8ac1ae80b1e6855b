//! Rules engine seam.
//!
//! Move generation and legality are delegated to `shakmaty`. The rest of the trainer only
//! talks to the [`RulesEngine`] trait so that session logic never depends on a concrete
//! chess library.

use log::{debug, trace};
use shakmaty::{san::SanPlus, uci::UciMove, Chess, Position};

use super::types::{Move, PositionKey, RulesError, RulesResult};

/// Legal move generation and move application.
pub trait RulesEngine: Send + Sync {
    /// All legal moves in the position, in generation order.
    fn legal_moves(&self, position: &PositionKey) -> RulesResult<Vec<Move>>;

    /// Apply a UCI move (`e2e4`, `e7e8q`) and describe the result.
    ///
    /// Returns `RulesError::IllegalMove` or `RulesError::UciMoveParsing` when the move
    /// cannot be played.
    fn apply_move(&self, position: &PositionKey, uci: &str) -> RulesResult<Move>;
}

/// Standard chess rules backed by `shakmaty`.
#[derive(Debug, Default, Clone, Copy)]
pub struct StandardRules;

impl StandardRules {
    pub fn new() -> Self {
        Self
    }

    fn describe(pos: &Chess, m: shakmaty::Move) -> Move {
        let uci = UciMove::from_standard(m).to_string();
        let mut after = pos.clone();
        let san = SanPlus::from_move_and_play_unchecked(&mut after, m);

        Move {
            from: m.from().map(|sq| sq.to_string()).unwrap_or_default(),
            to: m.to().to_string(),
            promotion: m.promotion().map(|role| role.char()),
            san: san.to_string(),
            resulting_position: PositionKey::from_position(&after),
            uci,
        }
    }
}

impl RulesEngine for StandardRules {
    fn legal_moves(&self, position: &PositionKey) -> RulesResult<Vec<Move>> {
        let pos = position.to_position()?;
        let moves: Vec<Move> = pos
            .legal_moves()
            .iter()
            .map(|m| Self::describe(&pos, *m))
            .collect();

        trace!("{} legal moves in {}", moves.len(), position);
        Ok(moves)
    }

    fn apply_move(&self, position: &PositionKey, uci: &str) -> RulesResult<Move> {
        let pos = position.to_position()?;
        let parsed = UciMove::from_ascii(uci.trim().as_bytes())?;
        let m = parsed.to_move(&pos).map_err(|e| {
            debug!("Rejected move {} in {}: {}", uci, position, e);
            RulesError::IllegalMove(uci.trim().to_string())
        })?;

        Ok(Self::describe(&pos, m))
    }
}
