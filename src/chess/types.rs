//! Core position and move types shared by every layer of the trainer.
//!
//! A [`PositionKey`] carries only the four FEN fields that decide legality, so two
//! positions that differ only in their move counters share one key. Keys are used for
//! tablebase lookups, caching and stale-result filtering.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use shakmaty::{
    fen::{Epd, Fen},
    CastlingMode, Chess, Color, EnPassantMode,
};

// =============================================================================
// Error Types
// =============================================================================

/// Errors raised by position parsing and the rules engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RulesError {
    #[error("FEN parsing error: {0}")]
    FenParsing(String),

    #[error("Position setup error: {0}")]
    PositionSetup(String),

    #[error("UCI move parsing error: {0}")]
    UciMoveParsing(String),

    #[error("Illegal move: {0}")]
    IllegalMove(String),
}

pub type RulesResult<T> = Result<T, RulesError>;

impl From<shakmaty::fen::ParseFenError> for RulesError {
    fn from(err: shakmaty::fen::ParseFenError) -> Self {
        RulesError::FenParsing(err.to_string())
    }
}

impl From<shakmaty::PositionError<Chess>> for RulesError {
    fn from(err: shakmaty::PositionError<Chess>) -> Self {
        RulesError::PositionSetup(err.to_string())
    }
}

impl From<shakmaty::uci::ParseUciMoveError> for RulesError {
    fn from(err: shakmaty::uci::ParseUciMoveError) -> Self {
        RulesError::UciMoveParsing(err.to_string())
    }
}

impl From<shakmaty::uci::IllegalUciMoveError> for RulesError {
    fn from(err: shakmaty::uci::IllegalUciMoveError) -> Self {
        RulesError::IllegalMove(err.to_string())
    }
}

// =============================================================================
// Position Key
// =============================================================================

/// Normalized position identity: placement, side to move, castling rights and
/// en-passant target (only when en passant is actually playable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PositionKey(String);

impl PositionKey {
    /// Parse a full FEN (counters optional) and normalize it to a key.
    pub fn from_fen(fen: &str) -> RulesResult<Self> {
        let fen: Fen = fen.trim().parse()?;
        let pos: Chess = fen.into_position(CastlingMode::Standard)?;
        Ok(Self::from_position(&pos))
    }

    /// Build the key of an already validated position.
    pub fn from_position(pos: &Chess) -> Self {
        Self(Epd::from_position(pos, EnPassantMode::Legal).to_string())
    }

    /// Rebuild a playable position from the key. Counters are reset.
    pub fn to_position(&self) -> RulesResult<Chess> {
        let fen: Fen = self.to_fen().parse()?;
        Ok(fen.into_position(CastlingMode::Standard)?)
    }

    /// Full FEN with fresh move counters, as expected by external providers.
    pub fn to_fen(&self) -> String {
        format!("{} 0 1", self.0)
    }

    /// Side to move, read straight from the second field.
    pub fn turn(&self) -> Color {
        match self.0.split_whitespace().nth(1) {
            Some("b") => Color::Black,
            _ => Color::White,
        }
    }

    /// Number of pieces on the board, kings included.
    pub fn piece_count(&self) -> usize {
        self.0
            .split_whitespace()
            .next()
            .map_or(0, |placement| placement.chars().filter(char::is_ascii_alphabetic).count())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PositionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for PositionKey {
    type Err = RulesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_fen(s)
    }
}

impl TryFrom<String> for PositionKey {
    type Error = RulesError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_fen(&value)
    }
}

impl From<PositionKey> for String {
    fn from(key: PositionKey) -> Self {
        key.0
    }
}

// =============================================================================
// Move
// =============================================================================

/// A legal move as produced by the rules engine. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Move {
    pub uci: String,
    pub from: String,
    pub to: String,
    pub promotion: Option<char>,
    pub san: String,
    pub resulting_position: PositionKey,
}

impl fmt::Display for Move {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.san)
    }
}
