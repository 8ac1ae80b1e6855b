//! Evaluation value types and perspective normalization.
//!
//! Every provider reports values from the side to move in the position it was asked
//! about. Comparing a position before a move with the position after it therefore needs
//! exactly one sign flip for the "after" side. That flip lives in [`Invert`] and
//! [`to_mover_perspective`] and nowhere else.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::chess::PositionKey;

// =============================================================================
// Constants
// =============================================================================

/// Base of the centipawn-equivalent used for mate scores.
/// Must exceed any realistic centipawn magnitude.
pub const MATE_CONSTANT: i32 = 30_000;

/// Engine scores at or beyond this many centipawns count as a decisive result when no
/// tablebase data exists.
pub const ENGINE_WIN_THRESHOLD: i32 = 300;

// =============================================================================
// Perspective
// =============================================================================

/// Whose turn it was in the position an evaluation was reported for, relative to the
/// move being judged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ReportedFor {
    /// Reported for the position before the move: the mover was to move.
    BeforeMove,
    /// Reported for the position after the move: the opponent is to move.
    AfterMove,
}

/// Values whose sign depends on the side to move.
pub trait Invert {
    /// The same value seen from the other side of the board.
    fn invert(self) -> Self;
}

impl Invert for i32 {
    fn invert(self) -> Self {
        -self
    }
}

impl<T: Invert> Invert for Option<T> {
    fn invert(self) -> Self {
        self.map(Invert::invert)
    }
}

/// Re-anchor a provider value to the mover's perspective.
pub fn to_mover_perspective<T: Invert>(value: T, reported: ReportedFor) -> T {
    match reported {
        ReportedFor::BeforeMove => value,
        ReportedFor::AfterMove => value.invert(),
    }
}

// =============================================================================
// WDL and categories
// =============================================================================

/// Coarse game-theoretic result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    Win,
    Draw,
    Loss,
}

/// Tablebase WDL value in `-2..=2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "i8", into = "i8")]
pub struct Wdl(i8);

impl Wdl {
    pub const LOSS: Wdl = Wdl(-2);
    pub const BLESSED_LOSS: Wdl = Wdl(-1);
    pub const DRAW: Wdl = Wdl(0);
    pub const CURSED_WIN: Wdl = Wdl(1);
    pub const WIN: Wdl = Wdl(2);

    pub fn new(value: i8) -> Option<Self> {
        (-2..=2).contains(&value).then_some(Self(value))
    }

    /// Clamp an arbitrary integer into range.
    pub fn saturating(value: i32) -> Self {
        Self(value.clamp(-2, 2) as i8)
    }

    pub fn value(self) -> i8 {
        self.0
    }

    /// Sign bucket: any positive WDL is a win, any negative WDL a loss.
    pub fn outcome(self) -> Outcome {
        match self.0 {
            v if v > 0 => Outcome::Win,
            0 => Outcome::Draw,
            _ => Outcome::Loss,
        }
    }
}

impl Invert for Wdl {
    fn invert(self) -> Self {
        Self(-self.0)
    }
}

impl TryFrom<i8> for Wdl {
    type Error = String;

    fn try_from(value: i8) -> Result<Self, Self::Error> {
        Wdl::new(value).ok_or_else(|| format!("WDL out of range: {}", value))
    }
}

impl From<Wdl> for i8 {
    fn from(wdl: Wdl) -> Self {
        wdl.0
    }
}

impl fmt::Display for Wdl {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:+}", self.0)
    }
}

/// Tablebase category for the side to move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Category {
    Win,
    CursedWin,
    Draw,
    BlessedLoss,
    Loss,
}

impl Category {
    pub fn from_wdl(wdl: Wdl) -> Self {
        match wdl.value() {
            2 => Category::Win,
            1 => Category::CursedWin,
            0 => Category::Draw,
            -1 => Category::BlessedLoss,
            _ => Category::Loss,
        }
    }

    pub fn wdl(self) -> Wdl {
        match self {
            Category::Win => Wdl::WIN,
            Category::CursedWin => Wdl::CURSED_WIN,
            Category::Draw => Wdl::DRAW,
            Category::BlessedLoss => Wdl::BLESSED_LOSS,
            Category::Loss => Wdl::LOSS,
        }
    }

    pub fn outcome(self) -> Outcome {
        self.wdl().outcome()
    }

    /// Parse a provider category string. Returns the category and whether the provider
    /// marked it as exact. `None` means the provider has no entry.
    pub fn parse_provider(s: &str) -> Option<(Category, bool)> {
        match s {
            "win" => Some((Category::Win, true)),
            "syzygy-win" | "maybe-win" => Some((Category::Win, false)),
            "cursed-win" => Some((Category::CursedWin, true)),
            "draw" => Some((Category::Draw, true)),
            "blessed-loss" => Some((Category::BlessedLoss, true)),
            "syzygy-loss" | "maybe-loss" => Some((Category::Loss, false)),
            "loss" => Some((Category::Loss, true)),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Category::Win => "win",
            Category::CursedWin => "cursed-win",
            Category::Draw => "draw",
            Category::BlessedLoss => "blessed-loss",
            Category::Loss => "loss",
        }
    }
}

impl Invert for Category {
    fn invert(self) -> Self {
        match self {
            Category::Win => Category::Loss,
            Category::CursedWin => Category::BlessedLoss,
            Category::Draw => Category::Draw,
            Category::BlessedLoss => Category::CursedWin,
            Category::Loss => Category::Win,
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Tablebase results
// =============================================================================

/// A ranked move from a tablebase lookup.
///
/// `category`, `wdl`, `dtz` and `dtm` are reported for the position *after* the move.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TablebaseMove {
    pub uci: String,
    pub san: String,
    pub category: Category,
    pub wdl: Wdl,
    pub dtz: Option<i32>,
    pub dtm: Option<i32>,
}

impl TablebaseMove {
    /// WDL of this move from the point of view of the side playing it.
    pub fn mover_wdl(&self) -> Wdl {
        to_mover_perspective(self.wdl, ReportedFor::AfterMove)
    }

    pub fn mover_category(&self) -> Category {
        to_mover_perspective(self.category, ReportedFor::AfterMove)
    }
}

/// Tablebase verdict for one position, from the side to move.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TablebaseResult {
    pub category: Category,
    pub wdl: Wdl,
    pub dtz: Option<i32>,
    pub dtm: Option<i32>,
    pub precise: bool,
    /// Legal moves ranked best-first for the side to move.
    #[serde(default)]
    pub moves: Vec<TablebaseMove>,
}

impl TablebaseResult {
    /// Number of moves that keep a win for the side to move. `None` when the position is
    /// not won or the provider sent no move list.
    pub fn winning_move_count(&self) -> Option<usize> {
        if self.wdl.outcome() != Outcome::Win || self.moves.is_empty() {
            return None;
        }
        Some(
            self.moves
                .iter()
                .filter(|m| m.mover_wdl().outcome() == Outcome::Win)
                .count(),
        )
    }
}

// =============================================================================
// Engine evaluations
// =============================================================================

/// One engine evaluation, tagged with the position it was computed for.
/// Score and mate distance are from the side to move.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineEvaluation {
    pub position: PositionKey,
    pub score_centipawns: i32,
    pub mate_in_moves: Option<i32>,
    pub depth: u32,
    pub principal_variation: Vec<String>,
}

impl EngineEvaluation {
    /// Centipawn score with mates folded in, comparable across both kinds.
    pub fn pseudo_score(&self) -> i32 {
        match self.mate_in_moves {
            Some(mate) => mate_to_pseudo_score(mate),
            None => self.score_centipawns,
        }
    }

    /// Pseudo-WDL bucket of the engine score.
    pub fn pseudo_wdl(&self) -> Wdl {
        score_to_pseudo_wdl(self.pseudo_score())
    }
}

/// `sign(mate) * (MATE_CONSTANT - |mate|)`. Mate 0 means the side to move is mated.
pub fn mate_to_pseudo_score(mate: i32) -> i32 {
    if mate == 0 {
        return -MATE_CONSTANT;
    }
    mate.signum() * (MATE_CONSTANT - mate.saturating_abs().min(MATE_CONSTANT - 1))
}

pub fn score_to_pseudo_wdl(score: i32) -> Wdl {
    if score >= ENGINE_WIN_THRESHOLD {
        Wdl::WIN
    } else if score <= -ENGINE_WIN_THRESHOLD {
        Wdl::LOSS
    } else {
        Wdl::DRAW
    }
}
