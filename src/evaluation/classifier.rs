//! Move quality classification.
//!
//! Pure functions from a before/after evaluation pair to a verdict. All inputs are
//! expected on the mover's axis; use [`to_mover_perspective`] before building a
//! [`ClassifierInput`].

use serde::{Deserialize, Serialize};
use shakmaty::Color;

use super::types::{
    to_mover_perspective, EngineEvaluation, Outcome, ReportedFor, TablebaseResult, Wdl,
};

// =============================================================================
// Verdict types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SymbolClass {
    Excellent,
    Good,
    Neutral,
    Inaccuracy,
    Mistake,
    Blunder,
}

impl SymbolClass {
    /// Conventional annotation glyph. Neutral moves carry none.
    pub fn symbol(self) -> &'static str {
        match self {
            SymbolClass::Excellent => "!!",
            SymbolClass::Good => "!",
            SymbolClass::Neutral => "",
            SymbolClass::Inaccuracy => "?!",
            SymbolClass::Mistake => "?",
            SymbolClass::Blunder => "??",
        }
    }

    /// Verdicts that warrant stopping the user.
    pub fn is_outcome_degrading(self) -> bool {
        matches!(self, SymbolClass::Mistake | SymbolClass::Blunder)
    }
}

/// Fine-grained quality of a move that keeps (or throws away) a win.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityClass {
    Optimal,
    Safe,
    Detour,
    Risky,
    Error,
}

/// How forgiving the position was: the number of moves that kept the win.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Robustness {
    Robust,
    Precise,
    Fragile,
}

impl Robustness {
    pub fn from_winning_moves(count: usize) -> Self {
        match count {
            n if n >= 3 => Robustness::Robust,
            2 => Robustness::Precise,
            _ => Robustness::Fragile,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MoveQualityResult {
    pub symbol_class: SymbolClass,
    pub quality_class: Option<QualityClass>,
    pub robustness: Option<Robustness>,
    pub rationale: String,
    pub tablebase_based: bool,
}

/// Classifier input, already normalized to the side that made the move.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassifierInput {
    pub wdl_before: Wdl,
    pub wdl_after: Wdl,
    pub dtm_before: Option<i32>,
    pub dtm_after: Option<i32>,
    pub winning_move_count: Option<usize>,
    pub mover: Color,
}

impl ClassifierInput {
    /// Build from two tablebase results: `before` for the position the move was played
    /// in, `after` for the resulting position.
    pub fn from_tablebase(before: &TablebaseResult, after: &TablebaseResult, mover: Color) -> Self {
        Self {
            wdl_before: to_mover_perspective(before.wdl, ReportedFor::BeforeMove),
            wdl_after: to_mover_perspective(after.wdl, ReportedFor::AfterMove),
            dtm_before: to_mover_perspective(before.dtm, ReportedFor::BeforeMove),
            dtm_after: to_mover_perspective(after.dtm, ReportedFor::AfterMove),
            winning_move_count: before.winning_move_count(),
            mover,
        }
    }

    /// Build from two engine evaluations. Mate distances stand in for DTM.
    pub fn from_engine(before: &EngineEvaluation, after: &EngineEvaluation, mover: Color) -> Self {
        Self {
            wdl_before: to_mover_perspective(before.pseudo_wdl(), ReportedFor::BeforeMove),
            wdl_after: to_mover_perspective(after.pseudo_wdl(), ReportedFor::AfterMove),
            dtm_before: to_mover_perspective(before.mate_in_moves, ReportedFor::BeforeMove),
            dtm_after: to_mover_perspective(after.mate_in_moves, ReportedFor::AfterMove),
            winning_move_count: None,
            mover,
        }
    }
}

// =============================================================================
// Thresholds
// =============================================================================

const OPTIMAL_DTM_LOSS: i32 = 1;
const SAFE_DTM_LOSS: i32 = 5;
const DETOUR_DTM_LOSS: i32 = 15;

// =============================================================================
// Classification
// =============================================================================

/// Classify a tablebase-backed move.
pub fn classify(input: &ClassifierInput) -> MoveQualityResult {
    let robustness = input.winning_move_count.map(Robustness::from_winning_moves);
    let side = input.mover.fold_wb("White", "Black");
    let before = input.wdl_before;
    let after = input.wdl_after;

    let verdict = |symbol_class, quality_class, robustness, rationale: String| MoveQualityResult {
        symbol_class,
        quality_class,
        robustness,
        rationale,
        tablebase_based: true,
    };

    match (before.outcome(), after.outcome()) {
        (Outcome::Win, Outcome::Win) => {
            if after < before {
                let quality = QualityClass::Error;
                return verdict(
                    SymbolClass::Mistake,
                    Some(quality),
                    robustness,
                    format!(
                        "{} still wins on the board, but the 50-move rule now saves the \
                         defender. {}",
                        side,
                        robustness.map(|r| message(quality, r)).unwrap_or_default()
                    )
                    .trim_end()
                    .to_string(),
                );
            }
            match (input.dtm_before, input.dtm_after) {
                (Some(dtm_before), Some(dtm_after)) => {
                    let quality = quality_from_dtm(dtm_before, dtm_after);
                    let rationale = match robustness {
                        Some(r) => message(quality, r).to_string(),
                        None => coarse_message(quality).to_string(),
                    };
                    verdict(symbol_for(quality), Some(quality), robustness, rationale)
                }
                _ => verdict(
                    SymbolClass::Good,
                    None,
                    robustness,
                    format!("{} keeps the win.", side),
                ),
            }
        }
        (Outcome::Win, Outcome::Draw) => verdict(
            SymbolClass::Blunder,
            Some(QualityClass::Error),
            robustness,
            error_rationale(
                format!("{} throws away the win; the position is now drawn.", side),
                robustness,
            ),
        ),
        (Outcome::Win, Outcome::Loss) => verdict(
            SymbolClass::Blunder,
            Some(QualityClass::Error),
            robustness,
            error_rationale(format!("{} turns a won position into a lost one.", side), robustness),
        ),
        (Outcome::Draw, Outcome::Draw) => verdict(
            SymbolClass::Neutral,
            None,
            None,
            "The position stays drawn.".to_string(),
        ),
        (Outcome::Draw, Outcome::Win) => verdict(
            SymbolClass::Excellent,
            None,
            None,
            format!("{} converts a drawn position into a win.", side),
        ),
        (Outcome::Draw, Outcome::Loss) => verdict(
            SymbolClass::Mistake,
            None,
            None,
            format!("{} gives up the draw; the position is now lost.", side),
        ),
        (Outcome::Loss, Outcome::Loss) => {
            if after > before {
                verdict(
                    SymbolClass::Good,
                    None,
                    None,
                    "Still lost, but the 50-move rule may now save the game.".to_string(),
                )
            } else if after < before {
                verdict(
                    SymbolClass::Inaccuracy,
                    None,
                    None,
                    "Still lost, and the 50-move rule no longer helps.".to_string(),
                )
            } else {
                match (input.dtm_before, input.dtm_after) {
                    (Some(b), Some(a)) if a.saturating_abs() >= b.saturating_abs() - 1 => verdict(
                        SymbolClass::Good,
                        None,
                        None,
                        "The most stubborn defence: mate is delayed as long as possible."
                            .to_string(),
                    ),
                    _ => verdict(
                        SymbolClass::Neutral,
                        None,
                        None,
                        "The position remains lost.".to_string(),
                    ),
                }
            }
        }
        (Outcome::Loss, Outcome::Draw) => verdict(
            SymbolClass::Good,
            None,
            None,
            format!("{} escapes into a draw.", side),
        ),
        (Outcome::Loss, Outcome::Win) => verdict(
            SymbolClass::Excellent,
            None,
            None,
            format!("{} turns a lost position into a win.", side),
        ),
    }
}

/// Classify from engine evaluations when no tablebase data exists for both sides.
pub fn classify_engine(
    before: &EngineEvaluation,
    after: &EngineEvaluation,
    mover: Color,
) -> MoveQualityResult {
    let mut result = classify(&ClassifierInput::from_engine(before, after, mover));
    result.tablebase_based = false;
    result
}

fn quality_from_dtm(dtm_before: i32, dtm_after: i32) -> QualityClass {
    let delta = dtm_after.saturating_abs() - dtm_before.saturating_abs();
    match delta {
        d if d <= OPTIMAL_DTM_LOSS => QualityClass::Optimal,
        d if d <= SAFE_DTM_LOSS => QualityClass::Safe,
        d if d <= DETOUR_DTM_LOSS => QualityClass::Detour,
        _ => QualityClass::Risky,
    }
}

fn symbol_for(quality: QualityClass) -> SymbolClass {
    match quality {
        QualityClass::Optimal => SymbolClass::Excellent,
        QualityClass::Safe => SymbolClass::Good,
        QualityClass::Detour => SymbolClass::Neutral,
        QualityClass::Risky => SymbolClass::Inaccuracy,
        QualityClass::Error => SymbolClass::Blunder,
    }
}

fn error_rationale(lead: String, robustness: Option<Robustness>) -> String {
    match robustness {
        Some(r) => format!("{} {}", lead, message(QualityClass::Error, r)),
        None => lead,
    }
}

fn coarse_message(quality: QualityClass) -> &'static str {
    match quality {
        QualityClass::Optimal => "The fastest way to mate.",
        QualityClass::Safe => "Keeps the win with little delay.",
        QualityClass::Detour => "Keeps the win, but takes a noticeable detour.",
        QualityClass::Risky => "Keeps the win, but wastes many moves.",
        QualityClass::Error => "The win is gone.",
    }
}

/// Educational message for each quality and robustness pair.
pub fn message(quality: QualityClass, robustness: Robustness) -> &'static str {
    use QualityClass::*;
    use Robustness::*;

    match (quality, robustness) {
        (Optimal, Robust) => "Best move, though several moves win here.",
        (Optimal, Precise) => "Best move; only one other move also wins.",
        (Optimal, Fragile) => "The only move that keeps the win. Well found!",
        (Safe, Robust) => "A safe winning move among many.",
        (Safe, Precise) => "Keeps the win in a position with little margin for error.",
        (Safe, Fragile) => "Keeps the win where almost every move fails.",
        (Detour, Robust) => "Still winning, but there were many faster paths.",
        (Detour, Precise) => "Still winning, though the direct route was shorter.",
        (Detour, Fragile) => "Found a winning path the hard way; the direct one was faster.",
        (Risky, Robust) => "Winning, but this wastes a lot of time with easy wins available.",
        (Risky, Precise) => "Winning, but much slower; watch the 50-move rule.",
        (Risky, Fragile) => "Barely keeps the win; the 50-move rule is getting close.",
        (Error, Robust) => "Most moves would have kept the win.",
        (Error, Precise) => "Only two moves kept the win here.",
        (Error, Fragile) => "Only one move kept the win here.",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chess::PositionKey;

    fn input(before: i8, after: i8) -> ClassifierInput {
        ClassifierInput {
            wdl_before: Wdl::new(before).unwrap(),
            wdl_after: Wdl::new(after).unwrap(),
            dtm_before: None,
            dtm_after: None,
            winning_move_count: None,
            mover: Color::White,
        }
    }

    #[test]
    fn test_classifier_is_total() {
        let dtms = [None, Some(i32::MIN), Some(-40), Some(-1), Some(0), Some(3), Some(i32::MAX)];
        let counts = [None, Some(0), Some(1), Some(2), Some(7)];
        for before in -2..=2 {
            for after in -2..=2 {
                for dtm_before in dtms {
                    for dtm_after in dtms {
                        for count in counts {
                            let result = classify(&ClassifierInput {
                                dtm_before,
                                dtm_after,
                                winning_move_count: count,
                                ..input(before, after)
                            });
                            assert!(result.tablebase_based);
                            assert!(!result.rationale.is_empty());
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_coarse_table() {
        assert_eq!(classify(&input(2, 0)).symbol_class, SymbolClass::Blunder);
        assert_eq!(classify(&input(2, -2)).symbol_class, SymbolClass::Blunder);
        assert_eq!(classify(&input(0, 0)).symbol_class, SymbolClass::Neutral);
        assert_eq!(classify(&input(0, 2)).symbol_class, SymbolClass::Excellent);
        assert_eq!(classify(&input(0, -2)).symbol_class, SymbolClass::Mistake);
        assert_eq!(classify(&input(-2, -1)).symbol_class, SymbolClass::Good);
        assert_eq!(classify(&input(-1, -2)).symbol_class, SymbolClass::Inaccuracy);
        assert_eq!(classify(&input(-2, 0)).symbol_class, SymbolClass::Good);
        assert_eq!(classify(&input(-2, 2)).symbol_class, SymbolClass::Excellent);
        assert_eq!(classify(&input(-2, -2)).symbol_class, SymbolClass::Neutral);
    }

    #[test]
    fn test_win_to_win_by_dtm() {
        let with_dtm = |b, a| ClassifierInput {
            dtm_before: Some(b),
            dtm_after: Some(a),
            ..input(2, 2)
        };
        assert_eq!(classify(&with_dtm(10, 11)).quality_class, Some(QualityClass::Optimal));
        assert_eq!(classify(&with_dtm(10, 9)).quality_class, Some(QualityClass::Optimal));
        assert_eq!(classify(&with_dtm(10, 15)).quality_class, Some(QualityClass::Safe));
        assert_eq!(classify(&with_dtm(10, 25)).quality_class, Some(QualityClass::Detour));
        assert_eq!(classify(&with_dtm(10, 26)).quality_class, Some(QualityClass::Risky));
        assert_eq!(classify(&with_dtm(10, 26)).symbol_class, SymbolClass::Inaccuracy);
        // Sign of the stored DTM does not matter.
        assert_eq!(classify(&with_dtm(-10, -11)).quality_class, Some(QualityClass::Optimal));
    }

    #[test]
    fn test_robustness_and_messages() {
        let result = classify(&ClassifierInput {
            dtm_before: Some(19),
            dtm_after: Some(18),
            winning_move_count: Some(1),
            ..input(2, 2)
        });
        assert_eq!(result.symbol_class, SymbolClass::Excellent);
        assert_eq!(result.robustness, Some(Robustness::Fragile));
        assert_eq!(result.rationale, message(QualityClass::Optimal, Robustness::Fragile));

        assert_eq!(Robustness::from_winning_moves(0), Robustness::Fragile);
        assert_eq!(Robustness::from_winning_moves(2), Robustness::Precise);
        assert_eq!(Robustness::from_winning_moves(3), Robustness::Robust);
    }

    #[test]
    fn test_missing_dtm_degrades_to_coarse() {
        let result = classify(&ClassifierInput { dtm_before: Some(12), ..input(2, 2) });
        assert_eq!(result.symbol_class, SymbolClass::Good);
        assert_eq!(result.quality_class, None);
        assert_eq!(result.robustness, None);
    }

    #[test]
    fn test_cursed_win_is_a_mistake() {
        let result = classify(&input(2, 1));
        assert_eq!(result.symbol_class, SymbolClass::Mistake);
        assert!(result.symbol_class.is_outcome_degrading());
        // A cursed win that stays cursed is fine.
        assert!(!classify(&input(1, 1)).symbol_class.is_outcome_degrading());
    }

    #[test]
    fn test_stubborn_defence() {
        let result = classify(&ClassifierInput {
            dtm_before: Some(-20),
            dtm_after: Some(-19),
            ..input(-2, -2)
        });
        assert_eq!(result.symbol_class, SymbolClass::Good);

        let hasty = classify(&ClassifierInput {
            dtm_before: Some(-20),
            dtm_after: Some(-8),
            ..input(-2, -2)
        });
        assert_eq!(hasty.symbol_class, SymbolClass::Neutral);
    }

    #[test]
    fn test_engine_fallback() {
        let key = PositionKey::from_fen("4k3/8/4K3/4P3/8/8/8/8 w - - 0 1").unwrap();
        let eval = |cp, mate| EngineEvaluation {
            position: key.clone(),
            score_centipawns: cp,
            mate_in_moves: mate,
            depth: 20,
            principal_variation: vec![],
        };

        // +5.0 for the mover, then the opponent sees -0.1: the advantage is gone.
        let result = classify_engine(&eval(500, None), &eval(10, None), Color::White);
        assert!(!result.tablebase_based);
        assert_eq!(result.symbol_class, SymbolClass::Blunder);

        // Mate in 10 for the mover, then the opponent is mated in 9.
        let result = classify_engine(&eval(0, Some(10)), &eval(0, Some(-9)), Color::White);
        assert_eq!(result.quality_class, Some(QualityClass::Optimal));
    }

    #[test]
    fn test_symbols() {
        assert_eq!(SymbolClass::Excellent.symbol(), "!!");
        assert_eq!(SymbolClass::Neutral.symbol(), "");
        assert_eq!(SymbolClass::Blunder.symbol(), "??");
        assert!(!SymbolClass::Inaccuracy.is_outcome_degrading());
    }
}
