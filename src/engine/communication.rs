use log::{error, trace, warn};
use tokio::{
    io::{BufReader, Lines},
    process::ChildStdout,
};
use vampirc_uci::{parse_one, UciInfoAttribute, UciMessage};

use super::types::{EngineError, EngineResult};
use crate::chess::PositionKey;
use crate::evaluation::{types::mate_to_pseudo_score, EngineEvaluation};

/// Reads engine stdout line by line.
#[derive(Debug)]
pub struct UciCommunicator {
    reader: Lines<BufReader<ChildStdout>>,
}

impl UciCommunicator {
    pub fn new(reader: Lines<BufReader<ChildStdout>>) -> Self {
        Self { reader }
    }

    /// Next line from the engine. `Ok(None)` once stdout is closed.
    /// Cancel safe, so it can sit in a `select!` loop.
    pub async fn next_line(&mut self) -> EngineResult<Option<String>> {
        match self.reader.next_line().await {
            Ok(line) => Ok(line),
            Err(e) => {
                error!("Error reading from engine stdout: {}", e);
                match e.kind() {
                    std::io::ErrorKind::BrokenPipe
                    | std::io::ErrorKind::ConnectionAborted
                    | std::io::ErrorKind::ConnectionReset
                    | std::io::ErrorKind::UnexpectedEof => {
                        warn!("Engine output closed unexpectedly: {:?}", e.kind());
                        Err(EngineError::BrokenPipe)
                    }
                    _ => Err(EngineError::Io(e)),
                }
            }
        }
    }

    /// Parse a UCI message from a line
    pub fn parse_message(&self, line: &str) -> UciMessage {
        parse_one(line)
    }
}

/// `bestmove`, including the `bestmove (none)` form sent from mated or stalemated
/// positions, which the parser does not accept as a move.
pub fn is_bestmove(message: &UciMessage) -> bool {
    match message {
        UciMessage::BestMove { .. } => true,
        UciMessage::Unknown(line, _) => line.trim_start().starts_with("bestmove"),
        _ => false,
    }
}

/// Turn the attributes of an `info` message into an evaluation of `position`.
///
/// Lines without a score or depth, bound scores and secondary MultiPV lines are skipped.
pub fn parse_info_attributes(
    attrs: Vec<UciInfoAttribute>,
    position: &PositionKey,
) -> Option<EngineEvaluation> {
    let mut depth = None;
    let mut score = None;
    let mut principal_variation = Vec::new();

    for attr in attrs {
        match attr {
            UciInfoAttribute::Depth(d) => depth = Some(u32::from(d)),
            UciInfoAttribute::MultiPv(n) if n > 1 => {
                trace!("Skipping secondary line {}", n);
                return None;
            }
            UciInfoAttribute::Score {
                cp,
                mate,
                lower_bound,
                upper_bound,
            } => {
                if lower_bound.unwrap_or(false) || upper_bound.unwrap_or(false) {
                    trace!("Skipping bound score");
                    return None;
                }
                score = match (mate, cp) {
                    (Some(mate), _) => {
                        let mate = i32::from(mate);
                        Some((mate_to_pseudo_score(mate), Some(mate)))
                    }
                    (None, Some(cp)) => Some((cp, None)),
                    (None, None) => None,
                };
            }
            UciInfoAttribute::Pv(moves) => {
                principal_variation = moves.iter().map(|m| m.to_string()).collect();
            }
            _ => {}
        }
    }

    let depth = depth?;
    let (score_centipawns, mate_in_moves) = score?;

    Some(EngineEvaluation {
        position: position.clone(),
        score_centipawns,
        mate_in_moves,
        depth,
        principal_variation,
    })
}

/// Parse one line of engine output as an evaluation of `position`.
pub fn parse_info_line(line: &str, position: &PositionKey) -> Option<EngineEvaluation> {
    match parse_one(line) {
        UciMessage::Info(attrs) => parse_info_attributes(attrs, position),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluation::MATE_CONSTANT;

    fn key() -> PositionKey {
        PositionKey::from_fen("4k3/8/4K3/4P3/8/8/8/8 w - - 0 1").unwrap()
    }

    #[test]
    fn test_parse_centipawn_info() {
        let line = "info depth 24 seldepth 30 multipv 1 score cp 512 nodes 123456 nps 1000000 \
                    time 120 pv e6d6 e8d8 e5e6";
        let eval = parse_info_line(line, &key()).unwrap();
        assert_eq!(eval.depth, 24);
        assert_eq!(eval.score_centipawns, 512);
        assert_eq!(eval.mate_in_moves, None);
        assert_eq!(eval.principal_variation, vec!["e6d6", "e8d8", "e5e6"]);
        assert_eq!(eval.position, key());
    }

    #[test]
    fn test_parse_mate_info() {
        let eval = parse_info_line("info depth 30 score mate -4 pv e8d8", &key()).unwrap();
        assert_eq!(eval.mate_in_moves, Some(-4));
        assert_eq!(eval.score_centipawns, -(MATE_CONSTANT - 4));
        assert_eq!(eval.pseudo_score(), -(MATE_CONSTANT - 4));
    }

    #[test]
    fn test_skipped_lines() {
        let k = key();
        assert!(parse_info_line("info depth 10 score cp 30 lowerbound pv e6d6", &k).is_none());
        assert!(parse_info_line("info depth 10 multipv 2 score cp 30 pv e6f6", &k).is_none());
        assert!(parse_info_line("info currmove e6d6 currmovenumber 1", &k).is_none());
        assert!(parse_info_line("info string NNUE evaluation using nn.nnue", &k).is_none());
        assert!(parse_info_line("bestmove e6d6 ponder e8d8", &k).is_none());
    }

    #[test]
    fn test_bestmove_detection() {
        assert!(is_bestmove(&parse_one("bestmove e6d6 ponder e8d8")));
        assert!(is_bestmove(&parse_one("bestmove (none)")));
        assert!(!is_bestmove(&parse_one("readyok")));
        assert!(!is_bestmove(&parse_one("info depth 1 score cp 10")));
        assert_eq!(parse_one("uciok"), UciMessage::UciOk);
    }
}
