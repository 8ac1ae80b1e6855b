//! Tablebase lookup service.
//!
//! The trainer depends only on [`TablebaseService`]; [`LichessTablebase`] is the HTTP
//! adapter used in production.

mod lichess;

use async_trait::async_trait;

use crate::chess::PositionKey;
use crate::evaluation::{TablebaseMove, TablebaseResult};

pub use lichess::{parse_response, LichessTablebase};

#[derive(Debug, thiserror::Error)]
pub enum TablebaseError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Tablebase returned status {0}")]
    Status(u16),

    #[error("Invalid tablebase response: {0}")]
    Decode(String),

    #[error("Tablebase unavailable: {0}")]
    Unavailable(String),
}

pub type LookupResult<T> = Result<T, TablebaseError>;

/// Source of exact endgame verdicts.
#[async_trait]
pub trait TablebaseService: Send + Sync {
    /// Look up a position. `Ok(None)` means the tablebase has no entry for it.
    async fn lookup(&self, position: &PositionKey) -> LookupResult<Option<TablebaseResult>>;

    /// The `n` best moves for the side to move, best first.
    async fn top_moves(
        &self,
        position: &PositionKey,
        n: usize,
    ) -> LookupResult<Vec<TablebaseMove>> {
        Ok(self
            .lookup(position)
            .await?
            .map(|result| result.moves.into_iter().take(n).collect())
            .unwrap_or_default())
    }
}
