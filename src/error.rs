use crate::chess::RulesError;
use crate::engine::EngineError;
use crate::session::SessionError;
use crate::tablebase::TablebaseError;

#[derive(Debug, thiserror::Error)]
pub enum TrainerError {
    #[error(transparent)]
    Rules(#[from] RulesError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(transparent)]
    Tablebase(#[from] TablebaseError),

    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid configuration: {0}")]
    ConfigParse(#[from] serde_json::Error),
}

pub type TrainerResult<T> = Result<T, TrainerError>;
