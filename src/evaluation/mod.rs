//! Evaluation values, perspective normalization and move classification.

pub mod classifier;
pub mod types;

pub use classifier::{
    classify, classify_engine, ClassifierInput, MoveQualityResult, QualityClass, Robustness,
    SymbolClass,
};
pub use types::{
    to_mover_perspective, Category, EngineEvaluation, Invert, Outcome, ReportedFor,
    TablebaseMove, TablebaseResult, Wdl, ENGINE_WIN_THRESHOLD, MATE_CONSTANT,
};
