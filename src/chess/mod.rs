//! Chess primitives: normalized position keys, immutable moves and the rules engine seam.

pub mod rules;
pub mod types;

pub use rules::{RulesEngine, StandardRules};
pub use types::{Move, PositionKey, RulesError, RulesResult};
