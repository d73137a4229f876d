// Momentum ranking
pub mod ranking;

pub use ranking::{rank_final, rank_gm, RankError, RankingEngine, RankingParams};
