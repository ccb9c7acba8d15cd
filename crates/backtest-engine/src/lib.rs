//! Portfolio backtesting: a deterministic lockstep driver over many
//! symbols, a position manager with MFE/MAE tracking, candidate ranking
//! under portfolio limits, an adaptive equity sampler and result analytics.

pub mod engine;
pub mod metrics;
pub mod models;
pub mod positions;
pub mod ranker;
pub mod sampler;


pub use engine::{position_size, resolve_exit, BacktestEngine};
pub use metrics::{compute_result, ResultInputs};
pub use models::*;
pub use positions::PositionManager;
pub use ranker::{rank_candidates, Candidate};
pub use sampler::EquitySampler;
