//! roadrisk-core: weather and traffic cleaning, merging, congestion risk
//! simulation and factor analysis.

pub mod cleaner;
pub mod config;
pub mod engine;
pub mod error;
pub mod event;
pub mod factor_analysis;
pub mod merger;
pub mod monte_carlo;
pub mod normalize;
pub mod record;
pub mod rng;
pub mod schema;
pub mod stage;
pub mod stats;
pub mod store;
pub mod types;
