// Core modules
pub mod api;
pub mod broker;
pub mod config;
pub mod db;
pub mod engine;
pub mod execution;
pub mod indicators;
pub mod models;
pub mod persistence;
pub mod risk;
pub mod strategy;

// Re-export commonly used types
pub use config::StrategyConfig;
pub use engine::{EngineError, StrategyEngine};
pub use models::*;

// Error handling
pub type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync>>;
