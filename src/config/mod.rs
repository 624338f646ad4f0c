//! Configuration management for the ranked-room service
//!
//! This module handles configuration loading from TOML files and environment
//! variables, validation, and default values for the engine and the service.

pub mod app;
pub mod engine;

// Re-export commonly used types
pub use app::{validate_config, AmqpSettings, AppConfig, ServiceSettings};
pub use engine::{
    CancellationPolicy, EngineConfig, MatchmakingConfig, OutcomeConfig, PhaseConfig, QueueConfig,
};
