//! Service layer for the ranked-room service
//!
//! Application state, transport wiring and health reporting for the
//! production binary.

pub mod app;
pub mod health;

pub use app::{AppState, EngineCommandHandler, ServiceError};
pub use health::{HealthCheck, HealthStatus, ServiceHandle};
