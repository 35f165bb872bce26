//! Core utilities and types shared across all Rollout crates

pub mod audit;
pub mod broadcast;
pub mod command;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod probe;
pub mod store;
pub mod types;

// Re-export commonly used types
pub use audit::*;
pub use broadcast::*;
pub use command::*;
pub use config::*;
pub use error::*;
pub use pipeline::*;
pub use probe::*;
pub use store::*;
pub use types::*;

// Re-export external dependencies
pub use anyhow;
pub use async_trait;
pub use chrono;
pub use serde;
pub use serde_json;
pub use thiserror;
pub use tokio;
pub use tracing;
pub use uuid;
