//! Shared data model and protocol types for the dispatch system
//!
//! This crate contains the domain model, agent-event protocol, configuration
//! structures, and utilities used by the dispatch server (and by any tooling
//! that speaks its protocol).

pub mod api;
pub mod config;
pub mod defaults;
pub mod model;
pub mod template;
pub mod timeutil;
pub mod utils;

// Re-export commonly used types for convenience
pub use api::{AgentEvent, FailureKind, ServerEvent, TaskPayload};
pub use config::ServerConfig;
pub use model::{Campaign, CampaignLead, OutboundAccount, OutboundLead, Sender, Task};
pub use utils::{current_timestamp, new_id};

/// Result type alias used throughout the shared crate
pub type Result<T> = anyhow::Result<T>;

/// Common error types for the dispatch system
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

#[cfg(test)]
mod tests;
