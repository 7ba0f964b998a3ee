//! Configuration types and validation for the dispatch system
//!
//! This module defines the server configuration structure loaded from
//! `server.toml`, including validation logic and serialization support.

use crate::defaults::*;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Main server configuration loaded from server.toml
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// Address and port the HTTP/WebSocket server listens on
    pub listen_address: String,
    /// Pre-shared secret key for agent and operator authentication
    pub api_key: String,
    /// Directory holding the SQLite store
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    // Scheduler tunables
    /// Scheduler tick period in seconds (default: 30)
    #[serde(default = "default_tick_interval")]
    pub tick_interval_seconds: u64,
    /// Seconds without a heartbeat before an online sender is marked offline
    /// (default: 60)
    #[serde(default = "default_stale_sender_threshold")]
    pub stale_sender_threshold_seconds: i64,
    /// Seconds before a non-terminal task is failed as timed out (default: 120)
    #[serde(default = "default_stale_task_threshold")]
    pub stale_task_threshold_seconds: i64,
    /// Seconds before a queued lead of an auto-mode campaign is reclaimed
    /// (default: 300)
    #[serde(default = "default_stale_lease_auto")]
    pub stale_lease_auto_seconds: i64,
    /// Seconds before a queued lead of a manual-mode campaign is reclaimed
    /// (default: 600)
    #[serde(default = "default_stale_lease_manual")]
    pub stale_lease_manual_seconds: i64,
    /// Days after which an enabled warmup plan auto-completes (default: 14)
    #[serde(default = "default_warmup_horizon_days")]
    pub warmup_horizon_days: i64,
    /// Hours a sender stays restricted after a restriction-class failure
    /// (default: 24)
    #[serde(default = "default_restriction_hours")]
    pub restriction_hours: i64,
    /// Lower bound for smooth-pacing delays in seconds (default: 30)
    #[serde(default = "default_pacing_floor")]
    pub pacing_floor_seconds: u64,
    /// Floor for the remaining active-window length used by smooth pacing,
    /// in seconds (default: 1800)
    #[serde(default = "default_pacing_window_floor")]
    pub pacing_window_floor_seconds: u64,
    /// Per-sender daily limit used when neither campaign nor sender sets one
    /// (default: 50)
    #[serde(default = "default_daily_limit")]
    pub default_daily_limit: u32,
    /// Forced inter-send delay for test-mode campaigns in seconds (default: 30)
    #[serde(default = "default_test_mode_delay")]
    pub test_mode_delay_seconds: u64,

    // Rate limiting
    /// Whether per-sender rate limiting is applied to the REST surface
    #[serde(default = "default_rate_limit_enabled")]
    pub rate_limit_enabled: bool,
    /// Rate limit sliding window in seconds (default: 60)
    #[serde(default = "default_rate_limit_window")]
    pub rate_limit_window_seconds: u32,
    /// Maximum requests per window (default: 100)
    #[serde(default = "default_rate_limit_max_requests")]
    pub rate_limit_max_requests: usize,

    // Data management
    /// Days to retain terminal tasks before cleanup (default: 30)
    #[serde(default = "default_data_retention_days")]
    pub data_retention_days: u32,
    /// Hours between retention cleanup runs (default: 24)
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_hours: u32,
    /// Delay before the first cleanup run after startup in seconds
    /// (default: 3600)
    #[serde(default = "default_initial_cleanup_delay")]
    pub initial_cleanup_delay_seconds: u64,
    /// Seconds between WAL checkpoint runs (default: 60)
    #[serde(default = "default_wal_checkpoint_interval")]
    pub wal_checkpoint_interval_seconds: u64,

    // Shutdown behavior
    /// Wait time for background tasks during shutdown in seconds (default: 30)
    #[serde(default = "default_server_graceful_shutdown_timeout")]
    pub graceful_shutdown_timeout_seconds: u64,
}

impl ServerConfig {
    /// Validates the loaded configuration.
    ///
    /// Returns an error describing the first semantic problem found. The
    /// scheduler assumes validated shapes, so anything that would make a
    /// threshold or pacing computation nonsensical is rejected here.
    pub fn validate(&self) -> crate::Result<()> {
        if self.listen_address.parse::<SocketAddr>().is_err() {
            return Err(crate::DispatchError::Config(format!(
                "Invalid listen_address: '{}'",
                self.listen_address
            ))
            .into());
        }

        if self.api_key.is_empty() {
            return Err(
                crate::DispatchError::Config("api_key must not be empty".to_string()).into(),
            );
        }

        if self.tick_interval_seconds == 0 {
            return Err(crate::DispatchError::Config(
                "tick_interval_seconds must be greater than zero".to_string(),
            )
            .into());
        }

        for (name, value) in [
            (
                "stale_sender_threshold_seconds",
                self.stale_sender_threshold_seconds,
            ),
            (
                "stale_task_threshold_seconds",
                self.stale_task_threshold_seconds,
            ),
            ("stale_lease_auto_seconds", self.stale_lease_auto_seconds),
            (
                "stale_lease_manual_seconds",
                self.stale_lease_manual_seconds,
            ),
            ("warmup_horizon_days", self.warmup_horizon_days),
            ("restriction_hours", self.restriction_hours),
        ] {
            if value <= 0 {
                return Err(crate::DispatchError::Config(format!(
                    "{} must be greater than zero",
                    name
                ))
                .into());
            }
        }

        if self.pacing_floor_seconds == 0 {
            return Err(crate::DispatchError::Config(
                "pacing_floor_seconds must be greater than zero".to_string(),
            )
            .into());
        }

        if self.default_daily_limit == 0 {
            return Err(crate::DispatchError::Config(
                "default_daily_limit must be greater than zero".to_string(),
            )
            .into());
        }

        Ok(())
    }
}
