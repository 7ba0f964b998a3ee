//! Default values for configuration parameters
//!
//! This module centralizes all default value functions used by the configuration
//! structures. These functions are used by serde when deserializing configuration
//! files that don't specify certain optional fields.

// Scheduler defaults

/// Default scheduler tick period (30 seconds)
pub fn default_tick_interval() -> u64 {
    30
}

/// Default threshold after which an online sender with no heartbeat is
/// considered offline (60 seconds)
pub fn default_stale_sender_threshold() -> i64 {
    60
}

/// Default threshold after which a non-terminal task is failed (2 minutes)
pub fn default_stale_task_threshold() -> i64 {
    120
}

/// Default lease reclamation threshold for auto-mode campaigns (5 minutes)
pub fn default_stale_lease_auto() -> i64 {
    300
}

/// Default lease reclamation threshold for manual-mode campaigns (10 minutes)
pub fn default_stale_lease_manual() -> i64 {
    600
}

/// Default warmup auto-completion horizon (14 days)
pub fn default_warmup_horizon_days() -> i64 {
    14
}

/// Default sender restriction cooldown (24 hours)
pub fn default_restriction_hours() -> i64 {
    24
}

/// Default lower bound for smooth-pacing delays (30 seconds)
pub fn default_pacing_floor() -> u64 {
    30
}

/// Default remaining-window floor for smooth pacing (30 minutes)
pub fn default_pacing_window_floor() -> u64 {
    1800
}

/// Default per-sender daily message limit when neither the campaign nor the
/// sender specifies one (50 messages)
pub fn default_daily_limit() -> u32 {
    50
}

/// Default forced delay between sends when a campaign runs in test mode
/// (30 seconds)
pub fn default_test_mode_delay() -> u64 {
    30
}

// Server configuration defaults

/// Default data directory for the SQLite store
pub fn default_data_dir() -> String {
    "./data".to_string()
}

/// Default rate limiting enabled flag
pub fn default_rate_limit_enabled() -> bool {
    true
}

/// Default rate limit window (60 seconds)
pub fn default_rate_limit_window() -> u32 {
    60
}

/// Default maximum requests per rate limit window
pub fn default_rate_limit_max_requests() -> usize {
    100
}

/// Default retention for terminal tasks (30 days)
pub fn default_data_retention_days() -> u32 {
    30
}

/// Default data cleanup interval (24 hours)
pub fn default_cleanup_interval() -> u32 {
    24
}

/// Default initial cleanup delay on server startup (3600 seconds / 1 hour)
pub fn default_initial_cleanup_delay() -> u64 {
    3600
}

/// Default WAL checkpoint interval (60 seconds / 1 minute)
pub fn default_wal_checkpoint_interval() -> u64 {
    60
}

/// Default graceful shutdown timeout for server (30 seconds)
pub fn default_server_graceful_shutdown_timeout() -> u64 {
    30
}
