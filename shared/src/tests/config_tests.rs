//! Tests for server configuration parsing and validation

use crate::config::ServerConfig;

fn minimal_toml() -> &'static str {
    r#"
listen_address = "127.0.0.1:8787"
api_key = "test-api-key"
"#
}

#[test]
fn test_minimal_config_gets_defaults() {
    let config: ServerConfig = toml::from_str(minimal_toml()).unwrap();
    assert!(config.validate().is_ok());

    assert_eq!(config.tick_interval_seconds, 30);
    assert_eq!(config.stale_sender_threshold_seconds, 60);
    assert_eq!(config.stale_task_threshold_seconds, 120);
    assert_eq!(config.stale_lease_auto_seconds, 300);
    assert_eq!(config.stale_lease_manual_seconds, 600);
    assert_eq!(config.warmup_horizon_days, 14);
    assert_eq!(config.restriction_hours, 24);
    assert_eq!(config.pacing_floor_seconds, 30);
    assert_eq!(config.pacing_window_floor_seconds, 1800);
    assert_eq!(config.default_daily_limit, 50);
    assert_eq!(config.test_mode_delay_seconds, 30);
    assert_eq!(config.data_dir, "./data");
}

#[test]
fn test_explicit_values_override_defaults() {
    let toml_str = r#"
listen_address = "0.0.0.0:9000"
api_key = "k"
tick_interval_seconds = 10
stale_lease_auto_seconds = 120
default_daily_limit = 25
"#;
    let config: ServerConfig = toml::from_str(toml_str).unwrap();
    assert_eq!(config.tick_interval_seconds, 10);
    assert_eq!(config.stale_lease_auto_seconds, 120);
    assert_eq!(config.default_daily_limit, 25);
    // Untouched fields keep their defaults.
    assert_eq!(config.stale_lease_manual_seconds, 600);
}

#[test]
fn test_validation_rejects_bad_listen_address() {
    let toml_str = r#"
listen_address = "not-an-address"
api_key = "k"
"#;
    let config: ServerConfig = toml::from_str(toml_str).unwrap();
    assert!(config.validate().is_err());
}

#[test]
fn test_validation_rejects_empty_api_key() {
    let toml_str = r#"
listen_address = "127.0.0.1:8787"
api_key = ""
"#;
    let config: ServerConfig = toml::from_str(toml_str).unwrap();
    assert!(config.validate().is_err());
}

#[test]
fn test_validation_rejects_zero_thresholds() {
    let toml_str = r#"
listen_address = "127.0.0.1:8787"
api_key = "k"
stale_task_threshold_seconds = 0
"#;
    let config: ServerConfig = toml::from_str(toml_str).unwrap();
    assert!(config.validate().is_err());
}

#[test]
fn test_missing_required_field_fails_parse() {
    assert!(toml::from_str::<ServerConfig>("api_key = \"k\"").is_err());
}
