//! Configuration management for the dispatch server
//!
//! This module handles loading, validation, and management of server
//! configuration from a `server.toml` file.

use anyhow::{Context, Result};
use shared::config::ServerConfig;
use std::path::PathBuf;
use tracing::info;

/// The expected name of the configuration file.
const SERVER_CONFIG_FILE: &str = "server.toml";

/// Manages the server's configuration lifecycle: initial loading,
/// validation, and persistence of command-line overrides.
pub struct ConfigManager {
    /// The full path to the configuration file.
    pub config_path: PathBuf,
    /// The loaded and validated server configuration.
    pub server_config: Option<ServerConfig>,
}

impl ConfigManager {
    /// Creates a new `ConfigManager` and immediately loads the configuration,
    /// so a successfully created manager is always in a valid, loaded state.
    pub fn new(config_path: PathBuf) -> Result<Self> {
        // Accept either a directory containing `server.toml` or a direct
        // path to the file.
        let config_path = if config_path.is_dir() {
            config_path.join(SERVER_CONFIG_FILE)
        } else {
            config_path
        };

        if !config_path.exists() {
            return Err(anyhow::anyhow!(
                "Configuration file does not exist: {}",
                config_path.display()
            ));
        }

        let mut manager = Self {
            config_path,
            server_config: None,
        };
        manager.load_config()?;

        Ok(manager)
    }

    /// Loads the configuration file from disk, parses, and validates it.
    pub fn load_config(&mut self) -> Result<()> {
        info!(
            "Loading server configuration from {}",
            self.config_path.display()
        );

        let config_content = std::fs::read_to_string(&self.config_path)
            .with_context(|| format!("Failed to read {}", self.config_path.display()))?;

        let server_config: ServerConfig = toml::from_str(&config_content)
            .with_context(|| format!("Failed to parse {}", self.config_path.display()))?;

        server_config.validate().with_context(|| {
            format!(
                "Invalid configuration in {}",
                self.config_path.display()
            )
        })?;

        self.server_config = Some(server_config);
        Ok(())
    }

    /// Returns whether the configuration is loaded.
    pub fn is_loaded(&self) -> bool {
        self.server_config.is_some()
    }

    /// Applies command-line overrides and persists them back to disk when
    /// any value actually changed. Returns whether a change was written.
    pub fn override_and_persist_config(
        &mut self,
        listen_address: Option<String>,
        api_key: Option<String>,
    ) -> Result<bool> {
        let config = self
            .server_config
            .as_mut()
            .context("Configuration not loaded")?;

        let mut changed = false;
        if let Some(listen_address) = listen_address {
            if config.listen_address != listen_address {
                config.listen_address = listen_address;
                changed = true;
            }
        }
        if let Some(api_key) = api_key {
            if config.api_key != api_key {
                config.api_key = api_key;
                changed = true;
            }
        }

        if !changed {
            return Ok(false);
        }

        config
            .validate()
            .context("Configuration invalid after applying overrides")?;

        let serialized =
            toml::to_string_pretty(&*config).context("Failed to serialize configuration")?;
        std::fs::write(&self.config_path, serialized)
            .with_context(|| format!("Failed to write {}", self.config_path.display()))?;

        info!(
            "Persisted configuration overrides to {}",
            self.config_path.display()
        );
        Ok(true)
    }
}
