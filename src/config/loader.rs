use super::CertflowConfig;
use anyhow::{anyhow, Context, Result};
use config::{Config, Environment, File};
use std::path::PathBuf;

/// Configuration loader with builder pattern
///
/// Precedence: defaults, then the TOML file, then `CERTFLOW__` environment variables.
pub struct ConfigLoader {
    config_file: Option<PathBuf>,
    load_env: bool,
}

impl ConfigLoader {
    /// Create a new configuration loader
    pub fn new() -> Self {
        Self {
            config_file: None,
            load_env: false,
        }
    }

    /// Load configuration from file
    pub fn load_from_file(mut self, path: Option<PathBuf>) -> Self {
        self.config_file = path;
        self
    }

    /// Load configuration from environment variables
    pub fn load_from_env(mut self) -> Self {
        self.load_env = true;
        self
    }

    /// Build the final configuration
    pub fn build(self) -> Result<CertflowConfig> {
        let mut builder = Config::builder().add_source(Config::try_from(&CertflowConfig::default())?);

        if let Some(config_path) = &self.config_file {
            if !config_path.exists() {
                return Err(anyhow!("Config file not found: {}", config_path.display()));
            }
            builder = builder.add_source(File::from(config_path.as_path()));
        } else {
            // Try to load from standard locations
            builder = builder
                .add_source(File::with_name("certflow").required(false))
                .add_source(File::with_name("config/certflow").required(false));
        }

        if self.load_env {
            builder = builder.add_source(
                Environment::with_prefix("CERTFLOW")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            );
        }

        let config: CertflowConfig = builder
            .build()
            .context("Failed to build configuration")?
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        config
            .validate()
            .map_err(|e| anyhow!("Invalid configuration: {}", e))?;

        Ok(config)
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
