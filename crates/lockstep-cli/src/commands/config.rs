//! Config command - View and manage Lockstep configuration
//!
//! Provides the `lockstep config` CLI command which:
//! 1. Shows the current configuration (YAML or JSON), token redacted
//! 2. Sets individual configuration values via dot-notation keys
//! 3. Validates the configuration file and reports errors
//! 4. Prints the configuration file location

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Subcommand;
use lockstep_core::config::Config;
use tracing::info;

use super::CliContext;
use crate::output::{get_formatter, OutputFormat};

/// Keys accepted by `config set`, with a short description
const SETTABLE_KEYS: &[(&str, &str)] = &[
    ("server.url", "Sync server base URL"),
    ("server.auth_token", "Bearer token ('none' to clear)"),
    ("server.device_id", "Device identifier ('none' to generate)"),
    ("server.request_timeout_secs", "Per-request timeout"),
    ("server.max_retries", "Retries of transient HTTP failures"),
    ("sync.staging_dir", "Directory for in-flight transfers"),
    ("sync.deliver_dir", "Directory downloaded files are placed in"),
    ("sync.poll_interval_secs", "Seconds between transfer status polls"),
    ("sync.trigger_interval_secs", "Seconds between daemon sync cycles"),
    ("sync.block_size_kb", "Upload block size (KiB)"),
    ("recovery.max_attempts", "Attempts per recovery stage"),
    ("recovery.base_delay_ms", "First retry delay"),
    ("recovery.max_poll_attempts", "Polls before a transfer is abandoned"),
    ("conflicts.default_resolution", "manual|keep_local|accept_remote"),
    ("logging.level", "trace|debug|info|warn|error"),
    ("logging.format", "text|json"),
    ("storage.database", "Engine state database path"),
];

#[derive(Debug, Subcommand)]
pub enum ConfigCommand {
    /// Display current configuration
    Show,
    /// Set a configuration value
    Set {
        /// Configuration key (e.g., "sync.trigger_interval_secs")
        key: String,
        /// New value
        value: String,
    },
    /// Validate configuration file
    Validate,
    /// Print the configuration file location
    Path,
}

impl ConfigCommand {
    pub async fn execute(&self, ctx: &CliContext, format: OutputFormat) -> Result<()> {
        match self {
            ConfigCommand::Show => self.execute_show(ctx, format),
            ConfigCommand::Set { key, value } => self.execute_set(ctx, key, value, format),
            ConfigCommand::Validate => self.execute_validate(ctx, format),
            ConfigCommand::Path => {
                let formatter = get_formatter(format);
                if format.is_json() {
                    formatter.print_json(&serde_json::json!({
                        "config_path": ctx.config_path.display().to_string(),
                        "exists": ctx.config_path.exists(),
                    }));
                } else {
                    println!("{}", ctx.config_path.display());
                }
                Ok(())
            }
        }
    }

    fn execute_show(&self, ctx: &CliContext, format: OutputFormat) -> Result<()> {
        let formatter = get_formatter(format);
        let mut config = ctx.config()?;
        if config.server.auth_token.is_some() {
            config.server.auth_token = Some("<redacted>".to_string());
        }

        info!(config_path = %ctx.config_path.display(), "Showing configuration");

        if format.is_json() {
            let json = serde_json::to_value(&config)
                .context("Failed to serialize configuration to JSON")?;
            formatter.print_json(&json);
        } else {
            formatter.success(&format!("Configuration ({})", ctx.config_path.display()));
            formatter.info("");

            let yaml = serde_yaml::to_string(&config)
                .context("Failed to serialize configuration to YAML")?;

            for line in yaml.lines() {
                formatter.info(line);
            }
        }

        Ok(())
    }

    fn execute_set(
        &self,
        ctx: &CliContext,
        key: &str,
        value: &str,
        format: OutputFormat,
    ) -> Result<()> {
        let formatter = get_formatter(format);
        let config_path = &ctx.config_path;
        let mut config = ctx.config()?;

        info!(key = %key, "Setting configuration value");

        if let Err(e) = apply_config_value(&mut config, key, value) {
            if format.is_json() {
                formatter.print_json(&serde_json::json!({
                    "success": false,
                    "key": key,
                    "error": format!("{e:#}"),
                }));
            } else {
                formatter.error(&format!("Failed to set '{}': {:#}", key, e));
                formatter.info("");
                formatter.info("Supported keys:");
                for (name, description) in SETTABLE_KEYS {
                    formatter.info(&format!("  {name:<32} - {description}"));
                }
            }
            return Ok(());
        }

        // Validate the new config before saving
        let errors = config.validate();
        if !errors.is_empty() {
            let messages: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
            if format.is_json() {
                formatter.print_json(&serde_json::json!({
                    "success": false,
                    "key": key,
                    "errors": messages,
                }));
            } else {
                formatter.error(&format!(
                    "Invalid value for '{}': {}",
                    key,
                    messages.join("; ")
                ));
            }
            return Ok(());
        }

        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create configuration directory")?;
        }
        let yaml = serde_yaml::to_string(&config).context("Failed to serialize configuration")?;
        std::fs::write(config_path, yaml).context("Failed to write configuration file")?;

        if format.is_json() {
            formatter.print_json(&serde_json::json!({
                "success": true,
                "key": key,
                "config_path": config_path.display().to_string(),
            }));
        } else {
            formatter.success(&format!("Set {}", key));
            formatter.info(&format!("Saved to {}", config_path.display()));
        }

        Ok(())
    }

    fn execute_validate(&self, ctx: &CliContext, format: OutputFormat) -> Result<()> {
        let formatter = get_formatter(format);
        let config_path = &ctx.config_path;

        if !config_path.exists() {
            if format.is_json() {
                formatter.print_json(&serde_json::json!({
                    "valid": true,
                    "config_path": config_path.display().to_string(),
                    "exists": false,
                }));
            } else {
                formatter.info(&format!(
                    "Configuration file not found at {}",
                    config_path.display()
                ));
                formatter.info(
                    "Using defaults. Run 'lockstep config set <key> <value>' to create one.",
                );
            }
            return Ok(());
        }

        let config = match Config::load(config_path) {
            Ok(cfg) => cfg,
            Err(e) => {
                if format.is_json() {
                    formatter.print_json(&serde_json::json!({
                        "valid": false,
                        "config_path": config_path.display().to_string(),
                        "errors": [format!("Failed to parse configuration: {e:#}")],
                    }));
                } else {
                    formatter.error(&format!("Failed to parse configuration: {e:#}"));
                    formatter.info(&format!("File: {}", config_path.display()));
                }
                return Ok(());
            }
        };

        info!(config_path = %config_path.display(), "Validating configuration");

        let errors = config.validate();

        if format.is_json() {
            let error_strings: Vec<String> = errors.iter().map(|e| e.to_string()).collect();
            formatter.print_json(&serde_json::json!({
                "valid": errors.is_empty(),
                "config_path": config_path.display().to_string(),
                "errors": error_strings,
            }));
        } else if errors.is_empty() {
            formatter.success("Configuration is valid");
            formatter.info(&format!("File: {}", config_path.display()));
        } else {
            formatter.error(&format!(
                "Configuration has {} error{}:",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" }
            ));
            formatter.info(&format!("File: {}", config_path.display()));
            formatter.info("");
            for error in &errors {
                formatter.info(&format!("  {} - {}", error.field, error.message));
            }
        }

        Ok(())
    }
}

/// `None` for an empty value or the literal `none`
fn optional(value: &str) -> Option<String> {
    if value.is_empty() || value == "none" {
        None
    } else {
        Some(value.to_string())
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse::<T>()
        .map_err(|_| anyhow::anyhow!("Expected a positive integer for {key}, got '{value}'"))
}

/// Apply a dot-notation key/value pair to a Config struct
///
/// See [`SETTABLE_KEYS`] for the accepted keys. Conflict rules are lists
/// and can only be edited in the file.
fn apply_config_value(config: &mut Config, key: &str, value: &str) -> Result<()> {
    match key {
        // --- server ---
        "server.url" => config.server.url = value.to_string(),
        "server.auth_token" => config.server.auth_token = optional(value),
        "server.device_id" => config.server.device_id = optional(value),
        "server.request_timeout_secs" => {
            config.server.request_timeout_secs = parse_number(key, value)?;
        }
        "server.max_retries" => config.server.max_retries = parse_number(key, value)?,

        // --- sync ---
        "sync.staging_dir" => config.sync.staging_dir = PathBuf::from(value),
        "sync.deliver_dir" => config.sync.deliver_dir = PathBuf::from(value),
        "sync.poll_interval_secs" => config.sync.poll_interval_secs = parse_number(key, value)?,
        "sync.trigger_interval_secs" => {
            config.sync.trigger_interval_secs = parse_number(key, value)?;
        }
        "sync.block_size_kb" => config.sync.block_size_kb = parse_number(key, value)?,

        // --- recovery ---
        "recovery.max_attempts" => config.recovery.max_attempts = parse_number(key, value)?,
        "recovery.base_delay_ms" => config.recovery.base_delay_ms = parse_number(key, value)?,
        "recovery.max_poll_attempts" => {
            config.recovery.max_poll_attempts = parse_number(key, value)?;
        }

        // --- conflicts ---
        "conflicts.default_resolution" => {
            config.conflicts.default_resolution = value.to_string();
        }

        // --- logging ---
        "logging.level" => config.logging.level = value.to_string(),
        "logging.format" => config.logging.format = value.to_string(),

        // --- storage ---
        "storage.database" => config.storage.database = PathBuf::from(value),

        _ => bail!("Unknown configuration key: '{}'", key),
    }

    Ok(())
}
