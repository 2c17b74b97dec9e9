use anyhow::{anyhow, Context, Result};
use clap::ArgMatches;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::domain::{HealthCheckSpec, ProbeKind};

/// Prefix of environment variables that override settings, e.g. `LYCHEE_GRACE_PERIOD_MS`
pub const ENV_PREFIX: &str = "LYCHEE";

/// Orchestrator runtime settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub grace_period_ms: u64,
    pub debounce_ms: u64,
    pub health_interval_ms: u64,
    pub health_timeout_ms: u64,
    pub health_max_attempts: u32,
    pub install_before_start: bool,
    pub event_capacity: usize,
    pub log_level: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            grace_period_ms: 5_000,
            debounce_ms: crate::DEFAULT_DEBOUNCE_MS,
            health_interval_ms: 1_000,
            health_timeout_ms: 30_000,
            health_max_attempts: 30,
            install_before_start: false,
            event_capacity: 1024,
            log_level: Some("info".to_string()),
        }
    }
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        if self.grace_period_ms == 0 {
            return Err(anyhow!("grace_period_ms must be greater than 0"));
        }

        if self.debounce_ms == 0 {
            return Err(anyhow!("debounce_ms must be greater than 0"));
        }

        if self.health_interval_ms == 0 {
            return Err(anyhow!("health_interval_ms must be greater than 0"));
        }

        if self.health_max_attempts == 0 {
            return Err(anyhow!("health_max_attempts must be greater than 0"));
        }

        if self.event_capacity == 0 {
            return Err(anyhow!("event_capacity must be greater than 0"));
        }

        Ok(())
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Probe with the configured default timings
    pub fn health_check(&self, probe: ProbeKind, target: impl Into<String>) -> HealthCheckSpec {
        HealthCheckSpec::new(probe, target).with_timing(
            self.health_interval_ms,
            self.health_timeout_ms,
            self.health_max_attempts,
        )
    }

    pub fn apply_cli_overrides(&mut self, matches: &ArgMatches) {
        if let Some(grace) = matches.get_one::<String>("grace-period-ms") {
            if let Ok(grace) = grace.parse::<u64>() {
                self.grace_period_ms = grace;
            }
        }

        if let Some(debounce) = matches.get_one::<String>("debounce-ms") {
            if let Ok(debounce) = debounce.parse::<u64>() {
                self.debounce_ms = debounce;
            }
        }

        if matches
            .try_get_one::<bool>("install")
            .ok()
            .flatten()
            .copied()
            .unwrap_or(false)
        {
            self.install_before_start = true;
        }

        if let Some(log_level) = matches.get_one::<String>("log-level") {
            self.log_level = Some(log_level.clone());
        }
    }
}

/// Load settings: CLI args > `LYCHEE_*` env vars > settings file > defaults
pub fn load_config(config_path: Option<&str>, matches: &ArgMatches) -> Result<Settings> {
    let mut builder = ::config::Config::builder();

    if let Some(path) = config_path {
        if Path::new(path).exists() {
            builder = builder.add_source(::config::File::from(Path::new(path)));
            log::info!("Loading settings from file: {path}");
        } else {
            log::info!("Settings file not found: {path}, using defaults");
        }
    }

    let mut settings: Settings = builder
        .add_source(::config::Environment::with_prefix(ENV_PREFIX).try_parsing(true))
        .build()
        .context("Failed to read settings")?
        .try_deserialize()
        .context("Failed to parse settings")?;

    settings.apply_cli_overrides(matches);

    settings
        .validate()
        .with_context(|| "Settings validation failed")?;

    log::debug!("Final settings: {settings:?}");
    Ok(settings)
}

/// Write the default settings as a starting point
pub fn create_sample_config(path: &str) -> Result<()> {
    let toml_content =
        toml::to_string_pretty(&Settings::default()).context("Failed to serialize default settings")?;

    fs::write(path, toml_content)
        .with_context(|| format!("Failed to write sample settings to: {path}"))?;

    println!("Sample settings written to: {path}");
    Ok(())
}
