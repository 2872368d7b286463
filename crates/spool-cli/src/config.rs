//! Application settings: `appsettings.json` plus environment overrides.
//!
//! Environment keys use `__` as the section separator, e.g.
//! `ServiceBusSettings__QueueName=orders` or `Telemetry__Enabled=true`.
//! Keys are matched case-insensitively.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use config::{Config, Environment, Map};
use serde::Deserialize;
use serde_json::Value;
use spool_core::ServiceBusSettings;

const ENV_SEPARATOR: &str = "__";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct AppSettings {
    #[serde(default, alias = "servicebussettings")]
    pub service_bus_settings: ServiceBusSettings,

    #[serde(default, alias = "telemetry")]
    pub telemetry: TelemetrySettings,

    #[serde(default, alias = "downstream")]
    pub downstream: DownstreamSettings,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct TelemetrySettings {
    #[serde(default, alias = "enabled")]
    pub enabled: bool,

    /// Prefix of metric names.
    #[serde(default = "default_service_name", alias = "servicename")]
    pub service_name: String,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            service_name: default_service_name(),
        }
    }
}

fn default_service_name() -> String {
    spool_core::app::builder::DEFAULT_SERVICE_NAME.to_string()
}

/// Endpoint called after each processed message.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase", deny_unknown_fields)]
pub struct DownstreamSettings {
    #[serde(default, alias = "url")]
    pub url: Option<String>,

    /// Whole-request timeout of the downstream call.
    #[serde(default = "default_timeout_seconds", alias = "timeoutseconds")]
    pub timeout_seconds: u64,
}

impl DownstreamSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

impl Default for DownstreamSettings {
    fn default() -> Self {
        Self {
            url: None,
            timeout_seconds: default_timeout_seconds(),
        }
    }
}

fn default_timeout_seconds() -> u64 {
    30
}

/// Load settings from `path` and apply `env` overrides on top.
///
/// A missing file is fine as long as the environment provides a valid
/// `ServiceBusSettings` section.
pub fn load(path: &Path, env: impl IntoIterator<Item = (String, String)>) -> Result<AppSettings> {
    let mut builder = Config::builder();

    let file_found = path.exists();
    if file_found {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let value: Value = serde_json::from_str(&text)
            .with_context(|| format!("failed to parse {}", path.display()))?;
        // config lowercases environment keys, so file keys must match
        builder = builder.add_source(
            Config::try_from(&lowercase_keys(value))
                .with_context(|| format!("failed to load {}", path.display()))?,
        );
    }

    let overrides: Map<String, String> = env
        .into_iter()
        .filter(|(key, _)| key.contains(ENV_SEPARATOR))
        .map(|(key, value)| (key.to_ascii_lowercase(), value))
        .collect();
    builder = builder.add_source(
        Environment::default()
            .separator(ENV_SEPARATOR)
            .try_parsing(true)
            .source(Some(overrides)),
    );

    let settings: AppSettings = builder
        .build()
        .context("failed to merge application settings")?
        .try_deserialize()
        .context("invalid application settings")?;

    if !file_found && let Err(err) = settings.service_bus_settings.validate() {
        bail!(
            "config file {} not found and the environment does not complete ServiceBusSettings: {err}",
            path.display()
        );
    }
    Ok(settings)
}

fn lowercase_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(key, value)| (key.to_ascii_lowercase(), lowercase_keys(value)))
                .collect(),
        ),
        other => other,
    }
}
