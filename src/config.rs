use crate::alerts::{AlertSystemOptions, DispatchMode};
use crate::retry::RetryConfiguration;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::info;

pub const CONFIG_FILE: &str = "config.toml";
pub const ENV_EMAIL_ONLY: &str = "EMAIL_ONLY_MODE";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AlertsConfig {
    pub email_only: bool,
    pub recipients: Vec<String>,
    pub sms_numbers: Vec<String>,
    pub email_webhook: Option<String>,
    pub sms_webhook: Option<String>,
    pub mock_delivery_delay_ms: u64,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            email_only: false,
            recipients: Vec::new(),
            sms_numbers: Vec::new(),
            email_webhook: None,
            sms_webhook: None,
            mock_delivery_delay_ms: 1_000,
        }
    }
}

impl AlertsConfig {
    /// Live dispatch is used only when at least one webhook is configured.
    pub fn has_live_channels(&self) -> bool {
        self.email_webhook.is_some() || self.sms_webhook.is_some()
    }

    pub fn mock_delivery_delay(&self) -> Duration {
        Duration::from_millis(self.mock_delivery_delay_ms)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub retry: RetryConfiguration,
    pub alerts: AlertsConfig,
}

impl Config {
    /// Loads `config.toml` from the working directory.
    pub fn new() -> Result<Self> {
        Self::from_path(CONFIG_FILE)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let config_str = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let config = Self::from_toml(&config_str)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        info!("Config: {:?}", config);
        Ok(config)
    }

    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// Resolves the dispatch mode once: the command-line flag, the
    /// `EMAIL_ONLY_MODE` value, or the config file can each turn email-only on.
    pub fn dispatch_mode(&self, email_only_flag: bool, env_value: Option<&str>) -> DispatchMode {
        let env_email_only = env_value.is_some_and(|v| v.trim().eq_ignore_ascii_case("true"));
        if email_only_flag || env_email_only || self.alerts.email_only {
            DispatchMode::EmailOnly
        } else {
            DispatchMode::Normal
        }
    }

    pub fn alert_options(
        &self,
        email_only_flag: bool,
        env_value: Option<&str>,
    ) -> AlertSystemOptions {
        AlertSystemOptions::for_mode(self.dispatch_mode(email_only_flag, env_value))
    }
}
