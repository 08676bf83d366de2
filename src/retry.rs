use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Current version written by [`RetryPolicyEngine::export_configuration`].
pub const CONFIG_SCHEMA_VERSION: u32 = 1;

pub const ENV_OUTER_MAX: &str = "BNE_RETRY_OUTER_MAX";
pub const ENV_OUTER_DELAY: &str = "BNE_RETRY_OUTER_DELAY";
pub const ENV_INNER_MAX: &str = "BNE_RETRY_INNER_MAX";
pub const ENV_BASE_DELAY: &str = "BNE_RETRY_BASE_DELAY";
pub const ENV_MAX_DELAY: &str = "BNE_RETRY_MAX_DELAY";
pub const ENV_BACKOFF_MULTIPLIER: &str = "BNE_RETRY_BACKOFF_MULTIPLIER";
pub const ENV_TIMEOUT: &str = "BNE_RETRY_TIMEOUT";

/// Settings for the two-tier retry loop. All delays are in milliseconds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfiguration {
    pub outer_loop_retries: u32,
    pub outer_loop_delay_ms: u64,
    pub inner_loop_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    /// Total budget for one retried operation. Enforced by the caller.
    pub timeout_ms: u64,
}

impl Default for RetryConfiguration {
    fn default() -> Self {
        Self {
            outer_loop_retries: 3,
            outer_loop_delay_ms: 30_000,
            inner_loop_retries: 5,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
            backoff_multiplier: 2.0,
            timeout_ms: 300_000,
        }
    }
}

impl RetryConfiguration {
    /// Checks every field against its documented bounds, failing on the first violation.
    pub fn check(&self) -> Result<()> {
        if self.outer_loop_retries > 10 {
            bail!("outer_loop_retries {} exceeds 10", self.outer_loop_retries);
        }
        if self.inner_loop_retries > 20 {
            bail!("inner_loop_retries {} exceeds 20", self.inner_loop_retries);
        }
        if !(1_000..=120_000).contains(&self.outer_loop_delay_ms) {
            bail!(
                "outer_loop_delay_ms {} outside 1000..=120000",
                self.outer_loop_delay_ms
            );
        }
        if !(100..=10_000).contains(&self.base_delay_ms) {
            bail!("base_delay_ms {} outside 100..=10000", self.base_delay_ms);
        }
        if self.max_delay_ms < self.base_delay_ms {
            bail!(
                "max_delay_ms {} is below base_delay_ms {}",
                self.max_delay_ms,
                self.base_delay_ms
            );
        }
        // NaN fails the range check too
        if !(1.0..=10.0).contains(&self.backoff_multiplier) {
            bail!(
                "backoff_multiplier {} outside 1..=10",
                self.backoff_multiplier
            );
        }
        if self.timeout_ms == 0 {
            bail!("timeout_ms must be positive");
        }
        Ok(())
    }

    pub fn outer_loop_delay(&self) -> Duration {
        Duration::from_millis(self.outer_loop_delay_ms)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffPattern {
    Exponential,
}

impl BackoffPattern {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackoffPattern::Exponential => "exponential",
        }
    }
}

/// Derived snapshot of what a retry run with the given loop counts costs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetryMetrics {
    pub inner_loop_retries: u32,
    pub outer_loop_retries: u32,
    /// Retries plus the initial attempt.
    pub total_attempts: u32,
    pub execution_time_ms: u64,
    pub backoff_pattern: BackoffPattern,
    pub backoff_intervals: Vec<u64>,
    pub outer_loop_delay_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConfigurationSummary {
    pub total_possible_retries: u32,
    pub max_execution_time_ms: u64,
    pub avg_retry_delay_ms: f64,
    pub configuration: RetryConfiguration,
}

/// Partial configuration accepted by [`RetryPolicyEngine::import_configuration`].
#[derive(Debug, Deserialize)]
struct ConfigurationPatch {
    schema_version: Option<u32>,
    outer_loop_retries: Option<u32>,
    outer_loop_delay_ms: Option<u64>,
    inner_loop_retries: Option<u32>,
    base_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
    backoff_multiplier: Option<f64>,
    timeout_ms: Option<u64>,
}

impl ConfigurationPatch {
    fn apply_to(self, config: &mut RetryConfiguration) {
        if let Some(v) = self.outer_loop_retries {
            config.outer_loop_retries = v;
        }
        if let Some(v) = self.outer_loop_delay_ms {
            config.outer_loop_delay_ms = v;
        }
        if let Some(v) = self.inner_loop_retries {
            config.inner_loop_retries = v;
        }
        if let Some(v) = self.base_delay_ms {
            config.base_delay_ms = v;
        }
        if let Some(v) = self.max_delay_ms {
            config.max_delay_ms = v;
        }
        if let Some(v) = self.backoff_multiplier {
            config.backoff_multiplier = v;
        }
        if let Some(v) = self.timeout_ms {
            config.timeout_ms = v;
        }
    }
}

#[derive(Serialize)]
struct VersionedConfiguration<'a> {
    schema_version: u32,
    #[serde(flatten)]
    configuration: &'a RetryConfiguration,
}

/// Holds one live [`RetryConfiguration`] and derives backoff schedules and
/// cost estimates from it. Setters do not validate; call
/// [`validate_retry_configuration`](Self::validate_retry_configuration) before
/// relying on the result.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicyEngine {
    config: RetryConfiguration,
}

impl RetryPolicyEngine {
    pub fn new(config: RetryConfiguration) -> Self {
        Self { config }
    }

    pub fn set_outer_loop_retries(&mut self, retries: u32) {
        self.config.outer_loop_retries = retries;
    }

    pub fn set_outer_loop_delay(&mut self, delay_ms: u64) {
        self.config.outer_loop_delay_ms = delay_ms;
    }

    pub fn set_inner_loop_retries(&mut self, retries: u32) {
        self.config.inner_loop_retries = retries;
    }

    pub fn set_base_delay(&mut self, delay_ms: u64) {
        self.config.base_delay_ms = delay_ms;
    }

    pub fn set_max_delay(&mut self, delay_ms: u64) {
        self.config.max_delay_ms = delay_ms;
    }

    pub fn set_backoff_multiplier(&mut self, multiplier: f64) {
        self.config.backoff_multiplier = multiplier;
    }

    pub fn set_timeout(&mut self, timeout_ms: u64) {
        self.config.timeout_ms = timeout_ms;
    }

    /// Returns a copy; later mutations of the engine are not reflected in it.
    pub fn get_configuration(&self) -> RetryConfiguration {
        self.config.clone()
    }

    pub fn get_outer_loop_retries(&self) -> u32 {
        self.config.outer_loop_retries
    }

    pub fn get_outer_loop_delay(&self) -> u64 {
        self.config.outer_loop_delay_ms
    }

    pub fn get_inner_loop_retries(&self) -> u32 {
        self.config.inner_loop_retries
    }

    pub fn get_max_acceptable_execution_time(&self) -> u64 {
        self.config.timeout_ms
    }

    /// Delay before each inner-loop retry: `min(base * multiplier^i, max)`.
    ///
    /// Fractional milliseconds (non-integral multipliers) are rounded to the
    /// nearest millisecond. Once the cap is reached every following interval
    /// equals `max_delay_ms`.
    pub fn generate_backoff_intervals(&self, attempts: u32) -> Vec<u64> {
        self.backoff_schedule().take(attempts as usize).collect()
    }

    /// Unbounded form of [`generate_backoff_intervals`](Self::generate_backoff_intervals).
    pub fn backoff_schedule(&self) -> impl Iterator<Item = u64> {
        let cap = self.config.max_delay_ms as f64;
        let multiplier = self.config.backoff_multiplier;
        std::iter::successors(Some(self.config.base_delay_ms as f64), move |current| {
            Some(current * multiplier)
        })
        .map(move |current| current.min(cap).round() as u64)
    }

    pub fn calculate_backoff_time(&self, attempts: u32) -> u64 {
        self.backoff_schedule()
            .take(attempts as usize)
            .fold(0u64, u64::saturating_add)
    }

    /// Expected wall time for a run with the given loop counts.
    ///
    /// The fixed `inner * base_delay` term is added on top of the backoff sum,
    /// so the base cost is counted twice. Downstream expectations are built on
    /// this exact figure.
    pub fn calculate_expected_execution_time(
        &self,
        inner_loop_retries: u32,
        outer_loop_retries: u32,
    ) -> u64 {
        let inner_time = u64::from(inner_loop_retries).saturating_mul(self.config.base_delay_ms);
        let outer_time =
            u64::from(outer_loop_retries).saturating_mul(self.config.outer_loop_delay_ms);
        let backoff_time = self.calculate_backoff_time(inner_loop_retries);

        inner_time
            .saturating_add(outer_time)
            .saturating_add(backoff_time)
    }

    pub fn calculate_retry_metrics(&self, inner_retries: u32, outer_retries: u32) -> RetryMetrics {
        let backoff_intervals = self.generate_backoff_intervals(inner_retries);
        let execution_time_ms = self.calculate_expected_execution_time(inner_retries, outer_retries);

        RetryMetrics {
            inner_loop_retries: inner_retries,
            outer_loop_retries: outer_retries,
            total_attempts: inner_retries
                .saturating_add(outer_retries)
                .saturating_add(1),
            execution_time_ms,
            backoff_pattern: BackoffPattern::Exponential,
            backoff_intervals,
            outer_loop_delay_ms: self.config.outer_loop_delay_ms,
        }
    }

    /// Splits a flat count of observed retries into full outer cycles of
    /// `max_inner` retries plus the remainder in the last inner loop.
    pub fn distribute_retries(&self, total_retries: u32, max_inner: u32) -> RetryMetrics {
        let max_inner = max_inner.max(1);
        let outer = total_retries / max_inner;
        let inner = total_retries % max_inner;

        let mut metrics = self.calculate_retry_metrics(inner, outer);
        metrics.total_attempts = total_retries.saturating_add(1);
        metrics
    }

    pub fn validate_retry_configuration(&self) -> bool {
        self.config.check().is_ok()
    }

    pub fn reset_to_defaults(&mut self) {
        self.config = RetryConfiguration::default();
    }

    /// Overlays `BNE_RETRY_*` variables from the process environment.
    pub fn load_from_environment(&mut self) {
        self.load_from_source(|key| std::env::var(key).ok());
    }

    /// Overlays values from `lookup`. A field is only written when its value
    /// parses and is strictly positive; anything else leaves it untouched.
    pub fn load_from_source<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        fn positive_int<T: TryFrom<u64>>(raw: Option<String>) -> Option<T> {
            let value = raw?.trim().parse::<u64>().ok()?;
            if value == 0 {
                return None;
            }
            T::try_from(value).ok()
        }

        fn positive_real(raw: Option<String>) -> Option<f64> {
            let value = raw?.trim().parse::<f64>().ok()?;
            (value.is_finite() && value > 0.0).then_some(value)
        }

        let config = &mut self.config;
        if let Some(v) = positive_int::<u32>(lookup(ENV_OUTER_MAX)) {
            config.outer_loop_retries = v;
        }
        if let Some(v) = positive_int::<u64>(lookup(ENV_OUTER_DELAY)) {
            config.outer_loop_delay_ms = v;
        }
        if let Some(v) = positive_int::<u32>(lookup(ENV_INNER_MAX)) {
            config.inner_loop_retries = v;
        }
        if let Some(v) = positive_int::<u64>(lookup(ENV_BASE_DELAY)) {
            config.base_delay_ms = v;
        }
        if let Some(v) = positive_int::<u64>(lookup(ENV_MAX_DELAY)) {
            config.max_delay_ms = v;
        }
        if let Some(v) = positive_real(lookup(ENV_BACKOFF_MULTIPLIER)) {
            config.backoff_multiplier = v;
        }
        if let Some(v) = positive_int::<u64>(lookup(ENV_TIMEOUT)) {
            config.timeout_ms = v;
        }

        debug!("Retry configuration after environment overlay: {:?}", self.config);
    }

    pub fn export_configuration(&self) -> Result<String> {
        let doc = VersionedConfiguration {
            schema_version: CONFIG_SCHEMA_VERSION,
            configuration: &self.config,
        };
        serde_json::to_string_pretty(&doc).context("Failed to serialize retry configuration")
    }

    /// Merges `text` onto a copy of the live configuration and commits it only
    /// if the merged result validates. Returns `false` and leaves the live
    /// configuration untouched otherwise.
    pub fn import_configuration(&mut self, text: &str) -> bool {
        match self.merged_configuration(text) {
            Ok(merged) => {
                info!("Imported retry configuration: {:?}", merged);
                self.config = merged;
                true
            }
            Err(err) => {
                warn!("Rejected retry configuration import: {:#}", err);
                false
            }
        }
    }

    fn merged_configuration(&self, text: &str) -> Result<RetryConfiguration> {
        let patch: ConfigurationPatch =
            serde_json::from_str(text).context("Failed to parse configuration document")?;

        if let Some(version) = patch.schema_version {
            if version != CONFIG_SCHEMA_VERSION {
                bail!("Unsupported configuration schema version {}", version);
            }
        }

        let mut merged = self.config.clone();
        patch.apply_to(&mut merged);
        merged.check()?;
        Ok(merged)
    }

    pub fn get_configuration_summary(&self) -> ConfigurationSummary {
        let total_possible_retries = self
            .config
            .outer_loop_retries
            .saturating_mul(self.config.inner_loop_retries.saturating_add(1));
        let max_execution_time_ms = self.calculate_expected_execution_time(
            self.config.inner_loop_retries,
            self.config.outer_loop_retries,
        );
        let avg_retry_delay_ms =
            (self.config.base_delay_ms as f64 + self.config.max_delay_ms as f64) / 2.0;

        ConfigurationSummary {
            total_possible_retries,
            max_execution_time_ms,
            avg_retry_delay_ms,
            configuration: self.config.clone(),
        }
    }
}
