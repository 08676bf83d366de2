use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use layered_retry::alerts::{AlertCorrelationSystem, AlertSystemOptions, UPSTREAM_SERVICE};
use layered_retry::config::{Config, CONFIG_FILE, ENV_EMAIL_ONLY};
use layered_retry::dispatch::{AlertDispatcher, MockDispatcher, WebhookDispatcher};
use layered_retry::{RetryExecutor, RetryMetrics, RetryPolicyEngine};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const MAX_CLI_RETRIES: i64 = 1_000;

#[derive(Parser)]
#[command(name = "retry-plan")]
#[command(about = "Inspect and exercise the two-tier retry policy", long_about = None)]
struct Cli {
    /// Path to the TOML configuration (default: ./config.toml if present)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
    /// Suppress SMS dispatch and seed mock alerts
    #[arg(long, global = true)]
    email_only: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Print the configuration summary
    Summary,
    /// Print the inner-loop backoff schedule
    Schedule {
        /// Number of inner-loop retries to schedule
        #[arg(short, long, value_parser = clap::value_parser!(u32).range(0..=MAX_CLI_RETRIES))]
        attempts: Option<u32>,
    },
    /// Print metrics for a given number of inner and outer retries
    Metrics {
        #[arg(short, long, default_value = "5", value_parser = clap::value_parser!(u32).range(0..=MAX_CLI_RETRIES))]
        inner: u32,
        #[arg(short, long, default_value = "3", value_parser = clap::value_parser!(u32).range(0..=MAX_CLI_RETRIES))]
        outer: u32,
    },
    /// Validate the effective configuration
    Validate,
    /// Export the effective configuration as JSON
    Export,
    /// Import a JSON configuration document on top of the effective one
    Import {
        /// File holding the JSON document
        file: PathBuf,
    },
    /// Run a simulated flaky upstream through the retry loops with alerts armed
    Simulate {
        /// Number of failures before the upstream recovers
        #[arg(short, long, default_value = "3")]
        failures: u32,
    },
}

fn load_config(path: Option<&PathBuf>) -> Result<Config> {
    match path {
        Some(path) => Config::from_path(path),
        None if PathBuf::from(CONFIG_FILE).exists() => Config::new(),
        None => Ok(Config::default()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_ref())?;

    let mut engine = RetryPolicyEngine::new(config.retry.clone());
    engine.load_from_environment();

    match cli.command {
        Commands::Summary => {
            let summary = engine.get_configuration_summary();
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
        Commands::Schedule { attempts } => {
            let attempts = attempts.unwrap_or_else(|| {
                engine
                    .get_inner_loop_retries()
                    .min(MAX_CLI_RETRIES as u32)
            });
            let intervals = engine.generate_backoff_intervals(attempts);
            for (i, delay) in intervals.iter().enumerate() {
                println!("retry {:>2}: {:>8} ms", i + 1, delay);
            }
            println!("total:    {:>8} ms", engine.calculate_backoff_time(attempts));
        }
        Commands::Metrics { inner, outer } => {
            let metrics = engine.calculate_retry_metrics(inner, outer);
            println!("{}", serde_json::to_string_pretty(&metrics)?);
        }
        Commands::Validate => {
            if let Err(err) = engine.get_configuration().check() {
                bail!("Configuration invalid: {err:#}");
            }
            println!("Configuration valid");
        }
        Commands::Export => {
            println!("{}", engine.export_configuration()?);
        }
        Commands::Import { file } => {
            let text = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            if !engine.import_configuration(&text) {
                bail!("Import rejected, configuration unchanged");
            }
            println!("{}", engine.export_configuration()?);
        }
        Commands::Simulate { failures } => {
            let env_email_only = std::env::var(ENV_EMAIL_ONLY).ok();
            let options = config.alert_options(cli.email_only, env_email_only.as_deref());
            simulate(&config, &engine, options, failures).await?;
        }
    }

    Ok(())
}

/// Splits the retries behind `calls` upstream calls into inner and outer loops.
fn observed_distribution(engine: &RetryPolicyEngine, calls: u32) -> RetryMetrics {
    engine.distribute_retries(
        calls.saturating_sub(1),
        engine.get_inner_loop_retries().saturating_add(1),
    )
}

async fn simulate(
    config: &Config,
    engine: &RetryPolicyEngine,
    options: AlertSystemOptions,
    failures: u32,
) -> Result<()> {
    let dispatcher: Arc<dyn AlertDispatcher> = if config.alerts.has_live_channels() {
        Arc::new(WebhookDispatcher::new(
            config.alerts.email_webhook.clone(),
            config.alerts.sms_webhook.clone(),
        ))
    } else {
        Arc::new(MockDispatcher::new(config.alerts.mock_delivery_delay()))
    };

    let alerts = AlertCorrelationSystem::new(options, dispatcher);
    alerts.clear_previous_alerts().await;
    alerts.enable_monitoring().await;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            let _ = shutdown_tx.send(true);
        }
    });

    let executor = RetryExecutor::new(engine, UPSTREAM_SERVICE)
        .with_alerts(alerts.clone())
        .with_shutdown(shutdown_rx);
    info!(
        "Simulating {} upstream failures against at most {} attempts",
        failures,
        executor.max_attempts()
    );

    let calls = Arc::new(AtomicU32::new(0));
    let result = executor
        .run(|| {
            let calls = calls.clone();
            async move {
                let call = calls.fetch_add(1, Ordering::SeqCst);
                if call < failures {
                    Err(anyhow::anyhow!("upstream unavailable (call {})", call + 1))
                } else {
                    Ok(call + 1)
                }
            }
        })
        .await;

    match &result {
        Ok(attempts) => println!("Upstream recovered on attempt {attempts}"),
        Err(err) => println!("Upstream did not recover: {err}"),
    }

    let observed = observed_distribution(engine, calls.load(Ordering::SeqCst));
    println!("{}", serde_json::to_string_pretty(&observed)?);

    let triggered = alerts.check_triggered_alerts().await;
    println!("{}", serde_json::to_string_pretty(&triggered)?);

    if triggered.upstream_dependency_alert {
        let subject = format!("Upstream dependency alert: {UPSTREAM_SERVICE}");
        let content = alerts.export_alerts_to_csv().await;
        if !alerts
            .send_email_alert(&config.alerts.recipients, &subject, &content)
            .await
        {
            warn!("Email alert was not delivered");
        }
        for number in &config.alerts.sms_numbers {
            if !alerts.send_sms_alert(number, &subject).await {
                warn!("SMS alert to {} was not delivered", number);
            }
        }
    }

    alerts.disable_monitoring().await;
    println!("{}", alerts.export_alerts_to_csv().await);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observed_distribution_default_engine() {
        let engine = RetryPolicyEngine::default();
        let metrics = observed_distribution(&engine, 9);
        assert_eq!(metrics.outer_loop_retries, 1);
        assert_eq!(metrics.inner_loop_retries, 2);
    }

    #[test]
    fn test_observed_distribution_saturates_inner_limit() {
        let mut engine = RetryPolicyEngine::default();
        engine.set_inner_loop_retries(u32::MAX);
        let metrics = observed_distribution(&engine, 4);
        assert_eq!(metrics.outer_loop_retries, 0);
        assert_eq!(metrics.inner_loop_retries, 3);
    }

    #[test]
    fn test_schedule_attempts_bounded() {
        assert!(
            Cli::try_parse_from(["retry-plan", "schedule", "--attempts", "4294967295"]).is_err()
        );
        assert!(Cli::try_parse_from(["retry-plan", "schedule", "--attempts", "20"]).is_ok());
        assert!(Cli::try_parse_from(["retry-plan", "metrics", "-i", "5000"]).is_err());
    }
}
