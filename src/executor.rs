use crate::alerts::AlertCorrelationSystem;
use crate::retry::{RetryConfiguration, RetryPolicyEngine};
use std::future::Future;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::watch;
use tokio::time::sleep;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum RetryError {
    #[error("operation failed after {attempts} attempts: {last_error}")]
    Exhausted {
        attempts: u32,
        last_error: anyhow::Error,
    },
    #[error("retry budget exceeded after {elapsed:?} ({attempts} attempts): {last_error}")]
    BudgetExceeded {
        elapsed: Duration,
        attempts: u32,
        last_error: anyhow::Error,
    },
    #[error("retry cancelled by shutdown")]
    Cancelled,
}

/// Runs an operation through the inner backoff loop nested in the outer
/// cooldown loop of a [`RetryConfiguration`].
///
/// Every sleep races the shutdown signal. A shutdown ends the run with
/// [`RetryError::Cancelled`] and is never reported as an alert.
pub struct RetryExecutor {
    config: RetryConfiguration,
    engine: RetryPolicyEngine,
    service: String,
    alerts: Option<AlertCorrelationSystem>,
    shutdown: Option<watch::Receiver<bool>>,
}

impl RetryExecutor {
    /// Snapshots the engine's current configuration.
    pub fn new(engine: &RetryPolicyEngine, service: impl Into<String>) -> Self {
        let config = engine.get_configuration();
        if let Err(err) = config.check() {
            warn!("Retry executor using out-of-bounds configuration: {:#}", err);
        }

        Self {
            config,
            engine: engine.clone(),
            service: service.into(),
            alerts: None,
            shutdown: None,
        }
    }

    /// Report failed attempts, timeouts and exhaustion to `alerts`.
    pub fn with_alerts(mut self, alerts: AlertCorrelationSystem) -> Self {
        self.alerts = Some(alerts);
        self
    }

    /// Abort pending sleeps once `shutdown` turns `true`.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = Some(shutdown);
        self
    }

    pub fn max_attempts(&self) -> u32 {
        self.config
            .inner_loop_retries
            .saturating_add(1)
            .saturating_mul(self.config.outer_loop_retries.saturating_add(1))
    }

    pub async fn run<F, Fut, T>(&self, operation: F) -> Result<T, RetryError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let start = Instant::now();
        let budget = self.config.timeout();
        let mut attempts = 0u32;
        let mut last_error = None;

        'cycles: for cycle in 0..=self.config.outer_loop_retries {
            if cycle > 0 {
                debug!("{} starting outer cycle {}", self.service, cycle);
            }
            let mut schedule = self.engine.backoff_schedule().map(Duration::from_millis);

            for step in 0..=self.config.inner_loop_retries {
                if self.is_shutdown() {
                    info!("Shutdown requested, abandoning retries for {}", self.service);
                    return Err(RetryError::Cancelled);
                }

                attempts += 1;
                let attempt_start = Instant::now();

                let err = match operation().await {
                    Ok(result) => {
                        if attempts > 1 {
                            info!(
                                "{} succeeded after {} attempts (cycle {})",
                                self.service, attempts, cycle
                            );
                        }
                        return Ok(result);
                    }
                    Err(err) => err,
                };

                self.report_failure(attempts, &err, attempt_start.elapsed())
                    .await;

                let delay = if step < self.config.inner_loop_retries {
                    schedule.next()
                } else if cycle < self.config.outer_loop_retries {
                    Some(self.config.outer_loop_delay())
                } else {
                    None
                };
                let Some(delay) = delay else {
                    last_error = Some(err);
                    break 'cycles;
                };

                let elapsed = start.elapsed();
                if elapsed + delay > budget {
                    warn!(
                        "{} retry budget {:?} would be exceeded (elapsed {:?}, next delay {:?})",
                        self.service, budget, elapsed, delay
                    );
                    if let Some(alerts) = &self.alerts {
                        alerts
                            .record_timeout_alert(&self.service, elapsed.as_millis() as u64)
                            .await;
                    }
                    return Err(RetryError::BudgetExceeded {
                        elapsed,
                        attempts,
                        last_error: err,
                    });
                }

                warn!(
                    "Attempt {} for {} failed: {}. Retrying in {:?}...",
                    attempts, self.service, err, delay
                );
                if !self.pause(delay).await {
                    info!("Shutdown requested, abandoning retries for {}", self.service);
                    return Err(RetryError::Cancelled);
                }
            }
        }

        let last_error =
            last_error.unwrap_or_else(|| anyhow::anyhow!("{} was never attempted", self.service));
        warn!(
            "{} failed after {} attempts: {}",
            self.service, attempts, last_error
        );
        if let Some(alerts) = &self.alerts {
            alerts
                .record_service_error_alert(&self.service, &last_error.to_string())
                .await;
        }
        Err(RetryError::Exhausted {
            attempts,
            last_error,
        })
    }

    async fn report_failure(&self, attempts: u32, err: &anyhow::Error, took: Duration) {
        let Some(alerts) = &self.alerts else {
            return;
        };

        if err.downcast_ref::<tokio::time::error::Elapsed>().is_some() {
            alerts
                .record_timeout_alert(&self.service, took.as_millis() as u64)
                .await;
        }
        alerts
            .record_retry_alert(attempts, &err.to_string(), &self.service)
            .await;
    }

    fn is_shutdown(&self) -> bool {
        self.shutdown.as_ref().is_some_and(|rx| *rx.borrow())
    }

    /// Sleeps for `delay`; returns `false` if shutdown fired first.
    async fn pause(&self, delay: Duration) -> bool {
        let Some(rx) = &self.shutdown else {
            sleep(delay).await;
            return true;
        };

        tokio::select! {
            _ = sleep(delay) => true,
            _ = wait_for_shutdown(rx.clone()) => false,
        }
    }
}

async fn wait_for_shutdown(mut rx: watch::Receiver<bool>) {
    // A dropped sender can never signal shutdown.
    if rx.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}
