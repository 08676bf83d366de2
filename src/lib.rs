//! # layered-retry
//!
//! Retry policy modelling and alert correlation for clients of a flaky
//! upstream service. A bounded inner exponential-backoff loop runs nested
//! inside a bounded outer cooldown loop, and an in-memory alert log records
//! what happened so that callers can correlate and dispatch notifications.
//!
//! ## Quick Start
//!
//! ```no_run
//! use layered_retry::{RetryPolicyEngine, RetryExecutor};
//! use layered_retry::alerts::{AlertCorrelationSystem, AlertSystemOptions, DispatchMode};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let mut engine = RetryPolicyEngine::default();
//! engine.load_from_environment();
//! assert!(engine.validate_retry_configuration());
//!
//! // [1000, 2000, 4000, 8000, 16000] with the defaults
//! let intervals = engine.generate_backoff_intervals(5);
//!
//! let alerts = AlertCorrelationSystem::with_mock_dispatch(
//!     AlertSystemOptions::for_mode(DispatchMode::Normal),
//! );
//! alerts.enable_monitoring().await;
//!
//! let executor = RetryExecutor::new(&engine, "BNE").with_alerts(alerts.clone());
//! let report = executor
//!     .run(|| async { Ok::<_, anyhow::Error>("delivered") })
//!     .await?;
//!
//! let triggered = alerts.check_triggered_alerts().await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Components
//!
//! - **Retry policy engine**: configuration, backoff schedules, expected execution time,
//!   validation, JSON export/import
//! - **Alert correlation system**: monitoring gate, typed/severity/windowed queries,
//!   upstream-dependency detection, JSON/CSV export
//! - **Dispatch**: email and SMS channels, mocked or delivered through webhooks, with an
//!   email-only mode that suppresses SMS
//! - **Retry executor**: runs an async operation through both loops with a timeout budget
//!   and shutdown cancellation
//!
//! ## Configuration
//!
//! Create a `config.toml` file; every key is optional:
//!
//! ```toml
//! [retry]
//! outer_loop_retries = 3
//! outer_loop_delay_ms = 30000
//! inner_loop_retries = 5
//! base_delay_ms = 1000
//! max_delay_ms = 60000
//! backoff_multiplier = 2.0
//! timeout_ms = 300000
//!
//! [alerts]
//! email_only = false
//! recipients = ["ops@example.com"]
//! sms_numbers = ["+15550100"]
//! ```
//!
//! `BNE_RETRY_*` environment variables overlay the retry section and
//! `EMAIL_ONLY_MODE=true` selects email-only dispatch.

pub mod alerts;
pub mod config;
pub mod dispatch;
pub mod executor;
pub mod retry;

// Re-export commonly used types at the crate root
pub use alerts::AlertCorrelationSystem;
pub use config::Config;
pub use executor::{RetryError, RetryExecutor};
pub use retry::{RetryConfiguration, RetryMetrics, RetryPolicyEngine};
