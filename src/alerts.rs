use crate::dispatch::{preview, AlertDispatcher, MockDispatcher};
use chrono::{DateTime, SecondsFormat, Utc};
use rand::distr::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Upstream service whose failures raise the dependency alert.
pub const UPSTREAM_SERVICE: &str = "BNE";

pub const DEFAULT_RECENT_WINDOW_MINUTES: i64 = 10;

const CSV_HEADERS: [&str; 7] = [
    "ID",
    "Type",
    "Timestamp",
    "Severity",
    "Service",
    "RetryCount",
    "Error",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertType {
    RetryAttempt,
    RateLimit,
    ServiceError,
    Timeout,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::RetryAttempt => "retry_attempt",
            AlertType::RateLimit => "rate_limit",
            AlertType::ServiceError => "service_error",
            AlertType::Timeout => "timeout",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AlertDetails {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    #[serde(rename = "type")]
    pub alert_type: AlertType,
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    pub details: AlertDetails,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AlertSummary {
    pub total: usize,
    pub by_type: BTreeMap<AlertType, usize>,
    pub by_severity: BTreeMap<Severity, usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TriggeredAlerts {
    pub upstream_dependency_alert: bool,
    pub alert_count: usize,
    pub email_alerts: usize,
    pub sms_alerts: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchMode {
    #[default]
    Normal,
    /// SMS delivery is suppressed and reported as successful.
    EmailOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AlertSystemOptions {
    pub mode: DispatchMode,
    /// Seed representative alerts whenever monitoring is enabled.
    pub seed_mock_alerts: bool,
}

impl AlertSystemOptions {
    /// Email-only runs seed mock alerts; normal runs do not.
    pub fn for_mode(mode: DispatchMode) -> Self {
        Self {
            mode,
            seed_mock_alerts: mode == DispatchMode::EmailOnly,
        }
    }
}

#[derive(Debug, Default)]
struct AlertState {
    monitoring: bool,
    alerts: Vec<Alert>,
}

impl AlertState {
    fn push(&mut self, alert_type: AlertType, details: AlertDetails, severity: Severity) {
        let alert = Alert {
            id: generate_alert_id(),
            alert_type,
            timestamp: Utc::now(),
            severity,
            details,
        };
        info!(
            "Alert recorded: {} - {}",
            alert.alert_type.as_str(),
            alert.severity.as_str()
        );
        self.alerts.push(alert);
    }
}

fn generate_alert_id() -> String {
    let suffix: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(9)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect();
    format!("alert_{}_{}", Utc::now().timestamp_millis(), suffix)
}

fn recent_cutoff(now: DateTime<Utc>, window_minutes: i64) -> DateTime<Utc> {
    chrono::Duration::try_minutes(window_minutes)
        .and_then(|window| now.checked_sub_signed(window))
        .unwrap_or(if window_minutes > 0 {
            DateTime::<Utc>::MIN_UTC
        } else {
            DateTime::<Utc>::MAX_UTC
        })
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n', '\r']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

/// In-memory alert log with monitoring gate, correlation queries and
/// dual-channel dispatch.
///
/// Clones share the same log. The monitoring flag and the log sit behind one
/// lock so a toggle is never observed half-way by [`record_alert`](Self::record_alert).
#[derive(Clone)]
pub struct AlertCorrelationSystem {
    state: Arc<RwLock<AlertState>>,
    options: AlertSystemOptions,
    dispatcher: Arc<dyn AlertDispatcher>,
}

impl AlertCorrelationSystem {
    pub fn new(options: AlertSystemOptions, dispatcher: Arc<dyn AlertDispatcher>) -> Self {
        if options.mode == DispatchMode::EmailOnly {
            info!("Alert system initialized in email-only mode");
        }
        Self {
            state: Arc::new(RwLock::new(AlertState::default())),
            options,
            dispatcher,
        }
    }

    /// Alert system backed by a [`MockDispatcher`] with its default delivery delay.
    pub fn with_mock_dispatch(options: AlertSystemOptions) -> Self {
        Self::new(options, Arc::new(MockDispatcher::default()))
    }

    pub fn mode(&self) -> DispatchMode {
        self.options.mode
    }

    pub async fn is_monitoring(&self) -> bool {
        self.state.read().await.monitoring
    }

    pub async fn enable_monitoring(&self) {
        let mut state = self.state.write().await;
        state.monitoring = true;

        if self.options.mode == DispatchMode::EmailOnly {
            info!("Alert monitoring enabled (email-only, SMS alerts are mocked)");
        } else {
            info!("Alert monitoring enabled");
        }

        if self.options.seed_mock_alerts {
            state.push(
                AlertType::RetryAttempt,
                AlertDetails {
                    service: Some(UPSTREAM_SERVICE.to_string()),
                    retry_count: Some(3),
                    error: Some(format!("{} API connection timeout", UPSTREAM_SERVICE)),
                    duration_ms: None,
                },
                Severity::High,
            );
            state.push(
                AlertType::RateLimit,
                AlertDetails {
                    service: Some(UPSTREAM_SERVICE.to_string()),
                    duration_ms: Some(30_000),
                    ..Default::default()
                },
                Severity::Medium,
            );
            state.push(
                AlertType::ServiceError,
                AlertDetails {
                    service: Some(UPSTREAM_SERVICE.to_string()),
                    error: Some("Service temporarily unavailable".to_string()),
                    ..Default::default()
                },
                Severity::High,
            );
            info!("Mock alerts seeded");
        }
    }

    pub async fn disable_monitoring(&self) {
        self.state.write().await.monitoring = false;
        info!("Alert monitoring disabled");
    }

    /// Appends an alert. Silently dropped while monitoring is disabled.
    pub async fn record_alert(
        &self,
        alert_type: AlertType,
        details: AlertDetails,
        severity: Severity,
    ) {
        let mut state = self.state.write().await;
        if !state.monitoring {
            debug!("Monitoring disabled, dropping {} alert", alert_type.as_str());
            return;
        }
        state.push(alert_type, details, severity);
    }

    pub async fn record_retry_alert(&self, retry_count: u32, error: &str, service: &str) {
        let severity = if retry_count > 2 {
            Severity::High
        } else {
            Severity::Medium
        };
        let details = AlertDetails {
            service: Some(service.to_string()),
            retry_count: Some(retry_count),
            error: Some(error.to_string()),
            duration_ms: None,
        };
        self.record_alert(AlertType::RetryAttempt, details, severity).await;
    }

    pub async fn record_rate_limit_alert(&self, service: &str, duration_ms: u64) {
        let details = AlertDetails {
            service: Some(service.to_string()),
            duration_ms: Some(duration_ms),
            ..Default::default()
        };
        self.record_alert(AlertType::RateLimit, details, Severity::Medium).await;
    }

    pub async fn record_service_error_alert(&self, service: &str, error: &str) {
        let details = AlertDetails {
            service: Some(service.to_string()),
            error: Some(error.to_string()),
            ..Default::default()
        };
        self.record_alert(AlertType::ServiceError, details, Severity::High).await;
    }

    pub async fn record_timeout_alert(&self, service: &str, duration_ms: u64) {
        let severity = if duration_ms > 30_000 {
            Severity::Critical
        } else {
            Severity::High
        };
        let details = AlertDetails {
            service: Some(service.to_string()),
            duration_ms: Some(duration_ms),
            ..Default::default()
        };
        self.record_alert(AlertType::Timeout, details, severity).await;
    }

    /// Alerts newer than `window_minutes`, oldest first.
    ///
    /// A window reaching past the representable range covers the whole log;
    /// a zero or negative window matches nothing.
    pub async fn get_recent_alerts(&self, window_minutes: i64) -> Vec<Alert> {
        let cutoff = recent_cutoff(Utc::now(), window_minutes);
        self.filtered(|alert| alert.timestamp > cutoff).await
    }

    pub async fn get_all_alerts(&self) -> Vec<Alert> {
        self.state.read().await.alerts.clone()
    }

    pub async fn get_alerts_by_type(&self, alert_type: AlertType) -> Vec<Alert> {
        self.filtered(|alert| alert.alert_type == alert_type).await
    }

    pub async fn get_alerts_by_severity(&self, severity: Severity) -> Vec<Alert> {
        self.filtered(|alert| alert.severity == severity).await
    }

    async fn filtered<P>(&self, predicate: P) -> Vec<Alert>
    where
        P: Fn(&Alert) -> bool,
    {
        self.state
            .read()
            .await
            .alerts
            .iter()
            .filter(|alert| predicate(alert))
            .cloned()
            .collect()
    }

    /// Correlates the default recent window. Channel counts are an even split
    /// of the window in normal mode, not a per-alert attribution.
    pub async fn check_triggered_alerts(&self) -> TriggeredAlerts {
        let recent = self.get_recent_alerts(DEFAULT_RECENT_WINDOW_MINUTES).await;
        let alert_count = recent.len();

        let upstream_dependency_alert = recent.iter().any(|alert| {
            alert.alert_type == AlertType::ServiceError
                && alert.details.service.as_deref() == Some(UPSTREAM_SERVICE)
        });

        let (email_alerts, sms_alerts) = match self.options.mode {
            DispatchMode::EmailOnly => (alert_count, 0),
            DispatchMode::Normal => (alert_count / 2, alert_count / 2),
        };

        TriggeredAlerts {
            upstream_dependency_alert,
            alert_count,
            email_alerts,
            sms_alerts,
        }
    }

    pub async fn send_email_alert(
        &self,
        recipients: &[String],
        subject: &str,
        content: &str,
    ) -> bool {
        self.dispatcher
            .send_email(recipients, subject, content)
            .await
    }

    /// In email-only mode nothing is sent and the call reports success.
    pub async fn send_sms_alert(&self, phone_number: &str, message: &str) -> bool {
        if self.options.mode == DispatchMode::EmailOnly {
            info!(
                "SMS alert skipped (email-only mode) to {} message={:?}...",
                phone_number,
                preview(message, 50)
            );
            return true;
        }
        self.dispatcher.send_sms(phone_number, message).await
    }

    pub async fn clear_previous_alerts(&self) {
        self.state.write().await.alerts.clear();
        info!("Previous alerts cleared");
    }

    /// Drops alerts whose service name contains "test".
    pub async fn clear_test_alerts(&self) {
        let mut state = self.state.write().await;
        let before = state.alerts.len();
        state.alerts.retain(|alert| {
            !alert
                .details
                .service
                .as_deref()
                .is_some_and(|service| service.contains("test"))
        });
        info!("Test alerts cleared ({} removed)", before - state.alerts.len());
    }

    pub async fn get_alert_summary(&self) -> AlertSummary {
        let state = self.state.read().await;
        let mut summary = AlertSummary {
            total: state.alerts.len(),
            ..Default::default()
        };

        for alert in &state.alerts {
            *summary.by_type.entry(alert.alert_type).or_insert(0) += 1;
            *summary.by_severity.entry(alert.severity).or_insert(0) += 1;
        }

        summary
    }

    pub async fn export_alerts_to_json(&self) -> String {
        let state = self.state.read().await;
        serde_json::to_string_pretty(&state.alerts).unwrap_or_else(|err| {
            warn!("Failed to serialize alerts: {}", err);
            "[]".to_string()
        })
    }

    pub async fn export_alerts_to_csv(&self) -> String {
        let state = self.state.read().await;
        let mut lines = Vec::with_capacity(state.alerts.len() + 1);
        lines.push(CSV_HEADERS.join(","));

        for alert in &state.alerts {
            let retry_count = alert
                .details
                .retry_count
                .map(|count| count.to_string())
                .unwrap_or_default();
            let row = [
                csv_field(&alert.id),
                alert.alert_type.as_str().to_string(),
                alert.timestamp.to_rfc3339_opts(SecondsFormat::Millis, true),
                alert.severity.as_str().to_string(),
                csv_field(alert.details.service.as_deref().unwrap_or("")),
                retry_count,
                csv_field(alert.details.error.as_deref().unwrap_or("")),
            ];
            lines.push(row.join(","));
        }

        lines.join("\n")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn system(mode: DispatchMode) -> AlertCorrelationSystem {
        AlertCorrelationSystem::new(
            AlertSystemOptions::for_mode(mode),
            Arc::new(MockDispatcher::new(Duration::ZERO)),
        )
    }

    #[test]
    fn test_alert_id_format() {
        let id = generate_alert_id();
        let parts: Vec<&str> = id.split('_').collect();
        assert_eq!(parts.len(), 3);
        assert_eq!(parts[0], "alert");
        assert!(parts[1].parse::<i64>().is_ok());
        assert_eq!(parts[2].len(), 9);
        assert!(parts[2]
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
    }

    #[test]
    fn test_recent_cutoff_bounds() {
        let now = Utc::now();
        assert_eq!(recent_cutoff(now, 10), now - chrono::Duration::minutes(10));
        assert_eq!(recent_cutoff(now, 0), now);
        assert_eq!(recent_cutoff(now, i64::MAX), DateTime::<Utc>::MIN_UTC);
        assert_eq!(
            recent_cutoff(now, 1_000_000_000_000),
            DateTime::<Utc>::MIN_UTC
        );
        assert_eq!(recent_cutoff(now, i64::MIN), DateTime::<Utc>::MAX_UTC);
    }

    #[tokio::test]
    async fn test_recent_alerts_custom_window() {
        let system = system(DispatchMode::Normal);
        system.enable_monitoring().await;
        system.record_rate_limit_alert("BNE", 429).await;
        system.record_rate_limit_alert("BNE", 429).await;
        {
            let mut state = system.state.write().await;
            state.alerts[0].timestamp = Utc::now() - chrono::Duration::minutes(30);
        }
        let backdated = system.get_all_alerts().await[0].id.clone();

        let wide = system.get_recent_alerts(60).await;
        assert_eq!(wide.len(), 2);
        assert_eq!(wide[0].id, backdated);

        let narrow = system.get_recent_alerts(DEFAULT_RECENT_WINDOW_MINUTES).await;
        assert_eq!(narrow.len(), 1);
        assert_ne!(narrow[0].id, backdated);

        assert!(system.get_recent_alerts(0).await.is_empty());
        assert!(system.get_recent_alerts(-5).await.is_empty());
        assert!(system.get_recent_alerts(i64::MIN).await.is_empty());
        assert_eq!(system.get_recent_alerts(i64::MAX).await.len(), 2);
        assert_eq!(system.get_recent_alerts(1_000_000_000_000).await.len(), 2);
    }

    #[test]
    fn test_csv_field_quoting() {
        assert_eq!(csv_field("plain"), "plain");
        assert_eq!(csv_field("a,b"), "\"a,b\"");
        assert_eq!(csv_field("say \"hi\""), "\"say \"\"hi\"\"\"");
    }

    #[test]
    fn test_options_for_mode() {
        assert!(AlertSystemOptions::for_mode(DispatchMode::EmailOnly).seed_mock_alerts);
        assert!(!AlertSystemOptions::for_mode(DispatchMode::Normal).seed_mock_alerts);
    }

    #[tokio::test]
    async fn test_monitoring_toggle() {
        let alerts = system(DispatchMode::Normal);
        assert!(!alerts.is_monitoring().await);
        alerts.enable_monitoring().await;
        assert!(alerts.is_monitoring().await);
        alerts.disable_monitoring().await;
        assert!(!alerts.is_monitoring().await);
    }

    #[tokio::test]
    async fn test_recent_window_excludes_old_alerts() {
        let alerts = system(DispatchMode::Normal);
        alerts.enable_monitoring().await;
        alerts.record_service_error_alert("BNE", "boom").await;

        {
            let mut state = alerts.state.write().await;
            state.alerts[0].timestamp = Utc::now() - chrono::Duration::minutes(11);
        }
        alerts.record_rate_limit_alert("BNE", 1_000).await;

        let recent = alerts.get_recent_alerts(DEFAULT_RECENT_WINDOW_MINUTES).await;
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].alert_type, AlertType::RateLimit);

        let triggered = alerts.check_triggered_alerts().await;
        assert!(!triggered.upstream_dependency_alert);
        assert_eq!(triggered.alert_count, 1);
    }

    #[tokio::test]
    async fn test_clones_share_log() {
        let alerts = system(DispatchMode::Normal);
        let other = alerts.clone();
        alerts.enable_monitoring().await;
        other.record_timeout_alert("BNE", 1_000).await;
        assert_eq!(alerts.get_all_alerts().await.len(), 1);
    }
}
