//! Alert rules and notification dispatch

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt::{Display, Formatter};
use std::sync::Arc;
use tracing::{error, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertCondition {
    /// A single operation took longer than `threshold` milliseconds
    QueryTime,
    /// The trailing-window error rate exceeded `threshold` (a fraction)
    ErrorRate,
    /// An operation failed to reach its backend
    ConnectionFailure,
}

impl Display for AlertCondition {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AlertCondition::QueryTime => "query_time",
            AlertCondition::ErrorRate => "error_rate",
            AlertCondition::ConnectionFailure => "connection_failure",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum NotificationChannel {
    Console,
    Webhook { url: String },
    Email { to: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertRule {
    pub id: String,
    pub condition: AlertCondition,
    pub threshold: f64,
    pub enabled: bool,
    pub channels: Vec<NotificationChannel>,
}

impl AlertRule {
    pub fn new(id: impl Into<String>, condition: AlertCondition, threshold: f64) -> Self {
        Self {
            id: id.into(),
            condition,
            threshold,
            enabled: true,
            channels: vec![NotificationChannel::Console],
        }
    }

    pub fn with_channel(mut self, channel: NotificationChannel) -> Self {
        if !self.channels.contains(&channel) {
            self.channels.push(channel);
        }
        self
    }
}

/// A triggered rule
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub rule_id: String,
    pub condition: AlertCondition,
    pub message: String,
    pub value: f64,
    pub threshold: f64,
    pub triggered_at: DateTime<Utc>,
}

/// Outbound mail, supplied by the host
pub trait Mailer: Send + Sync {
    fn send(&self, to: &str, subject: &str, body: &str) -> anyhow::Result<()>;
}

/// Slow queries, an error rate above 10% and connection failures
pub fn default_alert_rules() -> Vec<AlertRule> {
    vec![
        AlertRule::new("slow-query", AlertCondition::QueryTime, 5000.0),
        AlertRule::new("high-error-rate", AlertCondition::ErrorRate, 0.10),
        AlertRule::new("connection-failure", AlertCondition::ConnectionFailure, 1.0),
    ]
}

/// Deliver an alert to every channel of its rule
///
/// Console delivery is synchronous. Webhook and email deliveries run on
/// detached threads and only log their failures.
pub(crate) fn dispatch(alert: &Alert, channels: &[NotificationChannel], mailer: Option<Arc<dyn Mailer>>) {
    for channel in channels {
        match channel {
            NotificationChannel::Console => {
                error!(
                    rule = %alert.rule_id,
                    condition = %alert.condition,
                    value = alert.value,
                    threshold = alert.threshold,
                    "ALERT: {}",
                    alert.message
                );
            }
            NotificationChannel::Webhook { url } => {
                let url = url.clone();
                let payload = alert.clone();
                std::thread::spawn(move || {
                    if let Err(e) = ureq::post(&url).send_json(&payload) {
                        warn!("alert webhook {} failed: {}", url, e);
                    }
                });
            }
            NotificationChannel::Email { to } => {
                let Some(mailer) = mailer.clone() else {
                    warn!("alert {} has an email channel but no mailer is configured", alert.rule_id);
                    continue;
                };
                let to = to.clone();
                let subject = format!("[polystore] {} alert", alert.condition);
                let body = alert.message.clone();
                std::thread::spawn(move || {
                    if let Err(e) = mailer.send(&to, &subject, &body) {
                        warn!("alert email to {} failed: {:#}", to, e);
                    }
                });
            }
        }
    }
}
