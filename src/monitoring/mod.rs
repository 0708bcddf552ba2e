//! Operation metrics, health classification and alerting
//!
//! Metrics live in a bounded ring buffer: the oldest entry is evicted once
//! `capacity` is reached and entries older than `max_age` are pruned on
//! every record. Health is computed over the trailing five minutes:
//!
//! | Status | Error rate | Average latency |
//! |--------|------------|-----------------|
//! | critical | > 10% | or > 5000 ms |
//! | degraded | > 5% | or > 2000 ms |
//! | healthy | otherwise | |

pub mod alerts;

pub use alerts::{default_alert_rules, Alert, AlertCondition, AlertRule, Mailer, NotificationChannel};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::Duration;
use tracing::debug;

/// Window used for health classification
pub const HEALTH_WINDOW: Duration = Duration::from_secs(5 * 60);

const CRITICAL_ERROR_RATE: f64 = 0.10;
const CRITICAL_LATENCY_MS: f64 = 5000.0;
const DEGRADED_ERROR_RATE: f64 = 0.05;
const DEGRADED_LATENCY_MS: f64 = 2000.0;

/// Operations needed in the window before the error-rate alert is evaluated
const MIN_SAMPLES_FOR_RATE: u64 = 10;

const RECENT_ALERTS: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetric {
    pub timestamp: DateTime<Utc>,
    pub operation: String,
    pub collection: String,
    pub duration_ms: f64,
    pub success: bool,
    /// Error kind, see [`DataError::kind`](crate::DataError::kind)
    pub error: Option<String>,
}

impl PerformanceMetric {
    pub fn success(operation: impl Into<String>, collection: impl Into<String>, duration: Duration) -> Self {
        Self {
            timestamp: Utc::now(),
            operation: operation.into(),
            collection: collection.into(),
            duration_ms: duration.as_secs_f64() * 1000.0,
            success: true,
            error: None,
        }
    }

    pub fn failure(
        operation: impl Into<String>,
        collection: impl Into<String>,
        duration: Duration,
        error: impl Into<String>,
    ) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            ..Self::success(operation, collection, duration)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
    pub total_operations: u64,
    pub avg_query_time_ms: f64,
    /// Fractions in `0.0..=1.0`
    pub success_rate: f64,
    pub error_rate: f64,
    pub slow_queries: u64,
    pub errors_by_type: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthState {
    Healthy,
    Degraded,
    Critical,
}

impl HealthState {
    pub fn classify(error_rate: f64, avg_query_time_ms: f64) -> Self {
        if error_rate > CRITICAL_ERROR_RATE || avg_query_time_ms > CRITICAL_LATENCY_MS {
            HealthState::Critical
        } else if error_rate > DEGRADED_ERROR_RATE || avg_query_time_ms > DEGRADED_LATENCY_MS {
            HealthState::Degraded
        } else {
            HealthState::Healthy
        }
    }
}

impl std::fmt::Display for HealthState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            HealthState::Healthy => "healthy",
            HealthState::Degraded => "degraded",
            HealthState::Critical => "critical",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: HealthState,
    pub avg_query_time_ms: f64,
    pub error_rate: f64,
    pub last_checked: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MonitoringSettings {
    /// Ring buffer size
    pub capacity: usize,
    pub max_age: Duration,
    /// Operations slower than this count as slow queries
    pub slow_query_ms: f64,
}

impl Default for MonitoringSettings {
    fn default() -> Self {
        Self {
            capacity: 1000,
            max_age: Duration::from_secs(60 * 60),
            slow_query_ms: 1000.0,
        }
    }
}

pub struct MonitoringService {
    settings: MonitoringSettings,
    metrics: Mutex<VecDeque<PerformanceMetric>>,
    rules: RwLock<Vec<AlertRule>>,
    alerts: Mutex<VecDeque<Alert>>,
    mailer: RwLock<Option<Arc<dyn Mailer>>>,
}

/// Oldest timestamp still inside `age`
fn cutoff(age: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(age)
        .ok()
        .and_then(|age| Utc::now().checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MonitoringService {
    pub fn new(settings: MonitoringSettings) -> Self {
        let capacity = settings.capacity.max(1);
        Self {
            settings: MonitoringSettings { capacity, ..settings },
            metrics: Mutex::new(VecDeque::with_capacity(capacity)),
            rules: RwLock::new(Vec::new()),
            alerts: Mutex::new(VecDeque::new()),
            mailer: RwLock::new(None),
        }
    }

    /// Default settings plus [`default_alert_rules`]
    pub fn with_default_rules(settings: MonitoringSettings) -> Self {
        let service = Self::new(settings);
        for rule in default_alert_rules() {
            service.add_alert_rule(rule);
        }
        service
    }

    pub fn settings(&self) -> &MonitoringSettings {
        &self.settings
    }

    pub fn set_mailer(&self, mailer: Arc<dyn Mailer>) {
        *self.mailer.write().unwrap_or_else(|p| p.into_inner()) = Some(mailer);
    }

    pub fn record_metric(&self, metric: PerformanceMetric) {
        {
            let mut metrics = lock(&self.metrics);
            if metrics.len() >= self.settings.capacity {
                metrics.pop_front();
            }
            metrics.push_back(metric.clone());
            let cutoff = cutoff(self.settings.max_age);
            while metrics.front().is_some_and(|m| m.timestamp < cutoff) {
                metrics.pop_front();
            }
        }
        self.evaluate_alerts(&metric);
    }

    pub fn metric_count(&self) -> usize {
        lock(&self.metrics).len()
    }

    pub fn clear(&self) {
        lock(&self.metrics).clear();
    }

    /// Aggregate over metrics recorded within `window` of now
    pub fn get_statistics(&self, window: Duration) -> Statistics {
        let cutoff = cutoff(window);
        let metrics = lock(&self.metrics);
        let mut stats = Statistics::default();
        let mut total_ms = 0.0;
        let mut failures = 0u64;

        for metric in metrics.iter().filter(|m| m.timestamp >= cutoff) {
            stats.total_operations += 1;
            total_ms += metric.duration_ms;
            if metric.duration_ms > self.settings.slow_query_ms {
                stats.slow_queries += 1;
            }
            if !metric.success {
                failures += 1;
                let kind = metric.error.clone().unwrap_or_else(|| "unknown".to_string());
                *stats.errors_by_type.entry(kind).or_default() += 1;
            }
        }

        if stats.total_operations > 0 {
            let total = stats.total_operations as f64;
            stats.avg_query_time_ms = total_ms / total;
            stats.error_rate = failures as f64 / total;
            stats.success_rate = 1.0 - stats.error_rate;
        } else {
            stats.success_rate = 1.0;
        }
        stats
    }

    pub fn get_health_status(&self) -> HealthStatus {
        let stats = self.get_statistics(HEALTH_WINDOW);
        HealthStatus {
            status: HealthState::classify(stats.error_rate, stats.avg_query_time_ms),
            avg_query_time_ms: stats.avg_query_time_ms,
            error_rate: stats.error_rate,
            last_checked: Utc::now(),
        }
    }

    // -------------------------------------------------------------------------
    // Alerts
    // -------------------------------------------------------------------------

    /// Add a rule, replacing any rule with the same id
    pub fn add_alert_rule(&self, rule: AlertRule) {
        let mut rules = self.rules.write().unwrap_or_else(|p| p.into_inner());
        rules.retain(|r| r.id != rule.id);
        rules.push(rule);
    }

    pub fn remove_alert_rule(&self, id: &str) -> bool {
        let mut rules = self.rules.write().unwrap_or_else(|p| p.into_inner());
        let before = rules.len();
        rules.retain(|r| r.id != id);
        rules.len() != before
    }

    pub fn alert_rules(&self) -> Vec<AlertRule> {
        self.rules.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    /// Most recent alerts, oldest first
    pub fn recent_alerts(&self) -> Vec<Alert> {
        lock(&self.alerts).iter().cloned().collect()
    }

    fn evaluate_alerts(&self, metric: &PerformanceMetric) {
        let rules: Vec<AlertRule> = self.alert_rules().into_iter().filter(|r| r.enabled).collect();
        if rules.is_empty() {
            return;
        }
        let mailer = self.mailer.read().unwrap_or_else(|p| p.into_inner()).clone();

        for rule in rules {
            let triggered = match rule.condition {
                AlertCondition::QueryTime => (metric.duration_ms > rule.threshold).then(|| {
                    (
                        metric.duration_ms,
                        format!(
                            "{} on {} took {:.0} ms (threshold {:.0} ms)",
                            metric.operation, metric.collection, metric.duration_ms, rule.threshold
                        ),
                    )
                }),
                AlertCondition::ErrorRate => {
                    if metric.success {
                        None
                    } else {
                        let stats = self.get_statistics(HEALTH_WINDOW);
                        (stats.total_operations >= MIN_SAMPLES_FOR_RATE && stats.error_rate > rule.threshold)
                            .then(|| {
                                (
                                    stats.error_rate,
                                    format!(
                                        "error rate {:.1}% over the last {} operations (threshold {:.1}%)",
                                        stats.error_rate * 100.0,
                                        stats.total_operations,
                                        rule.threshold * 100.0
                                    ),
                                )
                            })
                    }
                }
                AlertCondition::ConnectionFailure => (metric.error.as_deref() == Some("connection")).then(|| {
                    (
                        1.0,
                        format!("{} on {} could not reach its backend", metric.operation, metric.collection),
                    )
                }),
            };

            if let Some((value, message)) = triggered {
                let alert = Alert {
                    rule_id: rule.id.clone(),
                    condition: rule.condition,
                    message,
                    value,
                    threshold: rule.threshold,
                    triggered_at: Utc::now(),
                };
                alerts::dispatch(&alert, &rule.channels, mailer.clone());
                let mut recent = lock(&self.alerts);
                if recent.len() >= RECENT_ALERTS {
                    recent.pop_front();
                }
                recent.push_back(alert);
                debug!("alert {} triggered", rule.id);
            }
        }
    }
}

impl Default for MonitoringService {
    fn default() -> Self {
        Self::new(MonitoringSettings::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(service: &MonitoringService, total: usize, failures: usize, duration_ms: u64) {
        for i in 0..total {
            let duration = Duration::from_millis(duration_ms);
            let metric = if i < failures {
                PerformanceMetric::failure("select", "projects", duration, "adapter")
            } else {
                PerformanceMetric::success("select", "projects", duration)
            };
            service.record_metric(metric);
        }
    }

    #[test]
    fn test_fifteen_percent_failures_is_critical() {
        let service = MonitoringService::default();
        feed(&service, 100, 15, 20);
        let health = service.get_health_status();
        assert_eq!(health.status, HealthState::Critical);
        assert!((health.error_rate - 0.15).abs() < 1e-9);
    }

    #[test]
    fn test_three_percent_failures_at_500ms_is_healthy() {
        let service = MonitoringService::default();
        feed(&service, 100, 3, 500);
        let health = service.get_health_status();
        assert_eq!(health.status, HealthState::Healthy);
        assert!((health.avg_query_time_ms - 500.0).abs() < 1e-6);
    }

    #[test]
    fn test_classification_boundaries() {
        assert_eq!(HealthState::classify(0.10, 100.0), HealthState::Degraded);
        assert_eq!(HealthState::classify(0.05, 2000.0), HealthState::Healthy);
        assert_eq!(HealthState::classify(0.0, 2500.0), HealthState::Degraded);
        assert_eq!(HealthState::classify(0.0, 5001.0), HealthState::Critical);
    }

    #[test]
    fn test_ring_buffer_eviction_and_age_pruning() {
        let service = MonitoringService::new(MonitoringSettings {
            capacity: 10,
            ..Default::default()
        });
        feed(&service, 25, 0, 1);
        assert_eq!(service.metric_count(), 10);

        service.clear();
        let mut stale = PerformanceMetric::success("select", "projects", Duration::from_millis(1));
        stale.timestamp = Utc::now() - chrono::Duration::hours(2);
        service.record_metric(stale);
        assert_eq!(service.metric_count(), 0);
    }

    #[test]
    fn test_statistics() {
        let service = MonitoringService::default();
        feed(&service, 4, 1, 1500);
        let stats = service.get_statistics(Duration::from_secs(60));
        assert_eq!(stats.total_operations, 4);
        assert_eq!(stats.slow_queries, 4);
        assert_eq!(stats.errors_by_type.get("adapter"), Some(&1));
        assert!((stats.success_rate - 0.75).abs() < 1e-9);

        let empty = MonitoringService::default().get_statistics(Duration::from_secs(60));
        assert_eq!(empty.total_operations, 0);
        assert_eq!(empty.success_rate, 1.0);
    }

    #[test]
    fn test_alert_rules() {
        let service = MonitoringService::with_default_rules(MonitoringSettings::default());
        assert_eq!(service.alert_rules().len(), 3);

        service.record_metric(PerformanceMetric::success("select", "projects", Duration::from_millis(6000)));
        service.record_metric(PerformanceMetric::failure(
            "select",
            "projects",
            Duration::from_millis(5),
            "connection",
        ));
        let fired: Vec<String> = service.recent_alerts().into_iter().map(|a| a.rule_id).collect();
        assert_eq!(fired, vec!["slow-query".to_string(), "connection-failure".to_string()]);

        assert!(service.remove_alert_rule("slow-query"));
        assert!(!service.remove_alert_rule("slow-query"));
        service.record_metric(PerformanceMetric::success("select", "projects", Duration::from_millis(6000)));
        assert_eq!(service.recent_alerts().len(), 2);
    }

    #[test]
    fn test_connection_errors_raise_the_connection_alert() {
        let service = MonitoringService::with_default_rules(MonitoringSettings::default());
        let err = crate::error::DataError::Connection {
            target: "supabase".to_string(),
            reason: "connection refused".to_string(),
        };
        service.record_metric(PerformanceMetric::failure(
            "select",
            "projects",
            Duration::from_millis(3),
            err.kind(),
        ));
        let fired: Vec<String> = service.recent_alerts().into_iter().map(|a| a.rule_id).collect();
        assert_eq!(fired, vec!["connection-failure".to_string()]);
    }

    #[test]
    fn test_error_rate_alert_needs_samples() {
        let service = MonitoringService::new(MonitoringSettings::default());
        service.add_alert_rule(AlertRule::new("errors", AlertCondition::ErrorRate, 0.10));
        feed(&service, 3, 3, 1);
        assert!(service.recent_alerts().is_empty());
        feed(&service, 10, 0, 1);
        assert!(service.recent_alerts().is_empty());
        // 4 failures in 14 operations
        feed(&service, 1, 1, 1);
        assert_eq!(service.recent_alerts().len(), 1);
    }
}
