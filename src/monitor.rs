//! Performance monitoring and alerting.
//!
//! Components push latency and outcome samples here. Metrics are smoothed
//! with an exponential moving average and compared against thresholds; an
//! alert is advisory only and never blocks the operation that produced it.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::time::Duration;
use uuid::Uuid;

use crate::models::AuctionStatus;

const EMA_ALPHA: f64 = 0.2;
const MAX_ALERTS: usize = 500;
const MIN_ERROR_RATE_SAMPLES: u64 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertKind {
    TransformationTime,
    ValidationTime,
    AuctionDuration,
    BuyerResponseTime,
    BuyerErrorRate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub id: String,
    pub level: AlertLevel,
    pub kind: AlertKind,
    pub message: String,
    pub value: f64,
    pub threshold: f64,
    pub buyer_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Warning / error / critical cut-offs for one metric.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Thresholds {
    pub warning: f64,
    pub error: f64,
    pub critical: f64,
}

impl Thresholds {
    pub const fn new(warning: f64, error: f64, critical: f64) -> Self {
        Self {
            warning,
            error,
            critical,
        }
    }

    /// Highest level crossed by `value`, with its threshold.
    pub fn level_for(&self, value: f64) -> Option<(AlertLevel, f64)> {
        if value >= self.critical {
            Some((AlertLevel::Critical, self.critical))
        } else if value >= self.error {
            Some((AlertLevel::Error, self.error))
        } else if value >= self.warning {
            Some((AlertLevel::Warning, self.warning))
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorThresholds {
    pub transformation_ms: Thresholds,
    pub validation_ms: Thresholds,
    pub auction_ms: Thresholds,
    pub buyer_response_ms: Thresholds,
    pub buyer_error_rate: Thresholds,
}

impl Default for MonitorThresholds {
    fn default() -> Self {
        Self {
            transformation_ms: Thresholds::new(50.0, 150.0, 500.0),
            validation_ms: Thresholds::new(20.0, 50.0, 200.0),
            auction_ms: Thresholds::new(2_000.0, 5_000.0, 10_000.0),
            buyer_response_ms: Thresholds::new(1_000.0, 3_000.0, 5_000.0),
            buyer_error_rate: Thresholds::new(0.10, 0.25, 0.50),
        }
    }
}

/// Exponential moving average; the first sample seeds the value.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Ema {
    pub value: f64,
    pub samples: u64,
}

impl Ema {
    pub fn update(&mut self, sample: f64) -> f64 {
        self.value = if self.samples == 0 {
            sample
        } else {
            EMA_ALPHA * sample + (1.0 - EMA_ALPHA) * self.value
        };
        self.samples += 1;
        self.value
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuyerMetrics {
    pub response_time_ms: Ema,
    pub success_rate: Ema,
    pub error_rate: Ema,
    pub requests: u64,
    pub failures: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemMetrics {
    pub transformation_ms: Ema,
    pub validation_ms: Ema,
    pub auction_ms: Ema,
    pub transformations: u64,
    pub transformation_failures: u64,
    pub auctions_by_status: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorSnapshot {
    pub system: SystemMetrics,
    pub buyers: BTreeMap<String, BuyerMetrics>,
    pub alert_count: usize,
}

pub struct PerformanceMonitor {
    thresholds: MonitorThresholds,
    system: Mutex<SystemMetrics>,
    buyers: DashMap<String, BuyerMetrics>,
    alerts: Mutex<VecDeque<Alert>>,
}

impl Default for PerformanceMonitor {
    fn default() -> Self {
        Self::new(MonitorThresholds::default())
    }
}

impl PerformanceMonitor {
    pub fn new(thresholds: MonitorThresholds) -> Self {
        Self {
            thresholds,
            system: Mutex::new(SystemMetrics::default()),
            buyers: DashMap::new(),
            alerts: Mutex::new(VecDeque::new()),
        }
    }

    pub fn record_transformation(&self, duration: Duration, success: bool) {
        let ms = as_ms(duration);
        let avg = {
            let mut system = self.system.lock();
            system.transformations += 1;
            if !success {
                system.transformation_failures += 1;
            }
            system.transformation_ms.update(ms)
        };
        self.check(
            AlertKind::TransformationTime,
            self.thresholds.transformation_ms,
            avg,
            None,
        );
    }

    pub fn record_validation(&self, duration: Duration) {
        let avg = self.system.lock().validation_ms.update(as_ms(duration));
        self.check(AlertKind::ValidationTime, self.thresholds.validation_ms, avg, None);
    }

    pub fn record_auction(&self, duration: Duration, status: AuctionStatus) {
        let avg = {
            let mut system = self.system.lock();
            let key = serde_json::to_value(status)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_else(|| format!("{:?}", status));
            *system.auctions_by_status.entry(key).or_insert(0) += 1;
            system.auction_ms.update(as_ms(duration))
        };
        self.check(AlertKind::AuctionDuration, self.thresholds.auction_ms, avg, None);
    }

    pub fn record_buyer_response(&self, buyer_id: &str, duration: Duration, success: bool) {
        let (avg_ms, error_rate, samples) = {
            let mut metrics = self.buyers.entry(buyer_id.to_string()).or_default();
            metrics.requests += 1;
            if !success {
                metrics.failures += 1;
            }
            let outcome = if success { 1.0 } else { 0.0 };
            metrics.success_rate.update(outcome);
            let error_rate = metrics.error_rate.update(1.0 - outcome);
            let avg_ms = metrics.response_time_ms.update(as_ms(duration));
            (avg_ms, error_rate, metrics.requests)
        };

        self.check(
            AlertKind::BuyerResponseTime,
            self.thresholds.buyer_response_ms,
            avg_ms,
            Some(buyer_id),
        );
        if samples >= MIN_ERROR_RATE_SAMPLES {
            self.check(
                AlertKind::BuyerErrorRate,
                self.thresholds.buyer_error_rate,
                error_rate,
                Some(buyer_id),
            );
        }
    }

    pub fn buyer_metrics(&self, buyer_id: &str) -> Option<BuyerMetrics> {
        self.buyers.get(buyer_id).map(|m| m.clone())
    }

    pub fn snapshot(&self) -> MonitorSnapshot {
        MonitorSnapshot {
            system: self.system.lock().clone(),
            buyers: self
                .buyers
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().clone()))
                .collect(),
            alert_count: self.alerts.lock().len(),
        }
    }

    /// Most recent alerts, newest last.
    pub fn alerts(&self, limit: Option<usize>) -> Vec<Alert> {
        let alerts = self.alerts.lock();
        let skip = limit.map_or(0, |n| alerts.len().saturating_sub(n));
        alerts.iter().skip(skip).cloned().collect()
    }

    fn check(&self, kind: AlertKind, thresholds: Thresholds, value: f64, buyer_id: Option<&str>) {
        let Some((level, threshold)) = thresholds.level_for(value) else {
            return;
        };

        let subject = buyer_id.map_or_else(String::new, |id| format!(" for buyer {}", id));
        let message = format!(
            "{:?}{} at {:.2} exceeds {:?} threshold {:.2}",
            kind, subject, value, level, threshold
        );
        match level {
            AlertLevel::Warning => tracing::warn!("{}", message),
            AlertLevel::Error | AlertLevel::Critical => tracing::error!("{}", message),
        }

        let mut alerts = self.alerts.lock();
        alerts.push_back(Alert {
            id: Uuid::new_v4().to_string(),
            level,
            kind,
            message,
            value,
            threshold,
            buyer_id: buyer_id.map(str::to_string),
            created_at: Utc::now(),
        });
        while alerts.len() > MAX_ALERTS {
            alerts.pop_front();
        }
    }
}

fn as_ms(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1_000.0
}
