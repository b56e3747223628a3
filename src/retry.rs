//! Deferred re-delivery of leads whose POST cascade was exhausted.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

use crate::delivery::{DeliveryContext, DeliveryService};
use crate::models::{BackoffStrategy, LeadData, RetryPolicy};
use crate::registry::{eligible_service, BuyerRegistry};
use crate::response_parser::PostStatus;

/// One lead awaiting re-delivery to one buyer.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetryItem {
    pub lead: LeadData,
    pub buyer_id: String,
    pub auction_id: Option<String>,
    pub bid_amount: Option<f64>,
    /// Transaction entry of the POST that triggered the retry.
    pub origin_transaction_id: Option<String>,
    pub policy: RetryPolicy,
    /// Re-delivery attempts made so far.
    pub attempts: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub enqueued_at: DateTime<Utc>,
}

impl RetryItem {
    pub fn new(lead: LeadData, buyer_id: &str, policy: RetryPolicy, now: DateTime<Utc>) -> Self {
        let first_delay = compute_delay(&policy, 1);
        Self {
            lead,
            buyer_id: buyer_id.to_string(),
            auction_id: None,
            bid_amount: None,
            origin_transaction_id: None,
            policy,
            attempts: 0,
            next_attempt_at: now + to_chrono(first_delay),
            last_error: None,
            enqueued_at: now,
        }
    }

    pub fn with_auction(mut self, auction_id: &str, bid_amount: Option<f64>) -> Self {
        self.auction_id = Some(auction_id.to_string());
        self.bid_amount = bid_amount;
        self
    }

    pub fn with_origin(mut self, transaction_id: Option<String>, last_error: Option<String>) -> Self {
        self.origin_transaction_id = transaction_id;
        self.last_error = last_error;
        self
    }

    fn key(&self) -> (String, String) {
        (self.lead.id.clone(), self.buyer_id.clone())
    }
}

/// A retry that ran out of budget or can never succeed.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeadLetter {
    pub item: RetryItem,
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetrySweepReport {
    pub attempted: usize,
    pub delivered: usize,
    pub rescheduled: usize,
    pub dead_lettered: usize,
}

/// Delay before re-delivery attempt `attempt` (1-based), capped at the
/// policy's maximum.
pub fn compute_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let n = attempt.max(1);
    let base = policy.base_delay_ms;
    let raw = match policy.backoff {
        BackoffStrategy::Exponential => {
            let factor = 1u64.checked_shl(n - 1).unwrap_or(u64::MAX);
            base.saturating_mul(factor)
        }
        BackoffStrategy::Linear => base.saturating_mul(u64::from(n)),
        BackoffStrategy::Fixed => base,
    };
    Duration::from_millis(raw.min(policy.max_delay_ms))
}

fn to_chrono(delay: Duration) -> chrono::Duration {
    chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::weeks(52))
}

pub struct RetryHandler {
    registry: Arc<BuyerRegistry>,
    delivery: Arc<DeliveryService>,
    backlog: DashMap<(String, String), RetryItem>,
    dead_letters: Mutex<Vec<DeadLetter>>,
}

impl RetryHandler {
    pub fn new(registry: Arc<BuyerRegistry>, delivery: Arc<DeliveryService>) -> Self {
        Self {
            registry,
            delivery,
            backlog: DashMap::new(),
            dead_letters: Mutex::new(Vec::new()),
        }
    }

    /// Queues an item. An existing entry for the same lead and buyer is replaced.
    pub fn enqueue(&self, item: RetryItem) {
        if item.policy.max_attempts == 0 {
            self.dead_letter(item, "retries disabled by policy", Utc::now());
            return;
        }
        tracing::info!(
            "Queued retry for lead {} / buyer {} at {}",
            item.lead.id,
            item.buyer_id,
            item.next_attempt_at
        );
        self.backlog.insert(item.key(), item);
    }

    /// Dead-letters an item that can never be delivered as-is.
    pub fn park(&self, item: RetryItem, reason: &str) {
        self.dead_letter(item, reason, Utc::now());
    }

    pub fn pending(&self) -> Vec<RetryItem> {
        let mut items: Vec<RetryItem> = self.backlog.iter().map(|e| e.value().clone()).collect();
        items.sort_by_key(|item| item.next_attempt_at);
        items
    }

    pub fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_letters.lock().clone()
    }

    /// Delivers every item due at `now` through the shared delivery path.
    pub async fn process_due_at(&self, now: DateTime<Utc>) -> RetrySweepReport {
        let due: Vec<(String, String)> = self
            .backlog
            .iter()
            .filter(|e| e.value().next_attempt_at <= now)
            .map(|e| e.key().clone())
            .collect();

        let mut report = RetrySweepReport::default();
        for key in due {
            let Some((_, mut item)) = self.backlog.remove(&key) else {
                continue;
            };

            let Some(buyer) = self.registry.get(&item.buyer_id) else {
                self.dead_letter(item, "buyer no longer registered", now);
                report.dead_lettered += 1;
                continue;
            };
            let Some(service) = eligible_service(&buyer, &item.lead) else {
                self.dead_letter(item, "buyer or service no longer eligible", now);
                report.dead_lettered += 1;
                continue;
            };

            if !self.delivery.transport().is_available(&buyer.id) {
                let delay = compute_delay(&item.policy, item.attempts + 1);
                item.next_attempt_at = now + to_chrono(delay);
                self.backlog.entry(item.key()).or_insert(item);
                report.rescheduled += 1;
                continue;
            }

            report.attempted += 1;
            item.attempts += 1;
            if let Some(origin) = &item.origin_transaction_id {
                self.delivery.log().append_retry(origin);
            }

            let context =
                DeliveryContext::retry(item.auction_id.clone(), item.bid_amount, item.attempts);
            let post = self.delivery.deliver(&item.lead, &buyer, service, context).await;

            let status = post.status;
            match status {
                PostStatus::Delivered => {
                    report.delivered += 1;
                }
                PostStatus::Duplicate | PostStatus::Invalid => {
                    let reason = format!("buyer answered {}", status.as_str());
                    self.dead_letter(item, &reason, now);
                    report.dead_lettered += 1;
                }
                PostStatus::Failed => {
                    item.last_error = post.error.or(post.reason);
                    if item.attempts >= item.policy.max_attempts {
                        self.dead_letter(item, "retry attempts exhausted", now);
                        report.dead_lettered += 1;
                    } else {
                        let delay = compute_delay(&item.policy, item.attempts + 1);
                        item.next_attempt_at = now + to_chrono(delay);
                        // A fresher entry enqueued during the sweep wins.
                        self.backlog.entry(item.key()).or_insert(item);
                        report.rescheduled += 1;
                    }
                }
            }
        }

        if report.attempted > 0 || report.dead_lettered > 0 {
            tracing::info!(
                "Retry sweep: {} attempted, {} delivered, {} rescheduled, {} dead-lettered",
                report.attempted,
                report.delivered,
                report.rescheduled,
                report.dead_lettered
            );
        }
        report
    }

    /// Runs a sweep every `interval` in a background task.
    pub fn spawn_worker(self: Arc<Self>, interval: Duration) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.process_due_at(Utc::now()).await;
            }
        })
    }

    fn dead_letter(&self, item: RetryItem, reason: &str, now: DateTime<Utc>) {
        tracing::warn!(
            "Dead-lettered lead {} / buyer {} after {} attempt(s): {}",
            item.lead.id,
            item.buyer_id,
            item.attempts,
            reason
        );
        self.dead_letters.lock().push(DeadLetter {
            item,
            reason: reason.to_string(),
            dead_lettered_at: now,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(backoff: BackoffStrategy) -> RetryPolicy {
        RetryPolicy {
            max_attempts: 5,
            backoff,
            base_delay_ms: 1_000,
            max_delay_ms: 5_000,
        }
    }

    #[test]
    fn test_exponential_delay_doubles_and_caps() {
        let p = policy(BackoffStrategy::Exponential);
        let delays: Vec<u64> = (1..=5)
            .map(|n| compute_delay(&p, n).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![1_000, 2_000, 4_000, 5_000, 5_000]);
        assert_eq!(compute_delay(&p, 200), Duration::from_millis(5_000));
    }

    #[test]
    fn test_linear_and_fixed_delays() {
        let linear = policy(BackoffStrategy::Linear);
        assert_eq!(compute_delay(&linear, 3), Duration::from_millis(3_000));
        assert_eq!(compute_delay(&linear, 9), Duration::from_millis(5_000));

        let fixed = policy(BackoffStrategy::Fixed);
        assert_eq!(compute_delay(&fixed, 4), Duration::from_millis(1_000));
    }
}
