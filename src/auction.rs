//! PING/POST auction engine.
//!
//! One auction per lead:
//! 1. Concurrent PINGs to every eligible buyer, each under its own timeout
//! 2. Rank accepted, priced bids
//! 3. Sequential POST cascade down the ranking until one buyer takes the lead
//! 4. Exhausted cascades go to the retry handler unless the lead was invalid

use chrono::Utc;
use futures::future::join_all;
use serde_json::Value;
use std::cmp::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::buyer_client::OutboundRequest;
use crate::delivery::{DeliveryContext, DeliveryService};
use crate::errors::{AuctionError, TransportError};
use crate::models::{
    AuctionOutcome, AuctionResult, AuctionStatus, BidResponse, BuyerConfig, CallKind, LeadData,
    PostResult, TransactionAction,
};
use crate::pricing::{price_bid, BidPrice};
use crate::registry::{eligible_service, BuyerRegistry};
use crate::response_parser::{PingStatus, PostStatus};
use crate::retry::{RetryHandler, RetryItem};
use crate::template_engine::flatten_lead;
use crate::transaction_log::LogEntry;

/// Per-lead auction progress, logged at each transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuctionState {
    CollectingBids,
    SelectingWinner,
    Delivering,
    Delivered,
    Cascading,
    Exhausted,
}

/// One PING's outcome plus what the transaction log needs to know about it.
struct PingOutcome {
    bid: BidResponse,
    http_status: Option<u16>,
    log_status: String,
}

pub struct AuctionEngine {
    registry: Arc<BuyerRegistry>,
    delivery: Arc<DeliveryService>,
    retry: Option<Arc<RetryHandler>>,
    ping_permits: Arc<Semaphore>,
}

impl AuctionEngine {
    pub fn new(
        registry: Arc<BuyerRegistry>,
        delivery: Arc<DeliveryService>,
        retry: Option<Arc<RetryHandler>>,
        max_concurrent_pings: usize,
    ) -> Self {
        Self {
            registry,
            delivery,
            retry,
            ping_permits: Arc::new(Semaphore::new(max_concurrent_pings.max(1))),
        }
    }

    /// Runs a complete auction. Every failure is reported inside the result.
    pub async fn run_auction(&self, lead: &LeadData) -> AuctionResult {
        let started = Instant::now();
        let auction_id = Uuid::new_v4().to_string();
        let mut result = AuctionResult {
            auction_id: auction_id.clone(),
            lead_id: lead.id.clone(),
            status: AuctionStatus::NoBids,
            winning_buyer_id: None,
            winning_bid_amount: None,
            bids: Vec::new(),
            duration_ms: 0,
            participant_count: 0,
            post_result: None,
            delivery_attempts: Vec::new(),
            retry_scheduled: false,
            error: None,
        };

        if let Err(source) = self.delivery.engine().validator().validate_lead(lead) {
            let err = AuctionError::InvalidLead {
                auction_id: auction_id.clone(),
                source,
            };
            tracing::warn!("{}", err);
            result.status = AuctionStatus::Failed;
            result.error = Some(err.to_string());
            return self.finish(result, started);
        }

        let transport = self.delivery.transport();
        let buyers: Vec<Arc<BuyerConfig>> = self
            .registry
            .eligible_buyers(lead)
            .into_iter()
            .filter(|buyer| {
                let available = transport.is_available(&buyer.id);
                if !available {
                    tracing::debug!("Skipping buyer {}: circuit open", buyer.id);
                }
                available
            })
            .collect();
        result.participant_count = buyers.len();

        tracing::info!(
            "Auction {} for lead {}: {:?} from {} buyer(s)",
            auction_id,
            lead.id,
            AuctionState::CollectingBids,
            buyers.len()
        );
        if buyers.is_empty() {
            result.error = Some("no eligible buyers".to_string());
            return self.finish(result, started);
        }

        let source = Value::Object(flatten_lead(lead, Utc::now()));
        let pings = join_all(buyers.iter().map(|buyer| self.ping(lead, buyer, &source))).await;

        tracing::debug!("Auction {}: {:?}", auction_id, AuctionState::SelectingWinner);
        result.bids = pings.iter().map(|p| p.bid.clone()).collect();
        let ranked = rank_bids(&result.bids);

        if ranked.is_empty() {
            result.status = if result.bids.iter().all(|b| b.timed_out) {
                AuctionStatus::Timeout
            } else {
                AuctionStatus::NoBids
            };
            self.flush_ping_logs(&auction_id, lead, &pings, None);
            return self.finish(result, started);
        }

        self.cascade(lead, &auction_id, &ranked, &mut result).await;
        self.flush_ping_logs(&auction_id, lead, &pings, result.winning_buyer_id.as_deref());
        self.finish(result, started)
    }

    async fn ping(&self, lead: &LeadData, buyer: &BuyerConfig, source: &Value) -> PingOutcome {
        let mut bid = BidResponse {
            buyer_id: buyer.id.clone(),
            buyer_name: buyer.name.clone(),
            success: false,
            bid_amount: None,
            response_time_ms: 0,
            priority: 0,
            raw_status: None,
            error: None,
            timed_out: false,
        };

        let Some(service) = eligible_service(buyer, lead) else {
            bid.error = Some("buyer no longer eligible".to_string());
            return PingOutcome {
                bid,
                http_status: None,
                log_status: "ineligible".to_string(),
            };
        };
        bid.priority = service.priority;

        let payload = match self
            .delivery
            .engine()
            .build_payload(lead, buyer, service, CallKind::Ping)
            .await
        {
            Ok(payload) => payload,
            Err(e) => {
                bid.error = Some(e.to_string());
                return PingOutcome {
                    bid,
                    http_status: None,
                    log_status: "invalid".to_string(),
                };
            }
        };

        let timeout_ms = service.webhook.ping_timeout_ms;
        let timeout = Duration::from_millis(timeout_ms);
        let request = OutboundRequest::for_buyer(
            buyer,
            CallKind::Ping,
            &service.webhook.ping_url,
            payload,
            timeout,
        );

        // The buyer's timeout starts once a slot is free, not while queued.
        let permit = match self.ping_permits.acquire().await {
            Ok(permit) => permit,
            Err(e) => {
                bid.error = Some(e.to_string());
                return PingOutcome {
                    bid,
                    http_status: None,
                    log_status: "error".to_string(),
                };
            }
        };
        let sent_at = Instant::now();
        let sent = tokio::time::timeout(timeout, self.delivery.transport().send(request)).await;
        drop(permit);
        bid.response_time_ms = sent_at.elapsed().as_millis() as u64;

        let mut http_status = None;
        let log_status = match sent {
            Err(_) | Ok(Err(TransportError::Timeout(_))) => {
                bid.timed_out = true;
                bid.error = Some(TransportError::Timeout(timeout_ms).to_string());
                "timeout".to_string()
            }
            Ok(Err(e)) => {
                bid.error = Some(e.to_string());
                "error".to_string()
            }
            Ok(Ok(raw)) => {
                http_status = Some(raw.status);
                let parsed = self
                    .delivery
                    .parser()
                    .parse_ping(&buyer.id, raw.status, &raw.body)
                    .await;
                bid.raw_status = parsed.raw_status;

                if parsed.status == PingStatus::Accepted {
                    match price_bid(parsed.bid_amount, &service.pricing, source) {
                        BidPrice::Amount(amount) => {
                            bid.success = true;
                            bid.bid_amount = Some(amount);
                        }
                        BidPrice::BelowFloor(amount) => {
                            bid.bid_amount = Some(amount);
                            bid.error = Some(format!("bid {:.2} below floor", amount));
                        }
                        BidPrice::Unpriced => {
                            bid.error = Some("accepted without a bid amount".to_string());
                        }
                    }
                } else {
                    bid.error = parsed.reason;
                }
                parsed.status.as_str().to_string()
            }
        };

        let healthy = !bid.timed_out && log_status != "error";
        self.delivery.monitor().record_buyer_response(
            &buyer.id,
            Duration::from_millis(bid.response_time_ms),
            healthy,
        );

        tracing::debug!(
            "PING {} -> {}: {} {:?} in {}ms",
            lead.id,
            buyer.id,
            log_status,
            bid.bid_amount,
            bid.response_time_ms
        );
        PingOutcome {
            bid,
            http_status,
            log_status,
        }
    }

    /// Walks the ranking one buyer at a time until a POST is delivered.
    async fn cascade(
        &self,
        lead: &LeadData,
        auction_id: &str,
        ranked: &[BidResponse],
        result: &mut AuctionResult,
    ) {
        for (position, bid) in ranked.iter().enumerate() {
            let state = if position == 0 {
                AuctionState::Delivering
            } else {
                AuctionState::Cascading
            };
            tracing::info!(
                "Auction {}: {:?} to buyer {} at {:?}",
                auction_id,
                state,
                bid.buyer_id,
                bid.bid_amount
            );

            // Configuration may have changed since the PING went out.
            let live = self
                .registry
                .get(&bid.buyer_id)
                .filter(|_| self.delivery.transport().is_available(&bid.buyer_id));
            let Some((buyer, service)) = live
                .as_ref()
                .and_then(|buyer| eligible_service(buyer, lead).map(|s| (buyer, s)))
            else {
                tracing::warn!(
                    "Auction {}: buyer {} no longer eligible, skipping",
                    auction_id,
                    bid.buyer_id
                );
                let entry =
                    LogEntry::new(TransactionAction::Delivery, &lead.id, &bid.buyer_id, "skipped")
                        .auction(Some(auction_id))
                        .bid(bid.bid_amount)
                        .error(Some("buyer no longer eligible".to_string()))
                        .build();
                self.delivery.log().record(entry);
                continue;
            };

            let context = DeliveryContext::auction(auction_id, bid.bid_amount);
            let post = self.delivery.deliver(lead, buyer, service, context).await;
            result.delivery_attempts.push(post.clone());

            if post.success {
                tracing::info!(
                    "Auction {}: {:?} to buyer {}",
                    auction_id,
                    AuctionState::Delivered,
                    buyer.id
                );
                result.status = AuctionStatus::Completed;
                result.winning_buyer_id = Some(buyer.id.clone());
                result.winning_bid_amount = bid.bid_amount;
                result.post_result = Some(post);
                return;
            }
        }

        tracing::warn!(
            "Auction {}: {:?} after {} attempt(s)",
            auction_id,
            AuctionState::Exhausted,
            result.delivery_attempts.len()
        );
        result.status = AuctionStatus::Failed;
        result.post_result = result.delivery_attempts.last().cloned();
        result.error = Some("delivery cascade exhausted".to_string());
        result.retry_scheduled = self.schedule_retry(lead, auction_id, ranked, result);
    }

    /// Hands an exhausted cascade to the retry handler. The best bidder
    /// whose POST failed, or who was skipped while still eligible, is
    /// queued. Otherwise the top bidder is dead-lettered for review. A lead
    /// the final buyer called invalid is never retried as-is.
    fn schedule_retry(
        &self,
        lead: &LeadData,
        auction_id: &str,
        ranked: &[BidResponse],
        result: &AuctionResult,
    ) -> bool {
        let Some(retry) = &self.retry else {
            return false;
        };
        let last_status = result.delivery_attempts.last().map(|a| a.status);
        if last_status == Some(PostStatus::Invalid) {
            return false;
        }

        let attempt_for = |buyer_id: &str| {
            result
                .delivery_attempts
                .iter()
                .find(|a| a.buyer_id == buyer_id)
        };

        for bid in ranked {
            let attempt = attempt_for(&bid.buyer_id);
            if attempt.is_some_and(|a| !is_retryable(a)) {
                continue;
            }
            let Some(buyer) = self.registry.get(&bid.buyer_id) else {
                continue;
            };
            let Some(service) = eligible_service(&buyer, lead) else {
                continue;
            };

            let item = RetryItem::new(
                lead.clone(),
                &buyer.id,
                service.webhook.retry_policy.clone(),
                Utc::now(),
            )
            .with_auction(auction_id, bid.bid_amount);
            let item = match attempt {
                Some(a) => item.with_origin(
                    a.transaction_id.clone(),
                    a.error.clone().or_else(|| a.reason.clone()),
                ),
                None => item.with_origin(None, Some("skipped at delivery".to_string())),
            };
            retry.enqueue(item);
            return true;
        }

        let Some(top) = ranked.first() else {
            return false;
        };
        let policy = self
            .registry
            .get(&top.buyer_id)
            .and_then(|buyer| {
                eligible_service(&buyer, lead).map(|s| s.webhook.retry_policy.clone())
            })
            .unwrap_or_default();
        let item = RetryItem::new(lead.clone(), &top.buyer_id, policy, Utc::now())
            .with_auction(auction_id, top.bid_amount);
        let (item, reason) = match attempt_for(&top.buyer_id) {
            Some(a) => (
                item.with_origin(a.transaction_id.clone(), a.reason.clone()),
                format!("buyer answered {}", a.status.as_str()),
            ),
            None => (item, "no eligible bidder at delivery".to_string()),
        };
        retry.park(item, &reason);
        false
    }

    /// PING entries are written once the winner is known so each carries
    /// its won/lost attribution.
    fn flush_ping_logs(
        &self,
        auction_id: &str,
        lead: &LeadData,
        pings: &[PingOutcome],
        winner: Option<&str>,
    ) {
        let log = self.delivery.log();
        for ping in pings {
            let outcome = if winner == Some(ping.bid.buyer_id.as_str()) {
                AuctionOutcome::Won
            } else if ping.bid.success {
                AuctionOutcome::Lost
            } else {
                AuctionOutcome::None
            };
            let entry = LogEntry::new(
                TransactionAction::Ping,
                &lead.id,
                &ping.bid.buyer_id,
                &ping.log_status,
            )
            .auction(Some(auction_id))
            .bid(ping.bid.bid_amount)
            .http_status(ping.http_status)
            .response_time(ping.bid.response_time_ms)
            .error(ping.bid.error.clone())
            .outcome(outcome)
            .build();
            log.record(entry);
        }
    }

    fn finish(&self, mut result: AuctionResult, started: Instant) -> AuctionResult {
        let elapsed = started.elapsed();
        result.duration_ms = elapsed.as_millis() as u64;
        self.delivery.monitor().record_auction(elapsed, result.status);

        tracing::info!(
            "Auction {} finished: {:?} winner={:?} amount={:?} in {}ms",
            result.auction_id,
            result.status,
            result.winning_buyer_id,
            result.winning_bid_amount,
            result.duration_ms
        );
        result
    }
}

fn is_retryable(attempt: &PostResult) -> bool {
    attempt.status == PostStatus::Failed
}

/// Accepted, priced bids in winning order: amount descending, then buyer
/// priority descending, then response time ascending.
pub fn rank_bids(bids: &[BidResponse]) -> Vec<BidResponse> {
    let mut ranked: Vec<BidResponse> = bids
        .iter()
        .filter(|b| b.success && b.bid_amount.is_some())
        .cloned()
        .collect();
    ranked.sort_by(compare_bids);
    ranked
}

fn compare_bids(a: &BidResponse, b: &BidResponse) -> Ordering {
    let amount = |bid: &BidResponse| bid.bid_amount.unwrap_or(0.0);
    amount(b)
        .total_cmp(&amount(a))
        .then_with(|| b.priority.cmp(&a.priority))
        .then_with(|| a.response_time_ms.cmp(&b.response_time_ms))
        .then_with(|| a.buyer_id.cmp(&b.buyer_id))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bid(id: &str, amount: Option<f64>, priority: u32, ms: u64) -> BidResponse {
        BidResponse {
            buyer_id: id.to_string(),
            buyer_name: id.to_string(),
            success: amount.is_some(),
            bid_amount: amount,
            response_time_ms: ms,
            priority,
            raw_status: None,
            error: None,
            timed_out: false,
        }
    }

    #[test]
    fn test_rank_bids_highest_amount_first() {
        let ranked = rank_bids(&[
            bid("a", Some(45.0), 1, 100),
            bid("b", Some(50.0), 1, 300),
            bid("c", Some(40.0), 9, 10),
            bid("d", None, 10, 5),
        ]);
        let ids: Vec<&str> = ranked.iter().map(|b| b.buyer_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "a", "c"]);
    }

    #[test]
    fn test_rank_bids_ties_break_on_priority_then_speed() {
        let ranked = rank_bids(&[
            bid("slow", Some(30.0), 5, 900),
            bid("fast", Some(30.0), 5, 100),
            bid("favoured", Some(30.0), 8, 2_000),
        ]);
        let ids: Vec<&str> = ranked.iter().map(|b| b.buyer_id.as_str()).collect();
        assert_eq!(ids, vec!["favoured", "fast", "slow"]);
    }
}
