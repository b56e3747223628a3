//! POST delivery, shared by the auction cascade and the retry handler.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::buyer_client::{BuyerTransport, OutboundRequest};
use crate::errors::TransportError;
use crate::models::{
    AuctionOutcome, BuyerConfig, BuyerServiceConfig, CallKind, LeadData, PostResult,
    TransactionAction,
};
use crate::monitor::PerformanceMonitor;
use crate::response_parser::{PostStatus, ResponseParser};
use crate::template_engine::TemplateEngine;
use crate::transaction_log::{LogEntry, TransactionSink};

/// Where a delivery attempt comes from, for the audit trail.
#[derive(Debug, Clone)]
pub struct DeliveryContext {
    pub auction_id: Option<String>,
    pub action: TransactionAction,
    pub bid_amount: Option<f64>,
    pub retry_count: u32,
}

impl DeliveryContext {
    pub fn auction(auction_id: &str, bid_amount: Option<f64>) -> Self {
        Self {
            auction_id: Some(auction_id.to_string()),
            action: TransactionAction::Post,
            bid_amount,
            retry_count: 0,
        }
    }

    pub fn retry(auction_id: Option<String>, bid_amount: Option<f64>, retry_count: u32) -> Self {
        Self {
            auction_id,
            action: TransactionAction::Retry,
            bid_amount,
            retry_count,
        }
    }
}

pub struct DeliveryService {
    engine: Arc<TemplateEngine>,
    transport: Arc<dyn BuyerTransport>,
    parser: Arc<ResponseParser>,
    log: Arc<dyn TransactionSink>,
    monitor: Arc<PerformanceMonitor>,
}

impl DeliveryService {
    pub fn new(
        engine: Arc<TemplateEngine>,
        transport: Arc<dyn BuyerTransport>,
        parser: Arc<ResponseParser>,
        log: Arc<dyn TransactionSink>,
        monitor: Arc<PerformanceMonitor>,
    ) -> Self {
        Self {
            engine,
            transport,
            parser,
            log,
            monitor,
        }
    }

    pub fn engine(&self) -> &Arc<TemplateEngine> {
        &self.engine
    }

    pub fn parser(&self) -> &Arc<ResponseParser> {
        &self.parser
    }

    pub fn monitor(&self) -> &Arc<PerformanceMonitor> {
        &self.monitor
    }

    pub fn transport(&self) -> &Arc<dyn BuyerTransport> {
        &self.transport
    }

    pub fn log(&self) -> &Arc<dyn TransactionSink> {
        &self.log
    }

    /// Builds, sends and interprets one POST, then records it.
    ///
    /// Never fails: every outcome is folded into a [`PostResult`].
    pub async fn deliver(
        &self,
        lead: &LeadData,
        buyer: &BuyerConfig,
        service: &BuyerServiceConfig,
        context: DeliveryContext,
    ) -> PostResult {
        let started = Instant::now();
        let (post, log_status) = match self.attempt(lead, buyer, service).await {
            Ok(post) => {
                let status = post.status.as_str();
                (post, status)
            }
            Err(failed) => {
                let post = PostResult {
                    response_time_ms: started.elapsed().as_millis() as u64,
                    ..failed.result
                };
                (post, failed.log_status)
            }
        };

        self.monitor.record_buyer_response(
            &buyer.id,
            Duration::from_millis(post.response_time_ms),
            is_healthy(&post),
        );

        let outcome = if post.success {
            AuctionOutcome::Won
        } else {
            AuctionOutcome::Lost
        };
        let entry = LogEntry::new(context.action, &lead.id, &buyer.id, log_status)
            .auction(context.auction_id.as_deref())
            .bid(context.bid_amount)
            .http_status(post.http_status)
            .response_time(post.response_time_ms)
            .error(
                post.error
                    .clone()
                    .or_else(|| post.reason.clone())
                    .filter(|_| !post.success),
            )
            .outcome(outcome)
            .retry_count(context.retry_count)
            .build();
        let post = PostResult {
            transaction_id: Some(entry.id.clone()),
            ..post
        };
        self.log.record(entry);

        if post.success {
            tracing::info!(
                "✓ Lead {} delivered to buyer {} (buyer lead id {:?})",
                lead.id,
                buyer.id,
                post.buyer_lead_id
            );
        } else {
            tracing::warn!(
                "Delivery of lead {} to buyer {} ended {} (retryable: {})",
                lead.id,
                buyer.id,
                post.status.as_str(),
                post.should_retry
            );
        }
        post
    }

    async fn attempt(
        &self,
        lead: &LeadData,
        buyer: &BuyerConfig,
        service: &BuyerServiceConfig,
    ) -> Result<PostResult, FailedAttempt> {
        let payload = self
            .engine
            .build_payload(lead, buyer, service, CallKind::Post)
            .await
            .map_err(|e| {
                FailedAttempt::new(buyer, PostStatus::Invalid, false, e.to_string(), "invalid")
            })?;

        let timeout = Duration::from_millis(service.webhook.post_timeout_ms);
        let request = OutboundRequest::for_buyer(
            buyer,
            CallKind::Post,
            &service.webhook.post_url,
            payload,
            timeout,
        );

        let raw = match tokio::time::timeout(timeout, self.transport.send(request)).await {
            Ok(Ok(raw)) => raw,
            Ok(Err(e)) => {
                let label = match e {
                    TransportError::Timeout(_) => "timeout",
                    TransportError::CircuitOpen(_) => "circuit_open",
                    _ => "error",
                };
                return Err(FailedAttempt::new(
                    buyer,
                    PostStatus::Failed,
                    true,
                    e.to_string(),
                    label,
                ));
            }
            Err(_) => {
                let e = TransportError::Timeout(service.webhook.post_timeout_ms);
                return Err(FailedAttempt::new(
                    buyer,
                    PostStatus::Failed,
                    true,
                    e.to_string(),
                    "timeout",
                ));
            }
        };

        let parsed = self.parser.parse_post(&buyer.id, raw.status, &raw.body).await;
        let success = parsed.status == PostStatus::Delivered;
        Ok(PostResult {
            buyer_id: buyer.id.clone(),
            success,
            status: parsed.status,
            buyer_lead_id: parsed.buyer_lead_id,
            reason: parsed.reason,
            http_status: Some(raw.status),
            response_time_ms: raw.elapsed_ms,
            should_retry: parsed.should_retry,
            error: None,
            transaction_id: None,
        })
    }
}

/// A verdict such as duplicate or invalid still comes from a working buyer.
/// Transport failures, retryable codes and 5xx answers do not.
fn is_healthy(post: &PostResult) -> bool {
    if post.should_retry {
        return false;
    }
    match post.http_status {
        Some(code) => code < 500,
        None => post.status != PostStatus::Failed,
    }
}

/// A POST that never produced a buyer verdict.
struct FailedAttempt {
    result: PostResult,
    log_status: &'static str,
}

impl FailedAttempt {
    fn new(
        buyer: &BuyerConfig,
        status: PostStatus,
        should_retry: bool,
        error: String,
        log_status: &'static str,
    ) -> Self {
        Self {
            result: PostResult {
                buyer_id: buyer.id.clone(),
                success: false,
                status,
                buyer_lead_id: None,
                reason: None,
                http_status: None,
                response_time_ms: 0,
                should_retry,
                error: Some(error),
                transaction_id: None,
            },
            log_status,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buyer_client::RawResponse;
    use crate::monitor::MonitorThresholds;
    use crate::registry::BuyerRegistry;
    use crate::transaction_log::InMemoryTransactionLog;
    use async_trait::async_trait;
    use chrono::Utc;
    use serde_json::json;

    struct Fixed(u16, &'static str);

    #[async_trait]
    impl BuyerTransport for Fixed {
        async fn send(&self, _request: OutboundRequest) -> Result<RawResponse, TransportError> {
            Ok(RawResponse {
                status: self.0,
                body: self.1.to_string(),
                elapsed_ms: 5,
            })
        }
    }

    fn buyer() -> BuyerConfig {
        serde_json::from_value(json!({
            "id": "acme",
            "name": "Acme",
            "serviceConfigs": [{
                "serviceTypeId": "windows",
                "pingTemplate": { "mappings": [] },
                "postTemplate": {
                    "mappings": [{ "sourceField": "leadId", "targetField": "lead_id" }]
                },
                "webhook": {
                    "pingUrl": "http://localhost/ping",
                    "postUrl": "http://localhost/post"
                }
            }]
        }))
        .unwrap()
    }

    fn lead() -> LeadData {
        serde_json::from_value(json!({
            "id": "lead-1",
            "serviceTypeId": "windows",
            "zipCode": "94107",
            "ownsHome": true,
            "timeframe": "within_3_months",
            "createdAt": Utc::now()
        }))
        .unwrap()
    }

    async fn deliver_with(transport: Fixed) -> (PostResult, Arc<PerformanceMonitor>) {
        let buyer = buyer();
        let registry = Arc::new(BuyerRegistry::from_buyers(vec![buyer.clone()]));
        let monitor = Arc::new(PerformanceMonitor::new(MonitorThresholds::default()));
        let delivery = DeliveryService::new(
            Arc::new(TemplateEngine::default()),
            Arc::new(transport),
            Arc::new(ResponseParser::new(registry, Duration::from_secs(60))),
            Arc::new(InMemoryTransactionLog::new()),
            monitor.clone(),
        );
        let service = &buyer.service_configs[0];
        let post = delivery
            .deliver(&lead(), &buyer, service, DeliveryContext::auction("auc-1", Some(20.0)))
            .await;
        (post, monitor)
    }

    #[tokio::test]
    async fn test_duplicate_answer_is_not_a_buyer_error() {
        let (post, monitor) = deliver_with(Fixed(409, r#"{"message":"already sold"}"#)).await;
        assert_eq!(post.status, PostStatus::Duplicate);

        let metrics = monitor.buyer_metrics("acme").unwrap();
        assert_eq!(metrics.requests, 1);
        assert_eq!(metrics.failures, 0);
    }

    #[tokio::test]
    async fn test_retryable_answer_counts_as_buyer_error() {
        let (post, monitor) = deliver_with(Fixed(503, "")).await;
        assert!(post.should_retry);
        assert_eq!(monitor.buyer_metrics("acme").unwrap().failures, 1);
    }
}
