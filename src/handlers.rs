use axum::{
    body::Bytes,
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use serde::Deserialize;
use serde_json::{json, Map, Value};
use std::sync::Arc;

use crate::auction::AuctionEngine;
use crate::buyer_client::BuyerTransport;
use crate::config::EngineSettings;
use crate::delivery::DeliveryService;
use crate::errors::{AppError, TemplateEngineError};
use crate::models::{AuctionResult, BuyerConfig, CallKind, LeadData};
use crate::monitor::{Alert, MonitorSnapshot, PerformanceMonitor};
use crate::registry::BuyerRegistry;
use crate::response_parser::{ResponseMappingSource, ResponseParser};
use crate::retry::{DeadLetter, RetryHandler, RetryItem};
use crate::template_engine::TemplateEngine;
use crate::transaction_log::{InMemoryTransactionLog, TransactionSink};
use crate::transformations::TransformRegistry;
use crate::validator::DataValidator;
use crate::webhook::{
    SignatureVerifier, WebhookProcessor, WebhookReceipt, SIGNATURE_HEADER, TIMESTAMP_HEADER,
};

/// Shared application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    /// Engine tunables the components were built with.
    pub settings: EngineSettings,
    /// Live buyer catalogue.
    pub registry: Arc<BuyerRegistry>,
    pub engine: Arc<TemplateEngine>,
    pub parser: Arc<ResponseParser>,
    /// The single POST path, shared by the auction cascade and retries.
    pub delivery: Arc<DeliveryService>,
    pub auctions: Arc<AuctionEngine>,
    pub retries: Arc<RetryHandler>,
    pub monitor: Arc<PerformanceMonitor>,
    /// Append-only record of every PING/POST/WEBHOOK/RETRY attempt.
    pub transactions: Arc<InMemoryTransactionLog>,
    pub webhooks: Arc<WebhookProcessor>,
}

impl AppState {
    /// Wires every component around one registry and one transport.
    pub fn new(
        settings: EngineSettings,
        registry: Arc<BuyerRegistry>,
        transport: Arc<dyn BuyerTransport>,
        verifier: Arc<dyn SignatureVerifier>,
    ) -> Self {
        let monitor = Arc::new(PerformanceMonitor::default());
        let transactions = Arc::new(InMemoryTransactionLog::new());
        let log: Arc<dyn TransactionSink> = transactions.clone();

        let engine = Arc::new(
            TemplateEngine::new(
                TransformRegistry::with_defaults(),
                DataValidator::new(settings.max_payload_bytes),
            )
            .with_monitor(monitor.clone()),
        );
        let mappings: Arc<dyn ResponseMappingSource> = registry.clone();
        let parser = Arc::new(ResponseParser::new(mappings, settings.response_mapping_ttl()));

        let delivery = Arc::new(DeliveryService::new(
            engine.clone(),
            transport,
            parser.clone(),
            log.clone(),
            monitor.clone(),
        ));
        let retries = Arc::new(RetryHandler::new(registry.clone(), delivery.clone()));
        let auctions = Arc::new(AuctionEngine::new(
            registry.clone(),
            delivery.clone(),
            Some(retries.clone()),
            settings.max_concurrent_pings,
        ));
        let webhooks = Arc::new(WebhookProcessor::new(verifier, parser.clone(), log));

        Self {
            settings,
            registry,
            engine,
            parser,
            delivery,
            auctions,
            retries,
            monitor,
            transactions,
            webhooks,
        }
    }
}

/// Health check endpoint.
///
/// # Returns
///
/// * `(StatusCode, Json<serde_json::Value>)` - HTTP 200 OK with health status JSON.
pub async fn health(State(state): State<Arc<AppState>>) -> (StatusCode, Json<Value>) {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "service": "rust-lead-broker",
            "version": env!("CARGO_PKG_VERSION"),
            "buyers": state.registry.len(),
            "pendingRetries": state.retries.pending().len(),
            "limits": {
                "maxPayloadBytes": state.settings.max_payload_bytes,
                "maxConcurrentPings": state.settings.max_concurrent_pings,
                "retrySweepIntervalSecs": state.settings.retry_sweep_interval_secs
            }
        })),
    )
}

/// POST /api/v1/auctions
///
/// Runs a full PING/POST auction for the submitted lead.
///
/// Structural lead errors are rejected with 422 before any buyer is
/// contacted. Everything after that (no bids, timeouts, exhausted cascades)
/// is reported in the returned `AuctionResult`.
pub async fn run_auction(
    State(state): State<Arc<AppState>>,
    Json(lead): Json<LeadData>,
) -> Result<Json<AuctionResult>, AppError> {
    state
        .engine
        .validator()
        .validate_lead(&lead)
        .map_err(TemplateEngineError::from)?;

    tracing::info!(
        "Auction requested for lead {} (service {})",
        lead.id,
        lead.service_type_id
    );
    let result = state.auctions.run_auction(&lead).await;
    Ok(Json(result))
}

/// POST /api/v1/buyers/:buyer_id/preview/:kind
///
/// Renders the PING or POST payload a buyer would receive for a lead,
/// without sending anything.
pub async fn preview_payload(
    State(state): State<Arc<AppState>>,
    Path((buyer_id, kind)): Path<(String, CallKind)>,
    Json(lead): Json<LeadData>,
) -> Result<Json<Map<String, Value>>, AppError> {
    let buyer = state
        .registry
        .get(&buyer_id)
        .ok_or_else(|| AppError::NotFound(format!("buyer {}", buyer_id)))?;
    let service = buyer.service_config(&lead.service_type_id).ok_or_else(|| {
        AppError::BadRequest(format!(
            "buyer {} has no configuration for service {}",
            buyer_id, lead.service_type_id
        ))
    })?;

    let payload = state
        .engine
        .build_payload(&lead, &buyer, service, kind)
        .await?;
    tracing::debug!(
        "Previewed {} payload for buyer {} ({} fields)",
        kind.as_str(),
        buyer_id,
        payload.len()
    );
    Ok(Json(payload))
}

/// PUT /api/v1/buyers/:buyer_id
///
/// Replaces a buyer's configuration by id. The cached response mapping and
/// the buyer's breaker state are dropped so the next call sees the new config.
pub async fn upsert_buyer(
    State(state): State<Arc<AppState>>,
    Path(buyer_id): Path<String>,
    Json(buyer): Json<BuyerConfig>,
) -> Result<(StatusCode, Json<Value>), AppError> {
    if buyer.id != buyer_id {
        return Err(AppError::BadRequest(format!(
            "path buyer id {} does not match body id {}",
            buyer_id, buyer.id
        )));
    }

    let validator = state.engine.validator();
    validator
        .validate_buyer(&buyer)
        .map_err(TemplateEngineError::from)?;
    for service in &buyer.service_configs {
        validator
            .validate_template(&service.ping_template)
            .and_then(|_| validator.validate_template(&service.post_template))
            .map_err(TemplateEngineError::from)?;
    }

    let services = buyer.service_configs.len();
    let created = state.registry.upsert(buyer).is_none();
    state.parser.invalidate(&buyer_id).await;
    state.delivery.transport().reset(&buyer_id);

    tracing::info!(
        "Buyer {} {} with {} service config(s)",
        buyer_id,
        if created { "registered" } else { "updated" },
        services
    );
    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((
        status,
        Json(json!({
            "buyerId": buyer_id,
            "status": if created { "created" } else { "updated" }
        })),
    ))
}

/// POST /api/v1/webhooks/:buyer_id
///
/// Receives an asynchronous delivery confirmation. The raw body is verified
/// against the signature headers before it is parsed.
pub async fn receive_webhook(
    State(state): State<Arc<AppState>>,
    Path(buyer_id): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookReceipt>, AppError> {
    let signature = headers.get(SIGNATURE_HEADER).and_then(|v| v.to_str().ok());
    let timestamp = headers.get(TIMESTAMP_HEADER).and_then(|v| v.to_str().ok());

    let receipt = state
        .webhooks
        .handle(&buyer_id, signature, timestamp, &body)
        .await?;
    Ok(Json(receipt))
}

/// GET /api/v1/monitor/metrics
pub async fn monitor_metrics(State(state): State<Arc<AppState>>) -> Json<MonitorSnapshot> {
    Json(state.monitor.snapshot())
}

#[derive(Debug, Deserialize)]
pub struct AlertQuery {
    pub limit: Option<usize>,
}

/// GET /api/v1/monitor/alerts?limit=N
///
/// Most recent alerts, newest last.
pub async fn monitor_alerts(
    State(state): State<Arc<AppState>>,
    Query(query): Query<AlertQuery>,
) -> Json<Vec<Alert>> {
    Json(state.monitor.alerts(query.limit))
}

/// GET /api/v1/retries
pub async fn pending_retries(State(state): State<Arc<AppState>>) -> Json<Vec<RetryItem>> {
    Json(state.retries.pending())
}

/// GET /api/v1/retries/dead-letters
pub async fn dead_letters(State(state): State<Arc<AppState>>) -> Json<Vec<DeadLetter>> {
    Json(state.retries.dead_letters())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buyer_client::{OutboundRequest, RawResponse};
    use crate::errors::TransportError;
    use crate::webhook::{sign, HmacSignatureVerifier};
    use async_trait::async_trait;
    use axum::http::HeaderValue;
    use axum::response::IntoResponse;
    use std::collections::HashMap;

    struct Offline;

    #[async_trait]
    impl BuyerTransport for Offline {
        async fn send(&self, request: OutboundRequest) -> Result<RawResponse, TransportError> {
            Err(TransportError::Connection(format!("offline: {}", request.buyer_id)))
        }
    }

    fn state() -> Arc<AppState> {
        let mut secrets = HashMap::new();
        secrets.insert("acme".to_string(), "topsecret".to_string());
        Arc::new(AppState::new(
            EngineSettings::default(),
            Arc::new(BuyerRegistry::new()),
            Arc::new(Offline),
            Arc::new(HmacSignatureVerifier::new(secrets, 300)),
        ))
    }

    #[tokio::test]
    async fn test_health_reports_buyer_count() {
        let (status, Json(body)) = health(State(state())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["buyers"], 0);
        assert_eq!(body["pendingRetries"], 0);
        assert_eq!(body["limits"]["maxPayloadBytes"], 64 * 1024);
        assert_eq!(body["limits"]["maxConcurrentPings"], 32);
    }

    #[tokio::test]
    async fn test_preview_unknown_buyer_is_not_found() {
        let lead: LeadData = serde_json::from_value(json!({
            "id": "lead-1",
            "serviceTypeId": "windows",
            "formData": {},
            "zipCode": "90210",
            "ownsHome": true,
            "timeframe": "within_3_months",
            "createdAt": "2024-01-01T00:00:00Z"
        }))
        .unwrap();

        let err = preview_payload(
            State(state()),
            Path(("ghost".to_string(), CallKind::Ping)),
            Json(lead),
        )
        .await
        .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_webhook_signature_is_checked_before_parsing() {
        let state = state();
        let body = Bytes::from_static(br#"{"status":"sold","leadId":"lead-9"}"#);

        let err = receive_webhook(
            State(state.clone()),
            Path("acme".to_string()),
            HeaderMap::new(),
            body.clone(),
        )
        .await
        .unwrap_err();
        assert_eq!(err.into_response().status(), StatusCode::UNAUTHORIZED);
        assert!(state.transactions.is_empty());

        let mut headers = HeaderMap::new();
        let sig = sign("topsecret", &body).unwrap();
        let ts = chrono::Utc::now().timestamp().to_string();
        headers.insert(SIGNATURE_HEADER, HeaderValue::from_str(&sig).unwrap());
        headers.insert(TIMESTAMP_HEADER, HeaderValue::from_str(&ts).unwrap());

        let Json(receipt) =
            receive_webhook(State(state.clone()), Path("acme".to_string()), headers, body)
                .await
                .unwrap();
        assert_eq!(receipt.lead_id.as_deref(), Some("lead-9"));
        assert_eq!(state.transactions.for_lead("lead-9").len(), 1);
    }
}
