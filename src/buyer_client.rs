use async_trait::async_trait;
use dashmap::DashMap;
use failsafe::CircuitBreaker;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

use crate::circuit_breaker::{create_buyer_circuit_breaker, BuyerCircuitBreaker};
use crate::errors::TransportError;
use crate::models::{AuthConfig, BuyerConfig, BuyerSettings, CallKind};

/// One outbound PING or POST call, fully shaped.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub buyer_id: String,
    pub kind: CallKind,
    pub url: String,
    pub auth: AuthConfig,
    pub settings: BuyerSettings,
    pub body: Map<String, Value>,
    pub timeout: Duration,
}

impl OutboundRequest {
    pub fn for_buyer(
        buyer: &BuyerConfig,
        kind: CallKind,
        url: &str,
        body: Map<String, Value>,
        timeout: Duration,
    ) -> Self {
        Self {
            buyer_id: buyer.id.clone(),
            kind,
            url: url.to_string(),
            auth: buyer.auth.clone(),
            settings: buyer.settings.clone(),
            body,
            timeout,
        }
    }
}

/// What the buyer answered, before normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct RawResponse {
    pub status: u16,
    pub body: String,
    pub elapsed_ms: u64,
}

/// Seam between the auction core and the network.
#[async_trait]
pub trait BuyerTransport: Send + Sync {
    async fn send(&self, request: OutboundRequest) -> Result<RawResponse, TransportError>;

    /// Whether calls to the buyer are currently allowed (breaker closed).
    fn is_available(&self, _buyer_id: &str) -> bool {
        true
    }

    /// Drops per-buyer state after the buyer's configuration changed.
    fn reset(&self, _buyer_id: &str) {}
}

/// reqwest-backed transport with per-buyer circuit breakers and
/// concurrency limits.
pub struct HttpBuyerClient {
    client: reqwest::Client,
    breakers: DashMap<String, Arc<BuyerCircuitBreaker>>,
    limits: DashMap<String, Arc<Semaphore>>,
}

impl HttpBuyerClient {
    /// Creates a new `HttpBuyerClient`.
    ///
    /// Request timeouts are set per call from the buyer's webhook config.
    pub fn new() -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("rust-lead-broker/", env!("CARGO_PKG_VERSION")))
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| {
                TransportError::InvalidRequest(format!("Failed to create HTTP client: {}", e))
            })?;

        Ok(Self {
            client,
            breakers: DashMap::new(),
            limits: DashMap::new(),
        })
    }

    fn breaker(&self, buyer_id: &str, settings: &BuyerSettings) -> Arc<BuyerCircuitBreaker> {
        self.breakers
            .entry(buyer_id.to_string())
            .or_insert_with(|| {
                Arc::new(create_buyer_circuit_breaker(
                    settings.failure_threshold,
                    settings.circuit_reset_secs,
                ))
            })
            .clone()
    }

    fn limiter(&self, buyer_id: &str, settings: &BuyerSettings) -> Arc<Semaphore> {
        self.limits
            .entry(buyer_id.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(settings.max_concurrent_requests.max(1))))
            .clone()
    }

    async fn execute(&self, request: &OutboundRequest) -> Result<RawResponse, TransportError> {
        let started = Instant::now();
        let timeout_ms = request.timeout.as_millis() as u64;

        let builder = self
            .client
            .post(&request.url)
            .timeout(request.timeout)
            .json(&request.body);
        let builder = apply_auth(builder, &request.auth);

        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout(timeout_ms)
            } else {
                TransportError::Connection(e.to_string())
            }
        })?;

        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| {
            if e.is_timeout() {
                TransportError::Timeout(timeout_ms)
            } else {
                TransportError::Connection(format!("Failed to read response body: {}", e))
            }
        })?;

        Ok(RawResponse {
            status,
            body,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }
}

#[async_trait]
impl BuyerTransport for HttpBuyerClient {
    async fn send(&self, request: OutboundRequest) -> Result<RawResponse, TransportError> {
        let breaker = request
            .settings
            .failover_enabled
            .then(|| self.breaker(&request.buyer_id, &request.settings));

        if let Some(cb) = &breaker {
            if !cb.is_call_permitted() {
                tracing::warn!(
                    "Circuit open for buyer {}, skipping {}",
                    request.buyer_id,
                    request.kind.as_str()
                );
                return Err(TransportError::CircuitOpen(request.buyer_id.clone()));
            }
        }

        let _permit = self
            .limiter(&request.buyer_id, &request.settings)
            .acquire_owned()
            .await
            .map_err(|e| TransportError::Connection(format!("Concurrency limiter closed: {}", e)))?;

        tracing::debug!(
            "Sending {} to buyer {}: {}",
            request.kind.as_str(),
            request.buyer_id,
            request.url
        );
        let result = self.execute(&request).await;

        if let Some(cb) = &breaker {
            let failed = match &result {
                Ok(response) => response.status >= 500,
                Err(_) => true,
            };
            let _ = cb.call(|| if failed { Err(()) } else { Ok(()) });
        }

        match &result {
            Ok(response) => tracing::debug!(
                "Buyer {} answered {} with HTTP {} in {}ms",
                request.buyer_id,
                request.kind.as_str(),
                response.status,
                response.elapsed_ms
            ),
            Err(e) => tracing::warn!(
                "Buyer {} {} failed: {}",
                request.buyer_id,
                request.kind.as_str(),
                e
            ),
        }
        result
    }

    fn is_available(&self, buyer_id: &str) -> bool {
        self.breakers
            .get(buyer_id)
            .map_or(true, |cb| cb.is_call_permitted())
    }

    /// Forgets breaker and limiter state so updated settings take effect.
    fn reset(&self, buyer_id: &str) {
        self.breakers.remove(buyer_id);
        self.limits.remove(buyer_id);
    }
}

fn apply_auth(builder: reqwest::RequestBuilder, auth: &AuthConfig) -> reqwest::RequestBuilder {
    match auth {
        AuthConfig::None => builder,
        AuthConfig::ApiKey { header, key } => builder.header(header.as_str(), key.as_str()),
        AuthConfig::Bearer { token } => builder.bearer_auth(token),
        AuthConfig::Basic { username, password } => builder.basic_auth(username, Some(password)),
        AuthConfig::OAuth {
            access_token,
            token_type,
        } => builder.header(
            reqwest::header::AUTHORIZATION,
            format!("{} {}", token_type, access_token),
        ),
    }
}
