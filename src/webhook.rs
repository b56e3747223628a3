use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::Serialize;
use serde_json::Value;
use sha2::Sha256;
use std::collections::HashMap;
use std::sync::Arc;

use crate::errors::WebhookError;
use crate::models::{AuctionOutcome, TransactionAction};
use crate::response_parser::{PostStatus, ResponseParser};
use crate::transaction_log::{LogEntry, TransactionSink};
use crate::transformations::{lookup_path, value_to_string};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";
pub const TIMESTAMP_HEADER: &str = "X-Webhook-Timestamp";

/// Hook point that authenticates an inbound buyer webhook before its body
/// is interpreted.
pub trait SignatureVerifier: Send + Sync {
    fn verify(
        &self,
        buyer_id: &str,
        signature: Option<&str>,
        timestamp: Option<&str>,
        body: &[u8],
        now: DateTime<Utc>,
    ) -> Result<(), WebhookError>;
}

/// HMAC-SHA256 over the raw body with a per-buyer secret.
///
/// Signatures are hex, optionally prefixed with `sha256=`. The timestamp
/// header is unix seconds and must fall within `max_age_secs` of now.
pub struct HmacSignatureVerifier {
    secrets: HashMap<String, String>,
    max_age_secs: u64,
}

impl HmacSignatureVerifier {
    pub fn new(secrets: HashMap<String, String>, max_age_secs: u64) -> Self {
        if secrets.is_empty() {
            tracing::warn!("No webhook secrets configured, inbound webhooks will be rejected");
        }
        Self {
            secrets,
            max_age_secs,
        }
    }
}

impl SignatureVerifier for HmacSignatureVerifier {
    fn verify(
        &self,
        buyer_id: &str,
        signature: Option<&str>,
        timestamp: Option<&str>,
        body: &[u8],
        now: DateTime<Utc>,
    ) -> Result<(), WebhookError> {
        let secret = self
            .secrets
            .get(buyer_id)
            .ok_or_else(|| WebhookError::UnknownBuyer(buyer_id.to_string()))?;
        let signature = signature
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .ok_or(WebhookError::MissingSignature)?;
        let sent_at = timestamp
            .and_then(|t| t.trim().parse::<i64>().ok())
            .ok_or(WebhookError::MissingTimestamp)?;

        let age = now.timestamp().checked_sub(sent_at).map(i64::unsigned_abs);
        if age.map_or(true, |age| age > self.max_age_secs) {
            return Err(WebhookError::Expired {
                max_age_secs: self.max_age_secs,
            });
        }

        let hex_sig = signature.strip_prefix("sha256=").unwrap_or(signature);
        let expected = hex::decode(hex_sig).map_err(|_| WebhookError::InvalidSignature)?;

        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|_| WebhookError::InvalidSignature)?;
        mac.update(body);
        // verify_slice compares in constant time
        mac.verify_slice(&expected)
            .map_err(|_| WebhookError::InvalidSignature)
    }
}

/// Hex HMAC-SHA256 of `body`, as a buyer would send it.
pub fn sign(secret: &str, body: &[u8]) -> Result<String, WebhookError> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| WebhookError::InvalidSignature)?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Outcome of an accepted webhook.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookReceipt {
    pub buyer_id: String,
    pub lead_id: Option<String>,
    pub status: PostStatus,
    pub buyer_lead_id: Option<String>,
    pub reason: Option<String>,
}

const LEAD_ID_FIELDS: [&str; 4] = ["leadId", "lead_id", "externalId", "data.leadId"];

/// Verifies, interprets and records asynchronous delivery confirmations.
pub struct WebhookProcessor {
    verifier: Arc<dyn SignatureVerifier>,
    parser: Arc<ResponseParser>,
    log: Arc<dyn TransactionSink>,
}

impl WebhookProcessor {
    pub fn new(
        verifier: Arc<dyn SignatureVerifier>,
        parser: Arc<ResponseParser>,
        log: Arc<dyn TransactionSink>,
    ) -> Self {
        Self {
            verifier,
            parser,
            log,
        }
    }

    pub async fn handle(
        &self,
        buyer_id: &str,
        signature: Option<&str>,
        timestamp: Option<&str>,
        body: &[u8],
    ) -> Result<WebhookReceipt, WebhookError> {
        if let Err(e) = self
            .verifier
            .verify(buyer_id, signature, timestamp, body, Utc::now())
        {
            tracing::warn!("Rejected webhook from buyer {}: {}", buyer_id, e);
            return Err(e);
        }

        let text = String::from_utf8_lossy(body);
        let parsed = self.parser.parse_post(buyer_id, 200, &text).await;

        let json: Value = serde_json::from_str(&text).unwrap_or(Value::Null);
        let lead_id = LEAD_ID_FIELDS
            .iter()
            .filter_map(|field| lookup_path(&json, field))
            .map(value_to_string)
            .find(|id| !id.trim().is_empty());

        let outcome = if parsed.status == PostStatus::Delivered {
            AuctionOutcome::Won
        } else {
            AuctionOutcome::Lost
        };
        self.log.record(
            LogEntry::new(
                TransactionAction::Webhook,
                lead_id.as_deref().unwrap_or("unknown"),
                buyer_id,
                parsed.status.as_str(),
            )
            .error(parsed.reason.clone())
            .outcome(outcome)
            .build(),
        );

        tracing::info!(
            "Webhook from buyer {} for lead {:?}: {}",
            buyer_id,
            lead_id,
            parsed.status.as_str()
        );
        Ok(WebhookReceipt {
            buyer_id: buyer_id.to_string(),
            lead_id,
            status: parsed.status,
            buyer_lead_id: parsed.buyer_lead_id,
            reason: parsed.reason,
        })
    }
}
