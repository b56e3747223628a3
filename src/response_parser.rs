//! Buyer response normalization.
//!
//! Every buyer answers PING and POST calls in its own vocabulary. This module
//! folds HTTP status codes and JSON bodies into the closed [`PingStatus`] and
//! [`PostStatus`] sets. Ambiguity always resolves to the rejecting side.

use async_trait::async_trait;
use moka::future::Cache;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::transformations::{lookup_path, value_as_f64, value_to_string};

/// Normalized PING verdict.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PingStatus {
    Accepted,
    Rejected,
    Error,
}

impl PingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PingStatus::Accepted => "accepted",
            PingStatus::Rejected => "rejected",
            PingStatus::Error => "error",
        }
    }
}

/// Normalized POST verdict.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PostStatus {
    Delivered,
    Failed,
    Duplicate,
    Invalid,
}

impl PostStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PostStatus::Delivered => "delivered",
            PostStatus::Failed => "failed",
            PostStatus::Duplicate => "duplicate",
            PostStatus::Invalid => "invalid",
        }
    }
}

/// How a raw HTTP status code is interpreted before the body is read.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum HttpStatusAction {
    Success,
    Retry,
    Reject,
    Error,
    Duplicate,
    Invalid,
}

/// A field/value pair that signals success when no status field is present.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SuccessIndicator {
    pub field: String,
    pub value: Value,
}

/// Per-buyer response vocabulary.
///
/// Admin-customised configs are merged over [`ResponseMappingConfig::default`]
/// with [`ResponseMappingConfig::merged_over`]; a custom field only wins when
/// it is non-empty.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ResponseMappingConfig {
    pub ping_status_field: String,
    pub post_status_field: String,
    pub accepted_values: Vec<String>,
    pub rejected_values: Vec<String>,
    pub error_values: Vec<String>,
    pub delivered_values: Vec<String>,
    pub failed_values: Vec<String>,
    pub duplicate_values: Vec<String>,
    pub invalid_values: Vec<String>,
    /// Candidate bid amount paths, tried in order.
    pub bid_amount_fields: Vec<String>,
    pub reason_fields: Vec<String>,
    pub lead_id_fields: Vec<String>,
    /// Explicit per-code verdicts. Codes not listed fall back to their class.
    pub http_status_codes: BTreeMap<u16, HttpStatusAction>,
    pub success_indicators: Vec<SuccessIndicator>,
}

fn words(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

impl Default for ResponseMappingConfig {
    fn default() -> Self {
        let mut http_status_codes = BTreeMap::new();
        for code in [429, 502, 503, 504] {
            http_status_codes.insert(code, HttpStatusAction::Retry);
        }
        // A conflict from a buyer almost always means "already have this lead".
        http_status_codes.insert(409, HttpStatusAction::Duplicate);

        Self {
            ping_status_field: "status".to_string(),
            post_status_field: "status".to_string(),
            accepted_values: words(&[
                "accepted", "accept", "approved", "approve", "success", "successful", "ok",
                "okay", "yes", "y", "true", "1", "bid", "bidding", "interested", "match",
                "matched", "qualified", "valid", "will_buy", "buy", "buying", "purchase",
                "won", "win", "available", "active", "confirmed", "positive", "go",
            ]),
            rejected_values: words(&[
                "rejected", "reject", "declined", "decline", "denied", "deny", "no", "n",
                "false", "0", "no_bid", "nobid", "pass", "passed", "not_interested",
                "uninterested", "no_match", "nomatch", "unqualified", "not_qualified",
                "disqualified", "filtered", "capped", "cap_reached", "over_cap", "closed",
                "unavailable", "no_coverage", "out_of_area", "blocked", "refused", "skip",
            ]),
            error_values: words(&[
                "error", "err", "errored", "failure", "fail", "failed", "exception",
                "invalid_request", "bad_request", "system_error", "server_error",
                "internal_error", "timeout", "timed_out", "maintenance", "throttled",
                "rate_limited", "unauthorized", "forbidden", "auth_error",
                "authentication_failed", "invalid_credentials", "misconfigured",
                "unknown_error", "fatal", "crash",
            ]),
            delivered_values: words(&[
                "delivered", "accepted", "accept", "success", "successful", "ok", "okay",
                "sold", "purchased", "received", "created", "complete", "completed",
                "confirmed", "approved", "posted", "processed", "queued", "yes", "true", "1",
                "lead_accepted", "lead_delivered", "done", "saved", "stored", "won",
            ]),
            failed_values: words(&[
                "failed", "fail", "failure", "rejected", "reject", "declined", "denied",
                "error", "no", "false", "0", "not_sold", "unsold", "refused", "returned",
                "cancelled", "canceled", "expired", "timeout", "capped", "over_cap",
                "filtered", "blocked", "not_accepted", "lead_rejected", "unavailable",
                "closed", "no_match",
            ]),
            duplicate_values: words(&[
                "duplicate", "dupe", "dup", "duplicated", "already_exists", "exists",
                "already_received", "already_sold", "repeat", "previously_sold",
                "existing_lead", "duplicate_lead", "lead_exists", "seen", "already_submitted",
                "resubmission", "recent_duplicate", "duplicate_phone", "duplicate_email",
            ]),
            invalid_values: words(&[
                "invalid", "invalid_data", "bad_data", "validation_error",
                "validation_failed", "malformed", "incomplete", "missing_fields",
                "missing_data", "bad_phone", "invalid_phone", "invalid_email", "bad_email",
                "invalid_zip", "bad_zip", "fraud", "fraudulent", "suspicious", "test_lead",
                "junk", "bogus", "unverified", "invalid_lead", "data_error",
            ]),
            bid_amount_fields: words(&[
                "bidAmount", "bid_amount", "bid", "amount", "price", "payout", "value",
                "data.bidAmount", "data.bid_amount", "data.price", "result.bid",
                "response.bid_amount",
            ]),
            reason_fields: words(&[
                "reason", "message", "error", "errorMessage", "error_message", "detail",
                "details", "description", "data.reason", "data.message", "errors.0",
            ]),
            lead_id_fields: words(&[
                "leadId", "lead_id", "id", "buyerLeadId", "buyer_lead_id", "reference",
                "referenceId", "confirmation", "confirmationId", "data.leadId", "data.lead_id",
                "data.id",
            ]),
            http_status_codes,
            success_indicators: vec![
                SuccessIndicator {
                    field: "interested".to_string(),
                    value: Value::Bool(true),
                },
                SuccessIndicator {
                    field: "accepted".to_string(),
                    value: Value::Bool(true),
                },
                SuccessIndicator {
                    field: "success".to_string(),
                    value: Value::Bool(true),
                },
            ],
        }
    }
}

fn pick_str(custom: &str, default: &str) -> String {
    if custom.trim().is_empty() {
        default.to_string()
    } else {
        custom.to_string()
    }
}

fn pick_vec<T: Clone>(custom: &[T], default: &[T]) -> Vec<T> {
    if custom.is_empty() {
        default.to_vec()
    } else {
        custom.to_vec()
    }
}

impl ResponseMappingConfig {
    /// Field-by-field merge: `self` (the custom config) wins where non-empty.
    ///
    /// HTTP codes merge per code so a buyer can override a single entry.
    pub fn merged_over(&self, defaults: &ResponseMappingConfig) -> ResponseMappingConfig {
        let mut http_status_codes = defaults.http_status_codes.clone();
        http_status_codes.extend(self.http_status_codes.iter().map(|(k, v)| (*k, *v)));

        ResponseMappingConfig {
            ping_status_field: pick_str(&self.ping_status_field, &defaults.ping_status_field),
            post_status_field: pick_str(&self.post_status_field, &defaults.post_status_field),
            accepted_values: pick_vec(&self.accepted_values, &defaults.accepted_values),
            rejected_values: pick_vec(&self.rejected_values, &defaults.rejected_values),
            error_values: pick_vec(&self.error_values, &defaults.error_values),
            delivered_values: pick_vec(&self.delivered_values, &defaults.delivered_values),
            failed_values: pick_vec(&self.failed_values, &defaults.failed_values),
            duplicate_values: pick_vec(&self.duplicate_values, &defaults.duplicate_values),
            invalid_values: pick_vec(&self.invalid_values, &defaults.invalid_values),
            bid_amount_fields: pick_vec(&self.bid_amount_fields, &defaults.bid_amount_fields),
            reason_fields: pick_vec(&self.reason_fields, &defaults.reason_fields),
            lead_id_fields: pick_vec(&self.lead_id_fields, &defaults.lead_id_fields),
            http_status_codes,
            success_indicators: pick_vec(&self.success_indicators, &defaults.success_indicators),
        }
    }

    /// Verdict for an HTTP status code.
    pub fn http_action(&self, status: u16) -> HttpStatusAction {
        if let Some(action) = self.http_status_codes.get(&status) {
            return *action;
        }
        match status {
            200..=299 => HttpStatusAction::Success,
            400..=499 => HttpStatusAction::Reject,
            _ => HttpStatusAction::Error,
        }
    }
}

/// Trims, lowercases and folds spaces/hyphens so "No Bid" matches "no_bid".
pub fn normalize_status(raw: &str) -> String {
    raw.trim()
        .to_lowercase()
        .split(|c: char| c.is_whitespace() || c == '-')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("_")
}

fn contains_status(list: &[String], normalized: &str) -> bool {
    list.iter().any(|candidate| normalize_status(candidate) == normalized)
}

/// First positive numeric value among the candidate paths, tried in order.
pub fn extract_bid_amount(body: &Value, fields: &[String]) -> Option<f64> {
    fields.iter().find_map(|field| {
        lookup_path(body, field)
            .and_then(value_as_f64)
            .filter(|amount| amount.is_finite() && *amount > 0.0)
    })
}

fn extract_text(body: &Value, fields: &[String]) -> Option<String> {
    fields.iter().find_map(|field| match lookup_path(body, field)? {
        Value::Null | Value::Object(_) | Value::Array(_) => None,
        value => {
            let text = value_to_string(value);
            let text = text.trim();
            (!text.is_empty()).then(|| text.to_string())
        }
    })
}

/// `Some(true)` if an indicator matched, `Some(false)` if indicator fields were
/// present but none matched, `None` if none of them appear in the body.
fn success_indicated(body: &Value, indicators: &[SuccessIndicator]) -> Option<bool> {
    let mut seen = false;
    for indicator in indicators {
        if let Some(actual) = lookup_path(body, &indicator.field) {
            seen = true;
            let matches = actual == &indicator.value
                || normalize_status(&value_to_string(actual))
                    == normalize_status(&value_to_string(&indicator.value));
            if matches {
                return Some(true);
            }
        }
    }
    seen.then_some(false)
}

/// Body as JSON, or a bare string when the buyer answered with plain text.
fn parse_body(body: &str) -> Value {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return Value::Null;
    }
    serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_string()))
}

/// Raw status string: a scalar at the status path, or the whole body when
/// the buyer answered with a bare string.
fn raw_status(body: &Value, status_field: &str) -> Option<String> {
    let value = match body {
        Value::String(_) => body,
        _ => lookup_path(body, status_field)?,
    };
    match value {
        Value::Null | Value::Object(_) | Value::Array(_) => None,
        other => Some(value_to_string(other)).filter(|s| !s.trim().is_empty()),
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PingParseResult {
    pub status: PingStatus,
    pub bid_amount: Option<f64>,
    pub should_retry: bool,
    pub raw_status: Option<String>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PostParseResult {
    pub status: PostStatus,
    pub reason: Option<String>,
    pub buyer_lead_id: Option<String>,
    pub should_retry: bool,
    pub raw_status: Option<String>,
}

/// Interprets a PING response against a resolved mapping config.
pub fn interpret_ping(
    config: &ResponseMappingConfig,
    http_status: u16,
    body: &str,
) -> PingParseResult {
    let json = parse_body(body);
    let reason = extract_text(&json, &config.reason_fields);

    let short_circuit = |status, should_retry: bool| PingParseResult {
        status,
        bid_amount: None,
        should_retry,
        raw_status: Some(http_status.to_string()),
        reason: reason.clone(),
    };
    match config.http_action(http_status) {
        HttpStatusAction::Retry => return short_circuit(PingStatus::Error, true),
        HttpStatusAction::Error => return short_circuit(PingStatus::Error, false),
        HttpStatusAction::Reject | HttpStatusAction::Duplicate | HttpStatusAction::Invalid => {
            return short_circuit(PingStatus::Rejected, false)
        }
        HttpStatusAction::Success => {}
    }

    let bid_amount = extract_bid_amount(&json, &config.bid_amount_fields);
    let raw = raw_status(&json, &config.ping_status_field);

    let status = match raw.as_deref().map(normalize_status) {
        Some(normalized) => {
            if contains_status(&config.accepted_values, &normalized) {
                PingStatus::Accepted
            } else if contains_status(&config.rejected_values, &normalized) {
                PingStatus::Rejected
            } else if contains_status(&config.error_values, &normalized) {
                PingStatus::Error
            } else {
                tracing::warn!(
                    "Unrecognized PING status '{}', treating as rejected",
                    normalized
                );
                PingStatus::Rejected
            }
        }
        None => match success_indicated(&json, &config.success_indicators) {
            Some(true) => PingStatus::Accepted,
            Some(false) => PingStatus::Rejected,
            None if bid_amount.is_some() => PingStatus::Accepted,
            None => PingStatus::Rejected,
        },
    };

    PingParseResult {
        status,
        bid_amount: if status == PingStatus::Accepted {
            bid_amount
        } else {
            None
        },
        should_retry: false,
        raw_status: raw,
        reason,
    }
}

/// Interprets a POST response against a resolved mapping config.
pub fn interpret_post(
    config: &ResponseMappingConfig,
    http_status: u16,
    body: &str,
) -> PostParseResult {
    let json = parse_body(body);
    let reason = extract_text(&json, &config.reason_fields);

    let short_circuit = |status, should_retry: bool| PostParseResult {
        status,
        reason: reason.clone(),
        buyer_lead_id: None,
        should_retry,
        raw_status: Some(http_status.to_string()),
    };
    match config.http_action(http_status) {
        HttpStatusAction::Retry => return short_circuit(PostStatus::Failed, true),
        HttpStatusAction::Error => return short_circuit(PostStatus::Failed, false),
        HttpStatusAction::Reject => return short_circuit(PostStatus::Failed, false),
        HttpStatusAction::Duplicate => return short_circuit(PostStatus::Duplicate, false),
        HttpStatusAction::Invalid => return short_circuit(PostStatus::Invalid, false),
        HttpStatusAction::Success => {}
    }

    let raw = raw_status(&json, &config.post_status_field);
    let status = match raw.as_deref().map(normalize_status) {
        Some(normalized) => {
            if contains_status(&config.delivered_values, &normalized) {
                PostStatus::Delivered
            } else if contains_status(&config.failed_values, &normalized) {
                PostStatus::Failed
            } else if contains_status(&config.duplicate_values, &normalized) {
                PostStatus::Duplicate
            } else if contains_status(&config.invalid_values, &normalized) {
                PostStatus::Invalid
            } else {
                tracing::warn!(
                    "Unrecognized POST status '{}', treating as failed",
                    normalized
                );
                PostStatus::Failed
            }
        }
        None => match success_indicated(&json, &config.success_indicators) {
            Some(false) => PostStatus::Failed,
            _ => PostStatus::Delivered,
        },
    };

    let buyer_lead_id = if status == PostStatus::Delivered {
        extract_text(&json, &config.lead_id_fields)
    } else {
        None
    };

    PostParseResult {
        status,
        reason,
        buyer_lead_id,
        should_retry: false,
        raw_status: raw,
    }
}

/// Where custom, admin-edited response mappings come from.
#[async_trait]
pub trait ResponseMappingSource: Send + Sync {
    async fn load(&self, buyer_id: &str) -> Option<ResponseMappingConfig>;
}

/// Resolves per-buyer mapping configs through a TTL cache and parses
/// responses with them.
pub struct ResponseParser {
    source: Arc<dyn ResponseMappingSource>,
    defaults: Arc<ResponseMappingConfig>,
    cache: Cache<String, Arc<ResponseMappingConfig>>,
}

impl ResponseParser {
    pub fn new(source: Arc<dyn ResponseMappingSource>, ttl: Duration) -> Self {
        let cache = Cache::builder()
            .time_to_live(ttl)
            .max_capacity(10_000)
            .build();

        Self {
            source,
            defaults: Arc::new(ResponseMappingConfig::default()),
            cache,
        }
    }

    /// Effective (merged) mapping for a buyer.
    pub async fn config_for(&self, buyer_id: &str) -> Arc<ResponseMappingConfig> {
        let source = Arc::clone(&self.source);
        let defaults = Arc::clone(&self.defaults);
        let id = buyer_id.to_string();

        self.cache
            .get_with(buyer_id.to_string(), async move {
                match source.load(&id).await {
                    Some(custom) => {
                        tracing::debug!("Loaded custom response mapping for buyer {}", id);
                        Arc::new(custom.merged_over(&defaults))
                    }
                    None => defaults,
                }
            })
            .await
    }

    /// Drops the cached mapping so the next parse reloads it.
    pub async fn invalidate(&self, buyer_id: &str) {
        self.cache.invalidate(buyer_id).await;
        tracing::info!("Invalidated response mapping cache for buyer {}", buyer_id);
    }

    pub async fn parse_ping(&self, buyer_id: &str, http_status: u16, body: &str) -> PingParseResult {
        let config = self.config_for(buyer_id).await;
        interpret_ping(&config, http_status, body)
    }

    pub async fn parse_post(&self, buyer_id: &str, http_status: u16, body: &str) -> PostParseResult {
        let config = self.config_for(buyer_id).await;
        interpret_post(&config, http_status, body)
    }
}
