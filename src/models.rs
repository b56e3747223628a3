use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

use crate::errors::{MappingFailure, ValidationError};
use crate::response_parser::{PostStatus, ResponseMappingConfig};

// ============ Lead Models ============

/// Immutable snapshot of one consumer inquiry.
///
/// Created once per inbound submission and never mutated by the auction core.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LeadData {
    /// Unique lead identifier.
    pub id: String,
    /// Service type the consumer asked about (e.g. "windows", "roofing").
    pub service_type_id: String,
    /// Free-form answers collected by the form.
    #[serde(default)]
    pub form_data: Map<String, Value>,
    /// Five digit US zip code.
    pub zip_code: String,
    /// Whether the consumer owns the property.
    #[serde(default)]
    pub owns_home: bool,
    /// Desired project timeframe (e.g. "within_3_months").
    #[serde(default)]
    pub timeframe: String,
    /// Lifecycle status as tracked by the intake layer.
    #[serde(default)]
    pub status: Option<String>,
    /// Submission time.
    pub created_at: DateTime<Utc>,
    /// Consent and attestation evidence, when captured.
    #[serde(default)]
    pub compliance: Option<ComplianceData>,
}

/// Compliance evidence attached to a lead.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ComplianceData {
    pub trusted_form_cert_url: Option<String>,
    pub trusted_form_cert_id: Option<String>,
    pub jornaya_lead_id: Option<String>,
    #[serde(default)]
    pub tcpa_consent: bool,
    pub tcpa_consent_text: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    /// Time the consent was captured.
    pub timestamp: Option<DateTime<Utc>>,
    pub geo: Option<GeoLocation>,
    #[serde(default)]
    pub attribution: Attribution,
}

impl ComplianceData {
    pub fn has_trusted_form(&self) -> bool {
        self.trusted_form_cert_url
            .as_deref()
            .is_some_and(|u| !u.trim().is_empty())
    }

    pub fn has_jornaya(&self) -> bool {
        self.jornaya_lead_id
            .as_deref()
            .is_some_and(|id| !id.trim().is_empty())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GeoLocation {
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub city: Option<String>,
    pub state: Option<String>,
}

/// Marketing attribution captured on the landing page.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Attribution {
    pub utm_source: Option<String>,
    pub utm_medium: Option<String>,
    pub utm_campaign: Option<String>,
    pub utm_term: Option<String>,
    pub utm_content: Option<String>,
    pub gclid: Option<String>,
    pub fbclid: Option<String>,
    pub landing_page: Option<String>,
    pub referrer: Option<String>,
}

// ============ Buyer Configuration Models ============

/// A buyer network and everything needed to talk to it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuyerConfig {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub base_url: String,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub settings: BuyerSettings,
    /// Buyer-specific aliases for compliance fields.
    #[serde(default)]
    pub compliance_fields: ComplianceFieldConfig,
    /// Admin-customised response vocabulary, merged over the defaults.
    #[serde(default)]
    pub response_mapping: Option<ResponseMappingConfig>,
    #[serde(default)]
    pub service_configs: Vec<BuyerServiceConfig>,
}

impl BuyerConfig {
    /// Service configuration for a service type, if the buyer supports it.
    pub fn service_config(&self, service_type_id: &str) -> Option<&BuyerServiceConfig> {
        self.service_configs
            .iter()
            .find(|s| s.service_type_id == service_type_id)
    }
}

/// How requests to the buyer are authenticated.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum AuthConfig {
    #[default]
    None,
    #[serde(rename_all = "camelCase")]
    ApiKey {
        #[serde(default = "default_api_key_header")]
        header: String,
        key: String,
    },
    Bearer {
        token: String,
    },
    Basic {
        username: String,
        password: String,
    },
    /// Pre-issued OAuth access token; token exchange happens outside the core.
    #[serde(rename = "oauth", rename_all = "camelCase")]
    OAuth {
        access_token: String,
        #[serde(default = "default_token_type")]
        token_type: String,
    },
}

/// Buyer-wide concurrency and failover settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BuyerSettings {
    /// Upper bound on simultaneous outbound calls to this buyer.
    pub max_concurrent_requests: usize,
    /// Whether the per-buyer circuit breaker is enabled.
    pub failover_enabled: bool,
    /// Consecutive failures before the breaker opens.
    pub failure_threshold: u32,
    /// Initial breaker open duration in seconds.
    pub circuit_reset_secs: u64,
    /// Whether PING payloads carry compliance fields.
    pub include_compliance_in_ping: bool,
}

impl Default for BuyerSettings {
    fn default() -> Self {
        Self {
            max_concurrent_requests: 10,
            failover_enabled: true,
            failure_threshold: 5,
            circuit_reset_secs: 30,
            include_compliance_in_ping: false,
        }
    }
}

/// A buyer's configuration for one service type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuyerServiceConfig {
    pub service_type_id: String,
    #[serde(default = "default_true")]
    pub active: bool,
    /// Ranking weight; higher priority wins ties.
    #[serde(default)]
    pub priority: u32,
    #[serde(default)]
    pub pricing: PricingConfig,
    pub ping_template: TemplateConfig,
    pub post_template: TemplateConfig,
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub restrictions: Option<ServiceRestrictions>,
}

/// Geography and compliance requirements a lead must meet for this buyer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServiceRestrictions {
    /// Accepted zip code prefixes. Empty accepts every zip.
    pub zip_prefixes: Vec<String>,
    pub require_trusted_form: bool,
    pub require_jornaya: bool,
    pub require_tcpa_consent: bool,
}

/// Base price with conditional modifiers and a bid clamp.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PricingConfig {
    pub base_price: f64,
    pub min_bid: Option<f64>,
    pub max_bid: Option<f64>,
    pub modifiers: Vec<PriceModifier>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PriceModifier {
    /// Source field (flattened lead key, dot-path allowed).
    pub field: String,
    pub operator: ConditionOperator,
    #[serde(default)]
    pub value: Value,
    pub adjustment: PriceAdjustment,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ConditionOperator {
    Equals,
    NotEquals,
    In,
    GreaterThan,
    LessThan,
    Exists,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "amount", rename_all = "camelCase")]
pub enum PriceAdjustment {
    Add(f64),
    Multiply(f64),
}

/// Endpoints, timeouts and retry policy for PING/POST calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookConfig {
    pub ping_url: String,
    pub post_url: String,
    #[serde(default = "default_ping_timeout_ms")]
    pub ping_timeout_ms: u64,
    #[serde(default = "default_post_timeout_ms")]
    pub post_timeout_ms: u64,
    #[serde(default)]
    pub retry_policy: RetryPolicy,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum BackoffStrategy {
    Exponential,
    Linear,
    Fixed,
}

/// Deferred re-delivery policy, consumed only by the retry handler.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: BackoffStrategy,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffStrategy::Exponential,
            base_delay_ms: 60_000,
            max_delay_ms: 3_600_000,
        }
    }
}

/// Buyer-specific output names for compliance facts.
///
/// One internal value may be written under several aliases.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct ComplianceFieldConfig {
    pub trusted_form_url_fields: Vec<String>,
    pub trusted_form_id_fields: Vec<String>,
    pub jornaya_fields: Vec<String>,
    pub tcpa_consent_fields: Vec<String>,
    pub tcpa_text_fields: Vec<String>,
    pub ip_address_fields: Vec<String>,
    pub user_agent_fields: Vec<String>,
    pub timestamp_fields: Vec<String>,
    pub geo_fields: GeoFieldNames,
    /// Attribution key (e.g. "utmSource") to output aliases.
    pub attribution_fields: BTreeMap<String, Vec<String>>,
}

fn names(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

impl Default for ComplianceFieldConfig {
    fn default() -> Self {
        let mut attribution_fields = BTreeMap::new();
        for (key, alias) in [
            ("utmSource", "utm_source"),
            ("utmMedium", "utm_medium"),
            ("utmCampaign", "utm_campaign"),
            ("utmTerm", "utm_term"),
            ("utmContent", "utm_content"),
            ("gclid", "gclid"),
            ("fbclid", "fbclid"),
            ("landingPage", "landing_page"),
            ("referrer", "referrer"),
        ] {
            attribution_fields.insert(key.to_string(), vec![alias.to_string()]);
        }

        Self {
            trusted_form_url_fields: names(&["xxTrustedFormCertUrl", "trusted_form_cert_url"]),
            trusted_form_id_fields: names(&["trusted_form_cert_id"]),
            jornaya_fields: names(&["universal_leadid", "jornaya_lead_id"]),
            tcpa_consent_fields: names(&["tcpa_consent"]),
            tcpa_text_fields: names(&["tcpa_consent_text"]),
            ip_address_fields: names(&["ip_address"]),
            user_agent_fields: names(&["user_agent"]),
            timestamp_fields: names(&["consent_timestamp"]),
            geo_fields: GeoFieldNames::default(),
            attribution_fields,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct GeoFieldNames {
    pub latitude: Vec<String>,
    pub longitude: Vec<String>,
    pub city: Vec<String>,
    pub state: Vec<String>,
}

impl Default for GeoFieldNames {
    fn default() -> Self {
        Self {
            latitude: names(&["latitude"]),
            longitude: names(&["longitude"]),
            city: names(&["city"]),
            state: names(&["state"]),
        }
    }
}

// ============ Template Models ============

/// Declarative, per-buyer field mapping.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateConfig {
    #[serde(default)]
    pub mappings: Vec<TemplateMapping>,
    /// Static constants the buyer requires on every request.
    #[serde(default)]
    pub additional_fields: Map<String, Value>,
    /// Overrides the engine-wide serialized payload ceiling.
    #[serde(default)]
    pub max_payload_bytes: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateMapping {
    pub source_field: String,
    pub target_field: String,
    #[serde(default)]
    pub transform: Option<TransformSpec>,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default_value: Option<Value>,
    #[serde(default)]
    pub validation: Option<ValidationRule>,
    /// String substitutions applied before the transform.
    #[serde(default)]
    pub value_map: Option<BTreeMap<String, String>>,
}

impl TemplateMapping {
    pub fn new(source_field: &str, target_field: &str) -> Self {
        Self {
            source_field: source_field.to_string(),
            target_field: target_field.to_string(),
            transform: None,
            required: false,
            default_value: None,
            validation: None,
            value_map: None,
        }
    }

    pub fn with_transform(mut self, name: &str) -> Self {
        self.transform = Some(TransformSpec::Named(name.to_string()));
        self
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }
}

/// A transform reference: a bare name or a name with arguments.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum TransformSpec {
    Named(String),
    WithArgs {
        name: String,
        #[serde(default)]
        args: Vec<Value>,
    },
}

impl TransformSpec {
    pub fn name(&self) -> &str {
        match self {
            TransformSpec::Named(name) | TransformSpec::WithArgs { name, .. } => name,
        }
    }

    pub fn args(&self) -> &[Value] {
        match self {
            TransformSpec::Named(_) => &[],
            TransformSpec::WithArgs { args, .. } => args,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum ValidationType {
    Email,
    Phone,
    ZipCode,
    Url,
    Number,
    Boolean,
    String,
}

/// Field-level validation rule; every populated constraint must hold.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ValidationRule {
    #[serde(rename = "type")]
    pub rule_type: Option<ValidationType>,
    pub min_length: Option<usize>,
    pub max_length: Option<usize>,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub pattern: Option<String>,
    pub allowed_values: Option<Vec<Value>>,
}

/// Typed outcome of a template run.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransformationResult {
    pub success: bool,
    pub data: Option<Map<String, Value>>,
    pub error: Option<String>,
    pub validation_errors: Vec<ValidationError>,
    pub mapping_errors: Vec<MappingFailure>,
    pub duration_ms: u64,
}

// ============ Auction Models ============

/// Which leg of the PING/POST protocol a call belongs to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum CallKind {
    Ping,
    Post,
}

impl CallKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CallKind::Ping => "ping",
            CallKind::Post => "post",
        }
    }
}

/// One buyer's PING outcome.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BidResponse {
    pub buyer_id: String,
    pub buyer_name: String,
    /// True only for an accepted bid with a usable amount.
    pub success: bool,
    pub bid_amount: Option<f64>,
    pub response_time_ms: u64,
    pub priority: u32,
    pub raw_status: Option<String>,
    pub error: Option<String>,
    #[serde(default)]
    pub timed_out: bool,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuctionStatus {
    Completed,
    Failed,
    Timeout,
    NoBids,
}

/// Outcome of one POST delivery attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostResult {
    pub buyer_id: String,
    pub success: bool,
    pub status: PostStatus,
    pub buyer_lead_id: Option<String>,
    pub reason: Option<String>,
    pub http_status: Option<u16>,
    pub response_time_ms: u64,
    pub should_retry: bool,
    pub error: Option<String>,
    /// Id of the transaction log entry written for this attempt.
    #[serde(default)]
    pub transaction_id: Option<String>,
}

/// Aggregate auction outcome. Created fresh per auction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuctionResult {
    pub auction_id: String,
    pub lead_id: String,
    pub status: AuctionStatus,
    pub winning_buyer_id: Option<String>,
    pub winning_bid_amount: Option<f64>,
    pub bids: Vec<BidResponse>,
    pub duration_ms: u64,
    pub participant_count: usize,
    pub post_result: Option<PostResult>,
    /// Every POST attempt in cascade order, the final one included.
    #[serde(default)]
    pub delivery_attempts: Vec<PostResult>,
    #[serde(default)]
    pub retry_scheduled: bool,
    pub error: Option<String>,
}

// ============ Transaction Log Models ============

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TransactionAction {
    Ping,
    Post,
    Webhook,
    Retry,
    Delivery,
}

/// Win/loss attribution of an attempt.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AuctionOutcome {
    Won,
    Lost,
    None,
}

/// Append-only audit record of one buyer interaction.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionLog {
    pub id: String,
    pub auction_id: Option<String>,
    pub lead_id: String,
    pub buyer_id: String,
    pub action_type: TransactionAction,
    /// Normalized status string (e.g. "accepted", "delivered", "timeout").
    pub status: String,
    pub bid_amount: Option<f64>,
    pub http_status: Option<u16>,
    pub response_time_ms: u64,
    pub error_message: Option<String>,
    pub outcome: AuctionOutcome,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
}

fn default_true() -> bool {
    true
}

fn default_api_key_header() -> String {
    "X-API-Key".to_string()
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

fn default_ping_timeout_ms() -> u64 {
    3_000
}

fn default_post_timeout_ms() -> u64 {
    10_000
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_buyer_config_deserializes_camel_case() {
        let raw = json!({
            "id": "buyer-1",
            "name": "Acme Home Leads",
            "auth": { "type": "apiKey", "key": "secret" },
            "serviceConfigs": [{
                "serviceTypeId": "windows",
                "priority": 5,
                "pingTemplate": { "mappings": [
                    { "sourceField": "zipCode", "targetField": "zip", "required": true }
                ]},
                "postTemplate": { "mappings": [] },
                "webhook": {
                    "pingUrl": "https://buyer.example/ping",
                    "postUrl": "https://buyer.example/post",
                    "retryPolicy": {
                        "maxAttempts": 4,
                        "backoff": "linear",
                        "baseDelayMs": 1000,
                        "maxDelayMs": 5000
                    }
                }
            }]
        });

        let buyer: BuyerConfig = serde_json::from_value(raw).unwrap();
        assert!(buyer.active);
        assert_eq!(
            buyer.auth,
            AuthConfig::ApiKey {
                header: "X-API-Key".to_string(),
                key: "secret".to_string()
            }
        );
        let service = buyer.service_config("windows").unwrap();
        assert_eq!(service.priority, 5);
        assert_eq!(service.webhook.ping_timeout_ms, 3_000);
        assert_eq!(service.webhook.retry_policy.backoff, BackoffStrategy::Linear);
        assert!(service.ping_template.mappings[0].required);
    }

    #[test]
    fn test_transform_spec_accepts_name_or_args() {
        let named: TransformSpec = serde_json::from_value(json!("boolean.yesNo")).unwrap();
        assert_eq!(named.name(), "boolean.yesNo");
        assert!(named.args().is_empty());

        let with_args: TransformSpec =
            serde_json::from_value(json!({ "name": "string.truncate", "args": [10] })).unwrap();
        assert_eq!(with_args.name(), "string.truncate");
        assert_eq!(with_args.args(), &[json!(10)]);
    }
}
