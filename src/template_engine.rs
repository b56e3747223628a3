/// Template engine: reshapes one lead into a buyer-specific payload.
///
/// Pipeline per call:
/// 1. Validate lead, buyer and template shape
/// 2. Flatten the lead into a source map
/// 3. Run the buyer's `before` hook
/// 4. Apply every mapping concurrently, collecting all failures
/// 5. Inject compliance aliases, merge static fields, run the `after` hook
/// 6. Validate and sanitize the final payload
use chrono::{DateTime, SecondsFormat, Utc};
use dashmap::DashMap;
use futures::future::join_all;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use crate::errors::{MappingFailure, TemplateEngineError};
use crate::models::{
    BuyerConfig, BuyerServiceConfig, CallKind, ComplianceData, ComplianceFieldConfig, LeadData,
    TemplateConfig, TemplateMapping, TransformationResult,
};
use crate::monitor::PerformanceMonitor;
use crate::transformations::{
    insert_path, is_empty_value, lookup_path, value_to_string, TransformRegistry,
};
use crate::validator::DataValidator;

/// Per-buyer strategy hook around a template run.
///
/// Every method has a no-op default so implementors only override what they need.
pub trait TransformHook: Send + Sync {
    /// Runs over the flattened source map before mappings are applied.
    fn before(&self, _source: &mut Map<String, Value>) -> Result<(), String> {
        Ok(())
    }

    /// Runs over the assembled payload before final validation.
    fn after(&self, _payload: &mut Map<String, Value>) -> Result<(), String> {
        Ok(())
    }

    /// Observes any error the run produced.
    fn on_error(&self, _error: &TemplateEngineError) {}
}

pub struct TemplateEngine {
    transforms: Arc<TransformRegistry>,
    validator: DataValidator,
    hooks: DashMap<String, Arc<dyn TransformHook>>,
    monitor: Option<Arc<PerformanceMonitor>>,
}

impl Default for TemplateEngine {
    fn default() -> Self {
        Self::new(TransformRegistry::with_defaults(), DataValidator::default())
    }
}

impl TemplateEngine {
    pub fn new(transforms: TransformRegistry, validator: DataValidator) -> Self {
        Self {
            transforms: Arc::new(transforms),
            validator,
            hooks: DashMap::new(),
            monitor: None,
        }
    }

    pub fn with_monitor(mut self, monitor: Arc<PerformanceMonitor>) -> Self {
        self.monitor = Some(monitor);
        self
    }

    /// Installs (or replaces) the hook for a buyer.
    pub fn register_hook(&self, buyer_id: &str, hook: Arc<dyn TransformHook>) {
        self.hooks.insert(buyer_id.to_string(), hook);
    }

    pub fn validator(&self) -> &DataValidator {
        &self.validator
    }

    /// Builds the PING or POST payload for a buyer's service configuration.
    ///
    /// POST always carries compliance data; PING follows the buyer's setting.
    pub async fn build_payload(
        &self,
        lead: &LeadData,
        buyer: &BuyerConfig,
        service: &BuyerServiceConfig,
        kind: CallKind,
    ) -> Result<Map<String, Value>, TemplateEngineError> {
        match kind {
            CallKind::Ping => {
                self.transform(
                    lead,
                    buyer,
                    &service.ping_template,
                    buyer.settings.include_compliance_in_ping,
                )
                .await
            }
            CallKind::Post => self.transform(lead, buyer, &service.post_template, true).await,
        }
    }

    /// Transforms a lead with a template, returning the payload or an error.
    pub async fn transform(
        &self,
        lead: &LeadData,
        buyer: &BuyerConfig,
        template: &TemplateConfig,
        include_compliance: bool,
    ) -> Result<Map<String, Value>, TemplateEngineError> {
        let started = Instant::now();
        let hook = self.hooks.get(&buyer.id).map(|entry| Arc::clone(entry.value()));

        let result = self
            .run(lead, buyer, template, include_compliance, hook.as_deref())
            .await;

        if let Err(e) = &result {
            tracing::warn!(
                "Transform failed for lead {} / buyer {}: {}",
                lead.id,
                buyer.id,
                e
            );
            if let Some(hook) = &hook {
                hook.on_error(e);
            }
        }
        if let Some(monitor) = &self.monitor {
            monitor.record_transformation(started.elapsed(), result.is_ok());
        }
        result
    }

    /// Same as [`TemplateEngine::transform`] but folded into a typed result.
    pub async fn transform_result(
        &self,
        lead: &LeadData,
        buyer: &BuyerConfig,
        template: &TemplateConfig,
        include_compliance: bool,
    ) -> TransformationResult {
        let started = Instant::now();
        let outcome = self.transform(lead, buyer, template, include_compliance).await;
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            Ok(data) => TransformationResult {
                success: true,
                data: Some(data),
                error: None,
                validation_errors: Vec::new(),
                mapping_errors: Vec::new(),
                duration_ms,
            },
            Err(e) => {
                let validation_errors = e.validation_errors().into_iter().cloned().collect();
                let mapping_errors = match &e {
                    TemplateEngineError::Mappings(failures) => failures.clone(),
                    _ => Vec::new(),
                };
                TransformationResult {
                    success: false,
                    data: None,
                    error: Some(e.to_string()),
                    validation_errors,
                    mapping_errors,
                    duration_ms,
                }
            }
        }
    }

    async fn run(
        &self,
        lead: &LeadData,
        buyer: &BuyerConfig,
        template: &TemplateConfig,
        include_compliance: bool,
        hook: Option<&dyn TransformHook>,
    ) -> Result<Map<String, Value>, TemplateEngineError> {
        let validation_started = Instant::now();
        self.validator.validate_lead(lead)?;
        self.validator.validate_buyer(buyer)?;
        self.validator.validate_template(template)?;
        let mut validation_elapsed = validation_started.elapsed();

        let mut source = flatten_lead(lead, Utc::now());
        if let Some(hook) = hook {
            hook.before(&mut source).map_err(TemplateEngineError::Hook)?;
        }
        let source = Value::Object(source);

        let outcomes = join_all(template.mappings.iter().map(|mapping| {
            let source = &source;
            async move { self.apply_mapping(source, mapping) }
        }))
        .await;

        let mut payload = Map::new();
        let mut failures = Vec::new();
        for outcome in outcomes {
            match outcome {
                Ok(Some((target, value))) => insert_path(&mut payload, target, value),
                Ok(None) => {}
                Err(failure) => failures.push(failure),
            }
        }
        if !failures.is_empty() {
            return Err(TemplateEngineError::Mappings(failures));
        }

        if include_compliance {
            if let Some(compliance) = &lead.compliance {
                inject_compliance(&mut payload, compliance, &buyer.compliance_fields);
            }
        }

        for (key, value) in &template.additional_fields {
            payload.insert(key.clone(), value.clone());
        }

        if let Some(hook) = hook {
            hook.after(&mut payload).map_err(TemplateEngineError::Hook)?;
        }

        let final_started = Instant::now();
        let required: Vec<&str> = template
            .mappings
            .iter()
            .filter(|m| m.required)
            .map(|m| m.target_field.as_str())
            .collect();
        // Checks run on the sanitized bytes that are actually sent.
        let payload = self.validator.sanitize_map(payload);
        self.validator
            .validate_payload(&payload, &required, template.max_payload_bytes)?;
        validation_elapsed += final_started.elapsed();

        if let Some(monitor) = &self.monitor {
            monitor.record_validation(validation_elapsed);
        }

        tracing::debug!(
            "Transformed lead {} for buyer {}: {} field(s)",
            lead.id,
            buyer.id,
            payload.len()
        );
        Ok(payload)
    }

    /// Resolves, validates, value-maps and transforms a single mapping.
    ///
    /// `Ok(None)` means the value is absent and the mapping is optional.
    fn apply_mapping<'m>(
        &self,
        source: &Value,
        mapping: &'m TemplateMapping,
    ) -> Result<Option<(&'m str, Value)>, MappingFailure> {
        let validation_failure = |error| MappingFailure::Validation {
            source_field: mapping.source_field.clone(),
            target_field: mapping.target_field.clone(),
            error,
        };

        let resolved = lookup_path(source, &mapping.source_field)
            .filter(|v| !v.is_null())
            .cloned()
            .or_else(|| mapping.default_value.clone());

        let missing = resolved.as_ref().map_or(true, is_empty_value);
        if mapping.required && missing {
            return Err(validation_failure(crate::errors::ValidationError::new(
                mapping.source_field.clone(),
                format!("required field is missing (target '{}')", mapping.target_field),
            )));
        }

        let Some(value) = resolved else {
            return Ok(None);
        };

        if let Some(rule) = &mapping.validation {
            if !missing {
                self.validator
                    .validate_field(&mapping.source_field, &value, rule)
                    .map_err(validation_failure)?;
            }
        }

        let value = apply_value_map(value, mapping.value_map.as_ref());

        let value = match &mapping.transform {
            Some(spec) => self.transforms.apply(spec, &value).map_err(|error| {
                MappingFailure::Transformation {
                    source_field: mapping.source_field.clone(),
                    target_field: mapping.target_field.clone(),
                    error,
                }
            })?,
            None => value,
        };

        Ok(Some((mapping.target_field.as_str(), value)))
    }
}

/// Flattens a lead into the key space mappings read from.
///
/// `formData` keys are spread first so core and compliance keys win on
/// collision; `formData` also stays addressable as a nested object.
pub fn flatten_lead(lead: &LeadData, now: DateTime<Utc>) -> Map<String, Value> {
    let mut source = lead.form_data.clone();
    source.insert("formData".to_string(), Value::Object(lead.form_data.clone()));

    if let Some(c) = &lead.compliance {
        let mut put = |key: &str, value: Option<Value>| {
            if let Some(v) = value {
                source.insert(key.to_string(), v);
            }
        };
        put("trustedFormCertUrl", c.trusted_form_cert_url.clone().map(Value::String));
        put("trustedFormCertId", c.trusted_form_cert_id.clone().map(Value::String));
        put("jornayaLeadId", c.jornaya_lead_id.clone().map(Value::String));
        put("tcpaConsent", Some(Value::Bool(c.tcpa_consent)));
        put("tcpaConsentText", c.tcpa_consent_text.clone().map(Value::String));
        put("ipAddress", c.ip_address.clone().map(Value::String));
        put("userAgent", c.user_agent.clone().map(Value::String));
        put("complianceTimestamp", c.timestamp.map(|t| json!(rfc3339(t))));
        if let Some(geo) = &c.geo {
            put("geoLatitude", geo.latitude.map(|v| json!(v)));
            put("geoLongitude", geo.longitude.map(|v| json!(v)));
            put("geoCity", geo.city.clone().map(Value::String));
            put("geoState", geo.state.clone().map(Value::String));
        }
        if let Ok(Value::Object(attribution)) = serde_json::to_value(&c.attribution) {
            for (key, value) in attribution {
                put(&key, Some(value).filter(|v| !v.is_null()));
            }
        }
    }

    source.insert("leadId".to_string(), json!(lead.id));
    source.insert("serviceTypeId".to_string(), json!(lead.service_type_id));
    source.insert("zipCode".to_string(), json!(lead.zip_code));
    source.insert("ownsHome".to_string(), json!(lead.owns_home));
    source.insert("timeframe".to_string(), json!(lead.timeframe));
    if let Some(status) = &lead.status {
        source.insert("status".to_string(), json!(status));
    }
    source.insert("createdAt".to_string(), json!(rfc3339(lead.created_at)));

    let age_minutes = (now - lead.created_at).num_minutes().max(0);
    source.insert("leadAgeMinutes".to_string(), json!(age_minutes));
    let has_compliance = lead
        .compliance
        .as_ref()
        .is_some_and(|c| c.has_trusted_form() || c.has_jornaya() || c.tcpa_consent);
    source.insert("hasCompliance".to_string(), json!(has_compliance));

    source
}

fn rfc3339(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Admin-configured substitutions, matched on the trimmed string form.
fn apply_value_map(value: Value, value_map: Option<&BTreeMap<String, String>>) -> Value {
    let Some(map) = value_map else {
        return value;
    };
    if value.is_object() || value.is_array() {
        return value;
    }
    let key = value_to_string(&value);
    match map.get(key.trim()) {
        Some(mapped) => Value::String(mapped.clone()),
        None => value,
    }
}

fn aliases<'a>(custom: &'a [String], fallback: &'a [String]) -> &'a [String] {
    if custom.is_empty() {
        fallback
    } else {
        custom
    }
}

/// Writes compliance facts under every alias the buyer expects.
///
/// Values already produced by explicit mappings are left in place.
fn inject_compliance(
    payload: &mut Map<String, Value>,
    compliance: &ComplianceData,
    fields: &ComplianceFieldConfig,
) {
    let defaults = ComplianceFieldConfig::default();
    let mut put = |targets: &[String], value: Option<Value>| {
        let Some(value) = value else { return };
        for target in targets {
            payload
                .entry(target.clone())
                .or_insert_with(|| value.clone());
        }
    };

    put(
        aliases(&fields.trusted_form_url_fields, &defaults.trusted_form_url_fields),
        compliance.trusted_form_cert_url.clone().map(Value::String),
    );
    put(
        aliases(&fields.trusted_form_id_fields, &defaults.trusted_form_id_fields),
        compliance.trusted_form_cert_id.clone().map(Value::String),
    );
    put(
        aliases(&fields.jornaya_fields, &defaults.jornaya_fields),
        compliance.jornaya_lead_id.clone().map(Value::String),
    );
    put(
        aliases(&fields.tcpa_consent_fields, &defaults.tcpa_consent_fields),
        Some(Value::Bool(compliance.tcpa_consent)),
    );
    put(
        aliases(&fields.tcpa_text_fields, &defaults.tcpa_text_fields),
        compliance.tcpa_consent_text.clone().map(Value::String),
    );
    put(
        aliases(&fields.ip_address_fields, &defaults.ip_address_fields),
        compliance.ip_address.clone().map(Value::String),
    );
    put(
        aliases(&fields.user_agent_fields, &defaults.user_agent_fields),
        compliance.user_agent.clone().map(Value::String),
    );
    put(
        aliases(&fields.timestamp_fields, &defaults.timestamp_fields),
        compliance.timestamp.map(|t| json!(rfc3339(t))),
    );

    if let Some(geo) = &compliance.geo {
        let (custom, fallback) = (&fields.geo_fields, &defaults.geo_fields);
        put(
            aliases(&custom.latitude, &fallback.latitude),
            geo.latitude.map(|v| json!(v)),
        );
        put(
            aliases(&custom.longitude, &fallback.longitude),
            geo.longitude.map(|v| json!(v)),
        );
        put(
            aliases(&custom.city, &fallback.city),
            geo.city.clone().map(Value::String),
        );
        put(
            aliases(&custom.state, &fallback.state),
            geo.state.clone().map(Value::String),
        );
    }

    let attribution = serde_json::to_value(&compliance.attribution).unwrap_or(Value::Null);
    let attribution_fields = if fields.attribution_fields.is_empty() {
        &defaults.attribution_fields
    } else {
        &fields.attribution_fields
    };
    for (key, targets) in attribution_fields {
        let value = attribution.get(key).filter(|v| !v.is_null()).cloned();
        put(targets, value);
    }
}
