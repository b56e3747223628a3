/// Template engine integration tests
/// Exercises the full lead -> payload pipeline through the public API
use chrono::Utc;
use rust_lead_broker::errors::{MappingFailure, TemplateEngineError};
use rust_lead_broker::models::{
    BuyerConfig, ComplianceData, LeadData, TemplateConfig, TemplateMapping, TransformSpec,
};
use rust_lead_broker::template_engine::{TemplateEngine, TransformHook};
use rust_lead_broker::transformations::TransformRegistry;
use rust_lead_broker::validator::DataValidator;
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

fn lead(form_data: Value) -> LeadData {
    LeadData {
        id: "lead-100".to_string(),
        service_type_id: "windows".to_string(),
        form_data: form_data.as_object().cloned().unwrap_or_default(),
        zip_code: "90210".to_string(),
        owns_home: true,
        timeframe: "within_3_months".to_string(),
        status: None,
        created_at: Utc::now(),
        compliance: None,
    }
}

fn buyer() -> BuyerConfig {
    serde_json::from_value(json!({
        "id": "buyer-1",
        "name": "Acme Windows"
    }))
    .unwrap()
}

fn template(mappings: Vec<TemplateMapping>) -> TemplateConfig {
    TemplateConfig {
        mappings,
        ..TemplateConfig::default()
    }
}

#[tokio::test]
async fn test_homeowner_and_window_bucket() {
    let engine = TemplateEngine::default();
    let template = template(vec![
        TemplateMapping::new("ownsHome", "homeowner").with_transform("boolean.yesNo"),
        TemplateMapping::new("numberOfWindows", "window_count")
            .with_transform("service.windowsCount"),
    ]);

    let payload = engine
        .transform(&lead(json!({ "numberOfWindows": 8 })), &buyer(), &template, false)
        .await
        .unwrap();

    assert_eq!(payload["homeowner"], json!("Yes"));
    assert_eq!(payload["window_count"], json!("6-10 windows"));
}

#[tokio::test]
async fn test_every_failing_mapping_is_reported() {
    let engine = TemplateEngine::default();
    let template = template(vec![
        TemplateMapping::new("email", "email_address").required(),
        TemplateMapping::new("numberOfWindows", "window_count").with_transform("service.bogus"),
        TemplateMapping::new("zipCode", "zip"),
    ]);

    let err = engine
        .transform(&lead(json!({ "numberOfWindows": 3 })), &buyer(), &template, false)
        .await
        .unwrap_err();

    let TemplateEngineError::Mappings(failures) = &err else {
        panic!("expected aggregated mapping errors, got {:?}", err);
    };
    assert_eq!(failures.len(), 2);
    let targets: Vec<&str> = failures.iter().map(|f| f.target_field()).collect();
    assert!(targets.contains(&"email_address"));
    assert!(targets.contains(&"window_count"));
    assert!(failures
        .iter()
        .any(|f| matches!(f, MappingFailure::Transformation { .. })));
}

#[tokio::test]
async fn test_optional_missing_field_is_omitted_not_null() {
    let engine = TemplateEngine::default();
    let template = template(vec![
        TemplateMapping::new("formData.contact.email", "email"),
        TemplateMapping::new("zipCode", "zip"),
    ]);

    let payload = engine
        .transform(&lead(json!({})), &buyer(), &template, false)
        .await
        .unwrap();

    assert!(!payload.contains_key("email"));
    assert_eq!(payload["zip"], json!("90210"));
}

#[tokio::test]
async fn test_default_value_satisfies_required_mapping() {
    let engine = TemplateEngine::default();
    let mut source = TemplateMapping::new("leadSource", "source").required();
    source.default_value = Some(json!("web"));

    let payload = engine
        .transform(&lead(json!({})), &buyer(), &template(vec![source]), false)
        .await
        .unwrap();
    assert_eq!(payload["source"], json!("web"));
}

#[tokio::test]
async fn test_value_map_runs_before_transform() {
    let engine = TemplateEngine::default();
    let mut mapping = TemplateMapping::new("timeframe", "purchase_timeframe");
    let mut value_map = BTreeMap::new();
    value_map.insert("within_3_months".to_string(), "1-6 months".to_string());
    mapping.value_map = Some(value_map);
    mapping.transform = Some(TransformSpec::Named("string.uppercase".to_string()));

    let payload = engine
        .transform(&lead(json!({})), &buyer(), &template(vec![mapping]), false)
        .await
        .unwrap();
    assert_eq!(payload["purchase_timeframe"], json!("1-6 MONTHS"));
}

#[tokio::test]
async fn test_compliance_written_under_every_alias() {
    let engine = TemplateEngine::default();
    let mut lead = lead(json!({}));
    lead.compliance = Some(ComplianceData {
        trusted_form_cert_url: Some("https://cert.trustedform.com/abc123".to_string()),
        jornaya_lead_id: Some("JL-42".to_string()),
        tcpa_consent: true,
        ip_address: Some("203.0.113.9".to_string()),
        ..ComplianceData::default()
    });

    let mut buyer = buyer();
    buyer.compliance_fields.jornaya_fields =
        vec!["leadid_token".to_string(), "universal_leadid".to_string()];

    let with = engine
        .transform(&lead, &buyer, &template(vec![]), true)
        .await
        .unwrap();
    assert_eq!(with["leadid_token"], json!("JL-42"));
    assert_eq!(with["universal_leadid"], json!("JL-42"));
    assert_eq!(
        with["xxTrustedFormCertUrl"],
        json!("https://cert.trustedform.com/abc123")
    );
    assert_eq!(with["ip_address"], json!("203.0.113.9"));

    let without = engine
        .transform(&lead, &buyer, &template(vec![]), false)
        .await
        .unwrap();
    assert!(!without.contains_key("leadid_token"));
}

#[tokio::test]
async fn test_additional_fields_and_sanitization() {
    let engine = TemplateEngine::default();
    let mut template = template(vec![TemplateMapping::new("comments", "notes")]);
    template
        .additional_fields
        .insert("vendor".to_string(), json!("broker"));

    let payload = engine
        .transform(
            &lead(json!({ "comments": "<script>alert(1)</script>call after 5" })),
            &buyer(),
            &template,
            false,
        )
        .await
        .unwrap();

    assert_eq!(payload["vendor"], json!("broker"));
    let notes = payload["notes"].as_str().unwrap();
    assert!(!notes.contains("<script>"));
    assert!(notes.contains("call after 5"));
}

#[tokio::test]
async fn test_payload_size_ceiling() {
    let engine = TemplateEngine::new(TransformRegistry::with_defaults(), DataValidator::new(64));
    let template = template(vec![TemplateMapping::new("comments", "notes")]);

    let err = engine
        .transform(
            &lead(json!({ "comments": "x".repeat(200) })),
            &buyer(),
            &template,
            false,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, TemplateEngineError::Validation(_)));
}

#[tokio::test]
async fn test_mapping_order_does_not_change_output() {
    let engine = TemplateEngine::default();
    let mappings = vec![
        TemplateMapping::new("zipCode", "zip").with_transform("address.zip5"),
        TemplateMapping::new("ownsHome", "homeowner").with_transform("boolean.yn"),
        TemplateMapping::new("numberOfWindows", "windows").with_transform("service.windowsCount"),
        TemplateMapping::new("timeframe", "when").with_transform("service.timeframe"),
    ];
    let mut reversed = mappings.clone();
    reversed.reverse();

    let lead = lead(json!({ "numberOfWindows": "12" }));
    let forward = engine
        .transform(&lead, &buyer(), &template(mappings), false)
        .await
        .unwrap();
    let backward = engine
        .transform(&lead, &buyer(), &template(reversed), false)
        .await
        .unwrap();
    assert_eq!(forward, backward);
}

#[tokio::test]
async fn test_transform_result_carries_validation_errors() {
    let engine = TemplateEngine::default();
    let template = template(vec![TemplateMapping::new("email", "email").required()]);

    let result = engine
        .transform_result(&lead(json!({})), &buyer(), &template, false)
        .await;
    assert!(!result.success);
    assert!(result.data.is_none());
    assert_eq!(result.validation_errors.len(), 1);
    assert_eq!(result.mapping_errors.len(), 1);
}

struct StampHook;

impl TransformHook for StampHook {
    fn before(&self, source: &mut Map<String, Value>) -> Result<(), String> {
        source.insert("campaign".to_string(), json!("spring"));
        Ok(())
    }

    fn after(&self, payload: &mut Map<String, Value>) -> Result<(), String> {
        if payload.contains_key("blocked") {
            return Err("blocked field present".to_string());
        }
        payload.insert("stamped".to_string(), json!(true));
        Ok(())
    }
}

#[tokio::test]
async fn test_buyer_hook_runs_around_mappings() {
    let engine = TemplateEngine::default();
    engine.register_hook("buyer-1", Arc::new(StampHook));

    let payload = engine
        .transform(
            &lead(json!({})),
            &buyer(),
            &template(vec![TemplateMapping::new("campaign", "utm_campaign")]),
            false,
        )
        .await
        .unwrap();
    assert_eq!(payload["utm_campaign"], json!("spring"));
    assert_eq!(payload["stamped"], json!(true));

    let err = engine
        .transform(
            &lead(json!({ "blocked": 1 })),
            &buyer(),
            &template(vec![TemplateMapping::new("blocked", "blocked")]),
            false,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, TemplateEngineError::Hook(_)));
}

#[tokio::test]
async fn test_required_field_emptied_by_sanitization_fails() {
    let engine = TemplateEngine::default();
    let template = template(vec![TemplateMapping::new("firstName", "first_name").required()]);

    let err = engine
        .transform(&lead(json!({ "firstName": "<b></b>" })), &buyer(), &template, false)
        .await
        .unwrap_err();

    let TemplateEngineError::Validation(validation) = &err else {
        panic!("expected a validation error, got {:?}", err);
    };
    assert!(validation.to_string().contains("first_name"));
}

#[tokio::test]
async fn test_identical_inputs_serialize_identically() {
    let engine = TemplateEngine::default();
    let lead = lead(json!({ "numberOfWindows": 4, "phone": "(201) 555-0123" }));
    let template = template(vec![
        TemplateMapping::new("leadId", "lead_id").required(),
        TemplateMapping::new("ownsHome", "homeowner").with_transform("boolean.yesNo"),
        TemplateMapping::new("numberOfWindows", "window_count")
            .with_transform("service.windowsCount"),
        TemplateMapping::new("phone", "phone").with_transform("phone.e164"),
        TemplateMapping::new("createdAt", "created_at"),
    ]);

    let first = engine
        .transform(&lead, &buyer(), &template, false)
        .await
        .unwrap();
    let second = engine
        .transform(&lead, &buyer(), &template, false)
        .await
        .unwrap();

    assert_eq!(
        serde_json::to_vec(&first).unwrap(),
        serde_json::to_vec(&second).unwrap()
    );
}
