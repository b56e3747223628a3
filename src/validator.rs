//! Field- and payload-level validation used by the template engine.

use regex::Regex;
use serde_json::{Map, Value};
use std::collections::HashSet;
use std::sync::LazyLock;

use crate::errors::ValidationError;
use crate::models::{BuyerConfig, LeadData, TemplateConfig, ValidationRule, ValidationType};
use crate::transformations::{
    is_empty_value, is_valid_email, lookup_path, value_as_f64, value_to_string,
};

static ZIP_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\d{5}(-\d{4})?$").expect("zip regex is valid"));

static DANGEROUS_BLOCK_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?is)<(script|style|iframe|object|embed)\b[^>]*>.*?</(script|style|iframe|object|embed)\s*>",
    )
    .expect("block regex is valid")
});

static TAG_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"</?[a-zA-Z][^>]*>").expect("tag regex is valid"));

static SCRIPT_URI_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(javascript|vbscript)\s*:").expect("uri regex is valid"));

static EVENT_HANDLER_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bon[a-z]+\s*=").expect("handler regex is valid"));

/// Stateless validator for leads, templates, field values and payloads.
#[derive(Debug, Clone)]
pub struct DataValidator {
    max_payload_bytes: usize,
}

impl Default for DataValidator {
    fn default() -> Self {
        Self::new(64 * 1024)
    }
}

impl DataValidator {
    pub fn new(max_payload_bytes: usize) -> Self {
        Self { max_payload_bytes }
    }

    pub fn max_payload_bytes(&self) -> usize {
        self.max_payload_bytes
    }

    /// Structural checks on a lead before any field processing.
    pub fn validate_lead(&self, lead: &LeadData) -> Result<(), ValidationError> {
        if lead.id.trim().is_empty() {
            return Err(ValidationError::new("id", "lead id is required"));
        }
        if lead.service_type_id.trim().is_empty() {
            return Err(ValidationError::new("serviceTypeId", "service type is required"));
        }
        if !ZIP_REGEX.is_match(lead.zip_code.trim()) {
            return Err(ValidationError::new(
                "zipCode",
                format!("'{}' is not a valid US zip code", lead.zip_code),
            ));
        }
        Ok(())
    }

    pub fn validate_buyer(&self, buyer: &BuyerConfig) -> Result<(), ValidationError> {
        if buyer.id.trim().is_empty() {
            return Err(ValidationError::new("buyer.id", "buyer id is required"));
        }
        if buyer.name.trim().is_empty() {
            return Err(ValidationError::new("buyer.name", "buyer name is required"));
        }
        Ok(())
    }

    /// Template shape: non-empty source/target on every mapping, disjoint
    /// targets, compilable patterns.
    pub fn validate_template(&self, template: &TemplateConfig) -> Result<(), ValidationError> {
        let mut targets = HashSet::new();
        for (index, mapping) in template.mappings.iter().enumerate() {
            let name = format!("mappings[{}]", index);
            if mapping.source_field.trim().is_empty() {
                return Err(ValidationError::new(
                    name,
                    format!("sourceField is empty (targetField '{}')", mapping.target_field),
                ));
            }
            if mapping.target_field.trim().is_empty() {
                return Err(ValidationError::new(
                    name,
                    format!("targetField is empty (sourceField '{}')", mapping.source_field),
                ));
            }
            if !targets.insert(mapping.target_field.as_str()) {
                return Err(ValidationError::new(
                    name,
                    format!("duplicate targetField '{}'", mapping.target_field),
                ));
            }
            if let Some(pattern) = mapping.validation.as_ref().and_then(|v| v.pattern.as_ref()) {
                Regex::new(pattern).map_err(|e| {
                    ValidationError::new(
                        mapping.target_field.clone(),
                        format!("invalid validation pattern: {}", e),
                    )
                })?;
            }
        }
        Ok(())
    }

    /// Checks one value against a mapping's validation rule.
    pub fn validate_field(
        &self,
        field: &str,
        value: &Value,
        rule: &ValidationRule,
    ) -> Result<(), ValidationError> {
        let text = value_to_string(value);
        let fail = |message: String| Err(ValidationError::new(field, message));

        if let Some(rule_type) = rule.rule_type {
            let ok = match rule_type {
                ValidationType::Email => is_valid_email(text.trim()),
                ValidationType::Phone => is_us_phone(&text),
                ValidationType::ZipCode => ZIP_REGEX.is_match(text.trim()),
                ValidationType::Url => url::Url::parse(text.trim())
                    .map(|u| matches!(u.scheme(), "http" | "https"))
                    .unwrap_or(false),
                ValidationType::Number => value_as_f64(value).is_some(),
                ValidationType::Boolean => {
                    value.is_boolean()
                        || matches!(
                            text.trim().to_lowercase().as_str(),
                            "true" | "false" | "yes" | "no" | "1" | "0"
                        )
                }
                ValidationType::String => value.is_string(),
            };
            if !ok {
                let kind = format!("{:?}", rule_type).to_lowercase();
                return fail(format!("'{}' is not a valid {}", text, kind));
            }
        }

        let length = text.chars().count();
        if let Some(min) = rule.min_length {
            if length < min {
                return fail(format!("length {} is below minimum {}", length, min));
            }
        }
        if let Some(max) = rule.max_length {
            if length > max {
                return fail(format!("length {} exceeds maximum {}", length, max));
            }
        }

        if rule.min.is_some() || rule.max.is_some() {
            let Some(number) = value_as_f64(value) else {
                return fail(format!("'{}' is not numeric", text));
            };
            if let Some(min) = rule.min {
                if number < min {
                    return fail(format!("{} is below minimum {}", number, min));
                }
            }
            if let Some(max) = rule.max {
                if number > max {
                    return fail(format!("{} exceeds maximum {}", number, max));
                }
            }
        }

        if let Some(pattern) = &rule.pattern {
            let regex = Regex::new(pattern)
                .map_err(|e| ValidationError::new(field, format!("invalid pattern: {}", e)))?;
            if !regex.is_match(&text) {
                return fail(format!("'{}' does not match pattern {}", text, pattern));
            }
        }

        if let Some(allowed) = &rule.allowed_values {
            let permitted = allowed.iter().any(|candidate| {
                candidate == value
                    || value_to_string(candidate).eq_ignore_ascii_case(text.trim())
            });
            if !permitted {
                return fail(format!("'{}' is not an allowed value", text));
            }
        }

        Ok(())
    }

    /// Final payload checks: required targets present and non-empty, size
    /// under the ceiling.
    pub fn validate_payload(
        &self,
        payload: &Map<String, Value>,
        required_targets: &[&str],
        max_bytes: Option<usize>,
    ) -> Result<(), ValidationError> {
        let root = Value::Object(payload.clone());
        for &target in required_targets {
            let present = lookup_path(&root, target).is_some_and(|v| !is_empty_value(v));
            if !present {
                return Err(ValidationError::new(
                    target,
                    "required field missing from output payload",
                ));
            }
        }

        let limit = max_bytes.unwrap_or(self.max_payload_bytes);
        let size = serde_json::to_vec(&root)
            .map_err(|e| ValidationError::new("payload", format!("not serializable: {}", e)))?
            .len();
        if size > limit {
            return Err(ValidationError::new(
                "payload",
                format!("serialized size {} bytes exceeds limit {}", size, limit),
            ));
        }
        Ok(())
    }

    /// Strips script blocks, markup, script URIs and inline event handlers
    /// from every string leaf.
    pub fn sanitize(&self, value: Value) -> Value {
        match value {
            Value::String(s) => Value::String(sanitize_str(&s)),
            Value::Array(items) => Value::Array(items.into_iter().map(|v| self.sanitize(v)).collect()),
            Value::Object(map) => Value::Object(
                map.into_iter()
                    .map(|(k, v)| (k, self.sanitize(v)))
                    .collect(),
            ),
            other => other,
        }
    }
}

impl DataValidator {
    pub fn sanitize_map(&self, map: Map<String, Value>) -> Map<String, Value> {
        map.into_iter().map(|(k, v)| (k, self.sanitize(v))).collect()
    }
}

fn is_us_phone(raw: &str) -> bool {
    let digits: Vec<char> = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    match digits.len() {
        10 => digits[0] != '0' && digits[0] != '1',
        11 => digits[0] == '1' && digits[1] != '0' && digits[1] != '1',
        _ => false,
    }
}

pub fn sanitize_str(input: &str) -> String {
    let without_blocks = DANGEROUS_BLOCK_REGEX.replace_all(input, "");
    let without_tags = TAG_REGEX.replace_all(&without_blocks, "");
    let without_uris = SCRIPT_URI_REGEX.replace_all(&without_tags, "");
    EVENT_HANDLER_REGEX
        .replace_all(&without_uris, "")
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::TemplateMapping;
    use serde_json::json;

    fn rule() -> ValidationRule {
        ValidationRule::default()
    }

    #[test]
    fn test_template_with_empty_target_names_mapping() {
        let template = TemplateConfig {
            mappings: vec![
                TemplateMapping::new("zipCode", "zip"),
                TemplateMapping::new("ownsHome", " "),
            ],
            ..Default::default()
        };
        let err = DataValidator::default().validate_template(&template).unwrap_err();
        assert_eq!(err.field, "mappings[1]");
        assert!(err.message.contains("targetField is empty"));
    }

    #[test]
    fn test_template_rejects_duplicate_targets() {
        let template = TemplateConfig {
            mappings: vec![
                TemplateMapping::new("zipCode", "zip"),
                TemplateMapping::new("formData.zip", "zip"),
            ],
            ..Default::default()
        };
        assert!(DataValidator::default().validate_template(&template).is_err());
    }

    #[test]
    fn test_field_rules() {
        let v = DataValidator::default();
        let email = ValidationRule {
            rule_type: Some(ValidationType::Email),
            ..rule()
        };
        assert!(v.validate_field("email", &json!("a@b.co"), &email).is_ok());
        assert!(v.validate_field("email", &json!("nope"), &email).is_err());

        let bounded = ValidationRule {
            min: Some(1.0),
            max: Some(50.0),
            ..rule()
        };
        assert!(v.validate_field("windows", &json!(8), &bounded).is_ok());
        let err = v.validate_field("windows", &json!(80), &bounded).unwrap_err();
        assert_eq!(err.field, "windows");

        let allowed = ValidationRule {
            allowed_values: Some(vec![json!("own"), json!("rent")]),
            ..rule()
        };
        assert!(v.validate_field("home", &json!("OWN"), &allowed).is_ok());
        assert!(v.validate_field("home", &json!("lease"), &allowed).is_err());

        let pattern = ValidationRule {
            pattern: Some(r"^\d{3}$".to_string()),
            ..rule()
        };
        assert!(v.validate_field("code", &json!("123"), &pattern).is_ok());
        assert!(v.validate_field("code", &json!("12a"), &pattern).is_err());

        let phone = ValidationRule {
            rule_type: Some(ValidationType::Phone),
            ..rule()
        };
        assert!(v.validate_field("phone", &json!("(201) 555-0123"), &phone).is_ok());
        assert!(v.validate_field("phone", &json!("011-555-0123"), &phone).is_err());
    }

    #[test]
    fn test_lead_zip_is_checked() {
        let lead: LeadData = serde_json::from_value(json!({
            "id": "lead-1",
            "serviceTypeId": "windows",
            "zipCode": "9021",
            "createdAt": "2024-01-01T00:00:00Z"
        }))
        .unwrap();
        let err = DataValidator::default().validate_lead(&lead).unwrap_err();
        assert_eq!(err.field, "zipCode");
    }

    #[test]
    fn test_payload_required_and_size() {
        let v = DataValidator::new(40);
        let mut payload = Map::new();
        payload.insert("zip".to_string(), json!("90210"));
        payload.insert("contact".to_string(), json!({ "email": "" }));

        assert!(v.validate_payload(&payload, &["zip"], None).is_ok());
        let err = v.validate_payload(&payload, &["contact.email"], None).unwrap_err();
        assert_eq!(err.field, "contact.email");

        payload.insert("notes".to_string(), json!("x".repeat(64)));
        let err = v.validate_payload(&payload, &[], None).unwrap_err();
        assert_eq!(err.field, "payload");
        assert!(v.validate_payload(&payload, &[], Some(10_000)).is_ok());
    }

    #[test]
    fn test_sanitize_strips_markup() {
        let v = DataValidator::default();
        let cleaned = v.sanitize(json!({
            "name": "<script>alert(1)</script>John <b>Smith</b>",
            "notes": ["<img src=x onerror=alert(1)>ok", "javascript:alert(1)"],
            "count": 3
        }));
        assert_eq!(
            cleaned,
            json!({ "name": "John Smith", "notes": ["ok", "alert(1)"], "count": 3 })
        );
    }
}
