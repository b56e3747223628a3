//! Pure transform functions, grouped by domain and looked up by dot-path name.
//!
//! The table is closed: names are registered at construction and an unknown
//! name is an error, never a silent pass-through.

use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use phonenumber::country::Id as CountryId;
use phonenumber::Mode;
use regex::Regex;
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::LazyLock;

use crate::errors::TransformationError;
use crate::models::TransformSpec;

/// Signature shared by every transform: input value plus optional arguments.
pub type TransformFn = fn(&Value, &[Value]) -> Result<Value, String>;

static EMAIL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^[a-zA-Z0-9.!#$%&'*+/=?^_`{|}~-]+@[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?(?:\.[a-zA-Z0-9](?:[a-zA-Z0-9-]{0,61}[a-zA-Z0-9])?)+$",
    )
    .expect("email regex is valid")
});

/// Registry of named transforms.
pub struct TransformRegistry {
    functions: HashMap<&'static str, TransformFn>,
}

impl Default for TransformRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl TransformRegistry {
    /// Empty registry. Mostly useful for tests.
    pub fn empty() -> Self {
        Self {
            functions: HashMap::new(),
        }
    }

    /// Registry populated with the full built-in catalogue.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        let table: &[(&'static str, TransformFn)] = &[
            // string
            ("string.uppercase", string_uppercase),
            ("string.lowercase", string_lowercase),
            ("string.trim", string_trim),
            ("string.titleCase", string_title_case),
            ("string.truncate", string_truncate),
            ("string.digitsOnly", string_digits_only),
            ("string.alphanumeric", string_alphanumeric),
            // number
            ("number.integer", number_integer),
            ("number.round", number_round),
            ("number.currency", number_currency),
            ("number.toString", number_to_string),
            ("number.parse", number_parse),
            // boolean
            ("boolean.yesNo", boolean_yes_no),
            ("boolean.yn", boolean_yn),
            ("boolean.trueFalse", boolean_true_false),
            ("boolean.oneZero", boolean_one_zero),
            ("boolean.toBoolean", boolean_to_boolean),
            // date
            ("date.iso", date_iso),
            ("date.usDate", date_us),
            ("date.timestamp", date_timestamp),
            ("date.year", date_year),
            ("date.format", date_format),
            // phone
            ("phone.digits", phone_digits),
            ("phone.e164", phone_e164),
            ("phone.dashed", phone_dashed),
            ("phone.parens", phone_parens),
            // email
            ("email.normalize", email_normalize),
            ("email.domain", email_domain),
            // address
            ("address.zip5", address_zip5),
            ("address.stateCode", address_state_code),
            // service specific
            ("service.windowsCount", service_windows_count),
            ("service.timeframe", service_timeframe),
            ("service.homeownerStatus", service_homeowner_status),
            ("service.roofingScope", service_roofing_scope),
            // compliance
            ("compliance.tcpaFlag", compliance_tcpa_flag),
            ("compliance.certUrl", compliance_cert_url),
            ("compliance.ipAddress", compliance_ip_address),
            // conditional
            ("conditional.ifEmpty", conditional_if_empty),
            ("conditional.equals", conditional_equals),
            ("conditional.coalesce", conditional_coalesce),
        ];
        for (name, f) in table {
            registry.register(name, *f);
        }
        registry
    }

    pub fn register(&mut self, name: &'static str, f: TransformFn) {
        self.functions.insert(name, f);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.functions.contains_key(name)
    }

    /// Registered names, sorted.
    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.functions.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Applies a transform to a value.
    pub fn apply(&self, spec: &TransformSpec, value: &Value) -> Result<Value, TransformationError> {
        let name = spec.name();
        let f = self
            .functions
            .get(name)
            .ok_or_else(|| TransformationError::UnknownTransform {
                name: name.to_string(),
            })?;
        f(value, spec.args()).map_err(|message| TransformationError::invalid(name, message))
    }
}

// ============ Value helpers ============

/// String rendering of a scalar; objects and arrays render as JSON.
pub fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

/// Numeric reading of a value. Strings may carry `$`, `,` and whitespace.
pub fn value_as_f64(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => {
            let cleaned: String = s
                .trim()
                .chars()
                .filter(|c| !matches!(c, '$' | ',' | ' '))
                .collect();
            cleaned.parse::<f64>().ok().filter(|v| v.is_finite())
        }
        _ => None,
    }
}

/// Null, empty string, whitespace-only string, empty array or empty object.
pub fn is_empty_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        Value::Array(a) => a.is_empty(),
        Value::Object(o) => o.is_empty(),
        _ => false,
    }
}

/// Resolves a dot-path (`a.b.0.c`) inside a JSON value.
///
/// An exact key match on an object wins over path splitting, so keys that
/// themselves contain dots stay addressable.
pub fn lookup_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    if let Some(v) = root.as_object().and_then(|o| o.get(path)) {
        return Some(v);
    }
    path.split('.').try_fold(root, |current, segment| match current {
        Value::Object(map) => map.get(segment),
        Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
        _ => None,
    })
}

/// Writes `value` at a dot-path, creating intermediate objects.
///
/// A non-object sitting on the path is replaced by an object.
pub fn insert_path(map: &mut Map<String, Value>, path: &str, value: Value) {
    match path.split_once('.') {
        None => {
            map.insert(path.to_string(), value);
        }
        Some((head, rest)) => {
            let entry = map
                .entry(head.to_string())
                .or_insert_with(|| Value::Object(Map::new()));
            if !entry.is_object() {
                *entry = Value::Object(Map::new());
            }
            if let Value::Object(child) = entry {
                insert_path(child, rest, value);
            }
        }
    }
}

fn value_as_bool(value: &Value) -> Result<bool, String> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::Number(n) => Ok(n.as_f64().is_some_and(|v| v != 0.0)),
        Value::Null => Ok(false),
        Value::String(s) => match s.trim().to_lowercase().as_str() {
            "true" | "yes" | "y" | "1" | "on" => Ok(true),
            "false" | "no" | "n" | "0" | "off" | "" => Ok(false),
            other => Err(format!("'{}' is not a boolean", other)),
        },
        _ => Err("expected a boolean".to_string()),
    }
}

fn require_number(value: &Value) -> Result<f64, String> {
    value_as_f64(value).ok_or_else(|| format!("'{}' is not a number", value_to_string(value)))
}

fn arg_usize(args: &[Value], index: usize, default: usize) -> Result<usize, String> {
    match args.get(index) {
        None => Ok(default),
        Some(v) => v
            .as_u64()
            .map(|n| n as usize)
            .ok_or_else(|| format!("argument {} must be a non-negative integer", index)),
    }
}

fn json_number(v: f64) -> Value {
    if v.fract() == 0.0 && v.abs() < 9.0e15 {
        json!(v as i64)
    } else {
        json!(v)
    }
}

// ============ string ============

fn string_uppercase(value: &Value, _: &[Value]) -> Result<Value, String> {
    Ok(json!(value_to_string(value).to_uppercase()))
}

fn string_lowercase(value: &Value, _: &[Value]) -> Result<Value, String> {
    Ok(json!(value_to_string(value).to_lowercase()))
}

fn string_trim(value: &Value, _: &[Value]) -> Result<Value, String> {
    Ok(json!(value_to_string(value).trim()))
}

fn string_title_case(value: &Value, _: &[Value]) -> Result<Value, String> {
    let titled = value_to_string(value)
        .split_whitespace()
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => {
                    first.to_uppercase().collect::<String>() + &chars.as_str().to_lowercase()
                }
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ");
    Ok(json!(titled))
}

fn string_truncate(value: &Value, args: &[Value]) -> Result<Value, String> {
    let max = arg_usize(args, 0, 255)?;
    Ok(json!(value_to_string(value).chars().take(max).collect::<String>()))
}

fn string_digits_only(value: &Value, _: &[Value]) -> Result<Value, String> {
    Ok(json!(value_to_string(value)
        .chars()
        .filter(|c| c.is_ascii_digit())
        .collect::<String>()))
}

fn string_alphanumeric(value: &Value, _: &[Value]) -> Result<Value, String> {
    Ok(json!(value_to_string(value)
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect::<String>()))
}

// ============ number ============

fn number_integer(value: &Value, _: &[Value]) -> Result<Value, String> {
    Ok(json!(require_number(value)?.round() as i64))
}

fn number_round(value: &Value, args: &[Value]) -> Result<Value, String> {
    let decimals = arg_usize(args, 0, 0)?.min(10) as i32;
    let factor = 10f64.powi(decimals);
    Ok(json_number((require_number(value)? * factor).round() / factor))
}

fn number_currency(value: &Value, _: &[Value]) -> Result<Value, String> {
    Ok(json!(format!("{:.2}", require_number(value)?)))
}

fn number_to_string(value: &Value, _: &[Value]) -> Result<Value, String> {
    let n = require_number(value)?;
    Ok(json!(value_to_string(&json_number(n))))
}

fn number_parse(value: &Value, _: &[Value]) -> Result<Value, String> {
    Ok(json_number(require_number(value)?))
}

// ============ boolean ============

fn boolean_yes_no(value: &Value, _: &[Value]) -> Result<Value, String> {
    Ok(json!(if value_as_bool(value)? { "Yes" } else { "No" }))
}

fn boolean_yn(value: &Value, _: &[Value]) -> Result<Value, String> {
    Ok(json!(if value_as_bool(value)? { "Y" } else { "N" }))
}

fn boolean_true_false(value: &Value, _: &[Value]) -> Result<Value, String> {
    Ok(json!(value_as_bool(value)?.to_string()))
}

fn boolean_one_zero(value: &Value, _: &[Value]) -> Result<Value, String> {
    Ok(json!(u8::from(value_as_bool(value)?)))
}

fn boolean_to_boolean(value: &Value, _: &[Value]) -> Result<Value, String> {
    Ok(json!(value_as_bool(value)?))
}

// ============ date ============

fn parse_datetime(value: &Value) -> Result<DateTime<Utc>, String> {
    if let Value::Number(n) = value {
        let secs = n.as_i64().ok_or("timestamp must be an integer")?;
        return Utc
            .timestamp_opt(secs, 0)
            .single()
            .ok_or_else(|| format!("timestamp {} out of range", secs));
    }

    let raw = value_to_string(value);
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%d", "%m/%d/%Y"] {
        if let Ok(date) = NaiveDate::parse_from_str(raw, fmt) {
            if let Some(ndt) = date.and_hms_opt(0, 0, 0) {
                return Ok(DateTime::<Utc>::from_naive_utc_and_offset(ndt, Utc));
            }
        }
    }
    Err(format!("'{}' is not a recognised date", raw))
}

fn date_iso(value: &Value, _: &[Value]) -> Result<Value, String> {
    Ok(json!(parse_datetime(value)?.to_rfc3339_opts(chrono::SecondsFormat::Secs, true)))
}

fn date_us(value: &Value, _: &[Value]) -> Result<Value, String> {
    Ok(json!(parse_datetime(value)?.format("%m/%d/%Y").to_string()))
}

fn date_timestamp(value: &Value, _: &[Value]) -> Result<Value, String> {
    Ok(json!(parse_datetime(value)?.timestamp()))
}

fn date_year(value: &Value, _: &[Value]) -> Result<Value, String> {
    Ok(json!(parse_datetime(value)?.format("%Y").to_string()))
}

fn date_format(value: &Value, args: &[Value]) -> Result<Value, String> {
    let fmt = args
        .first()
        .and_then(Value::as_str)
        .ok_or("date.format requires a format string argument")?;
    let items: Vec<Item<'_>> = StrftimeItems::new(fmt).collect();
    if items.iter().any(|item| matches!(item, Item::Error)) {
        return Err(format!("invalid date format '{}'", fmt));
    }
    let dt = parse_datetime(value)?;
    Ok(json!(dt.format_with_items(items.into_iter()).to_string()))
}

// ============ phone ============

/// Ten-digit US national number, dropping a leading country code `1`.
fn us_digits(value: &Value) -> Result<String, String> {
    let digits: String = value_to_string(value)
        .chars()
        .filter(|c| c.is_ascii_digit())
        .collect();
    let digits = match digits.len() {
        11 if digits.starts_with('1') => digits[1..].to_string(),
        _ => digits,
    };
    if digits.len() != 10 {
        return Err(format!("expected 10 digit US phone, got {} digits", digits.len()));
    }
    Ok(digits)
}

fn phone_digits(value: &Value, _: &[Value]) -> Result<Value, String> {
    Ok(json!(us_digits(value)?))
}

fn phone_e164(value: &Value, _: &[Value]) -> Result<Value, String> {
    let raw = value_to_string(value);
    let number = phonenumber::parse(Some(CountryId::US), raw.trim())
        .map_err(|e| format!("unparseable phone '{}': {:?}", raw, e))?;
    if !phonenumber::is_valid(&number) {
        return Err(format!("invalid US phone '{}'", raw));
    }
    Ok(json!(number.format().mode(Mode::E164).to_string()))
}

fn phone_dashed(value: &Value, _: &[Value]) -> Result<Value, String> {
    let d = us_digits(value)?;
    Ok(json!(format!("{}-{}-{}", &d[0..3], &d[3..6], &d[6..])))
}

fn phone_parens(value: &Value, _: &[Value]) -> Result<Value, String> {
    let d = us_digits(value)?;
    Ok(json!(format!("({}) {}-{}", &d[0..3], &d[3..6], &d[6..])))
}

// ============ email ============

/// Basic email shape check shared with the validator.
pub fn is_valid_email(email: &str) -> bool {
    email.len() >= 5 && EMAIL_REGEX.is_match(email)
}

fn email_normalize(value: &Value, _: &[Value]) -> Result<Value, String> {
    let email = value_to_string(value).trim().to_lowercase();
    if !is_valid_email(&email) {
        return Err(format!("'{}' is not a valid email", email));
    }
    Ok(json!(email))
}

fn email_domain(value: &Value, _: &[Value]) -> Result<Value, String> {
    let email = value_to_string(value).trim().to_lowercase();
    email
        .rsplit_once('@')
        .filter(|(local, domain)| !local.is_empty() && domain.contains('.'))
        .map(|(_, domain)| json!(domain))
        .ok_or_else(|| format!("'{}' has no domain", email))
}

// ============ address ============

fn address_zip5(value: &Value, _: &[Value]) -> Result<Value, String> {
    let digits: String = value_to_string(value)
        .chars()
        .filter(|c| c.is_ascii_digit())
        .take(5)
        .collect();
    if digits.len() != 5 {
        return Err("zip code needs 5 digits".to_string());
    }
    Ok(json!(digits))
}

fn address_state_code(value: &Value, _: &[Value]) -> Result<Value, String> {
    let code = value_to_string(value).trim().to_uppercase();
    if code.len() != 2 || !code.chars().all(|c| c.is_ascii_alphabetic()) {
        return Err(format!("'{}' is not a two-letter state code", code));
    }
    Ok(json!(code))
}

// ============ service ============

fn service_windows_count(value: &Value, _: &[Value]) -> Result<Value, String> {
    let count = require_number(value)?.floor() as i64;
    let bucket = match count {
        i64::MIN..=0 => return Err(format!("window count must be positive, got {}", count)),
        1..=2 => "1-2 windows",
        3..=5 => "3-5 windows",
        6..=10 => "6-10 windows",
        _ => "11+ windows",
    };
    Ok(json!(bucket))
}

fn service_timeframe(value: &Value, _: &[Value]) -> Result<Value, String> {
    let raw = value_to_string(value);
    let mapped = match raw.trim().to_lowercase().as_str() {
        "immediately" | "asap" | "now" => "Immediately",
        "within_1_month" | "1_month" | "within_a_month" => "Within 1 month",
        "within_3_months" | "1_3_months" => "1-3 months",
        "within_6_months" | "3_6_months" => "3-6 months",
        "over_6_months" | "6_plus_months" => "6+ months",
        "flexible" | "not_sure" | "unknown" => "Flexible",
        _ => return Ok(json!(raw)),
    };
    Ok(json!(mapped))
}

fn service_homeowner_status(value: &Value, _: &[Value]) -> Result<Value, String> {
    Ok(json!(if value_as_bool(value)? { "Own" } else { "Rent" }))
}

fn service_roofing_scope(value: &Value, _: &[Value]) -> Result<Value, String> {
    let raw = value_to_string(value);
    let mapped = match raw.trim().to_lowercase().as_str() {
        "repair" | "fix" => "Repair",
        "replace" | "replacement" | "full_replacement" => "Replacement",
        "new" | "new_roof" | "installation" => "New Installation",
        "inspection" => "Inspection",
        _ => return Ok(json!(raw)),
    };
    Ok(json!(mapped))
}

// ============ compliance ============

fn compliance_tcpa_flag(value: &Value, _: &[Value]) -> Result<Value, String> {
    Ok(json!(if value_as_bool(value)? { "Y" } else { "N" }))
}

fn compliance_cert_url(value: &Value, _: &[Value]) -> Result<Value, String> {
    let raw = value_to_string(value);
    let parsed = url::Url::parse(raw.trim()).map_err(|e| format!("invalid certificate URL: {}", e))?;
    if parsed.scheme() != "https" {
        return Err("certificate URL must use https".to_string());
    }
    Ok(json!(parsed.to_string()))
}

fn compliance_ip_address(value: &Value, _: &[Value]) -> Result<Value, String> {
    let raw = value_to_string(value);
    raw.trim()
        .parse::<IpAddr>()
        .map(|ip| json!(ip.to_string()))
        .map_err(|_| format!("'{}' is not an IP address", raw))
}

// ============ conditional ============

fn conditional_if_empty(value: &Value, args: &[Value]) -> Result<Value, String> {
    if is_empty_value(value) {
        Ok(args.first().cloned().unwrap_or(Value::Null))
    } else {
        Ok(value.clone())
    }
}

fn conditional_equals(value: &Value, args: &[Value]) -> Result<Value, String> {
    let [expected, then, otherwise] = args else {
        return Err("conditional.equals requires [match, then, else]".to_string());
    };
    let matches = value == expected
        || value_to_string(value).trim().eq_ignore_ascii_case(value_to_string(expected).trim());
    Ok(if matches { then.clone() } else { otherwise.clone() })
}

fn conditional_coalesce(value: &Value, args: &[Value]) -> Result<Value, String> {
    Ok(std::iter::once(value)
        .chain(args.iter())
        .find(|v| !is_empty_value(v))
        .cloned()
        .unwrap_or(Value::Null))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn apply(name: &str, value: Value) -> Result<Value, TransformationError> {
        TransformRegistry::with_defaults().apply(&TransformSpec::Named(name.to_string()), &value)
    }

    fn apply_args(name: &str, value: Value, args: Vec<Value>) -> Result<Value, TransformationError> {
        TransformRegistry::with_defaults().apply(
            &TransformSpec::WithArgs {
                name: name.to_string(),
                args,
            },
            &value,
        )
    }

    #[test]
    fn test_unknown_transform_is_an_error() {
        let err = apply("service.doesNotExist", json!("x")).unwrap_err();
        assert_eq!(
            err,
            TransformationError::UnknownTransform {
                name: "service.doesNotExist".to_string()
            }
        );
    }

    #[test]
    fn test_windows_count_buckets() {
        assert_eq!(apply("service.windowsCount", json!(1)).unwrap(), json!("1-2 windows"));
        assert_eq!(apply("service.windowsCount", json!(5)).unwrap(), json!("3-5 windows"));
        assert_eq!(apply("service.windowsCount", json!(8)).unwrap(), json!("6-10 windows"));
        assert_eq!(apply("service.windowsCount", json!("10")).unwrap(), json!("6-10 windows"));
        assert_eq!(apply("service.windowsCount", json!(25)).unwrap(), json!("11+ windows"));
        assert!(apply("service.windowsCount", json!(0)).is_err());
        assert!(apply("service.windowsCount", json!("many")).is_err());
    }

    #[test]
    fn test_boolean_family() {
        assert_eq!(apply("boolean.yesNo", json!(true)).unwrap(), json!("Yes"));
        assert_eq!(apply("boolean.yesNo", json!("no")).unwrap(), json!("No"));
        assert_eq!(apply("boolean.yn", json!(1)).unwrap(), json!("Y"));
        assert_eq!(apply("boolean.oneZero", json!(false)).unwrap(), json!(0));
        assert_eq!(apply("boolean.trueFalse", json!("YES")).unwrap(), json!("true"));
        assert!(apply("boolean.toBoolean", json!("maybe")).is_err());
    }

    #[test]
    fn test_phone_formats() {
        assert_eq!(apply("phone.digits", json!("+1 (201) 555-0123")).unwrap(), json!("2015550123"));
        assert_eq!(apply("phone.dashed", json!("2015550123")).unwrap(), json!("201-555-0123"));
        assert_eq!(apply("phone.parens", json!("201.555.0123")).unwrap(), json!("(201) 555-0123"));
        assert_eq!(apply("phone.e164", json!("(201) 555-0123")).unwrap(), json!("+12015550123"));
        assert!(apply("phone.digits", json!("555-0123")).is_err());
    }

    #[test]
    fn test_date_formats() {
        assert_eq!(apply("date.usDate", json!("2024-03-05")).unwrap(), json!("03/05/2024"));
        assert_eq!(
            apply("date.iso", json!("03/05/2024")).unwrap(),
            json!("2024-03-05T00:00:00Z")
        );
        assert_eq!(apply("date.timestamp", json!("1970-01-02")).unwrap(), json!(86400));
        assert_eq!(
            apply_args("date.format", json!("2024-03-05T10:30:00Z"), vec![json!("%Y/%m/%d %H:%M")])
                .unwrap(),
            json!("2024/03/05 10:30")
        );
        assert!(apply_args("date.format", json!("2024-03-05"), vec![json!("%Q")]).is_err());
        assert!(apply("date.iso", json!("yesterday")).is_err());
    }

    #[test]
    fn test_string_and_number_helpers() {
        assert_eq!(apply("string.titleCase", json!("jOHN  smith")).unwrap(), json!("John Smith"));
        assert_eq!(apply_args("string.truncate", json!("abcdef"), vec![json!(3)]).unwrap(), json!("abc"));
        assert_eq!(apply("number.currency", json!("$1,234.5")).unwrap(), json!("1234.50"));
        assert_eq!(apply_args("number.round", json!(1.25), vec![json!(1)]).unwrap(), json!(1.3));
        assert_eq!(apply("number.integer", json!("7.6")).unwrap(), json!(8));
        assert_eq!(apply("number.toString", json!(42.0)).unwrap(), json!("42"));
    }

    #[test]
    fn test_email_and_address() {
        assert_eq!(apply("email.normalize", json!(" John@Example.COM ")).unwrap(), json!("john@example.com"));
        assert!(apply("email.normalize", json!("not-an-email")).is_err());
        assert_eq!(apply("email.domain", json!("a@b.co")).unwrap(), json!("b.co"));
        assert_eq!(apply("address.zip5", json!("90210-1234")).unwrap(), json!("90210"));
        assert_eq!(apply("address.stateCode", json!(" ca ")).unwrap(), json!("CA"));
        assert!(apply("address.stateCode", json!("California")).is_err());
    }

    #[test]
    fn test_compliance_helpers() {
        assert_eq!(apply("compliance.tcpaFlag", json!(true)).unwrap(), json!("Y"));
        assert!(apply("compliance.certUrl", json!("http://cert.trustedform.com/abc")).is_err());
        assert_eq!(
            apply("compliance.certUrl", json!("https://cert.trustedform.com/abc")).unwrap(),
            json!("https://cert.trustedform.com/abc")
        );
        assert_eq!(apply("compliance.ipAddress", json!("10.0.0.1")).unwrap(), json!("10.0.0.1"));
        assert!(apply("compliance.ipAddress", json!("10.0.0")).is_err());
    }

    #[test]
    fn test_conditionals() {
        assert_eq!(apply_args("conditional.ifEmpty", json!(""), vec![json!("n/a")]).unwrap(), json!("n/a"));
        assert_eq!(
            apply_args("conditional.equals", json!("Own"), vec![json!("own"), json!(1), json!(0)]).unwrap(),
            json!(1)
        );
        assert!(apply_args("conditional.equals", json!("x"), vec![json!("x")]).is_err());
        assert_eq!(
            apply_args("conditional.coalesce", json!(null), vec![json!(""), json!("b")]).unwrap(),
            json!("b")
        );
    }

    #[test]
    fn test_paths() {
        let root = json!({ "a": { "b": [ { "c": 5 } ] }, "x.y": 1 });
        assert_eq!(lookup_path(&root, "a.b.0.c"), Some(&json!(5)));
        assert_eq!(lookup_path(&root, "x.y"), Some(&json!(1)));
        assert_eq!(lookup_path(&root, "a.missing"), None);

        let mut map = Map::new();
        insert_path(&mut map, "contact.phone.home", json!("2015550123"));
        insert_path(&mut map, "contact.email", json!("a@b.co"));
        assert_eq!(
            Value::Object(map),
            json!({ "contact": { "phone": { "home": "2015550123" }, "email": "a@b.co" } })
        );
    }

    #[test]
    fn test_names_are_sorted_and_complete() {
        let registry = TransformRegistry::with_defaults();
        let names = registry.names();
        assert!(names.windows(2).all(|w| w[0] < w[1]));
        assert!(registry.contains("service.windowsCount"));
        assert!(!TransformRegistry::empty().contains("service.windowsCount"));
    }
}
