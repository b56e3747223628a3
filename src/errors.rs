use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use serde_json::json;
use thiserror::Error;

/// A malformed or missing piece of input data.
///
/// Always names the field (or mapping) that failed so operators can locate it.
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[error("{field}: {message}")]
pub struct ValidationError {
    /// Field, mapping target or payload path that failed validation.
    pub field: String,
    /// Human-readable reason.
    pub message: String,
}

impl ValidationError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Failure raised by a named transform function.
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum TransformationError {
    #[error("unknown transform '{name}'")]
    UnknownTransform { name: String },
    #[error("transform '{transform}' failed: {message}")]
    InvalidInput { transform: String, message: String },
}

impl TransformationError {
    pub fn invalid(transform: &str, message: impl Into<String>) -> Self {
        TransformationError::InvalidInput {
            transform: transform.to_string(),
            message: message.into(),
        }
    }
}

/// One mapping's failure inside a template run.
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum MappingFailure {
    #[error("validation failed for {source_field} -> {target_field}: {error}")]
    Validation {
        source_field: String,
        target_field: String,
        error: ValidationError,
    },
    #[error("transformation failed for {source_field} -> {target_field}: {error}")]
    Transformation {
        source_field: String,
        target_field: String,
        error: TransformationError,
    },
}

impl MappingFailure {
    /// Target field of the failed mapping.
    pub fn target_field(&self) -> &str {
        match self {
            MappingFailure::Validation { target_field, .. }
            | MappingFailure::Transformation { target_field, .. } => target_field,
        }
    }

    pub fn as_validation(&self) -> Option<&ValidationError> {
        match self {
            MappingFailure::Validation { error, .. } => Some(error),
            MappingFailure::Transformation { .. } => None,
        }
    }
}

/// Errors produced by the template engine.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TemplateEngineError {
    /// Lead structure, template shape, or final payload failed validation.
    #[error("validation error: {0}")]
    Validation(#[from] ValidationError),
    /// One or more mappings failed. Every failure of the batch is listed.
    #[error("{} mapping(s) failed: {}", .0.len(), join_failures(.0))]
    Mappings(Vec<MappingFailure>),
    /// Engine or template misconfiguration.
    #[error("template configuration error: {0}")]
    Configuration(String),
    /// A before/after hook rejected the data.
    #[error("transform hook failed: {0}")]
    Hook(String),
}

impl TemplateEngineError {
    /// Every validation error carried by this error, including per-mapping ones.
    pub fn validation_errors(&self) -> Vec<&ValidationError> {
        match self {
            TemplateEngineError::Validation(e) => vec![e],
            TemplateEngineError::Mappings(failures) => {
                failures.iter().filter_map(|f| f.as_validation()).collect()
            }
            _ => Vec::new(),
        }
    }
}

fn join_failures(failures: &[MappingFailure]) -> String {
    failures
        .iter()
        .map(|f| f.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Auction-level failure, correlated by auction id.
#[derive(Debug, Clone, Error)]
pub enum AuctionError {
    #[error("auction {auction_id}: invalid lead: {source}")]
    InvalidLead {
        auction_id: String,
        source: ValidationError,
    },
}

/// Outbound call failure before a buyer produced an HTTP response.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransportError {
    #[error("request timed out after {0} ms")]
    Timeout(u64),
    #[error("connection failed: {0}")]
    Connection(String),
    #[error("circuit open for buyer {0}")]
    CircuitOpen(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

/// Inbound webhook rejection reasons.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum WebhookError {
    #[error("missing X-Webhook-Signature header")]
    MissingSignature,
    #[error("missing or malformed X-Webhook-Timestamp header")]
    MissingTimestamp,
    #[error("webhook signature mismatch")]
    InvalidSignature,
    #[error("webhook older than {max_age_secs}s")]
    Expired { max_age_secs: u64 },
    #[error("no webhook secret registered for buyer {0}")]
    UnknownBuyer(String),
}

/// Application-specific error types surfaced over HTTP.
#[derive(Debug, Clone, Error)]
pub enum AppError {
    /// Resource not found error.
    #[error("Not found: {0}")]
    NotFound(String),
    /// Bad request error (invalid input).
    #[error("Bad request: {0}")]
    BadRequest(String),
    /// Request rejected by the template engine, with per-field detail.
    #[error("Unprocessable: {0}")]
    Template(#[from] TemplateEngineError),
    /// Unauthorized access error.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),
    /// Internal server error.
    #[error("Internal error: {0}")]
    InternalError(String),
    /// Error with context chain for better debugging.
    #[error("{context}: {source}")]
    WithContext {
        /// The underlying source of the error.
        source: Box<AppError>,
        /// Additional context message.
        context: String,
    },
}

impl IntoResponse for AppError {
    /// Maps each error variant to an appropriate HTTP status code and JSON body.
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, json!({ "error": msg })),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, json!({ "error": msg })),
            AppError::Template(err) => {
                let errors = match err {
                    TemplateEngineError::Mappings(failures) => json!(failures),
                    TemplateEngineError::Validation(e) => json!([e]),
                    other => json!([other.to_string()]),
                };
                (
                    StatusCode::UNPROCESSABLE_ENTITY,
                    json!({ "error": err.to_string(), "errors": errors }),
                )
            }
            AppError::Unauthorized(msg) => {
                tracing::warn!("Unauthorized access: {}", msg);
                (StatusCode::UNAUTHORIZED, json!({ "error": "Unauthorized" }))
            }
            AppError::InternalError(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": "Internal server error" }),
                )
            }
            AppError::WithContext { source, context } => {
                tracing::error!("Error with context: {} -> {}", context, source);
                return source.as_ref().clone().into_response();
            }
        };

        (status, Json(body)).into_response()
    }
}

impl From<WebhookError> for AppError {
    fn from(err: WebhookError) -> Self {
        AppError::Unauthorized(err.to_string())
    }
}

/// Extension trait for adding context to errors.
/// Similar to `anyhow::Context` but for our `AppError` type.
pub trait ResultExt<T> {
    /// Add context to an error.
    fn context(self, context: impl Into<String>) -> Result<T, AppError>;
}

impl<T, E: Into<AppError>> ResultExt<T> for Result<T, E> {
    fn context(self, context: impl Into<String>) -> Result<T, AppError> {
        self.map_err(|e| AppError::WithContext {
            source: Box::new(e.into()),
            context: context.into(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mapping_errors_listed_together() {
        let err = TemplateEngineError::Mappings(vec![
            MappingFailure::Validation {
                source_field: "email".to_string(),
                target_field: "email_address".to_string(),
                error: ValidationError::new("email_address", "required field is missing"),
            },
            MappingFailure::Transformation {
                source_field: "phone".to_string(),
                target_field: "phone_number".to_string(),
                error: TransformationError::UnknownTransform {
                    name: "phone.bogus".to_string(),
                },
            },
        ]);

        let message = err.to_string();
        assert!(message.starts_with("2 mapping(s) failed"));
        assert!(message.contains("email_address"));
        assert!(message.contains("phone.bogus"));
        assert_eq!(err.validation_errors().len(), 1);
    }

    #[test]
    fn test_context_wraps_source() {
        let result: Result<(), AppError> = Err(AppError::NotFound("buyer".to_string()));
        let wrapped = result.context("loading buyer").unwrap_err();
        assert_eq!(wrapped.to_string(), "loading buyer: Not found: buyer");
    }
}
