/// Response parser integration tests
/// Buyer vocabularies are resolved through the registry, as the server does it
use proptest::prelude::*;
use rust_lead_broker::models::BuyerConfig;
use rust_lead_broker::registry::BuyerRegistry;
use rust_lead_broker::response_parser::{
    interpret_ping, interpret_post, HttpStatusAction, PingStatus, PostStatus,
    ResponseMappingConfig, ResponseParser,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn parser_with(buyers: Vec<BuyerConfig>) -> ResponseParser {
    let registry = Arc::new(BuyerRegistry::from_buyers(buyers));
    ResponseParser::new(registry, Duration::from_secs(60))
}

fn custom_buyer() -> BuyerConfig {
    serde_json::from_value(json!({
        "id": "quirky",
        "name": "Quirky Leads",
        "responseMapping": {
            "pingStatusField": "result.decision",
            "acceptedValues": ["take it"],
            "bidAmountFields": ["result.offer"],
            "httpStatusCodes": { "422": "invalid" }
        }
    }))
    .unwrap()
}

#[tokio::test]
async fn test_bid_amount_without_status_is_accepted() {
    let parser = parser_with(vec![]);
    let result = parser
        .parse_ping("anyone", 200, r#"{"bidAmount":45}"#)
        .await;
    assert_eq!(result.status, PingStatus::Accepted);
    assert_eq!(result.bid_amount, Some(45.0));
    assert!(!result.should_retry);
}

#[tokio::test]
async fn test_status_words_are_case_and_space_insensitive() {
    let parser = parser_with(vec![]);
    for body in [
        r#"{"status":"ACCEPTED","bid":"12.50"}"#,
        r#"{"status":"  Accepted ","bid":12.5}"#,
    ] {
        let result = parser.parse_ping("anyone", 200, body).await;
        assert_eq!(result.status, PingStatus::Accepted, "body: {}", body);
        assert_eq!(result.bid_amount, Some(12.5));
    }

    let result = parser
        .parse_ping("anyone", 200, r#"{"status":"Not Interested"}"#)
        .await;
    assert_eq!(result.status, PingStatus::Rejected);
}

#[tokio::test]
async fn test_unknown_status_is_rejected_and_discards_bid() {
    let parser = parser_with(vec![]);
    let result = parser
        .parse_ping("anyone", 200, r#"{"status":"maybe later","bidAmount":30}"#)
        .await;
    assert_eq!(result.status, PingStatus::Rejected);
    assert_eq!(result.bid_amount, None);
    assert_eq!(result.raw_status.as_deref(), Some("maybe later"));
}

#[tokio::test]
async fn test_not_interested_indicator_rejects() {
    let parser = parser_with(vec![]);
    let result = parser
        .parse_ping("anyone", 200, r#"{"interested":false}"#)
        .await;
    assert_eq!(result.status, PingStatus::Rejected);
}

#[tokio::test]
async fn test_retryable_http_codes_skip_the_body() {
    let parser = parser_with(vec![]);
    for code in [429u16, 502, 503, 504] {
        let ping = parser
            .parse_ping("anyone", code, r#"{"status":"accepted","bid":99}"#)
            .await;
        assert_eq!(ping.status, PingStatus::Error);
        assert!(ping.should_retry);
        assert_eq!(ping.bid_amount, None);

        let post = parser
            .parse_post("anyone", code, r#"{"status":"delivered"}"#)
            .await;
        assert_eq!(post.status, PostStatus::Failed);
        assert!(post.should_retry);
    }

    let server_error = parser.parse_post("anyone", 500, "oops").await;
    assert_eq!(server_error.status, PostStatus::Failed);
    assert!(!server_error.should_retry);
}

#[tokio::test]
async fn test_conflict_means_duplicate() {
    let parser = parser_with(vec![]);
    let post = parser
        .parse_post("anyone", 409, r#"{"message":"lead already sold"}"#)
        .await;
    assert_eq!(post.status, PostStatus::Duplicate);
    assert_eq!(post.reason.as_deref(), Some("lead already sold"));
    assert_eq!(post.raw_status.as_deref(), Some("409"));
}

#[tokio::test]
async fn test_post_outcomes_and_buyer_lead_id() {
    let parser = parser_with(vec![]);

    let delivered = parser
        .parse_post("anyone", 200, r#"{"status":"sold","leadId":"B-778"}"#)
        .await;
    assert_eq!(delivered.status, PostStatus::Delivered);
    assert_eq!(delivered.buyer_lead_id.as_deref(), Some("B-778"));

    let dupe = parser
        .parse_post("anyone", 200, r#"{"status":"Duplicate Lead"}"#)
        .await;
    assert_eq!(dupe.status, PostStatus::Duplicate);

    let invalid = parser
        .parse_post("anyone", 200, r#"{"status":"invalid_phone"}"#)
        .await;
    assert_eq!(invalid.status, PostStatus::Invalid);

    let unknown = parser
        .parse_post("anyone", 200, r#"{"status":"pending review"}"#)
        .await;
    assert_eq!(unknown.status, PostStatus::Failed);

    let bare_ok = parser.parse_post("anyone", 201, "").await;
    assert_eq!(bare_ok.status, PostStatus::Delivered);
}

#[tokio::test]
async fn test_custom_vocabulary_from_registry() {
    let parser = parser_with(vec![custom_buyer()]);

    let ping = parser
        .parse_ping(
            "quirky",
            200,
            r#"{"result":{"decision":"Take It","offer":"61.25"}}"#,
        )
        .await;
    assert_eq!(ping.status, PingStatus::Accepted);
    assert_eq!(ping.bid_amount, Some(61.25));

    // Rejected vocabulary was not customised so the defaults still apply.
    let declined = parser
        .parse_ping("quirky", 200, r#"{"result":{"decision":"declined"}}"#)
        .await;
    assert_eq!(declined.status, PingStatus::Rejected);

    let post = parser.parse_post("quirky", 422, "{}").await;
    assert_eq!(post.status, PostStatus::Invalid);
}

#[test]
fn test_http_action_defaults() {
    let config = ResponseMappingConfig::default();
    assert_eq!(config.http_action(200), HttpStatusAction::Success);
    assert_eq!(config.http_action(204), HttpStatusAction::Success);
    assert_eq!(config.http_action(404), HttpStatusAction::Reject);
    assert_eq!(config.http_action(409), HttpStatusAction::Duplicate);
    assert_eq!(config.http_action(500), HttpStatusAction::Error);
    assert_eq!(config.http_action(503), HttpStatusAction::Retry);
}

proptest! {
    #[test]
    fn parsing_never_panics(code in 100u16..600, body in "\\PC*") {
        let config = ResponseMappingConfig::default();
        let _ = interpret_ping(&config, code, &body);
        let _ = interpret_post(&config, code, &body);
    }
}
