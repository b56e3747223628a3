/// Property-based tests using proptest
/// Tests invariants and properties that should hold for all inputs
use proptest::prelude::*;
use rust_lead_broker::auction::rank_bids;
use rust_lead_broker::models::{BackoffStrategy, BidResponse, RetryPolicy};
use rust_lead_broker::response_parser::{
    extract_bid_amount, interpret_ping, normalize_status, PingStatus, ResponseMappingConfig,
};
use rust_lead_broker::retry::compute_delay;
use rust_lead_broker::validator::sanitize_str;
use serde_json::json;

fn bid(id: usize, amount: Option<f64>, priority: u32, ms: u64) -> BidResponse {
    BidResponse {
        buyer_id: format!("buyer-{}", id),
        buyer_name: format!("Buyer {}", id),
        success: amount.is_some(),
        bid_amount: amount,
        response_time_ms: ms,
        priority,
        raw_status: None,
        error: None,
        timed_out: false,
    }
}

// Property: status normalization is stable and insensitive to case and padding
proptest! {
    #[test]
    fn normalization_is_idempotent(raw in "[a-zA-Z0-9 _\\-]{0,30}") {
        let once = normalize_status(&raw);
        prop_assert_eq!(normalize_status(&once), once);
    }

    #[test]
    fn normalization_ignores_case_and_padding(
        word in "[a-zA-Z]{1,12}",
        left in " {0,3}",
        right in " {0,3}"
    ) {
        let padded = format!("{}{}{}", left, word.to_uppercase(), right);
        prop_assert_eq!(normalize_status(&padded), word.to_lowercase());
    }
}

// Property: bid extraction is deterministic and only yields positive amounts
proptest! {
    #[test]
    fn bid_extraction_is_deterministic(amount in -1000.0f64..1000.0, as_string in proptest::bool::ANY) {
        let body = if as_string {
            json!({ "price": amount.to_string() })
        } else {
            json!({ "price": amount })
        };
        let fields = ResponseMappingConfig::default().bid_amount_fields;

        let first = extract_bid_amount(&body, &fields);
        let second = extract_bid_amount(&body, &fields);
        prop_assert_eq!(first, second);
        match first {
            Some(found) => {
                prop_assert!(found > 0.0);
                prop_assert!((found - amount).abs() < 1e-9);
            }
            None => prop_assert!(amount <= 0.0),
        }
    }

    #[test]
    fn first_candidate_path_wins(primary in 1.0f64..500.0, secondary in 1.0f64..500.0) {
        let body = json!({ "bidAmount": primary, "data": { "price": secondary } });
        let fields = ResponseMappingConfig::default().bid_amount_fields;
        prop_assert_eq!(extract_bid_amount(&body, &fields), Some(primary));
    }

    #[test]
    fn rejected_pings_never_carry_a_bid(amount in 0.01f64..500.0) {
        let config = ResponseMappingConfig::default();
        let body = json!({ "status": "no_bid", "bidAmount": amount }).to_string();
        let parsed = interpret_ping(&config, 200, &body);
        prop_assert_eq!(parsed.status, PingStatus::Rejected);
        prop_assert_eq!(parsed.bid_amount, None);
    }
}

// Property: the winner is always the highest accepted bid
proptest! {
    #[test]
    fn winner_has_the_highest_amount(
        bids in prop::collection::vec(
            (prop::option::of(1.0f64..200.0), 0u32..5, 1u64..2000),
            1..12
        )
    ) {
        let bids: Vec<BidResponse> = bids
            .into_iter()
            .enumerate()
            .map(|(i, (amount, priority, ms))| bid(i, amount, priority, ms))
            .collect();
        let ranked = rank_bids(&bids);

        let accepted = bids.iter().filter(|b| b.success).count();
        prop_assert_eq!(ranked.len(), accepted);

        if let Some(winner) = ranked.first() {
            let best = bids
                .iter()
                .filter_map(|b| b.bid_amount)
                .fold(f64::MIN, f64::max);
            prop_assert_eq!(winner.bid_amount, Some(best));
        }
        for pair in ranked.windows(2) {
            prop_assert!(pair[0].bid_amount >= pair[1].bid_amount);
        }
    }

    #[test]
    fn ranking_ignores_input_order(
        bids in prop::collection::vec((1.0f64..200.0, 0u32..5, 1u64..2000), 1..10)
    ) {
        let forward: Vec<BidResponse> = bids
            .iter()
            .enumerate()
            .map(|(i, (amount, priority, ms))| bid(i, Some(*amount), *priority, *ms))
            .collect();
        let mut backward = forward.clone();
        backward.reverse();

        prop_assert_eq!(rank_bids(&forward), rank_bids(&backward));
    }
}

// Property: retry delays never exceed the policy cap
proptest! {
    #[test]
    fn retry_delay_is_capped(
        base in 1u64..10_000,
        cap in 1u64..100_000,
        attempt in 1u32..100,
        strategy in prop::sample::select(vec![
            BackoffStrategy::Exponential,
            BackoffStrategy::Linear,
            BackoffStrategy::Fixed,
        ])
    ) {
        let policy = RetryPolicy {
            max_attempts: 5,
            backoff: strategy,
            base_delay_ms: base,
            max_delay_ms: cap,
        };
        let delay = compute_delay(&policy, attempt).as_millis() as u64;
        prop_assert!(delay <= cap);
        prop_assert!(delay >= base.min(cap));
    }
}

// Property: sanitization never panics and removes script tags
proptest! {
    #[test]
    fn sanitize_strips_script_blocks(text in "[a-zA-Z0-9 ]{0,40}") {
        let dirty = format!("{}<script>steal()</script>", text);
        let clean = sanitize_str(&dirty);
        prop_assert!(!clean.contains("<script"));
        prop_assert!(!clean.contains("steal()"));
    }
}
