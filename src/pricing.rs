//! Bid clamping and fallback pricing for accepted PINGs.

use serde_json::Value;

use crate::models::{ConditionOperator, PriceAdjustment, PriceModifier, PricingConfig};
use crate::transformations::{lookup_path, value_as_f64, value_to_string};

/// Final price of an accepted PING.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BidPrice {
    /// Usable bid amount, already capped at `maxBid`.
    Amount(f64),
    /// The buyer's bid sits under `minBid`; treated as a non-bid.
    BelowFloor(f64),
    /// No amount in the response and no positive base price configured.
    Unpriced,
}

/// Prices an accepted bid. A missing amount falls back to the base price plus
/// matching modifiers; either way `[minBid, maxBid]` is then enforced.
pub fn price_bid(amount: Option<f64>, pricing: &PricingConfig, source: &Value) -> BidPrice {
    let raw = match amount {
        Some(amount) => amount,
        None => {
            let fallback = fallback_price(pricing, source);
            if fallback <= 0.0 {
                return BidPrice::Unpriced;
            }
            fallback
        }
    };

    if let Some(min) = pricing.min_bid {
        if raw < min {
            return BidPrice::BelowFloor(raw);
        }
    }
    let capped = match pricing.max_bid {
        Some(max) if raw > max => max,
        _ => raw,
    };
    BidPrice::Amount(round_cents(capped))
}

/// Base price with every matching modifier applied in declaration order.
pub fn fallback_price(pricing: &PricingConfig, source: &Value) -> f64 {
    pricing
        .modifiers
        .iter()
        .filter(|m| modifier_matches(m, source))
        .fold(pricing.base_price, |price, m| match m.adjustment {
            PriceAdjustment::Add(amount) => price + amount,
            PriceAdjustment::Multiply(factor) => price * factor,
        })
}

fn modifier_matches(modifier: &PriceModifier, source: &Value) -> bool {
    let actual = lookup_path(source, &modifier.field).filter(|v| !v.is_null());
    match modifier.operator {
        ConditionOperator::Exists => actual.is_some(),
        ConditionOperator::Equals => actual.is_some_and(|a| loosely_equal(a, &modifier.value)),
        ConditionOperator::NotEquals => !actual.is_some_and(|a| loosely_equal(a, &modifier.value)),
        ConditionOperator::In => match &modifier.value {
            Value::Array(options) => {
                actual.is_some_and(|a| options.iter().any(|o| loosely_equal(a, o)))
            }
            _ => false,
        },
        ConditionOperator::GreaterThan => compare(actual, &modifier.value, |a, b| a > b),
        ConditionOperator::LessThan => compare(actual, &modifier.value, |a, b| a < b),
    }
}

fn loosely_equal(actual: &Value, expected: &Value) -> bool {
    actual == expected
        || value_to_string(actual).trim().eq_ignore_ascii_case(value_to_string(expected).trim())
}

fn compare(actual: Option<&Value>, expected: &Value, op: fn(f64, f64) -> bool) -> bool {
    match (actual.and_then(value_as_f64), value_as_f64(expected)) {
        (Some(a), Some(b)) => op(a, b),
        _ => false,
    }
}

fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
