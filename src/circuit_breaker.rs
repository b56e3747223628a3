use failsafe::{backoff, failure_policy, Config, StateMachine};
use std::time::Duration;

/// Circuit breaker type used for every buyer endpoint.
pub type BuyerCircuitBreaker =
    StateMachine<failure_policy::ConsecutiveFailures<backoff::Exponential>, ()>;

/// Upper bound on the open period, as a multiple of the initial reset time.
const MAX_BACKOFF_FACTOR: u32 = 6;

/// Creates the circuit breaker guarding calls to one buyer.
///
/// # Configuration
///
/// - **Failure threshold**: `failure_threshold` consecutive failures trigger OPEN state.
/// - **Backoff**: Exponential from `reset_secs` up to six times that before a trial call.
///
/// # States
///
/// - **CLOSED**: Normal operation, PINGs and POSTs pass through.
/// - **OPEN**: Buyer is failing, calls fail fast with `TransportError::CircuitOpen`.
/// - **HALF_OPEN**: One trial call decides whether the buyer recovered.
///
/// # Example
///
/// ```rust
/// use rust_lead_broker::circuit_breaker::create_buyer_circuit_breaker;
/// use failsafe::CircuitBreaker;
///
/// let cb = create_buyer_circuit_breaker(5, 30);
/// assert!(cb.is_call_permitted());
/// ```
pub fn create_buyer_circuit_breaker(
    failure_threshold: u32,
    reset_secs: u64,
) -> BuyerCircuitBreaker {
    let initial = Duration::from_secs(reset_secs.max(1));
    let backoff_strategy = backoff::exponential(initial, initial * MAX_BACKOFF_FACTOR);

    let failure_policy =
        failure_policy::consecutive_failures(failure_threshold.max(1), backoff_strategy);

    Config::new().failure_policy(failure_policy).build()
}
