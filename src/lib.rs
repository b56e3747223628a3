//! Real-time PING/POST lead auction library.
//!
//! A lead is pinged to every eligible buyer concurrently, the bids are ranked,
//! and the lead is POSTed down the ranking until one buyer takes it. Leads
//! that nobody accepts are handed to a deferred retry worker.
//!
//! # Modules
//!
//! - `auction`: Auction engine (PING fan-out, ranking, POST cascade).
//! - `buyer_client`: Outbound buyer transport over reqwest.
//! - `circuit_breaker`: Per-buyer circuit breaker construction.
//! - `config`: Configuration management.
//! - `delivery`: The shared POST delivery path.
//! - `errors`: Error handling types.
//! - `handlers`: HTTP request handlers and application state.
//! - `models`: Core data models.
//! - `monitor`: Performance metrics and alerting.
//! - `pricing`: Bid floor, ceiling and fallback pricing.
//! - `registry`: Buyer catalogue and eligibility.
//! - `response_parser`: Buyer response normalization.
//! - `retry`: Retry backlog, backoff and dead letters.
//! - `template_engine`: Lead to buyer payload transformation.
//! - `transaction_log`: Attempt log for billing and analytics.
//! - `transformations`: Named transform functions.
//! - `validator`: Lead, template and payload validation.
//! - `webhook`: Inbound webhook verification and processing.

pub mod auction;
pub mod buyer_client;
pub mod circuit_breaker;
pub mod config;
pub mod delivery;
pub mod errors;
pub mod handlers;
pub mod models;
pub mod monitor;
pub mod pricing;
pub mod registry;
pub mod response_parser;
pub mod retry;
pub mod template_engine;
pub mod transaction_log;
pub mod transformations;
pub mod validator;
pub mod webhook;
