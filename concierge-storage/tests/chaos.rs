//! Chaos Engineering Tests
//!
//! These tests validate data-layer resilience under failure conditions:
//! breaker thresholds and trial calls, retries over a flaky backend, query
//! and acquire timeouts, and pool behavior under saturation and shutdown.

#[path = "chaos/support.rs"]
mod support;

#[path = "chaos/circuit_breaker_tests.rs"]
mod circuit_breaker_tests;

#[path = "chaos/timeout_tests.rs"]
mod timeout_tests;

#[path = "chaos/pool_tests.rs"]
mod pool_tests;
