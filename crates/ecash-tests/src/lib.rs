//! Integration tests for the e-cash wallet.
//!
//! Lifecycle tests run a real wallet (in-memory store, thread crypto
//! workers) against [`helpers::MockExchange`], a scripted exchange that
//! signs with real denomination keys and can inject failures per endpoint.

pub mod helpers;
