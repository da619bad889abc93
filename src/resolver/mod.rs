//! # Outcome Resolution
//!
//! Acknowledgment decisions for tracked deliveries, driven by outcome signals and the
//! broker's dead-letter history.

pub mod outcome_resolver;
pub mod retry;
pub mod state;

pub use outcome_resolver::{OutcomeResolver, Resolution};
pub use retry::{death_count, RetryDecision, RetryPolicy};
pub use state::DeliveryState;
