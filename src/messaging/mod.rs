//! # Messaging
//!
//! Application-facing message shapes and the outcome signals handlers send back to the
//! bus once processing finishes.

pub mod message;
pub mod outcome;

pub use message::{ApplicationMessage, OutboundMessage};
pub use outcome::{OutcomeSender, OutcomeSignal};
