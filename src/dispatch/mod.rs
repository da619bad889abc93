//! # Inbound Dispatch
//!
//! Consumption side of the bus: the handler registry, the in-flight table and the
//! dispatcher that ties them to the primary queue.

pub mod dispatcher;
pub mod in_flight;
pub mod registry;

pub use dispatcher::{DispatchOutcome, DispatchStatsSnapshot, InboundDispatcher};
pub use in_flight::{InFlightDelivery, InFlightTable};
pub use registry::{HandlerRegistry, MessageHandler};
