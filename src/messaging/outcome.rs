//! # Outcome Signals
//!
//! Handlers report how processing of a delivery ended by sending an [`OutcomeSignal`]
//! through the [`OutcomeSender`] they were given. Each bus owns its own channel; signals
//! may arrive in any order relative to the deliveries they resolve.

use tokio::sync::mpsc;

use crate::error::{BusError, BusResult};
use crate::messaging::OutboundMessage;

#[derive(Debug, Clone, PartialEq)]
pub enum OutcomeSignal {
    /// Processing succeeded: acknowledge, then publish any follow-up messages
    Success {
        delivery_id: String,
        resulting_messages: Vec<OutboundMessage>,
    },
    /// Processing failed: schedule a delayed retry, or drop once the limit is reached
    Error {
        delivery_id: String,
        max_retries: Option<u32>,
    },
    /// Publish messages not tied to any delivery
    BroadcastSuccess {
        resulting_messages: Vec<OutboundMessage>,
    },
}

impl OutcomeSignal {
    pub fn delivery_id(&self) -> Option<&str> {
        match self {
            Self::Success { delivery_id, .. } | Self::Error { delivery_id, .. } => {
                Some(delivery_id)
            }
            Self::BroadcastSuccess { .. } => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Success { .. } => "success",
            Self::Error { .. } => "error",
            Self::BroadcastSuccess { .. } => "broadcast_success",
        }
    }
}

/// Sending half of a bus's outcome channel
#[derive(Debug, Clone)]
pub struct OutcomeSender {
    tx: mpsc::UnboundedSender<OutcomeSignal>,
}

impl OutcomeSender {
    pub fn new(tx: mpsc::UnboundedSender<OutcomeSignal>) -> Self {
        Self { tx }
    }

    /// Create a sender together with its receiving end
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<OutcomeSignal>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    pub fn send(&self, signal: OutcomeSignal) -> BusResult<()> {
        self.tx
            .send(signal)
            .map_err(|_| BusError::channel("outcome channel closed; bus is disconnected"))
    }

    pub fn success(
        &self,
        delivery_id: impl Into<String>,
        resulting_messages: Vec<OutboundMessage>,
    ) -> BusResult<()> {
        self.send(OutcomeSignal::Success {
            delivery_id: delivery_id.into(),
            resulting_messages,
        })
    }

    pub fn error(&self, delivery_id: impl Into<String>, max_retries: Option<u32>) -> BusResult<()> {
        self.send(OutcomeSignal::Error {
            delivery_id: delivery_id.into(),
            max_retries,
        })
    }

    pub fn broadcast_success(&self, resulting_messages: Vec<OutboundMessage>) -> BusResult<()> {
        self.send(OutcomeSignal::BroadcastSuccess { resulting_messages })
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
