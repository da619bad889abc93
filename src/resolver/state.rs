use serde::{Deserialize, Serialize};
use std::fmt;

/// Where a tracked delivery ended up once its outcome was resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryState {
    /// Acknowledged: processed, discarded or dropped after exhausting retries
    Acked,
    /// Rejected into the retry queue for delayed redelivery
    Requeued,
}

impl fmt::Display for DeliveryState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Acked => write!(f, "acked"),
            Self::Requeued => write!(f, "requeued"),
        }
    }
}

impl std::str::FromStr for DeliveryState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "acked" => Ok(Self::Acked),
            "requeued" => Ok(Self::Requeued),
            _ => Err(format!("Invalid delivery state: {s}")),
        }
    }
}
