//! Per-message delivery status.
//!
//! `sent` is set by the store on write, `delivered` right after the write is
//! acknowledged and `read` by the receiving client when it views the message.
//! Status only ever moves forward; `read` is terminal.

use serde::{Deserialize, Serialize};

#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    #[default]
    Sent,
    Delivered,
    Read,
}

/// Outcome of asking a message to move to a new status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Advanced {
        from: DeliveryStatus,
        to: DeliveryStatus,
    },
    /// Backward or same-state request; the message keeps `current`.
    Ignored {
        current: DeliveryStatus,
        requested: DeliveryStatus,
    },
}

impl Transition {
    pub fn is_advanced(&self) -> bool {
        matches!(self, Transition::Advanced { .. })
    }

    /// Status the message holds after the transition.
    pub fn status(&self) -> DeliveryStatus {
        match self {
            Transition::Advanced { to, .. } => *to,
            Transition::Ignored { current, .. } => *current,
        }
    }
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Delivered => "delivered",
            DeliveryStatus::Read => "read",
        }
    }

    pub fn is_terminal(&self) -> bool {
        *self == DeliveryStatus::Read
    }

    pub fn can_advance_to(&self, next: DeliveryStatus) -> bool {
        next > *self
    }

    pub fn advance(self, requested: DeliveryStatus) -> Transition {
        if self.can_advance_to(requested) {
            Transition::Advanced {
                from: self,
                to: requested,
            }
        } else {
            Transition::Ignored {
                current: self,
                requested,
            }
        }
    }

    /// Checkmarks shown next to the sender's own messages.
    pub fn glyph(&self) -> &'static str {
        match self {
            DeliveryStatus::Sent => "✓",
            DeliveryStatus::Delivered | DeliveryStatus::Read => "✓✓",
        }
    }
}

impl std::fmt::Display for DeliveryStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DeliveryStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "sent" => Ok(DeliveryStatus::Sent),
            "delivered" => Ok(DeliveryStatus::Delivered),
            "read" => Ok(DeliveryStatus::Read),
            other => Err(format!("unknown delivery status: {}", other)),
        }
    }
}
