use std::fmt::{Display, Formatter, Result};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Terminal outcome recorded in the idempotency ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerStatus {
    Delivered,
    DeadLettered,
}

impl LedgerStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerStatus::Delivered => "sent",
            LedgerStatus::DeadLettered => "dead_lettered",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "sent" => Some(LedgerStatus::Delivered),
            "dead_lettered" => Some(LedgerStatus::DeadLettered),
            _ => None,
        }
    }
}

impl Display for LedgerStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        write!(f, "{}", self.as_str())
    }
}

/// Identifies one processing lease. Only the holder of the token can
/// release the lease.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClaimToken(String);

impl ClaimToken {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().simple().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ClaimToken {
    fn from(token: String) -> Self {
        Self(token)
    }
}

/// Answer to an atomic insert-if-absent on a message id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// This worker now holds the processing lease.
    Claimed(ClaimToken),
    /// The message already reached a terminal outcome.
    Settled(LedgerStatus),
    /// Another worker holds a live lease.
    InFlight,
}

/// How the dispatcher disposed of one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    Delivered,
    Duplicate(LedgerStatus),
    Requeued {
        retry_count: u32,
        delay: Duration,
    },
    /// Another worker holds the lease; the message was parked for `delay`
    /// without spending a retry.
    Deferred {
        delay: Duration,
    },
    /// Republish failed; the original delivery went back to the broker.
    Returned,
    DeadLettered {
        reason: String,
    },
    Discarded {
        reason: String,
    },
}

impl Display for Disposition {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result {
        match self {
            Disposition::Delivered => write!(f, "delivered"),
            Disposition::Duplicate(_) => write!(f, "duplicate"),
            Disposition::Requeued { .. } => write!(f, "requeued"),
            Disposition::Deferred { .. } => write!(f, "deferred"),
            Disposition::Returned => write!(f, "returned"),
            Disposition::DeadLettered { .. } => write!(f, "dead_lettered"),
            Disposition::Discarded { .. } => write!(f, "discarded"),
        }
    }
}
