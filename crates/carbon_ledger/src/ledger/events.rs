//! Credit-affecting events: plantation verifications, certificate tokenisations
//! and consumption pings.

use crate::amount::Amount;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use time::OffsetDateTime;

pub type EventId = i64;

/// Trust tier of a plantation verification. Ordered `Low < Medium < High < Verified`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum SuretyLevel {
    Low,
    Medium,
    High,
    Verified,
}

impl SuretyLevel {
    /// Tier for an accepted claim's confidence.
    pub fn from_confidence(confidence: f64) -> Self {
        if confidence >= 0.95 {
            Self::Verified
        } else if confidence >= 0.90 {
            Self::High
        } else if confidence >= 0.80 {
            Self::Medium
        } else {
            Self::Low
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventKind {
    Plantation {
        location: String,
        estimated_saplings: Option<u64>,
        size_in_acres: Option<Amount>,
        monetary_amount: Option<Amount>,
        awarded: Amount,
        confidence: f64,
        surety: SuretyLevel,
        raw_text: String,
        /// SHA-256 of `raw_text`, hex.
        text_sha256: String,
    },
    Tokenisation {
        carbon_credits: Amount,
        tokens_issued: Amount,
        source: String,
        confidence: f64,
    },
    Consumption {
        credits_used: Amount,
    },
}

impl EventKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Plantation { .. } => "plantation",
            Self::Tokenisation { .. } => "tokenisation",
            Self::Consumption { .. } => "consumption",
        }
    }

    /// Magnitude of the balance effect once the event is settled.
    pub fn amount(&self) -> Amount {
        match self {
            Self::Plantation { awarded, .. } => *awarded,
            Self::Tokenisation { tokens_issued, .. } => *tokens_issued,
            Self::Consumption { credits_used } => *credits_used,
        }
    }
}

/// Lifecycle of an event row. Only tokenisations ever sit in `Pending`
/// (awaiting the external transfer) or end in `Failed`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Pending,
    Settled,
    Failed,
}

impl EventStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Settled => "settled",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for EventStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "settled" => Ok(Self::Settled),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown event status: {}", other)),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LedgerEvent {
    pub id: EventId,
    pub user_id: i64,
    pub kind: EventKind,
    pub status: EventStatus,
    /// Transfer reference for tokenisations mirrored to a wallet.
    pub external_ref: Option<String>,
    /// Per-user position at which the balance effect was applied. Set on
    /// append for settled events, on settlement for tokenisations; None
    /// while pending or once failed.
    pub applied_seq: Option<i64>,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

impl LedgerEvent {
    pub fn is_settled(&self) -> bool {
        self.status == EventStatus::Settled
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn surety_tiers_are_ordered() {
        assert!(SuretyLevel::Low < SuretyLevel::Medium);
        assert!(SuretyLevel::High < SuretyLevel::Verified);
        assert_eq!(SuretyLevel::from_confidence(0.76), SuretyLevel::Low);
        assert_eq!(SuretyLevel::from_confidence(0.8), SuretyLevel::Medium);
        assert_eq!(SuretyLevel::from_confidence(0.93), SuretyLevel::High);
        assert_eq!(SuretyLevel::from_confidence(0.99), SuretyLevel::Verified);
    }

    #[test]
    fn event_kind_is_tagged() {
        let kind = EventKind::Consumption {
            credits_used: Amount::from_whole(3).unwrap(),
        };
        let json = serde_json::to_value(&kind).unwrap();
        assert_eq!(json["kind"], "consumption");
        assert_eq!(json["credits_used"], "3");
        let back: EventKind = serde_json::from_value(json).unwrap();
        assert_eq!(back, kind);
    }

    #[test]
    fn status_parses() {
        assert_eq!("settled".parse::<EventStatus>().unwrap(), EventStatus::Settled);
        assert!("open".parse::<EventStatus>().is_err());
    }
}
