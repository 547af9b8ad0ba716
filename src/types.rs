use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::order_key::{OfferScope, OrderKey};

/// Marketplaces a task can bid on. The declaration order is the order offers
/// are grouped in when a report is not TTL-sorted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Marketplace {
    OpenSea,
    Blur,
    MagicEden,
}

impl Marketplace {
    pub const ALL: [Marketplace; 3] = [Marketplace::OpenSea, Marketplace::Blur, Marketplace::MagicEden];

    pub fn as_str(self) -> &'static str {
        match self {
            Marketplace::OpenSea => "opensea",
            Marketplace::Blur => "blur",
            Marketplace::MagicEden => "magiceden",
        }
    }
}

impl fmt::Display for Marketplace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Marketplace {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "opensea" => Ok(Marketplace::OpenSea),
            "blur" => Ok(Marketplace::Blur),
            "magiceden" => Ok(Marketplace::MagicEden),
            other => Err(format!("unknown marketplace {other:?}")),
        }
    }
}

/// What a task bids on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BidType {
    Token,
    Collection,
    Trait,
}

/// Task document as served by the task-configuration store. Read-only here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskConfig {
    #[serde(alias = "_id")]
    pub task_id: String,
    pub bid_type: BidType,
    #[serde(default)]
    pub selected_marketplaces: Vec<Marketplace>,
}

/// Record written by the bid-placing worker under an order key, with a TTL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderRecord {
    /// Opaque reference for the worker (order hash, submission payload, ...).
    pub payload: serde_json::Value,
    /// Offer price in wei.
    #[serde(with = "wei")]
    pub offer_price: u128,
}

/// One live bid as shown on the dashboard.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NormalizedOffer {
    pub order_key: OrderKey,
    pub marketplace: Marketplace,
    pub scope: OfferScope,
    pub remaining_ttl_secs: u64,
    pub expires_at: DateTime<Utc>,
    pub payload: serde_json::Value,
    #[serde(with = "wei")]
    pub offer_price: u128,
    pub offer_price_eth: Option<Decimal>,
}

/// Result of one reconciliation pass for a task.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressReport {
    pub task_id: String,
    pub bid_type: BidType,
    pub generated_at: DateTime<Utc>,
    pub offers: Vec<NormalizedOffer>,
    /// Candidate keys or records that could not be decoded.
    pub decode_errors: usize,
    /// Candidates whose record was missing or already expired.
    pub discarded: usize,
    /// Candidates whose record could not be read (node unreachable).
    pub unreadable: usize,
    /// Marketplaces that did not answer before the deadline.
    pub timed_out: Vec<Marketplace>,
    /// Marketplaces whose reads failed outright.
    pub failed: Vec<Marketplace>,
}

impl ProgressReport {
    pub fn is_partial(&self) -> bool {
        !self.timed_out.is_empty() || !self.failed.is_empty() || self.unreadable > 0
    }

    pub fn offers_for(&self, marketplace: Marketplace) -> impl Iterator<Item = &NormalizedOffer> {
        self.offers.iter().filter(move |o| o.marketplace == marketplace)
    }
}

/// Convert an integer wei amount to ETH. `None` if it does not fit a `Decimal`.
pub fn wei_to_eth(wei: u128) -> Option<Decimal> {
    let wei = i128::try_from(wei).ok()?;
    Decimal::try_from_i128_with_scale(wei, 18)
        .ok()
        .map(|d| d.normalize())
}

/// Wei amounts travel as decimal strings; plain JSON integers are accepted on read.
mod wei {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &u128, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u128, D::Error> {
        match serde_json::Value::deserialize(deserializer)? {
            serde_json::Value::String(s) => s
                .parse::<u128>()
                .map_err(|e| D::Error::custom(format!("invalid wei amount {s:?}: {e}"))),
            serde_json::Value::Number(n) => n
                .as_u64()
                .map(u128::from)
                .ok_or_else(|| D::Error::custom(format!("invalid wei amount {n}"))),
            other => Err(D::Error::custom(format!("invalid wei amount {other}"))),
        }
    }
}
