//! Post-auction event records.
//!
//! The router hands resolved auctions to the post-auction service as
//! [`Submission`]s; the adserver connector feeds [`DeliveryEvent`]s; the
//! matcher joins the two and emits [`MatchedEvent`]s downstream. Emission is
//! the durability boundary of the system.

use crate::{
    agent::ResultVerbosity,
    ids::{AccountId, AgentId, AuctionId, CreativeId},
    money::Amount,
    request::BidRequest,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A resolved auction as handed off by the router.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Submission {
    pub auction: AuctionId,
    pub spot_id: String,
    pub agent: AgentId,
    pub account: AccountId,
    pub creative: CreativeId,
    /// The price the router expects to pay; the win notification carries the
    /// authoritative one.
    pub clear_price: Amount,
    pub resolved_at: DateTime<Utc>,
    /// How long to wait for a win notification before inferring a loss.
    pub loss_timeout: DateTime<Utc>,
    /// Verbosity the winning agent asked for per outcome.
    pub win_format: ResultVerbosity,
    pub loss_format: ResultVerbosity,
    /// Request snapshot for full-verbosity result messages.
    pub request: Option<Box<BidRequest>>,
}

/// What the adserver reported.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryKind {
    Win,
    Impression,
    Click,
}

/// An event received on the adserver ingress, keyed by auction id.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeliveryEvent {
    pub auction: AuctionId,
    pub kind: DeliveryKind,
    pub timestamp: DateTime<Utc>,
    /// Only meaningful for wins; the exchange-confirmed price.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub win_price: Option<Amount>,
    /// Opaque tag some adservers use instead of the auction id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_tag: Option<String>,
}

/// Terminal classification of a joined auction outcome.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MatchedKind {
    /// Win notification joined with its auction.
    Win,
    /// Win that arrived after a loss had already been inferred.
    LateWin,
    /// No win notification before the loss timeout.
    Loss,
    Impression,
    Click,
    /// Win confirmed but no delivery event before the win timeout.
    NoDelivery,
}

/// A reconciled event emitted downstream.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MatchedEvent {
    pub auction: AuctionId,
    pub kind: MatchedKind,
    pub agent: AgentId,
    pub account: AccountId,
    pub creative: CreativeId,
    /// Authoritative price where one exists for the kind.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<Amount>,
    pub timestamp: DateTime<Utc>,
    /// Controls how much of the payload the receiving agent sees.
    pub verbosity: ResultVerbosity,
    /// Request snapshot, present only at full verbosity.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<Box<BidRequest>>,
}
