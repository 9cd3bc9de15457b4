//! Bids and bid responses flowing back from agents.

use crate::{
    ids::{AccountId, AgentId, AuctionId, CreativeId},
    money::Amount,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One bid for one ad spot.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Bid {
    pub spot_id: String,
    pub creative: CreativeId,
    /// The most the agent is willing to pay; the clearing price is derived
    /// from the runner up under second price rules.
    pub max_price: Amount,
    pub account: AccountId,
    pub timestamp: DateTime<Utc>,
}

/// An agent's reply to a dispatched sub-request.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BidResponse {
    pub auction: AuctionId,
    pub agent: AgentId,
    /// Empty means an explicit no-bid.
    pub bids: Vec<Bid>,
}

impl BidResponse {
    pub fn no_bid(auction: AuctionId, agent: AgentId) -> Self {
        Self {
            auction,
            agent,
            bids: Vec::new(),
        }
    }

    pub fn is_no_bid(&self) -> bool {
        self.bids.is_empty()
    }
}
