//! The channel that ships per-agent sub-requests out to bidding agents.
//!
//! Delivery is fire-and-forget with at-most-once semantics; the engine never
//! retries. Responses come back as ordinary shard messages, so this seam only
//! covers the outbound half.

use chrono::{DateTime, Utc};
use model::{
    ids::{AgentId, AuctionId, CreativeId},
    request::BidRequest,
};
use std::sync::Arc;
use tokio::sync::mpsc;

/// One spot offered to an agent together with the creatives that survived
/// filtering.
#[derive(Clone, Debug, PartialEq)]
pub struct SpotOffer {
    pub spot_id: String,
    pub creatives: Vec<CreativeId>,
}

/// The dispatch payload for one agent.
#[derive(Clone, Debug)]
pub struct AgentRequest {
    pub auction: AuctionId,
    pub agent: AgentId,
    pub spots: Vec<SpotOffer>,
    pub deadline: DateTime<Utc>,
    /// Shared snapshot of the originating request.
    pub request: Arc<BidRequest>,
}

pub trait BidderInterface: Send + Sync {
    /// Fire-and-forget send. Failures are invisible by design; an agent that
    /// never answers simply times out.
    fn send(&self, request: AgentRequest);
}

/// In-process transport delivering dispatches onto a channel, used by the
/// test harnesses and single-process wiring.
pub struct ChannelBidder {
    outbound: mpsc::UnboundedSender<AgentRequest>,
}

impl ChannelBidder {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<AgentRequest>) {
        let (outbound, rx) = mpsc::unbounded_channel();
        (Self { outbound }, rx)
    }
}

impl BidderInterface for ChannelBidder {
    fn send(&self, request: AgentRequest) {
        // A closed receiver models a dead agent process; at-most-once
        // delivery means there is nothing to do about it here.
        let _ = self.outbound.send(request);
    }
}
