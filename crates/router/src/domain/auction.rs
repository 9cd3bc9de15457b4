//! Per in-flight auction state and second price resolution.
//!
//! An auction is created at ingress, mutated only by its shard's dispatcher,
//! and becomes terminal exactly once: either resolved with a winner or
//! expired. The winner is fixed at resolution time and never revised;
//! demotion on a failed budget commit happens while ranking candidates,
//! before the resolution is set.

use crate::domain::filter::BiddableSpots;
use chrono::{DateTime, Utc};
use model::{
    agent::AgentConfig,
    bid::Bid,
    ids::{AccountId, AgentId, CreativeId},
    money::Amount,
    request::BidRequest,
};
use rand::Rng;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    /// Created, nothing dispatched yet.
    Open,
    /// At least one agent was sent the request.
    Collecting,
    Resolved,
    Expired,
}

/// One agent the request was dispatched to.
pub struct Participant {
    pub config: Arc<AgentConfig>,
    pub spots: BiddableSpots,
    pub outcome: Outcome,
}

pub enum Outcome {
    Pending,
    /// The agent answered; an empty list is an explicit no-bid.
    Responded { bids: Vec<Bid>, arrival: u64 },
    TimedOut,
}

/// The final outcome of a resolved auction.
#[derive(Clone, Debug, PartialEq)]
pub struct Resolution {
    pub winner: AgentId,
    pub account: AccountId,
    pub creative: CreativeId,
    pub spot_id: String,
    pub clear_price: Amount,
    pub winner_max: Amount,
    pub runner_up: Option<Amount>,
}

/// A bid in ranking order, kept alongside everything needed to derive the
/// clearing price and hand off to post-auction.
#[derive(Clone, Debug)]
pub struct Candidate {
    pub agent: AgentId,
    pub account: AccountId,
    pub creative: CreativeId,
    pub spot_id: String,
    pub max_price: Amount,
    pub reserve: Amount,
    pub group: String,
    pub weight: u32,
    pub arrival: u64,
}

pub struct Auction {
    pub request: BidRequest,
    pub deadline: DateTime<Utc>,
    state: State,
    participants: HashMap<AgentId, Participant>,
    next_arrival: u64,
    resolution: Option<Resolution>,
}

#[derive(Debug, Error, PartialEq)]
pub enum BidError {
    #[error("agent was not dispatched this auction")]
    UnknownAgent,
    #[error("auction is already terminal")]
    Terminal,
    #[error("bid arrived after the deadline")]
    Late,
    #[error("agent already responded")]
    Duplicate,
}

#[derive(Debug, Error)]
#[error("auction deadline {deadline} is not in the future (now {now})")]
pub struct DeadlineInPast {
    pub deadline: DateTime<Utc>,
    pub now: DateTime<Utc>,
}

impl Auction {
    pub fn new(
        request: BidRequest,
        deadline: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Self, DeadlineInPast> {
        if deadline <= now {
            return Err(DeadlineInPast { deadline, now });
        }
        Ok(Self {
            request,
            deadline,
            state: State::Open,
            participants: HashMap::new(),
            next_arrival: 0,
            resolution: None,
        })
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.state, State::Resolved | State::Expired)
    }

    pub fn resolution(&self) -> Option<&Resolution> {
        self.resolution.as_ref()
    }

    pub fn participants(&self) -> impl Iterator<Item = (&AgentId, &Participant)> {
        self.participants.iter()
    }

    pub fn participant(&self, agent: &AgentId) -> Option<&Participant> {
        self.participants.get(agent)
    }

    pub fn add_participant(&mut self, agent: AgentId, config: Arc<AgentConfig>, spots: BiddableSpots) {
        debug_assert!(!self.is_terminal());
        self.participants.insert(
            agent,
            Participant {
                config,
                spots,
                outcome: Outcome::Pending,
            },
        );
        if self.state == State::Open {
            self.state = State::Collecting;
        }
    }

    /// Records an agent's response. Late and duplicate responses are rejected
    /// so the caller can count them; an empty bid list is an explicit no-bid.
    pub fn record_response(
        &mut self,
        agent: &AgentId,
        bids: Vec<Bid>,
        arrived: DateTime<Utc>,
    ) -> Result<(), BidError> {
        if self.is_terminal() {
            return Err(BidError::Terminal);
        }
        if arrived >= self.deadline {
            return Err(BidError::Late);
        }
        let participant = self
            .participants
            .get_mut(agent)
            .ok_or(BidError::UnknownAgent)?;
        if !matches!(participant.outcome, Outcome::Pending) {
            return Err(BidError::Duplicate);
        }
        let arrival = self.next_arrival;
        self.next_arrival += 1;
        participant.outcome = Outcome::Responded { bids, arrival };
        Ok(())
    }

    /// Every dispatched agent has either responded or timed out.
    pub fn all_responded(&self) -> bool {
        self.participants
            .values()
            .all(|p| !matches!(p.outcome, Outcome::Pending))
    }

    /// Marks agents that never answered as timed out and returns them.
    /// Called at the deadline before ranking.
    pub fn close(&mut self) -> Vec<AgentId> {
        let mut timed_out = Vec::new();
        for (agent, participant) in &mut self.participants {
            if matches!(participant.outcome, Outcome::Pending) {
                participant.outcome = Outcome::TimedOut;
                timed_out.push(agent.clone());
            }
        }
        timed_out
    }

    /// Ranks all valid bids best first. The head of the list is the winner
    /// unless the budget commit demotes it, in which case the next entry is
    /// promoted.
    ///
    /// Bids below their spot's reserve are excluded. Equal top prices are
    /// broken by weighted random choice when the tied agents share a round
    /// robin group, by arrival order otherwise.
    pub fn ranked_candidates(&self, rng: &mut impl Rng) -> Vec<Candidate> {
        let mut candidates: Vec<Candidate> = Vec::new();
        for (agent, participant) in &self.participants {
            let Outcome::Responded { bids, arrival } = &participant.outcome else {
                continue;
            };
            for bid in bids {
                let Some(spot) = self.request.spots.iter().find(|s| s.id == bid.spot_id) else {
                    continue;
                };
                match bid.max_price.cmp_same_currency(&spot.reserve_price) {
                    Some(std::cmp::Ordering::Less) | None => continue,
                    _ => {}
                }
                candidates.push(Candidate {
                    agent: agent.clone(),
                    account: bid.account.clone(),
                    creative: bid.creative,
                    spot_id: bid.spot_id.clone(),
                    max_price: bid.max_price,
                    reserve: spot.reserve_price,
                    group: participant.config.round_robin_group.clone(),
                    weight: participant.config.round_robin_weight.max(1),
                    arrival: *arrival,
                });
            }
        }

        candidates.sort_by(|a, b| {
            b.max_price
                .micros
                .cmp(&a.max_price.micros)
                .then(a.arrival.cmp(&b.arrival))
        });
        if candidates.is_empty() {
            return candidates;
        }

        // Weighted tie break within the top price cluster when it is a
        // single round robin group.
        let tied = candidates
            .iter()
            .take_while(|c| c.max_price == candidates[0].max_price)
            .count();
        if tied > 1 && candidates[..tied].iter().all(|c| c.group == candidates[0].group) {
            let total = candidates[..tied]
                .iter()
                .map(|c| c.weight as u64)
                .sum::<u64>()
                .max(1);
            let mut draw = rng.gen_range(0..total);
            let mut chosen = 0;
            for (index, candidate) in candidates[..tied].iter().enumerate() {
                let weight = candidate.weight as u64;
                if draw < weight {
                    chosen = index;
                    break;
                }
                draw -= weight;
            }
            candidates.swap(0, chosen);
        }

        candidates
    }

    /// Derives the price the winner pays: one increment over the runner up,
    /// floored at the spot reserve and capped at the winner's own max.
    pub fn clear_price(winner: &Candidate, runner_up: Option<&Candidate>) -> Amount {
        let increment = Amount::bid_increment(winner.max_price.currency);
        let base = match runner_up {
            Some(runner_up) => runner_up
                .max_price
                .checked_add(increment)
                .unwrap_or(runner_up.max_price),
            None => winner.reserve,
        };
        base.max_same_currency(winner.reserve)
            .min_same_currency(winner.max_price)
    }

    /// Fixes the resolution. The winner is monotonic: a second call is an
    /// invariant violation surfaced to the shard as fatal.
    pub fn set_resolution(&mut self, resolution: Resolution) -> Result<(), AlreadyTerminal> {
        if self.is_terminal() {
            return Err(AlreadyTerminal);
        }
        self.resolution = Some(resolution);
        self.state = State::Resolved;
        Ok(())
    }

    /// Terminal without a winner.
    pub fn expire(&mut self) {
        if !self.is_terminal() {
            self.state = State::Expired;
        }
    }
}

#[derive(Debug, Error)]
#[error("auction resolution is monotonic")]
pub struct AlreadyTerminal;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::filter::BiddableSpots;
    use chrono::{Duration as ChronoDuration, TimeZone};
    use model::request::{AdSpot, FoldPosition, Format, UserIds};
    use rand::{rngs::StdRng, SeedableRng};
    use std::time::Duration;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2022, 6, 15, 14, 0, 0).unwrap()
    }

    fn request(floor_micros: i64) -> BidRequest {
        BidRequest {
            id: "r-1".into(),
            timestamp: now(),
            exchange: "mock".to_owned(),
            time_available: Duration::from_millis(100),
            spots: vec![AdSpot {
                id: "0".to_owned(),
                position: FoldPosition::Unknown,
                formats: vec![Format::new(728, 90)],
                reserve_price: Amount::usd_micros(floor_micros),
            }],
            user_ids: UserIds::default(),
            url: String::new(),
            language: String::new(),
            location: String::new(),
            user_agent: String::new(),
            ip: String::new(),
            segments: Default::default(),
            raw: serde_json::Value::Null,
        }
    }

    fn config(group: &str, weight: u32) -> Arc<AgentConfig> {
        let mut config: AgentConfig = serde_json::from_value(serde_json::json!({
            "account": "campaign:a",
            "creatives": [{"id": 1, "format": {"width": 728, "height": 90}}]
        }))
        .unwrap();
        config.round_robin_group = group.to_owned();
        config.round_robin_weight = weight;
        Arc::new(config)
    }

    fn bid(micros: i64) -> Bid {
        Bid {
            spot_id: "0".to_owned(),
            creative: CreativeId(1),
            max_price: Amount::usd_micros(micros),
            account: AccountId::parse("campaign:a").unwrap(),
            timestamp: now(),
        }
    }

    fn auction_with_bids(floor: i64, bids: &[(&str, i64)]) -> Auction {
        let mut auction =
            Auction::new(request(floor), now() + ChronoDuration::milliseconds(50), now()).unwrap();
        for (agent, _) in bids {
            auction.add_participant((*agent).into(), config(agent, 1), BiddableSpots::default());
        }
        for (agent, price) in bids {
            auction
                .record_response(&(*agent).into(), vec![bid(*price)], now())
                .unwrap();
        }
        auction
    }

    #[test]
    fn second_price_clearing() {
        // S1: floor 1000, bids 5000 and 3000; clearing at runner up + 1.
        let auction = auction_with_bids(1_000, &[("a", 5_000), ("b", 3_000)]);
        let mut rng = StdRng::seed_from_u64(7);
        let ranked = auction.ranked_candidates(&mut rng);
        assert_eq!(ranked[0].agent, AgentId::from("a"));
        let clear = Auction::clear_price(&ranked[0], ranked.get(1));
        assert_eq!(clear, Amount::usd_micros(3_001));
    }

    #[test]
    fn clearing_is_floored_and_capped() {
        // No runner up: clear at the floor.
        let auction = auction_with_bids(1_000, &[("a", 5_000)]);
        let mut rng = StdRng::seed_from_u64(7);
        let ranked = auction.ranked_candidates(&mut rng);
        assert_eq!(
            Auction::clear_price(&ranked[0], None),
            Amount::usd_micros(1_000)
        );

        // Runner up equal to the winner's max: capped at the max.
        let auction = auction_with_bids(1_000, &[("a", 5_000), ("b", 5_000)]);
        let ranked = auction.ranked_candidates(&mut rng);
        assert_eq!(
            Auction::clear_price(&ranked[0], ranked.get(1)),
            Amount::usd_micros(5_000)
        );
    }

    #[test]
    fn bids_below_the_floor_are_excluded() {
        let auction = auction_with_bids(10_000, &[("a", 9_999), ("b", 10_000)]);
        let mut rng = StdRng::seed_from_u64(7);
        let ranked = auction.ranked_candidates(&mut rng);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].agent, AgentId::from("b"));
    }

    #[test]
    fn late_bids_are_rejected() {
        // S3: a response past the deadline must not contribute.
        let mut auction =
            Auction::new(request(1_000), now() + ChronoDuration::milliseconds(50), now()).unwrap();
        auction.add_participant("a".into(), config("a", 1), BiddableSpots::default());
        auction.add_participant("b".into(), config("b", 1), BiddableSpots::default());

        auction
            .record_response(&"a".into(), vec![bid(4_000)], now() + ChronoDuration::milliseconds(30))
            .unwrap();
        assert_eq!(
            auction.record_response(
                &"b".into(),
                vec![bid(9_000)],
                now() + ChronoDuration::milliseconds(70)
            ),
            Err(BidError::Late)
        );

        auction.close();
        let mut rng = StdRng::seed_from_u64(7);
        let ranked = auction.ranked_candidates(&mut rng);
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked[0].agent, AgentId::from("a"));
    }

    #[test]
    fn duplicate_and_unknown_responses_are_rejected() {
        let mut auction =
            Auction::new(request(1_000), now() + ChronoDuration::milliseconds(50), now()).unwrap();
        auction.add_participant("a".into(), config("a", 1), BiddableSpots::default());
        auction
            .record_response(&"a".into(), vec![bid(4_000)], now())
            .unwrap();
        assert_eq!(
            auction.record_response(&"a".into(), vec![bid(4_500)], now()),
            Err(BidError::Duplicate)
        );
        assert_eq!(
            auction.record_response(&"x".into(), vec![bid(4_500)], now()),
            Err(BidError::UnknownAgent)
        );
    }

    #[test]
    fn resolution_is_monotonic() {
        let mut auction = auction_with_bids(1_000, &[("a", 5_000)]);
        let resolution = Resolution {
            winner: "a".into(),
            account: AccountId::parse("campaign:a").unwrap(),
            creative: CreativeId(1),
            spot_id: "0".to_owned(),
            clear_price: Amount::usd_micros(1_000),
            winner_max: Amount::usd_micros(5_000),
            runner_up: None,
        };
        auction.set_resolution(resolution.clone()).unwrap();
        assert!(auction.set_resolution(resolution).is_err());
        assert_eq!(auction.state(), State::Resolved);
    }

    #[test]
    fn deadline_must_be_in_the_future() {
        assert!(Auction::new(request(1_000), now(), now()).is_err());
    }

    #[test]
    fn tied_prices_in_one_group_break_by_weight() {
        // S2: equal bids from one group with weights 3 and 1 split ~3:1.
        let mut wins_a = 0u32;
        let mut rng = StdRng::seed_from_u64(42);
        for _ in 0..4_000 {
            let mut auction = Auction::new(
                request(1_000),
                now() + ChronoDuration::milliseconds(50),
                now(),
            )
            .unwrap();
            auction.add_participant("a".into(), config("g1", 3), BiddableSpots::default());
            auction.add_participant("b".into(), config("g1", 1), BiddableSpots::default());
            auction
                .record_response(&"a".into(), vec![bid(5_000)], now())
                .unwrap();
            auction
                .record_response(&"b".into(), vec![bid(5_000)], now())
                .unwrap();
            let ranked = auction.ranked_candidates(&mut rng);
            if ranked[0].agent == AgentId::from("a") {
                wins_a += 1;
            }
        }
        // Expectation 3000 with a 5% tolerance band.
        assert!((2_850..=3_150).contains(&wins_a), "a won {wins_a} times");
    }

    #[test]
    fn tied_prices_across_groups_break_by_arrival() {
        let auction = auction_with_bids(1_000, &[("b", 5_000), ("a", 5_000)]);
        let mut rng = StdRng::seed_from_u64(7);
        // "b" responded first, so it keeps the head slot.
        let ranked = auction.ranked_candidates(&mut rng);
        assert_eq!(ranked[0].agent, AgentId::from("b"));
    }
}
