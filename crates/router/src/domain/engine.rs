//! The auction engine: one dispatcher task per shard.
//!
//! The engine owns its auction table outright; requests, bid responses and
//! deadline firings all arrive on the shard's single message queue, so no
//! lock is ever taken on the hot path. Filtering and resolution are purely
//! computational; the only suspension points are the inbox, the deadline
//! timer and banker authorization.

use crate::{
    domain::{
        auction::{Auction, Outcome, Resolution},
        blacklist::BlacklistStore,
        filter::{self, FilterCache},
        registry::Registry,
    },
    infra::{
        bidder::{AgentRequest, BidderInterface, SpotOffer},
        metrics::metrics,
        monitor::MonitorStatus,
    },
};
use shared::banker::{Banker, BankerError, Reservation};
use chrono::{DateTime, DurationRound, TimeZone, Utc};
use model::{
    agent::{AgentConfig, BidControl, ResultVerbosity},
    bid::{Bid, BidResponse},
    events::{MatchedEvent, MatchedKind, Submission},
    ids::{AccountId, AgentId, AuctionId},
    money::Amount,
    request::BidRequest,
};
use rand::{rngs::StdRng, Rng};
use shared::{outbox, timeout_map::TimeoutMap};
use std::{collections::HashMap, sync::Arc};
use tokio::sync::{mpsc, watch};

/// Engine tunables, one copy per shard.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// How long post-auction waits for a win before inferring a loss.
    pub loss_timeout: chrono::Duration,
    /// Subtracted from the exchange's time budget to cover response encoding
    /// and network egress.
    pub safety_margin: chrono::Duration,
    /// Bids above this are clipped, never rejected.
    pub max_bid_price: Amount,
    /// Per-second committed spend cap while in slow mode.
    pub slow_mode_money_limit: Amount,
    /// How long the monitor must be unhealthy before slow mode engages.
    pub slow_mode_tolerance: chrono::Duration,
    /// Size of the budget slices pre-authorized per account.
    pub spend_rate: Amount,
    pub log_auctions: bool,
    pub log_bids: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            loss_timeout: chrono::Duration::seconds(15),
            safety_margin: chrono::Duration::milliseconds(5),
            max_bid_price: Amount::usd_micros(40_000),
            slow_mode_money_limit: Amount::usd_micros(100_000),
            slow_mode_tolerance: chrono::Duration::seconds(5),
            spend_rate: Amount::usd_micros(100_000),
            log_auctions: false,
            log_bids: false,
        }
    }
}

/// Messages arriving on a shard's queue.
pub enum Command {
    Auction(BidRequest),
    Response(BidResponse),
}

#[derive(Default)]
struct SpendAccount {
    reservation: Option<Reservation>,
    /// Micros left on the reservation, tracked locally to avoid a banker
    /// round trip per commit decision.
    remaining: i64,
}

pub struct Engine {
    config: EngineConfig,
    registry: Registry,
    bidder: Arc<dyn BidderInterface>,
    banker: Arc<dyn Banker>,
    monitor: watch::Receiver<MonitorStatus>,
    submissions: outbox::Sender<Submission>,
    events: outbox::Sender<MatchedEvent>,
    auctions: TimeoutMap<AuctionId, Auction>,
    blacklist: BlacklistStore,
    in_flight: HashMap<AgentId, usize>,
    spend: HashMap<AccountId, SpendAccount>,
    /// Rolling second of committed spend for the slow mode cap.
    spend_window: (DateTime<Utc>, i64),
    rng: StdRng,
}

impl Engine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: EngineConfig,
        registry: Registry,
        bidder: Arc<dyn BidderInterface>,
        banker: Arc<dyn Banker>,
        monitor: watch::Receiver<MonitorStatus>,
        submissions: outbox::Sender<Submission>,
        events: outbox::Sender<MatchedEvent>,
        rng: StdRng,
    ) -> Self {
        Self {
            config,
            registry,
            bidder,
            banker,
            monitor,
            submissions,
            events,
            auctions: TimeoutMap::new(),
            blacklist: BlacklistStore::new(),
            in_flight: HashMap::new(),
            spend: HashMap::new(),
            spend_window: (Utc.timestamp_opt(0, 0).unwrap(), 0),
            rng,
        }
    }

    /// Drives the shard until the inbox closes, then drains.
    pub async fn run(mut self, mut inbox: mpsc::Receiver<Command>) {
        loop {
            let next = self.auctions.next_deadline();
            let sleep = match next {
                Some(deadline) => (deadline - Utc::now())
                    .to_std()
                    .unwrap_or(std::time::Duration::ZERO),
                // Nothing in flight; any sleep is fine, the inbox wakes us.
                None => std::time::Duration::from_secs(3600),
            };
            tokio::select! {
                command = inbox.recv() => match command {
                    Some(Command::Auction(request)) => self.on_auction(request, Utc::now()).await,
                    Some(Command::Response(response)) => {
                        self.on_response(response, Utc::now()).await
                    }
                    None => break,
                },
                _ = tokio::time::sleep(sleep), if next.is_some() => {
                    self.on_deadline(Utc::now()).await;
                }
            }
        }
        self.drain(Utc::now()).await;
    }

    pub fn open_auctions(&self) -> usize {
        self.auctions.len()
    }

    /// Ingress: filter, group, pick per-group bidders and dispatch.
    pub async fn on_auction(&mut self, request: BidRequest, now: DateTime<Utc>) {
        metrics()
            .auctions
            .with_label_values(&[&request.exchange])
            .inc();
        if self.config.log_auctions {
            tracing::debug!(auction = %request.id, exchange = %request.exchange, "auction");
        }

        if self.in_slow_mode(now) && self.slow_mode_refuses(&request, now) {
            metrics().slow_mode_skips.inc();
            return;
        }

        let time_available = chrono::Duration::from_std(request.time_available)
            .unwrap_or_else(|_| chrono::Duration::zero());
        let deadline = now + time_available - self.config.safety_margin;
        let shared_request = Arc::new(request.clone());
        let mut auction = match Auction::new(request, deadline, now) {
            Ok(auction) => auction,
            Err(err) => {
                tracing::debug!(?err, "dropped auction without time budget");
                metrics()
                    .skipped_agents
                    .with_label_values(&["no-time-budget"])
                    .inc();
                return;
            }
        };

        // Group eligible agents by round robin group.
        let snapshot = self.registry.snapshot();
        let mut cache = FilterCache::new(&auction.request);
        let mut groups: HashMap<String, Vec<Eligible>> = HashMap::new();
        let time_left = deadline - now;
        for (agent, config) in snapshot.iter() {
            if self.in_flight.get(agent).copied().unwrap_or(0) >= config.max_in_flight {
                metrics()
                    .skipped_agents
                    .with_label_values(&["too-many-in-flight"])
                    .inc();
                continue;
            }
            let min_time = chrono::Duration::from_std(config.min_time_available)
                .unwrap_or_else(|_| chrono::Duration::zero());
            if !config.min_time_available.is_zero() && time_left < min_time {
                metrics()
                    .skipped_agents
                    .with_label_values(&["not-enough-time"])
                    .inc();
                continue;
            }
            let rng = &mut self.rng;
            match filter::biddable_spots(config, &auction.request, &mut cache, |modulus| {
                rng.gen_range(0..modulus)
            }) {
                Ok(spots) => {
                    if self
                        .blacklist
                        .matches(config, agent, &auction.request, cache.host())
                    {
                        metrics()
                            .skipped_agents
                            .with_label_values(&["user-blacklisted"])
                            .inc();
                        continue;
                    }
                    groups
                        .entry(config.round_robin_group.clone())
                        .or_default()
                        .push(Eligible {
                            agent: agent.clone(),
                            config: config.clone(),
                            spots,
                        })
                }
                Err(reason) => metrics()
                    .filter_rejections
                    .with_label_values(&[reason.as_str()])
                    .inc(),
            }
        }

        // One member per group gets the request; the group's mean bid
        // probability gates the whole group with a single draw.
        for (_, members) in groups {
            let mean_probability = members
                .iter()
                .map(|entry| entry.config.bid_probability)
                .sum::<f64>()
                / members.len() as f64;
            if mean_probability < 1.0 && self.rng.gen::<f64>() >= mean_probability {
                metrics()
                    .skipped_agents
                    .with_label_values(&["bid-probability"])
                    .inc();
                continue;
            }

            let chosen = self.pick_group_member(&members);
            let entry = &members[chosen];
            *self.in_flight.entry(entry.agent.clone()).or_insert(0) += 1;

            let offers: Vec<SpotOffer> = entry
                .spots
                .0
                .iter()
                .map(|spot| SpotOffer {
                    spot_id: auction.request.spots[spot.spot].id.clone(),
                    creatives: spot.creatives.clone(),
                })
                .collect();

            auction.add_participant(entry.agent.clone(), entry.config.clone(), entry.spots.clone());

            match entry.config.bid_control {
                BidControl::Fixed { fixed_cpm } => {
                    // No relay: the router bids the fixed price on the
                    // agent's behalf.
                    let bid = Bid {
                        spot_id: offers[0].spot_id.clone(),
                        creative: offers[0].creatives[0],
                        max_price: fixed_cpm.min_same_currency(self.config.max_bid_price),
                        account: entry.config.account.clone(),
                        timestamp: now,
                    };
                    let agent = entry.agent.clone();
                    let _ = auction.record_response(&agent, vec![bid], now);
                    *self.in_flight.get_mut(&agent).unwrap() -= 1;
                }
                _ => self.bidder.send(AgentRequest {
                    auction: auction.request.id.clone(),
                    agent: entry.agent.clone(),
                    spots: offers,
                    deadline,
                    request: shared_request.clone(),
                }),
            }
        }

        if auction.participants().next().is_none() {
            metrics().no_potential_bidders.inc();
            return;
        }

        if auction.all_responded() {
            // Every participant was fixed-price; nothing to wait for.
            self.resolve(auction, now).await;
            return;
        }

        let id = auction.request.id.clone();
        self.auctions.insert(id, auction, deadline);
        metrics().open_auctions.set(self.auctions.len() as i64);
    }

    /// A response from the bidder channel.
    pub async fn on_response(&mut self, response: BidResponse, now: DateTime<Utc>) {
        let drop_reason = |reason: &str| {
            metrics().dropped_bids.with_label_values(&[reason]).inc();
        };

        let Some((config, offered)) = self.auctions.get(&response.auction).and_then(|auction| {
            auction
                .participant(&response.agent)
                .map(|participant| (participant.config.clone(), participant.spots.clone()))
        }) else {
            drop_reason(if self.auctions.contains_key(&response.auction) {
                "unknown-agent"
            } else {
                "unknown-auction"
            });
            return;
        };

        if self.config.log_bids {
            tracing::debug!(
                auction = %response.auction,
                agent = %response.agent,
                bids = response.bids.len(),
                "bid response"
            );
        }

        let mut bids = Vec::with_capacity(response.bids.len());
        {
            let auction = self.auctions.get(&response.auction).unwrap();
            for mut bid in response.bids {
                if config.test {
                    drop_reason("test-agent");
                    continue;
                }
                if !valid_bid(&auction.request, &offered, &config, &bid) {
                    drop_reason("malformed");
                    tracing::debug!(
                        auction = %response.auction,
                        agent = %response.agent,
                        "dropped malformed bid"
                    );
                    continue;
                }
                if let BidControl::RelayFixed { fixed_cpm } = config.bid_control {
                    bid.max_price = fixed_cpm;
                }
                if bid.max_price.exceeds(&self.config.max_bid_price) {
                    bid.max_price = self.config.max_bid_price;
                    metrics().clipped_bids.inc();
                }
                bids.push(bid);
            }
        }

        let auction = self.auctions.get_mut(&response.auction).unwrap();
        match auction.record_response(&response.agent, bids, now) {
            Ok(()) => {
                if let Some(count) = self.in_flight.get_mut(&response.agent) {
                    *count = count.saturating_sub(1);
                }
            }
            Err(err) => {
                drop_reason(match err {
                    crate::domain::auction::BidError::Late
                    | crate::domain::auction::BidError::Terminal => "late",
                    crate::domain::auction::BidError::Duplicate => "duplicate",
                    crate::domain::auction::BidError::UnknownAgent => "unknown-agent",
                });
                return;
            }
        }

        if self
            .auctions
            .get(&response.auction)
            .is_some_and(Auction::all_responded)
        {
            let auction = self.auctions.remove(&response.auction).unwrap();
            metrics().open_auctions.set(self.auctions.len() as i64);
            self.resolve(auction, now).await;
        }
    }

    /// Fires every auction whose deadline has passed.
    pub async fn on_deadline(&mut self, now: DateTime<Utc>) {
        for (_, auction) in self.auctions.expire(now) {
            self.resolve(auction, now).await;
        }
        self.blacklist.expire(now);
        metrics().open_auctions.set(self.auctions.len() as i64);
    }

    /// Shutdown: resolve what is still open with the bids that exist.
    pub async fn drain(&mut self, now: DateTime<Utc>) {
        let remaining = self.auctions.expire(DateTime::<Utc>::MAX_UTC);
        for (_, auction) in remaining {
            self.resolve(auction, now).await;
        }
        self.submissions.close();
        self.events.close();
    }

    /// Prefers the group members with the lowest in-flight proportion, then
    /// picks among those by round robin weight.
    fn pick_group_member(&mut self, members: &[Eligible]) -> usize {
        let proportions: Vec<f64> = members
            .iter()
            .map(|member| {
                let outstanding = self.in_flight.get(&member.agent).copied().unwrap_or(0);
                outstanding as f64 / member.config.max_in_flight.max(1) as f64
            })
            .collect();
        let min = proportions.iter().cloned().fold(f64::INFINITY, f64::min);
        let best: Vec<usize> = (0..members.len())
            .filter(|&i| proportions[i] <= min)
            .collect();

        let weight_of = |i: usize| members[i].config.round_robin_weight.max(1) as u64;
        let total: u64 = best.iter().map(|&i| weight_of(i)).sum();
        let mut draw = self.rng.gen_range(0..total.max(1));
        for &i in &best {
            if draw < weight_of(i) {
                return i;
            }
            draw -= weight_of(i);
        }
        best[0]
    }

    async fn resolve(&mut self, mut auction: Auction, now: DateTime<Utc>) {
        for agent in auction.close() {
            if let Some(count) = self.in_flight.get_mut(&agent) {
                *count = count.saturating_sub(1);
            }
        }

        let ranked = auction.ranked_candidates(&mut self.rng);
        let mut outcome = None;
        for index in 0..ranked.len() {
            let clear = Auction::clear_price(&ranked[index], ranked.get(index + 1));
            match self.commit_spend(&ranked[index].account, clear, now).await {
                Ok(()) => {
                    outcome = Some((index, clear));
                    break;
                }
                Err(BankerError::Insufficient) => {
                    metrics().demoted_winners.inc();
                    continue;
                }
                Err(BankerError::Unavailable) => {
                    metrics().banker_unavailable.inc();
                    break;
                }
            }
        }

        let Some((winner_index, clear_price)) = outcome else {
            auction.expire();
            metrics().expired_auctions.inc();
            self.emit_losses(&auction, None, now);
            return;
        };

        let winner = &ranked[winner_index];
        let resolution = Resolution {
            winner: winner.agent.clone(),
            account: winner.account.clone(),
            creative: winner.creative,
            spot_id: winner.spot_id.clone(),
            clear_price,
            winner_max: winner.max_price,
            runner_up: ranked.get(winner_index + 1).map(|c| c.max_price),
        };
        auction
            .set_resolution(resolution.clone())
            .expect("auction resolved twice");
        metrics().resolved_auctions.inc();
        metrics()
            .committed_micros
            .inc_by(clear_price.micros as f64);

        let winner_config = auction
            .participant(&resolution.winner)
            .expect("winner is a participant")
            .config
            .clone();
        let submission = Submission {
            auction: auction.request.id.clone(),
            spot_id: resolution.spot_id.clone(),
            agent: resolution.winner.clone(),
            account: resolution.account.clone(),
            creative: resolution.creative,
            clear_price,
            resolved_at: now,
            loss_timeout: now + self.config.loss_timeout,
            win_format: winner_config.win_format,
            loss_format: winner_config.loss_format,
            request: matches!(winner_config.win_format, ResultVerbosity::Full)
                .then(|| Box::new(auction.request.clone())),
        };
        if self.submissions.send(submission).is_some() {
            metrics().submission_drops.inc();
        }

        let host = url::Url::parse(&auction.request.url)
            .ok()
            .and_then(|url| url.host_str().map(str::to_owned))
            .unwrap_or_default();
        self.blacklist
            .note_win(&winner_config, &resolution.winner, &auction.request, &host, now);

        self.emit_losses(&auction, Some(&resolution.winner), now);
    }

    /// Local losers get an immediate loss message when they asked for one.
    fn emit_losses(&mut self, auction: &Auction, winner: Option<&AgentId>, now: DateTime<Utc>) {
        for (agent, participant) in auction.participants() {
            if Some(agent) == winner {
                continue;
            }
            let Outcome::Responded { bids, .. } = &participant.outcome else {
                continue;
            };
            if bids.is_empty() || participant.config.loss_format == ResultVerbosity::None {
                continue;
            }
            let event = MatchedEvent {
                auction: auction.request.id.clone(),
                kind: MatchedKind::Loss,
                agent: agent.clone(),
                account: participant.config.account.clone(),
                creative: bids[0].creative,
                price: None,
                timestamp: now,
                verbosity: participant.config.loss_format,
                request: None,
            };
            if self.events.send(event).is_some() {
                metrics().event_drops.inc();
            }
        }
    }

    async fn commit_spend(
        &mut self,
        account: &AccountId,
        price: Amount,
        now: DateTime<Utc>,
    ) -> Result<(), BankerError> {
        let need = price.micros;
        let has_room = self
            .spend
            .get(account)
            .map(|entry| entry.remaining >= need)
            .unwrap_or(false);

        if !has_room {
            // Amortized top-up: release the dregs and authorize a new slice.
            let stale = self
                .spend
                .get_mut(account)
                .and_then(|entry| {
                    entry.remaining = 0;
                    entry.reservation.take()
                });
            if let Some(reservation) = stale {
                let _ = self.banker.rollback(&reservation).await;
            }
            let slice = self.config.spend_rate.micros.max(need);
            let reservation = self
                .banker
                .authorize(
                    account,
                    Amount {
                        currency: price.currency,
                        micros: slice,
                    },
                )
                .await?;
            let entry = self.spend.entry(account.clone()).or_default();
            entry.remaining = slice;
            entry.reservation = Some(reservation);
        }

        let reservation = self
            .spend
            .get(account)
            .and_then(|entry| entry.reservation.clone())
            .ok_or(BankerError::Insufficient)?;
        self.banker.commit(&reservation, price).await?;
        self.spend.get_mut(account).expect("spend entry exists").remaining -= need;
        self.note_spend(price, now);
        Ok(())
    }

    fn in_slow_mode(&self, now: DateTime<Utc>) -> bool {
        let status = *self.monitor.borrow();
        !status.healthy && now - status.since >= self.config.slow_mode_tolerance
    }

    fn slow_mode_refuses(&self, request: &BidRequest, now: DateTime<Utc>) -> bool {
        // The cheapest bid this auction could clear at.
        let min_bid = request
            .spots
            .iter()
            .map(|spot| spot.reserve_price.micros)
            .min()
            .unwrap_or(1)
            .max(1);
        self.window_spend(now) + min_bid > self.config.slow_mode_money_limit.micros
    }

    fn window_spend(&self, now: DateTime<Utc>) -> i64 {
        let second = now
            .duration_trunc(chrono::Duration::seconds(1))
            .unwrap_or(now);
        if self.spend_window.0 == second {
            self.spend_window.1
        } else {
            0
        }
    }

    fn note_spend(&mut self, price: Amount, now: DateTime<Utc>) {
        let second = now
            .duration_trunc(chrono::Duration::seconds(1))
            .unwrap_or(now);
        if self.spend_window.0 != second {
            self.spend_window = (second, 0);
        }
        self.spend_window.1 += price.micros;
    }
}

/// An agent that survived filtering for one auction.
struct Eligible {
    agent: AgentId,
    config: Arc<AgentConfig>,
    spots: filter::BiddableSpots,
}

fn valid_bid(
    request: &BidRequest,
    offered: &filter::BiddableSpots,
    config: &AgentConfig,
    bid: &Bid,
) -> bool {
    if bid.account != config.account || bid.max_price.micros <= 0 {
        return false;
    }
    let Some(spot_index) = request.spots.iter().position(|spot| spot.id == bid.spot_id) else {
        return false;
    };
    // Only creatives the agent was offered for that spot are biddable.
    offered
        .creatives_for(spot_index)
        .is_some_and(|creatives| creatives.contains(&bid.creative))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::{bidder::ChannelBidder, monitor};
    use shared::banker::InMemoryBanker;
    use chrono::TimeZone;
    use model::request::{AdSpot, FoldPosition, Format, UserIds};
    use rand::SeedableRng;
    use std::time::Duration;

    struct Harness {
        engine: Engine,
        dispatches: mpsc::UnboundedReceiver<AgentRequest>,
        submissions: outbox::Receiver<Submission>,
        events: outbox::Receiver<MatchedEvent>,
        banker: Arc<InMemoryBanker>,
        monitor_tx: watch::Sender<MonitorStatus>,
        registry: Registry,
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2022, 6, 15, 14, 0, 0).unwrap()
    }

    fn harness(config: EngineConfig) -> Harness {
        let registry = Registry::new();
        let (bidder, dispatches) = ChannelBidder::new();
        let banker = Arc::new(InMemoryBanker::new());
        let (monitor_tx, monitor_rx) = monitor::channel(now());
        let (submission_tx, submissions) = outbox::channel(64);
        let (event_tx, events) = outbox::channel(64);
        let engine = Engine::new(
            config,
            registry.clone(),
            Arc::new(bidder),
            banker.clone(),
            monitor_rx,
            submission_tx,
            event_tx,
            StdRng::seed_from_u64(1),
        );
        Harness {
            engine,
            dispatches,
            submissions,
            events,
            banker,
            monitor_tx,
            registry,
        }
    }

    fn agent_config(account: &str) -> AgentConfig {
        serde_json::from_value(serde_json::json!({
            "account": account,
            "creatives": [{"id": 1, "format": {"width": 728, "height": 90}}]
        }))
        .unwrap()
    }

    fn request(id: &str, floor_micros: i64) -> BidRequest {
        BidRequest {
            id: id.into(),
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

    fn response(auction: &str, agent: &str, account: &str, micros: i64) -> BidResponse {
        BidResponse {
            auction: auction.into(),
            agent: agent.into(),
            bids: vec![Bid {
                spot_id: "0".to_owned(),
                creative: model::ids::CreativeId(1),
                max_price: Amount::usd_micros(micros),
                account: AccountId::parse(account).unwrap(),
                timestamp: now(),
            }],
        }
    }

    #[tokio::test]
    async fn basic_second_price_flow() {
        let mut h = harness(EngineConfig::default());
        h.registry
            .register("a".into(), agent_config("alpha:x"))
            .unwrap();
        h.registry
            .register("b".into(), agent_config("beta:x"))
            .unwrap();
        let funding = Amount::usd_micros(1_000_000);
        h.banker.top_up(&AccountId::parse("alpha:x").unwrap(), funding);
        h.banker.top_up(&AccountId::parse("beta:x").unwrap(), funding);

        h.engine.on_auction(request("r1", 1_000), now()).await;
        assert!(h.dispatches.recv().await.is_some());
        assert!(h.dispatches.recv().await.is_some());
        assert_eq!(h.engine.open_auctions(), 1);

        h.engine
            .on_response(response("r1", "a", "alpha:x", 5_000), now())
            .await;
        h.engine
            .on_response(response("r1", "b", "beta:x", 3_000), now())
            .await;

        // Both answered: resolved without waiting for the deadline.
        assert_eq!(h.engine.open_auctions(), 0);
        let submission = h.submissions.try_recv().unwrap();
        assert_eq!(submission.agent, AgentId::from("a"));
        assert_eq!(submission.clear_price, Amount::usd_micros(3_001));
        assert_eq!(submission.loss_timeout, now() + chrono::Duration::seconds(15));

        // The local loser gets its loss message right away.
        let loss = h.events.try_recv().unwrap();
        assert_eq!(loss.kind, MatchedKind::Loss);
        assert_eq!(loss.agent, AgentId::from("b"));

        // Spend committed equals the clearing price.
        assert_eq!(
            h.banker.committed(&AccountId::parse("alpha:x").unwrap()),
            3_001
        );
    }

    #[tokio::test]
    async fn late_bids_do_not_contribute() {
        let mut h = harness(EngineConfig::default());
        h.registry
            .register("a".into(), agent_config("alpha:x"))
            .unwrap();
        h.registry
            .register("b".into(), agent_config("beta:x"))
            .unwrap();
        let funding = Amount::usd_micros(1_000_000);
        h.banker.top_up(&AccountId::parse("alpha:x").unwrap(), funding);
        h.banker.top_up(&AccountId::parse("beta:x").unwrap(), funding);

        h.engine.on_auction(request("r3", 1_000), now()).await;
        h.engine
            .on_response(
                response("r3", "a", "alpha:x", 4_000),
                now() + chrono::Duration::milliseconds(30),
            )
            .await;
        // The deadline is time_available - safety margin = 95ms.
        h.engine
            .on_response(
                response("r3", "b", "beta:x", 9_000),
                now() + chrono::Duration::milliseconds(96),
            )
            .await;

        h.engine
            .on_deadline(now() + chrono::Duration::milliseconds(95))
            .await;

        let submission = h.submissions.try_recv().unwrap();
        assert_eq!(submission.agent, AgentId::from("a"));
        // The late 9000 bid never became the runner up.
        assert_eq!(submission.clear_price, Amount::usd_micros(1_000));
        assert!(h.submissions.try_recv().is_none());
    }

    #[tokio::test]
    async fn slow_mode_caps_spend_per_second() {
        let mut h = harness(EngineConfig::default());
        let mut fixed = agent_config("alpha:x");
        fixed.bid_control = BidControl::Fixed {
            fixed_cpm: Amount::usd_micros(99_999),
        };
        h.registry.register("a".into(), fixed).unwrap();
        h.banker.top_up(
            &AccountId::parse("alpha:x").unwrap(),
            Amount::usd_micros(10_000_000),
        );

        // Monitor unhealthy long past the tolerance.
        h.monitor_tx
            .send(MonitorStatus::unhealthy(now() - chrono::Duration::seconds(60)))
            .unwrap();

        // First auction fits under the limit and commits 99999 micros.
        h.engine.on_auction(request("s1", 99_999), now()).await;
        let first = h.submissions.try_recv().unwrap();
        assert_eq!(first.clear_price, Amount::usd_micros(99_999));

        // 99999 + 2 would exceed the 100000 limit: refused outright.
        h.engine.on_auction(request("s2", 2), now()).await;
        assert_eq!(h.engine.open_auctions(), 0);
        assert!(h.submissions.try_recv().is_none());

        // A healthy monitor recovers immediately.
        h.monitor_tx.send(MonitorStatus::healthy(now())).unwrap();
        h.engine.on_auction(request("s3", 2), now()).await;
        assert!(h.submissions.try_recv().is_some());
    }

    #[tokio::test]
    async fn insufficient_budget_demotes_the_winner() {
        let mut h = harness(EngineConfig::default());
        h.registry
            .register("a".into(), agent_config("alpha:x"))
            .unwrap();
        h.registry
            .register("b".into(), agent_config("beta:x"))
            .unwrap();
        // Only the runner up's account is funded.
        h.banker.top_up(
            &AccountId::parse("beta:x").unwrap(),
            Amount::usd_micros(1_000_000),
        );

        h.engine.on_auction(request("r4", 1_000), now()).await;
        h.engine
            .on_response(response("r4", "a", "alpha:x", 5_000), now())
            .await;
        h.engine
            .on_response(response("r4", "b", "beta:x", 3_000), now())
            .await;

        let submission = h.submissions.try_recv().unwrap();
        assert_eq!(submission.agent, AgentId::from("b"));
        assert_eq!(submission.clear_price, Amount::usd_micros(1_000));
    }

    #[tokio::test]
    async fn bids_are_clipped_to_the_router_maximum() {
        let mut h = harness(EngineConfig::default());
        h.registry
            .register("a".into(), agent_config("alpha:x"))
            .unwrap();
        h.registry
            .register("b".into(), agent_config("beta:x"))
            .unwrap();
        let funding = Amount::usd_micros(10_000_000);
        h.banker.top_up(&AccountId::parse("alpha:x").unwrap(), funding);
        h.banker.top_up(&AccountId::parse("beta:x").unwrap(), funding);

        h.engine.on_auction(request("r5", 1_000), now()).await;
        // 90000 clips to the 40000 default maximum; with the runner up at
        // 39999 the clearing price lands exactly on the clipped value.
        h.engine
            .on_response(response("r5", "a", "alpha:x", 90_000), now())
            .await;
        h.engine
            .on_response(response("r5", "b", "beta:x", 39_999), now())
            .await;

        let submission = h.submissions.try_recv().unwrap();
        assert_eq!(submission.agent, AgentId::from("a"));
        assert_eq!(submission.clear_price, Amount::usd_micros(40_000));
    }

    #[tokio::test]
    async fn round_robin_groups_share_traffic_by_weight() {
        let mut h = harness(EngineConfig::default());
        let mut a = agent_config("alpha:x");
        a.round_robin_group = "g1".to_owned();
        a.round_robin_weight = 3;
        let mut b = agent_config("beta:x");
        b.round_robin_group = "g1".to_owned();
        b.round_robin_weight = 1;
        h.registry.register("a".into(), a).unwrap();
        h.registry.register("b".into(), b).unwrap();

        let mut seen_a = 0u32;
        for i in 0..4_000 {
            let id = format!("rr-{i}");
            h.engine.on_auction(request(&id, 1_000), now()).await;
            let dispatch = h.dispatches.recv().await.unwrap();
            assert!(h.dispatches.try_recv().is_err(), "one member per group");
            if dispatch.agent == AgentId::from("a") {
                seen_a += 1;
            }
            // Let the auction expire so in-flight counts return to zero.
            h.engine
                .on_deadline(now() + chrono::Duration::seconds(1))
                .await;
        }
        assert!((2_850..=3_150).contains(&seen_a), "a saw {seen_a}");
    }

    #[tokio::test]
    async fn zero_bid_probability_skips_the_group() {
        let mut h = harness(EngineConfig::default());
        let mut config = agent_config("alpha:x");
        config.bid_probability = 0.0;
        h.registry.register("a".into(), config).unwrap();

        h.engine.on_auction(request("p0", 1_000), now()).await;
        assert_eq!(h.engine.open_auctions(), 0);
        assert!(h.dispatches.try_recv().is_err());
    }
}
