//! Exchange-facing auction router.
//!
//! Wires the agent registry, the sharded auction engines, the banker client
//! and the health monitor into a running service. Exchange connectors feed
//! normalized requests through [`Router::submit`]; the bidder transport feeds
//! responses through [`Router::on_response`].

pub mod arguments;
pub mod domain;
pub mod infra;

use crate::{
    arguments::Arguments,
    domain::{
        engine::{Command, Engine, EngineConfig},
        registry::Registry,
    },
    infra::{
        bidder::{BidderInterface, ChannelBidder},
        monitor::{self, HealthCheck},
    },
};
use shared::banker::{Banker, BankerError, InMemoryBanker};
use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use model::{
    bid::BidResponse, events::MatchedEvent, events::Submission, hash::stable_hash, ids::AccountId,
    money::Amount, request::BidRequest,
};
use rand::{rngs::StdRng, SeedableRng};
use shared::outbox;
use std::sync::{
    atomic::{AtomicI64, Ordering},
    Arc,
};
use std::time::Duration;
use tokio::sync::mpsc;

const SHARD_QUEUE: usize = 1024;
const HANDOFF_QUEUE: usize = 4096;

/// Ingress handle held by exchange connectors and the bidder transport.
#[derive(Clone)]
pub struct Router {
    shards: Vec<mpsc::Sender<Command>>,
    last_auction: Arc<AtomicI64>,
}

impl Router {
    /// Routes the request to its shard. Suspends only when the shard queue
    /// is full.
    pub async fn submit(&self, request: BidRequest) {
        self.last_auction
            .store(chrono::Utc::now().timestamp(), Ordering::Relaxed);
        let shard = self.shard_of(request.id.as_str());
        if self.shards[shard]
            .send(Command::Auction(request))
            .await
            .is_err()
        {
            tracing::warn!(shard, "auction shard is gone");
        }
    }

    /// Routes a bid response to the shard that owns its auction.
    pub async fn on_response(&self, response: BidResponse) {
        let shard = self.shard_of(response.auction.as_str());
        if self.shards[shard]
            .send(Command::Response(response))
            .await
            .is_err()
        {
            tracing::warn!(shard, "auction shard is gone");
        }
    }

    fn shard_of(&self, key: &str) -> usize {
        (stable_hash(key) % self.shards.len() as u64) as usize
    }
}

struct Liveness {
    last_auction: Arc<AtomicI64>,
    max_age: Duration,
}

#[async_trait]
impl observe::metrics::LivenessChecking for Liveness {
    async fn is_alive(&self) -> bool {
        let last = self.last_auction.load(Ordering::Relaxed);
        // No traffic yet is not a failure; only staleness is.
        last == 0
            || chrono::Utc::now().timestamp().saturating_sub(last)
                <= self.max_age.as_secs() as i64
    }
}

/// The banker is reachable when it answers anything at all; an insufficient
/// probe account is still an answer.
struct BankerProbe {
    banker: Arc<dyn Banker>,
    account: AccountId,
}

#[async_trait]
impl HealthCheck for BankerProbe {
    async fn is_healthy(&self) -> bool {
        match self
            .banker
            .authorize(&self.account, Amount::usd_micros(1))
            .await
        {
            Ok(reservation) => {
                let _ = self.banker.rollback(&reservation).await;
                true
            }
            Err(BankerError::Insufficient) => true,
            Err(BankerError::Unavailable) => false,
        }
    }
}

/// Everything a running router consists of.
pub struct Running {
    pub router: Router,
    pub registry: Registry,
    pub submissions: outbox::Receiver<Submission>,
    pub events: outbox::Receiver<MatchedEvent>,
    pub shard_tasks: Vec<tokio::task::JoinHandle<()>>,
}

/// Builds and spawns the sharded engine with the given collaborators.
pub fn start(
    args: &Arguments,
    registry: Registry,
    bidder: Arc<dyn BidderInterface>,
    banker: Arc<dyn Banker>,
) -> Running {
    let engine_config = EngineConfig {
        loss_timeout: chrono::Duration::from_std(args.loss_timeout())
            .unwrap_or_else(|_| chrono::Duration::seconds(15)),
        safety_margin: chrono::Duration::milliseconds(args.safety_margin_ms as i64),
        max_bid_price: Amount::usd_micros(args.max_bid_price),
        slow_mode_money_limit: args.slow_mode_money_limit,
        slow_mode_tolerance: chrono::Duration::seconds(args.slow_mode_tolerance as i64),
        spend_rate: args.spend_rate,
        log_auctions: args.log_auctions,
        log_bids: args.log_bids,
    };

    let monitor = monitor::spawn(
        Arc::new(BankerProbe {
            banker: banker.clone(),
            account: AccountId::parse("router:monitor").expect("static account id"),
        }),
        Duration::from_secs(args.slow_mode_timeout.max(1)),
    );

    let (submission_tx, submissions) = outbox::channel(HANDOFF_QUEUE);
    let (event_tx, events) = outbox::channel(HANDOFF_QUEUE);

    let mut shards = Vec::with_capacity(args.shards);
    let mut shard_tasks = Vec::with_capacity(args.shards);
    for shard in 0..args.shards {
        let (tx, rx) = mpsc::channel(SHARD_QUEUE);
        let engine = Engine::new(
            engine_config.clone(),
            registry.clone(),
            bidder.clone(),
            banker.clone(),
            monitor.clone(),
            submission_tx.clone(),
            event_tx.clone(),
            StdRng::seed_from_u64(stable_hash(shard.to_le_bytes())),
        );
        shards.push(tx);
        shard_tasks.push(tokio::spawn(engine.run(rx)));
    }

    Running {
        router: Router {
            shards,
            last_auction: Arc::new(AtomicI64::new(0)),
        },
        registry,
        submissions,
        events,
        shard_tasks,
    }
}

/// Entry point called by the binary once tracing and metrics are set up.
pub async fn main(args: Arguments) -> Result<()> {
    args.validate().context("invalid router configuration")?;

    let exchanges = infra::config::load_exchanges(&args.exchange_configuration)?;
    for exchange in &exchanges {
        tracing::info!(name = %exchange.name, "exchange connector configured");
    }
    let bidder_config = infra::config::load_bidder(&args.bidder_configuration)?;
    if bidder_config.kind != "channel" {
        bail!("unknown bidder transport {:?}", bidder_config.kind);
    }

    let registry = Registry::new();
    if let Some(path) = &args.agent_configuration {
        for (agent, config) in infra::config::load_agents(path)? {
            registry
                .register(agent.clone(), config)
                .with_context(|| format!("agent {agent} has an invalid configuration"))?;
            tracing::info!(%agent, "agent registered");
        }
    }

    let banker = Arc::new(InMemoryBanker::new());
    spawn_budget_refill(banker.clone(), registry.clone(), args.spend_rate);

    let (bidder, mut dispatches) = ChannelBidder::new();
    let running = start(&args, registry, Arc::new(bidder), banker);

    let liveness = Arc::new(Liveness {
        last_auction: running.router.last_auction.clone(),
        max_age: Duration::from_secs(300),
    });
    observe::metrics::serve_metrics(liveness, args.metrics_address);

    // Without a connected agent process the channel transport's dispatches
    // terminate here; the harness that owns real agents consumes them before
    // this drain sees anything.
    tokio::spawn(async move { while dispatches.recv().await.is_some() {} });

    // The journal is the durability boundary: the post-auction service reads
    // submissions from it. `--no-post-auction-loop` drops them instead.
    let forward_to_post_auction = !args.no_post_auction_loop;
    let mut submissions = running.submissions;
    tokio::spawn(async move {
        while let Some(submission) = submissions.recv().await {
            if forward_to_post_auction {
                tracing::info!(
                    target: "journal",
                    auction = %submission.auction,
                    agent = %submission.agent,
                    price = %submission.clear_price,
                    "submission"
                );
            }
        }
    });
    let mut events = running.events;
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            tracing::info!(
                target: "journal",
                auction = %event.auction,
                kind = ?event.kind,
                agent = %event.agent,
                "event"
            );
        }
    });

    tracing::info!(shards = running.router.shards.len(), "router started");
    tokio::signal::ctrl_c().await.context("waiting for shutdown")?;
    tracing::info!("shutting down, draining shards");

    drop(running.router);
    futures::future::join_all(running.shard_tasks).await;
    Ok(())
}

/// Stand-in for the remote banker's periodic re-authorization: every second
/// each known account's balance grows by the spend rate.
fn spawn_budget_refill(banker: Arc<InMemoryBanker>, registry: Registry, rate: Amount) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            ticker.tick().await;
            for config in registry.snapshot().values() {
                banker.top_up(&config.account, rate);
            }
        }
    });
}
