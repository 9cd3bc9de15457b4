//! Command line surface of the router.

use anyhow::{ensure, Result};
use model::money::Amount;
use std::{net::SocketAddr, path::PathBuf, time::Duration};
use url::Url;

#[derive(clap::Parser, Debug)]
pub struct Arguments {
    /// Seconds after which a missing win notification is assumed a loss.
    #[clap(long, env, default_value = "15.0")]
    pub loss_seconds: f64,

    /// Seconds between health monitor checks.
    #[clap(long = "slowModeTimeout", alias = "slow-mode-timeout", env, default_value = "1")]
    pub slow_mode_timeout: u64,

    /// Seconds the monitor may be unhealthy before slow mode engages.
    #[clap(
        long = "slowModeTolerance",
        alias = "slow-mode-tolerance",
        env,
        default_value = "5"
    )]
    pub slow_mode_tolerance: u64,

    /// Don't hand resolved auctions to the post auction loop.
    #[clap(long, env)]
    pub no_post_auction_loop: bool,

    /// URIs to publish the event journal to.
    #[clap(long = "log-uri", env, use_value_delimiter = true)]
    pub log_uris: Vec<Url>,

    /// Configuration file with exchange connector declarations.
    #[clap(long, env, default_value = "configs/exchanges.json")]
    pub exchange_configuration: PathBuf,

    /// Configuration file for the bidder transport.
    #[clap(long = "bidder", env, default_value = "configs/bidder.json")]
    pub bidder_configuration: PathBuf,

    /// Initial agent configurations, a JSON map of name to document.
    #[clap(long, env)]
    pub agent_configuration: Option<PathBuf>,

    /// Log every auction request.
    #[clap(long, env)]
    pub log_auctions: bool,

    /// Log every bid response.
    #[clap(long, env)]
    pub log_bids: bool,

    /// Maximum accepted bid price in micros; higher bids are clipped.
    #[clap(long, env, default_value = "40000")]
    pub max_bid_price: i64,

    /// Budget slice periodically re-authorized per account.
    #[clap(long, env, default_value = "100000USD/1M")]
    pub spend_rate: Amount,

    /// Money authorized per second while in slow mode.
    #[clap(long, env, default_value = "100000USD/1M")]
    pub slow_mode_money_limit: Amount,

    /// Send data to the analytics publisher.
    #[clap(long, env)]
    pub analytics: bool,

    /// Number of connections for the analytics publisher.
    #[clap(long, env, default_value = "1")]
    pub analytics_connections: usize,

    /// Independent auction shards, each with its own dispatcher task.
    #[clap(long, env, default_value = "1")]
    pub shards: usize,

    /// Subtracted from each request's time budget, in milliseconds.
    #[clap(long, env, default_value = "5")]
    pub safety_margin_ms: u64,

    #[clap(long, env, default_value = "0.0.0.0:9586")]
    pub metrics_address: SocketAddr,
}

impl Arguments {
    /// Startup validation; violations are fatal before anything is spawned.
    pub fn validate(&self) -> Result<()> {
        ensure!(self.shards > 0, "at least one shard is required");
        ensure!(self.loss_seconds > 0.0, "loss-seconds must be positive");
        let max_bid = Amount::usd_micros(self.max_bid_price);
        ensure!(
            !max_bid.exceeds(&self.slow_mode_money_limit),
            "max-bid-price ({max_bid}) must be lower or equal to the \
             slow-mode-money-limit ({})",
            self.slow_mode_money_limit,
        );
        Ok(())
    }

    pub fn loss_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.loss_seconds)
    }
}
