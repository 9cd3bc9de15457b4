//! Command line surface of the post-auction service.

use anyhow::{ensure, Result};
use std::{net::SocketAddr, path::PathBuf, time::Duration};

#[derive(clap::Parser, Debug)]
pub struct Arguments {
    /// Independent shards, each owning its join store and timers.
    #[clap(long, env, default_value = "1")]
    pub shards: usize,

    /// Seconds to wait for a win notification before inferring a loss.
    #[clap(long, env, default_value = "15.0")]
    pub auction_timeout: f64,

    /// Seconds after a win during which delivery events are awaited.
    #[clap(long, env, default_value = "3600.0")]
    pub win_timeout: f64,

    /// Seconds an event that precedes its auction handoff is buffered.
    #[clap(long, env, default_value = "2.0")]
    pub early_event_ttl: f64,

    /// Records retained per shard before the oldest is evicted.
    #[clap(long, env, default_value = "1048576")]
    pub capacity: usize,

    /// Configuration file for the bidder transport used for result messages.
    #[clap(long = "bidder", env, default_value = "configs/bidder.json")]
    pub bidder_configuration: PathBuf,

    #[clap(long, env, default_value = "0.0.0.0:9587")]
    pub metrics_address: SocketAddr,
}

impl Arguments {
    pub fn validate(&self) -> Result<()> {
        ensure!(self.shards > 0, "at least one shard is required");
        ensure!(self.auction_timeout > 0.0, "auction-timeout must be positive");
        ensure!(self.win_timeout > 0.0, "win-timeout must be positive");
        ensure!(self.capacity > 0, "capacity must be positive");
        Ok(())
    }

    pub fn auction_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.auction_timeout)
    }

    pub fn win_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.win_timeout)
    }

    pub fn early_event_ttl(&self) -> Duration {
        Duration::from_secs_f64(self.early_event_ttl)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn defaults_validate() {
        let args = Arguments::parse_from(["post-auction"]);
        assert!(args.validate().is_ok());
        assert_eq!(args.shards, 1);
    }

    #[test]
    fn rejects_zero_shards() {
        let args = Arguments::parse_from(["post-auction", "--shards", "0"]);
        assert!(args.validate().is_err());
    }
}
