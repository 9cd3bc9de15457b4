//! Post-auction loop: joins delayed win and delivery events with their
//! originating auctions and emits reconciled events downstream.

pub mod arguments;
pub mod domain;
pub mod infra;

use crate::{
    arguments::Arguments,
    domain::{matcher::MatcherConfig, service::Service},
    infra::adserver::EventMapping,
};
use anyhow::{Context, Result};
use async_trait::async_trait;
use shared::{banker::InMemoryBanker, outbox};
use std::sync::Arc;

struct AlwaysAlive;

#[async_trait]
impl observe::metrics::LivenessChecking for AlwaysAlive {
    async fn is_alive(&self) -> bool {
        true
    }
}

/// Entry point called by the binary once tracing and metrics are set up.
pub async fn main(args: Arguments) -> Result<()> {
    args.validate().context("invalid post-auction configuration")?;

    let config = MatcherConfig {
        auction_timeout: chrono::Duration::from_std(args.auction_timeout())
            .unwrap_or_else(|_| chrono::Duration::seconds(15)),
        win_timeout: chrono::Duration::from_std(args.win_timeout())
            .unwrap_or_else(|_| chrono::Duration::seconds(3600)),
        early_ttl: chrono::Duration::from_std(args.early_event_ttl())
            .unwrap_or_else(|_| chrono::Duration::seconds(2)),
        capacity: args.capacity,
    };

    let bidder: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(&args.bidder_configuration).with_context(|| {
            format!(
                "reading bidder configuration {}",
                args.bidder_configuration.display()
            )
        })?,
    )
    .context("parsing bidder configuration")?;
    tracing::info!(kind = %bidder["kind"], "result message transport configured");

    let mapping = EventMapping::standard();
    tracing::debug!(?mapping, "adserver event mapping");

    let banker = Arc::new(InMemoryBanker::new());
    let (emitted_tx, mut emitted) = outbox::channel(4096);
    let (service, shard_tasks) = Service::start(args.shards, config, banker, emitted_tx);

    observe::metrics::serve_metrics(Arc::new(AlwaysAlive), args.metrics_address);

    // Emission is the durability boundary: everything reconciled lands in
    // the journal.
    tokio::spawn(async move {
        while let Some(event) = emitted.recv().await {
            tracing::info!(
                target: "journal",
                auction = %event.auction,
                kind = ?event.kind,
                agent = %event.agent,
                "event"
            );
        }
    });

    tracing::info!(shards = args.shards, "post-auction service started");
    tokio::signal::ctrl_c().await.context("waiting for shutdown")?;
    tracing::info!("shutting down, draining shards");

    drop(service);
    futures::future::join_all(shard_tasks).await;
    Ok(())
}
