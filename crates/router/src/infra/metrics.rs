//! Router metrics.

use prometheus::{
    core::{AtomicF64, GenericCounter},
    IntCounter, IntCounterVec, IntGauge,
};

#[derive(prometheus_metric_storage::MetricStorage)]
#[metric(subsystem = "router")]
pub struct Metrics {
    /// Auctions received, by exchange.
    #[metric(labels("exchange"))]
    pub auctions: IntCounterVec,

    /// Agents rejected by the static filter pipeline, by first failing stage.
    #[metric(labels("reason"))]
    pub filter_rejections: IntCounterVec,

    /// Agents skipped by the dynamic pre-dispatch checks.
    #[metric(labels("reason"))]
    pub skipped_agents: IntCounterVec,

    /// Bid responses dropped before resolution, by cause.
    #[metric(labels("reason"))]
    pub dropped_bids: IntCounterVec,

    /// Bids clipped to the router wide maximum price.
    pub clipped_bids: IntCounter,

    /// Auctions resolved with a winning bid.
    pub resolved_auctions: IntCounter,
    /// Auctions that timed out without resolving.
    pub expired_auctions: IntCounter,

    /// Auctions that never found an eligible agent.
    pub no_potential_bidders: IntCounter,

    /// Dispatches refused by the slow mode money cap.
    pub slow_mode_skips: IntCounter,

    /// Winners demoted after a failed budget commit.
    pub demoted_winners: IntCounter,

    /// Resolutions abandoned because the banker was unreachable.
    pub banker_unavailable: IntCounter,

    /// Post-auction submissions lost to the bounded handoff queue.
    pub submission_drops: IntCounter,

    /// Downstream events lost to the bounded outbound queue.
    pub event_drops: IntCounter,

    /// Spend committed at resolution time, in micros.
    pub committed_micros: GenericCounter<AtomicF64>,

    /// Auctions currently collecting bids in this process.
    pub open_auctions: IntGauge,
}

pub fn metrics() -> &'static Metrics {
    Metrics::instance(observe::metrics::get_storage_registry()).unwrap()
}
