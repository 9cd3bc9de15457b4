//! Post-auction metrics.

use prometheus::{IntCounter, IntCounterVec, IntGauge};

#[derive(prometheus_metric_storage::MetricStorage)]
#[metric(subsystem = "post_auction")]
pub struct Metrics {
    /// Resolved auctions received from the router.
    pub submissions: IntCounter,

    /// Submissions ignored because a record already existed.
    pub duplicate_submissions: IntCounter,

    /// Adserver events received, by kind.
    #[metric(labels("kind"))]
    pub events: IntCounterVec,

    /// Reconciled events emitted downstream, by kind.
    #[metric(labels("kind"))]
    pub emitted: IntCounterVec,

    /// Win notifications repeating an already confirmed win.
    pub duplicate_wins: IntCounter,
    /// Same, but carrying a different price than the first one.
    pub duplicate_wins_price_changed: IntCounter,

    /// Delivery events repeating an already emitted kind.
    #[metric(labels("kind"))]
    pub duplicate_events: IntCounterVec,

    /// Events held in the early buffer awaiting their auction.
    pub buffered_events: IntCounter,

    /// Buffered events whose auction never arrived, and events for auctions
    /// in a state that cannot accept them.
    pub orphaned_events: IntCounter,

    /// Records evicted by the per-shard capacity bound.
    pub evicted_records: IntCounter,

    /// Losses inferred at the auction timeout.
    pub losses_inferred: IntCounter,

    /// Wins confirmed after a loss had been inferred.
    pub late_wins: IntCounter,

    /// Wins confirmed but never followed by a delivery event.
    pub no_delivery: IntCounter,

    /// Pre-authorizations refused at record insert.
    pub preauth_failures: IntCounter,

    /// Spend commits refused by the banker.
    pub commit_failures: IntCounter,

    /// Downstream emissions lost to the bounded queue.
    pub emission_drops: IntCounter,

    /// Records currently resident, summed across shards.
    pub store_size: IntGauge,
}

pub fn metrics() -> &'static Metrics {
    Metrics::instance(observe::metrics::get_storage_registry()).unwrap()
}
