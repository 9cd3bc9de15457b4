//! Health monitor feeding the engine's slow mode.
//!
//! A periodic check publishes the current health on a watch channel; every
//! shard holds a receiver and consults the latest value at dispatch time.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::{sync::Arc, time::Duration};
use tokio::sync::watch;

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct MonitorStatus {
    pub healthy: bool,
    /// When the current healthy/unhealthy streak started.
    pub since: DateTime<Utc>,
}

impl MonitorStatus {
    pub fn healthy(now: DateTime<Utc>) -> Self {
        Self {
            healthy: true,
            since: now,
        }
    }

    pub fn unhealthy(now: DateTime<Utc>) -> Self {
        Self {
            healthy: false,
            since: now,
        }
    }
}

/// Creates a status channel primed healthy, for wiring and tests.
pub fn channel(now: DateTime<Utc>) -> (watch::Sender<MonitorStatus>, watch::Receiver<MonitorStatus>) {
    watch::channel(MonitorStatus::healthy(now))
}

#[async_trait]
pub trait HealthCheck: Send + Sync {
    async fn is_healthy(&self) -> bool;
}

/// Polls the check every `interval` and publishes streak transitions.
/// Recovery is observed on the first healthy check.
pub fn spawn(
    check: Arc<dyn HealthCheck>,
    interval: Duration,
) -> watch::Receiver<MonitorStatus> {
    let (sender, receiver) = channel(Utc::now());
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let healthy = check.is_healthy().await;
            let now = Utc::now();
            let previous = *sender.borrow();
            if previous.healthy != healthy {
                tracing::info!(healthy, "monitor status changed");
                if sender
                    .send(MonitorStatus {
                        healthy,
                        since: now,
                    })
                    .is_err()
                {
                    break;
                }
            }
        }
    });
    receiver
}
