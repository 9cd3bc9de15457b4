//! The sharded post-auction service.
//!
//! Auction ids hash to one of N independent shards; each shard owns its join
//! store and timers outright, so no state is ever shared across shards and
//! no ordering is promised across them.

use crate::domain::matcher::{Matcher, MatcherConfig};
use chrono::Utc;
use model::{
    events::{DeliveryEvent, MatchedEvent, Submission},
    hash::stable_hash,
};
use shared::{banker::Banker, outbox};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

const SHARD_QUEUE: usize = 4096;

pub enum Command {
    Submission(Submission),
    Event(DeliveryEvent),
}

/// Ingress handle: the router handoff and the adserver connector both feed
/// through this.
#[derive(Clone)]
pub struct Service {
    shards: Vec<mpsc::Sender<Command>>,
}

impl Service {
    /// Spawns `shards` independent matcher tasks.
    pub fn start(
        shards: usize,
        config: MatcherConfig,
        banker: Arc<dyn Banker>,
        emitted: outbox::Sender<MatchedEvent>,
    ) -> (Self, Vec<JoinHandle<()>>) {
        let shards = shards.max(1);
        let mut senders = Vec::with_capacity(shards);
        let mut tasks = Vec::with_capacity(shards);
        for _ in 0..shards {
            let (tx, rx) = mpsc::channel(SHARD_QUEUE);
            let matcher = Matcher::new(config.clone(), banker.clone(), emitted.clone());
            senders.push(tx);
            tasks.push(tokio::spawn(run_shard(matcher, rx)));
        }
        (Self { shards: senders }, tasks)
    }

    pub async fn submit(&self, submission: Submission) {
        let shard = self.shard_of(submission.auction.as_str());
        if self.shards[shard]
            .send(Command::Submission(submission))
            .await
            .is_err()
        {
            tracing::warn!(shard, "post-auction shard is gone");
        }
    }

    pub async fn on_event(&self, event: DeliveryEvent) {
        let shard = self.shard_of(event.auction.as_str());
        if self.shards[shard].send(Command::Event(event)).await.is_err() {
            tracing::warn!(shard, "post-auction shard is gone");
        }
    }

    fn shard_of(&self, key: &str) -> usize {
        (stable_hash(key) % self.shards.len() as u64) as usize
    }
}

async fn run_shard(mut matcher: Matcher, mut inbox: mpsc::Receiver<Command>) {
    loop {
        let next = matcher.next_deadline();
        let sleep = match next {
            Some(deadline) => (deadline - Utc::now())
                .to_std()
                .unwrap_or(std::time::Duration::ZERO),
            None => std::time::Duration::from_secs(3600),
        };
        tokio::select! {
            command = inbox.recv() => match command {
                Some(Command::Submission(submission)) => {
                    matcher.on_submission(submission, Utc::now()).await
                }
                Some(Command::Event(event)) => matcher.on_event(event, Utc::now()).await,
                None => break,
            },
            _ = tokio::time::sleep(sleep), if next.is_some() => {
                matcher.advance(Utc::now()).await;
            }
        }
    }

    // Shutdown: new events are already rejected (the inbox is closed);
    // resident records run out their natural timeouts.
    tracing::info!(records = matcher.records(), "draining post-auction shard");
    while let Some(deadline) = matcher.next_deadline() {
        let wait = (deadline - Utc::now())
            .to_std()
            .unwrap_or(std::time::Duration::ZERO);
        tokio::time::sleep(wait).await;
        matcher.advance(Utc::now()).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use model::{
        agent::ResultVerbosity,
        events::{DeliveryKind, MatchedKind},
        ids::{AccountId, AgentId, CreativeId},
        money::Amount,
    };
    use shared::banker::InMemoryBanker;

    fn submission(id: &str) -> Submission {
        Submission {
            auction: id.into(),
            spot_id: "0".to_owned(),
            agent: AgentId::from("a"),
            account: AccountId::parse("campaign:a").unwrap(),
            creative: CreativeId(1),
            clear_price: Amount::usd_micros(3_001),
            resolved_at: Utc::now(),
            loss_timeout: Utc::now() + chrono::Duration::seconds(15),
            win_format: ResultVerbosity::Lightweight,
            loss_format: ResultVerbosity::Lightweight,
            request: None,
        }
    }

    #[tokio::test]
    async fn events_land_on_the_shard_owning_their_auction() {
        let banker = Arc::new(InMemoryBanker::new());
        banker.top_up(
            &AccountId::parse("campaign:a").unwrap(),
            Amount::usd_micros(1_000_000),
        );
        let (tx, mut emitted) = outbox::channel(64);
        let (service, tasks) = Service::start(4, MatcherConfig::default(), banker, tx);

        for id in ["s-1", "s-2", "s-3"] {
            service.submit(submission(id)).await;
            service
                .on_event(DeliveryEvent {
                    auction: id.into(),
                    kind: DeliveryKind::Win,
                    timestamp: Utc::now(),
                    win_price: None,
                    user_tag: None,
                })
                .await;
        }

        let mut wins = 0;
        for _ in 0..3 {
            let event = emitted.recv().await.unwrap();
            assert_eq!(event.kind, MatchedKind::Win);
            wins += 1;
        }
        assert_eq!(wins, 3);

        drop(service);
        for task in tasks {
            task.abort();
        }
    }
}
