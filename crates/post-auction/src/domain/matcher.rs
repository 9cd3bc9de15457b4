//! Correlation of delayed win and delivery events with their auctions.
//!
//! The matcher joins three streams: submissions handed off by the router,
//! win notifications, and delivery events. Events may arrive before their
//! auction in pathological races, so unmatched events sit in a short lived
//! buffer and are replayed once the handoff lands. Emission per auction is
//! causal: win before impression before click, each at most once.

use crate::{
    domain::{
        record::{Phase, Record},
        store::{BufferOutcome, JoinStore},
    },
    infra::metrics::metrics,
};
use chrono::{DateTime, Utc};
use model::{
    events::{DeliveryEvent, DeliveryKind, MatchedEvent, MatchedKind, Submission},
    agent::ResultVerbosity,
    money::Amount,
};
use shared::{banker::Banker, banker::BankerError, outbox};
use std::sync::Arc;

#[derive(Clone, Debug)]
pub struct MatcherConfig {
    /// Fallback wait for a win when a submission carries no usable timeout.
    pub auction_timeout: chrono::Duration,
    /// How long after a win delivery events are still awaited.
    pub win_timeout: chrono::Duration,
    /// Grace window for events that precede their auction's handoff.
    pub early_ttl: chrono::Duration,
    /// Per-shard record capacity.
    pub capacity: usize,
}

impl Default for MatcherConfig {
    fn default() -> Self {
        Self {
            auction_timeout: chrono::Duration::seconds(15),
            win_timeout: chrono::Duration::seconds(3600),
            early_ttl: chrono::Duration::seconds(2),
            capacity: 1 << 20,
        }
    }
}

pub struct Matcher {
    config: MatcherConfig,
    store: JoinStore,
    banker: Arc<dyn Banker>,
    emitted: outbox::Sender<MatchedEvent>,
}

impl Matcher {
    pub fn new(
        config: MatcherConfig,
        banker: Arc<dyn Banker>,
        emitted: outbox::Sender<MatchedEvent>,
    ) -> Self {
        let store = JoinStore::new(config.capacity, config.capacity);
        Self {
            config,
            store,
            banker,
            emitted,
        }
    }

    pub fn records(&self) -> usize {
        self.store.len()
    }

    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.store.next_deadline()
    }

    /// A resolved auction handed off by the router.
    pub async fn on_submission(&mut self, submission: Submission, now: DateTime<Utc>) {
        metrics().submissions.inc();
        if self.store.contains(&submission.auction) {
            metrics().duplicate_submissions.inc();
            return;
        }

        // Pre-authorize the expected spend; the win confirms or the timeout
        // rolls it back.
        let reservation = match self
            .banker
            .authorize(&submission.account, submission.clear_price)
            .await
        {
            Ok(reservation) => Some(reservation),
            Err(err) => {
                tracing::debug!(auction = %submission.auction, %err, "pre-authorization failed");
                metrics().preauth_failures.inc();
                None
            }
        };

        let id = submission.auction.clone();
        let deadline = if submission.loss_timeout > now {
            submission.loss_timeout
        } else {
            now + self.config.auction_timeout
        };
        let record = Record::new(submission, reservation);
        if let Some(evicted) = self.store.insert(id.clone(), record, deadline) {
            metrics().evicted_records.inc();
            if let Some(reservation) = evicted.reservation {
                let _ = self.banker.rollback(&reservation).await;
            }
        }
        metrics().store_size.set(self.store.len() as i64);

        // Replay anything that outran the handoff.
        for event in self.store.take_buffered(&id) {
            self.apply_event(event, now).await;
        }
    }

    /// A win or delivery event from the adserver ingress.
    pub async fn on_event(&mut self, event: DeliveryEvent, now: DateTime<Utc>) {
        metrics()
            .events
            .with_label_values(&[kind_label(event.kind)])
            .inc();

        if !self.store.contains(&event.auction) {
            match self.store.buffer(event, now + self.config.early_ttl) {
                BufferOutcome::Buffered => metrics().buffered_events.inc(),
                BufferOutcome::Displaced => {
                    metrics().buffered_events.inc();
                    metrics().orphaned_events.inc();
                }
                BufferOutcome::Overflow => metrics().orphaned_events.inc(),
            }
            return;
        }
        self.apply_event(event, now).await;
    }

    /// Fires every deadline due at `now`: loss inference for auctions whose
    /// win never came, cleanup for wins whose delivery never came, and the
    /// early buffer's TTL.
    pub async fn advance(&mut self, now: DateTime<Utc>) {
        for (id, mut record) in self.store.expire_records(now) {
            match record.phase {
                Phase::AwaitingWin => {
                    metrics().losses_inferred.inc();
                    if let Some(reservation) = record.reservation.take() {
                        let _ = self.banker.rollback(&reservation).await;
                    }
                    if record.submission.loss_format != ResultVerbosity::None {
                        self.emit(&record, MatchedKind::Loss, None, now);
                    }
                    // Keep the shell around so a late win can still be
                    // classified instead of surfacing as an orphan.
                    record.phase = Phase::Lost;
                    record.stashed.clear();
                    self.store
                        .insert(id, record, now + self.config.win_timeout);
                }
                Phase::Delivering {
                    pending_impression: true,
                    pending_click: true,
                    ..
                } => {
                    metrics().no_delivery.inc();
                    self.emit(&record, MatchedKind::NoDelivery, None, now);
                }
                // Partially delivered or a closed loss: quiet expiry.
                Phase::Delivering { .. } | Phase::Lost => {}
            }
        }

        for (id, events) in self.store.expire_buffered(now) {
            tracing::debug!(auction = %id, count = events.len(), "buffered events expired unmatched");
            for _ in events {
                metrics().orphaned_events.inc();
            }
        }
        metrics().store_size.set(self.store.len() as i64);
    }

    async fn apply_event(&mut self, event: DeliveryEvent, now: DateTime<Utc>) {
        match event.kind {
            DeliveryKind::Win => self.apply_win(event, now).await,
            DeliveryKind::Impression | DeliveryKind::Click => {
                self.apply_delivery(event, now).await
            }
        }
    }

    async fn apply_win(&mut self, event: DeliveryEvent, now: DateTime<Utc>) {
        let id = event.auction.clone();
        let phase = match self.store.get(&id) {
            None => return,
            Some(record) => record.phase.clone(),
        };

        // Duplicates leave the record, and its deadline, alone.
        if let Phase::Delivering { win_price, .. } = phase {
            if event.win_price.map(|p| p == win_price).unwrap_or(true) {
                metrics().duplicate_wins.inc();
            } else {
                metrics().duplicate_wins_price_changed.inc();
            }
            return;
        }

        let mut record = self.store.remove(&id).expect("record was just looked up");
        let price = event.win_price.unwrap_or(record.submission.clear_price);
        match phase {
            Phase::AwaitingWin => {
                // The notification's price is authoritative; the clearing
                // price was only our expectation.
                if let Some(reservation) = record.reservation.take() {
                    if let Err(err) = self.banker.commit(&reservation, price).await {
                        tracing::warn!(auction = %id, %err, "win commit failed");
                        metrics().commit_failures.inc();
                    }
                    // Release whatever the pre-authorization still holds.
                    let _ = self.banker.rollback(&reservation).await;
                }
                self.emit(&record, MatchedKind::Win, Some(price), now);
            }
            Phase::Lost => {
                // The loss was already inferred and rolled back; charge the
                // confirmed spend and let delivery events through.
                metrics().late_wins.inc();
                match self.banker.authorize(&record.submission.account, price).await {
                    Ok(reservation) => {
                        if self.banker.commit(&reservation, price).await.is_err() {
                            metrics().commit_failures.inc();
                        }
                    }
                    Err(BankerError::Insufficient | BankerError::Unavailable) => {
                        metrics().commit_failures.inc();
                    }
                }
                self.emit(&record, MatchedKind::LateWin, Some(price), now);
            }
            Phase::Delivering { .. } => unreachable!("handled above"),
        }

        record.phase = Phase::Delivering {
            win_price: price,
            pending_impression: true,
            pending_click: true,
        };
        let stashed = std::mem::take(&mut record.stashed);
        self.store.insert(id, record, now + self.config.win_timeout);
        for event in stashed {
            // Replays preserve arrival order, keeping emission causal.
            Box::pin(self.apply_event(event, now)).await;
        }
    }

    async fn apply_delivery(&mut self, event: DeliveryEvent, now: DateTime<Utc>) {
        let id = event.auction.clone();
        let kind = event.kind;
        let emitted_kind = {
            let Some(record) = self.store.get_mut(&id) else {
                return;
            };
            match &mut record.phase {
                Phase::AwaitingWin => {
                    // Delivery outran the win; hold it so the win still
                    // emits first.
                    record.stashed.push(event);
                    None
                }
                Phase::Delivering {
                    pending_impression,
                    pending_click,
                    ..
                } => {
                    let (pending, matched) = match kind {
                        DeliveryKind::Impression => (pending_impression, MatchedKind::Impression),
                        DeliveryKind::Click => (pending_click, MatchedKind::Click),
                        DeliveryKind::Win => unreachable!("wins take the win path"),
                    };
                    if *pending {
                        *pending = false;
                        Some(matched)
                    } else {
                        metrics()
                            .duplicate_events
                            .with_label_values(&[kind_label(kind)])
                            .inc();
                        None
                    }
                }
                Phase::Lost => {
                    metrics().orphaned_events.inc();
                    None
                }
            }
        };

        if let Some(matched) = emitted_kind {
            let complete = {
                let record = self.store.get(&id).expect("record is resident");
                self.emit(record, matched, None, now);
                record.is_complete()
            };
            if complete {
                // Terminal: both delivery events seen.
                self.store.remove(&id);
                metrics().store_size.set(self.store.len() as i64);
            }
        }
    }

    fn emit(
        &self,
        record: &Record,
        kind: MatchedKind,
        price: Option<Amount>,
        now: DateTime<Utc>,
    ) {
        let submission = &record.submission;
        let verbosity = match kind {
            MatchedKind::Loss => submission.loss_format,
            _ => submission.win_format,
        };
        let event = MatchedEvent {
            auction: submission.auction.clone(),
            kind,
            agent: submission.agent.clone(),
            account: submission.account.clone(),
            creative: submission.creative,
            price,
            timestamp: now,
            verbosity,
            request: (verbosity == ResultVerbosity::Full)
                .then(|| submission.request.clone())
                .flatten(),
        };
        metrics()
            .emitted
            .with_label_values(&[matched_label(kind)])
            .inc();
        if self.emitted.send(event).is_some() {
            metrics().emission_drops.inc();
        }
    }
}

fn kind_label(kind: DeliveryKind) -> &'static str {
    match kind {
        DeliveryKind::Win => "win",
        DeliveryKind::Impression => "impression",
        DeliveryKind::Click => "click",
    }
}

fn matched_label(kind: MatchedKind) -> &'static str {
    match kind {
        MatchedKind::Win => "win",
        MatchedKind::LateWin => "late-win",
        MatchedKind::Loss => "loss",
        MatchedKind::Impression => "impression",
        MatchedKind::Click => "click",
        MatchedKind::NoDelivery => "no-delivery",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use model::ids::{AccountId, AgentId, CreativeId};
    use shared::banker::InMemoryBanker;

    struct Harness {
        matcher: Matcher,
        emitted: outbox::Receiver<MatchedEvent>,
        banker: Arc<InMemoryBanker>,
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2022, 6, 15, 14, 0, 0).unwrap()
    }

    fn harness(config: MatcherConfig) -> Harness {
        let banker = Arc::new(InMemoryBanker::new());
        banker.top_up(&account(), Amount::usd_micros(1_000_000));
        let (tx, emitted) = outbox::channel(64);
        Harness {
            matcher: Matcher::new(config, banker.clone(), tx),
            emitted,
            banker,
        }
    }

    fn account() -> AccountId {
        AccountId::parse("campaign:a").unwrap()
    }

    fn submission(id: &str) -> Submission {
        Submission {
            auction: id.into(),
            spot_id: "0".to_owned(),
            agent: AgentId::from("a"),
            account: account(),
            creative: CreativeId(1),
            clear_price: Amount::usd_micros(3_001),
            resolved_at: now(),
            loss_timeout: now() + chrono::Duration::seconds(15),
            win_format: ResultVerbosity::Lightweight,
            loss_format: ResultVerbosity::Lightweight,
            request: None,
        }
    }

    fn event(id: &str, kind: DeliveryKind) -> DeliveryEvent {
        DeliveryEvent {
            auction: id.into(),
            kind,
            timestamp: now(),
            win_price: (kind == DeliveryKind::Win).then(|| Amount::usd_micros(2_900)),
            user_tag: None,
        }
    }

    fn kinds(emitted: &mut outbox::Receiver<MatchedEvent>) -> Vec<MatchedKind> {
        let mut kinds = Vec::new();
        while let Some(event) = emitted.try_recv() {
            kinds.push(event.kind);
        }
        kinds
    }

    #[tokio::test]
    async fn win_then_delivery_in_causal_order() {
        let mut h = harness(MatcherConfig::default());
        h.matcher.on_submission(submission("r1"), now()).await;
        h.matcher.on_event(event("r1", DeliveryKind::Win), now()).await;
        h.matcher
            .on_event(event("r1", DeliveryKind::Impression), now())
            .await;
        h.matcher
            .on_event(event("r1", DeliveryKind::Click), now())
            .await;

        assert_eq!(
            kinds(&mut h.emitted),
            vec![MatchedKind::Win, MatchedKind::Impression, MatchedKind::Click]
        );
        // The win price, not the expected clearing price, was committed.
        assert_eq!(h.banker.committed(&account()), 2_900);
        // Both delivery events seen: the record is gone.
        assert_eq!(h.matcher.records(), 0);
    }

    #[tokio::test]
    async fn early_win_is_buffered_and_replayed() {
        // S5: the win outruns the handoff by a second.
        let mut h = harness(MatcherConfig::default());
        h.matcher.on_event(event("r5", DeliveryKind::Win), now()).await;
        assert!(kinds(&mut h.emitted).is_empty());

        h.matcher
            .on_submission(submission("r5"), now() + chrono::Duration::seconds(1))
            .await;
        assert_eq!(kinds(&mut h.emitted), vec![MatchedKind::Win]);
        assert_eq!(h.banker.committed(&account()), 2_900);
    }

    #[tokio::test]
    async fn buffered_events_expire_as_orphans() {
        let mut h = harness(MatcherConfig::default());
        h.matcher.on_event(event("rx", DeliveryKind::Win), now()).await;
        h.matcher
            .advance(now() + chrono::Duration::seconds(3))
            .await;
        // No emission, no record; the handoff never arrived.
        assert!(kinds(&mut h.emitted).is_empty());
        assert_eq!(h.matcher.records(), 0);
        h.matcher
            .on_submission(submission("rx"), now() + chrono::Duration::seconds(4))
            .await;
        // The buffered win is gone, so the submission just waits.
        assert!(kinds(&mut h.emitted).is_empty());
    }

    #[tokio::test]
    async fn loss_inferred_at_the_auction_timeout() {
        // S6: no win notification within loss_timeout.
        let mut h = harness(MatcherConfig::default());
        h.matcher.on_submission(submission("r6"), now()).await;
        assert_eq!(h.banker.available(&account()), 1_000_000 - 3_001);

        h.matcher
            .advance(now() + chrono::Duration::seconds(15))
            .await;
        assert_eq!(kinds(&mut h.emitted), vec![MatchedKind::Loss]);
        // The pre-authorization was rolled back in full.
        assert_eq!(h.banker.available(&account()), 1_000_000);
        assert_eq!(h.banker.committed(&account()), 0);
    }

    #[tokio::test]
    async fn silent_loss_when_the_agent_asked_for_none() {
        let mut h = harness(MatcherConfig::default());
        let mut submission = submission("r7");
        submission.loss_format = ResultVerbosity::None;
        h.matcher.on_submission(submission, now()).await;
        h.matcher
            .advance(now() + chrono::Duration::seconds(15))
            .await;
        assert!(kinds(&mut h.emitted).is_empty());
    }

    #[tokio::test]
    async fn late_win_after_inferred_loss() {
        let mut h = harness(MatcherConfig::default());
        h.matcher.on_submission(submission("r8"), now()).await;
        h.matcher
            .advance(now() + chrono::Duration::seconds(15))
            .await;
        assert_eq!(kinds(&mut h.emitted), vec![MatchedKind::Loss]);

        h.matcher
            .on_event(
                event("r8", DeliveryKind::Win),
                now() + chrono::Duration::seconds(20),
            )
            .await;
        assert_eq!(kinds(&mut h.emitted), vec![MatchedKind::LateWin]);
        // The late win was force-committed.
        assert_eq!(h.banker.committed(&account()), 2_900);
    }

    #[tokio::test]
    async fn duplicates_are_suppressed() {
        // P7: at most one win, one impression, one click.
        let mut h = harness(MatcherConfig::default());
        h.matcher.on_submission(submission("r9"), now()).await;
        for _ in 0..2 {
            h.matcher.on_event(event("r9", DeliveryKind::Win), now()).await;
        }
        for _ in 0..2 {
            h.matcher
                .on_event(event("r9", DeliveryKind::Impression), now())
                .await;
        }
        assert_eq!(
            kinds(&mut h.emitted),
            vec![MatchedKind::Win, MatchedKind::Impression]
        );
        // One commit only.
        assert_eq!(h.banker.committed(&account()), 2_900);
    }

    #[tokio::test]
    async fn impression_before_win_stays_causal() {
        let mut h = harness(MatcherConfig::default());
        h.matcher.on_submission(submission("r10"), now()).await;
        h.matcher
            .on_event(event("r10", DeliveryKind::Impression), now())
            .await;
        assert!(kinds(&mut h.emitted).is_empty());

        h.matcher.on_event(event("r10", DeliveryKind::Win), now()).await;
        assert_eq!(
            kinds(&mut h.emitted),
            vec![MatchedKind::Win, MatchedKind::Impression]
        );
    }

    #[tokio::test]
    async fn no_delivery_when_the_win_is_never_followed_up() {
        let mut h = harness(MatcherConfig {
            win_timeout: chrono::Duration::seconds(60),
            ..MatcherConfig::default()
        });
        h.matcher.on_submission(submission("r11"), now()).await;
        h.matcher.on_event(event("r11", DeliveryKind::Win), now()).await;
        assert_eq!(kinds(&mut h.emitted), vec![MatchedKind::Win]);

        h.matcher
            .advance(now() + chrono::Duration::seconds(60))
            .await;
        assert_eq!(kinds(&mut h.emitted), vec![MatchedKind::NoDelivery]);
        assert_eq!(h.matcher.records(), 0);
    }

    #[tokio::test]
    async fn capacity_bound_evicts_the_oldest_record() {
        let mut h = harness(MatcherConfig {
            capacity: 2,
            ..MatcherConfig::default()
        });
        h.matcher.on_submission(submission("a"), now()).await;
        h.matcher.on_submission(submission("b"), now()).await;
        h.matcher.on_submission(submission("c"), now()).await;
        assert_eq!(h.matcher.records(), 2);
        // The evicted record's pre-authorization was released.
        assert_eq!(h.banker.available(&account()), 1_000_000 - 2 * 3_001);

        // Events for the evicted auction are strangers now.
        h.matcher.on_event(event("a", DeliveryKind::Win), now()).await;
        assert!(kinds(&mut h.emitted).is_empty());
    }

    #[tokio::test]
    async fn duplicate_submissions_are_ignored() {
        let mut h = harness(MatcherConfig::default());
        h.matcher.on_submission(submission("r12"), now()).await;
        h.matcher.on_submission(submission("r12"), now()).await;
        assert_eq!(h.matcher.records(), 1);
        // Only one pre-authorization was taken.
        assert_eq!(h.banker.available(&account()), 1_000_000 - 3_001);
    }
}
