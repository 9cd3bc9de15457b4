//! The bounded join store: records under their active deadline plus a short
//! lived buffer for events that outran their auction.

use crate::domain::record::Record;
use chrono::{DateTime, Utc};
use model::{events::DeliveryEvent, ids::AuctionId};
use shared::timeout_map::TimeoutMap;

pub struct JoinStore {
    records: TimeoutMap<AuctionId, Record>,
    early: TimeoutMap<AuctionId, Vec<DeliveryEvent>>,
    /// Per-list cap so one auction id cannot eat the buffer.
    early_events_per_auction: usize,
}

impl JoinStore {
    pub fn new(capacity: usize, early_capacity: usize) -> Self {
        Self {
            records: TimeoutMap::bounded(capacity),
            early: TimeoutMap::bounded(early_capacity),
            early_events_per_auction: 16,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn contains(&self, id: &AuctionId) -> bool {
        self.records.contains_key(id)
    }

    pub fn get(&self, id: &AuctionId) -> Option<&Record> {
        self.records.get(id)
    }

    /// In-place mutation that leaves the entry's deadline untouched.
    pub fn get_mut(&mut self, id: &AuctionId) -> Option<&mut Record> {
        self.records.get_mut(id)
    }

    /// Inserts a record under its deadline, returning the record evicted by
    /// the capacity bound if the store was full.
    pub fn insert(
        &mut self,
        id: AuctionId,
        record: Record,
        deadline: DateTime<Utc>,
    ) -> Option<Record> {
        self.records
            .insert(id, record, deadline)
            .map(|(_, evicted)| evicted)
    }

    /// Takes the record out for a phase transition; the caller re-inserts it
    /// under its next deadline.
    pub fn remove(&mut self, id: &AuctionId) -> Option<Record> {
        self.records.remove(id)
    }

    /// Stashes an event that arrived before its auction's handoff.
    pub fn buffer(&mut self, event: DeliveryEvent, deadline: DateTime<Utc>) -> BufferOutcome {
        if let Some(list) = self.early.get_mut(&event.auction) {
            if list.len() >= self.early_events_per_auction {
                return BufferOutcome::Overflow;
            }
            list.push(event);
            return BufferOutcome::Buffered;
        }
        let id = event.auction.clone();
        match self.early.insert(id, vec![event], deadline) {
            Some(_) => BufferOutcome::Displaced,
            None => BufferOutcome::Buffered,
        }
    }

    /// Removes and returns all buffered events for an auction, in arrival
    /// order.
    pub fn take_buffered(&mut self, id: &AuctionId) -> Vec<DeliveryEvent> {
        self.early.remove(id).unwrap_or_default()
    }

    pub fn expire_records(&mut self, now: DateTime<Utc>) -> Vec<(AuctionId, Record)> {
        self.records.expire(now)
    }

    pub fn expire_buffered(&mut self, now: DateTime<Utc>) -> Vec<(AuctionId, Vec<DeliveryEvent>)> {
        self.early.expire(now)
    }

    /// Earliest deadline across records and the early buffer.
    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        match (self.records.next_deadline(), self.early.next_deadline()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

/// What happened to a buffered event.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum BufferOutcome {
    Buffered,
    /// Buffered, but the bound displaced another auction's events.
    Displaced,
    /// Dropped: this auction already holds its maximum of early events.
    Overflow,
}
