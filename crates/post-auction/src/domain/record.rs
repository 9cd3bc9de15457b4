//! Joinable state retained per won auction.

use model::{events::DeliveryEvent, events::Submission, money::Amount};
use shared::banker::Reservation;

/// Where a record stands in the win/delivery lifecycle.
#[derive(Clone, Debug, PartialEq)]
pub enum Phase {
    /// Waiting for the exchange's win notification.
    AwaitingWin,
    /// Win confirmed; waiting for delivery events.
    Delivering {
        win_price: Amount,
        pending_impression: bool,
        pending_click: bool,
    },
    /// Loss inferred at the auction timeout. Retained briefly so a late win
    /// can still be classified and force-committed.
    Lost,
}

/// One auction's retained post-auction state.
pub struct Record {
    pub submission: Submission,
    pub phase: Phase,
    /// The pre-authorization taken at insert, committed on win and rolled
    /// back on loss.
    pub reservation: Option<Reservation>,
    /// Delivery events that arrived before the win notification; replayed in
    /// order once the win lands so emission stays causal.
    pub stashed: Vec<DeliveryEvent>,
}

impl Record {
    pub fn new(submission: Submission, reservation: Option<Reservation>) -> Self {
        Self {
            submission,
            phase: Phase::AwaitingWin,
            reservation,
            stashed: Vec::new(),
        }
    }

    /// True once the record has nothing left to wait for.
    pub fn is_complete(&self) -> bool {
        matches!(
            self.phase,
            Phase::Delivering {
                pending_impression: false,
                pending_click: false,
                ..
            }
        )
    }
}
