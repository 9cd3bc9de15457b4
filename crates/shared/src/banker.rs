//! Budget authorization client.
//!
//! The router and the post-auction service each hold their own client, the
//! way they would each hold a slave session against the remote banker. Spend
//! is authorized in amortized slices per account and committed against the
//! slices. The in-memory implementation backs tests and single-process
//! deployments.

use async_trait::async_trait;
use model::{ids::AccountId, money::Amount};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use thiserror::Error;

/// Handle for an authorized slice of budget.
#[derive(Clone, Debug)]
pub struct Reservation {
    pub id: u64,
    pub account: AccountId,
    pub amount: Amount,
}

#[derive(Clone, Copy, Debug, Error, PartialEq)]
pub enum BankerError {
    #[error("insufficient balance")]
    Insufficient,
    #[error("banker unavailable")]
    Unavailable,
}

#[async_trait]
pub trait Banker: Send + Sync {
    /// Reserves `amount` against the account's balance.
    async fn authorize(&self, account: &AccountId, amount: Amount)
        -> Result<Reservation, BankerError>;

    /// Consumes `actual` out of the reservation as committed spend.
    async fn commit(&self, reservation: &Reservation, actual: Amount) -> Result<(), BankerError>;

    /// Releases whatever the reservation has left.
    async fn rollback(&self, reservation: &Reservation) -> Result<(), BankerError>;
}

#[derive(Default)]
struct AccountState {
    available: i64,
    committed: i64,
    rolled_back: i64,
}

/// In-memory banker with per-account balances.
#[derive(Default)]
pub struct InMemoryBanker {
    accounts: Mutex<HashMap<String, AccountState>>,
    /// Remaining micros per open reservation.
    reservations: Mutex<HashMap<u64, (String, i64)>>,
    next_id: AtomicU64,
}

impl InMemoryBanker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Funds the top level account the given number of micros.
    pub fn top_up(&self, account: &AccountId, amount: Amount) {
        let mut accounts = self.accounts.lock().unwrap();
        accounts
            .entry(account.parent().to_owned())
            .or_default()
            .available += amount.micros;
    }

    pub fn committed(&self, account: &AccountId) -> i64 {
        let accounts = self.accounts.lock().unwrap();
        accounts
            .get(account.parent())
            .map(|state| state.committed)
            .unwrap_or(0)
    }

    pub fn available(&self, account: &AccountId) -> i64 {
        let accounts = self.accounts.lock().unwrap();
        accounts
            .get(account.parent())
            .map(|state| state.available)
            .unwrap_or(0)
    }

    pub fn rolled_back(&self, account: &AccountId) -> i64 {
        let accounts = self.accounts.lock().unwrap();
        accounts
            .get(account.parent())
            .map(|state| state.rolled_back)
            .unwrap_or(0)
    }
}

#[async_trait]
impl Banker for InMemoryBanker {
    async fn authorize(
        &self,
        account: &AccountId,
        amount: Amount,
    ) -> Result<Reservation, BankerError> {
        let mut accounts = self.accounts.lock().unwrap();
        let state = accounts.entry(account.parent().to_owned()).or_default();
        if state.available < amount.micros {
            return Err(BankerError::Insufficient);
        }
        state.available -= amount.micros;
        drop(accounts);

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.reservations
            .lock()
            .unwrap()
            .insert(id, (account.parent().to_owned(), amount.micros));
        Ok(Reservation {
            id,
            account: account.clone(),
            amount,
        })
    }

    async fn commit(&self, reservation: &Reservation, actual: Amount) -> Result<(), BankerError> {
        let mut reservations = self.reservations.lock().unwrap();
        let (parent, remaining) = reservations
            .get_mut(&reservation.id)
            .ok_or(BankerError::Insufficient)?;
        if *remaining < actual.micros {
            return Err(BankerError::Insufficient);
        }
        *remaining -= actual.micros;
        let parent = parent.clone();
        drop(reservations);

        let mut accounts = self.accounts.lock().unwrap();
        accounts.entry(parent).or_default().committed += actual.micros;
        Ok(())
    }

    async fn rollback(&self, reservation: &Reservation) -> Result<(), BankerError> {
        let Some((parent, remaining)) = self
            .reservations
            .lock()
            .unwrap()
            .remove(&reservation.id)
        else {
            return Ok(());
        };
        let mut accounts = self.accounts.lock().unwrap();
        let state = accounts.entry(parent).or_default();
        state.available += remaining;
        state.rolled_back += remaining;
        Ok(())
    }
}

/// A banker that refuses everything, for exercising unavailability paths.
pub struct UnavailableBanker;

#[async_trait]
impl Banker for UnavailableBanker {
    async fn authorize(&self, _: &AccountId, _: Amount) -> Result<Reservation, BankerError> {
        Err(BankerError::Unavailable)
    }

    async fn commit(&self, _: &Reservation, _: Amount) -> Result<(), BankerError> {
        Err(BankerError::Unavailable)
    }

    async fn rollback(&self, _: &Reservation) -> Result<(), BankerError> {
        Err(BankerError::Unavailable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account() -> AccountId {
        AccountId::parse("campaign:a").unwrap()
    }

    #[tokio::test]
    async fn authorize_commit_rollback_conserves_budget() {
        let banker = InMemoryBanker::new();
        banker.top_up(&account(), Amount::usd_micros(10_000));

        let reservation = banker
            .authorize(&account(), Amount::usd_micros(6_000))
            .await
            .unwrap();
        banker
            .commit(&reservation, Amount::usd_micros(2_500))
            .await
            .unwrap();
        banker
            .commit(&reservation, Amount::usd_micros(1_500))
            .await
            .unwrap();
        banker.rollback(&reservation).await.unwrap();

        // committed = sum of commits; everything uncommitted returned.
        assert_eq!(banker.committed(&account()), 4_000);
        assert_eq!(banker.available(&account()), 6_000);
        assert_eq!(banker.rolled_back(&account()), 2_000);
    }

    #[tokio::test]
    async fn over_commit_is_insufficient() {
        let banker = InMemoryBanker::new();
        banker.top_up(&account(), Amount::usd_micros(1_000));
        let reservation = banker
            .authorize(&account(), Amount::usd_micros(1_000))
            .await
            .unwrap();
        assert_eq!(
            banker.commit(&reservation, Amount::usd_micros(1_001)).await,
            Err(BankerError::Insufficient)
        );

        assert_eq!(
            banker
                .authorize(&account(), Amount::usd_micros(1))
                .await
                .unwrap_err(),
            BankerError::Insufficient
        );
    }
}
