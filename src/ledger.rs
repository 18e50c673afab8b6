//! Thread-safe gateway over bet persistence.
//!
//! Every append and every draw-time scan goes through one lock, so no
//! reader observes a half-written batch and no two appends interleave.
//! Store calls are blocking file I/O and run on tokio's blocking pool;
//! the lock is never held across a network send.

use crate::storage::{Bet, BetStore, StoreError, WinnerPredicate};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("ledger lock poisoned")]
    Poisoned,
    #[error("ledger task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Shared facade over an injected [`BetStore`] and winner predicate.
pub struct Ledger {
    store: Mutex<Box<dyn BetStore>>,
    is_winner: WinnerPredicate,
}

impl Ledger {
    pub fn new(store: Box<dyn BetStore>, is_winner: WinnerPredicate) -> Arc<Self> {
        Arc::new(Self {
            store: Mutex::new(store),
            is_winner,
        })
    }

    /// Append a batch of bets atomically.
    pub fn append(&self, bets: &[Bet]) -> Result<(), LedgerError> {
        let mut store = self.store.lock().map_err(|_| LedgerError::Poisoned)?;
        store.append_bets(bets)?;
        drop(store);

        for bet in bets {
            info!(
                agency = bet.agency,
                document = %bet.document,
                number = bet.number,
                "Bet stored"
            );
        }
        Ok(())
    }

    /// Documents of every winning bet placed at `agency`.
    pub fn winners(&self, agency: u32) -> Result<Vec<String>, LedgerError> {
        let store = self.store.lock().map_err(|_| LedgerError::Poisoned)?;
        let winners: Vec<String> = store
            .load_bets()?
            .into_iter()
            .filter(|bet| bet.agency == agency && (self.is_winner)(bet))
            .map(|bet| bet.document)
            .collect();
        drop(store);

        debug!(agency, count = winners.len(), "Winners computed");
        Ok(winners)
    }

    /// [`Ledger::append`] on the blocking pool.
    pub async fn append_blocking(self: &Arc<Self>, bets: Vec<Bet>) -> Result<(), LedgerError> {
        let ledger = Arc::clone(self);
        tokio::task::spawn_blocking(move || ledger.append(&bets)).await?
    }

    /// [`Ledger::winners`] on the blocking pool.
    pub async fn winners_blocking(self: &Arc<Self>, agency: u32) -> Result<Vec<String>, LedgerError> {
        let ledger = Arc::clone(self);
        tokio::task::spawn_blocking(move || ledger.winners(agency)).await?
    }

    /// Snapshot of every stored bet, for tests
    #[cfg(test)]
    pub fn bets(&self) -> Vec<Bet> {
        self.store.lock().unwrap().load_bets().unwrap()
    }
}
