//! Draw barrier.
//!
//! Rendezvous for the agencies' draw requests: each `arrive` blocks until
//! all N agencies have arrived, then every waiter is released together
//! and exactly one of them (the last to arrive) is told it leads the
//! draw. A wait that outlives the timeout breaks the barrier and releases
//! everyone with an error. `abort` releases every waiter with an error and
//! makes later arrivals fail straight away.
//!
//! Counter and status live behind a mutex; waiters are woken through a
//! watch channel that is only ever published while that mutex is held,
//! so a waiter that subscribed under the lock cannot miss its release.

use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum BarrierError {
    #[error("timed out waiting for the remaining agencies")]
    TimedOut,
    #[error("barrier broken by an earlier timeout")]
    Broken,
    #[error("barrier aborted")]
    Aborted,
}

/// Outcome handed to a released participant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BarrierWaitResult {
    is_leader: bool,
}

impl BarrierWaitResult {
    /// True for exactly one participant per release: the last to arrive.
    pub fn is_leader(&self) -> bool {
        self.is_leader
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Status {
    Open,
    Broken,
    Aborted,
}

/// What waiters observe through the watch channel
#[derive(Debug, Clone, Copy)]
struct Snapshot {
    generation: u64,
    status: Status,
}

#[derive(Debug)]
struct BarrierState {
    arrived: usize,
    generation: u64,
    status: Status,
}

pub struct DrawBarrier {
    parties: usize,
    timeout: Duration,
    state: Mutex<BarrierState>,
    notify: watch::Sender<Snapshot>,
}

impl DrawBarrier {
    /// Barrier for `parties` participants, each waiting at most `timeout`.
    pub fn new(parties: usize, timeout: Duration) -> Self {
        assert!(parties > 0, "a barrier needs at least one participant");
        let (notify, _) = watch::channel(Snapshot {
            generation: 0,
            status: Status::Open,
        });
        Self {
            parties,
            timeout,
            state: Mutex::new(BarrierState {
                arrived: 0,
                generation: 0,
                status: Status::Open,
            }),
            notify,
        }
    }

    pub fn parties(&self) -> usize {
        self.parties
    }

    fn lock(&self) -> MutexGuard<'_, BarrierState> {
        // State is only a counter and flags, always consistent between statements
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, state: &BarrierState) {
        self.notify.send_replace(Snapshot {
            generation: state.generation,
            status: state.status,
        });
    }

    /// Wait until every participant has arrived.
    pub async fn arrive(&self) -> Result<BarrierWaitResult, BarrierError> {
        let (generation, mut rx) = {
            let mut state = self.lock();
            match state.status {
                Status::Open => {}
                Status::Broken => return Err(BarrierError::Broken),
                Status::Aborted => return Err(BarrierError::Aborted),
            }

            state.arrived += 1;
            debug!(arrived = state.arrived, parties = self.parties, "Barrier arrival");

            if state.arrived == self.parties {
                state.arrived = 0;
                state.generation += 1;
                self.publish(&state);
                return Ok(BarrierWaitResult { is_leader: true });
            }

            (state.generation, self.notify.subscribe())
        };

        let released = tokio::time::timeout(
            self.timeout,
            rx.wait_for(|s| s.generation != generation || s.status != Status::Open),
        )
        .await;

        match released {
            Ok(Ok(snapshot)) => {
                let snapshot = *snapshot;
                if snapshot.generation != generation {
                    Ok(BarrierWaitResult { is_leader: false })
                } else if snapshot.status == Status::Aborted {
                    Err(BarrierError::Aborted)
                } else {
                    Err(BarrierError::TimedOut)
                }
            }
            // The sender lives as long as the barrier
            Ok(Err(_)) => Err(BarrierError::Aborted),
            Err(_elapsed) => self.expire(generation),
        }
    }

    /// Called by a waiter whose own timeout fired.
    fn expire(&self, generation: u64) -> Result<BarrierWaitResult, BarrierError> {
        let mut state = self.lock();
        if state.generation != generation {
            // Released right as the timer fired
            return Ok(BarrierWaitResult { is_leader: false });
        }
        match state.status {
            Status::Aborted => Err(BarrierError::Aborted),
            Status::Broken => Err(BarrierError::TimedOut),
            Status::Open => {
                warn!(
                    arrived = state.arrived,
                    parties = self.parties,
                    timeout_secs = self.timeout.as_secs_f64(),
                    "Draw barrier timed out"
                );
                state.status = Status::Broken;
                state.arrived = 0;
                self.publish(&state);
                Err(BarrierError::TimedOut)
            }
        }
    }

    /// Release every waiter with an error and fail all future arrivals.
    pub fn abort(&self) {
        let mut state = self.lock();
        if state.status == Status::Aborted {
            return;
        }
        debug!(waiting = state.arrived, "Aborting draw barrier");
        state.status = Status::Aborted;
        state.arrived = 0;
        self.publish(&state);
    }

    #[cfg(test)]
    pub fn is_aborted(&self) -> bool {
        self.lock().status == Status::Aborted
    }
}
