//! One-shot cancellation timer
//!
//! Tasks are keyed by `(user, appeal)` and kept in a min-heap ordered by
//! fire time. A single sweeper task sleeps until the earliest deadline and
//! emits fired tasks on a channel. Re-scheduling a key replaces the pending
//! task; the superseded heap entry is skipped when it surfaces.
//!
//! Firing and cancelling both remove the entry under the same lock, so for
//! a given schedule exactly one of them wins.

use crate::ids::AppealKey;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

pub type TimerKey = AppealKey;

/// A task that reached its deadline without being cancelled
#[derive(Debug, Clone, PartialEq)]
pub struct Fired<P> {
    pub key: TimerKey,
    pub payload: P,
}

struct Entry<P> {
    seq: u64,
    payload: P,
}

struct TimerState<P> {
    entries: HashMap<TimerKey, Entry<P>>,
    deadlines: BinaryHeap<Reverse<(Instant, u64, TimerKey)>>,
    next_seq: u64,
}

impl<P> TimerState<P> {
    /// Drop superseded heap entries and return the earliest live deadline
    fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((at, seq, key))) = self.deadlines.peek() {
            match self.entries.get(key) {
                Some(entry) if entry.seq == *seq => return Some(*at),
                _ => {
                    self.deadlines.pop();
                }
            }
        }
        None
    }

    fn take_due(&mut self, now: Instant) -> Vec<Fired<P>> {
        let mut fired = Vec::new();
        while let Some(Reverse((at, seq, key))) = self.deadlines.peek().copied() {
            if at > now {
                break;
            }
            self.deadlines.pop();
            if self.entries.get(&key).is_some_and(|e| e.seq == seq) {
                if let Some(entry) = self.entries.remove(&key) {
                    fired.push(Fired {
                        key,
                        payload: entry.payload,
                    });
                }
            }
        }
        fired
    }
}

struct Shared<P> {
    state: Mutex<TimerState<P>>,
    wake: Notify,
}

impl<P> Shared<P> {
    fn lock(&self) -> MutexGuard<'_, TimerState<P>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cancel_seq(&self, key: &TimerKey, seq: Option<u64>) -> bool {
        let mut state = self.lock();
        let matches = state
            .entries
            .get(key)
            .is_some_and(|entry| seq.map_or(true, |s| s == entry.seq));
        if matches {
            state.entries.remove(key);
        }
        matches
    }
}

/// Process-wide registry of pending cancellation tasks
pub struct CancellationTimer<P> {
    shared: Arc<Shared<P>>,
}

impl<P> Clone for CancellationTimer<P> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<P> Default for CancellationTimer<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P> CancellationTimer<P> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(TimerState {
                    entries: HashMap::new(),
                    deadlines: BinaryHeap::new(),
                    next_seq: 0,
                }),
                wake: Notify::new(),
            }),
        }
    }

    /// Arm a one-shot task for `key`, replacing any task already pending
    /// for it. The returned handle cancels this schedule only.
    pub fn schedule(&self, key: TimerKey, delay: Duration, payload: P) -> TimerHandle<P> {
        let fire_at = Instant::now() + delay;
        let seq = {
            let mut state = self.shared.lock();
            let seq = state.next_seq;
            state.next_seq += 1;
            if state.entries.insert(key, Entry { seq, payload }).is_some() {
                tracing::debug!(key = %key, "Replaced pending cancellation timer");
            }
            state.deadlines.push(Reverse((fire_at, seq, key)));
            seq
        };
        self.shared.wake.notify_one();

        TimerHandle {
            key,
            seq,
            shared: Arc::downgrade(&self.shared),
        }
    }

    /// Remove the pending task for `key`. Absent or already fired keys are
    /// not an error; returns whether a task was removed.
    pub fn cancel(&self, key: &TimerKey) -> bool {
        self.shared.cancel_seq(key, None)
    }

    #[allow(dead_code)] // Used in tests
    pub fn is_pending(&self, key: &TimerKey) -> bool {
        self.shared.lock().entries.contains_key(key)
    }

    pub fn pending_count(&self) -> usize {
        self.shared.lock().entries.len()
    }

    /// Sweep loop: emits each task whose deadline passed. Runs until
    /// `shutdown` is cancelled or the receiver goes away.
    pub async fn run(self, fired_tx: mpsc::Sender<Fired<P>>, shutdown: CancellationToken) {
        tracing::info!("Cancellation timer started");
        loop {
            let deadline = self.shared.lock().next_deadline();

            match deadline {
                Some(at) => {
                    tokio::select! {
                        () = tokio::time::sleep_until(at) => {}
                        () = self.shared.wake.notified() => continue,
                        () = shutdown.cancelled() => break,
                    }
                }
                None => {
                    tokio::select! {
                        () = self.shared.wake.notified() => continue,
                        () = shutdown.cancelled() => break,
                    }
                }
            }

            let due = self.shared.lock().take_due(Instant::now());
            for fired in due {
                tracing::info!(key = %fired.key, "Cancellation timer fired");
                if fired_tx.send(fired).await.is_err() {
                    tracing::warn!("Timer receiver dropped, stopping sweeper");
                    return;
                }
            }
        }
        tracing::info!("Cancellation timer stopped");
    }
}

/// Owned handle to one scheduled task.
///
/// Cancelling through the handle only affects the schedule that produced
/// it; a later `schedule()` for the same key is left alone. Dropping the
/// handle does not cancel the task.
#[derive(Debug)]
pub struct TimerHandle<P> {
    key: TimerKey,
    seq: u64,
    shared: Weak<Shared<P>>,
}

impl<P> TimerHandle<P> {
    #[allow(dead_code)] // Used in tests
    pub fn key(&self) -> TimerKey {
        self.key
    }

    /// Returns whether the task was still pending
    pub fn cancel(&self) -> bool {
        self.shared
            .upgrade()
            .is_some_and(|shared| shared.cancel_seq(&self.key, Some(self.seq)))
    }
}

impl<P> std::fmt::Debug for Shared<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shared").finish_non_exhaustive()
    }
}
