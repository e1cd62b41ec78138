//! Per-controller registry of single-shot timers.
//!
//! Each timer is a spawned task keyed by [TimerKind]. Scheduling a key that is
//! already pending aborts the previous task. Every timer carries a generation
//! so a superseded task that already woke up cannot fire: the callback must
//! call [Timers::complete] with its [Ticket] and bail out on `false`.

use std::{collections::HashMap, future::Future, time::Duration};
use tokio::task::JoinHandle;
use tracing::trace;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TimerKind {
    /// Ends the cooling phase.
    Cooldown,
    /// Ends the boost overlay.
    BoostRevert,
    /// Removes a floating XP indicator.
    Popup(u64),
}

/// Identifies one scheduled timer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ticket {
    pub kind: TimerKind,
    generation: u64,
}

#[derive(Default)]
pub struct Timers {
    next_generation: u64,
    pending: HashMap<TimerKind, (u64, JoinHandle<()>)>,
}

impl Timers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs `fire(ticket)` after `delay`, replacing any pending timer of the
    /// same kind.
    pub fn schedule<F, Fut>(&mut self, kind: TimerKind, delay: Duration, fire: F) -> Ticket
    where
        F: FnOnce(Ticket) -> Fut,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let generation = self.next_generation;
        self.next_generation += 1;
        let ticket = Ticket { kind, generation };

        let callback = fire(ticket);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            callback.await;
        });
        if let Some((_, previous)) = self.pending.insert(kind, (generation, handle)) {
            previous.abort();
            trace!(?kind, "replaced pending timer");
        }
        ticket
    }

    /// Claims a fired timer. Returns `false` if it was cancelled or replaced.
    pub fn complete(&mut self, ticket: Ticket) -> bool {
        match self.pending.get(&ticket.kind) {
            Some((generation, _)) if *generation == ticket.generation => {
                self.pending.remove(&ticket.kind);
                true
            }
            _ => false,
        }
    }

    pub fn cancel(&mut self, kind: TimerKind) -> bool {
        match self.pending.remove(&kind) {
            Some((_, handle)) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&mut self) {
        for (_, (_, handle)) in self.pending.drain() {
            handle.abort();
        }
    }

    pub fn is_pending(&self, kind: TimerKind) -> bool {
        self.pending.contains_key(&kind)
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

impl Drop for Timers {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
