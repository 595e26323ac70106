//! Bounded blocking permit pool.
//!
//! Thumbnail rendering is the most memory-hungry thing the engine does, so
//! renders must hold a permit from a [`ConcurrencyGate`] sized by
//! configuration. Callers block on a plain condition variable rather than an
//! async semaphore because engine operations run on worker threads.

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crate::context::RequestContext;
use crate::error::Result;

/// How often a waiter wakes to look at its cancellation token.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(Debug)]
struct GateState {
    in_use: usize,
    peak: usize,
}

/// A counting gate limiting concurrent work.
#[derive(Debug)]
pub struct ConcurrencyGate {
    limit: usize,
    state: Mutex<GateState>,
    available: Condvar,
}

/// RAII permit; releases its slot on drop.
#[derive(Debug)]
pub struct GatePermit<'a> {
    gate: &'a ConcurrencyGate,
}

impl ConcurrencyGate {
    /// Create a gate admitting `limit` holders at once (minimum 1).
    pub fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            state: Mutex::new(GateState { in_use: 0, peak: 0 }),
            available: Condvar::new(),
        }
    }

    /// Maximum concurrent holders.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Permits currently held.
    pub fn in_use(&self) -> usize {
        self.lock().in_use
    }

    /// Highest number of permits ever held at once.
    pub fn peak(&self) -> usize {
        self.lock().peak
    }

    /// Block until a permit is free or `ctx` expires.
    pub fn acquire(&self, ctx: &RequestContext) -> Result<GatePermit<'_>> {
        let mut state = self.lock();
        loop {
            ctx.check()?;

            if state.in_use < self.limit {
                state.in_use += 1;
                state.peak = state.peak.max(state.in_use);
                return Ok(GatePermit { gate: self });
            }

            let wait = ctx
                .remaining()
                .map_or(CANCEL_POLL_INTERVAL, |r| r.min(CANCEL_POLL_INTERVAL));
            state = self
                .available
                .wait_timeout(state, wait)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Take a permit without blocking.
    pub fn try_acquire(&self) -> Option<GatePermit<'_>> {
        let mut state = self.lock();
        if state.in_use < self.limit {
            state.in_use += 1;
            state.peak = state.peak.max(state.in_use);
            Some(GatePermit { gate: self })
        } else {
            None
        }
    }

    // The counter stays consistent even if a holder panicked.
    fn lock(&self) -> MutexGuard<'_, GateState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(&self) {
        let mut state = self.lock();
        state.in_use = state.in_use.saturating_sub(1);
        drop(state);
        self.available.notify_one();
    }
}

impl Drop for GatePermit<'_> {
    fn drop(&mut self) {
        self.gate.release();
    }
}
