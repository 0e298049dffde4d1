//! Per-client signaling slots.
//!
//! The synchro table has one slot per possible client. Each cycle the realtime
//! thread [`signal`](SynchroTable::signal)s a client's slot to release its
//! processing, then waits on [`wait_finished`](SynchroTable::wait_finished) with
//! a deadline. The client thread blocks in [`wait`](SynchroTable::wait), runs,
//! and calls [`finish`](SynchroTable::finish).
//!
//! The realtime side never waits past the deadline it passes in.

use crate::client::{MAX_CLIENTS, RefNum};
use crate::error::{EngineError, Result};
use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Outcome of a client-side [`SynchroTable::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncWait {
    /// The slot was signaled; the client should process one cycle.
    Signaled,
    /// No signal arrived before the timeout.
    TimedOut,
    /// The slot was released while waiting.
    Closed,
}

#[derive(Debug, Default)]
struct SlotState {
    name: Option<String>,
    signaled: bool,
    finished: bool,
    generation: u64,
}

#[derive(Debug, Default)]
struct Slot {
    state: Mutex<SlotState>,
    cond: Condvar,
}

/// Fixed-size table of signaling slots, indexed by [`RefNum`].
#[derive(Debug)]
pub struct SynchroTable {
    slots: Vec<Slot>,
}

impl SynchroTable {
    /// Creates a table with [`MAX_CLIENTS`] free slots.
    pub fn new() -> Self {
        Self {
            slots: (0..MAX_CLIENTS).map(|_| Slot::default()).collect(),
        }
    }

    fn slot(&self, refnum: RefNum) -> Result<&Slot> {
        self.slots
            .get(refnum.index())
            .ok_or(EngineError::Synchro(refnum))
    }

    /// Claims the slot of `refnum` for the client called `name`.
    pub fn allocate(&self, refnum: RefNum, name: &str) -> Result<()> {
        let slot = self.slot(refnum)?;
        let mut state = slot.state.lock();
        if state.name.is_some() {
            return Err(EngineError::Synchro(refnum));
        }
        state.name = Some(name.to_string());
        state.signaled = false;
        state.finished = false;
        state.generation += 1;
        Ok(())
    }

    /// Frees the slot of `refnum`, waking any thread blocked on it.
    pub fn release(&self, refnum: RefNum) {
        if let Ok(slot) = self.slot(refnum) {
            let mut state = slot.state.lock();
            state.name = None;
            state.signaled = false;
            state.finished = false;
            state.generation += 1;
            slot.cond.notify_all();
        }
    }

    /// Wakes any thread blocked in [`wait`](Self::wait) on `refnum` with
    /// [`SyncWait::Closed`], keeping the slot allocated.
    pub fn interrupt(&self, refnum: RefNum) {
        if let Ok(slot) = self.slot(refnum) {
            let mut state = slot.state.lock();
            state.generation += 1;
            slot.cond.notify_all();
        }
    }

    /// Whether the slot of `refnum` is allocated.
    pub fn is_allocated(&self, refnum: RefNum) -> bool {
        self.slot(refnum)
            .map(|s| s.state.lock().name.is_some())
            .unwrap_or(false)
    }

    /// Number of allocated slots.
    pub fn allocated_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.state.lock().name.is_some())
            .count()
    }

    /// Releases the client of `refnum` for one cycle.
    ///
    /// Returns `false` if the slot is not allocated.
    pub fn signal(&self, refnum: RefNum) -> bool {
        let Ok(slot) = self.slot(refnum) else {
            return false;
        };
        let mut state = slot.state.lock();
        if state.name.is_none() {
            return false;
        }
        state.signaled = true;
        state.finished = false;
        slot.cond.notify_all();
        true
    }

    /// Blocks the client thread of `refnum` until it is signaled, the slot is
    /// released, or `timeout` passes.
    pub fn wait(&self, refnum: RefNum, timeout: Duration) -> SyncWait {
        let Ok(slot) = self.slot(refnum) else {
            return SyncWait::Closed;
        };
        let deadline = Instant::now() + timeout;
        let mut state = slot.state.lock();
        let generation = state.generation;
        loop {
            if state.name.is_none() || state.generation != generation {
                return SyncWait::Closed;
            }
            if state.signaled {
                state.signaled = false;
                return SyncWait::Signaled;
            }
            if slot.cond.wait_until(&mut state, deadline).timed_out() {
                return if state.signaled {
                    state.signaled = false;
                    SyncWait::Signaled
                } else {
                    SyncWait::TimedOut
                };
            }
        }
    }

    /// Marks the current cycle of `refnum` as processed.
    pub fn finish(&self, refnum: RefNum) {
        if let Ok(slot) = self.slot(refnum) {
            let mut state = slot.state.lock();
            state.finished = true;
            slot.cond.notify_all();
        }
    }

    /// Waits until `refnum` finishes its cycle or `deadline` passes.
    ///
    /// Returns `true` if the client finished in time. A released slot counts as
    /// finished.
    pub fn wait_finished(&self, refnum: RefNum, deadline: Instant) -> bool {
        let Ok(slot) = self.slot(refnum) else {
            return true;
        };
        let mut state = slot.state.lock();
        loop {
            if state.name.is_none() || state.finished {
                return true;
            }
            if slot.cond.wait_until(&mut state, deadline).timed_out() {
                return state.name.is_none() || state.finished;
            }
        }
    }
}

impl Default for SynchroTable {
    fn default() -> Self {
        Self::new()
    }
}
