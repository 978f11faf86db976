// SPDX-License-Identifier: GPL-3.0-only

//! Frame rendezvous between a delivery thread and a waiting caller
//!
//! The caller arms the slot and blocks; the next payload offered while
//! the slot is armed is copied into a reusable scratch buffer and the
//! caller is woken. Offers made while the slot is idle are dropped, so a
//! caller only ever sees data produced after it asked.

use std::sync::{Condvar, Mutex, MutexGuard};
use tracing::debug;

/// What a completed rendezvous means to the waiter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameEvent {
    /// A raw preview frame arrived
    FrameReady,
    /// A complete encoded image arrived
    EncodeComplete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Not waiting; offers are dropped
    Idle,
    /// A waiter wants the next offer
    Armed,
    /// Torn down; waiters are released empty-handed
    Closed,
}

struct Slot {
    state: SlotState,
    scratch: Vec<u8>,
}

pub struct Rendezvous {
    event: FrameEvent,
    slot: Mutex<Slot>,
    ready: Condvar,
}

impl Rendezvous {
    pub fn new(event: FrameEvent) -> Self {
        Self::with_capacity(event, 0)
    }

    /// Rendezvous whose scratch buffer is preallocated for `capacity` bytes
    pub fn with_capacity(event: FrameEvent, capacity: usize) -> Self {
        Self {
            event,
            slot: Mutex::new(Slot {
                state: SlotState::Idle,
                scratch: Vec::with_capacity(capacity),
            }),
            ready: Condvar::new(),
        }
    }

    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> SlotState {
        self.slot().state
    }

    /// Bytes currently held for the caller
    pub fn held_len(&self) -> usize {
        self.slot().scratch.len()
    }

    /// Start waiting for the next offer; drops anything still held
    ///
    /// Returns `false` once the rendezvous is closed.
    pub fn arm(&self) -> bool {
        let mut slot = self.slot();
        if slot.state == SlotState::Closed {
            return false;
        }
        slot.scratch.clear();
        slot.state = SlotState::Armed;
        true
    }

    /// Block until the armed slot is filled or closed
    ///
    /// Returns `true` when data arrived.
    pub fn wait(&self) -> bool {
        let mut slot = self.slot();
        while slot.state == SlotState::Armed {
            slot = self.ready.wait(slot).unwrap_or_else(|e| e.into_inner());
        }
        slot.state == SlotState::Idle && !slot.scratch.is_empty()
    }

    /// Arm and wait in one step
    pub fn wait_for_next(&self) -> bool {
        self.arm() && self.wait()
    }

    /// Hand a payload to an armed waiter
    ///
    /// Returns `false` if nobody was waiting or the payload was empty.
    pub fn offer(&self, data: &[u8]) -> bool {
        if data.is_empty() {
            return false;
        }
        let mut slot = self.slot();
        if slot.state != SlotState::Armed {
            return false;
        }
        slot.scratch.clear();
        slot.scratch.extend_from_slice(data);
        slot.state = SlotState::Idle;
        self.ready.notify_all();
        true
    }

    /// Consume the held payload, if any
    pub fn take_with<R>(&self, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
        let mut slot = self.slot();
        if slot.state != SlotState::Idle || slot.scratch.is_empty() {
            return None;
        }
        let result = f(&slot.scratch);
        slot.scratch.clear();
        Some(result)
    }

    pub fn take(&self) -> Option<Vec<u8>> {
        self.take_with(<[u8]>::to_vec)
    }

    /// Release every waiter and refuse further offers
    pub fn close(&self) {
        let mut slot = self.slot();
        slot.state = SlotState::Closed;
        slot.scratch.clear();
        self.ready.notify_all();
        debug!(event = ?self.event, "Rendezvous closed");
    }
}
