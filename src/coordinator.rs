//! Replica-wide single-capture slot.
//!
//! At most one session may have a capture in flight per process; cross-replica
//! exclusion is the leader lock's job.

use std::sync::Mutex;

#[derive(Debug, Default)]
struct Slot {
    in_flight: bool,
    session_id: Option<String>,
}

#[derive(Debug, Default)]
pub struct CaptureCoordinator {
    slot: Mutex<Slot>,
}

impl CaptureCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically claim the capture slot for `session_id`. Fails when any
    /// capture is already in flight, including one by the same session.
    pub fn reserve(&self, session_id: &str) -> bool {
        let mut slot = self.slot.lock().unwrap();
        if slot.in_flight {
            return false;
        }
        slot.in_flight = true;
        slot.session_id = Some(session_id.to_string());
        true
    }

    pub fn release(&self) {
        let mut slot = self.slot.lock().unwrap();
        slot.in_flight = false;
        slot.session_id = None;
    }

    /// Session currently holding the slot, if any.
    pub fn active_session(&self) -> Option<String> {
        self.slot.lock().unwrap().session_id.clone()
    }

    pub fn in_flight(&self) -> bool {
        self.slot.lock().unwrap().in_flight
    }
}
