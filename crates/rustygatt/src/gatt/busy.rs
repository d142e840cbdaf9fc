//! Single-flight gate over attribute operations
//!
//! A peripheral handles one attribute request at a time. Every read, write and
//! reliable-write commit acquires the gate before submission and releases it once the
//! terminal completion has been processed.

use log::trace;
use std::sync::{Mutex, PoisonError};

#[derive(Debug, Default)]
pub struct DeviceBusyGate {
    busy: Mutex<bool>,
}

impl DeviceBusyGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the gate if no operation is outstanding.
    pub fn try_acquire(&self) -> bool {
        let mut busy = self.busy.lock().unwrap_or_else(PoisonError::into_inner);
        if *busy {
            return false;
        }
        *busy = true;
        trace!("Device busy gate acquired");
        true
    }

    /// Releases the gate. Releasing an open gate is a no-op.
    pub fn release(&self) {
        let mut busy = self.busy.lock().unwrap_or_else(PoisonError::into_inner);
        if *busy {
            trace!("Device busy gate released");
        }
        *busy = false;
    }

    pub fn is_busy(&self) -> bool {
        *self.busy.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
