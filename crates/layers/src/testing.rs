//! Helpers for tests that push layers.
//!
//! The level registry is shared by the whole process, while the test harness
//! runs tests on parallel threads that each start at level 1. Tests that
//! push layers or register levels hold [`serial`] for their whole body.

use parking_lot::{Mutex, MutexGuard};

use crate::{registry, stack};

static SERIAL: Mutex<()> = parking_lot::const_mutex(());

/// Holds the process-wide test lock; on drop, tears down whatever the test
/// left behind on this thread and in the registry.
pub struct SerialGuard {
    _lock: MutexGuard<'static, ()>,
}

/// Take the process-wide test lock.
pub fn serial() -> SerialGuard {
    SerialGuard {
        _lock: SERIAL.lock(),
    }
}

impl Drop for SerialGuard {
    fn drop(&mut self) {
        while !stack::is_empty() {
            stack::pop_and_delete_metadata();
        }
        for level in registry::active_levels() {
            registry::invalidate_and_remove(level);
        }
    }
}
