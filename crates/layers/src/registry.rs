//! # Level Metadata Registry
//!
//! Process-wide map from level to the liveness flag shared by every wrapper
//! tagged at that level. The flag outlives the entry: removing a level first
//! flips its flag to dead, so wrappers that escaped their transform keep
//! reading `false` after the registry forgot about them.
//!
//! Double creation and lookup of a missing level are interpreter bugs and
//! panic.

use std::collections::BTreeMap;

use dynlayer_core::{Level, LivenessHandle};
use parking_lot::Mutex;

static REGISTRY: Mutex<BTreeMap<Level, LivenessHandle>> = parking_lot::const_mutex(BTreeMap::new());

/// Register `level` with a fresh alive flag.
pub fn create(level: Level) -> LivenessHandle {
    let mut registry = REGISTRY.lock();
    assert!(
        !registry.contains_key(&level),
        "level {} is already registered",
        level
    );
    let handle = LivenessHandle::new_alive();
    registry.insert(level, handle.clone());
    tracing::trace!(level, "registered level");
    handle
}

/// The liveness flag of an active level.
pub fn get(level: Level) -> LivenessHandle {
    match REGISTRY.lock().get(&level) {
        Some(handle) => handle.clone(),
        None => panic!("no metadata registered for level {}", level),
    }
}

/// Mark `level` dead, then forget it.
pub fn invalidate_and_remove(level: Level) {
    let mut registry = REGISTRY.lock();
    match registry.remove(&level) {
        Some(handle) => {
            handle.invalidate();
            tracing::trace!(level, "removed level");
        }
        None => tracing::warn!(level, "metadata for level already removed"),
    }
}

/// Whether any level is registered.
pub fn is_any_active() -> bool {
    !REGISTRY.lock().is_empty()
}

/// Whether `level` is registered.
pub fn contains(level: Level) -> bool {
    REGISTRY.lock().contains_key(&level)
}

/// Registered levels, ascending.
pub fn active_levels() -> Vec<Level> {
    REGISTRY.lock().keys().copied().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing;

    #[test]
    fn test_create_get_remove() {
        let _serial = testing::serial();

        let handle = create(1);
        assert!(handle.is_alive());
        assert!(contains(1));
        assert!(get(1).same_flag(&handle));
        assert_eq!(active_levels(), vec![1]);

        invalidate_and_remove(1);
        assert!(!handle.is_alive());
        assert!(!contains(1));
        assert!(!is_any_active());
    }

    #[test]
    fn test_remove_missing_is_noop() {
        let _serial = testing::serial();
        invalidate_and_remove(42);
        assert!(!is_any_active());
    }

    #[test]
    #[should_panic(expected = "already registered")]
    fn test_double_create_panics() {
        let _serial = testing::serial();
        create(1);
        create(1);
    }

    #[test]
    #[should_panic(expected = "no metadata registered for level 3")]
    fn test_get_missing_panics() {
        let _serial = testing::serial();
        get(3);
    }
}
