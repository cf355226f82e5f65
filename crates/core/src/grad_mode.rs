//! Ambient differentiation-mode flags.
//!
//! Differentiation bodies only record history while grad mode is enabled.
//! Both flags are per thread and default to enabled.

use std::cell::Cell;

thread_local! {
    static GRAD_ENABLED: Cell<bool> = const { Cell::new(true) };
    static FORWARD_GRAD_ENABLED: Cell<bool> = const { Cell::new(true) };
}

/// Whether reverse-mode history is recorded on this thread.
pub fn is_enabled() -> bool {
    GRAD_ENABLED.with(|c| c.get())
}

/// Set reverse-mode recording for this thread.
pub fn set_enabled(enabled: bool) {
    GRAD_ENABLED.with(|c| c.set(enabled));
}

/// Whether forward-mode tangents are propagated on this thread.
pub fn is_forward_enabled() -> bool {
    FORWARD_GRAD_ENABLED.with(|c| c.get())
}

/// Set forward-mode propagation for this thread.
pub fn set_forward_enabled(enabled: bool) {
    FORWARD_GRAD_ENABLED.with(|c| c.set(enabled));
}

/// Sets grad mode for a scope and restores the previous value on drop.
#[must_use = "grad mode is restored as soon as the guard is dropped"]
pub struct GradModeGuard {
    prev: bool,
}

impl GradModeGuard {
    pub fn new(enabled: bool) -> Self {
        let prev = is_enabled();
        set_enabled(enabled);
        Self { prev }
    }
}

impl Drop for GradModeGuard {
    fn drop(&mut self) {
        set_enabled(self.prev);
    }
}

/// Sets forward grad mode for a scope and restores the previous value on drop.
#[must_use = "forward grad mode is restored as soon as the guard is dropped"]
pub struct ForwardGradModeGuard {
    prev: bool,
}

impl ForwardGradModeGuard {
    pub fn new(enabled: bool) -> Self {
        let prev = is_forward_enabled();
        set_forward_enabled(enabled);
        Self { prev }
    }
}

impl Drop for ForwardGradModeGuard {
    fn drop(&mut self) {
        set_forward_enabled(self.prev);
    }
}
