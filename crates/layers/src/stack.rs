//! # Layer Stack
//!
//! The per-thread LIFO of active layers. Layer `i` (0-indexed) always has
//! level `i + 1`; only the top is ever popped. The stack being empty is
//! equivalent to the entry and exit interceptors not being included in the
//! thread's overlay.
//!
//! ## Example
//!
//! ```rust
//! use dynlayer_layers::layer::{LayerSpec, Randomness};
//! use dynlayer_layers::stack;
//!
//! let level = stack::init_and_push(LayerSpec::batching(4, Randomness::Error));
//! assert_eq!(level, 1);
//! assert_eq!(stack::describe(), "LayerStack[ 1:Batching ]");
//!
//! let layer = stack::pop_and_delete_metadata();
//! assert_eq!(layer.level(), 1);
//! assert!(stack::is_empty());
//! ```

use std::cell::RefCell;
use std::fmt;

use dynlayer_core::capability::{self, LocalCapabilities};
use dynlayer_core::{config, Level};

use crate::controller;
use crate::layer::{Layer, LayerSpec};
use crate::registry;

thread_local! {
    static STACK: RefCell<Vec<Layer>> = const { RefCell::new(Vec::new()) };
}

// ============================================================================
// Basic Operations
// ============================================================================

/// Number of active layers on this thread.
pub fn len() -> usize {
    STACK.with(|s| s.borrow().len())
}

pub fn is_empty() -> bool {
    len() == 0
}

/// Levels of the active layers, bottom first.
pub fn levels() -> Vec<Level> {
    STACK.with(|s| s.borrow().iter().map(Layer::level).collect())
}

/// Push `layer`. Panics unless its level is `len() + 1`.
pub fn push(layer: Layer) -> Level {
    let level = STACK.with(|s| {
        let mut stack = s.borrow_mut();
        let expected = stack.len() + 1;
        assert_eq!(
            layer.level(),
            expected,
            "pushed layer {} but the next level is {}",
            layer,
            expected
        );
        stack.push(layer);
        expected
    });
    if level == 1 {
        if config::get().show_dispatch_trace {
            tracing::debug!("transform layers on");
        }
        controller::set_interception_included(true);
    }
    level
}

/// Pop the top layer. Panics if the stack is empty.
pub fn pop() -> Layer {
    let (layer, now_empty) = STACK.with(|s| {
        let mut stack = s.borrow_mut();
        let Some(layer) = stack.pop() else {
            panic!("pop from an empty layer stack");
        };
        (layer, stack.is_empty())
    });
    if now_empty {
        if config::get().show_dispatch_trace {
            tracing::debug!("transform layers off");
        }
        controller::set_interception_included(false);
    }
    layer
}

/// The top layer, if any.
pub fn top() -> Option<Layer> {
    STACK.with(|s| s.borrow().last().copied())
}

/// The top layer. Panics if the stack is empty.
pub fn current() -> Layer {
    match top() {
        Some(layer) => layer,
        None => panic!("no transform layer is active"),
    }
}

/// Copy of the whole stack, bottom first.
pub fn snapshot() -> Vec<Layer> {
    STACK.with(|s| s.borrow().clone())
}

/// Replace the stack wholesale.
///
/// The interceptors are included or un-included when the stack goes from
/// empty to non-empty or back; the rest of the overlay is not touched
/// (see [`ContextSnapshot`] to carry it along).
pub fn restore(layers: Vec<Layer>) {
    for (i, layer) in layers.iter().enumerate() {
        assert_eq!(
            layer.level(),
            i + 1,
            "restored layer {} at position {}",
            layer,
            i
        );
    }
    let now_empty = layers.is_empty();
    let was_empty = STACK.with(|s| std::mem::replace(&mut *s.borrow_mut(), layers).is_empty());
    if was_empty != now_empty {
        controller::set_interception_included(!now_empty);
    }
}

/// `LayerStack[ 1:Differentiation 2:Batching ]`
pub fn describe() -> String {
    STACK.with(|s| LayerList(&s.borrow()).to_string())
}

struct LayerList<'a>(&'a [Layer]);

impl fmt::Display for LayerList<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LayerStack[ ")?;
        for layer in self.0 {
            write!(f, "{} ", layer)?;
        }
        write!(f, "]")
    }
}

// ============================================================================
// Entry Points
// ============================================================================

/// Build a layer at the next level, push it and register its metadata.
pub fn init_and_push(spec: LayerSpec) -> Level {
    let level = len() + 1;
    let layer = Layer::new(spec, level);
    push(layer);
    registry::create(level);
    tracing::debug!(level, kind = %spec.kind(), "pushed layer");
    level
}

/// Pop the top layer and kill every wrapper tagged at its level.
pub fn pop_and_delete_metadata() -> Layer {
    let layer = pop();
    registry::invalidate_and_remove(layer.level());
    tracing::debug!(level = layer.level(), kind = %layer.kind(), "popped layer");
    layer
}

// ============================================================================
// Scoped Guards
// ============================================================================

/// Pops the top layer for a scope and pushes it back on drop.
#[must_use = "the layer is pushed back as soon as the guard is dropped"]
pub struct WithoutTop {
    layer: Option<Layer>,
}

impl WithoutTop {
    pub fn new() -> Self {
        Self { layer: Some(pop()) }
    }

    /// The layer that was popped.
    pub fn layer(&self) -> Option<&Layer> {
        self.layer.as_ref()
    }
}

impl Default for WithoutTop {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for WithoutTop {
    fn drop(&mut self) {
        if let Some(layer) = self.layer.take() {
            push(layer);
        }
    }
}

// ============================================================================
// Context Propagation
// ============================================================================

/// Layer stack and overlay of one thread, for continuing its transform
/// context on another.
#[derive(Debug, Clone)]
pub struct ContextSnapshot {
    layers: Vec<Layer>,
    capabilities: LocalCapabilities,
}

impl ContextSnapshot {
    /// Capture the calling thread's context.
    pub fn capture() -> Self {
        Self {
            layers: snapshot(),
            capabilities: capability::local(),
        }
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    /// Install the context on the calling thread until the guard drops.
    pub fn enter(&self) -> ContextGuard {
        let guard = ContextGuard {
            layers: snapshot(),
            capabilities: capability::local(),
        };
        restore(self.layers.clone());
        capability::force_local(self.capabilities);
        guard
    }
}

impl fmt::Display for ContextSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", LayerList(&self.layers), self.capabilities)
    }
}

/// Restores the thread's previous context on drop.
#[must_use = "the previous context is restored as soon as the guard is dropped"]
pub struct ContextGuard {
    layers: Vec<Layer>,
    capabilities: LocalCapabilities,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        restore(std::mem::take(&mut self.layers));
        capability::force_local(self.capabilities);
    }
}

// ============================================================================
// Tests
// ============================================================================
