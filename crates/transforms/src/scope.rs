//! # Scoped Layers
//!
//! Push a layer for the duration of a closure. The layer is popped and its
//! level invalidated on every way out of the scope, including `?` and
//! panics, so values that escape the scope come back dead.
//!
//! ```rust
//! use dynlayer_transforms::scope::grad_scope;
//! use dynlayer_transforms::runtime;
//! use dynlayer_core::Tensor;
//!
//! let rt = runtime().unwrap();
//! let y = grad_scope(|level| {
//!     let x = dynlayer_layers::wrap(&Tensor::scalar(2.0), level);
//!     rt.mul(&x, &x)
//! })
//! .unwrap();
//!
//! // The level is gone: y behaves as its underlying value from here on.
//! assert!(!y.as_tagged().unwrap().is_alive());
//! assert_eq!(rt.add(&y, &Tensor::scalar(1.0)).unwrap().to_vec(), vec![5.0]);
//! ```

use dynlayer_core::grad_mode::{self, GradModeGuard};
use dynlayer_core::Level;
use dynlayer_layers::layer::{LayerSpec, Randomness};
use dynlayer_layers::{registry, stack};

/// Owns one pushed layer; pops it on drop.
#[must_use = "the layer is popped as soon as the guard is dropped"]
pub struct LayerGuard {
    level: Level,
}

impl LayerGuard {
    /// Push a layer built from `spec`.
    pub fn push(spec: LayerSpec) -> Self {
        Self {
            level: stack::init_and_push(spec),
        }
    }

    pub fn level(&self) -> Level {
        self.level
    }
}

impl Drop for LayerGuard {
    fn drop(&mut self) {
        let top = stack::top().map(|layer| layer.level());
        if top == Some(self.level) {
            stack::pop_and_delete_metadata();
        } else {
            // Someone else popped our layer; at least kill its wrappers.
            tracing::warn!(level = self.level, ?top, "layer guard does not own the top layer");
            registry::invalidate_and_remove(self.level);
        }
    }
}

/// Run `f` under a differentiation layer with grad mode enabled.
///
/// The layer remembers the grad flags in effect outside, and restores them
/// whenever it hands work to the layers below it.
pub fn grad_scope<R>(f: impl FnOnce(Level) -> R) -> R {
    let prior_grad = grad_mode::is_enabled();
    let prior_forward_grad = grad_mode::is_forward_enabled();
    let layer = LayerGuard::push(LayerSpec::differentiation(
        Some(prior_grad),
        Some(prior_forward_grad),
    ));
    let _grad = GradModeGuard::new(true);
    f(layer.level())
}

/// Run `f` under a batching layer of `batch_size` entries.
pub fn batch_scope<R>(batch_size: usize, randomness: Randomness, f: impl FnOnce(Level) -> R) -> R {
    let layer = LayerGuard::push(LayerSpec::batching(batch_size, randomness));
    f(layer.level())
}
