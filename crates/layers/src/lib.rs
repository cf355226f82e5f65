//! # Layers - Composable Transform Interpreter Stack
//!
//! Lets independent function transforms run stacked on top of the base
//! dispatcher in any order:
//!
//! - **Registry**: Process-wide level → liveness flag map
//! - **Layer stack**: Per-thread LIFO of active transform layers
//! - **Controller**: Overlays for entering a layer body and leaving it
//! - **Entry / Exit interceptors**: The two fallbacks bracketing every layer
//! - **Wrappers**: Tagging and untagging values at a level
//!
//! ## How a Call Flows
//!
//! ```text
//!   op(x)  ──►  EntryInterceptor       rewrite args for the top layer
//!                   │
//!                   ▼
//!              layer body (Differentiation / Batched hooks)
//!                   │  sub-dispatch
//!                   ▼
//!              ExitInterceptor         pop top, redispatch below
//!                   │
//!          ┌────────┴────────┐
//!     more layers        stack empty
//!   EntryInterceptor    base runtime
//! ```
//!
//! [`install`] registers the fallbacks on a dispatcher; transform bodies
//! are registered separately.

pub mod controller;
pub mod entry;
pub mod exit;
pub mod layer;
pub mod registry;
pub mod stack;
#[doc(hidden)]
pub mod testing;
pub mod wrapper;

use dynlayer_core::{Capability, Dispatcher};

pub use entry::EntryInterceptor;
pub use exit::ExitInterceptor;
pub use layer::{Layer, LayerSpec, Randomness, TransformKind};
pub use stack::{init_and_push, pop_and_delete_metadata, ContextSnapshot, WithoutTop};
pub use wrapper::{wrap, DeadWrapperFallback};

/// Register the entry, exit and dead-wrapper fallbacks on `dispatcher`.
pub fn install(dispatcher: &Dispatcher) {
    dispatcher.register_fallback(Capability::EntryInterceptor, EntryInterceptor);
    dispatcher.register_fallback(Capability::ExitInterceptor, ExitInterceptor);
    dispatcher.register_fallback(Capability::TaggedWrapper, DeadWrapperFallback);
    tracing::debug!("installed layer interceptors");
}
