//! # Capability-Set Controller
//!
//! Computes the overlays the interceptors switch between.
//!
//! The *interception family* is every capability a layer can own or route
//! through: everything except [`Capability::Backend`]. While a transform
//! body runs, the whole family is hidden except the hooks its kind owns and
//! the exit interceptor, so a sub-dispatch either reaches the body again or
//! leaves the layer.
//!
//! ```text
//!              included                 excluded
//! entry set:   ExitInterceptor (+Mode)  family - owned - ExitInterceptor
//! return:      .. + EntryInterceptor    .. - EntryInterceptor
//! ```

use dynlayer_core::capability::{
    self, Capability, CapabilitySet, ForceCapabilityGuard, LocalCapabilities,
};

use crate::layer::TransformKind;

/// Every capability except the base runtime.
pub fn interception_family() -> CapabilitySet {
    CapabilitySet::all_interception()
}

/// Capabilities a transform kind runs its body on.
pub fn owned_capabilities(kind: TransformKind) -> CapabilitySet {
    match kind {
        TransformKind::Differentiation => {
            CapabilitySet::of(&[Capability::Differentiation, Capability::InplaceOrView])
        }
        TransformKind::Batching => CapabilitySet::from(Capability::Batched),
    }
}

/// The current overlay with the whole family excluded and none of it included.
pub fn zeroed_capabilities() -> LocalCapabilities {
    let mut set = capability::local();
    set.excluded = set.excluded | interception_family();
    set.included = set.included - interception_family();
    set
}

/// Overlay for running the body of a `kind` layer.
pub fn compute_entry_set(kind: TransformKind) -> LocalCapabilities {
    let mut set = zeroed_capabilities();
    set.excluded = set.excluded - owned_capabilities(kind);
    set = set.enable(Capability::ExitInterceptor);
    if kind == TransformKind::Batching {
        set = set.enable(Capability::BatchMode);
    }
    set
}

/// The current overlay with the entry interceptor reachable again.
pub fn compute_return_to_front_set() -> LocalCapabilities {
    capability::local().enable(Capability::EntryInterceptor)
}

/// Force `set` until the returned guard drops.
pub fn apply_scoped(set: LocalCapabilities) -> ForceCapabilityGuard {
    ForceCapabilityGuard::new(set)
}

/// Include or un-include both interceptors. Called when the stack goes
/// from empty to one layer and back.
pub fn set_interception_included(included: bool) {
    capability::set_included(Capability::EntryInterceptor, included);
    capability::set_included(Capability::ExitInterceptor, included);
}
