//! # Entry Interceptor
//!
//! Fallback on [`Capability::EntryInterceptor`](dynlayer_core::Capability),
//! the highest-priority hook. Every operation dispatched while a layer is
//! active lands here first and is handed to the top layer's body:
//!
//! 1. reject in-place mutation of captured values under differentiation
//! 2. strip dead wrappers; under differentiation, tag every tensor at the
//!    top level
//! 3. switch to the top layer's entry overlay for the rest of the call
//! 4. redispatch

use dynlayer_core::value::{last_range, map_tensors_in_place};
use dynlayer_core::{config, DispatchError, Kernel, OperatorHandle, Stack};

use crate::controller;
use crate::layer::{Layer, TransformKind};
use crate::stack;
use crate::wrapper::{materialize_at, tagged_level, unwrap_if_dead};

/// The front fallback.
#[derive(Debug, Clone, Copy, Default)]
pub struct EntryInterceptor;

impl Kernel for EntryInterceptor {
    fn run(&self, op: &OperatorHandle, stack: &mut Stack) -> Result<(), DispatchError> {
        assert!(
            !stack::is_empty(),
            "`{}` reached the entry interceptor with no active layer",
            op.name()
        );
        let layer = stack::current();
        if config::get().show_dispatch_trace {
            tracing::debug!(op = %op.name(), stack = %stack::describe(), "entering layer");
        }

        check_for_captured_mutation(op, stack, &layer)?;

        let range = last_range(stack, op.schema().num_arguments());
        match layer.kind() {
            TransformKind::Differentiation => map_tensors_in_place(stack, range, |t| {
                materialize_at(&unwrap_if_dead(t), layer.level())
            }),
            TransformKind::Batching => map_tensors_in_place(stack, range, unwrap_if_dead),
        }

        let _overlay = controller::apply_scoped(controller::compute_entry_set(layer.kind()));
        op.call_boxed(stack)
    }

    fn kernel_name(&self) -> &'static str {
        "EntryInterceptor"
    }
}

/// An in-place operation under differentiation must target a value tagged
/// at the top level. Anything else was captured from outside the transform
/// and mutating it would silently corrupt the result.
fn check_for_captured_mutation(
    op: &OperatorHandle,
    stack: &Stack,
    layer: &Layer,
) -> Result<(), DispatchError> {
    if layer.kind() != TransformKind::Differentiation || !op.schema().is_inplace() {
        return Ok(());
    }
    let range = last_range(stack, op.schema().num_arguments());
    let mutated = stack[range.start].as_tensor().map(unwrap_if_dead);
    if mutated.as_ref().and_then(tagged_level) == Some(layer.level()) {
        return Ok(());
    }
    tracing::debug!(op = %op.name(), level = layer.level(), "rejected mutation of a captured value");
    Err(DispatchError::CapturedMutation {
        op: op.name().to_string(),
    })
}
