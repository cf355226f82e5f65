//! # Exit Interceptor
//!
//! Fallback on [`Capability::ExitInterceptor`](dynlayer_core::Capability),
//! the lowest hook above the base runtime. A sub-dispatch issued by a layer's
//! body lands here once the body's own hooks are hidden, and is handed to the
//! layer below:
//!
//! ```text
//! args ─┬─ (differentiation) copy, untag level L in the copy
//!       ├─ pop layer L                 ┐
//!       ├─ prior grad mode off?        │ scoped
//!       ├─ overlay: saved or to-front  ┘
//!       ├─ redispatch
//!       └─ (differentiation) tag results at L, refresh argument metadata,
//!          drop the copy
//! ```
//!
//! If popping L emptied the stack, the overlay captured when L was built is
//! restored and the call reaches the base runtime. Otherwise the entry
//! interceptor is re-enabled so the next layer down picks the call up.

use dynlayer_core::capability::ForceCapabilityGuard;
use dynlayer_core::grad_mode::{ForwardGradModeGuard, GradModeGuard};
use dynlayer_core::value::{last_range, map_tensors_in_place};
use dynlayer_core::{config, DispatchError, Kernel, OperatorHandle, Stack};

use crate::controller;
use crate::layer::TransformKind;
use crate::stack::{self, WithoutTop};
use crate::wrapper::{sanity_check_unwrapped, unwrap_at, wrap};

/// The back fallback.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExitInterceptor;

impl Kernel for ExitInterceptor {
    fn run(&self, op: &OperatorHandle, stack: &mut Stack) -> Result<(), DispatchError> {
        let layer = stack::current();
        let level = layer.level();
        let differentiating = layer.kind() == TransformKind::Differentiation;
        let num_args = op.schema().num_arguments();
        let num_returns = op.schema().num_returns();

        if differentiating {
            let front = last_range(stack, num_args).start;
            stack.extend_from_within(front..front + num_args);
            let copy = last_range(stack, num_args);
            map_tensors_in_place(stack, copy, |t| unwrap_at(t, level));
        }

        {
            // Dropped in reverse: overlay first, then the layer is pushed back.
            let _without_top = WithoutTop::new();
            let _grad = (differentiating && layer.prior_grad() == Some(false))
                .then(|| GradModeGuard::new(false));
            let _forward_grad = (differentiating && layer.prior_forward_grad() == Some(false))
                .then(|| ForwardGradModeGuard::new(false));

            let _overlay = if stack::is_empty() {
                if config::get().check_unwrapped_at_base {
                    sanity_check_unwrapped(op.name(), stack, last_range(stack, num_args));
                }
                if config::get().show_dispatch_trace {
                    tracing::debug!(op = %op.name(), "leaving transform layers");
                }
                ForceCapabilityGuard::new(layer.saved_capabilities())
            } else {
                controller::apply_scoped(controller::compute_return_to_front_set())
            };

            op.call_boxed(stack)?;

            if config::get().show_dispatch_trace && stack::is_empty() {
                tracing::debug!(op = %op.name(), "re-entering transform layers");
            }
        }

        if differentiating {
            let results = last_range(stack, num_returns);
            map_tensors_in_place(stack, results.clone(), |t| wrap(t, level));

            let args_front = results.start - num_args;
            for value in &stack[args_front..results.start] {
                value.for_each_tensor(&mut |t| {
                    if let Some(wrapper) = t.as_tagged() {
                        wrapper.refresh_metadata();
                    }
                });
            }
            stack.drain(args_front..results.start);
        }
        Ok(())
    }

    fn kernel_name(&self) -> &'static str {
        "ExitInterceptor"
    }
}
