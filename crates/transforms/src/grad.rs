//! # Differentiation Body
//!
//! The minimal body a differentiation layer runs on every operation: hide
//! its own hooks, hand the call down (the exit interceptor takes it from
//! there), and record which operator produced each output tagged at the
//! layer's level.
//!
//! Recording follows the thread's grad mode at the time the body runs, so a
//! layer whose outer scope had grad mode off records nothing on its own
//! level's outputs.

use dynlayer_core::capability::{CapabilitySet, ExcludeCapabilityGuard};
use dynlayer_core::value::last_range;
use dynlayer_core::{grad_mode, Capability, DispatchError, Dispatcher, Kernel, OperatorHandle, Stack};
use dynlayer_layers::stack;

/// Fallback on [`Capability::Differentiation`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DifferentiationBody;

impl Kernel for DifferentiationBody {
    fn run(&self, op: &OperatorHandle, stack: &mut Stack) -> Result<(), DispatchError> {
        let level = stack::current().level();
        let record = grad_mode::is_enabled();

        {
            let _below = ExcludeCapabilityGuard::new(CapabilitySet::of(&[
                Capability::Differentiation,
                Capability::InplaceOrView,
            ]));
            op.call_boxed(stack)?;
        }

        if record {
            let results = last_range(stack, op.schema().num_returns());
            for value in &stack[results] {
                value.for_each_tensor(&mut |t| {
                    if let Some(wrapper) = t.as_tagged() {
                        if wrapper.level() == level {
                            wrapper.set_grad_fn(op.name());
                        }
                    }
                });
            }
        }
        Ok(())
    }

    fn kernel_name(&self) -> &'static str {
        "DifferentiationBody"
    }
}

/// Register the differentiation body.
pub fn install(dispatcher: &Dispatcher) {
    dispatcher.register_fallback(Capability::Differentiation, DifferentiationBody);
}
