//! # Batching Rules
//!
//! Per-operator kernels on [`Capability::Batched`] that run an operator once
//! over a whole batch. A batched value at level L is a physical value whose
//! leading dimension is L's batch dimension; its *logical* shape drops that
//! dimension.
//!
//! Pointwise rule, for arguments batched at the current level:
//!
//! ```text
//! logical:   x [3]        y [2, 3]
//! physical:  x [B, 3]     y [B, 2, 3]
//! padded:    x [B, 1, 3]  y [B, 2, 3]   (unsqueeze after the batch dim)
//! result:    [B, 2, 3]  → batched at L
//! ```
//!
//! Unbatched arguments broadcast against the padded physical values as they
//! are. Arguments batched at another level pass through untouched; the
//! layer owning them handles them further down.
//!
//! Operators without a rule fail with [`DispatchError::MissingBatchRule`].
//! Random operators are caught one hook earlier, on
//! [`Capability::BatchMode`], and follow the layer's [`Randomness`] policy.

use dynlayer_core::capability::ExcludeCapabilityGuard;
use dynlayer_core::value::{pop_args, ArgExt};
use dynlayer_core::{
    Capability, DispatchError, Dispatcher, Level, OperatorHandle, Stack, Tensor, Value,
};
use dynlayer_layers::layer::Randomness;
use dynlayer_layers::stack;

// ============================================================================
// Helpers
// ============================================================================

/// The physical value of `t` if it is batched at `level`.
fn physical_at(t: &Tensor, level: Level) -> Option<Tensor> {
    t.as_batched()
        .filter(|b| b.level() == level)
        .map(|b| b.underlying().clone())
}

/// Insert size-1 dimensions after the batch dimension until `physical` has
/// logical rank `rank`.
fn pad_to_logical_rank(
    dispatcher: &Dispatcher,
    physical: Tensor,
    rank: usize,
) -> Result<Tensor, DispatchError> {
    let mut padded = physical;
    while padded.shape().rank() < rank + 1 {
        let out = dispatcher.call("unsqueeze", vec![padded.into(), Value::Int(1)])?;
        padded = single_tensor(out, "unsqueeze")?;
    }
    Ok(padded)
}

fn single_tensor(out: Vec<Value>, op: &str) -> Result<Tensor, DispatchError> {
    out.into_iter()
        .next()
        .and_then(Value::into_tensor)
        .ok_or_else(|| DispatchError::invalid_argument(op, 0, "expected a tensor result"))
}

fn wrap_results(stack: &mut Stack, num_returns: usize, level: Level) {
    let start = stack.len() - num_returns;
    for value in &mut stack[start..] {
        if let Value::Tensor(t) = value {
            *t = Tensor::batched(t.clone(), level);
        }
    }
}

// ============================================================================
// Rules
// ============================================================================

/// Batch rule for element-wise operators over tensor arguments.
fn pointwise_rule(op: &OperatorHandle, stack: &mut Stack) -> Result<(), DispatchError> {
    let level = stack::current().level();
    let num_args = op.schema().num_arguments();
    let mut args = pop_args(stack, num_args);

    let logical_rank = args
        .iter()
        .filter_map(Value::as_tensor)
        .map(|t| t.shape().rank())
        .max()
        .unwrap_or(0);

    let _below = ExcludeCapabilityGuard::new(Capability::Batched);
    let dispatcher = op.dispatcher();
    let mut batched = false;
    for arg in &mut args {
        let Some(physical) = arg.as_tensor().and_then(|t| physical_at(t, level)) else {
            continue;
        };
        batched = true;
        *arg = pad_to_logical_rank(&dispatcher, physical, logical_rank)?.into();
    }

    stack.extend(args);
    op.call_boxed(stack)?;
    if batched {
        wrap_results(stack, op.schema().num_returns(), level);
    }
    Ok(())
}

/// `unsqueeze(x, dim)` on a batched `x` unsqueezes the physical value at
/// `dim + 1`.
fn unsqueeze_rule(op: &OperatorHandle, stack: &mut Stack) -> Result<(), DispatchError> {
    let level = stack::current().level();
    let args = pop_args(stack, 2);
    let input = args.tensor_arg(op.name(), 0)?;
    let dim = args.int_arg(op.name(), 1)?;

    let _below = ExcludeCapabilityGuard::new(Capability::Batched);
    match physical_at(input, level) {
        Some(physical) => {
            if dim < 0 || dim as usize > input.shape().rank() {
                return Err(DispatchError::invalid_argument(
                    op.name(),
                    1,
                    format!("dim {} out of range for rank {}", dim, input.shape().rank()),
                ));
            }
            stack.push(physical.into());
            stack.push(Value::Int(dim + 1));
            op.call_boxed(stack)?;
            wrap_results(stack, 1, level);
        }
        None => {
            stack.extend(args);
            op.call_boxed(stack)?;
        }
    }
    Ok(())
}

/// `add_(self, other)`: `self` must be batched at the current level whenever
/// `other` is, since the batch cannot be written into an unbatched value.
fn add_inplace_rule(op: &OperatorHandle, stack: &mut Stack) -> Result<(), DispatchError> {
    let level = stack::current().level();
    let args = pop_args(stack, 2);
    let target = args.tensor_arg(op.name(), 0)?.clone();
    let other = args.tensor_arg(op.name(), 1)?.clone();

    let _below = ExcludeCapabilityGuard::new(Capability::Batched);
    let physical_target = physical_at(&target, level);
    let physical_other = physical_at(&other, level);

    let Some(physical_target) = physical_target else {
        if physical_other.is_some() {
            return Err(DispatchError::invalid_argument(
                op.name(),
                0,
                "in-place operation would write a batch into an unbatched value",
            ));
        }
        stack.extend(args);
        return op.call_boxed(stack);
    };

    let other = match physical_other {
        Some(physical) => {
            pad_to_logical_rank(&op.dispatcher(), physical, target.shape().rank())?
        }
        None => other,
    };
    stack.push(physical_target.into());
    stack.push(other.into());
    op.call_boxed(stack)?;

    // The physical result aliases the physical target; hand back the
    // batched handle the caller passed in.
    let start = stack.len() - 1;
    stack[start] = target.into();
    Ok(())
}

/// Fallback for operators without a rule.
fn missing_rule(op: &OperatorHandle, _stack: &mut Stack) -> Result<(), DispatchError> {
    tracing::debug!(op = %op.name(), "no batching rule");
    Err(DispatchError::MissingBatchRule {
        op: op.name().to_string(),
    })
}

/// `rand(size)` under a batching layer.
fn rand_batch_mode(op: &OperatorHandle, stack: &mut Stack) -> Result<(), DispatchError> {
    let layer = stack::current();
    let _below = ExcludeCapabilityGuard::new(Capability::BatchMode);
    match layer.randomness() {
        Randomness::Error => Err(DispatchError::RandomnessDisallowed {
            op: op.name().to_string(),
        }),
        Randomness::Same => op.call_boxed(stack),
        Randomness::Different => {
            let args = pop_args(stack, 1);
            let sizes = args.sizes_arg(op.name(), 0)?;
            let mut batched_sizes = Vec::with_capacity(sizes.len() + 1);
            batched_sizes.push(layer.batch_size() as i64);
            batched_sizes.extend(sizes.iter().map(|&s| s as i64));
            stack.push(Value::IntList(batched_sizes));
            op.call_boxed(stack)?;
            wrap_results(stack, 1, layer.level());
            Ok(())
        }
    }
}

/// Register the batching rules.
pub fn install(dispatcher: &Dispatcher) -> Result<(), DispatchError> {
    for name in ["add", "mul", "neg"] {
        dispatcher.register_kernel(name, Capability::Batched, pointwise_rule)?;
    }
    dispatcher.register_kernel("unsqueeze", Capability::Batched, unsqueeze_rule)?;
    dispatcher.register_kernel("add_", Capability::Batched, add_inplace_rule)?;
    dispatcher.register_kernel("rand", Capability::BatchMode, rand_batch_mode)?;
    dispatcher.register_fallback(Capability::Batched, missing_rule);
    Ok(())
}
