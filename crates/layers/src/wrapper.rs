//! # Wrapper Helpers
//!
//! Tagging, untagging and liveness handling for values crossing a layer
//! boundary, plus the fallback that lets dead wrappers behave as their
//! underlying values outside any transform.

use std::ops::Range;

use dynlayer_core::value::{last_range, map_tensors_in_place};
use dynlayer_core::{DispatchError, Kernel, Level, OperatorHandle, Stack, Tensor};

use crate::registry;

/// Tag `value` with `level`, sharing the level's liveness flag.
///
/// Panics if `level` is not registered.
pub fn wrap(value: &Tensor, level: Level) -> Tensor {
    Tensor::tagged(value.clone(), level, registry::get(level))
}

/// Level of a tagged wrapper; `None` for anything else.
pub fn tagged_level(value: &Tensor) -> Option<Level> {
    value.as_tagged().map(|w| w.level())
}

/// Strip dead wrappers until a live wrapper or an untagged value is reached.
pub fn unwrap_if_dead(value: &Tensor) -> Tensor {
    let mut current = value.clone();
    while let Some(wrapper) = current.as_tagged() {
        if wrapper.is_alive() {
            break;
        }
        let inner = wrapper.underlying().clone();
        current = inner;
    }
    current
}

/// Make sure `value` is tagged at `level`: untouched if it already is,
/// wrapped if untagged or tagged lower.
///
/// Panics if `value` is tagged at a higher level, which means it escaped the
/// transform that produced it.
pub fn materialize_at(value: &Tensor, level: Level) -> Tensor {
    match tagged_level(value) {
        Some(tagged) if tagged == level => value.clone(),
        Some(tagged) => {
            assert!(
                tagged < level,
                "escaped? value tagged at level {} reached level {}",
                tagged,
                level
            );
            wrap(value, level)
        }
        None => wrap(value, level),
    }
}

/// Strip the wrapper of `value` if it is tagged at `level`.
///
/// Panics if `value` is tagged above `level`.
pub fn unwrap_at(value: &Tensor, level: Level) -> Tensor {
    match value.as_tagged() {
        Some(wrapper) => {
            assert!(
                wrapper.level() <= level,
                "value tagged at level {} is still wrapped when leaving level {}",
                wrapper.level(),
                level
            );
            if wrapper.level() == level {
                wrapper.underlying().clone()
            } else {
                value.clone()
            }
        }
        None => value.clone(),
    }
}

/// Assert that no live tagged wrapper or batched wrapper is left in
/// `stack[range]`. Dead wrappers are allowed through: the base overlay leaves
/// the tagged-wrapper hook reachable, so [`DeadWrapperFallback`] strips them.
pub fn sanity_check_unwrapped(op: &str, stack: &Stack, range: Range<usize>) {
    for value in &stack[range] {
        value.for_each_tensor(&mut |t| {
            let t = unwrap_if_dead(t);
            assert!(
                t.as_tagged().is_none() && t.as_batched().is_none(),
                "`{}` reached the base runtime with a wrapped argument: {:?}",
                op,
                t
            );
        });
    }
}

/// Fallback on the tagged-wrapper capability.
///
/// Only reachable when no layer hides the capability, i.e. outside every
/// transform. There every wrapper must be dead: unwrap and redispatch.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeadWrapperFallback;

impl Kernel for DeadWrapperFallback {
    fn run(&self, op: &OperatorHandle, stack: &mut Stack) -> Result<(), DispatchError> {
        let range = last_range(stack, op.schema().num_arguments());
        map_tensors_in_place(stack, range, |t| {
            let unwrapped = unwrap_if_dead(t);
            if let Some(level) = tagged_level(&unwrapped) {
                panic!(
                    "live wrapper at level {} passed to `{}` outside its transform",
                    level,
                    op.name()
                );
            }
            unwrapped
        });
        op.call_boxed(stack)
    }

    fn kernel_name(&self) -> &'static str {
        "DeadWrapperFallback"
    }
}
