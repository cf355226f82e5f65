//! Integration tests for the entry and exit interceptors.
//!
//! These drive a tiny dispatcher through the installed fallbacks:
//! - Values are tagged on entry and results re-tagged on exit
//! - Captured mutation is rejected before anything changes
//! - Every exit path restores the overlay and the layer stack

use std::panic::AssertUnwindSafe;

use dynlayer_core::capability::{self, Capability, ExcludeCapabilityGuard};
use dynlayer_core::value::pop_args;
use dynlayer_core::{
    trace, Argument, DispatchError, Dispatcher, OperatorHandle, Schema, Stack, Tensor, Value,
};
use dynlayer_layers::layer::{LayerSpec, Randomness};
use dynlayer_layers::wrapper::tagged_level;
use dynlayer_layers::{install, registry, stack, testing};

fn scalar_of(value: &Value) -> f64 {
    value.as_tensor().expect("tensor").to_vec()[0]
}

/// `add`, `add_` and `fail` on scalars, plus a pass-through differentiation body.
fn toy_dispatcher() -> Dispatcher {
    let d = Dispatcher::new();
    install(&d);

    d.register_operator(
        Schema::new("add")
            .arg(Argument::tensor("self"))
            .arg(Argument::tensor("other"))
            .ret(Argument::tensor("out")),
    );
    d.register_operator(
        Schema::new("add_")
            .arg(Argument::tensor("self").written('a'))
            .arg(Argument::tensor("other"))
            .ret(Argument::tensor("out").written('a')),
    );
    d.register_operator(
        Schema::new("fail")
            .arg(Argument::tensor("self"))
            .ret(Argument::tensor("out")),
    );

    d.register_kernel("add", Capability::Backend, |_op: &OperatorHandle, stack: &mut Stack| {
        let args = pop_args(stack, 2);
        stack.push(Tensor::scalar(scalar_of(&args[0]) + scalar_of(&args[1])).into());
        Ok(())
    })
    .unwrap();
    d.register_kernel("add_", Capability::Backend, |_op: &OperatorHandle, stack: &mut Stack| {
        let args = pop_args(stack, 2);
        let target = args[0].as_tensor().unwrap().clone();
        let rhs = scalar_of(&args[1]);
        target.as_dense().expect("dense at the base").write().data[0] += rhs;
        stack.push(target.into());
        Ok(())
    })
    .unwrap();
    d.register_kernel("fail", Capability::Backend, |op: &OperatorHandle, _stack: &mut Stack| {
        Err(DispatchError::invalid_argument(op.name(), 0, "always fails"))
    })
    .unwrap();

    d.register_fallback(
        Capability::Differentiation,
        |op: &OperatorHandle, stack: &mut Stack| {
            let _below = ExcludeCapabilityGuard::new(capability::CapabilitySet::of(&[
                Capability::Differentiation,
                Capability::InplaceOrView,
            ]));
            op.call_boxed(stack)
        },
    );
    d
}

fn grad_layer() -> LayerSpec {
    LayerSpec::differentiation(Some(true), Some(true))
}

// ============================================================================
// Differentiation Layer
// ============================================================================

#[test]
fn single_layer_tags_result() {
    let _serial = testing::serial();
    let d = toy_dispatcher();
    let before = capability::local();

    let level = stack::init_and_push(grad_layer());
    let out = d
        .call("add", vec![Tensor::scalar(1.0).into(), Tensor::scalar(2.0).into()])
        .unwrap();
    let result = out[0].as_tensor().unwrap().clone();

    assert_eq!(out.len(), 1);
    assert_eq!(tagged_level(&result), Some(level));
    assert!(result.as_tagged().unwrap().is_alive());
    assert_eq!(result.to_vec(), vec![3.0]);
    assert_eq!(stack::levels(), vec![1]);

    stack::pop_and_delete_metadata();
    assert!(!result.as_tagged().unwrap().is_alive());
    assert_eq!(capability::local(), before);

    // Outside the transform the dead result behaves as a plain value.
    let again = d.call("add", vec![result.into(), Tensor::scalar(1.0).into()]).unwrap();
    assert!(again[0].as_tensor().unwrap().as_tagged().is_none());
    assert_eq!(scalar_of(&again[0]), 4.0);
}

#[test]
fn dispatch_visits_every_hook_in_order() {
    let _serial = testing::serial();
    let d = toy_dispatcher();
    stack::init_and_push(grad_layer());

    let (out, roots) = trace::record(|| {
        d.call("add", vec![Tensor::scalar(1.0).into(), Tensor::scalar(2.0).into()])
    });
    assert!(out.is_ok());
    assert_eq!(
        roots[0].capabilities(),
        vec![
            Capability::EntryInterceptor,
            Capability::Differentiation,
            Capability::ExitInterceptor,
            Capability::Backend,
        ]
    );
}

#[test]
fn captured_mutation_is_rejected_without_side_effects() {
    let _serial = testing::serial();
    let d = toy_dispatcher();
    let captured = Tensor::scalar(1.0);

    stack::init_and_push(grad_layer());
    let overlay = capability::local();
    let err = d
        .call("add_", vec![captured.clone().into(), Tensor::scalar(5.0).into()])
        .unwrap_err();

    assert_eq!(err, DispatchError::CapturedMutation { op: "add_".into() });
    assert!(err.to_string().contains("in-place operation `add_`"));
    assert_eq!(captured.to_vec(), vec![1.0]);
    assert_eq!(stack::levels(), vec![1]);
    assert_eq!(registry::active_levels(), vec![1]);
    assert_eq!(capability::local(), overlay);
}

#[test]
fn inplace_on_value_tagged_at_top_level_is_allowed() {
    let _serial = testing::serial();
    let d = toy_dispatcher();
    let base = Tensor::scalar(1.0);

    let level = stack::init_and_push(grad_layer());
    let x = dynlayer_layers::wrap(&base, level);
    let out = d
        .call("add_", vec![x.clone().into(), Tensor::scalar(5.0).into()])
        .unwrap();

    assert_eq!(tagged_level(out[0].as_tensor().unwrap()), Some(level));
    assert_eq!(base.to_vec(), vec![6.0]);
}

#[test]
fn nested_differentiation_layers_tag_at_each_level() {
    let _serial = testing::serial();
    let d = toy_dispatcher();

    stack::init_and_push(grad_layer());
    stack::init_and_push(grad_layer());
    let (out, roots) = trace::record(|| {
        d.call("add", vec![Tensor::scalar(1.0).into(), Tensor::scalar(2.0).into()])
            .unwrap()
    });

    let result = out[0].as_tensor().unwrap();
    assert_eq!(tagged_level(result), Some(2));
    let inner = result.as_tagged().unwrap().underlying();
    assert_eq!(tagged_level(inner), Some(1));
    assert!(tagged_level(inner.as_tagged().unwrap().underlying()).is_none());
    // Entry, body, exit once per layer, then the base.
    assert_eq!(roots[0].depth(), 7);
    assert_eq!(stack::levels(), vec![1, 2]);
}

// ============================================================================
// Unwinding
// ============================================================================

#[test]
fn error_restores_overlay_and_stack() {
    let _serial = testing::serial();
    let d = toy_dispatcher();

    stack::init_and_push(grad_layer());
    stack::init_and_push(LayerSpec::batching(3, Randomness::Error));
    let overlay = capability::local();

    let err = d.call("fail", vec![Tensor::scalar(1.0).into()]).unwrap_err();
    assert!(matches!(err, DispatchError::InvalidArgument { .. }));
    assert_eq!(stack::levels(), vec![1, 2]);
    assert_eq!(capability::local(), overlay);
}

#[test]
fn panic_in_kernel_restores_overlay_and_stack() {
    let _serial = testing::serial();
    let d = toy_dispatcher();
    d.register_kernel(
        "fail",
        Capability::Backend,
        |_op: &OperatorHandle, _stack: &mut Stack| -> Result<(), DispatchError> {
            panic!("kernel bug")
        },
    )
    .unwrap();

    stack::init_and_push(grad_layer());
    let overlay = capability::local();

    let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
        let _ = d.call("fail", vec![Tensor::scalar(1.0).into()]);
    }));
    assert!(result.is_err());
    assert_eq!(stack::levels(), vec![1]);
    assert_eq!(capability::local(), overlay);
}

#[test]
fn overlay_is_identical_after_full_round_trip() {
    let _serial = testing::serial();
    let d = toy_dispatcher();
    let before = capability::local();

    stack::init_and_push(grad_layer());
    stack::init_and_push(LayerSpec::batching(2, Randomness::Same));
    d.call("add", vec![Tensor::scalar(1.0).into(), Tensor::scalar(2.0).into()])
        .unwrap();
    stack::pop_and_delete_metadata();
    stack::pop_and_delete_metadata();

    assert_eq!(capability::local(), before);
    assert!(!registry::is_any_active());
}

// ============================================================================
// Batching Layer
// ============================================================================

#[test]
fn batching_layer_passes_unbatched_values_through() {
    let _serial = testing::serial();
    let d = toy_dispatcher();

    stack::init_and_push(LayerSpec::batching(4, Randomness::Error));
    let (out, roots) = trace::record(|| {
        d.call("add", vec![Tensor::scalar(1.0).into(), Tensor::scalar(2.0).into()])
            .unwrap()
    });

    let result = out[0].as_tensor().unwrap();
    assert!(result.as_tagged().is_none());
    assert!(result.as_batched().is_none());
    assert_eq!(
        roots[0].capabilities(),
        vec![
            Capability::EntryInterceptor,
            Capability::ExitInterceptor,
            Capability::Backend,
        ]
    );
}
