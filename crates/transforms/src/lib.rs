//! # Transforms - Reference Bodies for the Layer Stack
//!
//! Everything needed to drive the layer stack end to end:
//!
//! - **Ops**: A small base operator library on dense storage
//! - **Grad**: The differentiation body
//! - **Batching**: Batch rules, the missing-rule fallback and randomness handling
//! - **Scope**: `grad_scope`, `batch_scope` and the `LayerGuard` behind them
//!
//! [`runtime`] builds a dispatcher with all of it installed.
//!
//! ## Example
//!
//! ```rust
//! use dynlayer_core::Tensor;
//! use dynlayer_layers::Randomness;
//! use dynlayer_transforms::runtime;
//! use dynlayer_transforms::scope::{batch_scope, grad_scope};
//!
//! let rt = runtime().unwrap();
//! let x = Tensor::vector(vec![1.0, 2.0, 3.0]);
//!
//! let y = grad_scope(|g| {
//!     let x = dynlayer_layers::wrap(&x, g);
//!     batch_scope(3, Randomness::Error, |b| {
//!         let xs = Tensor::batched(x.clone(), b);
//!         let ys = rt.mul(&xs, &xs)?;
//!         assert_eq!(ys.as_batched().unwrap().level(), b);
//!         Ok::<_, dynlayer_core::DispatchError>(ys.as_batched().unwrap().underlying().clone())
//!     })
//! })
//! .unwrap();
//!
//! assert_eq!(y.to_vec(), vec![1.0, 4.0, 9.0]);
//! ```

pub mod batching;
pub mod grad;
pub mod ops;
pub mod scope;

use dynlayer_core::{DispatchError, Dispatcher, Tensor, Value};

pub use scope::{batch_scope, grad_scope, LayerGuard};

/// Register the base operators, the layer interceptors, the differentiation
/// body and the batching rules on `dispatcher`.
pub fn install(dispatcher: &Dispatcher) -> Result<(), DispatchError> {
    ops::register(dispatcher)?;
    dynlayer_layers::install(dispatcher);
    grad::install(dispatcher);
    batching::install(dispatcher)?;
    Ok(())
}

/// A fresh dispatcher with everything installed.
pub fn runtime() -> Result<Runtime, DispatchError> {
    let dispatcher = Dispatcher::new();
    install(&dispatcher)?;
    Ok(Runtime { dispatcher })
}

/// Typed entry points for the base operators.
#[derive(Debug, Clone)]
pub struct Runtime {
    dispatcher: Dispatcher,
}

impl Runtime {
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    fn call1(&self, op: &str, args: Vec<Value>) -> Result<Tensor, DispatchError> {
        self.dispatcher
            .call(op, args)?
            .into_iter()
            .next()
            .and_then(Value::into_tensor)
            .ok_or_else(|| DispatchError::invalid_argument(op, 0, "expected a tensor result"))
    }

    pub fn add(&self, a: &Tensor, b: &Tensor) -> Result<Tensor, DispatchError> {
        self.call1("add", vec![a.clone().into(), b.clone().into()])
    }

    pub fn mul(&self, a: &Tensor, b: &Tensor) -> Result<Tensor, DispatchError> {
        self.call1("mul", vec![a.clone().into(), b.clone().into()])
    }

    pub fn neg(&self, a: &Tensor) -> Result<Tensor, DispatchError> {
        self.call1("neg", vec![a.clone().into()])
    }

    pub fn sum(&self, a: &Tensor) -> Result<Tensor, DispatchError> {
        self.call1("sum", vec![a.clone().into()])
    }

    pub fn add_n(&self, tensors: &[Tensor]) -> Result<Tensor, DispatchError> {
        let list = Value::List(tensors.iter().cloned().map(Value::from).collect());
        self.call1("add_n", vec![list])
    }

    pub fn unsqueeze(&self, a: &Tensor, dim: i64) -> Result<Tensor, DispatchError> {
        self.call1("unsqueeze", vec![a.clone().into(), Value::Int(dim)])
    }

    pub fn zeros(&self, size: &[i64]) -> Result<Tensor, DispatchError> {
        self.call1("zeros", vec![Value::IntList(size.to_vec())])
    }

    pub fn rand(&self, size: &[i64]) -> Result<Tensor, DispatchError> {
        self.call1("rand", vec![Value::IntList(size.to_vec())])
    }

    /// `a += b` in place; returns `a`'s handle as seen by the caller's layer.
    pub fn add_(&self, a: &Tensor, b: &Tensor) -> Result<Tensor, DispatchError> {
        self.call1("add_", vec![a.clone().into(), b.clone().into()])
    }

    pub fn resize_(&self, a: &Tensor, size: &[i64]) -> Result<Tensor, DispatchError> {
        self.call1("resize_", vec![a.clone().into(), Value::IntList(size.to_vec())])
    }
}
