//! # Core - Dispatch Runtime Foundations
//!
//! This crate provides the base runtime that transform layers plug into:
//!
//! - **Capabilities**: Ordered hook bits, sets, and the per-thread include/exclude overlay
//! - **Values**: Dense tensors, level-tagged and batched wrappers, and the boxed stack
//! - **Schemas**: Operator signatures with aliasing annotations
//! - **Dispatcher**: Per-capability kernels and fallbacks, selected by priority
//! - **Grad mode**: Ambient differentiation flags
//! - **Trace**: Opt-in recording of which hook handled each call
//! - **Config**: Process-wide diagnostic switches
//!
//! ## Design Philosophy
//!
//! The dispatcher knows nothing about transforms. A transform is a set of
//! kernels registered on capabilities, and the thread's overlay decides
//! which of them are reachable. Every overlay change is a scoped guard, so
//! leaving a scope by return, `?` or panic always restores the overlay.

pub mod capability;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod grad_mode;
pub mod schema;
pub mod shape;
pub mod tensor;
pub mod trace;
pub mod value;

// Re-export key types at crate root for convenience
pub use capability::{Capability, CapabilitySet, LocalCapabilities};
pub use config::DispatchConfig;
pub use dispatcher::{Dispatcher, Kernel, OperatorHandle};
pub use error::DispatchError;
pub use schema::{Argument, Schema};
pub use shape::Shape;
pub use tensor::{Level, LivenessHandle, Tensor};
pub use trace::TraceNode;
pub use value::{Stack, Value};
