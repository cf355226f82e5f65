//! # Error Types
//!
//! Errors here are the *recoverable* failures of a dispatched call: the
//! caller did something the runtime or an active transform refuses to do.
//! They propagate out of kernels with `?` and unwind every scoped guard on
//! the way.
//!
//! Broken layering invariants (stack underflow, level mismatch, escaped
//! wrappers) are bugs in the interpreter itself and panic instead.

use thiserror::Error;

use crate::capability::CapabilitySet;
use crate::shape::Shape;

/// Errors produced while dispatching an operator.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum DispatchError {
    /// No operator with this name is registered.
    #[error("Unknown operator: {0}")]
    UnknownOperator(String),

    /// Every capability in the dispatch set fell through.
    #[error("No kernel for operator `{op}` (dispatch set {set})")]
    NoKernel { op: String, set: CapabilitySet },

    /// An in-place operation inside a differentiation layer targeted a value
    /// captured from an outer scope.
    #[error(
        "During a differentiation transform, the function attempted to call in-place \
         operation `{op}` that would mutate a captured value. This is not supported; \
         rewrite the function to explicitly accept the mutated value as an input."
    )]
    CapturedMutation { op: String },

    /// The batching body has no rule for this operator.
    #[error("Batching rule not implemented for operator `{op}`")]
    MissingBatchRule { op: String },

    /// A random operator ran under a batching layer whose policy forbids it.
    #[error(
        "Random operator `{op}` called under a batching layer with randomness policy `error`; \
         choose `same` or `different` to allow it"
    )]
    RandomnessDisallowed { op: String },

    /// An argument had the wrong type for the kernel that received it.
    #[error("Invalid argument {index} for `{op}`: {reason}")]
    InvalidArgument {
        op: String,
        index: usize,
        reason: String,
    },

    /// Two tensor shapes could not be combined.
    #[error("Shape mismatch in `{op}`: {left} vs {right}")]
    ShapeMismatch { op: String, left: Shape, right: Shape },
}

impl DispatchError {
    /// Shorthand for [`DispatchError::InvalidArgument`].
    pub fn invalid_argument(op: &str, index: usize, reason: impl Into<String>) -> Self {
        DispatchError::InvalidArgument {
            op: op.to_string(),
            index,
            reason: reason.into(),
        }
    }
}
