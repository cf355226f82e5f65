//! # Values and the Boxed Stack
//!
//! Kernels communicate through a [`Stack`]: on entry the last
//! `schema.num_arguments()` values are the arguments, on exit they have been
//! replaced by `schema.num_returns()` results.

use std::ops::Range;

use crate::capability::{Capability, CapabilitySet};
use crate::error::DispatchError;
use crate::tensor::Tensor;

/// A boxed argument or result.
#[derive(Debug, Clone)]
pub enum Value {
    /// Absent optional value
    None,
    /// Boolean scalar
    Bool(bool),
    /// Integer scalar
    Int(i64),
    /// Floating-point scalar
    Float(f64),
    /// List of integers (sizes, dims)
    IntList(Vec<i64>),
    /// A tensor, possibly wrapped
    Tensor(Tensor),
    /// A sequence of values, e.g. a tensor list
    List(Vec<Value>),
}

/// The boxed calling convention shared by every kernel.
pub type Stack = Vec<Value>;

impl Value {
    /// The tensor, if this value is one.
    pub fn as_tensor(&self) -> Option<&Tensor> {
        match self {
            Value::Tensor(t) => Some(t),
            _ => None,
        }
    }

    /// Consume into a tensor, if this value is one.
    pub fn into_tensor(self) -> Option<Tensor> {
        match self {
            Value::Tensor(t) => Some(t),
            _ => None,
        }
    }

    /// Capabilities carried by this value, including nested list members.
    pub fn capabilities(&self) -> CapabilitySet {
        match self {
            Value::Tensor(t) => t.capabilities(),
            Value::List(items) => items
                .iter()
                .fold(CapabilitySet::from(Capability::Backend), |acc, v| {
                    acc | v.capabilities()
                }),
            _ => CapabilitySet::from(Capability::Backend),
        }
    }

    /// Visit every tensor in this value, descending into lists.
    pub fn for_each_tensor(&self, f: &mut impl FnMut(&Tensor)) {
        match self {
            Value::Tensor(t) => f(t),
            Value::List(items) => items.iter().for_each(|v| v.for_each_tensor(f)),
            _ => {}
        }
    }

    fn map_tensors(&mut self, f: &mut impl FnMut(&Tensor) -> Tensor) {
        match self {
            Value::Tensor(t) => *t = f(t),
            Value::List(items) => items.iter_mut().for_each(|v| v.map_tensors(f)),
            _ => {}
        }
    }
}

impl From<Tensor> for Value {
    fn from(t: Tensor) -> Self {
        Value::Tensor(t)
    }
}

/// Replace every tensor in `stack[range]` (including list members) by `f(tensor)`.
pub fn map_tensors_in_place(
    stack: &mut Stack,
    range: Range<usize>,
    mut f: impl FnMut(&Tensor) -> Tensor,
) {
    assert!(
        range.start <= range.end && range.end <= stack.len(),
        "stack range {:?} out of bounds for stack of {}",
        range,
        stack.len()
    );
    for value in &mut stack[range] {
        value.map_tensors(&mut f);
    }
}

/// Remove and return the last `n` values, in order.
pub fn pop_args(stack: &mut Stack, n: usize) -> Vec<Value> {
    assert!(n <= stack.len(), "stack underflow: need {} values, have {}", n, stack.len());
    stack.split_off(stack.len() - n)
}

/// Range of the last `n` values.
pub fn last_range(stack: &Stack, n: usize) -> Range<usize> {
    assert!(n <= stack.len(), "stack underflow: need {} values, have {}", n, stack.len());
    stack.len() - n..stack.len()
}

/// Typed accessors used by kernels to read their arguments.
pub trait ArgExt {
    /// Argument `index` as a tensor.
    fn tensor_arg(&self, op: &str, index: usize) -> Result<&Tensor, DispatchError>;
    /// Argument `index` as a list of tensors.
    fn tensor_list_arg(&self, op: &str, index: usize) -> Result<Vec<Tensor>, DispatchError>;
    /// Argument `index` as a list of non-negative sizes.
    fn sizes_arg(&self, op: &str, index: usize) -> Result<Vec<usize>, DispatchError>;
    /// Argument `index` as an integer.
    fn int_arg(&self, op: &str, index: usize) -> Result<i64, DispatchError>;
}

impl ArgExt for [Value] {
    fn tensor_arg(&self, op: &str, index: usize) -> Result<&Tensor, DispatchError> {
        self.get(index)
            .and_then(Value::as_tensor)
            .ok_or_else(|| DispatchError::invalid_argument(op, index, "expected a tensor"))
    }

    fn tensor_list_arg(&self, op: &str, index: usize) -> Result<Vec<Tensor>, DispatchError> {
        match self.get(index) {
            Some(Value::List(items)) => items
                .iter()
                .map(|v| {
                    v.as_tensor().cloned().ok_or_else(|| {
                        DispatchError::invalid_argument(op, index, "expected a list of tensors")
                    })
                })
                .collect(),
            _ => Err(DispatchError::invalid_argument(op, index, "expected a list of tensors")),
        }
    }

    fn sizes_arg(&self, op: &str, index: usize) -> Result<Vec<usize>, DispatchError> {
        match self.get(index) {
            Some(Value::IntList(sizes)) => sizes
                .iter()
                .map(|&s| {
                    usize::try_from(s).map_err(|_| {
                        DispatchError::invalid_argument(op, index, format!("negative size {}", s))
                    })
                })
                .collect(),
            _ => Err(DispatchError::invalid_argument(op, index, "expected a list of sizes")),
        }
    }

    fn int_arg(&self, op: &str, index: usize) -> Result<i64, DispatchError> {
        match self.get(index) {
            Some(Value::Int(v)) => Ok(*v),
            _ => Err(DispatchError::invalid_argument(op, index, "expected an integer")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_capabilities_are_unioned() {
        let batched = Tensor::batched(Tensor::matrix(2, 1, vec![1.0, 2.0]), 1);
        let list = Value::List(vec![Value::Tensor(Tensor::scalar(1.0)), Value::Tensor(batched)]);
        assert!(list.capabilities().contains(Capability::Batched));
        assert!(list.capabilities().contains(Capability::Backend));
    }

    #[test]
    fn test_map_tensors_in_place_reaches_list_members() {
        let mut stack: Stack = vec![
            Value::Int(7),
            Value::Tensor(Tensor::scalar(1.0)),
            Value::List(vec![Value::Tensor(Tensor::scalar(2.0)), Value::None]),
        ];
        let mut seen = 0;
        map_tensors_in_place(&mut stack, 1..3, |t| {
            seen += 1;
            Tensor::scalar(t.to_vec()[0] * 10.0)
        });

        assert_eq!(seen, 2);
        assert_eq!(stack[1].as_tensor().unwrap().to_vec(), vec![10.0]);
        match &stack[2] {
            Value::List(items) => assert_eq!(items[0].as_tensor().unwrap().to_vec(), vec![20.0]),
            other => panic!("expected list, got {:?}", other),
        }
    }

    #[test]
    fn test_pop_args_preserves_order() {
        let mut stack: Stack = vec![Value::Int(1), Value::Int(2), Value::Int(3)];
        let args = pop_args(&mut stack, 2);
        assert_eq!(stack.len(), 1);
        assert!(matches!(args.as_slice(), [Value::Int(2), Value::Int(3)]));
    }

    #[test]
    fn test_arg_accessors_report_index() {
        let args = vec![Value::Int(3), Value::IntList(vec![2, -1])];
        assert_eq!(args.int_arg("op", 0), Ok(3));
        let err = args.sizes_arg("op", 1).unwrap_err();
        assert!(matches!(err, DispatchError::InvalidArgument { index: 1, .. }));
        assert!(args.tensor_arg("op", 0).is_err());
    }
}
