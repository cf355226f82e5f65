//! # Base Operators
//!
//! The operators every layer in this workspace is exercised with, and their
//! backend kernels on dense storage. Kernels here never see wrappers: by the
//! time a call reaches [`Capability::Backend`] every layer has unwrapped its
//! arguments.
//!
//! ## Operations
//!
//! | Op | Schema | Result |
//! |----|--------|--------|
//! | add | `add(Tensor self, Tensor other) -> Tensor` | a + b, broadcast |
//! | mul | `mul(Tensor self, Tensor other) -> Tensor` | a × b, broadcast |
//! | neg | `neg(Tensor self) -> Tensor` | -a |
//! | sum | `sum(Tensor self) -> Tensor` | Σa as a scalar |
//! | add_n | `add_n(Tensor[] tensors) -> Tensor` | Σ tensors, broadcast |
//! | unsqueeze | `unsqueeze(Tensor self, int dim) -> Tensor` | size-1 dim at `dim` |
//! | zeros | `zeros(int[] size) -> Tensor` | zero-filled |
//! | rand | `rand(int[] size) -> Tensor` | uniform on [0, 1) |
//! | add_ | `add_(Tensor(a!) self, Tensor other) -> Tensor(a!)` | self += other |
//! | resize_ | `resize_(Tensor(a!) self, int[] size) -> Tensor(a!)` | reshape storage in place |
//!
//! Broadcasting is right-aligned: trailing dimensions must match or be 1.

use std::cell::Cell;

use dynlayer_core::value::{pop_args, ArgExt};
use dynlayer_core::{
    Argument, Capability, DispatchError, Dispatcher, OperatorHandle, Schema, Shape, Stack, Tensor,
    Value,
};
use dynlayer_core::tensor::DenseStorage;

// ============================================================================
// Dense Math
// ============================================================================

/// For every flat index of `out`, the flat index of `src` it reads when
/// `src` is broadcast to `out`.
fn broadcast_offsets(out: &Shape, src: &Shape) -> Vec<usize> {
    let rank = out.rank();
    let pad = rank - src.rank();
    let strides = src.broadcast_strides();
    (0..out.numel())
        .map(|flat| {
            let mut rem = flat;
            let mut offset = 0;
            for d in (0..rank).rev() {
                let size = out.dims[d];
                let idx = rem % size;
                rem /= size;
                if d >= pad {
                    offset += idx * strides[d - pad];
                }
            }
            offset
        })
        .collect()
}

/// Element-wise binary operation with broadcasting.
pub fn broadcast_binary(
    op: &str,
    a: &DenseStorage,
    b: &DenseStorage,
    f: impl Fn(f64, f64) -> f64,
) -> Result<DenseStorage, DispatchError> {
    let shape = a
        .shape
        .broadcast(&b.shape)
        .ok_or_else(|| DispatchError::ShapeMismatch {
            op: op.to_string(),
            left: a.shape.clone(),
            right: b.shape.clone(),
        })?;
    let data = broadcast_offsets(&shape, &a.shape)
        .into_iter()
        .zip(broadcast_offsets(&shape, &b.shape))
        .map(|(i, j)| f(a.data[i], b.data[j]))
        .collect();
    Ok(DenseStorage { shape, data })
}

/// Element-wise unary operation.
pub fn map_unary(a: &DenseStorage, f: impl Fn(f64) -> f64) -> DenseStorage {
    DenseStorage {
        shape: a.shape.clone(),
        data: a.data.iter().map(|&x| f(x)).collect(),
    }
}

thread_local! {
    static RNG_STATE: Cell<u64> = const { Cell::new(12345) };
}

/// Reset this thread's generator for `rand`.
pub fn manual_seed(seed: u64) {
    RNG_STATE.with(|s| s.set(seed));
}

/// Draw `n` uniform samples from this thread's generator.
fn uniform(n: usize) -> Vec<f64> {
    RNG_STATE.with(|s| {
        let mut state = s.get();
        let data = (0..n)
            .map(|_| {
                state = state
                    .wrapping_mul(6364136223846793005)
                    .wrapping_add(1442695040888963407);
                (state >> 11) as f64 / (1u64 << 53) as f64
            })
            .collect();
        s.set(state);
        data
    })
}

// ============================================================================
// Schemas
// ============================================================================

fn binary(name: &str) -> Schema {
    Schema::new(name)
        .arg(Argument::tensor("self"))
        .arg(Argument::tensor("other"))
        .ret(Argument::tensor("out"))
}

fn unary(name: &str) -> Schema {
    Schema::new(name)
        .arg(Argument::tensor("self"))
        .ret(Argument::tensor("out"))
}

fn factory(name: &str) -> Schema {
    Schema::new(name)
        .arg(Argument::int_list("size"))
        .ret(Argument::tensor("out"))
}

/// Schemas of every base operator.
pub fn schemas() -> Vec<Schema> {
    vec![
        binary("add"),
        binary("mul"),
        unary("neg"),
        unary("sum"),
        Schema::new("add_n")
            .arg(Argument::tensor_list("tensors"))
            .ret(Argument::tensor("out")),
        Schema::new("unsqueeze")
            .arg(Argument::tensor("self"))
            .arg(Argument::int("dim"))
            .ret(Argument::tensor("out")),
        factory("zeros"),
        factory("rand"),
        Schema::new("add_")
            .arg(Argument::tensor("self").written('a'))
            .arg(Argument::tensor("other"))
            .ret(Argument::tensor("out").written('a')),
        Schema::new("resize_")
            .arg(Argument::tensor("self").written('a'))
            .arg(Argument::int_list("size"))
            .ret(Argument::tensor("out").written('a')),
    ]
}

// ============================================================================
// Backend Kernels
// ============================================================================

fn dense_arg(args: &[Value], op: &str, index: usize) -> Result<DenseStorage, DispatchError> {
    let tensor = args.tensor_arg(op, index)?;
    dense_of(tensor, op, index)
}

fn dense_of(tensor: &Tensor, op: &str, index: usize) -> Result<DenseStorage, DispatchError> {
    tensor
        .as_dense()
        .map(|d| d.read().clone())
        .ok_or_else(|| DispatchError::invalid_argument(op, index, "expected a dense tensor"))
}

fn push(stack: &mut Stack, storage: DenseStorage) {
    stack.push(Tensor::from_storage(storage).into());
}

fn binary_kernel(
    f: fn(f64, f64) -> f64,
) -> impl Fn(&OperatorHandle, &mut Stack) -> Result<(), DispatchError> + Send + Sync {
    move |op: &OperatorHandle, stack: &mut Stack| {
        let args = pop_args(stack, 2);
        let a = dense_arg(&args, op.name(), 0)?;
        let b = dense_arg(&args, op.name(), 1)?;
        push(stack, broadcast_binary(op.name(), &a, &b, f)?);
        Ok(())
    }
}

fn neg_kernel(op: &OperatorHandle, stack: &mut Stack) -> Result<(), DispatchError> {
    let args = pop_args(stack, 1);
    let a = dense_arg(&args, op.name(), 0)?;
    push(stack, map_unary(&a, |x| -x));
    Ok(())
}

fn sum_kernel(op: &OperatorHandle, stack: &mut Stack) -> Result<(), DispatchError> {
    let args = pop_args(stack, 1);
    let a = dense_arg(&args, op.name(), 0)?;
    stack.push(Tensor::scalar(a.data.iter().sum()).into());
    Ok(())
}

fn add_n_kernel(op: &OperatorHandle, stack: &mut Stack) -> Result<(), DispatchError> {
    let args = pop_args(stack, 1);
    let tensors = args.tensor_list_arg(op.name(), 0)?;
    let mut iter = tensors.iter();
    let Some(first) = iter.next() else {
        return Err(DispatchError::invalid_argument(op.name(), 0, "expected at least one tensor"));
    };
    let mut acc = dense_of(first, op.name(), 0)?;
    for t in iter {
        acc = broadcast_binary(op.name(), &acc, &dense_of(t, op.name(), 0)?, |a, b| a + b)?;
    }
    push(stack, acc);
    Ok(())
}

fn unsqueeze_kernel(op: &OperatorHandle, stack: &mut Stack) -> Result<(), DispatchError> {
    let args = pop_args(stack, 2);
    let a = dense_arg(&args, op.name(), 0)?;
    let dim = args.int_arg(op.name(), 1)?;
    let shape = usize::try_from(dim)
        .ok()
        .and_then(|d| a.shape.unsqueeze(d))
        .ok_or_else(|| {
            DispatchError::invalid_argument(
                op.name(),
                1,
                format!("dim {} out of range for rank {}", dim, a.shape.rank()),
            )
        })?;
    push(stack, DenseStorage { shape, data: a.data });
    Ok(())
}

fn zeros_kernel(op: &OperatorHandle, stack: &mut Stack) -> Result<(), DispatchError> {
    let args = pop_args(stack, 1);
    let sizes = args.sizes_arg(op.name(), 0)?;
    stack.push(Tensor::zeros(sizes).into());
    Ok(())
}

fn rand_kernel(op: &OperatorHandle, stack: &mut Stack) -> Result<(), DispatchError> {
    let args = pop_args(stack, 1);
    let shape = Shape::new(args.sizes_arg(op.name(), 0)?);
    let data = uniform(shape.numel());
    push(stack, DenseStorage { shape, data });
    Ok(())
}

fn add_inplace_kernel(op: &OperatorHandle, stack: &mut Stack) -> Result<(), DispatchError> {
    let args = pop_args(stack, 2);
    let target = args.tensor_arg(op.name(), 0)?.clone();
    let other = dense_arg(&args, op.name(), 1)?;
    let Some(dense) = target.as_dense() else {
        return Err(DispatchError::invalid_argument(op.name(), 0, "expected a dense tensor"));
    };
    {
        let mut storage = dense.write();
        let updated = broadcast_binary(op.name(), &storage, &other, |a, b| a + b)?;
        if updated.shape != storage.shape {
            return Err(DispatchError::ShapeMismatch {
                op: op.name().to_string(),
                left: storage.shape.clone(),
                right: other.shape,
            });
        }
        *storage = updated;
    }
    stack.push(target.into());
    Ok(())
}

fn resize_kernel(op: &OperatorHandle, stack: &mut Stack) -> Result<(), DispatchError> {
    let args = pop_args(stack, 2);
    let target = args.tensor_arg(op.name(), 0)?.clone();
    let shape = Shape::new(args.sizes_arg(op.name(), 1)?);
    let Some(dense) = target.as_dense() else {
        return Err(DispatchError::invalid_argument(op.name(), 0, "expected a dense tensor"));
    };
    {
        let mut storage = dense.write();
        storage.data.resize(shape.numel(), 0.0);
        storage.shape = shape;
    }
    stack.push(target.into());
    Ok(())
}

/// Register every base operator and its backend kernel.
pub fn register(dispatcher: &Dispatcher) -> Result<(), DispatchError> {
    for schema in schemas() {
        dispatcher.register_operator(schema);
    }
    dispatcher.register_kernel("add", Capability::Backend, binary_kernel(|a, b| a + b))?;
    dispatcher.register_kernel("mul", Capability::Backend, binary_kernel(|a, b| a * b))?;
    dispatcher.register_kernel("neg", Capability::Backend, neg_kernel)?;
    dispatcher.register_kernel("sum", Capability::Backend, sum_kernel)?;
    dispatcher.register_kernel("add_n", Capability::Backend, add_n_kernel)?;
    dispatcher.register_kernel("unsqueeze", Capability::Backend, unsqueeze_kernel)?;
    dispatcher.register_kernel("zeros", Capability::Backend, zeros_kernel)?;
    dispatcher.register_kernel("rand", Capability::Backend, rand_kernel)?;
    dispatcher.register_kernel("add_", Capability::Backend, add_inplace_kernel)?;
    dispatcher.register_kernel("resize_", Capability::Backend, resize_kernel)?;
    tracing::debug!(operators = schemas().len(), "registered base operators");
    Ok(())
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn storage(dims: Vec<usize>, data: Vec<f64>) -> DenseStorage {
        DenseStorage {
            shape: Shape::new(dims),
            data,
        }
    }

    fn base() -> Dispatcher {
        let d = Dispatcher::new();
        register(&d).unwrap();
        d
    }

    fn first(out: Vec<Value>) -> Tensor {
        out.into_iter().next().and_then(Value::into_tensor).unwrap()
    }

    #[test]
    fn test_broadcast_binary_right_aligned() {
        let a = storage(vec![2, 3], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        let b = storage(vec![3], vec![10.0, 20.0, 30.0]);
        let c = broadcast_binary("add", &a, &b, |x, y| x + y).unwrap();
        assert_eq!(c.shape, Shape::matrix(2, 3));
        assert_eq!(c.data, vec![11.0, 22.0, 33.0, 14.0, 25.0, 36.0]);
    }

    #[test]
    fn test_broadcast_binary_column_against_row() {
        let col = storage(vec![2, 1], vec![1.0, 2.0]);
        let row = storage(vec![1, 3], vec![10.0, 20.0, 30.0]);
        let c = broadcast_binary("mul", &col, &row, |x, y| x * y).unwrap();
        assert_eq!(c.shape, Shape::matrix(2, 3));
        assert_eq!(c.data, vec![10.0, 20.0, 30.0, 20.0, 40.0, 60.0]);
    }

    #[test]
    fn test_broadcast_binary_mismatch() {
        let a = storage(vec![2], vec![1.0, 2.0]);
        let b = storage(vec![3], vec![1.0, 2.0, 3.0]);
        let err = broadcast_binary("add", &a, &b, |x, y| x + y).unwrap_err();
        assert!(matches!(err, DispatchError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_pointwise_kernels() {
        let d = base();
        let a = Tensor::vector(vec![1.0, 2.0]);
        let b = Tensor::vector(vec![3.0, 4.0]);

        let sum = first(d.call("add", vec![a.clone().into(), b.clone().into()]).unwrap());
        assert_eq!(sum.to_vec(), vec![4.0, 6.0]);
        let prod = first(d.call("mul", vec![a.clone().into(), b.into()]).unwrap());
        assert_eq!(prod.to_vec(), vec![3.0, 8.0]);
        let neg = first(d.call("neg", vec![a.clone().into()]).unwrap());
        assert_eq!(neg.to_vec(), vec![-1.0, -2.0]);
        let total = first(d.call("sum", vec![a.into()]).unwrap());
        assert_eq!(total.shape(), Shape::scalar());
        assert_eq!(total.to_vec(), vec![3.0]);
    }

    #[test]
    fn test_add_n_and_empty_list() {
        let d = base();
        let list = Value::List(vec![
            Tensor::scalar(1.0).into(),
            Tensor::vector(vec![1.0, 2.0]).into(),
            Tensor::vector(vec![10.0, 10.0]).into(),
        ]);
        let out = first(d.call("add_n", vec![list]).unwrap());
        assert_eq!(out.to_vec(), vec![12.0, 13.0]);

        let err = d.call("add_n", vec![Value::List(vec![])]).unwrap_err();
        assert!(matches!(err, DispatchError::InvalidArgument { index: 0, .. }));
    }

    #[test]
    fn test_unsqueeze_and_factories() {
        let d = base();
        let v = Tensor::vector(vec![1.0, 2.0, 3.0]);
        let u = first(d.call("unsqueeze", vec![v.clone().into(), Value::Int(1)]).unwrap());
        assert_eq!(u.shape(), Shape::matrix(3, 1));
        assert!(d.call("unsqueeze", vec![v.into(), Value::Int(5)]).is_err());

        let z = first(d.call("zeros", vec![Value::IntList(vec![2, 2])]).unwrap());
        assert_eq!(z.to_vec(), vec![0.0; 4]);

        manual_seed(7);
        let r1 = first(d.call("rand", vec![Value::IntList(vec![3])]).unwrap()).to_vec();
        manual_seed(7);
        let r2 = first(d.call("rand", vec![Value::IntList(vec![3])]).unwrap()).to_vec();
        assert_eq!(r1, r2);
        assert!(r1.iter().all(|x| (0.0..1.0).contains(x)));
        assert_ne!(r1[0], r1[1]);
    }

    #[test]
    fn test_inplace_kernels_mutate_through_aliases() {
        let d = base();
        let x = Tensor::vector(vec![1.0, 2.0]);
        let out = first(d.call("add_", vec![x.clone().into(), Tensor::scalar(1.0).into()]).unwrap());
        assert!(out.is_same(&x));
        assert_eq!(x.to_vec(), vec![2.0, 3.0]);

        // The result may not outgrow the target.
        let err = d
            .call("add_", vec![Tensor::scalar(1.0).into(), x.clone().into()])
            .unwrap_err();
        assert!(matches!(err, DispatchError::ShapeMismatch { .. }));

        d.call("resize_", vec![x.clone().into(), Value::IntList(vec![2, 2])]).unwrap();
        assert_eq!(x.shape(), Shape::matrix(2, 2));
        assert_eq!(x.to_vec(), vec![2.0, 3.0, 0.0, 0.0]);
    }
}
