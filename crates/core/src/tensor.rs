//! # Tensors and Wrappers
//!
//! A [`Tensor`] is a cheaply clonable handle: clones alias the same storage,
//! so an in-place kernel that mutates one clone is visible through all of
//! them. A tensor is one of three things:
//!
//! - **Dense**: real data and a shape
//! - **Tagged**: a [`TaggedWrapper`] recording which transform level produced
//!   the value, plus a shared liveness flag for that level
//! - **Batched**: a [`BatchedWrapper`] whose leading physical dimension is the
//!   batch dimension of one batching level
//!
//! Each variant carries the capabilities the dispatcher routes on
//! ([`Tensor::capabilities`]).

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::capability::{Capability, CapabilitySet};
use crate::shape::Shape;

/// A transform nesting level (1-based position in the layer stack).
pub type Level = usize;

// ============================================================================
// Liveness
// ============================================================================

/// Shared liveness flag for one level.
///
/// The registry and every wrapper tagged at the level hold a clone. Once the
/// level is torn down the flag reads `false` forever, even after the
/// registry forgot about it.
#[derive(Clone)]
pub struct LivenessHandle(Arc<AtomicBool>);

impl LivenessHandle {
    /// Create a fresh, alive flag.
    pub fn new_alive() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    /// Read the flag.
    pub fn is_alive(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Mark the level dead.
    pub fn invalidate(&self) {
        self.0.store(false, Ordering::Release);
    }

    /// Check whether two handles share the same flag.
    pub fn same_flag(&self, other: &LivenessHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for LivenessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LivenessHandle({})", if self.is_alive() { "alive" } else { "dead" })
    }
}

// ============================================================================
// Dense Storage
// ============================================================================

/// Data and shape of a dense tensor.
#[derive(Debug, Clone, PartialEq)]
pub struct DenseStorage {
    /// Shape of the data
    pub shape: Shape,
    /// Flattened data in row-major order
    pub data: Vec<f64>,
}

/// A dense tensor with interior mutability for in-place kernels.
pub struct DenseTensor {
    storage: RwLock<DenseStorage>,
}

impl DenseTensor {
    /// Borrow the storage for reading.
    pub fn read(&self) -> RwLockReadGuard<'_, DenseStorage> {
        self.storage.read()
    }

    /// Borrow the storage for writing.
    pub fn write(&self) -> RwLockWriteGuard<'_, DenseStorage> {
        self.storage.write()
    }
}

// ============================================================================
// Wrappers
// ============================================================================

/// A value tagged with the level that produced it.
pub struct TaggedWrapper {
    value: Tensor,
    level: Level,
    liveness: LivenessHandle,
    /// Shape cached at wrap time; stale after an in-place resize until refreshed.
    metadata: RwLock<Shape>,
    /// Name of the operator that produced this value, if history was recorded.
    grad_fn: RwLock<Option<String>>,
}

impl TaggedWrapper {
    /// The level this wrapper is tagged with.
    pub fn level(&self) -> Level {
        self.level
    }

    /// Whether the tagging level is still active.
    pub fn is_alive(&self) -> bool {
        self.liveness.is_alive()
    }

    /// The wrapped value.
    pub fn underlying(&self) -> &Tensor {
        &self.value
    }

    /// Shape of the value. Cached while the level is alive; once it is dead
    /// the wrapper reads through, since nothing refreshes the cache anymore.
    pub fn shape(&self) -> Shape {
        if self.is_alive() {
            self.metadata.read().clone()
        } else {
            self.value.shape()
        }
    }

    /// Re-read the shape from the wrapped value.
    pub fn refresh_metadata(&self) {
        *self.metadata.write() = self.value.shape();
    }

    /// Recorded history, if any.
    pub fn grad_fn(&self) -> Option<String> {
        self.grad_fn.read().clone()
    }

    /// Record history for this value.
    pub fn set_grad_fn(&self, name: impl Into<String>) {
        *self.grad_fn.write() = Some(name.into());
    }
}

/// A value whose leading physical dimension is a batch dimension.
pub struct BatchedWrapper {
    value: Tensor,
    level: Level,
}

impl BatchedWrapper {
    /// The batching level that owns the batch dimension.
    pub fn level(&self) -> Level {
        self.level
    }

    /// The physical value, batch dimension first.
    pub fn underlying(&self) -> &Tensor {
        &self.value
    }

    /// Size of the batch dimension.
    pub fn batch_size(&self) -> usize {
        self.value.shape().dims.first().copied().unwrap_or(1)
    }
}

// ============================================================================
// Tensor
// ============================================================================

enum TensorImpl {
    Dense(DenseTensor),
    Tagged(TaggedWrapper),
    Batched(BatchedWrapper),
}

/// A shared handle to a dense, tagged or batched value.
#[derive(Clone)]
pub struct Tensor {
    inner: Arc<TensorImpl>,
}

impl Tensor {
    /// Create a dense tensor from data with the given shape.
    ///
    /// Panics if the data length does not match the shape.
    pub fn from_data(shape: impl Into<Shape>, data: Vec<f64>) -> Self {
        let shape = shape.into();
        assert_eq!(
            data.len(),
            shape.numel(),
            "Data length {} doesn't match shape {}",
            data.len(),
            shape
        );
        Self::from_storage(DenseStorage { shape, data })
    }

    /// Create a dense tensor from storage.
    pub fn from_storage(storage: DenseStorage) -> Self {
        Self {
            inner: Arc::new(TensorImpl::Dense(DenseTensor {
                storage: RwLock::new(storage),
            })),
        }
    }

    /// Create a scalar tensor.
    pub fn scalar(value: f64) -> Self {
        Self::from_data(Shape::scalar(), vec![value])
    }

    /// Create a 1D tensor.
    pub fn vector(data: Vec<f64>) -> Self {
        let len = data.len();
        Self::from_data(Shape::vector(len), data)
    }

    /// Create a 2D tensor.
    pub fn matrix(rows: usize, cols: usize, data: Vec<f64>) -> Self {
        Self::from_data(Shape::matrix(rows, cols), data)
    }

    /// Create a zero-filled tensor.
    pub fn zeros(shape: impl Into<Shape>) -> Self {
        let shape = shape.into();
        let data = vec![0.0; shape.numel()];
        Self::from_data(shape, data)
    }

    /// Tag `value` with `level`. Callers normally go through the layer
    /// registry, which supplies the liveness handle.
    pub fn tagged(value: Tensor, level: Level, liveness: LivenessHandle) -> Self {
        let metadata = RwLock::new(value.shape());
        Self {
            inner: Arc::new(TensorImpl::Tagged(TaggedWrapper {
                value,
                level,
                liveness,
                metadata,
                grad_fn: RwLock::new(None),
            })),
        }
    }

    /// Mark the leading dimension of `value` as the batch dimension of `level`.
    pub fn batched(value: Tensor, level: Level) -> Self {
        Self {
            inner: Arc::new(TensorImpl::Batched(BatchedWrapper { value, level })),
        }
    }

    /// The dense tensor, if this is not a wrapper.
    pub fn as_dense(&self) -> Option<&DenseTensor> {
        match &*self.inner {
            TensorImpl::Dense(dense) => Some(dense),
            _ => None,
        }
    }

    /// The tagged wrapper, if this is one.
    pub fn as_tagged(&self) -> Option<&TaggedWrapper> {
        match &*self.inner {
            TensorImpl::Tagged(wrapper) => Some(wrapper),
            _ => None,
        }
    }

    /// The batched wrapper, if this is one.
    pub fn as_batched(&self) -> Option<&BatchedWrapper> {
        match &*self.inner {
            TensorImpl::Batched(wrapper) => Some(wrapper),
            _ => None,
        }
    }

    /// Logical shape: cached metadata for tagged wrappers, the per-example
    /// shape for batched wrappers.
    pub fn shape(&self) -> Shape {
        match &*self.inner {
            TensorImpl::Dense(dense) => dense.read().shape.clone(),
            TensorImpl::Tagged(wrapper) => wrapper.shape(),
            TensorImpl::Batched(wrapper) => wrapper.value.shape().drop_leading(),
        }
    }

    /// Capabilities the dispatcher sees on this value.
    pub fn capabilities(&self) -> CapabilitySet {
        match &*self.inner {
            TensorImpl::Dense(_) => CapabilitySet::from(Capability::Backend),
            TensorImpl::Tagged(wrapper) if wrapper.is_alive() => CapabilitySet::of(&[
                Capability::TaggedWrapper,
                Capability::Differentiation,
                Capability::InplaceOrView,
            ]),
            TensorImpl::Tagged(_) => CapabilitySet::from(Capability::TaggedWrapper),
            TensorImpl::Batched(_) => CapabilitySet::from(Capability::Batched),
        }
    }

    /// Flattened data, read through every wrapper down to the dense storage.
    pub fn to_vec(&self) -> Vec<f64> {
        match &*self.inner {
            TensorImpl::Dense(dense) => dense.read().data.clone(),
            TensorImpl::Tagged(wrapper) => wrapper.value.to_vec(),
            TensorImpl::Batched(wrapper) => wrapper.value.to_vec(),
        }
    }

    /// Check whether two handles alias the same value.
    pub fn is_same(&self, other: &Tensor) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Tensor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &*self.inner {
            TensorImpl::Dense(dense) => {
                let storage = dense.read();
                write!(f, "Dense({}, {:?})", storage.shape, storage.data)
            }
            TensorImpl::Tagged(wrapper) => write!(
                f,
                "Tagged(level={}, {}, {:?})",
                wrapper.level,
                if wrapper.is_alive() { "alive" } else { "dead" },
                wrapper.value
            ),
            TensorImpl::Batched(wrapper) => {
                write!(f, "Batched(level={}, {:?})", wrapper.level, wrapper.value)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clones_alias_storage() {
        let a = Tensor::vector(vec![1.0, 2.0]);
        let b = a.clone();
        b.as_dense().unwrap().write().data[0] = 10.0;
        assert_eq!(a.to_vec(), vec![10.0, 2.0]);
        assert!(a.is_same(&b));
    }

    #[test]
    fn test_tagged_capabilities_follow_liveness() {
        let handle = LivenessHandle::new_alive();
        let t = Tensor::tagged(Tensor::scalar(1.0), 1, handle.clone());
        assert!(t.capabilities().contains(Capability::Differentiation));

        handle.invalidate();
        assert_eq!(t.capabilities(), CapabilitySet::from(Capability::TaggedWrapper));
        assert!(!t.as_tagged().unwrap().is_alive());
    }

    #[test]
    fn test_metadata_is_cached_until_refreshed() {
        let inner = Tensor::vector(vec![1.0, 2.0]);
        let t = Tensor::tagged(inner.clone(), 1, LivenessHandle::new_alive());

        {
            let mut storage = inner.as_dense().unwrap().write();
            storage.data.push(3.0);
            storage.shape = Shape::vector(3);
        }
        assert_eq!(t.shape(), Shape::vector(2));

        t.as_tagged().unwrap().refresh_metadata();
        assert_eq!(t.shape(), Shape::vector(3));
    }

    #[test]
    fn test_dead_wrapper_reads_shape_through() {
        let inner = Tensor::vector(vec![1.0, 2.0]);
        let handle = LivenessHandle::new_alive();
        let t = Tensor::tagged(inner.clone(), 1, handle.clone());
        handle.invalidate();

        inner.as_dense().unwrap().write().shape = Shape::matrix(2, 1);
        assert_eq!(t.shape(), Shape::matrix(2, 1));
    }

    #[test]
    fn test_batched_logical_shape_drops_batch_dim() {
        let physical = Tensor::matrix(4, 3, vec![0.0; 12]);
        let b = Tensor::batched(physical, 2);
        assert_eq!(b.shape(), Shape::vector(3));
        assert_eq!(b.as_batched().unwrap().batch_size(), 4);
        assert_eq!(b.capabilities(), CapabilitySet::from(Capability::Batched));
    }

    #[test]
    #[should_panic(expected = "doesn't match shape")]
    fn test_from_data_checks_length() {
        let _ = Tensor::from_data(Shape::vector(3), vec![1.0]);
    }
}
