//! # The Dispatcher
//!
//! The base runtime: a table of operators, each with per-capability kernels,
//! plus per-capability *fallbacks* that apply to every operator.
//!
//! ## Selecting a Kernel
//!
//! [`OperatorHandle::call_boxed`] computes the dispatch set from the
//! arguments and the thread's overlay (see [`crate::capability`]) and walks
//! it from the highest priority down:
//!
//! 1. the operator's own kernel for that capability, else
//! 2. the fallback registered for that capability, else
//! 3. fall through to the next capability.
//!
//! Kernels redispatch by calling `call_boxed` again after adjusting the
//! overlay. That is the whole extension mechanism: a layer hides itself,
//! calls the operator, and the next enabled hook picks it up.
//!
//! ## Example
//!
//! ```rust
//! use dynlayer_core::capability::Capability;
//! use dynlayer_core::dispatcher::{Dispatcher, OperatorHandle};
//! use dynlayer_core::schema::{Argument, Schema};
//! use dynlayer_core::value::{pop_args, Value};
//! use dynlayer_core::Tensor;
//!
//! let dispatcher = Dispatcher::new();
//! dispatcher.register_operator(
//!     Schema::new("double").arg(Argument::tensor("self")).ret(Argument::tensor("out")),
//! );
//! dispatcher
//!     .register_kernel("double", Capability::Backend, |_op: &OperatorHandle, stack: &mut Vec<Value>| {
//!         let args = pop_args(stack, 1);
//!         let x = args[0].as_tensor().unwrap().to_vec();
//!         stack.push(Tensor::vector(x.iter().map(|v| v * 2.0).collect()).into());
//!         Ok(())
//!     })
//!     .unwrap();
//!
//! let out = dispatcher.call("double", vec![Tensor::vector(vec![1.0, 2.0]).into()]).unwrap();
//! assert_eq!(out[0].as_tensor().unwrap().to_vec(), vec![2.0, 4.0]);
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::capability::{self, Capability, CapabilitySet};
use crate::error::DispatchError;
use crate::schema::Schema;
use crate::trace;
use crate::value::{last_range, Stack, Value};

// ============================================================================
// Kernel
// ============================================================================

/// A boxed kernel: consumes the arguments at the top of the stack and pushes
/// the results.
pub trait Kernel: Send + Sync {
    /// Run the kernel for `op` on `stack`.
    fn run(&self, op: &OperatorHandle, stack: &mut Stack) -> Result<(), DispatchError>;

    /// Name used in logs.
    fn kernel_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

impl<F> Kernel for F
where
    F: Fn(&OperatorHandle, &mut Stack) -> Result<(), DispatchError> + Send + Sync,
{
    fn run(&self, op: &OperatorHandle, stack: &mut Stack) -> Result<(), DispatchError> {
        self(op, stack)
    }
}

// ============================================================================
// Tables
// ============================================================================

struct OperatorEntry {
    schema: Schema,
    kernels: RwLock<HashMap<Capability, Arc<dyn Kernel>>>,
}

#[derive(Default)]
struct DispatchTable {
    operators: RwLock<HashMap<String, Arc<OperatorEntry>>>,
    fallbacks: RwLock<HashMap<Capability, Arc<dyn Kernel>>>,
}

impl DispatchTable {
    fn select(&self, entry: &OperatorEntry, cap: Capability) -> Option<Arc<dyn Kernel>> {
        // Clone the Arc out so no lock is held while the kernel runs and
        // possibly re-enters the dispatcher.
        if let Some(kernel) = entry.kernels.read().get(&cap) {
            return Some(Arc::clone(kernel));
        }
        self.fallbacks.read().get(&cap).cloned()
    }
}

/// The operator registry and dispatch entry point.
#[derive(Clone, Default)]
pub struct Dispatcher {
    table: Arc<DispatchTable>,
}

impl Dispatcher {
    /// Create an empty dispatcher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an operator. Re-registering a name returns the existing
    /// handle and keeps the original schema.
    pub fn register_operator(&self, schema: Schema) -> OperatorHandle {
        let mut operators = self.table.operators.write();
        let entry = operators
            .entry(schema.name.clone())
            .or_insert_with(|| {
                Arc::new(OperatorEntry {
                    schema,
                    kernels: RwLock::new(HashMap::new()),
                })
            })
            .clone();
        OperatorHandle {
            table: Arc::clone(&self.table),
            entry,
        }
    }

    /// Register (or replace) the kernel of `op` for `cap`.
    pub fn register_kernel(
        &self,
        op: &str,
        cap: Capability,
        kernel: impl Kernel + 'static,
    ) -> Result<(), DispatchError> {
        let handle = self.op(op)?;
        handle.entry.kernels.write().insert(cap, Arc::new(kernel));
        Ok(())
    }

    /// Register (or replace) the fallback for `cap`, used by every operator
    /// without its own kernel for that capability.
    pub fn register_fallback(&self, cap: Capability, kernel: impl Kernel + 'static) {
        self.table.fallbacks.write().insert(cap, Arc::new(kernel));
    }

    /// Look up an operator by name.
    pub fn op(&self, name: &str) -> Result<OperatorHandle, DispatchError> {
        let entry = self
            .table
            .operators
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| DispatchError::UnknownOperator(name.to_string()))?;
        Ok(OperatorHandle {
            table: Arc::clone(&self.table),
            entry,
        })
    }

    /// Call an operator by name with unboxed arguments.
    pub fn call(&self, name: &str, args: Vec<Value>) -> Result<Vec<Value>, DispatchError> {
        self.op(name)?.call(args)
    }
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("operators", &self.table.operators.read().len())
            .field("fallbacks", &self.table.fallbacks.read().len())
            .finish()
    }
}

// ============================================================================
// OperatorHandle
// ============================================================================

/// A registered operator, callable from kernels.
#[derive(Clone)]
pub struct OperatorHandle {
    table: Arc<DispatchTable>,
    entry: Arc<OperatorEntry>,
}

impl OperatorHandle {
    /// The operator's schema.
    pub fn schema(&self) -> &Schema {
        &self.entry.schema
    }

    /// The operator's name.
    pub fn name(&self) -> &str {
        &self.entry.schema.name
    }

    /// The dispatcher this operator is registered on, for kernels that issue
    /// calls to other operators.
    pub fn dispatcher(&self) -> Dispatcher {
        Dispatcher {
            table: Arc::clone(&self.table),
        }
    }

    /// Capabilities that route this call, given the thread's overlay.
    pub fn dispatch_set(&self, stack: &Stack) -> CapabilitySet {
        let range = last_range(stack, self.schema().num_arguments());
        let carried = stack[range]
            .iter()
            .fold(CapabilitySet::from(Capability::Backend), |acc, v| {
                acc | v.capabilities()
            });
        capability::local().apply(carried)
    }

    /// Dispatch with the arguments already on `stack`.
    pub fn call_boxed(&self, stack: &mut Stack) -> Result<(), DispatchError> {
        let set = self.dispatch_set(stack);
        for cap in set.iter_by_priority() {
            let Some(kernel) = self.table.select(&self.entry, cap) else {
                continue;
            };
            tracing::trace!(op = %self.name(), capability = %cap, kernel = kernel.kernel_name(), "dispatch");
            let _span = trace::enter(self.name(), cap);
            return kernel.run(self, stack);
        }
        Err(DispatchError::NoKernel {
            op: self.name().to_string(),
            set,
        })
    }

    /// Dispatch with unboxed arguments and return the results.
    pub fn call(&self, args: Vec<Value>) -> Result<Vec<Value>, DispatchError> {
        let num_args = self.schema().num_arguments();
        if args.len() != num_args {
            return Err(DispatchError::invalid_argument(
                self.name(),
                args.len().min(num_args),
                format!("expected {} arguments, got {}", num_args, args.len()),
            ));
        }
        let mut stack = args;
        self.call_boxed(&mut stack)?;
        Ok(stack)
    }
}

impl fmt::Debug for OperatorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OperatorHandle({})", self.schema())
    }
}

// ============================================================================
// Tests
// ============================================================================
