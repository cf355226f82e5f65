//! # Dispatch Traces
//!
//! Records which capability the dispatcher selected for every call, as a
//! tree: a kernel that redispatches becomes the parent of the nested call.
//! For one operator flowing through two layers the tree reads top-down
//! exactly like the interception chain:
//!
//! ```text
//! [EntryInterceptor] add
//!   [Batched] add
//!     [ExitInterceptor] add
//!       [EntryInterceptor] add
//!         ...
//! ```
//!
//! Recording is opt-in and per thread. Outside [`record`] the dispatcher
//! pays one thread-local lookup per call.
//!
//! ## Example
//!
//! ```rust
//! use dynlayer_core::trace;
//!
//! let ((), roots) = trace::record(|| ());
//! assert!(roots.is_empty());
//! ```

use std::cell::RefCell;
use std::fmt;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::capability::Capability;

/// A node in the trace tree.
#[derive(Debug, Clone, Serialize)]
pub struct TraceNode {
    /// Operator name
    pub op: String,
    /// Capability whose kernel or fallback handled the call
    pub capability: Capability,
    /// Wall time spent in the kernel, including nested calls
    pub duration: Duration,
    /// Nested dispatches issued by the kernel
    pub children: Vec<TraceNode>,
}

impl TraceNode {
    /// Create a new trace node.
    pub fn new(op: impl Into<String>, capability: Capability) -> Self {
        Self {
            op: op.into(),
            capability,
            duration: Duration::ZERO,
            children: Vec::new(),
        }
    }

    /// Add a child trace.
    pub fn with_child(mut self, child: TraceNode) -> Self {
        self.children.push(child);
        self
    }

    /// Capabilities in pre-order (this node first, then children left to right).
    pub fn capabilities(&self) -> Vec<Capability> {
        let mut out = vec![self.capability];
        for child in &self.children {
            out.extend(child.capabilities());
        }
        out
    }

    /// Depth of the deepest path below and including this node.
    pub fn depth(&self) -> usize {
        1 + self.children.iter().map(TraceNode::depth).max().unwrap_or(0)
    }

    /// Pretty-print the trace tree.
    pub fn display(&self) -> String {
        self.display_indent(0)
    }

    fn display_indent(&self, indent: usize) -> String {
        let mut out = format!("{}[{}] {}\n", "  ".repeat(indent), self.capability, self.op);
        for child in &self.children {
            out.push_str(&child.display_indent(indent + 1));
        }
        out
    }

    /// Serialize the tree to JSON.
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

impl fmt::Display for TraceNode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.display())
    }
}

// ============================================================================
// Recorder
// ============================================================================

#[derive(Default)]
struct Recorder {
    open: Vec<(TraceNode, Instant)>,
    roots: Vec<TraceNode>,
}

thread_local! {
    static RECORDER: RefCell<Option<Recorder>> = const { RefCell::new(None) };
}

/// Whether a trace is being recorded on this thread.
pub fn is_recording() -> bool {
    RECORDER.with(|r| r.borrow().is_some())
}

/// Run `f` while recording every dispatch it performs on this thread.
///
/// Nested calls to `record` each see only their own dispatches.
pub fn record<R>(f: impl FnOnce() -> R) -> (R, Vec<TraceNode>) {
    struct Restore(Option<Recorder>);

    impl Drop for Restore {
        fn drop(&mut self) {
            let outer = self.0.take();
            RECORDER.with(|r| *r.borrow_mut() = outer);
        }
    }

    let outer = RECORDER.with(|r| r.borrow_mut().replace(Recorder::default()));
    let restore = Restore(outer);
    let result = f();
    let roots = RECORDER
        .with(|r| r.borrow_mut().take())
        .map(|rec| rec.roots)
        .unwrap_or_default();
    drop(restore);
    (result, roots)
}

/// Closes a trace node when dropped.
pub struct SpanGuard {
    _private: (),
}

/// Open a node for a kernel about to run. Returns `None` when not recording.
pub fn enter(op: &str, capability: Capability) -> Option<SpanGuard> {
    RECORDER.with(|r| {
        let mut r = r.borrow_mut();
        let rec = r.as_mut()?;
        rec.open.push((TraceNode::new(op, capability), Instant::now()));
        Some(SpanGuard { _private: () })
    })
}

impl Drop for SpanGuard {
    fn drop(&mut self) {
        RECORDER.with(|r| {
            let mut r = r.borrow_mut();
            let Some(rec) = r.as_mut() else {
                return;
            };
            let Some((mut node, start)) = rec.open.pop() else {
                return;
            };
            node.duration = start.elapsed();
            match rec.open.last_mut() {
                Some((parent, _)) => parent.children.push(node),
                None => rec.roots.push(node),
            }
        });
    }
}
