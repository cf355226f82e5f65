//! # Layers
//!
//! A [`Layer`] is one active transform instance. It is built from a
//! [`LayerSpec`] when pushed, and captures the thread's capability overlay at
//! that moment so the exit interceptor can restore it verbatim once the
//! innermost work reaches the base runtime.

use std::fmt;

use dynlayer_core::capability::{self, LocalCapabilities};
use dynlayer_core::Level;
use serde::{Deserialize, Serialize};

/// Which transform a layer runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransformKind {
    /// Records history on values tagged at the layer's level
    Differentiation,
    /// Vectorizes over a leading batch dimension
    Batching,
}

impl fmt::Display for TransformKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransformKind::Differentiation => "Differentiation",
            TransformKind::Batching => "Batching",
        };
        write!(f, "{}", name)
    }
}

/// How random operators behave under a batching layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Randomness {
    /// Random operators fail
    #[default]
    Error,
    /// One draw shared by every batch entry
    Same,
    /// An independent draw per batch entry
    Different,
}

/// Parameters of a layer about to be pushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LayerSpec {
    pub(crate) kind: TransformKind,
    pub(crate) batch_size: Option<usize>,
    pub(crate) randomness: Option<Randomness>,
    pub(crate) prior_grad: Option<bool>,
    pub(crate) prior_forward_grad: Option<bool>,
}

impl LayerSpec {
    /// A differentiation layer. At least one of the prior flags must be
    /// supplied; a flag of `false` disables that mode while the layer hands
    /// work to the layers below it.
    pub fn differentiation(prior_grad: Option<bool>, prior_forward_grad: Option<bool>) -> Self {
        Self {
            kind: TransformKind::Differentiation,
            batch_size: None,
            randomness: None,
            prior_grad,
            prior_forward_grad,
        }
    }

    /// A batching layer over `batch_size` entries.
    pub fn batching(batch_size: usize, randomness: Randomness) -> Self {
        Self {
            kind: TransformKind::Batching,
            batch_size: Some(batch_size),
            randomness: Some(randomness),
            prior_grad: None,
            prior_forward_grad: None,
        }
    }

    /// The transform this spec describes.
    pub fn kind(&self) -> TransformKind {
        self.kind
    }
}

/// One active transform instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layer {
    kind: TransformKind,
    level: Level,
    batch_size: Option<usize>,
    randomness: Option<Randomness>,
    prior_grad: Option<bool>,
    prior_forward_grad: Option<bool>,
    saved_capabilities: LocalCapabilities,
}

impl Layer {
    /// Build a layer at `level`, capturing the current overlay.
    ///
    /// Panics if a differentiation spec carries neither prior flag.
    pub fn new(spec: LayerSpec, level: Level) -> Self {
        if spec.kind == TransformKind::Differentiation {
            assert!(
                spec.prior_grad.is_some() || spec.prior_forward_grad.is_some(),
                "differentiation layer at level {} needs a prior grad or forward grad flag",
                level
            );
        }
        Self {
            kind: spec.kind,
            level,
            batch_size: spec.batch_size,
            randomness: spec.randomness,
            prior_grad: spec.prior_grad,
            prior_forward_grad: spec.prior_forward_grad,
            saved_capabilities: capability::local(),
        }
    }

    pub fn kind(&self) -> TransformKind {
        self.kind
    }

    pub fn level(&self) -> Level {
        self.level
    }

    /// Batch size of a batching layer. Panics on other kinds.
    pub fn batch_size(&self) -> usize {
        match self.batch_size {
            Some(size) => size,
            None => panic!("{} layer has no batch size", self),
        }
    }

    /// Randomness policy of a batching layer. Panics on other kinds.
    pub fn randomness(&self) -> Randomness {
        match self.randomness {
            Some(policy) => policy,
            None => panic!("{} layer has no randomness policy", self),
        }
    }

    pub fn prior_grad(&self) -> Option<bool> {
        self.prior_grad
    }

    pub fn prior_forward_grad(&self) -> Option<bool> {
        self.prior_forward_grad
    }

    /// The overlay captured when the layer was built.
    pub fn saved_capabilities(&self) -> LocalCapabilities {
        self.saved_capabilities
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.level, self.kind)
    }
}
