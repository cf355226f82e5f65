//! # Operator Schemas
//!
//! A schema names an operator and describes its arguments and returns,
//! including aliasing annotations. `Tensor(a!)` on an argument means the
//! kernel writes to that argument in place; the same alias set on a return
//! means the argument itself is returned.
//!
//! ```rust
//! use dynlayer_core::schema::{Argument, Schema};
//!
//! let add_ = Schema::new("add_")
//!     .arg(Argument::tensor("self").written('a'))
//!     .arg(Argument::tensor("other"))
//!     .ret(Argument::tensor("out").written('a'));
//!
//! assert!(add_.is_inplace());
//! assert_eq!(add_.to_string(), "add_(Tensor(a!) self, Tensor other) -> Tensor(a!)");
//! ```

use std::fmt;

/// The declared type of an argument or return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgType {
    /// A single tensor
    Tensor,
    /// A list of tensors
    TensorList,
    /// A single integer
    Int,
    /// A list of integers
    IntList,
    /// A floating-point scalar
    Float,
}

impl fmt::Display for ArgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ArgType::Tensor => "Tensor",
            ArgType::TensorList => "Tensor[]",
            ArgType::Int => "int",
            ArgType::IntList => "int[]",
            ArgType::Float => "float",
        };
        write!(f, "{}", name)
    }
}

/// Aliasing annotation on an argument or return.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AliasInfo {
    /// Alias set name (`a` in `Tensor(a!)`)
    pub set: char,
    /// Whether the value is written through this alias
    pub is_write: bool,
}

/// One argument or return slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Argument {
    /// Slot name
    pub name: String,
    /// Declared type
    pub ty: ArgType,
    /// Aliasing annotation, if any
    pub alias: Option<AliasInfo>,
}

impl Argument {
    /// Create an argument slot.
    pub fn new(name: &str, ty: ArgType) -> Self {
        Self {
            name: name.to_string(),
            ty,
            alias: None,
        }
    }

    /// A tensor slot.
    pub fn tensor(name: &str) -> Self {
        Self::new(name, ArgType::Tensor)
    }

    /// A tensor-list slot.
    pub fn tensor_list(name: &str) -> Self {
        Self::new(name, ArgType::TensorList)
    }

    /// An integer slot.
    pub fn int(name: &str) -> Self {
        Self::new(name, ArgType::Int)
    }

    /// An integer-list slot.
    pub fn int_list(name: &str) -> Self {
        Self::new(name, ArgType::IntList)
    }

    /// Mark the slot as written through alias set `set` (`(a!)`).
    pub fn written(mut self, set: char) -> Self {
        self.alias = Some(AliasInfo { set, is_write: true });
        self
    }

    /// Mark the slot as a read-only alias of set `set` (`(a)`).
    pub fn aliased(mut self, set: char) -> Self {
        self.alias = Some(AliasInfo {
            set,
            is_write: false,
        });
        self
    }

    fn is_written(&self) -> bool {
        self.alias.map(|a| a.is_write).unwrap_or(false)
    }
}

impl fmt::Display for Argument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.ty)?;
        if let Some(alias) = self.alias {
            write!(f, "({}{})", alias.set, if alias.is_write { "!" } else { "" })?;
        }
        Ok(())
    }
}

/// Name and signature of an operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    /// Operator name
    pub name: String,
    /// Argument slots, in stack order
    pub arguments: Vec<Argument>,
    /// Return slots, in stack order
    pub returns: Vec<Argument>,
}

impl Schema {
    /// Start a schema with no arguments and no returns.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            arguments: Vec::new(),
            returns: Vec::new(),
        }
    }

    /// Append an argument slot.
    pub fn arg(mut self, arg: Argument) -> Self {
        self.arguments.push(arg);
        self
    }

    /// Append a return slot.
    pub fn ret(mut self, ret: Argument) -> Self {
        self.returns.push(ret);
        self
    }

    /// Number of argument slots.
    pub fn num_arguments(&self) -> usize {
        self.arguments.len()
    }

    /// Number of return slots.
    pub fn num_returns(&self) -> usize {
        self.returns.len()
    }

    /// Whether any argument is written in place.
    pub fn is_mutable(&self) -> bool {
        self.arguments.iter().any(Argument::is_written)
    }

    /// Whether this is a plain in-place operation: the first argument is the
    /// only aliased argument, it is written, and it is the single return.
    pub fn is_inplace(&self) -> bool {
        if !self.is_mutable() || self.returns.len() != 1 {
            return false;
        }
        let Some(first) = self.arguments.first() else {
            return false;
        };
        if !first.is_written() {
            return false;
        }
        if self.arguments.iter().skip(1).any(|a| a.alias.is_some()) {
            return false;
        }
        self.returns[0].is_written()
    }
}

impl fmt::Display for Schema {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let args: Vec<String> = self
            .arguments
            .iter()
            .map(|a| format!("{} {}", a, a.name))
            .collect();
        let rets: Vec<String> = self.returns.iter().map(|r| r.to_string()).collect();
        let rets = match rets.len() {
            1 => rets[0].clone(),
            _ => format!("({})", rets.join(", ")),
        };
        write!(f, "{}({}) -> {}", self.name, args.join(", "), rets)
    }
}
