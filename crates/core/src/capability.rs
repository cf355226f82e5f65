//! # Capabilities and the Local Overlay
//!
//! A [`Capability`] is one interception hook the dispatcher can route an
//! operator call to. Capabilities are totally ordered by priority: when a
//! call is dispatched, the highest-priority capability present in the
//! *dispatch set* wins.
//!
//! ## Where Capabilities Come From
//!
//! The dispatch set for a call is computed as:
//!
//! ```text
//! (capabilities carried by the arguments ∪ local.included) − local.excluded
//! ```
//!
//! plus [`Capability::Backend`], which is always reachable.
//!
//! ## The Local Overlay
//!
//! Every thread owns a [`LocalCapabilities`] overlay: an `included` mask that
//! force-enables hooks and an `excluded` mask that hides them. Nested
//! transforms adjust this overlay through scoped guards so that each layer
//! sees exactly its own slice of the dispatch surface:
//!
//! - [`ForceCapabilityGuard`] replaces the whole overlay
//! - [`ExcludeCapabilityGuard`] hides a set of hooks
//! - [`IncludeCapabilityGuard`] enables a set of hooks
//!
//! All guards restore the previous overlay on drop, including when a
//! kernel returns an error or unwinds.

use std::cell::Cell;
use std::fmt;
use std::ops::{BitOr, Sub};

use serde::{Deserialize, Serialize};

// ============================================================================
// Capability
// ============================================================================

/// A single interception hook, ordered from lowest to highest priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(u8)]
pub enum Capability {
    /// The base runtime. Always part of every dispatch set.
    Backend = 0,
    /// Fires when a transform body hands an operation back to the stack.
    ExitInterceptor = 1,
    /// Carried by level-tagged wrappers; catches dead wrappers outside transforms.
    TaggedWrapper = 2,
    /// View/in-place bookkeeping owned by differentiation.
    InplaceOrView = 3,
    /// The differentiation transform body.
    Differentiation = 4,
    /// The batching transform body.
    Batched = 5,
    /// Legacy batch-mode hook used for random operations under batching.
    BatchMode = 6,
    /// Fires first whenever any layer is active.
    EntryInterceptor = 7,
}

impl Capability {
    /// Every capability, lowest priority first.
    pub const ALL: [Capability; 8] = [
        Capability::Backend,
        Capability::ExitInterceptor,
        Capability::TaggedWrapper,
        Capability::InplaceOrView,
        Capability::Differentiation,
        Capability::Batched,
        Capability::BatchMode,
        Capability::EntryInterceptor,
    ];

    fn bit(self) -> u16 {
        1 << (self as u8)
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

// ============================================================================
// CapabilitySet
// ============================================================================

/// A bitset of capabilities.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct CapabilitySet(u16);

impl CapabilitySet {
    /// The empty set.
    pub const EMPTY: CapabilitySet = CapabilitySet(0);

    /// Create an empty set.
    pub const fn empty() -> Self {
        Self::EMPTY
    }

    /// Create a set from a slice of capabilities.
    pub fn of(caps: &[Capability]) -> Self {
        caps.iter().fold(Self::EMPTY, |set, &cap| set.with(cap))
    }

    /// Every capability except [`Capability::Backend`].
    pub fn all_interception() -> Self {
        Self::of(&Capability::ALL).without(Capability::Backend)
    }

    /// Return a copy with `cap` added.
    pub fn with(self, cap: Capability) -> Self {
        Self(self.0 | cap.bit())
    }

    /// Return a copy with `cap` removed.
    pub fn without(self, cap: Capability) -> Self {
        Self(self.0 & !cap.bit())
    }

    /// Check membership.
    pub fn contains(self, cap: Capability) -> bool {
        self.0 & cap.bit() != 0
    }

    /// Check if the set has no members.
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Number of members.
    pub fn len(self) -> usize {
        self.0.count_ones() as usize
    }

    /// The highest-priority member, if any.
    pub fn highest(self) -> Option<Capability> {
        self.iter_by_priority().next()
    }

    /// Members from highest to lowest priority.
    pub fn iter_by_priority(self) -> impl Iterator<Item = Capability> {
        Capability::ALL
            .into_iter()
            .rev()
            .filter(move |cap| self.contains(*cap))
    }
}

impl BitOr for CapabilitySet {
    type Output = CapabilitySet;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl Sub for CapabilitySet {
    type Output = CapabilitySet;

    fn sub(self, rhs: Self) -> Self {
        Self(self.0 & !rhs.0)
    }
}

impl From<Capability> for CapabilitySet {
    fn from(cap: Capability) -> Self {
        Self::EMPTY.with(cap)
    }
}

impl fmt::Debug for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self)
    }
}

impl fmt::Display for CapabilitySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.iter_by_priority().map(|c| c.to_string()).collect();
        write!(f, "{{{}}}", names.join(", "))
    }
}

// ============================================================================
// Thread-Local Overlay
// ============================================================================

/// The per-thread include/exclude overlay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LocalCapabilities {
    /// Hooks forced on regardless of the arguments.
    pub included: CapabilitySet,
    /// Hooks hidden regardless of the arguments. Wins over `included`.
    pub excluded: CapabilitySet,
}

impl LocalCapabilities {
    /// Apply the overlay to the capabilities carried by a call's arguments.
    pub fn apply(&self, carried: CapabilitySet) -> CapabilitySet {
        ((carried | self.included) - self.excluded).with(Capability::Backend)
    }

    /// Return a copy with `cap` included and not excluded.
    pub fn enable(mut self, cap: Capability) -> Self {
        self.included = self.included.with(cap);
        self.excluded = self.excluded.without(cap);
        self
    }
}

impl fmt::Display for LocalCapabilities {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "include={} exclude={}", self.included, self.excluded)
    }
}

thread_local! {
    static LOCAL: Cell<LocalCapabilities> = const {
        Cell::new(LocalCapabilities {
            included: CapabilitySet::EMPTY,
            excluded: CapabilitySet::EMPTY,
        })
    };
}

/// Read the calling thread's overlay.
pub fn local() -> LocalCapabilities {
    LOCAL.with(|cell| cell.get())
}

/// Replace the calling thread's overlay without a guard.
///
/// Prefer [`ForceCapabilityGuard`]; this is for context restoration.
pub fn force_local(set: LocalCapabilities) {
    LOCAL.with(|cell| cell.set(set));
}

/// Add or remove `cap` from the included mask.
pub fn set_included(cap: Capability, included: bool) {
    LOCAL.with(|cell| {
        let mut set = cell.get();
        set.included = if included {
            set.included.with(cap)
        } else {
            set.included.without(cap)
        };
        cell.set(set);
    });
}

/// Add or remove `cap` from the excluded mask.
pub fn set_excluded(cap: Capability, excluded: bool) {
    LOCAL.with(|cell| {
        let mut set = cell.get();
        set.excluded = if excluded {
            set.excluded.with(cap)
        } else {
            set.excluded.without(cap)
        };
        cell.set(set);
    });
}

// ============================================================================
// Scoped Guards
// ============================================================================

/// Replaces the whole overlay for a scope.
#[must_use = "the overlay is restored as soon as the guard is dropped"]
pub struct ForceCapabilityGuard {
    saved: LocalCapabilities,
}

impl ForceCapabilityGuard {
    /// Force `set` until the guard is dropped.
    pub fn new(set: LocalCapabilities) -> Self {
        let saved = local();
        force_local(set);
        Self { saved }
    }
}

impl Drop for ForceCapabilityGuard {
    fn drop(&mut self) {
        force_local(self.saved);
    }
}

/// Hides a set of hooks for a scope.
///
/// Only the bits this guard actually added are removed again, so nested
/// guards over overlapping sets compose.
#[must_use = "the hooks are visible again as soon as the guard is dropped"]
pub struct ExcludeCapabilityGuard {
    added: CapabilitySet,
}

impl ExcludeCapabilityGuard {
    /// Exclude `set` until the guard is dropped.
    pub fn new(set: impl Into<CapabilitySet>) -> Self {
        let set = set.into();
        let mut current = local();
        let added = set - current.excluded;
        current.excluded = current.excluded | set;
        force_local(current);
        Self { added }
    }
}

impl Drop for ExcludeCapabilityGuard {
    fn drop(&mut self) {
        let mut current = local();
        current.excluded = current.excluded - self.added;
        force_local(current);
    }
}

/// Enables a set of hooks for a scope.
#[must_use = "the hooks are disabled again as soon as the guard is dropped"]
pub struct IncludeCapabilityGuard {
    added: CapabilitySet,
}

impl IncludeCapabilityGuard {
    /// Include `set` until the guard is dropped.
    pub fn new(set: impl Into<CapabilitySet>) -> Self {
        let set = set.into();
        let mut current = local();
        let added = set - current.included;
        current.included = current.included | set;
        force_local(current);
        Self { added }
    }
}

impl Drop for IncludeCapabilityGuard {
    fn drop(&mut self) {
        let mut current = local();
        current.included = current.included - self.added;
        force_local(current);
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_highest_respects_priority() {
        let set = CapabilitySet::of(&[
            Capability::Backend,
            Capability::Differentiation,
            Capability::ExitInterceptor,
        ]);
        assert_eq!(set.highest(), Some(Capability::Differentiation));
        assert_eq!(CapabilitySet::empty().highest(), None);
    }

    #[test]
    fn test_iter_by_priority_descends() {
        let set = CapabilitySet::of(&[Capability::Backend, Capability::EntryInterceptor, Capability::Batched]);
        let order: Vec<_> = set.iter_by_priority().collect();
        assert_eq!(
            order,
            vec![Capability::EntryInterceptor, Capability::Batched, Capability::Backend]
        );
    }

    #[test]
    fn test_set_algebra() {
        let a = CapabilitySet::of(&[Capability::Batched, Capability::BatchMode]);
        let b = CapabilitySet::from(Capability::BatchMode);

        assert_eq!((a - b), CapabilitySet::from(Capability::Batched));
        assert_eq!((a | b), a);
        assert_eq!(a.len(), 2);
        assert!(!CapabilitySet::all_interception().contains(Capability::Backend));
        assert_eq!(CapabilitySet::all_interception().len(), 7);
    }

    #[test]
    fn test_excluded_wins_and_backend_is_always_present() {
        let overlay = LocalCapabilities {
            included: CapabilitySet::from(Capability::Batched),
            excluded: CapabilitySet::of(&[Capability::Batched, Capability::Backend]),
        };
        let set = overlay.apply(CapabilitySet::empty());
        assert!(!set.contains(Capability::Batched));
        assert!(set.contains(Capability::Backend));
    }

    #[test]
    fn test_display_lists_highest_first() {
        let set = CapabilitySet::of(&[Capability::ExitInterceptor, Capability::EntryInterceptor]);
        assert_eq!(set.to_string(), "{EntryInterceptor, ExitInterceptor}");
    }

    #[test]
    fn test_force_guard_restores() {
        let before = local();
        {
            let _guard = ForceCapabilityGuard::new(LocalCapabilities {
                included: CapabilitySet::from(Capability::Batched),
                excluded: CapabilitySet::empty(),
            });
            assert!(local().included.contains(Capability::Batched));
        }
        assert_eq!(local(), before);
    }

    #[test]
    fn test_exclude_guard_only_removes_what_it_added() {
        set_excluded(Capability::Batched, true);
        {
            let _guard = ExcludeCapabilityGuard::new(CapabilitySet::of(&[
                Capability::Batched,
                Capability::Differentiation,
            ]));
            assert!(local().excluded.contains(Capability::Differentiation));
        }
        // Batched was excluded before the guard and must stay excluded.
        assert!(local().excluded.contains(Capability::Batched));
        assert!(!local().excluded.contains(Capability::Differentiation));
        set_excluded(Capability::Batched, false);
    }

    #[test]
    fn test_guards_restore_on_unwind() {
        let before = local();
        let result = std::panic::catch_unwind(|| {
            let _guard = IncludeCapabilityGuard::new(Capability::EntryInterceptor);
            panic!("kernel blew up");
        });
        assert!(result.is_err());
        assert_eq!(local(), before);
    }
}
