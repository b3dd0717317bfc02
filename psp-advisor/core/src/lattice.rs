//! Per-dimension merge rules.
//!
//! Every dimension of a policy is a join-semilattice: `Default` is the bottom element (the most
//! restrictive value, permitting nothing) and `join` computes the least value that permits both
//! operands. Joins are commutative, associative and idempotent, and never narrow either operand.
//!
//! The direction of widening differs per dimension. Flags like `privileged` widen toward `true`
//! ([`AnyOf`]), while `readOnlyRootFilesystem` widens toward `false` ([`AllOf`]). Added
//! capabilities widen by union, but required drops widen by intersection ([`Intersection`]).

use crate::snapshot::ProcMountType;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

pub trait Join: Default {
    /// Returns the least value that permits everything `self` and `other` permit.
    fn join(&self, other: &Self) -> Self;

    /// Indicates whether `self` permits everything `other` permits.
    fn covers(&self, other: &Self) -> bool
    where
        Self: PartialEq,
    {
        self.join(other) == *self
    }
}

/// A flag that is permitted once any observation sets it.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct AnyOf(pub bool);

/// A flag that holds only while every observation sets it.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct AllOf(pub bool);

/// A set that grows by union.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Union<T: Ord>(BTreeSet<T>);

/// A set that shrinks by intersection as observations widen it.
///
/// Before anything is observed the set is unconstrained, i.e. it behaves as the set of all
/// values.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Intersection<T: Ord> {
    Unconstrained,
    Only(BTreeSet<T>),
}

/// A closed range of numeric ids.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum IdRange {
    #[default]
    Empty,
    Range {
        min: i64,
        max: i64,
    },
    /// An unset id was observed, so any id must be permitted.
    Any,
}

/// A single value that holds only while every observation agrees on it.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Agreement<T> {
    Empty,
    Exact(T),
    Any,
}

/// Paths mapped to whether they must be mounted read-only.
///
/// The key set grows by union; a path stays read-only only while every observation of it is.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct ReadOnlyPaths(BTreeMap<String, bool>);

// === impl AnyOf ===

impl Join for AnyOf {
    fn join(&self, other: &Self) -> Self {
        Self(self.0 || other.0)
    }
}

// === impl AllOf ===

impl Default for AllOf {
    fn default() -> Self {
        Self(true)
    }
}

impl Join for AllOf {
    fn join(&self, other: &Self) -> Self {
        Self(self.0 && other.0)
    }
}

// === impl Union ===

impl<T: Ord> Default for Union<T> {
    fn default() -> Self {
        Self(BTreeSet::new())
    }
}

impl<T: Ord + Clone> Join for Union<T> {
    fn join(&self, other: &Self) -> Self {
        Self(self.0.union(&other.0).cloned().collect())
    }
}

impl<T: Ord> Union<T> {
    pub fn single(value: T) -> Self {
        Self(std::iter::once(value).collect())
    }

    pub fn contains(&self, value: &T) -> bool {
        self.0.contains(value)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.0.iter()
    }
}

impl<T: Ord> FromIterator<T> for Union<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

// === impl Intersection ===

impl<T: Ord> Default for Intersection<T> {
    fn default() -> Self {
        Self::Unconstrained
    }
}

impl<T: Ord + Clone> Join for Intersection<T> {
    fn join(&self, other: &Self) -> Self {
        match (self, other) {
            (Self::Unconstrained, s) | (s, Self::Unconstrained) => s.clone(),
            (Self::Only(a), Self::Only(b)) => Self::Only(a.intersection(b).cloned().collect()),
        }
    }
}

impl<T: Ord> FromIterator<T> for Intersection<T> {
    fn from_iter<I: IntoIterator<Item = T>>(iter: I) -> Self {
        Self::Only(iter.into_iter().collect())
    }
}

// === impl IdRange ===

impl IdRange {
    pub fn exact(id: i64) -> Self {
        Self::Range { min: id, max: id }
    }

    /// Lifts a single observation: unset ids permit any id.
    pub fn observe(id: Option<i64>) -> Self {
        id.map_or(Self::Any, Self::exact)
    }
}

impl Join for IdRange {
    fn join(&self, other: &Self) -> Self {
        match (*self, *other) {
            (Self::Empty, r) | (r, Self::Empty) => r,
            (Self::Any, _) | (_, Self::Any) => Self::Any,
            (Self::Range { min: a0, max: a1 }, Self::Range { min: b0, max: b1 }) => Self::Range {
                min: a0.min(b0),
                max: a1.max(b1),
            },
        }
    }
}

// === impl Agreement ===

impl<T> Default for Agreement<T> {
    fn default() -> Self {
        Self::Empty
    }
}

impl<T> Agreement<T> {
    /// Lifts a single observation: unset values permit any value.
    pub fn observe(value: Option<T>) -> Self {
        value.map_or(Self::Any, Self::Exact)
    }
}

impl<T: Clone + Eq> Join for Agreement<T> {
    fn join(&self, other: &Self) -> Self {
        match (self, other) {
            (Self::Empty, v) | (v, Self::Empty) => v.clone(),
            (Self::Exact(a), Self::Exact(b)) if a == b => Self::Exact(a.clone()),
            _ => Self::Any,
        }
    }
}

// === impl ReadOnlyPaths ===

impl Join for ReadOnlyPaths {
    fn join(&self, other: &Self) -> Self {
        let mut paths = self.0.clone();
        for (path, read_only) in other.0.iter() {
            paths
                .entry(path.clone())
                .and_modify(|ro| *ro = *ro && *read_only)
                .or_insert(*read_only);
        }
        Self(paths)
    }
}

impl ReadOnlyPaths {
    pub fn iter(&self) -> impl Iterator<Item = (&str, bool)> {
        self.0.iter().map(|(p, ro)| (p.as_str(), *ro))
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<(String, bool)> for ReadOnlyPaths {
    fn from_iter<I: IntoIterator<Item = (String, bool)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

// === impl ProcMountType ===

impl Join for ProcMountType {
    fn join(&self, other: &Self) -> Self {
        (*self).max(*other)
    }
}
