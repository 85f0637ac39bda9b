//! # Resource descriptors
//!
//! The data-driven heart of the diff engine. Each manageable entity kind
//! declares a static table of its attributes with a merge policy and a
//! mutability class; the diff engine and planner are generic over these
//! tables instead of carrying per-kind comparison code.

use std::collections::BTreeSet;
use std::fmt;

use serde::Serialize;

/// The closed set of entity kinds this tool manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceKind {
    Database,
    User,
    Role,
    Grant,
    Quota,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Database => "database",
            ResourceKind::User => "user",
            ResourceKind::Role => "role",
            ResourceKind::Grant => "grant",
            ResourceKind::Quota => "quota",
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a desired attribute value is merged into the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergePolicy {
    /// Change emitted iff desired != current.
    Replace,
    /// Change emitted iff desired is not a subset of current; the resulting
    /// value is the union. Comparison is order-independent.
    SetUnion,
    /// Change emitted iff desired set != current set, order-independent.
    SetReplace,
    /// The backend refuses to alter this after creation: a differing desired
    /// value produces a warning, never a statement.
    ImmutableOnceSet,
    /// Never compared.
    Ignore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mutability {
    /// Only settable at creation; a change request against an existing
    /// resource produces a warning and never appears in an ALTER statement.
    CreateOnly,
    Mutable,
}

pub struct AttributeSpec {
    pub name: &'static str,
    pub policy: MergePolicy,
    pub mutability: Mutability,
}

/// Per-kind attribute table. The order of `attributes` is the canonical
/// serialization order the planner uses for CREATE statements, regardless of
/// the order the caller supplied values in.
pub struct ResourceDescriptor {
    pub kind: ResourceKind,
    pub attributes: &'static [AttributeSpec],
}

impl ResourceDescriptor {
    pub fn attribute(&self, name: &str) -> Option<&AttributeSpec> {
        self.attributes.iter().find(|a| a.name == name)
    }
}

/// An attribute value, desired or observed.
///
/// Set-valued variants are backed by `BTreeSet`, so equality is canonical and
/// order-independent by construction: the input ordering of a list attribute
/// can never affect the changed/unchanged decision.
#[derive(Debug, Clone, PartialEq)]
pub enum AttrValue {
    Str(String),
    Bool(bool),
    Int(i64),
    /// Set of plain strings (role names, quota apply_to lists, canonicalized
    /// quota limit clauses).
    StrSet(BTreeSet<String>),
    /// Set of (privilege, object, grant_option) triples.
    GrantSet(BTreeSet<(String, String, bool)>),
}

impl AttrValue {
    pub fn str_set<I, S>(items: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        AttrValue::StrSet(items.into_iter().map(Into::into).collect())
    }

    /// Whether the value counts as "unset" for the ImmutableOnceSet policy.
    pub fn is_empty(&self) -> bool {
        match self {
            AttrValue::Str(s) => s.is_empty(),
            AttrValue::StrSet(s) => s.is_empty(),
            AttrValue::GrantSet(s) => s.is_empty(),
            AttrValue::Bool(_) | AttrValue::Int(_) => false,
        }
    }

    /// Set union for the SetUnion policy. Non-set values return `None`.
    pub fn union(&self, other: &AttrValue) -> Option<AttrValue> {
        match (self, other) {
            (AttrValue::StrSet(a), AttrValue::StrSet(b)) => {
                Some(AttrValue::StrSet(a.union(b).cloned().collect()))
            }
            (AttrValue::GrantSet(a), AttrValue::GrantSet(b)) => {
                Some(AttrValue::GrantSet(a.union(b).cloned().collect()))
            }
            _ => None,
        }
    }

    /// Subset test for the SetUnion policy. Non-set values return `None`.
    pub fn is_subset_of(&self, other: &AttrValue) -> Option<bool> {
        match (self, other) {
            (AttrValue::StrSet(a), AttrValue::StrSet(b)) => Some(a.is_subset(b)),
            (AttrValue::GrantSet(a), AttrValue::GrantSet(b)) => Some(a.is_subset(b)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_str_set_equality_is_order_independent() {
        let a = AttrValue::str_set(["reader", "writer"]);
        let b = AttrValue::str_set(["writer", "reader"]);
        assert_eq!(a, b);
    }

    #[test]
    fn test_union_and_subset() {
        let current = AttrValue::str_set(["a", "b"]);
        let desired = AttrValue::str_set(["b", "c"]);
        assert_eq!(desired.is_subset_of(&current), Some(false));
        assert_eq!(
            desired.union(&current),
            Some(AttrValue::str_set(["a", "b", "c"]))
        );
    }

    #[test]
    fn test_is_empty() {
        assert!(AttrValue::Str(String::new()).is_empty());
        assert!(AttrValue::StrSet(BTreeSet::new()).is_empty());
        assert!(!AttrValue::Bool(false).is_empty());
        assert!(!AttrValue::Str("x".into()).is_empty());
    }
}
