//! Desired and observed state of a single resource.
//!
//! Both are ephemeral, scoped to one reconciliation call. Observed state is
//! always re-read live from the target's system tables; nothing here is
//! cached across invocations.

use std::collections::BTreeMap;

use super::descriptor::AttrValue;

/// Attribute name -> value. Unset attributes are simply absent and stay
/// untouched by reconciliation.
pub type StateMap = BTreeMap<String, AttrValue>;

/// Current state of a named resource on the target. Absence of the resource
/// is a distinct state, not an empty attribute map.
#[derive(Debug, Clone, PartialEq)]
pub enum ObservedState {
    NotFound,
    Present(StateMap),
}

impl ObservedState {
    pub fn is_found(&self) -> bool {
        matches!(self, ObservedState::Present(_))
    }

    pub fn get(&self, name: &str) -> Option<&AttrValue> {
        match self {
            ObservedState::NotFound => None,
            ObservedState::Present(map) => map.get(name),
        }
    }
}
