//! # Per-kind resource modules
//!
//! Each module owns everything specific to one entity kind: the state-file
//! entry struct, the static descriptor table driving the diff engine, the
//! introspection reader and the SQL renderers. The generic pipeline in
//! `crate::core` never mentions a concrete kind.

pub mod database;
pub mod grants;
pub mod quota;
pub mod role;
pub mod user;

use serde::Deserialize;

use crate::core::descriptor::AttrValue;
use crate::core::reconcile::Transition;
use crate::core::state::StateMap;

/// Desired end state of one state-file entry. `rename` is only meaningful
/// for kinds that support it (databases) and requires `target`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryState {
    #[default]
    Present,
    Absent,
    Rename,
}

pub(crate) fn transition_for(state: EntryState, target: Option<&str>) -> Transition {
    match state {
        EntryState::Present => Transition::Present,
        EntryState::Absent => Transition::Absent,
        // a missing target is rejected by entry validation before this runs
        EntryState::Rename => Transition::Rename {
            target: target.unwrap_or_default().to_string(),
        },
    }
}

pub(crate) fn str_attr(map: &StateMap, name: &str) -> Option<String> {
    match map.get(name) {
        Some(AttrValue::Str(s)) => Some(s.clone()),
        _ => None,
    }
}
