//! # Diff engine
//!
//! Compares desired vs. observed state per attribute, driven by the kind's
//! descriptor table. This replaces the per-kind ad hoc comparison logic that
//! used to be duplicated (with subtle idempotency bugs around list ordering)
//! across resource modules.

use tracing::debug;

use super::descriptor::{AttrValue, MergePolicy, Mutability, ResourceDescriptor};
use super::state::{ObservedState, StateMap};

#[derive(Debug, Clone, PartialEq)]
pub struct AttributeChange {
    pub name: String,
    pub from: Option<AttrValue>,
    pub to: AttrValue,
    pub policy: MergePolicy,
}

/// Result of comparing one resource. An empty change list means the resource
/// already matches: no statements, `changed=false`.
#[derive(Debug, Default)]
pub struct Diff {
    pub changes: Vec<AttributeChange>,
    pub warnings: Vec<String>,
}

impl Diff {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn change(&self, name: &str) -> Option<&AttributeChange> {
        self.changes.iter().find(|c| c.name == name)
    }
}

/// Computes the per-attribute diff for one resource.
///
/// Attributes are visited in the descriptor's canonical order, so the change
/// list (and everything planned from it) is deterministic regardless of the
/// caller's input ordering. Set-valued attributes compare canonically; see
/// [`AttrValue`].
pub fn diff(descriptor: &ResourceDescriptor, desired: &StateMap, observed: &ObservedState) -> Diff {
    let mut result = Diff::default();

    for spec in descriptor.attributes {
        let Some(desired_value) = desired.get(spec.name) else {
            continue;
        };

        if matches!(spec.policy, MergePolicy::Ignore) {
            continue;
        }

        let current = match observed {
            // Absent resource: every desired attribute becomes a create-change
            ObservedState::NotFound => {
                result.changes.push(AttributeChange {
                    name: spec.name.to_string(),
                    from: None,
                    to: desired_value.clone(),
                    policy: spec.policy,
                });
                continue;
            }
            ObservedState::Present(map) => map.get(spec.name),
        };

        if matches!(spec.mutability, Mutability::CreateOnly) {
            if current != Some(desired_value) {
                result.warnings.push(format!(
                    "{} '{}' can only be set at creation; the requested change (to {:?}) \
                     requires recreating the {}",
                    descriptor.kind, spec.name, desired_value, descriptor.kind,
                ));
            }
            continue;
        }

        match spec.policy {
            MergePolicy::Replace => {
                if current != Some(desired_value) {
                    result.changes.push(AttributeChange {
                        name: spec.name.to_string(),
                        from: current.cloned(),
                        to: desired_value.clone(),
                        policy: spec.policy,
                    });
                }
            }
            MergePolicy::SetUnion => {
                let current_set = current.cloned().unwrap_or_else(|| empty_like(desired_value));
                match desired_value.is_subset_of(&current_set) {
                    Some(true) => {}
                    Some(false) => {
                        let merged = desired_value
                            .union(&current_set)
                            .unwrap_or_else(|| desired_value.clone());
                        result.changes.push(AttributeChange {
                            name: spec.name.to_string(),
                            from: Some(current_set),
                            to: merged,
                            policy: spec.policy,
                        });
                    }
                    None => {
                        debug!(
                            "attribute '{}' declared SetUnion but holds a non-set value; \
                             falling back to replace comparison",
                            spec.name
                        );
                        if current != Some(desired_value) {
                            result.changes.push(AttributeChange {
                                name: spec.name.to_string(),
                                from: current.cloned(),
                                to: desired_value.clone(),
                                policy: spec.policy,
                            });
                        }
                    }
                }
            }
            MergePolicy::SetReplace => {
                let current_set = current.cloned().unwrap_or_else(|| empty_like(desired_value));
                if *desired_value != current_set {
                    result.changes.push(AttributeChange {
                        name: spec.name.to_string(),
                        from: Some(current_set),
                        to: desired_value.clone(),
                        policy: spec.policy,
                    });
                }
            }
            MergePolicy::ImmutableOnceSet => {
                let already_set = current.map(|v| !v.is_empty()).unwrap_or(false);
                if already_set && current != Some(desired_value) {
                    result.warnings.push(format!(
                        "{} '{}' cannot be changed once set (currently {:?}, requested {:?}); \
                         recreating the {} is required",
                        descriptor.kind, spec.name, current, desired_value, descriptor.kind,
                    ));
                } else if !already_set && !desired_value.is_empty() {
                    result.changes.push(AttributeChange {
                        name: spec.name.to_string(),
                        from: current.cloned(),
                        to: desired_value.clone(),
                        policy: spec.policy,
                    });
                }
            }
            MergePolicy::Ignore => unreachable!("filtered above"),
        }
    }

    result
}

fn empty_like(value: &AttrValue) -> AttrValue {
    match value {
        AttrValue::GrantSet(_) => AttrValue::GrantSet(Default::default()),
        _ => AttrValue::StrSet(Default::default()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::descriptor::{AttributeSpec, ResourceKind};
    use std::collections::BTreeMap;

    static TEST_DESCRIPTOR: ResourceDescriptor = ResourceDescriptor {
        kind: ResourceKind::User,
        attributes: &[
            AttributeSpec {
                name: "auth",
                policy: MergePolicy::Replace,
                mutability: Mutability::Mutable,
            },
            AttributeSpec {
                name: "roles",
                policy: MergePolicy::SetUnion,
                mutability: Mutability::Mutable,
            },
            AttributeSpec {
                name: "roles_replace",
                policy: MergePolicy::SetReplace,
                mutability: Mutability::Mutable,
            },
            AttributeSpec {
                name: "comment",
                policy: MergePolicy::ImmutableOnceSet,
                mutability: Mutability::Mutable,
            },
            AttributeSpec {
                name: "engine",
                policy: MergePolicy::Replace,
                mutability: Mutability::CreateOnly,
            },
            AttributeSpec {
                name: "internal",
                policy: MergePolicy::Ignore,
                mutability: Mutability::Mutable,
            },
        ],
    };

    fn desired(entries: &[(&str, AttrValue)]) -> StateMap {
        entries
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    fn observed(entries: &[(&str, AttrValue)]) -> ObservedState {
        ObservedState::Present(desired(entries))
    }

    #[test]
    fn test_create_from_absent_emits_one_change_per_attribute() {
        let d = desired(&[
            ("auth", AttrValue::Str("sha256_password".into())),
            ("roles", AttrValue::str_set(["reader"])),
        ]);
        let result = diff(&TEST_DESCRIPTOR, &d, &ObservedState::NotFound);
        assert_eq!(result.changes.len(), 2);
        assert!(result.changes.iter().all(|c| c.from.is_none()));
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn test_no_op_law() {
        let d = desired(&[("auth", AttrValue::Str("sha256_password".into()))]);
        let o = observed(&[("auth", AttrValue::Str("sha256_password".into()))]);
        assert!(diff(&TEST_DESCRIPTOR, &d, &o).is_empty());
    }

    #[test]
    fn test_set_union_order_independence() {
        // Same members in different order must not produce a change
        let d = desired(&[("roles", AttrValue::str_set(["a", "b"]))]);
        let o = observed(&[("roles", AttrValue::str_set(["b", "a"]))]);
        assert!(diff(&TEST_DESCRIPTOR, &d, &o).is_empty());
    }

    #[test]
    fn test_set_union_subset_is_noop() {
        let d = desired(&[("roles", AttrValue::str_set(["a"]))]);
        let o = observed(&[("roles", AttrValue::str_set(["a", "b"]))]);
        assert!(diff(&TEST_DESCRIPTOR, &d, &o).is_empty());
    }

    #[test]
    fn test_set_union_merges() {
        let d = desired(&[("roles", AttrValue::str_set(["c"]))]);
        let o = observed(&[("roles", AttrValue::str_set(["a", "b"]))]);
        let result = diff(&TEST_DESCRIPTOR, &d, &o);
        assert_eq!(result.changes.len(), 1);
        assert_eq!(result.changes[0].to, AttrValue::str_set(["a", "b", "c"]));
    }

    #[test]
    fn test_set_replace_detects_extra_members() {
        let d = desired(&[("roles_replace", AttrValue::str_set(["a"]))]);
        let o = observed(&[("roles_replace", AttrValue::str_set(["a", "b"]))]);
        let result = diff(&TEST_DESCRIPTOR, &d, &o);
        assert_eq!(result.changes.len(), 1);
        assert_eq!(result.changes[0].to, AttrValue::str_set(["a"]));
        assert_eq!(
            result.changes[0].from,
            Some(AttrValue::str_set(["a", "b"]))
        );
    }

    #[test]
    fn test_immutable_once_set_warns_instead_of_changing() {
        let d = desired(&[("comment", AttrValue::Str("new".into()))]);
        let o = observed(&[("comment", AttrValue::Str("old".into()))]);
        let result = diff(&TEST_DESCRIPTOR, &d, &o);
        assert!(result.is_empty());
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].contains("cannot be changed once set"));
    }

    #[test]
    fn test_immutable_once_set_allows_setting_from_empty() {
        let d = desired(&[("comment", AttrValue::Str("new".into()))]);
        let o = observed(&[("comment", AttrValue::Str(String::new()))]);
        let result = diff(&TEST_DESCRIPTOR, &d, &o);
        assert_eq!(result.changes.len(), 1);
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn test_create_only_warns_on_existing_resource() {
        let d = desired(&[("engine", AttrValue::Str("Memory".into()))]);
        let o = observed(&[("engine", AttrValue::Str("Atomic".into()))]);
        let result = diff(&TEST_DESCRIPTOR, &d, &o);
        assert!(result.is_empty());
        assert_eq!(result.warnings.len(), 1);
        assert!(result.warnings[0].contains("only be set at creation"));
    }

    #[test]
    fn test_create_only_matching_value_is_silent() {
        let d = desired(&[("engine", AttrValue::Str("Atomic".into()))]);
        let o = observed(&[("engine", AttrValue::Str("Atomic".into()))]);
        let result = diff(&TEST_DESCRIPTOR, &d, &o);
        assert!(result.is_empty());
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn test_ignore_policy_never_compares() {
        let d = desired(&[("internal", AttrValue::Str("x".into()))]);
        let o = observed(&[("internal", AttrValue::Str("y".into()))]);
        let result = diff(&TEST_DESCRIPTOR, &d, &o);
        assert!(result.is_empty());
        assert!(result.warnings.is_empty());
    }

    #[test]
    fn test_unknown_attributes_in_desired_are_skipped() {
        let mut d = BTreeMap::new();
        d.insert("no_such_attr".to_string(), AttrValue::Bool(true));
        let result = diff(&TEST_DESCRIPTOR, &d, &ObservedState::NotFound);
        assert!(result.is_empty());
    }
}
