//! Schema compatibility checking
//!
//! Decides whether data that is valid under an older descriptor remains
//! valid under a newer one. The comparison is structural: ref targets are
//! followed and compared by shape, so renaming a definition is harmless as
//! long as its properties line up.

use std::collections::{BTreeMap, HashSet};

use serde::{Deserialize, Serialize};

use crate::descriptor::{ObjectDescriptor, Property, PropertyKind, SchemaDescriptor};

/// Result of a compatibility check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompatibilityResult {
    /// Whether the new descriptor accepts everything the old one did
    pub is_compatible: bool,
    /// List of changes detected
    pub changes: Vec<SchemaChange>,
    /// Summary of the compatibility check
    pub summary: String,
}

impl CompatibilityResult {
    fn from_changes(changes: Vec<SchemaChange>, strict: bool) -> Self {
        let breaking = changes.iter().filter(|c| c.is_breaking).count();
        if strict && !changes.is_empty() {
            Self {
                is_compatible: false,
                summary: format!("Strict mode: {} changes detected", changes.len()),
                changes,
            }
        } else if breaking > 0 {
            Self {
                is_compatible: false,
                summary: format!("{} breaking changes detected", breaking),
                changes,
            }
        } else {
            let summary = if changes.is_empty() {
                "No changes detected".to_string()
            } else {
                format!("{} compatible changes detected", changes.len())
            };
            Self {
                is_compatible: true,
                changes,
                summary,
            }
        }
    }

    /// Descriptions of the changes that break compatibility
    pub fn breaking_reasons(&self) -> Vec<String> {
        self.changes
            .iter()
            .filter(|c| c.is_breaking)
            .map(|c| c.description.clone())
            .collect()
    }
}

/// A detected change between two descriptors
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaChange {
    /// Type of change
    pub change_type: ChangeType,
    /// Dotted path to the changed property (e.g. "address.city")
    pub path: String,
    /// Whether this change is breaking
    pub is_breaking: bool,
    /// Human-readable description
    pub description: String,
}

/// Type of schema change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    FieldAdded,
    FieldRemoved,
    TypeChanged,
    /// required -> optional
    Relaxed,
    /// optional -> required
    Tightened,
}

/// Compatibility checker for descriptors
#[derive(Debug, Default)]
pub struct CompatibilityChecker {
    /// Strict mode - any change is considered breaking
    strict_mode: bool,
}

impl CompatibilityChecker {
    pub fn new() -> Self {
        Self { strict_mode: false }
    }

    /// Enable strict mode
    pub fn strict(mut self) -> Self {
        self.strict_mode = true;
        self
    }

    /// Compare `new` against the `old` descriptor it would replace
    pub fn check(&self, old: &SchemaDescriptor, new: &SchemaDescriptor) -> CompatibilityResult {
        let mut walk = Walk {
            old,
            new,
            visited: HashSet::new(),
            changes: Vec::new(),
        };
        walk.compare_objects(&old.root, &new.root, "");
        CompatibilityResult::from_changes(walk.changes, self.strict_mode)
    }
}

/// Whether `new` is backward compatible with `old`
pub fn is_compatible(new: &SchemaDescriptor, old: &SchemaDescriptor) -> bool {
    CompatibilityChecker::new().check(old, new).is_compatible
}

struct Walk<'a> {
    old: &'a SchemaDescriptor,
    new: &'a SchemaDescriptor,
    /// (old definition, new definition) pairs already compared
    visited: HashSet<(&'a str, &'a str)>,
    changes: Vec<SchemaChange>,
}

impl<'a> Walk<'a> {
    fn compare_objects(&mut self, old: &'a ObjectDescriptor, new: &'a ObjectDescriptor, path: &str) {
        self.removed_and_changed(&old.properties, &new.properties, path);
        self.added(&old.properties, &new.properties, path);
    }

    fn removed_and_changed(
        &mut self,
        old_props: &'a BTreeMap<String, Property>,
        new_props: &'a BTreeMap<String, Property>,
        path: &str,
    ) {
        for (name, old_prop) in old_props {
            let prop_path = join(path, name);
            let Some(new_prop) = new_props.get(name) else {
                self.push(
                    ChangeType::FieldRemoved,
                    &prop_path,
                    old_prop.required,
                    if old_prop.required {
                        format!("Required property '{}' was removed", prop_path)
                    } else {
                        format!("Optional property '{}' was removed", prop_path)
                    },
                );
                continue;
            };

            match (old_prop.required, new_prop.required) {
                (false, true) => self.push(
                    ChangeType::Tightened,
                    &prop_path,
                    true,
                    format!("Property '{}' became required", prop_path),
                ),
                (true, false) => self.push(
                    ChangeType::Relaxed,
                    &prop_path,
                    false,
                    format!("Property '{}' became optional", prop_path),
                ),
                _ => {}
            }

            self.compare_kinds(&old_prop.kind, &new_prop.kind, &prop_path);
        }
    }

    fn added(
        &mut self,
        old_props: &BTreeMap<String, Property>,
        new_props: &BTreeMap<String, Property>,
        path: &str,
    ) {
        for (name, new_prop) in new_props {
            if old_props.contains_key(name) {
                continue;
            }
            let prop_path = join(path, name);
            self.push(
                ChangeType::FieldAdded,
                &prop_path,
                new_prop.required,
                if new_prop.required {
                    format!("Required property '{}' was added", prop_path)
                } else {
                    format!("Optional property '{}' was added", prop_path)
                },
            );
        }
    }

    fn compare_kinds(&mut self, old: &'a PropertyKind, new: &'a PropertyKind, path: &str) {
        match (old, new) {
            (PropertyKind::Primitive { primitive: a }, PropertyKind::Primitive { primitive: b })
            | (PropertyKind::Array { items: a }, PropertyKind::Array { items: b })
                if a == b => {}
            (PropertyKind::ObjectRef { target: a }, PropertyKind::ObjectRef { target: b })
            | (PropertyKind::ArrayRef { target: a }, PropertyKind::ArrayRef { target: b }) => {
                self.compare_definitions(a, b, path);
            }
            _ => self.push(
                ChangeType::TypeChanged,
                path,
                true,
                format!("Property '{}' changed type from {} to {}", path, old, new),
            ),
        }
    }

    fn compare_definitions(&mut self, old_name: &'a str, new_name: &'a str, path: &str) {
        // Recursive definitions terminate here: a pair already under comparison
        // is assumed compatible, any real difference is reported on first visit.
        if !self.visited.insert((old_name, new_name)) {
            return;
        }
        match (self.old.definition(old_name), self.new.definition(new_name)) {
            (Some(old_def), Some(new_def)) => self.compare_objects(old_def, new_def, path),
            (_, None) => self.push(
                ChangeType::TypeChanged,
                path,
                true,
                format!("Property '{}' references missing definition '{}'", path, new_name),
            ),
            (None, Some(_)) => {}
        }
    }

    fn push(&mut self, change_type: ChangeType, path: &str, is_breaking: bool, description: String) {
        self.changes.push(SchemaChange {
            change_type,
            path: path.to_string(),
            is_breaking,
            description,
        });
    }
}

fn join(path: &str, name: &str) -> String {
    if path.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", path, name)
    }
}
