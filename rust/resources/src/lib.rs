//! The resource model: typed host state with identity, an asymmetric
//! "satisfies" relation, and load/resolve/apply operations dispatched
//! through a per-type registry.
//!
//! A [`Resource`] is one instance: a type name, an id derived from its
//! identifying fields, and a canonical state tree. Single-flavored types
//! (e.g. `File`) own their instances individually; group-flavored types
//! (e.g. `APTPackage`, coordinated by `APTPackages`) are loaded and applied
//! as one batch so a single package-manager transaction covers them all.

use common::{
    eyre::Result,
    serde_yaml::{self, Value},
};

mod apt;
pub mod diff;
mod file;
mod registry;

pub use apt::{AptPackageState, AptPackagesProvider};
pub use file::{FileProvider, FileState};
pub use registry::{decode, group_provider, provider, type_names, GroupProvider, Provider,
    SingleProvider};

/// The (type, id) identity of a resource, unique within a blueprint
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ResourceKey {
    pub type_name: String,
    pub id: String,
}

impl std::fmt::Display for ResourceKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.type_name, self.id)
    }
}

/// One resource instance: identity plus canonical desired (or observed)
/// state
///
/// Construct through [`decode`] so the state has been validated against the
/// type's schema (unknown fields rejected) and re-rendered in canonical
/// field order.
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
    type_name: &'static str,
    id: String,
    state: Value,
}

impl Resource {
    pub(crate) fn new(type_name: &'static str, id: String, state: Value) -> Self {
        Self {
            type_name,
            id,
            state,
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn key(&self) -> ResourceKey {
        ResourceKey {
            type_name: self.type_name.to_string(),
            id: self.id.clone(),
        }
    }

    /// The canonical state tree
    pub fn state(&self) -> &Value {
        &self.state
    }

    /// Whether the state means "ensure not present"
    pub fn absent(&self) -> bool {
        matches!(
            self.state.get("absent"),
            Some(Value::Bool(true))
        )
    }

    /// Whether this resource's state fully satisfies every field
    /// constrained by `other`
    ///
    /// Fields unset in `other` are wildcards; the relation is not
    /// symmetric. Resources of different identities never satisfy each
    /// other.
    pub fn satisfies(&self, other: &Resource) -> bool {
        if self.key() != other.key() {
            return false;
        }
        let (Value::Mapping(ours), Value::Mapping(theirs)) = (&self.state, &other.state) else {
            return self.state == other.state;
        };
        theirs.iter().all(|(field, constraint)| {
            constraint.is_null() || ours.get(field) == Some(constraint)
        })
    }

    /// The canonical field-ordered YAML rendering of the state, used for
    /// textual diffs
    pub fn canonical_yaml(&self) -> Result<String> {
        Ok(serde_yaml::to_string(&self.state)?)
    }

    /// Check internal consistency of the state; never touches a host
    pub fn validate(&self) -> Result<()> {
        match provider(self.type_name)? {
            Provider::Single(single) => single.validate(self),
            Provider::Group(group) => group.validate(self),
        }
    }
}

#[cfg(test)]
mod tests {
    use common::serde_yaml;

    use super::*;

    fn file(yaml: &str) -> Resource {
        decode("File", serde_yaml::from_str(yaml).expect("yaml")).expect("decode")
    }

    #[test]
    fn satisfies_ignores_unset_fields() {
        let observed = file("{path: /etc/motd, regular_file: hi, mode: '0644', uid: 0, gid: 0}");
        let sparse = file("{path: /etc/motd, mode: '0644'}");
        assert!(observed.satisfies(&sparse));
        assert!(!sparse.satisfies(&observed));
    }

    #[test]
    fn satisfies_requires_equal_set_fields() {
        let observed = file("{path: /etc/motd, regular_file: hi, mode: '0600', uid: 0, gid: 0}");
        let desired = file("{path: /etc/motd, regular_file: hi, mode: '0644', uid: 0, gid: 0}");
        assert!(!observed.satisfies(&desired));
    }

    #[test]
    fn satisfies_never_crosses_identities() {
        let one = file("{path: /etc/one}");
        let other = file("{path: /etc/other}");
        assert!(!one.satisfies(&other));
    }

    #[test]
    fn satisfies_is_reflexive_on_more_constrained_states() {
        // A state with strictly more fields satisfies one with fewer
        let full = file("{path: /f, regular_file: x, mode: '0644', uid: 1, gid: 1}");
        let partial = file("{path: /f, regular_file: x}");
        assert!(full.satisfies(&partial));
        assert!(full.satisfies(&full));
    }

    #[test]
    fn absent_flag() {
        assert!(file("{path: /gone, absent: true}").absent());
        assert!(!file("{path: /here, regular_file: x}").absent());
    }

    #[test]
    fn canonical_yaml_is_stable() {
        // Input field order does not matter; canonical order does
        let one = file("{mode: '0644', path: /f, regular_file: x}");
        let two = file("{path: /f, regular_file: x, mode: '0644'}");
        assert_eq!(
            one.canonical_yaml().expect("yaml"),
            two.canonical_yaml().expect("yaml")
        );
    }
}
