//! The per-type registry: type-name strings to provider vtables.
//!
//! Registration happens at first use; the registry is the single entry
//! point for decoding YAML state into [`Resource`]s, so nothing can
//! construct a resource of an unknown type or with an invalid state tree.

use std::sync::Arc;

use common::{
    async_trait::async_trait,
    eyre::{bail, Result},
    indexmap::IndexMap,
    once_cell::sync::Lazy,
    serde_yaml::Value,
};
use context::Context;
use host::Host;

use crate::{apt::AptPackagesProvider, file::FileProvider, Resource};

/// Operations a single-flavored resource type must provide
#[async_trait]
pub trait SingleProvider: Send + Sync {
    fn type_name(&self) -> &'static str;

    /// Validate a raw state tree and construct the canonical resource
    fn decode(&self, state: Value) -> Result<Resource>;

    /// Check internal consistency of the desired state
    fn validate(&self, resource: &Resource) -> Result<()>;

    /// Fill host-derived defaults into the state (e.g. user name to uid)
    /// without committing changes; idempotent
    async fn resolve(
        &self,
        ctx: &Context,
        host: &dyn Host,
        resource: &Resource,
    ) -> Result<Resource>;

    /// Observe the current state on the host; never mutates it
    async fn load(&self, ctx: &Context, host: &dyn Host, resource: &Resource) -> Result<Resource>;

    /// Make the host match the desired state; tolerates re-application
    async fn apply(&self, ctx: &Context, host: &dyn Host, resource: &Resource) -> Result<()>;
}

/// Operations a group-flavored resource type must provide
///
/// Member instances carry the member type name; the group type coordinates
/// loading and applying many at once, atomically where the underlying tool
/// allows.
#[async_trait]
pub trait GroupProvider: Send + Sync {
    /// The coordinator's name, e.g. `APTPackages`
    fn group_type_name(&self) -> &'static str;

    /// The member instances' type name, e.g. `APTPackage`
    fn member_type_name(&self) -> &'static str;

    fn decode(&self, state: Value) -> Result<Resource>;

    fn validate(&self, resource: &Resource) -> Result<()>;

    /// Resolve host-derived defaults for a batch; idempotent
    async fn resolve(
        &self,
        ctx: &Context,
        host: &dyn Host,
        resources: Vec<Resource>,
    ) -> Result<Vec<Resource>>;

    /// Observe the current state of every member, returned in input order
    async fn load(
        &self,
        ctx: &Context,
        host: &dyn Host,
        resources: &[Resource],
    ) -> Result<Vec<Resource>>;

    /// Apply the whole batch in one operation
    async fn apply(&self, ctx: &Context, host: &dyn Host, resources: &[Resource]) -> Result<()>;
}

/// A registered resource type: single or group flavored
#[derive(Clone)]
pub enum Provider {
    Single(Arc<dyn SingleProvider>),
    Group(Arc<dyn GroupProvider>),
}

impl Provider {
    /// The member-level type name instances of this type carry
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Single(single) => single.type_name(),
            Self::Group(group) => group.member_type_name(),
        }
    }
}

static REGISTRY: Lazy<IndexMap<&'static str, Provider>> = Lazy::new(|| {
    let mut registry = IndexMap::new();

    let file: Arc<dyn SingleProvider> = Arc::new(FileProvider);
    registry.insert(file.type_name(), Provider::Single(file));

    let apt: Arc<dyn GroupProvider> = Arc::new(AptPackagesProvider);
    registry.insert(apt.member_type_name(), Provider::Group(apt));

    registry
});

/// Look up a provider by member type name (e.g. `File`, `APTPackage`)
pub fn provider(type_name: &str) -> Result<&'static Provider> {
    match REGISTRY.get(type_name) {
        Some(provider) => Ok(provider),
        None => bail!("unknown resource type `{type_name}`"),
    }
}

/// Look up a group provider by its coordinator name (e.g. `APTPackages`)
pub fn group_provider(group_type_name: &str) -> Result<Arc<dyn GroupProvider>> {
    for provider in REGISTRY.values() {
        if let Provider::Group(group) = provider {
            if group.group_type_name() == group_type_name {
                return Ok(group.clone());
            }
        }
    }
    bail!("unknown group resource type `{group_type_name}`")
}

/// Decode a raw state tree into a validated, canonical [`Resource`]
pub fn decode(type_name: &str, state: Value) -> Result<Resource> {
    match provider(type_name)? {
        Provider::Single(single) => single.decode(state),
        Provider::Group(group) => group.decode(state),
    }
}

/// The registered member type names, in registration order
pub fn type_names() -> Vec<&'static str> {
    REGISTRY.keys().copied().collect()
}
