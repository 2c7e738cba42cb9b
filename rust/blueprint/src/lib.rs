//! The step compiler and [`Blueprint`]: an ordered list of steps compiled
//! from declared resources, where adjacent resources of the same group
//! type fold into one step and declared cross-type order is preserved.

use std::collections::HashSet;

use common::{
    eyre::{bail, eyre, Context as _, Result},
    futures::future::try_join_all,
    indexmap::IndexMap,
    serde::{Deserialize, Serialize},
    serde_yaml::{self, Value},
};
use context::Context;
use host::Host;
use resources::{diff, group_provider, provider, Provider, Resource, ResourceKey};

/// One step: a single resource, or one group type with its member batch
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Single(Resource),
    Group {
        group_type_name: &'static str,
        resources: Vec<Resource>,
    },
}

impl Step {
    /// The step's members, in canonical order
    pub fn resources(&self) -> &[Resource] {
        match self {
            Self::Single(resource) => std::slice::from_ref(resource),
            Self::Group { resources, .. } => resources,
        }
    }

    /// The name the step is presented under: the resource type for singles,
    /// the coordinator type for groups
    pub fn type_label(&self) -> &'static str {
        match self {
            Self::Single(resource) => resource.type_name(),
            Self::Group {
                group_type_name, ..
            } => *group_type_name,
        }
    }
}

impl std::fmt::Display for Step {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let ids = self
            .resources()
            .iter()
            .map(Resource::id)
            .collect::<Vec<_>>()
            .join(",");
        write!(f, "{}:{}", self.type_label(), ids)
    }
}

/// An ordered list of steps plus a lookup map by (type, id)
///
/// Invariant: flattening the steps' members in step order yields the
/// canonical resource ordering, with no duplicate (type, id).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Blueprint {
    steps: Vec<Step>,
    index: IndexMap<ResourceKey, (usize, usize)>,
}

impl Blueprint {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Compile declared resources into steps
    ///
    /// Scanning left to right: a group-type resource joins the immediately
    /// preceding step when that step is the same group type, so same-type
    /// batches fold while any intervening step of another type starts a new
    /// batch. Members of a group step are sorted by id; single steps keep
    /// declared order.
    pub fn compile(resources: Vec<Resource>) -> Result<Self> {
        let mut steps: Vec<Step> = Vec::new();
        for resource in resources {
            match provider(resource.type_name())? {
                Provider::Single(_) => steps.push(Step::Single(resource)),
                Provider::Group(group) => {
                    let group_type_name = group.group_type_name();
                    match steps.last_mut() {
                        Some(Step::Group {
                            group_type_name: last,
                            resources,
                        }) if *last == group_type_name => resources.push(resource),
                        _ => steps.push(Step::Group {
                            group_type_name,
                            resources: vec![resource],
                        }),
                    }
                }
            }
        }

        for step in &mut steps {
            if let Step::Group { resources, .. } = step {
                resources.sort_by(|a, b| a.id().cmp(b.id()));
            }
        }

        Self::from_steps(steps)
    }

    fn from_steps(steps: Vec<Step>) -> Result<Self> {
        let mut index = IndexMap::new();
        let mut seen = HashSet::new();
        for (step_index, step) in steps.iter().enumerate() {
            for (member_index, resource) in step.resources().iter().enumerate() {
                let key = resource.key();
                if !seen.insert(key.clone()) {
                    bail!("duplicate resource {key}");
                }
                index.insert(key, (step_index, member_index));
            }
        }
        Ok(Self { steps, index })
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// The canonical ordering: each step's members, in step order
    pub fn resources(&self) -> impl Iterator<Item = &Resource> {
        self.steps.iter().flat_map(|step| step.resources().iter())
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn lookup(&self, key: &ResourceKey) -> Option<&Resource> {
        let (step_index, member_index) = *self.index.get(key)?;
        self.steps[step_index].resources().get(member_index)
    }

    pub fn contains(&self, key: &ResourceKey) -> bool {
        self.index.contains_key(key)
    }

    /// Validate every resource's declared state
    pub fn validate(&self) -> Result<()> {
        for resource in self.resources() {
            resource
                .validate()
                .wrap_err_with(|| format!("validating {}", resource.key()))?;
        }
        Ok(())
    }

    /// Resolve host-derived defaults in every step, steps concurrently
    /// under the gate
    pub async fn resolve(&self, ctx: &Context, host: &dyn Host) -> Result<Self> {
        let steps = try_join_all(
            self.steps
                .iter()
                .map(|step| resolve_step(ctx, host, step)),
        )
        .await?;
        Self::from_steps(steps)
    }

    /// Observe the current host state of every step, steps concurrently
    /// under the gate
    ///
    /// The result has the same shape and identities, with observed states.
    pub async fn load(&self, ctx: &Context, host: &dyn Host) -> Result<Self> {
        let steps =
            try_join_all(self.steps.iter().map(|step| load_step(ctx, host, step))).await?;
        Self::from_steps(steps)
    }

    /// Accumulated textual diff of every member of the union of resources
    /// (by key) whose state here does not satisfy `other`'s
    ///
    /// An empty string is exactly "no drift".
    pub fn satisfies(&self, other: &Self) -> Result<String> {
        let mut keys: Vec<ResourceKey> = self.resources().map(Resource::key).collect();
        for resource in other.resources() {
            if !self.contains(&resource.key()) {
                keys.push(resource.key());
            }
        }

        let mut report = String::new();
        for key in keys {
            let ours = self.lookup(&key);
            let theirs = other.lookup(&key);
            let satisfied = match (ours, theirs) {
                (Some(ours), Some(theirs)) => ours.satisfies(theirs),
                _ => false,
            };
            if !satisfied {
                report.push_str(&format!("{key}:\n"));
                // Expected (other) to actual (ours), so drift reads as
                // "-what was applied / +what is there now"
                for line in diff::resources(theirs, ours)? {
                    report.push_str("  ");
                    report.push_str(&line);
                    report.push('\n');
                }
            }
        }
        Ok(report)
    }

    /// Serialize to the on-disk step sequence
    pub fn to_yaml(&self) -> Result<String> {
        let reprs = self
            .steps
            .iter()
            .map(|step| match step {
                Step::Single(resource) => StepRepr {
                    single_resource_type: Some(resource.type_name().to_string()),
                    single_resource: Some(resource.state().clone()),
                    ..Default::default()
                },
                Step::Group {
                    group_type_name,
                    resources,
                } => StepRepr {
                    group_resource_type: Some((*group_type_name).to_string()),
                    group_resources_type: resources
                        .first()
                        .map(|resource| resource.type_name().to_string()),
                    group_resources: Some(
                        resources
                            .iter()
                            .map(|resource| resource.state().clone())
                            .collect(),
                    ),
                    ..Default::default()
                },
            })
            .collect::<Vec<_>>();
        Ok(serde_yaml::to_string(&reprs)?)
    }

    /// Deserialize from the on-disk step sequence, re-validating every
    /// state through the registry
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let reprs: Vec<StepRepr> = serde_yaml::from_str(yaml)?;
        let mut resources = Vec::new();
        for repr in reprs {
            match repr {
                StepRepr {
                    single_resource_type: Some(type_name),
                    single_resource: Some(state),
                    group_resource_type: None,
                    group_resources_type: None,
                    group_resources: None,
                } => resources.push(resources::decode(&type_name, state)?),
                StepRepr {
                    single_resource_type: None,
                    single_resource: None,
                    group_resource_type: Some(group_type_name),
                    group_resources_type: Some(member_type_name),
                    group_resources: Some(states),
                } => {
                    let group = group_provider(&group_type_name)?;
                    if group.member_type_name() != member_type_name {
                        bail!(
                            "group {group_type_name} does not coordinate {member_type_name}"
                        );
                    }
                    for state in states {
                        resources.push(resources::decode(&member_type_name, state)?);
                    }
                }
                _ => bail!("malformed blueprint step"),
            }
        }
        Self::compile(resources)
    }
}

async fn resolve_step(ctx: &Context, host: &dyn Host, step: &Step) -> Result<Step> {
    let _permit = ctx.acquire().await?;
    match step {
        Step::Single(resource) => {
            let Provider::Single(single) = provider(resource.type_name())? else {
                bail!("step/provider flavor mismatch for {}", resource.key());
            };
            Ok(Step::Single(
                single
                    .resolve(ctx, host, resource)
                    .await
                    .wrap_err_with(|| format!("resolving {}", resource.key()))?,
            ))
        }
        Step::Group {
            group_type_name,
            resources,
        } => {
            let group = group_provider(group_type_name)?;
            let resolved = group
                .resolve(ctx, host, resources.clone())
                .await
                .wrap_err_with(|| format!("resolving {group_type_name}"))?;
            if resolved.len() != resources.len() {
                bail!("{group_type_name} resolve changed the member count");
            }
            Ok(Step::Group {
                group_type_name: *group_type_name,
                resources: resolved,
            })
        }
    }
}

async fn load_step(ctx: &Context, host: &dyn Host, step: &Step) -> Result<Step> {
    let _permit = ctx.acquire().await?;
    match step {
        Step::Single(resource) => {
            let Provider::Single(single) = provider(resource.type_name())? else {
                bail!("step/provider flavor mismatch for {}", resource.key());
            };
            let observed = single
                .load(ctx, host, resource)
                .await
                .wrap_err_with(|| format!("loading {}", resource.key()))?;
            if observed.key() != resource.key() {
                bail!("loading {} returned {}", resource.key(), observed.key());
            }
            Ok(Step::Single(observed))
        }
        Step::Group {
            group_type_name,
            resources,
        } => {
            let group = group_provider(group_type_name)?;
            let observed = group
                .load(ctx, host, resources)
                .await
                .wrap_err_with(|| format!("loading {group_type_name}"))?;
            if observed.len() != resources.len() {
                bail!("{group_type_name} load changed the member count");
            }
            for (observed, desired) in observed.iter().zip(resources.iter()) {
                if observed.key() != desired.key() {
                    bail!("loading {} returned {}", desired.key(), observed.key());
                }
            }
            Ok(Step::Group {
                group_type_name: *group_type_name,
                resources: observed,
            })
        }
    }
}

/// The on-disk form of one step
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, crate = "common::serde")]
struct StepRepr {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    single_resource_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    single_resource: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    group_resource_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    group_resources_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    group_resources: Option<Vec<Value>>,
}

/// Decode a declared resource list into a compiled blueprint
///
/// `documents` is a sequence of `{TypeName: state}` entries, the form the
/// declaration files use.
pub fn compile_declarations(documents: &[Value]) -> Result<Blueprint> {
    let mut declared = Vec::new();
    for document in documents {
        let Value::Mapping(mapping) = document else {
            bail!("declaration entries must be `TypeName: state` mappings");
        };
        for (type_name, state) in mapping {
            let Value::String(type_name) = type_name else {
                bail!("resource type names must be strings");
            };
            declared.push(
                resources::decode(type_name, state.clone())
                    .wrap_err_with(|| format!("decoding a {type_name} declaration"))?,
            );
        }
    }
    Blueprint::compile(declared)
}

/// Parse one YAML declarations document into a compiled blueprint
pub fn compile_declarations_yaml(yaml: &str) -> Result<Blueprint> {
    let documents: Vec<Value> =
        serde_yaml::from_str(yaml).map_err(|error| eyre!("parsing declarations: {error}"))?;
    compile_declarations(&documents)
}
