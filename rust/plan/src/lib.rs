//! The plan compiler and differ: given a target blueprint and the last
//! applied one, produce the ordered minimal set of per-resource changes,
//! each tagged with a semantic diff.

use std::collections::HashMap;

use common::{
    async_trait::async_trait,
    eyre::{bail, Result},
};
use blueprint::Blueprint;
use context::Context;
use resources::{diff, Resource, ResourceKey};

/// Where pre-managed resource states come from during plan compilation
///
/// Implemented over the store; tests substitute an in-memory map.
#[async_trait]
pub trait OriginalSource: Send + Sync {
    async fn load_original(
        &self,
        ctx: &Context,
        key: &ResourceKey,
    ) -> Result<Option<Resource>>;
}

/// The change a plan makes to one resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Emoji {
    /// Already satisfied, nothing to do
    NoChange,
    /// The resource does not exist yet
    Create,
    /// The resource is to be removed
    Delete,
    /// The resource exists with a different state
    Update,
}

impl std::fmt::Display for Emoji {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let emoji = match self {
            Self::NoChange => "✅",
            Self::Create => "🔧",
            Self::Delete => "🗑",
            Self::Update => "🔄",
        };
        write!(f, "{emoji}")
    }
}

/// The semantic diff for one member of an action
#[derive(Debug, Clone)]
pub struct ResourceDiff {
    pub emoji: Emoji,
    pub id: String,
    /// Unified diff lines from the before view to the planned state; empty
    /// when nothing changes
    pub chunks: Vec<String>,
}

/// The plan-level change for one step
#[derive(Debug, Clone)]
pub struct Action {
    /// The step's presentation type: the resource type for singles, the
    /// group coordinator for groups
    pub type_name: &'static str,
    /// One diff per member, in canonical step order, sorted for display by
    /// id within the step
    pub diffs: Vec<ResourceDiff>,
    /// The members that actually require change, in canonical step order
    pub apply_resources: Vec<Resource>,
}

impl Action {
    pub fn noop(&self) -> bool {
        self.apply_resources.is_empty()
    }
}

/// An ordered list of actions
#[derive(Debug, Clone, Default)]
pub struct Plan {
    pub actions: Vec<Action>,
}

impl Plan {
    /// Whether applying this plan would change nothing
    pub fn noop(&self) -> bool {
        self.actions.iter().all(Action::noop)
    }

    /// The number of members that require change
    pub fn change_count(&self) -> usize {
        self.actions
            .iter()
            .map(|action| action.apply_resources.len())
            .sum()
    }
}

impl std::fmt::Display for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for action in &self.actions {
            let mut diffs: Vec<&ResourceDiff> = action.diffs.iter().collect();
            diffs.sort_by(|a, b| a.id.cmp(&b.id));
            for diff in diffs {
                writeln!(f, "{} {}:{}", diff.emoji, action.type_name, diff.id)?;
                for chunk in &diff.chunks {
                    writeln!(f, "  {chunk}")?;
                }
            }
        }
        Ok(())
    }
}

/// Compile the plan from `target` and `last`
///
/// Builds the plan resource list: every target resource (before view: its
/// entry in `last`, else its recorded original), plus one restore-to-original
/// entry for every resource in `last` that left the target, spliced in at
/// the position that reestablishes `last`'s ordering. The list is then step
/// compiled, and each member compared to its before view.
pub async fn compile(
    ctx: &Context,
    target: &Blueprint,
    last: &Blueprint,
    originals: &dyn OriginalSource,
) -> Result<Plan> {
    // Plan resources in order, with each one's before view
    let mut plan_resources: Vec<Resource> = Vec::new();
    let mut before_views: HashMap<ResourceKey, Option<Resource>> = HashMap::new();

    for resource in target.resources() {
        let key = resource.key();
        let before = match last.lookup(&key) {
            Some(previous) => Some(previous.clone()),
            None => originals.load_original(ctx, &key).await?,
        };
        before_views.insert(key, before);
        plan_resources.push(resource.clone());
    }

    // Restore entries for resources leaving management, keeping last's
    // relative order
    let last_order: Vec<&Resource> = last.resources().collect();
    for (position, resource) in last_order.iter().enumerate() {
        let key = resource.key();
        if target.contains(&key) {
            continue;
        }
        let Some(original) = originals.load_original(ctx, &key).await? else {
            bail!("no recorded original for {key}, cannot restore it");
        };

        // The earliest resource after this one in last that is also planned
        let insert_at = last_order[position + 1..]
            .iter()
            .find_map(|later| {
                plan_resources
                    .iter()
                    .position(|planned| planned.key() == later.key())
            })
            .unwrap_or(plan_resources.len());

        plan_resources.insert(insert_at, original);
        before_views.insert(key, Some((*resource).clone()));
    }

    // Canonical ordering and grouping come from the step compiler
    let plan_blueprint = Blueprint::compile(plan_resources)?;

    let mut actions = Vec::new();
    for step in plan_blueprint.steps() {
        let mut diffs = Vec::new();
        let mut apply_resources = Vec::new();
        for member in step.resources() {
            let before = before_views
                .get(&member.key())
                .cloned()
                .unwrap_or_default();

            let satisfied = before
                .as_ref()
                .is_some_and(|before| before.satisfies(member));
            if satisfied {
                diffs.push(ResourceDiff {
                    emoji: Emoji::NoChange,
                    id: member.id().to_string(),
                    chunks: Vec::new(),
                });
                continue;
            }

            let emoji = if before.as_ref().is_none_or(Resource::absent) {
                Emoji::Create
            } else if member.absent() {
                Emoji::Delete
            } else {
                Emoji::Update
            };
            diffs.push(ResourceDiff {
                emoji,
                id: member.id().to_string(),
                chunks: diff::resources(before.as_ref(), Some(member))?,
            });
            apply_resources.push(member.clone());
        }

        actions.push(Action {
            type_name: step.type_label(),
            diffs,
            apply_resources,
        });
    }

    Ok(Plan { actions })
}

#[cfg(test)]
mod tests {
    use common::{serde_yaml, tokio};
    use pretty_assertions::assert_eq;

    use super::*;

    /// An in-memory original source
    #[derive(Default)]
    struct Originals(HashMap<ResourceKey, Resource>);

    impl Originals {
        fn with(mut self, resource: Resource) -> Self {
            self.0.insert(resource.key(), resource);
            self
        }
    }

    #[async_trait]
    impl OriginalSource for Originals {
        async fn load_original(
            &self,
            _ctx: &Context,
            key: &ResourceKey,
        ) -> Result<Option<Resource>> {
            Ok(self.0.get(key).cloned())
        }
    }

    fn file(yaml: &str) -> Resource {
        resources::decode("File", serde_yaml::from_str(yaml).expect("yaml")).expect("decode")
    }

    fn absent_file(path: &str) -> Resource {
        file(&format!("{{path: {path}, absent: true}}"))
    }

    fn package(name: &str) -> Resource {
        resources::decode(
            "APTPackage",
            serde_yaml::from_str(&format!("{{package: {name}}}")).expect("yaml"),
        )
        .expect("decode")
    }

    #[tokio::test]
    async fn first_apply_creates() -> Result<()> {
        let ctx = Context::default();
        let desired = file("{path: /tmp/x, regular_file: bar, mode: '0644'}");
        let target = Blueprint::compile(vec![desired.clone()])?;
        let last = Blueprint::compile(vec![absent_file("/tmp/x")])?;
        let originals = Originals::default().with(absent_file("/tmp/x"));

        let plan = compile(&ctx, &target, &last, &originals).await?;
        assert_eq!(plan.actions.len(), 1);
        let action = &plan.actions[0];
        assert_eq!(action.type_name, "File");
        assert_eq!(action.diffs.len(), 1);
        assert_eq!(action.diffs[0].emoji, Emoji::Create);
        assert_eq!(action.apply_resources, vec![desired]);
        assert!(!plan.noop());

        Ok(())
    }

    #[tokio::test]
    async fn satisfied_target_is_a_noop() -> Result<()> {
        let ctx = Context::default();
        let desired = file("{path: /tmp/x, regular_file: bar, mode: '0644'}");
        let target = Blueprint::compile(vec![desired.clone()])?;
        let last = Blueprint::compile(vec![desired])?;
        let originals = Originals::default();

        let plan = compile(&ctx, &target, &last, &originals).await?;
        assert_eq!(plan.actions.len(), 1);
        assert_eq!(plan.actions[0].diffs[0].emoji, Emoji::NoChange);
        assert!(plan.actions[0].diffs[0].chunks.is_empty());
        assert!(plan.actions[0].apply_resources.is_empty());
        assert!(plan.noop());
        assert_eq!(plan.change_count(), 0);

        Ok(())
    }

    #[tokio::test]
    async fn dropped_resources_restore_their_original() -> Result<()> {
        let ctx = Context::default();
        let managed = file("{path: /tmp/x, regular_file: bar}");
        let target = Blueprint::empty();
        let last = Blueprint::compile(vec![managed])?;
        let originals = Originals::default().with(absent_file("/tmp/x"));

        let plan = compile(&ctx, &target, &last, &originals).await?;
        assert_eq!(plan.actions.len(), 1);
        let action = &plan.actions[0];
        assert_eq!(action.diffs[0].emoji, Emoji::Delete);
        assert_eq!(action.apply_resources, vec![absent_file("/tmp/x")]);

        Ok(())
    }

    #[tokio::test]
    async fn restores_without_an_original_fail() -> Result<()> {
        let ctx = Context::default();
        let target = Blueprint::empty();
        let last = Blueprint::compile(vec![file("{path: /tmp/x, regular_file: bar}")])?;

        let result = compile(&ctx, &target, &last, &Originals::default()).await;
        assert!(result.is_err());

        Ok(())
    }

    #[tokio::test]
    async fn restore_entries_reestablish_last_ordering() -> Result<()> {
        let ctx = Context::default();
        let a = file("{path: /a, regular_file: x}");
        let b = file("{path: /b, regular_file: x}");
        let c = file("{path: /c, regular_file: x}");

        let target = Blueprint::compile(vec![a.clone(), c.clone()])?;
        let last = Blueprint::compile(vec![a.clone(), b.clone(), c.clone()])?;
        let originals = Originals::default().with(absent_file("/b"));

        let plan = compile(&ctx, &target, &last, &originals).await?;
        let ids: Vec<&str> = plan
            .actions
            .iter()
            .flat_map(|action| action.diffs.iter().map(|diff| diff.id.as_str()))
            .collect();
        assert_eq!(ids, vec!["/a", "/b", "/c"]);

        Ok(())
    }

    #[tokio::test]
    async fn updates_show_field_level_diffs() -> Result<()> {
        let ctx = Context::default();
        let desired = file("{path: /tmp/x, regular_file: bar, mode: '0644'}");
        let previous = file("{path: /tmp/x, regular_file: bar, mode: '0600'}");
        let target = Blueprint::compile(vec![desired])?;
        let last = Blueprint::compile(vec![previous])?;

        let plan = compile(&ctx, &target, &last, &Originals::default()).await?;
        let diff = &plan.actions[0].diffs[0];
        assert_eq!(diff.emoji, Emoji::Update);
        assert!(diff.chunks.iter().any(|line| line.contains("-mode:")));
        assert!(diff.chunks.iter().any(|line| line.contains("+mode:")));

        let rendered = plan.to_string();
        assert!(rendered.contains("🔄 File:/tmp/x"));

        Ok(())
    }

    #[tokio::test]
    async fn every_target_and_dropped_resource_appears_exactly_once() -> Result<()> {
        let ctx = Context::default();
        let keep = package("keep");
        let add = package("add");
        let drop = package("drop");

        let target = Blueprint::compile(vec![keep.clone(), add.clone()])?;
        let last = Blueprint::compile(vec![keep.clone(), drop.clone()])?;
        let originals = Originals::default()
            .with(resources::decode(
                "APTPackage",
                serde_yaml::from_str("{package: add, absent: true}").expect("yaml"),
            )?)
            .with(resources::decode(
                "APTPackage",
                serde_yaml::from_str("{package: drop, absent: true}").expect("yaml"),
            )?);

        let plan = compile(&ctx, &target, &last, &originals).await?;
        let mut ids: Vec<String> = plan
            .actions
            .iter()
            .flat_map(|action| action.diffs.iter().map(|diff| diff.id.clone()))
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["add", "drop", "keep"]);

        Ok(())
    }
}
