//! The apply sequencer: drives a host toward a target blueprint with
//! transactional semantics against the store.
//!
//! The sequence, in order: compile the target (validate + resolve), record
//! originals for newly managed resources, check the last applied blueprint
//! for drift (or create it on the first managed run), compile the plan,
//! write the target-blueprint latch, execute actions sequentially, then
//! clean up originals of dropped resources, commit the new last blueprint,
//! and delete the latch. A crash mid-apply leaves the latch set, and the
//! next run refuses to proceed without operator intervention.

use common::{
    async_trait::async_trait,
    eyre::{eyre, Context as _, Result},
    thiserror::{self, Error},
};
use blueprint::Blueprint;
use context::Context;
use host::Host;
use plan::{OriginalSource, Plan};
use resources::{group_provider, provider, Provider, Resource, ResourceKey};
use store::Store;

/// Why a run refused to proceed or stopped partway
#[derive(Debug, Error)]
pub enum AbortReason {
    #[error("host state has drifted from the last applied blueprint:\n{diff}")]
    Drift { diff: String },

    #[error(
        "a previous apply was interrupted: the target blueprint latch is set; \
         inspect the host and the store, then delete the target blueprint to proceed"
    )]
    InterruptedPreviousApply,

    #[error("applying {action} failed; the remaining actions were not executed")]
    ResourceApply { action: String },
}

/// Pre-managed states come from the store; for resources observed this run
/// but not yet recorded (plan preview before any apply), the freshly
/// observed state stands in
struct Originals<'a> {
    store: &'a Store,
    observed: &'a Blueprint,
}

#[async_trait]
impl OriginalSource for Originals<'_> {
    async fn load_original(
        &self,
        ctx: &Context,
        key: &ResourceKey,
    ) -> Result<Option<Resource>> {
        if let Some(original) = self.store.load_original(ctx, key).await? {
            return Ok(Some(original));
        }
        Ok(self.observed.lookup(key).cloned())
    }
}

/// Validate declared resources and resolve host-derived defaults
async fn compile_target(
    ctx: &Context,
    host: &dyn Host,
    declared: Blueprint,
) -> Result<Blueprint> {
    declared.validate()?;
    let resolved = declared.resolve(ctx, host).await?;
    // Resolution can surface new inconsistencies (e.g. a mode filled from
    // defaults), so validate the resolved form too
    resolved.validate()?;
    Ok(resolved)
}

/// Everything shared by `plan` and `apply` up to the plan itself
async fn prepare(
    ctx: &Context,
    host: &dyn Host,
    store: &Store,
    declared: Blueprint,
    persist: bool,
) -> Result<(Blueprint, Blueprint, Plan)> {
    let ctx = ctx.with_group("engine");

    ctx.logger().info("compiling target blueprint");
    let target = compile_target(&ctx, host, declared).await?;

    ctx.logger().info("observing current host state");
    let observed = target.load(&ctx, host).await?;

    if persist {
        // The only write to originals outside post-apply cleanup: record
        // the pre-managed state of every resource now entering management
        for resource in observed.resources() {
            if !store.has_original(&ctx, &resource.key()).await? {
                store
                    .save_original(&ctx, resource)
                    .await
                    .wrap_err_with(|| format!("saving the original of {}", resource.key()))?;
            }
        }
    }

    let last = match store.load_last_blueprint(&ctx).await? {
        Some(last) => {
            ctx.logger().info("validating the last applied blueprint");
            let current = last.load(&ctx, host).await?;
            let diff = current.satisfies(&last)?;
            if !diff.is_empty() {
                return Err(eyre!(AbortReason::Drift { diff }));
            }
            last
        }
        None => {
            // First managed run: the observed state is both the baseline
            // and, when applying, the saved last blueprint
            if persist {
                store.save_last_blueprint(&ctx, &observed).await?;
            }
            observed.clone()
        }
    };

    ctx.logger().info("compiling the plan");
    let originals = Originals {
        store,
        observed: &observed,
    };
    let plan = plan::compile(&ctx, &target, &last, &originals).await?;

    Ok((target, last, plan))
}

/// Compile and return the plan without committing anything
pub async fn plan_preview(
    ctx: &Context,
    host: &dyn Host,
    store: &Store,
    declared: Blueprint,
) -> Result<Plan> {
    let (_, _, plan) = prepare(ctx, host, store, declared, false).await?;
    Ok(plan)
}

/// Execute one action through its provider
async fn execute_action(ctx: &Context, host: &dyn Host, action: &plan::Action) -> Result<()> {
    let _permit = ctx.acquire().await?;
    if let Ok(group) = group_provider(action.type_name) {
        return group.apply(ctx, host, &action.apply_resources).await;
    }
    let Provider::Single(single) = provider(action.type_name)? else {
        return Err(eyre!("provider flavor mismatch for {}", action.type_name));
    };
    for resource in &action.apply_resources {
        single.apply(ctx, host, resource).await?;
    }
    Ok(())
}

/// Compile the plan and commit it
///
/// Returns the executed plan. On an action failure the target-blueprint
/// latch is retained, making rollback explicit on the next invocation.
pub async fn apply(
    ctx: &Context,
    host: &dyn Host,
    store: &Store,
    declared: Blueprint,
) -> Result<Plan> {
    let ctx = ctx.with_group("apply");

    let (target, last, plan) = prepare(&ctx, host, store, declared, true).await?;

    let mut log = store.open_log(&ctx, "apply").await?;
    log.append(&format!("plan:\n{plan}"));

    // The latch: its presence at run start means an earlier apply never
    // finished
    if store.has_target_blueprint(&ctx).await? {
        return Err(eyre!(AbortReason::InterruptedPreviousApply));
    }
    store.save_target_blueprint(&ctx, &target).await?;

    for (index, action) in plan.actions.iter().enumerate() {
        if action.noop() {
            continue;
        }
        let label = format!(
            "{}:{}",
            action.type_name,
            action
                .apply_resources
                .iter()
                .map(Resource::id)
                .collect::<Vec<_>>()
                .join(",")
        );
        let action_ctx = ctx.with_attr("action", label.clone());
        action_ctx
            .logger()
            .info(&format!("applying action {} of {}", index + 1, plan.actions.len()));

        if let Err(error) = execute_action(&action_ctx, host, action).await {
            log.append(&format!("action {label} failed: {error:#}"));
            let _ = store.flush_log(&ctx, &log).await;
            return Err(error.wrap_err(AbortReason::ResourceApply { action: label }));
        }
        log.append(&format!("action {label} applied"));
    }

    // Cleanup: forget originals of resources that left management, commit
    // the new last blueprint, release the latch
    for resource in last.resources() {
        if !target.contains(&resource.key()) {
            store.delete_original(&ctx, &resource.key()).await?;
        }
    }
    store.save_last_blueprint(&ctx, &target).await?;
    store.delete_target_blueprint(&ctx).await?;

    log.append("apply committed");
    store.flush_log(&ctx, &log).await?;

    Ok(plan)
}

/// Run `operation` with the store's single-writer lock held
///
/// The lock is released on success and on failure; only losing the host
/// mid-run can leave it behind, and `Store::lock` names the stale file.
pub async fn with_store_lock<T, F, Fut>(ctx: &Context, store: &Store, operation: F) -> Result<T>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
{
    store.lock(ctx).await?;
    let result = operation().await;
    let unlocked = store.unlock(ctx).await;
    match (result, unlocked) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(error)) => Err(error),
        (Err(error), _) => Err(error),
    }
}
