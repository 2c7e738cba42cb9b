//! End-to-end runs against the local machine and a tempdir-backed store.

use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

use common::{
    async_trait::async_trait,
    eyre::Result,
    serde_yaml, tempfile, tokio,
};
use blueprint::Blueprint;
use context::Context;
use engine::AbortReason;
use host::{
    Child, Cmd, FileMetadata, FileReader, Group, Host, HostError, Local, RunOutput, User,
};
use resources::Resource;
use store::Store;

struct Fixture {
    _dir: tempfile::TempDir,
    ctx: Context,
    host: Local,
    store: Store,
    file_path: String,
    store_root: String,
}

fn fixture() -> Result<Fixture> {
    let dir = tempfile::tempdir()?;
    let file_path = dir.path().join("managed").to_string_lossy().into_owned();
    let store_root = dir.path().join("store").to_string_lossy().into_owned();
    Ok(Fixture {
        ctx: Context::new(Some(8)),
        host: Local::new(),
        store: Store::new(Arc::new(Local::new()), &store_root),
        file_path,
        store_root,
        _dir: dir,
    })
}

fn file_resource(yaml: &str) -> Resource {
    resources::decode("File", serde_yaml::from_str(yaml).expect("yaml")).expect("decode")
}

fn target_for(path: &str) -> Result<Blueprint> {
    Ok(Blueprint::compile(vec![file_resource(&format!(
        "{{path: {path}, regular_file: bar, mode: '0644'}}"
    ))])?)
}

#[tokio::test]
async fn first_apply_creates_and_records() -> Result<()> {
    let fx = fixture()?;
    let target = target_for(&fx.file_path)?;

    let plan = engine::apply(&fx.ctx, &fx.host, &fx.store, target.clone()).await?;
    assert_eq!(plan.change_count(), 1);

    // The file is there as declared
    let contents = tokio::fs::read_to_string(&fx.file_path).await?;
    assert_eq!(contents, "bar");
    let metadata = fx.host.lstat(&fx.ctx, &fx.file_path).await?.expect("file");
    assert_eq!(metadata.mode, 0o644);

    // The original records that the file did not exist before management
    let key = file_resource(&format!("{{path: {}, absent: true}}", fx.file_path)).key();
    let original = fx
        .store
        .load_original(&fx.ctx, &key)
        .await?
        .expect("original recorded");
    assert!(original.absent());

    // The last blueprint is the target
    let last = fx
        .store
        .load_last_blueprint(&fx.ctx)
        .await?
        .expect("last saved");
    assert_eq!(last.to_yaml()?, target.to_yaml()?);

    // The latch is gone
    assert!(!fx.store.has_target_blueprint(&fx.ctx).await?);

    Ok(())
}

#[tokio::test]
async fn reapplying_the_same_target_is_a_noop() -> Result<()> {
    let fx = fixture()?;

    engine::apply(&fx.ctx, &fx.host, &fx.store, target_for(&fx.file_path)?).await?;
    let last_path = format!("{}/v1/last.yaml", fx.store_root);
    let before = tokio::fs::read(&last_path).await?;

    let plan = engine::apply(&fx.ctx, &fx.host, &fx.store, target_for(&fx.file_path)?).await?;
    assert!(plan.noop());
    assert_eq!(plan.change_count(), 0);

    let after = tokio::fs::read(&last_path).await?;
    assert_eq!(before, after);

    Ok(())
}

#[tokio::test]
async fn dropping_a_resource_restores_its_original() -> Result<()> {
    let fx = fixture()?;

    engine::apply(&fx.ctx, &fx.host, &fx.store, target_for(&fx.file_path)?).await?;
    assert!(tokio::fs::try_exists(&fx.file_path).await?);

    let plan = engine::apply(&fx.ctx, &fx.host, &fx.store, Blueprint::empty()).await?;
    assert_eq!(plan.change_count(), 1);

    // The original was absent, so the file is deleted again
    assert!(!tokio::fs::try_exists(&fx.file_path).await?);

    // The original record is cleaned up and the last blueprint is empty
    let key = file_resource(&format!("{{path: {}, absent: true}}", fx.file_path)).key();
    assert!(!fx.store.has_original(&fx.ctx, &key).await?);
    let last = fx
        .store
        .load_last_blueprint(&fx.ctx)
        .await?
        .expect("last saved");
    assert!(last.is_empty());

    Ok(())
}

#[tokio::test]
async fn drift_aborts_with_a_diff_before_any_apply() -> Result<()> {
    let fx = fixture()?;

    engine::apply(&fx.ctx, &fx.host, &fx.store, target_for(&fx.file_path)?).await?;

    // Someone changes the mode behind our back
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(&fx.file_path, std::fs::Permissions::from_mode(0o600)).await?;

    let error = engine::apply(&fx.ctx, &fx.host, &fx.store, target_for(&fx.file_path)?)
        .await
        .expect_err("drift must abort");
    let reason = error
        .downcast_ref::<AbortReason>()
        .expect("an abort reason");
    let AbortReason::Drift { diff } = reason else {
        panic!("expected drift, got {reason}");
    };
    assert!(diff.contains("-mode: '0644'"), "diff was:\n{diff}");
    assert!(diff.contains("+mode: '0600'"), "diff was:\n{diff}");

    // Nothing was committed: the latch is not set and the file untouched
    assert!(!fx.store.has_target_blueprint(&fx.ctx).await?);
    let metadata = fx.host.lstat(&fx.ctx, &fx.file_path).await?.expect("file");
    assert_eq!(metadata.mode, 0o600);

    Ok(())
}

#[tokio::test]
async fn an_existing_latch_refuses_the_run() -> Result<()> {
    let fx = fixture()?;

    engine::apply(&fx.ctx, &fx.host, &fx.store, target_for(&fx.file_path)?).await?;

    // Simulate a crash between latch save and cleanup
    fx.store
        .save_target_blueprint(&fx.ctx, &target_for(&fx.file_path)?)
        .await?;

    let error = engine::apply(&fx.ctx, &fx.host, &fx.store, target_for(&fx.file_path)?)
        .await
        .expect_err("latch must refuse");
    assert!(matches!(
        error.downcast_ref::<AbortReason>(),
        Some(AbortReason::InterruptedPreviousApply)
    ));
    assert!(error.to_string().contains("previous apply was interrupted"));

    Ok(())
}

#[tokio::test]
async fn a_failing_action_stops_the_run_and_keeps_the_latch() -> Result<()> {
    let fx = fixture()?;

    let good = file_resource(&format!(
        "{{path: {}, regular_file: bar, mode: '0644'}}",
        fx.file_path
    ));
    let missing_parent = format!("{}.d/nested", fx.file_path);
    let bad = file_resource(&format!(
        "{{path: {missing_parent}, regular_file: bar, mode: '0644'}}"
    ));
    let target = Blueprint::compile(vec![good, bad])?;

    let error = engine::apply(&fx.ctx, &fx.host, &fx.store, target)
        .await
        .expect_err("the second action must fail");
    assert!(matches!(
        error.downcast_ref::<AbortReason>(),
        Some(AbortReason::ResourceApply { .. })
    ));

    // The first action did run; the latch is retained for the operator
    assert!(tokio::fs::try_exists(&fx.file_path).await?);
    assert!(fx.store.has_target_blueprint(&fx.ctx).await?);

    // The next run sees the partially applied state mismatch the last
    // blueprint and demands explicit resolution
    let error = engine::apply(&fx.ctx, &fx.host, &fx.store, target_for(&fx.file_path)?)
        .await
        .expect_err("must refuse after interruption");
    assert!(matches!(
        error.downcast_ref::<AbortReason>(),
        Some(AbortReason::Drift { .. })
    ));

    Ok(())
}

#[tokio::test]
async fn plan_preview_commits_nothing() -> Result<()> {
    let fx = fixture()?;

    let plan = engine::plan_preview(&fx.ctx, &fx.host, &fx.store, target_for(&fx.file_path)?)
        .await?;
    assert_eq!(plan.change_count(), 1);
    assert!(plan.to_string().contains("🔧 File:"));

    // No file was created and no store state was written
    assert!(!tokio::fs::try_exists(&fx.file_path).await?);
    assert!(!tokio::fs::try_exists(&fx.store_root).await?);

    Ok(())
}

#[tokio::test]
async fn store_lock_serializes_runs() -> Result<()> {
    let fx = fixture()?;

    fx.store.lock(&fx.ctx).await?;
    let error = engine::with_store_lock(&fx.ctx, &fx.store, || async { Ok(()) })
        .await
        .expect_err("held lock must fail fast");
    assert!(error.to_string().contains("locked"));
    fx.store.unlock(&fx.ctx).await?;

    engine::with_store_lock(&fx.ctx, &fx.store, || async { Ok(()) }).await?;

    Ok(())
}

/// Wraps the local host and tracks the peak number of in-flight operations
struct CountingHost {
    local: Local,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl CountingHost {
    fn new() -> Self {
        Self {
            local: Local::new(),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    async fn track<T>(&self, operation: impl std::future::Future<Output = T>) -> T {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        // Let concurrent operations overlap so the peak is observable
        tokio::time::sleep(std::time::Duration::from_millis(2)).await;
        let result = operation.await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }
}

impl std::fmt::Display for CountingHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "counting[localhost]")
    }
}

#[async_trait]
impl Host for CountingHost {
    fn type_name(&self) -> &'static str {
        "local"
    }

    async fn spawn(&self, ctx: &Context, cmd: &Cmd) -> Result<Child, HostError> {
        self.local.spawn(ctx, cmd).await
    }

    async fn run(&self, ctx: &Context, cmd: &Cmd) -> Result<RunOutput, HostError> {
        self.track(self.local.run(ctx, cmd)).await
    }

    async fn read_file(&self, ctx: &Context, path: &str) -> Result<FileReader, HostError> {
        self.track(self.local.read_file(ctx, path)).await
    }

    async fn write_file(
        &self,
        ctx: &Context,
        path: &str,
        contents: FileReader,
        mode: u32,
    ) -> Result<(), HostError> {
        self.track(self.local.write_file(ctx, path, contents, mode))
            .await
    }

    async fn lstat(&self, ctx: &Context, path: &str) -> Result<Option<FileMetadata>, HostError> {
        self.track(self.local.lstat(ctx, path)).await
    }

    async fn remove(&self, ctx: &Context, path: &str) -> Result<(), HostError> {
        self.track(self.local.remove(ctx, path)).await
    }

    async fn mkdir_all(&self, ctx: &Context, path: &str, mode: u32) -> Result<(), HostError> {
        self.track(self.local.mkdir_all(ctx, path, mode)).await
    }

    async fn lookup_user(&self, ctx: &Context, name: &str) -> Result<Option<User>, HostError> {
        self.track(self.local.lookup_user(ctx, name)).await
    }

    async fn lookup_group(&self, ctx: &Context, name: &str) -> Result<Option<Group>, HostError> {
        self.track(self.local.lookup_group(ctx, name)).await
    }

    async fn close(&self, ctx: &Context) -> Result<(), HostError> {
        self.local.close(ctx).await
    }
}

#[tokio::test]
async fn host_operations_stay_under_the_gate() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let max = 3;
    let ctx = Context::new(Some(max));
    let host = CountingHost::new();

    let resources = (0..20)
        .map(|index| {
            file_resource(&format!(
                "{{path: {}/file-{index}, regular_file: x}}",
                dir.path().display()
            ))
        })
        .collect::<Vec<_>>();
    let target = Blueprint::compile(resources)?;

    let observed = target.load(&ctx, &host).await?;
    assert_eq!(observed.len(), 20);
    assert!(
        host.peak() <= max,
        "peak {} exceeded the gate of {max}",
        host.peak()
    );

    Ok(())
}
