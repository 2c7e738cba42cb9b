//! Durable per-host persistence, written through the host abstraction so
//! the state can live on the managed target itself or on the machine
//! driving it.
//!
//! Layout, versioned so the format can evolve:
//!
//! ```text
//! <root>/v1/
//!   original/<hex64>.yaml         # content-addressed original-resource buckets
//!   last.yaml                     # last successfully applied blueprint
//!   target.yaml                   # transient target blueprint (latch)
//!   logs/<session>-<timestamp>.log
//!   lock
//! ```
//!
//! Buckets are addressed by a hash of (type, id) only; since hashes may
//! collide, each bucket holds a two-level `{type_name: {id: state}}` map
//! and operations are read-modify-write on the whole file. Directories are
//! created lazily with mode 0700; files are written with mode 0600.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use common::{
    eyre::{bail, Context as _, Result},
    indexmap::IndexMap,
    serde_yaml::{self, Value},
    sha2::{Digest, Sha256},
};
use blueprint::Blueprint;
use context::Context;
use host::{bytes_reader, read_all, Host, HostError};
use resources::{Resource, ResourceKey};

const DIR_MODE: u32 = 0o700;
const FILE_MODE: u32 = 0o600;

/// A two-level original-resource bucket: `{type_name: {id: state}}`
type Bucket = IndexMap<String, IndexMap<String, Value>>;

/// The filesystem-backed store for one host's persistent state
pub struct Store {
    host: Arc<dyn Host>,
    root: String,
    bucket_width: usize,
}

impl Store {
    pub fn new(host: Arc<dyn Host>, root: impl Into<String>) -> Self {
        Self {
            host,
            root: root.into(),
            bucket_width: 64,
        }
    }

    /// Shrink the bucket address width to force hash collisions; only
    /// useful to exercise the collision handling
    pub fn with_bucket_width(mut self, width: usize) -> Self {
        self.bucket_width = width.clamp(1, 64);
        self
    }

    fn version_dir(&self) -> String {
        format!("{}/v1", self.root)
    }

    fn original_dir(&self) -> String {
        format!("{}/original", self.version_dir())
    }

    fn logs_dir(&self) -> String {
        format!("{}/logs", self.version_dir())
    }

    fn last_path(&self) -> String {
        format!("{}/last.yaml", self.version_dir())
    }

    fn target_path(&self) -> String {
        format!("{}/target.yaml", self.version_dir())
    }

    fn lock_path(&self) -> String {
        format!("{}/lock", self.version_dir())
    }

    fn bucket_path(&self, key: &ResourceKey) -> String {
        let mut hasher = Sha256::new();
        hasher.update(key.type_name.as_bytes());
        hasher.update(b"\n");
        hasher.update(key.id.as_bytes());
        hasher.update(b"\n");
        let digest = hasher.finalize();
        let hex: String = digest.iter().map(|byte| format!("{byte:02x}")).collect();
        format!(
            "{}/{}.yaml",
            self.original_dir(),
            &hex[..self.bucket_width]
        )
    }

    async fn read_optional(&self, ctx: &Context, path: &str) -> Result<Option<Vec<u8>>> {
        let _permit = ctx.acquire().await?;
        match self.host.read_file(ctx, path).await {
            Ok(reader) => Ok(Some(read_all(reader).await?)),
            Err(HostError::NotFound) => Ok(None),
            Err(error) => Err(error).wrap_err_with(|| format!("reading {path}")),
        }
    }

    async fn write(&self, ctx: &Context, dir: &str, path: &str, bytes: Vec<u8>) -> Result<()> {
        let _permit = ctx.acquire().await?;
        self.host.mkdir_all(ctx, dir, DIR_MODE).await?;
        self.host
            .write_file(ctx, path, bytes_reader(bytes), FILE_MODE)
            .await
            .wrap_err_with(|| format!("writing {path}"))?;
        Ok(())
    }

    async fn remove_if_present(&self, ctx: &Context, path: &str) -> Result<()> {
        let _permit = ctx.acquire().await?;
        match self.host.remove(ctx, path).await {
            Ok(()) | Err(HostError::NotFound) => Ok(()),
            Err(error) => Err(error).wrap_err_with(|| format!("removing {path}")),
        }
    }

    async fn load_bucket(&self, ctx: &Context, path: &str) -> Result<Bucket> {
        match self.read_optional(ctx, path).await? {
            Some(bytes) => Ok(serde_yaml::from_slice(&bytes)
                .wrap_err_with(|| format!("parsing original bucket {path}"))?),
            None => Ok(Bucket::new()),
        }
    }

    /// Record the pre-managed state of a resource
    pub async fn save_original(&self, ctx: &Context, resource: &Resource) -> Result<()> {
        let key = resource.key();
        let path = self.bucket_path(&key);
        let mut bucket = self.load_bucket(ctx, &path).await?;
        bucket
            .entry(key.type_name.clone())
            .or_default()
            .insert(key.id.clone(), resource.state().clone());
        let bytes = serde_yaml::to_string(&bucket)?.into_bytes();
        self.write(ctx, &self.original_dir(), &path, bytes).await
    }

    pub async fn has_original(&self, ctx: &Context, key: &ResourceKey) -> Result<bool> {
        Ok(self.load_original(ctx, key).await?.is_some())
    }

    /// The pre-managed state of a resource, if one was recorded
    pub async fn load_original(
        &self,
        ctx: &Context,
        key: &ResourceKey,
    ) -> Result<Option<Resource>> {
        let path = self.bucket_path(key);
        let bucket = self.load_bucket(ctx, &path).await?;
        let Some(state) = bucket
            .get(&key.type_name)
            .and_then(|entries| entries.get(&key.id))
        else {
            return Ok(None);
        };
        Ok(Some(resources::decode(&key.type_name, state.clone())?))
    }

    /// Forget the pre-managed state of a resource; deleting one that was
    /// never present is not an error
    pub async fn delete_original(&self, ctx: &Context, key: &ResourceKey) -> Result<()> {
        let path = self.bucket_path(key);
        let mut bucket = self.load_bucket(ctx, &path).await?;
        let Some(entries) = bucket.get_mut(&key.type_name) else {
            return Ok(());
        };
        if entries.shift_remove(&key.id).is_none() {
            return Ok(());
        }
        if entries.is_empty() {
            bucket.shift_remove(&key.type_name);
        }
        if bucket.is_empty() {
            return self.remove_if_present(ctx, &path).await;
        }
        let bytes = serde_yaml::to_string(&bucket)?.into_bytes();
        self.write(ctx, &self.original_dir(), &path, bytes).await
    }

    /// Replace the last successfully applied blueprint
    pub async fn save_last_blueprint(&self, ctx: &Context, blueprint: &Blueprint) -> Result<()> {
        let bytes = blueprint.to_yaml()?.into_bytes();
        self.write(ctx, &self.version_dir(), &self.last_path(), bytes)
            .await
    }

    /// The last successfully applied blueprint; `None` before the first
    /// managed run
    pub async fn load_last_blueprint(&self, ctx: &Context) -> Result<Option<Blueprint>> {
        match self.read_optional(ctx, &self.last_path()).await? {
            Some(bytes) => Ok(Some(Blueprint::from_yaml(&String::from_utf8_lossy(
                &bytes,
            ))?)),
            None => Ok(None),
        }
    }

    /// Write the target-blueprint latch; present exactly while an apply is
    /// in flight (or was interrupted)
    pub async fn save_target_blueprint(&self, ctx: &Context, blueprint: &Blueprint) -> Result<()> {
        let bytes = blueprint.to_yaml()?.into_bytes();
        self.write(ctx, &self.version_dir(), &self.target_path(), bytes)
            .await
    }

    pub async fn has_target_blueprint(&self, ctx: &Context) -> Result<bool> {
        let _permit = ctx.acquire().await?;
        Ok(self
            .host
            .lstat(ctx, &self.target_path())
            .await
            .wrap_err("checking the target blueprint latch")?
            .is_some())
    }

    pub async fn load_target_blueprint(&self, ctx: &Context) -> Result<Option<Blueprint>> {
        match self.read_optional(ctx, &self.target_path()).await? {
            Some(bytes) => Ok(Some(Blueprint::from_yaml(&String::from_utf8_lossy(
                &bytes,
            ))?)),
            None => Ok(None),
        }
    }

    pub async fn delete_target_blueprint(&self, ctx: &Context) -> Result<()> {
        self.remove_if_present(ctx, &self.target_path()).await
    }

    /// Open an append-only session log stream named by purpose
    pub async fn open_log(&self, ctx: &Context, session: &str) -> Result<SessionLog> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or_default();
        let path = format!("{}/{session}-{timestamp}.log", self.logs_dir());
        let _permit = ctx.acquire().await?;
        self.host.mkdir_all(ctx, &self.logs_dir(), DIR_MODE).await?;
        Ok(SessionLog {
            path,
            buffer: Vec::new(),
        })
    }

    /// Acquire the single-writer run lock; fails fast when another run
    /// holds it
    pub async fn lock(&self, ctx: &Context) -> Result<()> {
        let path = self.lock_path();
        let _permit = ctx.acquire().await?;
        if self.host.lstat(ctx, &path).await?.is_some() {
            bail!(
                "store {} is locked by another run; remove {path} if that run is gone",
                self.root
            );
        }
        self.host.mkdir_all(ctx, &self.version_dir(), DIR_MODE).await?;
        let pid = std::process::id().to_string();
        self.host
            .write_file(ctx, &path, bytes_reader(pid.into_bytes()), FILE_MODE)
            .await?;
        Ok(())
    }

    pub async fn unlock(&self, ctx: &Context) -> Result<()> {
        self.remove_if_present(ctx, &self.lock_path()).await
    }

    /// Flush a session log buffer to its file
    pub async fn flush_log(&self, ctx: &Context, log: &SessionLog) -> Result<()> {
        self.write(ctx, &self.logs_dir(), &log.path, log.buffer.clone())
            .await
    }
}

/// An in-memory session log stream, flushed through the store
///
/// Logs are append-only on disk: each flush rewrites this session's file
/// only, and sessions never share files.
pub struct SessionLog {
    path: String,
    buffer: Vec<u8>,
}

impl SessionLog {
    pub fn append(&mut self, line: &str) {
        self.buffer.extend_from_slice(line.as_bytes());
        self.buffer.push(b'\n');
    }

    pub fn path(&self) -> &str {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use common::{tempfile, tokio};
    use host::Local;
    use pretty_assertions::assert_eq;

    use super::*;

    fn store(root: &tempfile::TempDir) -> Store {
        Store::new(
            Arc::new(Local::new()),
            root.path().join("state").to_string_lossy().into_owned(),
        )
    }

    fn file(path: &str) -> Resource {
        resources::decode(
            "File",
            serde_yaml::from_str(&format!("{{path: {path}, regular_file: x}}")).expect("yaml"),
        )
        .expect("decode")
    }

    fn package(name: &str) -> Resource {
        resources::decode(
            "APTPackage",
            serde_yaml::from_str(&format!("{{package: {name}}}")).expect("yaml"),
        )
        .expect("decode")
    }

    #[tokio::test]
    async fn original_round_trip_is_byte_identical() -> Result<()> {
        let ctx = Context::default();
        let dir = tempfile::tempdir()?;
        let store = store(&dir);
        let resource = file("/etc/motd");

        assert!(!store.has_original(&ctx, &resource.key()).await?);
        store.save_original(&ctx, &resource).await?;
        assert!(store.has_original(&ctx, &resource.key()).await?);

        let bucket_path = store.bucket_path(&resource.key());
        let first = tokio::fs::read(&bucket_path).await?;

        let loaded = store
            .load_original(&ctx, &resource.key())
            .await?
            .expect("saved");
        assert_eq!(loaded, resource);

        store.save_original(&ctx, &loaded).await?;
        let second = tokio::fs::read(&bucket_path).await?;
        assert_eq!(first, second);

        Ok(())
    }

    #[tokio::test]
    async fn colliding_buckets_keep_both_resources() -> Result<()> {
        let ctx = Context::default();
        let dir = tempfile::tempdir()?;
        // One-hex-digit addresses: everything collides into few buckets
        let store = store(&dir).with_bucket_width(1);

        let one = file("/etc/one");
        let two = file("/etc/two");
        let three = package("curl");
        for resource in [&one, &two, &three] {
            store.save_original(&ctx, resource).await?;
        }

        for resource in [&one, &two, &three] {
            let loaded = store
                .load_original(&ctx, &resource.key())
                .await?
                .expect("saved");
            assert_eq!(&loaded, resource);
        }

        store.delete_original(&ctx, &one.key()).await?;
        assert!(!store.has_original(&ctx, &one.key()).await?);
        assert!(store.has_original(&ctx, &two.key()).await?);

        Ok(())
    }

    #[tokio::test]
    async fn deleting_a_never_saved_original_is_fine() -> Result<()> {
        let ctx = Context::default();
        let dir = tempfile::tempdir()?;
        let store = store(&dir);
        store.delete_original(&ctx, &file("/never").key()).await?;
        Ok(())
    }

    #[tokio::test]
    async fn blueprint_round_trip_and_latch() -> Result<()> {
        let ctx = Context::default();
        let dir = tempfile::tempdir()?;
        let store = store(&dir);

        assert!(store.load_last_blueprint(&ctx).await?.is_none());
        assert!(!store.has_target_blueprint(&ctx).await?);

        let target = Blueprint::compile(vec![package("foo"), file("/f")])?;
        store.save_last_blueprint(&ctx, &target).await?;
        let loaded = store.load_last_blueprint(&ctx).await?.expect("saved");
        assert_eq!(loaded.to_yaml()?, target.to_yaml()?);

        store.save_target_blueprint(&ctx, &target).await?;
        assert!(store.has_target_blueprint(&ctx).await?);
        store.delete_target_blueprint(&ctx).await?;
        assert!(!store.has_target_blueprint(&ctx).await?);
        // Idempotent
        store.delete_target_blueprint(&ctx).await?;

        Ok(())
    }

    #[tokio::test]
    async fn lock_is_exclusive_and_releasable() -> Result<()> {
        let ctx = Context::default();
        let dir = tempfile::tempdir()?;
        let store = store(&dir);

        store.lock(&ctx).await?;
        assert!(store.lock(&ctx).await.is_err());
        store.unlock(&ctx).await?;
        store.lock(&ctx).await?;
        store.unlock(&ctx).await?;

        Ok(())
    }

    #[tokio::test]
    async fn modes_are_restrictive() -> Result<()> {
        let ctx = Context::default();
        let dir = tempfile::tempdir()?;
        let store = store(&dir);
        let host = Local::new();

        store.save_last_blueprint(&ctx, &Blueprint::empty()).await?;
        let file_meta = host
            .lstat(&ctx, &store.last_path())
            .await?
            .expect("written");
        assert_eq!(file_meta.mode, FILE_MODE);
        let dir_meta = host
            .lstat(&ctx, &store.version_dir())
            .await?
            .expect("created");
        assert_eq!(dir_meta.mode, DIR_MODE);

        Ok(())
    }

    #[tokio::test]
    async fn session_logs_accumulate_and_flush() -> Result<()> {
        let ctx = Context::default();
        let dir = tempfile::tempdir()?;
        let store = store(&dir);

        let mut log = store.open_log(&ctx, "apply").await?;
        log.append("started");
        log.append("finished");
        store.flush_log(&ctx, &log).await?;

        let contents = tokio::fs::read_to_string(log.path()).await?;
        assert_eq!(contents, "started\nfinished\n");

        Ok(())
    }
}
