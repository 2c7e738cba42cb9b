//! Privilege elevation by wrapping another host so that every exec happens
//! under `sudo`. File operations route through small helper invocations on
//! the elevated side.

use std::sync::Arc;

use common::async_trait::async_trait;
use context::Context;
use protocol::{FileMetadata, Group, User};

use crate::{cmdfs, Child, Cmd, FileReader, Host, HostError};

/// Wraps a base host so every `run` is elevated
///
/// `sudo` is invoked non-interactively; targets must allow the connecting
/// user to elevate without a password prompt.
pub struct Sudo {
    base: Arc<dyn Host>,
}

impl Sudo {
    pub fn new(base: Arc<dyn Host>) -> Self {
        Self { base }
    }

    fn elevate(&self, cmd: &Cmd) -> Cmd {
        let mut elevated = Cmd::new("sudo").arg("-n").arg("--");
        if !cmd.env.is_empty() {
            elevated = elevated.arg("env");
            for (name, value) in &cmd.env {
                elevated = elevated.arg(format!("{name}={value}"));
            }
        }
        if let Some(dir) = &cmd.dir {
            elevated = elevated
                .arg("sh")
                .arg("-c")
                .arg("cd \"$1\" && shift && exec \"$@\"")
                .arg("sh")
                .arg(dir);
        }
        elevated = elevated.arg(&cmd.path).args(cmd.args.clone());
        elevated.stdin = cmd.stdin.clone();
        elevated
    }
}

impl std::fmt::Display for Sudo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sudo[{}]", self.base)
    }
}

#[async_trait]
impl Host for Sudo {
    fn type_name(&self) -> &'static str {
        "sudo"
    }

    async fn spawn(&self, ctx: &Context, cmd: &Cmd) -> Result<Child, HostError> {
        self.base.spawn(ctx, &self.elevate(cmd)).await
    }

    async fn read_file(&self, ctx: &Context, path: &str) -> Result<FileReader, HostError> {
        cmdfs::read_file(self, ctx, path).await
    }

    async fn write_file(
        &self,
        ctx: &Context,
        path: &str,
        contents: FileReader,
        mode: u32,
    ) -> Result<(), HostError> {
        cmdfs::write_file(self, ctx, path, contents, mode).await
    }

    async fn lstat(&self, ctx: &Context, path: &str) -> Result<Option<FileMetadata>, HostError> {
        cmdfs::lstat(self, ctx, path).await
    }

    async fn remove(&self, ctx: &Context, path: &str) -> Result<(), HostError> {
        cmdfs::remove(self, ctx, path).await
    }

    async fn mkdir_all(&self, ctx: &Context, path: &str, mode: u32) -> Result<(), HostError> {
        cmdfs::mkdir_all(self, ctx, path, mode).await
    }

    async fn lookup_user(&self, ctx: &Context, name: &str) -> Result<Option<User>, HostError> {
        cmdfs::lookup_user(self, ctx, name).await
    }

    async fn lookup_group(&self, ctx: &Context, name: &str) -> Result<Option<Group>, HostError> {
        cmdfs::lookup_group(self, ctx, name).await
    }

    async fn close(&self, ctx: &Context) -> Result<(), HostError> {
        self.base.close(ctx).await
    }
}
