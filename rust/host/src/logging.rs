//! A transparent wrapper that records every host call as a structured log
//! event.

use std::sync::Arc;

use common::async_trait::async_trait;
use context::Context;
use protocol::{FileMetadata, Group, User};

use crate::{Child, Cmd, FileReader, Host, HostError, RunOutput};

/// Logs every call, delegating everything to the wrapped host
pub struct Logging {
    base: Arc<dyn Host>,
}

impl Logging {
    pub fn new(base: Arc<dyn Host>) -> Self {
        Self { base }
    }

    fn ctx(&self, ctx: &Context) -> Context {
        ctx.with_group("host").with_attr("host", self.base.to_string())
    }
}

impl std::fmt::Display for Logging {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.base)
    }
}

#[async_trait]
impl Host for Logging {
    fn type_name(&self) -> &'static str {
        self.base.type_name()
    }

    async fn spawn(&self, ctx: &Context, cmd: &Cmd) -> Result<Child, HostError> {
        let ctx = self.ctx(ctx);
        ctx.logger().debug(&format!("spawn: {cmd}"));
        self.base.spawn(&ctx, cmd).await
    }

    async fn run(&self, ctx: &Context, cmd: &Cmd) -> Result<RunOutput, HostError> {
        let ctx = self.ctx(ctx);
        ctx.logger().debug(&format!("run: {cmd}"));
        let output = self.base.run(&ctx, cmd).await?;
        ctx.logger().debug(&format!("run: {cmd}: {}", output.exit));
        Ok(output)
    }

    async fn read_file(&self, ctx: &Context, path: &str) -> Result<FileReader, HostError> {
        let ctx = self.ctx(ctx);
        ctx.logger().debug(&format!("read_file: {path}"));
        self.base.read_file(&ctx, path).await
    }

    async fn write_file(
        &self,
        ctx: &Context,
        path: &str,
        contents: FileReader,
        mode: u32,
    ) -> Result<(), HostError> {
        let ctx = self.ctx(ctx);
        ctx.logger().debug(&format!("write_file: {path} mode {mode:o}"));
        self.base.write_file(&ctx, path, contents, mode).await
    }

    async fn lstat(&self, ctx: &Context, path: &str) -> Result<Option<FileMetadata>, HostError> {
        let ctx = self.ctx(ctx);
        ctx.logger().debug(&format!("lstat: {path}"));
        self.base.lstat(&ctx, path).await
    }

    async fn remove(&self, ctx: &Context, path: &str) -> Result<(), HostError> {
        let ctx = self.ctx(ctx);
        ctx.logger().debug(&format!("remove: {path}"));
        self.base.remove(&ctx, path).await
    }

    async fn mkdir_all(&self, ctx: &Context, path: &str, mode: u32) -> Result<(), HostError> {
        let ctx = self.ctx(ctx);
        ctx.logger().debug(&format!("mkdir_all: {path} mode {mode:o}"));
        self.base.mkdir_all(&ctx, path, mode).await
    }

    async fn lookup_user(&self, ctx: &Context, name: &str) -> Result<Option<User>, HostError> {
        let ctx = self.ctx(ctx);
        ctx.logger().debug(&format!("lookup_user: {name}"));
        self.base.lookup_user(&ctx, name).await
    }

    async fn lookup_group(&self, ctx: &Context, name: &str) -> Result<Option<Group>, HostError> {
        let ctx = self.ctx(ctx);
        ctx.logger().debug(&format!("lookup_group: {name}"));
        self.base.lookup_group(&ctx, name).await
    }

    async fn close(&self, ctx: &Context) -> Result<(), HostError> {
        let ctx = self.ctx(ctx);
        ctx.logger().debug("close");
        self.base.close(&ctx).await
    }
}
