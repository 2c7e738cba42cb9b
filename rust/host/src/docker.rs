//! Host operations inside a running container, through `docker exec` on the
//! local machine.

use std::path::PathBuf;

use common::{async_trait::async_trait, which};
use context::Context;
use protocol::{FileMetadata, Group, User};

use crate::{cmdfs, local::Local, Child, Cmd, FileReader, Host, HostError};

/// A running container targeted by `[name|uid[:group|gid]@]container`
///
/// The optional leading user spec is passed to `docker exec --user`.
#[derive(Debug, Clone)]
pub struct Docker {
    user: Option<String>,
    container: String,
    docker: PathBuf,
    local: Local,
}

impl Docker {
    pub fn new(spec: &str) -> Result<Self, HostError> {
        let (user, container) = match spec.split_once('@') {
            Some((user, container)) => (Some(user.to_string()), container.to_string()),
            None => (None, spec.to_string()),
        };
        if container.is_empty() {
            return Err(HostError::Io(format!("empty container name in {spec:?}")));
        }
        let docker = which::which("docker")
            .map_err(|_| HostError::Io("docker executable not found on PATH".to_string()))?;
        Ok(Self {
            user,
            container,
            docker,
            local: Local::new(),
        })
    }

    fn exec_cmd(&self, cmd: &Cmd) -> Cmd {
        let mut exec = Cmd::new(self.docker.to_string_lossy()).arg("exec").arg("--interactive");
        if let Some(user) = &self.user {
            exec = exec.arg("--user").arg(user);
        }
        if let Some(dir) = &cmd.dir {
            exec = exec.arg("--workdir").arg(dir);
        }
        for (name, value) in &cmd.env {
            exec = exec.arg("--env").arg(format!("{name}={value}"));
        }
        exec = exec.arg(&self.container).arg(&cmd.path).args(cmd.args.clone());
        exec.stdin = cmd.stdin.clone();
        exec
    }
}

impl std::fmt::Display for Docker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.user {
            Some(user) => write!(f, "docker://{user}@{}", self.container),
            None => write!(f, "docker://{}", self.container),
        }
    }
}

#[async_trait]
impl Host for Docker {
    fn type_name(&self) -> &'static str {
        "docker"
    }

    async fn spawn(&self, ctx: &Context, cmd: &Cmd) -> Result<Child, HostError> {
        self.local.spawn(ctx, &self.exec_cmd(cmd)).await
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

    async fn close(&self, _ctx: &Context) -> Result<(), HostError> {
        Ok(())
    }
}
