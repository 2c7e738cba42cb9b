//! Uniform operations on a target machine.
//!
//! A [`Host`] runs processes and manipulates files on a target, which may be
//! the local machine ([`Local`]), a remote machine over SSH ([`Ssh`]), a
//! running container ([`Docker`]), or either of those wrapped for privilege
//! elevation ([`Sudo`]), call logging ([`Logging`]), or throughput
//! ([`Agent`], which deploys an ephemeral agent and speaks an RPC to it
//! instead of exec-ing once per operation).
//!
//! Every operation takes the ambient [`Context`] and observes its
//! cancellation. Callers hold a permit from the context's gate across each
//! operation; the host itself does not acquire.

use std::fmt::Display;

use common::{
    async_trait::async_trait,
    futures::future::BoxFuture,
    thiserror::{self, Error},
    tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
};
use context::{Cancelled, Context};

mod agent;
mod cmdfs;
mod docker;
mod local;
mod logging;
mod ssh;
mod sudo;

pub use agent::Agent;
pub use docker::Docker;
pub use local::Local;
pub use logging::Logging;
pub use protocol::{ExitStatus, FileMetadata, FileType, Group, User};
pub use ssh::{Ssh, SshConfig};
pub use sudo::Sudo;

/// An error from a host operation
///
/// `run` returning a non-zero wait status is not an error; only transport,
/// protocol, and file/system failures are.
#[derive(Debug, Clone, Error)]
pub enum HostError {
    #[error("not found")]
    NotFound,

    #[error("permission denied")]
    PermissionDenied,

    #[error("interrupted")]
    Interrupted,

    #[error("i/o: {0}")]
    Io(String),

    #[error("protocol: {0}")]
    Protocol(String),

    #[error("cancelled")]
    Cancelled,
}

impl From<std::io::Error> for HostError {
    fn from(error: std::io::Error) -> Self {
        use std::io::ErrorKind;
        match error.kind() {
            ErrorKind::NotFound => Self::NotFound,
            ErrorKind::PermissionDenied => Self::PermissionDenied,
            ErrorKind::Interrupted => Self::Interrupted,
            _ => Self::Io(error.to_string()),
        }
    }
}

impl From<Cancelled> for HostError {
    fn from(_: Cancelled) -> Self {
        Self::Cancelled
    }
}

impl From<protocol::ProtocolError> for HostError {
    fn from(error: protocol::ProtocolError) -> Self {
        match error {
            protocol::ProtocolError::Io(io) => io.into(),
            other => Self::Protocol(other.to_string()),
        }
    }
}

impl From<protocol::ErrorKind> for HostError {
    fn from(kind: protocol::ErrorKind) -> Self {
        match kind {
            protocol::ErrorKind::NotFound => Self::NotFound,
            protocol::ErrorKind::PermissionDenied => Self::PermissionDenied,
            protocol::ErrorKind::Interrupted => Self::Interrupted,
            protocol::ErrorKind::Io { message } => Self::Io(message),
            protocol::ErrorKind::Protocol { message } => Self::Protocol(message),
        }
    }
}

impl From<HostError> for protocol::ErrorKind {
    fn from(error: HostError) -> Self {
        match error {
            HostError::NotFound => Self::NotFound,
            HostError::PermissionDenied => Self::PermissionDenied,
            HostError::Interrupted => Self::Interrupted,
            HostError::Io(message) => Self::Io { message },
            HostError::Protocol(message) => Self::Protocol { message },
            HostError::Cancelled => Self::Interrupted,
        }
    }
}

/// A reader over file contents coming from a host
pub type FileReader = Box<dyn AsyncRead + Send + Unpin>;

/// A command to run on a host
///
/// The path is exec-ed directly (no shell) with the given arguments;
/// wrap with `sh -c` explicitly when shell evaluation is wanted.
#[derive(Debug, Clone, Default)]
pub struct Cmd {
    pub path: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub dir: Option<String>,
    pub stdin: Option<Vec<u8>>,
}

impl Cmd {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((name.into(), value.into()));
        self
    }

    pub fn dir(mut self, dir: impl Into<String>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    pub fn stdin(mut self, stdin: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }

    /// The command as a single shell-safe line, for exec over SSH and for
    /// log messages
    pub fn shell_line(&self) -> String {
        std::iter::once(&self.path)
            .chain(self.args.iter())
            .map(|word| shell_quote(word))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

impl Display for Cmd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.shell_line())
    }
}

/// Quote a word for POSIX `sh`
pub fn shell_quote(word: &str) -> String {
    if !word.is_empty()
        && word
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,@%+".contains(c))
    {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

/// Collected output of a completed [`Host::run`]
#[derive(Debug, Clone)]
pub struct RunOutput {
    pub exit: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl RunOutput {
    pub fn success(&self) -> bool {
        self.exit.success()
    }

    pub fn stdout_string(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_string(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }
}

/// A spawned process with its stdio attached
///
/// Take the handles out before calling [`Child::wait`]; any left in place
/// are dropped (closing stdin) when waiting begins.
pub struct Child {
    pub stdin: Option<Box<dyn AsyncWrite + Send + Unpin>>,
    pub stdout: Option<Box<dyn AsyncRead + Send + Unpin>>,
    pub stderr: Option<Box<dyn AsyncRead + Send + Unpin>>,
    wait: BoxFuture<'static, Result<ExitStatus, HostError>>,
}

impl Child {
    pub fn new(
        stdin: Option<Box<dyn AsyncWrite + Send + Unpin>>,
        stdout: Option<Box<dyn AsyncRead + Send + Unpin>>,
        stderr: Option<Box<dyn AsyncRead + Send + Unpin>>,
        wait: BoxFuture<'static, Result<ExitStatus, HostError>>,
    ) -> Self {
        Self {
            stdin,
            stdout,
            stderr,
            wait,
        }
    }

    /// Wait for the process to exit
    pub async fn wait(mut self) -> Result<ExitStatus, HostError> {
        self.stdin.take();
        self.stdout.take();
        self.stderr.take();
        self.wait.await
    }
}

/// Uniform operations on a target machine
///
/// Implementations surface [`HostError::NotFound`] distinctly for file
/// operations, propagate cancellation promptly, and make [`Host::close`]
/// idempotent on all exit paths.
#[async_trait]
pub trait Host: Send + Sync + Display {
    /// A stable name for the variant, e.g. `"ssh"`
    fn type_name(&self) -> &'static str;

    /// Start a process with piped stdio
    async fn spawn(&self, ctx: &Context, cmd: &Cmd) -> Result<Child, HostError>;

    /// Run a process to completion, collecting its output
    ///
    /// The wait status is returned as data; a non-zero exit is not an error.
    async fn run(&self, ctx: &Context, cmd: &Cmd) -> Result<RunOutput, HostError> {
        ctx.check()?;
        let mut child = self.spawn(ctx, cmd).await?;

        let mut stdin = child.stdin.take();
        let stdin_bytes = cmd.stdin.clone().unwrap_or_default();
        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();

        let io = async {
            let feed = async {
                if let Some(stdin) = stdin.as_mut() {
                    stdin.write_all(&stdin_bytes).await?;
                    stdin.shutdown().await?;
                }
                drop(stdin.take());
                Ok::<_, std::io::Error>(())
            };
            let out = async {
                let mut bytes = Vec::new();
                if let Some(stdout) = stdout.as_mut() {
                    stdout.read_to_end(&mut bytes).await?;
                }
                Ok::<_, std::io::Error>(bytes)
            };
            let err = async {
                let mut bytes = Vec::new();
                if let Some(stderr) = stderr.as_mut() {
                    stderr.read_to_end(&mut bytes).await?;
                }
                Ok::<_, std::io::Error>(bytes)
            };
            common::tokio::try_join!(feed, out, err)
        };

        let ((), stdout, stderr) = common::tokio::select! {
            result = io => result?,
            _ = ctx.cancelled() => return Err(HostError::Cancelled),
        };

        let exit = common::tokio::select! {
            exit = child.wait() => exit?,
            _ = ctx.cancelled() => return Err(HostError::Cancelled),
        };

        Ok(RunOutput {
            exit,
            stdout,
            stderr,
        })
    }

    /// Open a file for reading
    async fn read_file(&self, ctx: &Context, path: &str) -> Result<FileReader, HostError>;

    /// Create or truncate a file with the given permission bits and stream
    /// `contents` into it
    async fn write_file(
        &self,
        ctx: &Context,
        path: &str,
        contents: FileReader,
        mode: u32,
    ) -> Result<(), HostError>;

    /// Stat a path without following symlinks; `None` when it does not exist
    async fn lstat(&self, ctx: &Context, path: &str) -> Result<Option<FileMetadata>, HostError>;

    /// Remove a file, empty directory, or symlink
    async fn remove(&self, ctx: &Context, path: &str) -> Result<(), HostError>;

    /// Create a directory and any missing parents with the given mode
    async fn mkdir_all(&self, ctx: &Context, path: &str, mode: u32) -> Result<(), HostError>;

    /// Look up a user by name
    async fn lookup_user(&self, ctx: &Context, name: &str) -> Result<Option<User>, HostError>;

    /// Look up a group by name
    async fn lookup_group(&self, ctx: &Context, name: &str) -> Result<Option<Group>, HostError>;

    /// Release the host's resources; idempotent
    async fn close(&self, ctx: &Context) -> Result<(), HostError>;
}

/// Read a [`FileReader`] fully into memory
pub async fn read_all(mut reader: FileReader) -> Result<Vec<u8>, HostError> {
    let mut bytes = Vec::new();
    reader.read_to_end(&mut bytes).await?;
    Ok(bytes)
}

/// Box a byte buffer as a [`FileReader`]
pub fn bytes_reader(bytes: impl Into<Vec<u8>>) -> FileReader {
    Box::new(std::io::Cursor::new(bytes.into()))
}
