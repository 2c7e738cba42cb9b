//! Wraps a non-local host with an ephemeral agent deployed to it.
//!
//! Construction copies an architecture-matched pre-built agent binary
//! (gzip-compressed, embedded at build time) to a temp path on the target,
//! spawns it with its stdio piped, and performs the protocol handshake.
//! Every subsequent operation is one RPC over that pipe, replacing the
//! exec-per-call cost of the base host with a single long-lived process.

use std::io::Read;
use std::sync::Arc;

use common::{
    async_trait::async_trait,
    flate2::read::GzDecoder,
    rand,
    tokio::{
        self,
        io::{AsyncRead, AsyncWrite},
        sync::Mutex,
    },
};
use context::Context;
use protocol::{
    read_frame, read_handshake, write_control, write_frame, write_handshake, FileMetadata,
    FrameKind, Group, Request, Response, User, CHUNK_SIZE,
};
use rust_embed::RustEmbed;
use version::RESONANCE_AGENT_PROTOCOL_VERSION;

use crate::{bytes_reader, read_all, Child, Cmd, FileReader, Host, HostError, RunOutput};

/// Pre-built agent binaries, one per target platform, gzip-compressed and
/// named `<os>-<arch>.gz` (e.g. `linux-x86_64.gz`)
#[derive(RustEmbed)]
#[folder = "$CARGO_MANIFEST_DIR/agents/"]
#[include = "*.gz"]
struct AgentBinaries;

struct Connection {
    stdin: Box<dyn AsyncWrite + Send + Unpin>,
    stdout: Box<dyn AsyncRead + Send + Unpin>,
    child: Option<Child>,
    remote_path: String,
}

/// Wraps a base host with a deployed agent serving all operations
///
/// Requests on the connection are serialized; concurrency comes from the
/// caller issuing many host operations under the gate, each of which queues
/// on the connection lock for its frame exchange.
pub struct Agent {
    base: Arc<dyn Host>,
    connection: Mutex<Option<Connection>>,
}

impl Agent {
    /// Deploy the agent to the base host and connect to it
    pub async fn connect(ctx: &Context, base: Arc<dyn Host>) -> Result<Self, HostError> {
        ctx.check()?;
        if base.type_name() == "local" {
            return Err(HostError::Protocol(
                "the agent wrapper is for non-local hosts".to_string(),
            ));
        }

        let binary = embedded_binary_for(ctx, base.as_ref()).await?;

        let remote_path = format!("/tmp/resonance-agent-{:016x}", rand::random::<u64>());
        base.write_file(ctx, &remote_path, bytes_reader(binary), 0o700)
            .await?;

        let mut child = base.spawn(ctx, &Cmd::new(&remote_path)).await?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| HostError::Protocol("agent spawned without stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| HostError::Protocol("agent spawned without stdout".to_string()))?;

        let mut connection = Connection {
            stdin,
            stdout: Box::new(tokio::io::BufReader::new(stdout)),
            child: Some(child),
            remote_path,
        };

        // The agent announces itself first; we echo our version back
        let handshake = async {
            read_handshake(&mut connection.stdout, RESONANCE_AGENT_PROTOCOL_VERSION).await?;
            write_handshake(&mut connection.stdin, RESONANCE_AGENT_PROTOCOL_VERSION).await?;
            Ok::<_, protocol::ProtocolError>(())
        };
        tokio::select! {
            result = handshake => result?,
            _ = ctx.cancelled() => return Err(HostError::Cancelled),
        }

        Ok(Self {
            base,
            connection: Mutex::new(Some(connection)),
        })
    }
}

impl std::fmt::Display for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "agent[{}]", self.base)
    }
}

/// Probe the target's platform and return the matching decompressed agent
async fn embedded_binary_for(ctx: &Context, base: &dyn Host) -> Result<Vec<u8>, HostError> {
    let output = base.run(ctx, &Cmd::new("uname").arg("-s").arg("-m")).await?;
    if !output.success() {
        return Err(HostError::Protocol(format!(
            "cannot determine target platform: uname: {}",
            output.stderr_string().trim()
        )));
    }
    let uname = output.stdout_string();
    let mut words = uname.split_whitespace();
    let (Some(os), Some(arch)) = (words.next(), words.next()) else {
        return Err(HostError::Protocol(format!(
            "unparseable uname output: {uname:?}"
        )));
    };

    let asset = format!("{}-{arch}.gz", os.to_lowercase());
    let Some(file) = AgentBinaries::get(&asset) else {
        return Err(HostError::Protocol(format!(
            "no embedded agent binary for platform {}-{arch}",
            os.to_lowercase()
        )));
    };

    let mut binary = Vec::new();
    GzDecoder::new(file.data.as_ref())
        .read_to_end(&mut binary)
        .map_err(|error| HostError::Protocol(format!("decompressing {asset}: {error}")))?;
    Ok(binary)
}

/// Drop the connection, stopping the agent (it exits on stdin EOF) and
/// reaping the process
async fn teardown(connection: &mut Option<Connection>) {
    if let Some(connection) = connection.take() {
        drop(connection.stdin);
        if let Some(child) = connection.child {
            let _ = child.wait().await;
        }
    }
}

/// Whether an operation's failure poisons the connection
fn is_fatal<T>(result: &Result<T, HostError>) -> bool {
    matches!(
        result,
        Err(HostError::Protocol(_) | HostError::Io(_) | HostError::Cancelled)
    )
}

async fn send_stream(
    connection: &mut Connection,
    bytes: &[u8],
) -> Result<(), protocol::ProtocolError> {
    for chunk in bytes.chunks(CHUNK_SIZE) {
        write_frame(&mut connection.stdin, FrameKind::Data, chunk).await?;
    }
    write_frame(&mut connection.stdin, FrameKind::DataEnd, b"").await
}

async fn recv_stream(connection: &mut Connection) -> Result<Vec<u8>, HostError> {
    let mut bytes = Vec::new();
    loop {
        let frame = read_frame(&mut connection.stdout).await?;
        match frame.kind {
            FrameKind::Data => bytes.extend_from_slice(&frame.payload),
            FrameKind::DataEnd => return Ok(bytes),
            FrameKind::Control => {
                return match frame.decode()? {
                    Response::Error { kind } => Err(kind.into()),
                    _ => Err(HostError::Protocol(
                        "unexpected response inside a body stream".to_string(),
                    )),
                };
            }
            FrameKind::Stderr => {
                return Err(HostError::Protocol(
                    "unexpected stderr frame inside a body stream".to_string(),
                ))
            }
        }
    }
}

async fn recv_response(connection: &mut Connection) -> Result<Response, HostError> {
    let response: Response = read_frame(&mut connection.stdout).await?.decode()?;
    Ok(response)
}

async fn run_op(connection: &mut Connection, cmd: &Cmd) -> Result<RunOutput, HostError> {
    let request = Request::Run {
        path: cmd.path.clone(),
        args: cmd.args.clone(),
        env: cmd.env.clone(),
        dir: cmd.dir.clone(),
    };
    write_control(&mut connection.stdin, &request).await?;
    send_stream(connection, cmd.stdin.as_deref().unwrap_or_default()).await?;

    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    loop {
        let frame = read_frame(&mut connection.stdout).await?;
        match frame.kind {
            FrameKind::Data => stdout.extend_from_slice(&frame.payload),
            FrameKind::Stderr => stderr.extend_from_slice(&frame.payload),
            FrameKind::DataEnd => {}
            FrameKind::Control => {
                return match frame.decode()? {
                    Response::Run { exit } => Ok(RunOutput {
                        exit,
                        stdout,
                        stderr,
                    }),
                    Response::Error { kind } => Err(kind.into()),
                    _ => Err(HostError::Protocol("unexpected response to run".to_string())),
                };
            }
        }
    }
}

async fn read_file_op(connection: &mut Connection, path: &str) -> Result<Vec<u8>, HostError> {
    let request = Request::ReadFile {
        path: path.to_string(),
    };
    write_control(&mut connection.stdin, &request).await?;
    match recv_response(connection).await? {
        Response::ReadFile => recv_stream(connection).await,
        Response::Error { kind } => Err(kind.into()),
        _ => Err(HostError::Protocol(
            "unexpected response to read_file".to_string(),
        )),
    }
}

async fn write_file_op(
    connection: &mut Connection,
    path: &str,
    bytes: &[u8],
    mode: u32,
) -> Result<(), HostError> {
    let request = Request::WriteFile {
        path: path.to_string(),
        mode,
    };
    write_control(&mut connection.stdin, &request).await?;
    send_stream(connection, bytes).await?;
    expect_ok(recv_response(connection).await?, "write_file")
}

fn expect_ok(response: Response, operation: &str) -> Result<(), HostError> {
    match response {
        Response::Ok => Ok(()),
        Response::Error { kind } => Err(kind.into()),
        _ => Err(HostError::Protocol(format!(
            "unexpected response to {operation}"
        ))),
    }
}

async fn simple_op(connection: &mut Connection, request: &Request) -> Result<Response, HostError> {
    write_control(&mut connection.stdin, request).await?;
    recv_response(connection).await
}

macro_rules! with_connection {
    ($self:ident, $ctx:ident, |$connection:ident| $body:expr) => {{
        $ctx.check()?;
        let mut guard = $self.connection.lock().await;
        let Some($connection) = guard.as_mut() else {
            return Err(HostError::Io("agent connection is closed".to_string()));
        };
        let result = tokio::select! {
            result = $body => result,
            _ = $ctx.cancelled() => Err(HostError::Cancelled),
        };
        if is_fatal(&result) {
            teardown(&mut guard).await;
        }
        result
    }};
}

#[async_trait]
impl Host for Agent {
    fn type_name(&self) -> &'static str {
        "agent"
    }

    async fn spawn(&self, _ctx: &Context, _cmd: &Cmd) -> Result<Child, HostError> {
        Err(HostError::Protocol(
            "streaming spawn is not supported over the agent; use run".to_string(),
        ))
    }

    async fn run(&self, ctx: &Context, cmd: &Cmd) -> Result<RunOutput, HostError> {
        with_connection!(self, ctx, |connection| run_op(connection, cmd))
    }

    async fn read_file(&self, ctx: &Context, path: &str) -> Result<FileReader, HostError> {
        let bytes = with_connection!(self, ctx, |connection| read_file_op(connection, path))?;
        Ok(bytes_reader(bytes))
    }

    async fn write_file(
        &self,
        ctx: &Context,
        path: &str,
        contents: FileReader,
        mode: u32,
    ) -> Result<(), HostError> {
        let bytes = read_all(contents).await?;
        with_connection!(self, ctx, |connection| write_file_op(
            connection, path, &bytes, mode
        ))
    }

    async fn lstat(&self, ctx: &Context, path: &str) -> Result<Option<FileMetadata>, HostError> {
        let request = Request::Lstat {
            path: path.to_string(),
        };
        let response = with_connection!(self, ctx, |connection| simple_op(connection, &request))?;
        match response {
            Response::Lstat { metadata } => Ok(metadata),
            Response::Error { kind } => Err(kind.into()),
            _ => Err(HostError::Protocol(
                "unexpected response to lstat".to_string(),
            )),
        }
    }

    async fn remove(&self, ctx: &Context, path: &str) -> Result<(), HostError> {
        let request = Request::Remove {
            path: path.to_string(),
        };
        let response = with_connection!(self, ctx, |connection| simple_op(connection, &request))?;
        expect_ok(response, "remove")
    }

    async fn mkdir_all(&self, ctx: &Context, path: &str, mode: u32) -> Result<(), HostError> {
        let request = Request::MkdirAll {
            path: path.to_string(),
            mode,
        };
        let response = with_connection!(self, ctx, |connection| simple_op(connection, &request))?;
        expect_ok(response, "mkdir_all")
    }

    async fn lookup_user(&self, ctx: &Context, name: &str) -> Result<Option<User>, HostError> {
        let request = Request::LookupUser {
            name: name.to_string(),
        };
        let response = with_connection!(self, ctx, |connection| simple_op(connection, &request))?;
        match response {
            Response::User { user } => Ok(user),
            Response::Error { kind } => Err(kind.into()),
            _ => Err(HostError::Protocol(
                "unexpected response to lookup_user".to_string(),
            )),
        }
    }

    async fn lookup_group(&self, ctx: &Context, name: &str) -> Result<Option<Group>, HostError> {
        let request = Request::LookupGroup {
            name: name.to_string(),
        };
        let response = with_connection!(self, ctx, |connection| simple_op(connection, &request))?;
        match response {
            Response::Group { group } => Ok(group),
            Response::Error { kind } => Err(kind.into()),
            _ => Err(HostError::Protocol(
                "unexpected response to lookup_group".to_string(),
            )),
        }
    }

    async fn close(&self, ctx: &Context) -> Result<(), HostError> {
        let mut guard = self.connection.lock().await;
        if let Some(connection) = guard.as_mut() {
            // Best effort: ask the agent to exit, then reap it
            let goodbye = async {
                write_control(&mut connection.stdin, &Request::Close).await?;
                let _ = recv_response(connection).await;
                Ok::<_, HostError>(())
            };
            let _ = tokio::time::timeout(std::time::Duration::from_secs(5), goodbye).await;
            let remote_path = connection.remote_path.clone();
            teardown(&mut guard).await;
            drop(guard);
            let _ = self.base.remove(ctx, &remote_path).await;
        }
        self.base.close(ctx).await
    }
}
