//! The serve loop of the deployed agent.
//!
//! One request at a time comes off the pipe; each is dispatched against the
//! local host implementation and answered with a response frame (plus a
//! body stream where the operation has one). The loop ends at the close
//! opcode or at EOF, so an operator killing the controlling connection
//! reaps the agent too.

use common::{
    tokio::io::{AsyncRead, AsyncWrite},
    tracing,
};
use context::Context;
use host::{bytes_reader, read_all, Cmd, Host, HostError, Local};
use protocol::{
    read_frame, read_handshake, write_control, write_frame, write_handshake, FrameKind,
    ProtocolError, Request, Response, CHUNK_SIZE,
};
use version::RESONANCE_AGENT_PROTOCOL_VERSION;

/// Serve requests until the peer closes the connection
pub async fn serve<R, W>(mut reader: R, mut writer: W) -> Result<(), ProtocolError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    // Announce ourselves, then require the peer to speak the same version
    write_handshake(&mut writer, RESONANCE_AGENT_PROTOCOL_VERSION).await?;
    read_handshake(&mut reader, RESONANCE_AGENT_PROTOCOL_VERSION).await?;

    let ctx = Context::new(None);
    let local = Local::new();

    loop {
        let frame = match read_frame(&mut reader).await {
            Ok(frame) => frame,
            Err(ProtocolError::Io(error))
                if error.kind() == std::io::ErrorKind::UnexpectedEof =>
            {
                // The controlling connection went away
                return Ok(());
            }
            Err(error) => return Err(error),
        };
        let request: Request = match frame.decode() {
            Ok(request) => request,
            Err(error) => {
                let response = Response::Error {
                    kind: protocol::ErrorKind::Protocol {
                        message: error.to_string(),
                    },
                };
                write_control(&mut writer, &response).await?;
                continue;
            }
        };

        if matches!(request, Request::Close) {
            write_control(&mut writer, &Response::Ok).await?;
            return Ok(());
        }

        dispatch(&ctx, &local, request, &mut reader, &mut writer).await?;
    }
}

/// Read a request's body stream (stdin or file contents) fully
async fn read_body<R>(reader: &mut R) -> Result<Vec<u8>, ProtocolError>
where
    R: AsyncRead + Unpin,
{
    let mut bytes = Vec::new();
    loop {
        let frame = read_frame(reader).await?;
        match frame.kind {
            FrameKind::Data => bytes.extend_from_slice(&frame.payload),
            FrameKind::DataEnd => return Ok(bytes),
            other => {
                return Err(ProtocolError::UnexpectedFrame {
                    expected: "data",
                    got: other.name(),
                })
            }
        }
    }
}

async fn write_body<W>(writer: &mut W, kind: FrameKind, bytes: &[u8]) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
{
    for chunk in bytes.chunks(CHUNK_SIZE) {
        write_frame(writer, kind, chunk).await?;
    }
    Ok(())
}

fn error_response(error: HostError) -> Response {
    Response::Error { kind: error.into() }
}

async fn dispatch<R, W>(
    ctx: &Context,
    local: &Local,
    request: Request,
    reader: &mut R,
    writer: &mut W,
) -> Result<(), ProtocolError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match request {
        Request::Run {
            path,
            args,
            env,
            dir,
        } => {
            // Stdin always follows a run request, possibly empty
            let stdin = read_body(reader).await?;
            let mut cmd = Cmd::new(path).args(args).stdin(stdin);
            cmd.env = env;
            cmd.dir = dir;

            match local.run(ctx, &cmd).await {
                Ok(output) => {
                    write_body(writer, FrameKind::Data, &output.stdout).await?;
                    write_body(writer, FrameKind::Stderr, &output.stderr).await?;
                    write_control(writer, &Response::Run { exit: output.exit }).await?;
                }
                Err(error) => write_control(writer, &error_response(error)).await?,
            }
        }

        Request::ReadFile { path } => match local.read_file(ctx, &path).await {
            Ok(contents) => match read_all(contents).await {
                Ok(bytes) => {
                    write_control(writer, &Response::ReadFile).await?;
                    write_body(writer, FrameKind::Data, &bytes).await?;
                    write_frame(writer, FrameKind::DataEnd, b"").await?;
                }
                Err(error) => write_control(writer, &error_response(error)).await?,
            },
            Err(error) => write_control(writer, &error_response(error)).await?,
        },

        Request::WriteFile { path, mode } => {
            let bytes = read_body(reader).await?;
            let response = match local
                .write_file(ctx, &path, bytes_reader(bytes), mode)
                .await
            {
                Ok(()) => Response::Ok,
                Err(error) => error_response(error),
            };
            write_control(writer, &response).await?;
        }

        Request::Lstat { path } => {
            let response = match local.lstat(ctx, &path).await {
                Ok(metadata) => Response::Lstat { metadata },
                Err(error) => error_response(error),
            };
            write_control(writer, &response).await?;
        }

        Request::Remove { path } => {
            let response = match local.remove(ctx, &path).await {
                Ok(()) => Response::Ok,
                Err(error) => error_response(error),
            };
            write_control(writer, &response).await?;
        }

        Request::MkdirAll { path, mode } => {
            let response = match local.mkdir_all(ctx, &path, mode).await {
                Ok(()) => Response::Ok,
                Err(error) => error_response(error),
            };
            write_control(writer, &response).await?;
        }

        Request::LookupUser { name } => {
            let response = match local.lookup_user(ctx, &name).await {
                Ok(user) => Response::User { user },
                Err(error) => error_response(error),
            };
            write_control(writer, &response).await?;
        }

        Request::LookupGroup { name } => {
            let response = match local.lookup_group(ctx, &name).await {
                Ok(group) => Response::Group { group },
                Err(error) => error_response(error),
            };
            write_control(writer, &response).await?;
        }

        Request::Close => {
            tracing::debug!("close handled before dispatch");
        }
    }

    Ok(())
}
