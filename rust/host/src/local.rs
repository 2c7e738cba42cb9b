//! Host operations on the machine this process runs on.

use std::os::unix::fs::{FileTypeExt, MetadataExt, OpenOptionsExt, PermissionsExt};
use std::process::Stdio;

use common::{
    async_trait::async_trait,
    futures::FutureExt,
    tokio::{self, fs, io::AsyncWriteExt, process::Command},
};
use context::Context;
use protocol::{ExitStatus, FileMetadata, FileType, Group, User};

use crate::{Child, Cmd, FileReader, Host, HostError};

/// Direct syscalls on the current machine
#[derive(Debug, Default, Clone)]
pub struct Local;

impl Local {
    pub fn new() -> Self {
        Self
    }
}

impl std::fmt::Display for Local {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "localhost")
    }
}

fn file_type(file_type: std::fs::FileType) -> FileType {
    if file_type.is_dir() {
        FileType::Directory
    } else if file_type.is_symlink() {
        FileType::Symlink
    } else if file_type.is_fifo() {
        FileType::Fifo
    } else if file_type.is_socket() {
        FileType::Socket
    } else if file_type.is_char_device() {
        FileType::CharDevice
    } else if file_type.is_block_device() {
        FileType::BlockDevice
    } else {
        FileType::Regular
    }
}

#[async_trait]
impl Host for Local {
    fn type_name(&self) -> &'static str {
        "local"
    }

    async fn spawn(&self, ctx: &Context, cmd: &Cmd) -> Result<Child, HostError> {
        ctx.check()?;

        let mut command = Command::new(&cmd.path);
        command
            .args(&cmd.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (name, value) in &cmd.env {
            command.env(name, value);
        }
        if let Some(dir) = &cmd.dir {
            command.current_dir(dir);
        }

        let mut child = command.spawn()?;
        let stdin = child
            .stdin
            .take()
            .map(|stdin| Box::new(stdin) as Box<dyn tokio::io::AsyncWrite + Send + Unpin>);
        let stdout = child
            .stdout
            .take()
            .map(|stdout| Box::new(stdout) as Box<dyn tokio::io::AsyncRead + Send + Unpin>);
        let stderr = child
            .stderr
            .take()
            .map(|stderr| Box::new(stderr) as Box<dyn tokio::io::AsyncRead + Send + Unpin>);

        let wait = async move {
            let status = child.wait().await?;
            Ok(match status.code() {
                Some(code) => ExitStatus::exited(code),
                None => {
                    use std::os::unix::process::ExitStatusExt;
                    ExitStatus::signalled(status.signal().unwrap_or(0))
                }
            })
        }
        .boxed();

        Ok(Child::new(stdin, stdout, stderr, wait))
    }

    async fn read_file(&self, ctx: &Context, path: &str) -> Result<FileReader, HostError> {
        ctx.check()?;
        let file = fs::File::open(path).await?;
        Ok(Box::new(file))
    }

    async fn write_file(
        &self,
        ctx: &Context,
        path: &str,
        mut contents: FileReader,
        mode: u32,
    ) -> Result<(), HostError> {
        ctx.check()?;
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(mode)
            .open(path)
            .await?;
        tokio::io::copy(&mut contents, &mut file).await?;
        file.flush().await?;
        // The mode passed to open only applies on creation
        fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await?;
        Ok(())
    }

    async fn lstat(&self, ctx: &Context, path: &str) -> Result<Option<FileMetadata>, HostError> {
        ctx.check()?;
        match fs::symlink_metadata(path).await {
            Ok(metadata) => Ok(Some(FileMetadata {
                file_type: file_type(metadata.file_type()),
                mode: metadata.permissions().mode() & 0o7777,
                size: metadata.size(),
                uid: metadata.uid(),
                gid: metadata.gid(),
            })),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error.into()),
        }
    }

    async fn remove(&self, ctx: &Context, path: &str) -> Result<(), HostError> {
        ctx.check()?;
        let metadata = fs::symlink_metadata(path).await?;
        if metadata.is_dir() {
            fs::remove_dir(path).await?;
        } else {
            fs::remove_file(path).await?;
        }
        Ok(())
    }

    async fn mkdir_all(&self, ctx: &Context, path: &str, mode: u32) -> Result<(), HostError> {
        ctx.check()?;
        let mut builder = fs::DirBuilder::new();
        builder.recursive(true).mode(mode);
        builder.create(path).await?;
        // Recursive creation is not an error when the directory exists, but
        // then the mode has not been applied
        fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await?;
        Ok(())
    }

    async fn lookup_user(&self, ctx: &Context, name: &str) -> Result<Option<User>, HostError> {
        ctx.check()?;
        let name = name.to_string();
        let user = tokio::task::spawn_blocking(move || nix::unistd::User::from_name(&name))
            .await
            .map_err(|error| HostError::Io(error.to_string()))?
            .map_err(|error| HostError::Io(error.to_string()))?;
        Ok(user.map(|user| User {
            name: user.name,
            uid: user.uid.as_raw(),
            gid: user.gid.as_raw(),
            home: user.dir.to_string_lossy().into_owned(),
        }))
    }

    async fn lookup_group(&self, ctx: &Context, name: &str) -> Result<Option<Group>, HostError> {
        ctx.check()?;
        let name = name.to_string();
        let group = tokio::task::spawn_blocking(move || nix::unistd::Group::from_name(&name))
            .await
            .map_err(|error| HostError::Io(error.to_string()))?
            .map_err(|error| HostError::Io(error.to_string()))?;
        Ok(group.map(|group| Group {
            name: group.name,
            gid: group.gid.as_raw(),
        }))
    }

    async fn close(&self, _ctx: &Context) -> Result<(), HostError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use common::{eyre::Result, tempfile, tokio};

    use crate::{bytes_reader, read_all};

    use super::*;

    #[tokio::test]
    async fn run_collects_output_and_status() -> Result<()> {
        let ctx = Context::default();
        let host = Local::new();

        let output = host
            .run(&ctx, &Cmd::new("/bin/sh").arg("-c").arg("echo out; echo err >&2; exit 3"))
            .await?;
        assert_eq!(output.exit, ExitStatus::exited(3));
        assert_eq!(output.stdout_string(), "out\n");
        assert_eq!(output.stderr_string(), "err\n");
        assert!(!output.success());

        Ok(())
    }

    #[tokio::test]
    async fn run_feeds_stdin() -> Result<()> {
        let ctx = Context::default();
        let host = Local::new();

        let output = host
            .run(&ctx, &Cmd::new("/bin/cat").stdin("hello"))
            .await?;
        assert!(output.success());
        assert_eq!(output.stdout_string(), "hello");

        Ok(())
    }

    #[tokio::test]
    async fn file_round_trip_with_mode() -> Result<()> {
        let ctx = Context::default();
        let host = Local::new();
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("file").to_string_lossy().into_owned();

        host.write_file(&ctx, &path, bytes_reader("contents"), 0o600)
            .await?;
        let metadata = host.lstat(&ctx, &path).await?.expect("exists");
        assert_eq!(metadata.file_type, FileType::Regular);
        assert_eq!(metadata.mode, 0o600);
        assert_eq!(metadata.size, 8);

        let bytes = read_all(host.read_file(&ctx, &path).await?).await?;
        assert_eq!(bytes, b"contents");

        host.remove(&ctx, &path).await?;
        assert!(host.lstat(&ctx, &path).await?.is_none());
        assert!(matches!(
            host.remove(&ctx, &path).await,
            Err(HostError::NotFound)
        ));

        Ok(())
    }

    #[tokio::test]
    async fn mkdir_all_applies_mode() -> Result<()> {
        let ctx = Context::default();
        let host = Local::new();
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("a/b/c").to_string_lossy().into_owned();

        host.mkdir_all(&ctx, &path, 0o700).await?;
        let metadata = host.lstat(&ctx, &path).await?.expect("exists");
        assert_eq!(metadata.file_type, FileType::Directory);
        assert_eq!(metadata.mode, 0o700);

        Ok(())
    }

    #[tokio::test]
    async fn missing_file_is_not_found() -> Result<()> {
        let ctx = Context::default();
        let host = Local::new();

        assert!(matches!(
            host.read_file(&ctx, "/definitely/not/here").await,
            Err(HostError::NotFound)
        ));
        assert!(host.lstat(&ctx, "/definitely/not/here").await?.is_none());

        Ok(())
    }

    #[tokio::test]
    async fn lookup_root() -> Result<()> {
        let ctx = Context::default();
        let host = Local::new();

        let user = host.lookup_user(&ctx, "root").await?.expect("root exists");
        assert_eq!(user.uid, 0);
        let group = host.lookup_group(&ctx, "root").await?;
        if let Some(group) = group {
            assert_eq!(group.gid, 0);
        }
        assert!(host.lookup_user(&ctx, "no-such-user-here").await?.is_none());

        Ok(())
    }
}
