//! File and lookup operations implemented with small helper command
//! invocations, for host variants that can only exec (SSH channels,
//! `docker exec`, the elevated side of sudo).

use context::Context;
use protocol::{FileMetadata, FileType, Group, User};

use crate::{bytes_reader, read_all, Cmd, FileReader, Host, HostError};

/// Map a failed helper invocation onto the error taxonomy
fn classify(stderr: &str) -> HostError {
    if stderr.contains("No such file or directory") {
        HostError::NotFound
    } else if stderr.contains("Permission denied") || stderr.contains("Operation not permitted") {
        HostError::PermissionDenied
    } else {
        HostError::Io(stderr.trim().to_string())
    }
}

pub(crate) async fn read_file(
    host: &dyn Host,
    ctx: &Context,
    path: &str,
) -> Result<FileReader, HostError> {
    let output = host.run(ctx, &Cmd::new("cat").arg("--").arg(path)).await?;
    if output.success() {
        Ok(bytes_reader(output.stdout))
    } else {
        Err(classify(&output.stderr_string()))
    }
}

pub(crate) async fn write_file(
    host: &dyn Host,
    ctx: &Context,
    path: &str,
    contents: FileReader,
    mode: u32,
) -> Result<(), HostError> {
    let bytes = read_all(contents).await?;
    let script = format!("umask 077 && cat > \"$1\" && chmod {mode:o} \"$1\"");
    let output = host
        .run(
            ctx,
            &Cmd::new("sh")
                .arg("-c")
                .arg(script)
                .arg("sh")
                .arg(path)
                .stdin(bytes),
        )
        .await?;
    if output.success() {
        Ok(())
    } else {
        Err(classify(&output.stderr_string()))
    }
}

pub(crate) async fn lstat(
    host: &dyn Host,
    ctx: &Context,
    path: &str,
) -> Result<Option<FileMetadata>, HostError> {
    let output = host
        .run(
            ctx,
            &Cmd::new("stat").arg("-c").arg("%f:%s:%u:%g").arg("--").arg(path),
        )
        .await?;
    if !output.success() {
        let stderr = output.stderr_string();
        return match classify(&stderr) {
            HostError::NotFound => Ok(None),
            error => Err(error),
        };
    }

    let line = output.stdout_string();
    let mut fields = line.trim().split(':');
    let raw_mode = fields
        .next()
        .and_then(|field| u32::from_str_radix(field, 16).ok());
    let size = fields.next().and_then(|field| field.parse::<u64>().ok());
    let uid = fields.next().and_then(|field| field.parse::<u32>().ok());
    let gid = fields.next().and_then(|field| field.parse::<u32>().ok());
    let (Some(raw_mode), Some(size), Some(uid), Some(gid)) = (raw_mode, size, uid, gid) else {
        return Err(HostError::Io(format!("unparseable stat output: {line:?}")));
    };

    let file_type = match raw_mode & 0o170000 {
        0o100000 => FileType::Regular,
        0o040000 => FileType::Directory,
        0o120000 => FileType::Symlink,
        0o010000 => FileType::Fifo,
        0o140000 => FileType::Socket,
        0o020000 => FileType::CharDevice,
        0o060000 => FileType::BlockDevice,
        other => {
            return Err(HostError::Io(format!("unknown file type bits {other:o}")));
        }
    };

    Ok(Some(FileMetadata {
        file_type,
        mode: raw_mode & 0o7777,
        size,
        uid,
        gid,
    }))
}

pub(crate) async fn remove(host: &dyn Host, ctx: &Context, path: &str) -> Result<(), HostError> {
    let metadata = lstat(host, ctx, path).await?.ok_or(HostError::NotFound)?;
    let cmd = if metadata.file_type == FileType::Directory {
        Cmd::new("rmdir").arg("--").arg(path)
    } else {
        Cmd::new("rm").arg("--").arg(path)
    };
    let output = host.run(ctx, &cmd).await?;
    if output.success() {
        Ok(())
    } else {
        Err(classify(&output.stderr_string()))
    }
}

pub(crate) async fn mkdir_all(
    host: &dyn Host,
    ctx: &Context,
    path: &str,
    mode: u32,
) -> Result<(), HostError> {
    let script = format!("mkdir -p -m {mode:o} \"$1\" && chmod {mode:o} \"$1\"");
    let output = host
        .run(ctx, &Cmd::new("sh").arg("-c").arg(script).arg("sh").arg(path))
        .await?;
    if output.success() {
        Ok(())
    } else {
        Err(classify(&output.stderr_string()))
    }
}

pub(crate) async fn lookup_user(
    host: &dyn Host,
    ctx: &Context,
    name: &str,
) -> Result<Option<User>, HostError> {
    let output = host
        .run(ctx, &Cmd::new("getent").arg("passwd").arg(name))
        .await?;
    // getent exits 2 when the key is not found
    if output.exit.code == Some(2) {
        return Ok(None);
    }
    if !output.success() {
        return Err(classify(&output.stderr_string()));
    }

    let line = output.stdout_string();
    let fields: Vec<&str> = line.trim().split(':').collect();
    let (Some(name), Some(uid), Some(gid), Some(home)) = (
        fields.first(),
        fields.get(2).and_then(|field| field.parse::<u32>().ok()),
        fields.get(3).and_then(|field| field.parse::<u32>().ok()),
        fields.get(5),
    ) else {
        return Err(HostError::Io(format!(
            "unparseable passwd entry: {line:?}"
        )));
    };

    Ok(Some(User {
        name: (*name).to_string(),
        uid,
        gid,
        home: (*home).to_string(),
    }))
}

pub(crate) async fn lookup_group(
    host: &dyn Host,
    ctx: &Context,
    name: &str,
) -> Result<Option<Group>, HostError> {
    let output = host
        .run(ctx, &Cmd::new("getent").arg("group").arg(name))
        .await?;
    if output.exit.code == Some(2) {
        return Ok(None);
    }
    if !output.success() {
        return Err(classify(&output.stderr_string()));
    }

    let line = output.stdout_string();
    let fields: Vec<&str> = line.trim().split(':').collect();
    let (Some(name), Some(gid)) = (
        fields.first(),
        fields.get(2).and_then(|field| field.parse::<u32>().ok()),
    ) else {
        return Err(HostError::Io(format!("unparseable group entry: {line:?}")));
    };

    Ok(Some(Group {
        name: (*name).to_string(),
        gid,
    }))
}
