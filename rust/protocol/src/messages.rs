//! Typed request and response payloads carried by control frames.

use common::serde::{Deserialize, Serialize};

/// A request from the client to the agent
///
/// `Run` and `WriteFile` are followed by a data stream from the client
/// (stdin and file contents respectively), terminated by an end marker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case", crate = "common::serde")]
pub enum Request {
    Run {
        path: String,
        args: Vec<String>,
        env: Vec<(String, String)>,
        dir: Option<String>,
    },
    ReadFile {
        path: String,
    },
    WriteFile {
        path: String,
        mode: u32,
    },
    Lstat {
        path: String,
    },
    Remove {
        path: String,
    },
    MkdirAll {
        path: String,
        mode: u32,
    },
    LookupUser {
        name: String,
    },
    LookupGroup {
        name: String,
    },
    Close,
}

/// A response from the agent
///
/// `ReadFile` announces that a data stream follows; `Run` terminates the
/// stdout/stderr stream of a run. Everything else is a single frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case", crate = "common::serde")]
pub enum Response {
    Ok,
    Run { exit: ExitStatus },
    ReadFile,
    Lstat { metadata: Option<FileMetadata> },
    User { user: Option<User> },
    Group { group: Option<Group> },
    Error { kind: ErrorKind },
}

/// Structured error kinds the agent can report about an operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case", crate = "common::serde")]
pub enum ErrorKind {
    NotFound,
    PermissionDenied,
    Interrupted,
    Io { message: String },
    Protocol { message: String },
}

/// How a process exited
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(crate = "common::serde")]
pub struct ExitStatus {
    /// Exit code, when the process exited normally
    pub code: Option<i32>,
    /// Terminating signal, when it did not
    pub signal: Option<i32>,
}

impl ExitStatus {
    pub fn exited(code: i32) -> Self {
        Self {
            code: Some(code),
            signal: None,
        }
    }

    pub fn signalled(signal: i32) -> Self {
        Self {
            code: None,
            signal: Some(signal),
        }
    }

    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match (self.code, self.signal) {
            (Some(code), _) => write!(f, "exit status {code}"),
            (None, Some(signal)) => write!(f, "killed by signal {signal}"),
            (None, None) => write!(f, "unknown exit status"),
        }
    }
}

/// What a path points at
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", crate = "common::serde")]
pub enum FileType {
    Regular,
    Directory,
    Symlink,
    Fifo,
    Socket,
    CharDevice,
    BlockDevice,
}

/// Metadata from an `lstat`-equivalent, without following symlinks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(crate = "common::serde")]
pub struct FileMetadata {
    pub file_type: FileType,
    /// Permission bits only (no file type bits)
    pub mode: u32,
    pub size: u64,
    pub uid: u32,
    pub gid: u32,
}

/// A user database entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(crate = "common::serde")]
pub struct User {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub home: String,
}

/// A group database entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(crate = "common::serde")]
pub struct Group {
    pub name: String,
    pub gid: u32,
}

#[cfg(test)]
mod tests {
    use common::{eyre::Result, serde_json};

    use super::*;

    #[test]
    fn requests_round_trip_as_json() -> Result<()> {
        let request = Request::Run {
            path: "/bin/true".into(),
            args: vec!["--version".into()],
            env: vec![("LANG".into(), "C".into())],
            dir: None,
        };
        let json = serde_json::to_string(&request)?;
        assert!(json.contains(r#""op":"run""#));
        let back: Request = serde_json::from_str(&json)?;
        assert!(matches!(back, Request::Run { path, .. } if path == "/bin/true"));
        Ok(())
    }

    #[test]
    fn error_kinds_are_distinguished() -> Result<()> {
        let response = Response::Error {
            kind: ErrorKind::NotFound,
        };
        let json = serde_json::to_string(&response)?;
        let back: Response = serde_json::from_str(&json)?;
        assert!(matches!(
            back,
            Response::Error {
                kind: ErrorKind::NotFound
            }
        ));
        Ok(())
    }

    #[test]
    fn exit_status_display() {
        assert_eq!(ExitStatus::exited(2).to_string(), "exit status 2");
        assert_eq!(ExitStatus::signalled(9).to_string(), "killed by signal 9");
        assert!(ExitStatus::exited(0).success());
        assert!(!ExitStatus::signalled(15).success());
    }
}
