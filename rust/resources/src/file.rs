//! The `File` resource: one regular file's content, permissions, and
//! ownership, or its absence.

use common::{
    async_trait::async_trait,
    eyre::{bail, eyre, Result},
    serde::{Deserialize, Serialize},
    serde_yaml::{self, Value},
};
use context::Context;
use host::{bytes_reader, read_all, Cmd, FileType, Host, HostError};

use crate::{registry::SingleProvider, Resource};

fn is_false(value: &bool) -> bool {
    !*value
}

/// Desired or observed state of one file
///
/// Optional fields left unset are unconstrained. `user`/`group` names are
/// resolved to `uid`/`gid` before planning, so persisted and diffed states
/// always carry numeric ownership.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, crate = "common::serde")]
pub struct FileState {
    pub path: String,

    /// Content of the regular file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub regular_file: Option<String>,

    /// Permission bits as a four-digit octal string, e.g. `"0644"`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gid: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group: Option<String>,

    /// Ensure the file does not exist
    #[serde(default, skip_serializing_if = "is_false")]
    pub absent: bool,
}

impl FileState {
    fn into_resource(self) -> Result<Resource> {
        let id = self.path.clone();
        let state = serde_yaml::to_value(&self)?;
        Ok(Resource::new("File", id, state))
    }

    fn from_resource(resource: &Resource) -> Result<Self> {
        Ok(serde_yaml::from_value(resource.state().clone())?)
    }

    fn parsed_mode(&self) -> Result<Option<u32>> {
        match &self.mode {
            None => Ok(None),
            Some(mode) => {
                let bits = u32::from_str_radix(mode, 8)
                    .map_err(|_| eyre!("mode is not octal: {mode:?}"))?;
                if bits > 0o7777 {
                    bail!("mode out of range: {mode:?}");
                }
                Ok(Some(bits))
            }
        }
    }
}

/// The `File` single-resource type
pub struct FileProvider;

#[async_trait]
impl SingleProvider for FileProvider {
    fn type_name(&self) -> &'static str {
        "File"
    }

    fn decode(&self, state: Value) -> Result<Resource> {
        let state: FileState = serde_yaml::from_value(state)?;
        if state.path.is_empty() {
            bail!("File requires a path");
        }
        state.into_resource()
    }

    fn validate(&self, resource: &Resource) -> Result<()> {
        let state = FileState::from_resource(resource)?;
        if !state.path.starts_with('/') {
            bail!("File path must be absolute: {:?}", state.path);
        }
        state.parsed_mode()?;
        if state.absent {
            let constrained = state.regular_file.is_some()
                || state.mode.is_some()
                || state.uid.is_some()
                || state.user.is_some()
                || state.gid.is_some()
                || state.group.is_some();
            if constrained {
                bail!("File {:?} is absent but constrains other fields", state.path);
            }
        } else if state.regular_file.is_none() {
            bail!("File {:?} requires regular_file content", state.path);
        }
        if state.uid.is_some() && state.user.is_some() {
            bail!("File {:?} sets both uid and user", state.path);
        }
        if state.gid.is_some() && state.group.is_some() {
            bail!("File {:?} sets both gid and group", state.path);
        }
        Ok(())
    }

    async fn resolve(
        &self,
        ctx: &Context,
        host: &dyn Host,
        resource: &Resource,
    ) -> Result<Resource> {
        let mut state = FileState::from_resource(resource)?;

        if let Some(user) = state.user.take() {
            let entry = host
                .lookup_user(ctx, &user)
                .await?
                .ok_or_else(|| eyre!("user {user:?} not found on {host}"))?;
            state.uid = Some(entry.uid);
        }
        if let Some(group) = state.group.take() {
            let entry = host
                .lookup_group(ctx, &group)
                .await?
                .ok_or_else(|| eyre!("group {group:?} not found on {host}"))?;
            state.gid = Some(entry.gid);
        }

        state.into_resource()
    }

    async fn load(&self, ctx: &Context, host: &dyn Host, resource: &Resource) -> Result<Resource> {
        let desired = FileState::from_resource(resource)?;
        let path = desired.path;

        let Some(metadata) = host.lstat(ctx, &path).await? else {
            return FileState {
                path,
                absent: true,
                ..Default::default()
            }
            .into_resource();
        };

        if metadata.file_type != FileType::Regular {
            bail!(
                "{path:?} on {host} is a {:?}, not a regular file",
                metadata.file_type
            );
        }

        let contents = read_all(host.read_file(ctx, &path).await?).await?;
        FileState {
            path,
            regular_file: Some(String::from_utf8_lossy(&contents).into_owned()),
            mode: Some(format!("{:04o}", metadata.mode)),
            uid: Some(metadata.uid),
            gid: Some(metadata.gid),
            ..Default::default()
        }
        .into_resource()
    }

    async fn apply(&self, ctx: &Context, host: &dyn Host, resource: &Resource) -> Result<()> {
        let state = FileState::from_resource(resource)?;

        if state.absent {
            return match host.remove(ctx, &state.path).await {
                Ok(()) | Err(HostError::NotFound) => Ok(()),
                Err(error) => Err(error.into()),
            };
        }

        if state.user.is_some() || state.group.is_some() {
            bail!("File {:?} has unresolved user/group names", state.path);
        }

        let contents = state.regular_file.clone().unwrap_or_default();
        let mode = state.parsed_mode()?.unwrap_or(0o644);
        host.write_file(ctx, &state.path, bytes_reader(contents.into_bytes()), mode)
            .await?;

        if state.uid.is_some() || state.gid.is_some() {
            let owner = format!(
                "{}:{}",
                state.uid.map(|uid| uid.to_string()).unwrap_or_default(),
                state.gid.map(|gid| gid.to_string()).unwrap_or_default(),
            );
            let owner = owner.trim_end_matches(':').to_string();
            let output = host
                .run(ctx, &Cmd::new("chown").arg(owner).arg("--").arg(&state.path))
                .await?;
            if !output.success() {
                bail!(
                    "chown of {:?} failed: {}",
                    state.path,
                    output.stderr_string().trim()
                );
            }
        }

        Ok(())
    }
}
