//! APT packages: group-flavored, so that one `apt-get` transaction covers
//! every declared package and the solver sees the complete picture.

use std::collections::HashMap;

use common::{
    async_trait::async_trait,
    eyre::{bail, Result},
    once_cell::sync::Lazy,
    regex::Regex,
    serde::{Deserialize, Serialize},
    serde_yaml::{self, Value},
};
use context::Context;
use host::{Cmd, Host};

use crate::{registry::GroupProvider, Resource};

fn is_false(value: &bool) -> bool {
    !*value
}

static PACKAGE_NAME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z0-9][a-z0-9+.-]+$").expect("static regex"));

/// Desired or observed state of one APT package
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields, crate = "common::serde")]
pub struct AptPackageState {
    pub package: String,

    /// Exact version to hold; unset accepts any installed version
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Ensure the package is not installed
    #[serde(default, skip_serializing_if = "is_false")]
    pub absent: bool,
}

impl AptPackageState {
    fn into_resource(self) -> Result<Resource> {
        let id = self.package.clone();
        let state = serde_yaml::to_value(&self)?;
        Ok(Resource::new("APTPackage", id, state))
    }

    fn from_resource(resource: &Resource) -> Result<Self> {
        Ok(serde_yaml::from_value(resource.state().clone())?)
    }
}

/// The `APTPackages` group type coordinating `APTPackage` members
pub struct AptPackagesProvider;

/// One `apt-get install` argument per member: `pkg`, `pkg=version`, or
/// `pkg-` for removal
fn install_args(resources: &[Resource]) -> Result<Vec<String>> {
    resources
        .iter()
        .map(|resource| {
            let state = AptPackageState::from_resource(resource)?;
            Ok(if state.absent {
                format!("{}-", state.package)
            } else if let Some(version) = &state.version {
                format!("{}={version}", state.package)
            } else {
                state.package
            })
        })
        .collect()
}

/// Parse `dpkg-query -W` output into package name to installed version
fn parse_dpkg_query(stdout: &str) -> HashMap<String, String> {
    let mut installed = HashMap::new();
    for line in stdout.lines() {
        let mut fields = line.split('\t');
        let (Some(package), Some(version), Some(status)) =
            (fields.next(), fields.next(), fields.next())
        else {
            continue;
        };
        if status.trim() == "install ok installed" {
            installed.insert(package.to_string(), version.to_string());
        }
    }
    installed
}

#[async_trait]
impl GroupProvider for AptPackagesProvider {
    fn group_type_name(&self) -> &'static str {
        "APTPackages"
    }

    fn member_type_name(&self) -> &'static str {
        "APTPackage"
    }

    fn decode(&self, state: Value) -> Result<Resource> {
        let state: AptPackageState = serde_yaml::from_value(state)?;
        if state.package.is_empty() {
            bail!("APTPackage requires a package name");
        }
        state.into_resource()
    }

    fn validate(&self, resource: &Resource) -> Result<()> {
        let state = AptPackageState::from_resource(resource)?;
        if !PACKAGE_NAME.is_match(&state.package) {
            bail!("invalid APT package name {:?}", state.package);
        }
        if let Some(version) = &state.version {
            if version.is_empty() {
                bail!("empty version for APT package {:?}", state.package);
            }
            if state.absent {
                bail!(
                    "APT package {:?} is absent but pins a version",
                    state.package
                );
            }
        }
        Ok(())
    }

    async fn resolve(
        &self,
        _ctx: &Context,
        _host: &dyn Host,
        resources: Vec<Resource>,
    ) -> Result<Vec<Resource>> {
        // Nothing host-derived in package state
        Ok(resources)
    }

    async fn load(
        &self,
        ctx: &Context,
        host: &dyn Host,
        resources: &[Resource],
    ) -> Result<Vec<Resource>> {
        let mut cmd = Cmd::new("dpkg-query")
            .arg("-W")
            .arg("-f")
            .arg(r"${Package}\t${Version}\t${Status}\n");
        for resource in resources {
            cmd = cmd.arg(resource.id());
        }

        // Exits non-zero when any queried package is unknown; unknown is
        // just "not installed" here, so only the parsed stdout matters
        let output = host.run(ctx, &cmd).await?;
        let installed = parse_dpkg_query(&output.stdout_string());

        resources
            .iter()
            .map(|resource| {
                let package = resource.id().to_string();
                match installed.get(&package) {
                    Some(version) => AptPackageState {
                        package,
                        version: Some(version.clone()),
                        absent: false,
                    },
                    None => AptPackageState {
                        package,
                        version: None,
                        absent: true,
                    },
                }
                .into_resource()
            })
            .collect()
    }

    async fn apply(&self, ctx: &Context, host: &dyn Host, resources: &[Resource]) -> Result<()> {
        if resources.is_empty() {
            return Ok(());
        }

        let cmd = Cmd::new("apt-get")
            .arg("install")
            .arg("--yes")
            .args(install_args(resources)?)
            .env("DEBIAN_FRONTEND", "noninteractive");

        let output = host.run(ctx, &cmd).await?;
        if !output.success() {
            bail!(
                "apt-get install failed ({}): {}",
                output.exit,
                output.stderr_string().trim()
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use crate::decode;

    use super::*;

    fn package(yaml: &str) -> Resource {
        decode("APTPackage", serde_yaml::from_str(yaml).expect("yaml")).expect("decode")
    }

    #[test]
    fn validates_package_names_and_versions() {
        assert!(package("{package: curl}").validate().is_ok());
        assert!(package("{package: curl, version: 8.5.0-2}").validate().is_ok());
        assert!(package("{package: curl, absent: true}").validate().is_ok());

        assert!(package("{package: CURL}").validate().is_err());
        assert!(package("{package: curl, version: ''}").validate().is_err());
        assert!(package("{package: curl, version: '1.0', absent: true}")
            .validate()
            .is_err());
    }

    #[test]
    fn install_arguments_cover_all_intents() -> Result<()> {
        let resources = vec![
            package("{package: curl}"),
            package("{package: git, version: '1:2.43.0-1'}"),
            package("{package: nano, absent: true}"),
        ];
        assert_eq!(
            install_args(&resources)?,
            vec!["curl", "git=1:2.43.0-1", "nano-"]
        );
        Ok(())
    }

    #[test]
    fn parses_dpkg_query_output() {
        let stdout = "curl\t8.5.0-2\tinstall ok installed\n\
                      nano\t7.2-1\tdeinstall ok config-files\n\
                      mangled line\n";
        let installed = parse_dpkg_query(stdout);
        assert_eq!(installed.get("curl").map(String::as_str), Some("8.5.0-2"));
        assert!(!installed.contains_key("nano"));
    }

    #[test]
    fn observed_absent_satisfies_desired_absent() {
        let desired = package("{package: nano, absent: true}");
        let observed = package("{package: nano, absent: true}");
        assert!(observed.satisfies(&desired));

        let observed = package("{package: nano, version: '7.2-1'}");
        assert!(!observed.satisfies(&desired));
    }
}
