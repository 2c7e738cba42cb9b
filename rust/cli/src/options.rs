use std::sync::Arc;
use std::time::Duration;

use common::{
    clap::{self, Args, ValueEnum},
    eyre::{bail, Result},
};
use context::Context;
use host::{Agent, Docker, Host, Local, Logging, Ssh, SshConfig, Sudo};
use store::Store;

/// Which host a command operates on; exactly one target is required
#[derive(Debug, Args)]
#[group(id = "host_target", required = true, multiple = false)]
pub struct HostTarget {
    /// Target a remote host over SSH: `[user[;fingerprint=FP]@]host[:port]`
    #[arg(long, env = "RESONANCE_HOST_SSH")]
    pub host_ssh: Option<String>,

    /// Target a running container: `[name|uid[:group|gid]@]container`
    #[arg(long, env = "RESONANCE_HOST_DOCKER")]
    pub host_docker: Option<String>,

    /// Target the local machine
    #[arg(long, env = "RESONANCE_HOST_LOCAL")]
    pub host_local: bool,
}

/// Host selection and connection options shared by every subcommand
#[derive(Debug, Args)]
pub struct HostOptions {
    #[command(flatten)]
    pub target: HostTarget,

    /// Elevate every operation on the target with sudo
    #[arg(long, env = "RESONANCE_HOST_SUDO")]
    pub host_sudo: bool,

    /// Maximum number of concurrent host operations
    ///
    /// Defaults to the detected CPU count.
    #[arg(long, env = "RESONANCE_HOST_MAX_CONCURRENCY")]
    pub host_max_concurrency: Option<usize>,

    /// Do not deploy the agent to remote targets
    ///
    /// Every operation then execs over the base transport, which is much
    /// slower but requires no embedded agent binary for the target's
    /// platform.
    #[arg(long, env = "RESONANCE_HOST_NO_AGENT")]
    pub host_no_agent: bool,

    /// TCP connect timeout for SSH, in seconds
    #[arg(long, default_value_t = 30, env = "RESONANCE_SSH_CONNECT_TIMEOUT")]
    pub ssh_connect_timeout: u64,

    /// Bytes on an SSH connection before a rekey is forced
    #[arg(long, default_value_t = 1 << 30, env = "RESONANCE_SSH_REKEY_DATA_LIMIT")]
    pub ssh_rekey_data_limit: usize,

    /// SSH key exchange algorithms to offer, in preference order
    #[arg(long, value_delimiter = ',', env = "RESONANCE_SSH_KEX")]
    pub ssh_kex: Vec<String>,

    /// SSH ciphers to offer, in preference order
    #[arg(long, value_delimiter = ',', env = "RESONANCE_SSH_CIPHERS")]
    pub ssh_ciphers: Vec<String>,

    /// SSH MACs to offer, in preference order
    #[arg(long, value_delimiter = ',', env = "RESONANCE_SSH_MACS")]
    pub ssh_macs: Vec<String>,

    /// SSH host key algorithms to accept, in preference order
    #[arg(long, value_delimiter = ',', env = "RESONANCE_SSH_HOST_KEY_ALGORITHMS")]
    pub ssh_host_key_algorithms: Vec<String>,

    /// Private key file for SSH authentication
    ///
    /// When not given, the SSH agent and the usual `~/.ssh` identities are
    /// tried.
    #[arg(long, env = "RESONANCE_SSH_KEY_FILE")]
    pub ssh_key_file: Option<std::path::PathBuf>,
}

impl HostOptions {
    /// A fresh context with the configured concurrency bound
    pub fn context(&self) -> Context {
        Context::new(self.host_max_concurrency)
    }

    fn ssh_config(&self) -> SshConfig {
        SshConfig {
            connect_timeout: Duration::from_secs(self.ssh_connect_timeout),
            rekey_data_limit: self.ssh_rekey_data_limit,
            kex: self.ssh_kex.clone(),
            ciphers: self.ssh_ciphers.clone(),
            macs: self.ssh_macs.clone(),
            host_key_algorithms: self.ssh_host_key_algorithms.clone(),
            key_file: self.ssh_key_file.clone(),
            password: None,
        }
    }

    /// Connect to the selected target, applying the sudo, agent, and
    /// logging wrappers
    ///
    /// The caller owns the host and must close it on all exit paths.
    pub async fn connect(&self, ctx: &Context) -> Result<Arc<dyn Host>> {
        let mut base: Arc<dyn Host> = if let Some(address) = &self.target.host_ssh {
            Arc::new(Ssh::connect(ctx, address, self.ssh_config()).await?)
        } else if let Some(container) = &self.target.host_docker {
            Arc::new(Docker::new(container)?)
        } else if self.target.host_local {
            Arc::new(Local::new())
        } else {
            bail!("one of --host-ssh, --host-docker or --host-local is required");
        };

        if self.host_sudo {
            base = Arc::new(Sudo::new(base));
        }

        // The throughput win for remote targets: one long-lived process
        // instead of an exec per operation
        if base.type_name() != "local" && !self.host_no_agent {
            base = Arc::new(Agent::connect(ctx, base.clone()).await?);
        }

        Ok(Arc::new(Logging::new(base)))
    }
}

/// Where the persistent state lives
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StoreChoice {
    /// On the target host itself
    Target,
    /// On the machine running resonance
    Local,
}

/// Store selection options shared by the state-touching subcommands
#[derive(Debug, Args)]
pub struct StoreOptions {
    /// Which machine holds the persistent state
    #[arg(long, default_value = "target", env = "RESONANCE_STORE")]
    pub store: StoreChoice,

    /// State root when the store is on the target
    #[arg(
        long,
        default_value = "/var/lib/resonance/state",
        env = "RESONANCE_STORE_TARGET_PATH"
    )]
    pub store_target_path: String,

    /// State root when the store is local; defaults to
    /// `~/.local/state/resonance`
    #[arg(long, env = "RESONANCE_STORE_LOCAL_PATH")]
    pub store_local_path: Option<String>,
}

impl StoreOptions {
    /// Build the store against the target host or the local machine
    pub fn build(&self, target_host: Arc<dyn Host>) -> Result<Store> {
        Ok(match self.store {
            StoreChoice::Target => Store::new(target_host, &self.store_target_path),
            StoreChoice::Local => {
                let root = match &self.store_local_path {
                    Some(root) => root.clone(),
                    None => {
                        let home = std::env::var("HOME")
                            .map_err(|_| common::eyre::eyre!("HOME is not set"))?;
                        format!("{home}/.local/state/resonance")
                    }
                };
                Store::new(Arc::new(Local::new()), root)
            }
        })
    }
}
