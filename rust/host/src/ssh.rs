//! Host operations over SSH.
//!
//! Commands run on exec channels of one multiplexed connection; file and
//! lookup operations go through helper invocations ([`crate::cmdfs`]), since
//! in practice this host is wrapped by [`crate::Agent`] which serves them
//! over its own protocol. Host key verification fails closed: the key must
//! be pinned via the address's `fingerprint=` parameter or present in
//! `known_hosts`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use common::{
    async_trait::async_trait,
    futures::FutureExt,
    tokio::{
        self,
        io::{AsyncReadExt, AsyncWriteExt},
        sync::{oneshot, Mutex},
    },
};
use context::Context;
use protocol::{ExitStatus, FileMetadata, Group, User};
use russh::{client, ChannelMsg, Disconnect, Sig};
use russh_keys::key;

use crate::{cmdfs, Child, Cmd, FileReader, Host, HostError};

/// SSH connection parameters beyond the address itself
///
/// Empty algorithm lists mean the library defaults.
#[derive(Debug, Clone)]
pub struct SshConfig {
    pub connect_timeout: Duration,
    /// Bytes in either direction before a rekey is forced
    pub rekey_data_limit: usize,
    pub kex: Vec<String>,
    pub ciphers: Vec<String>,
    pub macs: Vec<String>,
    pub host_key_algorithms: Vec<String>,
    /// Explicit private key file; otherwise the SSH agent and the usual
    /// `~/.ssh` identities are tried
    pub key_file: Option<PathBuf>,
    pub password: Option<String>,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            rekey_data_limit: 1 << 30,
            kex: Vec::new(),
            ciphers: Vec::new(),
            macs: Vec::new(),
            host_key_algorithms: Vec::new(),
            key_file: None,
            password: None,
        }
    }
}

/// The parsed form of `[user[;fingerprint=FP]@]host[:port]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshAddress {
    pub user: String,
    pub fingerprint: Option<String>,
    pub hostname: String,
    pub port: u16,
}

impl SshAddress {
    pub fn parse(address: &str) -> Result<Self, HostError> {
        let (userinfo, hostport) = match address.rsplit_once('@') {
            Some((userinfo, hostport)) => (Some(userinfo), hostport),
            None => (None, address),
        };

        let (mut user, mut fingerprint) = (None, None);
        if let Some(userinfo) = userinfo {
            let mut parts = userinfo.split(';');
            user = parts.next().filter(|part| !part.is_empty()).map(String::from);
            for part in parts {
                match part.split_once('=') {
                    Some(("fingerprint", value)) => fingerprint = Some(value.to_string()),
                    _ => {
                        return Err(HostError::Io(format!(
                            "unknown parameter in ssh address: {part:?}"
                        )))
                    }
                }
            }
        }

        let (hostname, port) = match hostport.rsplit_once(':') {
            Some((hostname, port)) => (
                hostname.to_string(),
                port.parse::<u16>()
                    .map_err(|_| HostError::Io(format!("bad ssh port: {port:?}")))?,
            ),
            None => (hostport.to_string(), 22),
        };
        if hostname.is_empty() {
            return Err(HostError::Io(format!("empty hostname in {address:?}")));
        }

        let user = user
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_else(|| "root".to_string());

        Ok(Self {
            user,
            fingerprint,
            hostname,
            port,
        })
    }
}

struct ServerKeyCheck {
    hostname: String,
    port: u16,
    fingerprint: Option<String>,
}

#[async_trait]
impl client::Handler for ServerKeyCheck {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &key::PublicKey,
    ) -> Result<bool, Self::Error> {
        if let Some(pinned) = &self.fingerprint {
            let fingerprint = server_public_key.fingerprint();
            let pinned = pinned.trim_start_matches("SHA256:");
            return Ok(pinned == fingerprint);
        }
        // Fail closed: only a known_hosts match is accepted
        Ok(matches!(
            russh_keys::check_known_hosts(&self.hostname, self.port, server_public_key),
            Ok(true)
        ))
    }
}

/// A remote machine over SSH
pub struct Ssh {
    address: SshAddress,
    handle: Mutex<Option<client::Handle<ServerKeyCheck>>>,
}

impl Ssh {
    /// Connect, verify the host key, and authenticate
    pub async fn connect(
        ctx: &Context,
        address: &str,
        config: SshConfig,
    ) -> Result<Self, HostError> {
        ctx.check()?;
        let address = SshAddress::parse(address)?;

        let mut preferred = russh::Preferred::default();
        preferred.kex = preferred_names(&config.kex, preferred.kex.clone(), parse_kex)?;
        preferred.key =
            preferred_names(&config.host_key_algorithms, preferred.key.clone(), parse_key)?;
        preferred.cipher = preferred_names(&config.ciphers, preferred.cipher.clone(), parse_cipher)?;
        preferred.mac = preferred_names(&config.macs, preferred.mac.clone(), parse_mac)?;
        let mut limits = russh::Limits::default();
        limits.rekey_write_limit = config.rekey_data_limit;
        limits.rekey_read_limit = config.rekey_data_limit;

        let mut ssh_config = client::Config::default();
        ssh_config.preferred = preferred;
        ssh_config.limits = limits;
        let ssh_config = Arc::new(ssh_config);

        let handler = ServerKeyCheck {
            hostname: address.hostname.clone(),
            port: address.port,
            fingerprint: address.fingerprint.clone(),
        };

        let connect = client::connect(
            ssh_config,
            (address.hostname.as_str(), address.port),
            handler,
        );
        let mut handle = tokio::select! {
            connected = tokio::time::timeout(config.connect_timeout, connect) => connected
                .map_err(|_| HostError::Io(format!(
                    "timed out connecting to {}:{}",
                    address.hostname, address.port
                )))?
                .map_err(|error| HostError::Io(error.to_string()))?,
            _ = ctx.cancelled() => return Err(HostError::Cancelled),
        };

        authenticate(&mut handle, &address.user, &config).await?;

        Ok(Self {
            address,
            handle: Mutex::new(Some(handle)),
        })
    }
}

impl std::fmt::Display for Ssh {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ssh://{}@{}:{}",
            self.address.user, self.address.hostname, self.address.port
        )
    }
}

async fn authenticate(
    handle: &mut client::Handle<ServerKeyCheck>,
    user: &str,
    config: &SshConfig,
) -> Result<(), HostError> {
    // An explicit key file wins
    if let Some(key_file) = &config.key_file {
        let pair = russh_keys::load_secret_key(key_file, None)
            .map_err(|error| HostError::Io(format!("loading {}: {error}", key_file.display())))?;
        if handle
            .authenticate_publickey(user, Arc::new(pair))
            .await
            .map_err(|error| HostError::Io(error.to_string()))?
        {
            return Ok(());
        }
        return Err(HostError::PermissionDenied);
    }

    // Then any identities the SSH agent offers
    if let Ok(mut agent) = russh_keys::agent::client::AgentClient::connect_env().await {
        if let Ok(identities) = agent.request_identities().await {
            let mut agent = agent;
            for identity in identities {
                let (returned, result) = handle.authenticate_future(user, identity, agent).await;
                agent = returned;
                if matches!(result, Ok(true)) {
                    return Ok(());
                }
            }
        }
    }

    // Then the usual key files
    if let Ok(home) = std::env::var("HOME") {
        for name in ["id_ed25519", "id_ecdsa", "id_rsa"] {
            let path = PathBuf::from(&home).join(".ssh").join(name);
            if !path.exists() {
                continue;
            }
            if let Ok(pair) = russh_keys::load_secret_key(&path, None) {
                if handle
                    .authenticate_publickey(user, Arc::new(pair))
                    .await
                    .map_err(|error| HostError::Io(error.to_string()))?
                {
                    return Ok(());
                }
            }
        }
    }

    // Last resort, password when configured
    if let Some(password) = &config.password {
        if handle
            .authenticate_password(user, password)
            .await
            .map_err(|error| HostError::Io(error.to_string()))?
        {
            return Ok(());
        }
    }

    Err(HostError::PermissionDenied)
}

fn preferred_names<N: Clone>(
    requested: &[String],
    default: std::borrow::Cow<'static, [N]>,
    parse: fn(&str) -> Result<N, HostError>,
) -> Result<std::borrow::Cow<'static, [N]>, HostError> {
    if requested.is_empty() {
        return Ok(default);
    }
    let names = requested
        .iter()
        .map(|name| parse(name))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(std::borrow::Cow::Owned(names))
}

fn parse_kex(name: &str) -> Result<russh::kex::Name, HostError> {
    use russh::kex;
    Ok(match name {
        "curve25519-sha256" => kex::CURVE25519,
        "curve25519-sha256@libssh.org" => kex::CURVE25519_PRE_RFC_8731,
        "diffie-hellman-group14-sha256" => kex::DH_G14_SHA256,
        "diffie-hellman-group16-sha512" => kex::DH_G16_SHA512,
        "diffie-hellman-group14-sha1" => kex::DH_G14_SHA1,
        _ => return Err(HostError::Io(format!("unknown key exchange: {name}"))),
    })
}

fn parse_cipher(name: &str) -> Result<russh::cipher::Name, HostError> {
    use russh::cipher;
    Ok(match name {
        "chacha20-poly1305@openssh.com" => cipher::CHACHA20_POLY1305,
        "aes256-gcm@openssh.com" => cipher::AES_256_GCM,
        "aes256-ctr" => cipher::AES_256_CTR,
        "aes192-ctr" => cipher::AES_192_CTR,
        "aes128-ctr" => cipher::AES_128_CTR,
        _ => return Err(HostError::Io(format!("unknown cipher: {name}"))),
    })
}

fn parse_mac(name: &str) -> Result<russh::mac::Name, HostError> {
    use russh::mac;
    Ok(match name {
        "hmac-sha2-256" => mac::HMAC_SHA256,
        "hmac-sha2-512" => mac::HMAC_SHA512,
        "hmac-sha2-256-etm@openssh.com" => mac::HMAC_SHA256_ETM,
        "hmac-sha2-512-etm@openssh.com" => mac::HMAC_SHA512_ETM,
        "hmac-sha1" => mac::HMAC_SHA1,
        _ => return Err(HostError::Io(format!("unknown mac: {name}"))),
    })
}

fn parse_key(name: &str) -> Result<key::Name, HostError> {
    Ok(match name {
        "ssh-ed25519" => key::ED25519,
        "rsa-sha2-256" => key::RSA_SHA2_256,
        "rsa-sha2-512" => key::RSA_SHA2_512,
        "ecdsa-sha2-nistp256" => key::ECDSA_SHA2_NISTP256,
        _ => return Err(HostError::Io(format!("unknown host key algorithm: {name}"))),
    })
}

fn signal_number(signal: &Sig) -> i32 {
    match signal {
        Sig::HUP => 1,
        Sig::INT => 2,
        Sig::QUIT => 3,
        Sig::ILL => 4,
        Sig::ABRT => 6,
        Sig::FPE => 8,
        Sig::KILL => 9,
        Sig::SEGV => 11,
        Sig::PIPE => 13,
        Sig::ALRM => 14,
        Sig::TERM => 15,
        _ => 0,
    }
}

/// The remote command line for a [`Cmd`], since SSH exec requests go
/// through the login shell
fn remote_line(cmd: &Cmd) -> String {
    let mut line = String::new();
    if let Some(dir) = &cmd.dir {
        line.push_str(&format!("cd {} && ", crate::shell_quote(dir)));
    }
    if !cmd.env.is_empty() {
        line.push_str("env ");
        for (name, value) in &cmd.env {
            line.push_str(&crate::shell_quote(&format!("{name}={value}")));
            line.push(' ');
        }
    }
    line.push_str(&cmd.shell_line());
    line
}

#[async_trait]
impl Host for Ssh {
    fn type_name(&self) -> &'static str {
        "ssh"
    }

    async fn spawn(&self, ctx: &Context, cmd: &Cmd) -> Result<Child, HostError> {
        ctx.check()?;

        let mut channel = {
            let guard = self.handle.lock().await;
            let handle = guard
                .as_ref()
                .ok_or_else(|| HostError::Io("ssh connection is closed".to_string()))?;
            handle
                .channel_open_session()
                .await
                .map_err(|error| HostError::Io(error.to_string()))?
        };
        channel
            .exec(true, remote_line(cmd))
            .await
            .map_err(|error| HostError::Io(error.to_string()))?;

        let (stdin_writer, mut stdin_reader) = tokio::io::duplex(64 * 1024);
        let (mut stdout_writer, stdout_reader) = tokio::io::duplex(64 * 1024);
        let (mut stderr_writer, stderr_reader) = tokio::io::duplex(64 * 1024);
        let (exit_tx, exit_rx) = oneshot::channel();

        tokio::spawn(async move {
            enum Step {
                Stdin(usize),
                StdinClosed,
                Msg(Option<ChannelMsg>),
            }

            let mut buffer = vec![0u8; 32 * 1024];
            let mut stdin_open = true;
            let mut exit = None;
            loop {
                let step = tokio::select! {
                    read = stdin_reader.read(&mut buffer), if stdin_open => match read {
                        Ok(0) | Err(_) => Step::StdinClosed,
                        Ok(count) => Step::Stdin(count),
                    },
                    msg = channel.wait() => Step::Msg(msg),
                };
                match step {
                    Step::Stdin(count) => {
                        if channel.data(&buffer[..count]).await.is_err() {
                            stdin_open = false;
                        }
                    }
                    Step::StdinClosed => {
                        stdin_open = false;
                        let _ = channel.eof().await;
                    }
                    Step::Msg(Some(ChannelMsg::Data { data })) => {
                        let _ = stdout_writer.write_all(&data).await;
                    }
                    Step::Msg(Some(ChannelMsg::ExtendedData { data, ext: 1 })) => {
                        let _ = stderr_writer.write_all(&data).await;
                    }
                    Step::Msg(Some(ChannelMsg::ExitStatus { exit_status })) => {
                        exit.get_or_insert(ExitStatus::exited(exit_status as i32));
                    }
                    Step::Msg(Some(ChannelMsg::ExitSignal { signal_name, .. })) => {
                        exit.get_or_insert(ExitStatus::signalled(signal_number(&signal_name)));
                    }
                    Step::Msg(Some(_)) => {}
                    Step::Msg(None) => break,
                }
            }
            drop(stdout_writer);
            drop(stderr_writer);
            let _ = exit_tx.send(exit);
        });

        let wait = async move {
            match exit_rx.await {
                Ok(Some(exit)) => Ok(exit),
                Ok(None) | Err(_) => Err(HostError::Io(
                    "ssh channel closed without an exit status".to_string(),
                )),
            }
        }
        .boxed();

        Ok(Child::new(
            Some(Box::new(stdin_writer)),
            Some(Box::new(stdout_reader)),
            Some(Box::new(stderr_reader)),
            wait,
        ))
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
        if let Some(handle) = self.handle.lock().await.take() {
            let _ = handle
                .disconnect(Disconnect::ByApplication, "closing", "en")
                .await;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_addresses() -> Result<(), HostError> {
        let address = SshAddress::parse("deploy@example.com")?;
        assert_eq!(address.user, "deploy");
        assert_eq!(address.hostname, "example.com");
        assert_eq!(address.port, 22);
        assert_eq!(address.fingerprint, None);

        let address = SshAddress::parse("deploy;fingerprint=SHA256:abcdef@example.com:2222")?;
        assert_eq!(address.user, "deploy");
        assert_eq!(address.fingerprint.as_deref(), Some("SHA256:abcdef"));
        assert_eq!(address.port, 2222);

        let address = SshAddress::parse("example.com")?;
        assert_eq!(address.hostname, "example.com");

        assert!(SshAddress::parse("deploy@example.com:notaport").is_err());
        assert!(SshAddress::parse("deploy;color=red@example.com").is_err());
        assert!(SshAddress::parse("@").is_err());

        Ok(())
    }

    #[test]
    fn remote_lines_are_shell_safe() {
        let cmd = Cmd::new("/bin/echo").arg("hello world");
        assert_eq!(remote_line(&cmd), "/bin/echo 'hello world'");

        let cmd = Cmd::new("ls").env("LC_ALL", "C").dir("/tmp/some dir");
        assert_eq!(remote_line(&cmd), "cd '/tmp/some dir' && env LC_ALL=C ls");
    }

    #[test]
    fn unknown_algorithms_are_rejected() {
        assert!(parse_kex("curve25519-sha256").is_ok());
        assert!(parse_kex("des-cbc").is_err());
        assert!(parse_cipher("aes256-ctr").is_ok());
        assert!(parse_cipher("rc4").is_err());
        assert!(parse_mac("hmac-sha2-256").is_ok());
        assert!(parse_mac("md5").is_err());
        assert!(parse_key("ssh-ed25519").is_ok());
        assert!(parse_key("ssh-dss").is_err());
    }
}
