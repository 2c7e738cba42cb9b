use common::{
    clap::{self, Args},
    eyre::Result,
    tracing,
};
use host::Cmd;

use crate::{options::HostOptions, outputs};

/// Execute a command on the target host
///
/// Exits with the command's own exit code when it exited normally,
/// otherwise with 1.
#[derive(Debug, Args)]
pub struct Cli {
    #[command(flatten)]
    pub host: HostOptions,

    /// The command and its arguments, after `--`
    #[arg(last = true, required = true)]
    pub command: Vec<String>,
}

impl Cli {
    #[tracing::instrument(skip(self))]
    pub async fn run(self) -> Result<i32> {
        let ctx = self.host.context();

        let mut words = self.command.iter();
        let Some(path) = words.next() else {
            common::eyre::bail!("a command is required after --");
        };
        let cmd = Cmd::new(path).args(words.cloned());

        let host = self.host.connect(&ctx).await?;
        let result = host.run(&ctx, &cmd).await;
        host.close(&ctx).await?;
        let output = result?;

        outputs::stdout_bytes(&output.stdout)?;
        outputs::stderr_bytes(&output.stderr)?;

        Ok(output.exit.code.unwrap_or(1))
    }
}
