use common::{
    clap::{self, Parser, Subcommand},
    eyre::Result,
    tracing,
};
use version::RESONANCE_VERSION;

use crate::{
    apply, inspect,
    logging::{LoggingFormat, LoggingLevel},
    plan_cmd, run, validate,
};

/// CLI subcommands and global options
#[derive(Debug, Parser)]
#[command(
    name = "resonance",
    author,
    version = RESONANCE_VERSION,
    about = "Declarative host configuration with plan/apply and persistent state",
    styles = Cli::styles()
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Command,

    /// The minimum log level to output
    #[arg(long, default_value = "info", env = "RESONANCE_LOG_LEVEL", global = true)]
    pub log_level: LoggingLevel,

    /// A filter for log entries emitted by other crates
    ///
    /// To additionally see lower level entries for a specific crate use
    /// syntax such as `russh=debug`.
    #[arg(
        long,
        default_value = "russh=warn,tokio=info",
        env = "RESONANCE_LOG_FILTER",
        global = true
    )]
    pub log_filter: String,

    /// The log handler to output entries with
    ///
    /// When `auto`, uses `simple` for terminals and `json` for non-TTY
    /// devices.
    #[arg(
        long,
        default_value = "auto",
        env = "RESONANCE_LOG_HANDLER",
        global = true
    )]
    pub log_handler: LoggingFormat,

    /// Include the source file and line of each log entry
    #[arg(long, env = "RESONANCE_LOG_SOURCE", global = true)]
    pub log_source: bool,

    /// Include a timestamp on each log entry
    #[arg(long, env = "RESONANCE_LOG_TIMESTAMP", global = true)]
    pub log_timestamp: bool,

    /// Color log output even when stderr is not a terminal
    #[arg(long, env = "RESONANCE_LOG_FORCE_COLOR", global = true)]
    pub log_force_color: bool,
}

impl Cli {
    pub fn styles() -> clap::builder::Styles {
        use clap::builder::styling::*;
        Styles::styled()
            .header(AnsiColor::Blue.on_default().bold())
            .usage(AnsiColor::Cyan.on_default())
            .literal(AnsiColor::Cyan.on_default())
            .valid(AnsiColor::Green.on_default())
            .invalid(AnsiColor::Yellow.on_default())
            .error(AnsiColor::Red.on_default().bold())
            .placeholder(AnsiColor::Green.on_default())
    }
}

#[derive(Debug, Subcommand)]
pub enum Command {
    Apply(apply::Cli),
    Plan(plan_cmd::Cli),
    Validate(validate::Cli),
    Inspect(inspect::Cli),
    Run(run::Cli),
}

impl Cli {
    /// Run the CLI command, returning the process exit code
    ///
    /// This function mainly exists to have a top level, instrumented
    /// function to call after error reporting and logging have been set up,
    /// so CLI arguments are captured in span traces.
    #[tracing::instrument(skip(self))]
    pub async fn run(self) -> Result<i32> {
        tracing::trace!("Running CLI command");

        match self.command {
            Command::Apply(apply) => apply.run().await?,
            Command::Plan(plan) => plan.run().await?,
            Command::Validate(validate) => validate.run().await?,
            Command::Inspect(inspect) => inspect.run().await?,
            Command::Run(run) => return run.run().await,
        }

        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use common::clap::CommandFactory;

    use super::*;

    #[test]
    fn arguments_parse() {
        Cli::command().debug_assert();
    }

    #[test]
    fn target_flags_are_required_and_exclusive() {
        // No target
        assert!(Cli::try_parse_from(["resonance", "run", "--", "true"]).is_err());
        // One target
        assert!(
            Cli::try_parse_from(["resonance", "run", "--host-local", "--", "true"]).is_ok()
        );
        // Two targets
        assert!(Cli::try_parse_from([
            "resonance",
            "run",
            "--host-local",
            "--host-ssh",
            "example.com",
            "--",
            "true"
        ])
        .is_err());
    }
}
