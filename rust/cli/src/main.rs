use common::{clap::Parser, eyre::Result, tokio};

use cli::{errors, logging, Cli};

/// Main entry function
#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    errors::setup()?;
    logging::setup(
        cli.log_level,
        &cli.log_filter,
        cli.log_handler,
        cli.log_source,
        cli.log_timestamp,
        cli.log_force_color,
    )?;

    let code = cli.run().await?;
    if code != 0 {
        std::process::exit(code);
    }

    Ok(())
}
