use std::path::PathBuf;

use common::{
    clap::{self, Args},
    eyre::Result,
    tracing,
};

use crate::{declarations, outputs};

/// Parse and validate declarations without touching any host
#[derive(Debug, Args)]
pub struct Cli {
    /// A declarations file, or a directory of them
    pub path: PathBuf,
}

impl Cli {
    #[tracing::instrument(skip(self))]
    pub async fn run(self) -> Result<()> {
        let blueprint = declarations::load(&self.path).await?;
        blueprint.validate()?;
        outputs::stdout(&format!(
            "Valid: {} resource(s) in {} step(s)\n",
            blueprint.len(),
            blueprint.steps().len()
        ))?;
        Ok(())
    }
}
