use std::path::PathBuf;

use common::{
    clap::{self, Args},
    eyre::Result,
    tracing,
};

use crate::{
    declarations,
    options::{HostOptions, StoreOptions},
    outputs,
};

/// Show the changes an apply would make, without committing anything
#[derive(Debug, Args)]
pub struct Cli {
    /// A declarations file, or a directory of them
    pub path: PathBuf,

    #[command(flatten)]
    pub host: HostOptions,

    #[command(flatten)]
    pub store: StoreOptions,
}

impl Cli {
    #[tracing::instrument(skip(self))]
    pub async fn run(self) -> Result<()> {
        let ctx = self.host.context();
        let declared = declarations::load(&self.path).await?;

        let host = self.host.connect(&ctx).await?;
        let result = async {
            let store = self.store.build(host.clone())?;
            engine::plan_preview(&ctx, host.as_ref(), &store, declared).await
        }
        .await;
        host.close(&ctx).await?;

        let plan = result?;
        if plan.noop() {
            outputs::stdout("No changes: the host already matches the target\n")?;
        } else {
            outputs::stdout(&format!(
                "{plan}\n{} change(s) would be applied\n",
                plan.change_count()
            ))?;
        }

        Ok(())
    }
}
