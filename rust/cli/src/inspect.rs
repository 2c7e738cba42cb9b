use std::path::PathBuf;

use common::{
    clap::{self, Args},
    eyre::Result,
    serde_yaml::{self, Mapping, Value},
    tracing,
};

use crate::{declarations, options::HostOptions, outputs};

/// Read the current state of declared resources from a host
#[derive(Debug, Args)]
pub struct Cli {
    /// A declarations file, or a directory of them
    pub path: PathBuf,

    #[command(flatten)]
    pub host: HostOptions,
}

impl Cli {
    #[tracing::instrument(skip(self))]
    pub async fn run(self) -> Result<()> {
        let ctx = self.host.context();
        let declared = declarations::load(&self.path).await?;

        let host = self.host.connect(&ctx).await?;
        let result = declared.load(&ctx, host.as_ref()).await;
        host.close(&ctx).await?;
        let observed = result?;

        // The same shape the declarations use: a sequence of
        // `{TypeName: state}` entries
        let documents: Vec<Value> = observed
            .resources()
            .map(|resource| {
                let mut entry = Mapping::new();
                entry.insert(
                    Value::String(resource.type_name().to_string()),
                    resource.state().clone(),
                );
                Value::Mapping(entry)
            })
            .collect();
        outputs::stdout(&serde_yaml::to_string(&documents)?)?;

        Ok(())
    }
}
