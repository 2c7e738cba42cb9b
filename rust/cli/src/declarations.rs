//! Loading declared resources from YAML files.
//!
//! A declarations file is a sequence of `{TypeName: state}` entries. A
//! directory is read as its `.yaml`/`.yml` files in lexicographic order,
//! concatenated into one declared list.

use std::path::Path;

use common::{
    eyre::{bail, Context as _, Result},
    serde_yaml::{self, Value},
    tokio::fs,
};
use blueprint::Blueprint;

/// Load and compile declarations from a file or directory
pub async fn load(path: &Path) -> Result<Blueprint> {
    let metadata = fs::metadata(path)
        .await
        .wrap_err_with(|| format!("reading declarations from {}", path.display()))?;

    let mut documents: Vec<Value> = Vec::new();
    if metadata.is_dir() {
        let mut files = Vec::new();
        let mut entries = fs::read_dir(path).await?;
        while let Some(entry) = entries.next_entry().await? {
            let entry_path = entry.path();
            let is_yaml = entry_path
                .extension()
                .and_then(|extension| extension.to_str())
                .is_some_and(|extension| matches!(extension, "yaml" | "yml"));
            if entry.file_type().await?.is_file() && is_yaml {
                files.push(entry_path);
            }
        }
        if files.is_empty() {
            bail!("no .yaml or .yml files in {}", path.display());
        }
        files.sort();
        for file in files {
            documents.extend(parse_file(&file).await?);
        }
    } else {
        documents.extend(parse_file(path).await?);
    }

    blueprint::compile_declarations(&documents)
}

async fn parse_file(path: &Path) -> Result<Vec<Value>> {
    let contents = fs::read_to_string(path)
        .await
        .wrap_err_with(|| format!("reading {}", path.display()))?;
    let documents: Vec<Value> = serde_yaml::from_str(&contents)
        .wrap_err_with(|| format!("parsing {}", path.display()))?;
    Ok(documents)
}
