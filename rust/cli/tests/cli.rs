//! End-to-end runs through the command line layer against the local
//! machine and a tempdir-backed store.

use common::{clap::Parser, eyre::Result, tempfile, tokio};
use cli::Cli;

fn parse(args: &[&str]) -> Result<Cli> {
    Ok(Cli::try_parse_from(
        std::iter::once("resonance").chain(args.iter().copied()),
    )?)
}

#[tokio::test]
async fn validate_accepts_good_and_rejects_bad_declarations() -> Result<()> {
    let dir = tempfile::tempdir()?;

    let good = dir.path().join("good.yaml");
    tokio::fs::write(&good, "- File: {path: /etc/motd, regular_file: hi}\n").await?;
    let cli = parse(&["validate", &good.to_string_lossy()])?;
    assert_eq!(cli.run().await?, 0);

    // Relative path fails validation
    let bad = dir.path().join("bad.yaml");
    tokio::fs::write(&bad, "- File: {path: etc/motd, regular_file: hi}\n").await?;
    let cli = parse(&["validate", &bad.to_string_lossy()])?;
    assert!(cli.run().await.is_err());

    Ok(())
}

#[tokio::test]
async fn apply_then_reapply_through_the_cli() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let managed = dir.path().join("managed").to_string_lossy().into_owned();
    let store_root = dir.path().join("store").to_string_lossy().into_owned();

    let declarations = dir.path().join("site.yaml");
    tokio::fs::write(
        &declarations,
        format!("- File: {{path: {managed}, regular_file: hello, mode: '0600'}}\n"),
    )
    .await?;

    let args = [
        "apply",
        &declarations.to_string_lossy(),
        "--host-local",
        "--store",
        "local",
        "--store-local-path",
        &store_root,
    ];

    assert_eq!(parse(&args)?.run().await?, 0);
    assert_eq!(tokio::fs::read_to_string(&managed).await?, "hello");

    // The store took the v1 layout on the local machine
    assert!(
        tokio::fs::try_exists(format!("{store_root}/v1/last.yaml")).await?,
        "last blueprint missing"
    );

    // Applying the same target again changes nothing and still succeeds
    assert_eq!(parse(&args)?.run().await?, 0);
    assert_eq!(tokio::fs::read_to_string(&managed).await?, "hello");

    Ok(())
}

#[tokio::test]
async fn plan_previews_without_committing() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let managed = dir.path().join("managed").to_string_lossy().into_owned();
    let store_root = dir.path().join("store").to_string_lossy().into_owned();

    let declarations = dir.path().join("site.yaml");
    tokio::fs::write(
        &declarations,
        format!("- File: {{path: {managed}, regular_file: hello}}\n"),
    )
    .await?;

    let cli = parse(&[
        "plan",
        &declarations.to_string_lossy(),
        "--host-local",
        "--store",
        "local",
        "--store-local-path",
        &store_root,
    ])?;
    assert_eq!(cli.run().await?, 0);

    assert!(!tokio::fs::try_exists(&managed).await?);
    assert!(!tokio::fs::try_exists(&store_root).await?);

    Ok(())
}

#[tokio::test]
async fn run_propagates_the_exit_code() -> Result<()> {
    let cli = parse(&["run", "--host-local", "--", "/bin/sh", "-c", "exit 7"])?;
    assert_eq!(cli.run().await?, 7);

    let cli = parse(&["run", "--host-local", "--", "/bin/true"])?;
    assert_eq!(cli.run().await?, 0);

    Ok(())
}
