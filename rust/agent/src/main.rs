use common::{eyre::Result, tokio};

/// The agent serves host operations over its stdio until the peer closes
/// the connection or sends the close opcode. It is deployed and spawned by
/// the agent host wrapper, never run by hand.
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let stdin = tokio::io::stdin();
    let stdout = tokio::io::stdout();
    agent::serve(stdin, stdout).await?;
    Ok(())
}
