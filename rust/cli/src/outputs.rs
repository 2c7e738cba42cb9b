//! Writing command results to stdout (log entries go to stderr via
//! `tracing`, results to stdout so they can be piped).

use std::io::Write;

use common::eyre::Result;

pub(crate) fn stdout(text: &str) -> Result<()> {
    let mut out = std::io::stdout();
    out.write_all(text.as_bytes())?;
    out.flush()?;
    Ok(())
}

pub(crate) fn stdout_bytes(bytes: &[u8]) -> Result<()> {
    let mut out = std::io::stdout();
    out.write_all(bytes)?;
    out.flush()?;
    Ok(())
}

pub(crate) fn stderr_bytes(bytes: &[u8]) -> Result<()> {
    let mut err = std::io::stderr();
    err.write_all(bytes)?;
    err.flush()?;
    Ok(())
}
