//! The version of this workspace, in one place.

/// The current version of Resonance
pub const RESONANCE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// The protocol version spoken between the CLI and the deployed agent
///
/// Bumped whenever the wire format changes in a way that an older agent
/// cannot serve. A mismatch during the handshake is fatal for the run.
pub const RESONANCE_AGENT_PROTOCOL_VERSION: u32 = 1;
