//! Structured logger carried by the context: a stack of groups naming the
//! component being worked in, plus a flat attribute set. Entries are emitted
//! through `tracing` so the subscriber installed by the CLI controls
//! formatting and filtering.

use common::tracing;

/// A logger with a current attribute set and group stack
///
/// Cloning is cheap; derivation never mutates the source.
#[derive(Debug, Clone, Default)]
pub struct Logger {
    groups: Vec<String>,
    attrs: Vec<(String, String)>,
}

impl Logger {
    pub fn with_group(&self, group: impl Into<String>) -> Self {
        let mut logger = self.clone();
        logger.groups.push(group.into());
        logger
    }

    pub fn with_attr(&self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let mut logger = self.clone();
        logger.attrs.push((name.into(), value.into()));
        logger
    }

    /// The group stack rendered as a `/`-separated path
    pub fn scope(&self) -> String {
        self.groups.join("/")
    }

    fn attrs(&self) -> String {
        self.attrs
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn trace(&self, message: &str) {
        tracing::trace!(scope = %self.scope(), attrs = %self.attrs(), "{message}");
    }

    pub fn debug(&self, message: &str) {
        tracing::debug!(scope = %self.scope(), attrs = %self.attrs(), "{message}");
    }

    pub fn info(&self, message: &str) {
        tracing::info!(scope = %self.scope(), attrs = %self.attrs(), "{message}");
    }

    pub fn warn(&self, message: &str) {
        tracing::warn!(scope = %self.scope(), attrs = %self.attrs(), "{message}");
    }

    pub fn error(&self, message: &str) {
        tracing::error!(scope = %self.scope(), attrs = %self.attrs(), "{message}");
    }
}
