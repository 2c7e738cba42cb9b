//! The ambient context passed explicitly through every call: cancellation,
//! a structured logger carrying a group stack and attributes, and the gate
//! bounding concurrent host operations.

use std::fs;
use std::sync::Arc;
use std::thread;

use common::{
    thiserror::{self, Error},
    tokio::sync::{OwnedSemaphorePermit, Semaphore},
    tokio_util::sync::{CancellationToken, WaitForCancellationFuture},
};

mod logger;

pub use logger::Logger;

/// The operation was cancelled via the context's [`CancellationToken`]
#[derive(Debug, Clone, Copy, Error)]
#[error("cancelled")]
pub struct Cancelled;

/// Bound on the number of in-flight host operations
///
/// Shared by every context derived from the same root. Acquiring respects
/// cancellation so a cancelled run never parks on the gate.
#[derive(Clone)]
pub struct HostGate {
    semaphore: Arc<Semaphore>,
    max: usize,
}

impl HostGate {
    pub fn new(max: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max.max(1))),
            max: max.max(1),
        }
    }

    /// The configured maximum number of in-flight host operations
    pub fn max(&self) -> usize {
        self.max
    }
}

/// Detect the default host operation concurrency for this machine
///
/// Counts processors in `/proc/cpuinfo` where available (Linux), falling
/// back to [`thread::available_parallelism`].
pub fn default_max_concurrency() -> usize {
    if let Ok(cpuinfo) = fs::read_to_string("/proc/cpuinfo") {
        let count = cpuinfo
            .lines()
            .filter(|line| line.starts_with("processor"))
            .count();
        if count > 0 {
            return count;
        }
    }
    thread::available_parallelism().map_or(1, |count| count.get())
}

/// The context threaded through every host, store, and engine call
///
/// Child scopes are derived with [`Context::with_group`] and
/// [`Context::with_attr`]; the parent is never mutated. Cancellation and the
/// gate are shared across the whole derivation tree.
#[derive(Clone)]
pub struct Context {
    cancel: CancellationToken,
    gate: HostGate,
    logger: Logger,
}

impl Context {
    pub fn new(max_concurrency: Option<usize>) -> Self {
        Self {
            cancel: CancellationToken::new(),
            gate: HostGate::new(max_concurrency.unwrap_or_else(default_max_concurrency)),
            logger: Logger::default(),
        }
    }

    /// Derive a child context with a logging group pushed onto the stack
    pub fn with_group(&self, group: impl Into<String>) -> Self {
        Self {
            cancel: self.cancel.clone(),
            gate: self.gate.clone(),
            logger: self.logger.with_group(group),
        }
    }

    /// Derive a child context with an attribute added to the logger
    pub fn with_attr(&self, name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            cancel: self.cancel.clone(),
            gate: self.gate.clone(),
            logger: self.logger.with_attr(name, value),
        }
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    pub fn gate(&self) -> &HostGate {
        &self.gate
    }

    /// Request cancellation of everything sharing this context's token
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the context is cancelled; for use in `select!` arms
    /// around I/O that does not poll the context itself
    pub fn cancelled(&self) -> WaitForCancellationFuture {
        self.cancel.cancelled()
    }

    /// Fail fast if the context has been cancelled
    ///
    /// Consulted at every I/O boundary.
    pub fn check(&self) -> Result<(), Cancelled> {
        if self.cancel.is_cancelled() {
            Err(Cancelled)
        } else {
            Ok(())
        }
    }

    /// Acquire a permit from the host operation gate
    ///
    /// The permit must be held across the host I/O it covers.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, Cancelled> {
        common::tokio::select! {
            permit = self.gate.semaphore.clone().acquire_owned() => {
                permit.map_err(|_| Cancelled)
            }
            _ = self.cancel.cancelled() => Err(Cancelled),
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new(None)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use common::{eyre::Result, futures::future::try_join_all, tokio};

    use super::*;

    #[test]
    fn detects_some_concurrency() {
        assert!(default_max_concurrency() >= 1);
    }

    #[test]
    fn child_scopes_do_not_mutate_parent() {
        let parent = Context::new(Some(2));
        let child = parent.with_group("apply").with_attr("host", "localhost");
        assert_eq!(parent.logger().scope(), "");
        assert_eq!(child.logger().scope(), "apply");
    }

    #[tokio::test]
    async fn gate_bounds_in_flight_operations() -> Result<()> {
        let max = 3;
        let ctx = Context::new(Some(max));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let tasks = (0..20).map(|_| {
            let ctx = ctx.clone();
            let in_flight = in_flight.clone();
            let peak = peak.clone();
            tokio::spawn(async move {
                let _permit = ctx.acquire().await?;
                let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                in_flight.fetch_sub(1, Ordering::SeqCst);
                Ok::<(), Cancelled>(())
            })
        });
        for result in try_join_all(tasks).await? {
            result?;
        }

        assert!(peak.load(Ordering::SeqCst) <= max);
        Ok(())
    }

    #[tokio::test]
    async fn cancelled_context_fails_checks_and_acquires() {
        let ctx = Context::new(Some(1));
        ctx.cancel();
        assert!(ctx.check().is_err());
        assert!(ctx.acquire().await.is_err());
    }
}
