//! Service lifecycle: counting completed downloads and deciding when to shut down.

use std::{
    future::Future,
    num::NonZeroU64,
    sync::atomic::{AtomicU64, Ordering},
};

use log::info;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
pub struct Lifecycle {
    quit_after: Option<NonZeroU64>,
    completed: AtomicU64,
    shutdown: CancellationToken,
}

impl Lifecycle {
    /// `quit_after` of `None` keeps the service running forever.
    pub fn new(quit_after: Option<NonZeroU64>) -> Self {
        Self {
            quit_after,
            ..Default::default()
        }
    }

    /// Records one successfully streamed archive.
    ///
    /// Returns `true` for exactly one call: the one that reaches the configured limit, which
    /// also requests shutdown.  Concurrent completions are counted atomically so the decision
    /// fires neither twice nor never.
    pub fn download_completed(&self) -> bool {
        let count = self.completed.fetch_add(1, Ordering::AcqRel) + 1;
        match self.quit_after {
            Some(limit) if count == limit.get() => {
                info!("{count} download(s) completed, shutting down");
                self.shutdown.cancel();
                true
            }
            _ => false,
        }
    }

    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Acquire)
    }

    /// Asks the server to stop accepting connections and finish the ones in flight.
    pub fn request_shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Resolves once shutdown has been requested.
    pub fn shutdown_requested(&self) -> impl Future<Output = ()> + Send + 'static {
        let token = self.shutdown.clone();
        async move { token.cancelled().await }
    }
}
