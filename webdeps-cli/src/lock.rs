//! Serialized access to shared on-disk files.
//!
//! `package.json` and `import-map.json` are read-modify-written by many
//! concurrent pipeline branches. Each file gets its own [`IoLock`], created by
//! the caller and handed to whichever component owns the file.

use std::future::Future;
use std::sync::Arc;

use tokio::sync::Mutex;

/// A FIFO mutual-exclusion resource guarding one file.
///
/// Cloning shares the underlying lock. Waiters acquire it in the order they
/// queued, so interleaved install/remove operations each see the previous
/// writer's result.
#[derive(Debug, Clone, Default)]
pub struct IoLock {
    inner: Arc<Mutex<()>>,
}

impl IoLock {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `critical` while holding the lock, releasing it when the returned
    /// future completes (successfully or not).
    pub async fn dispatch<F, Fut, T>(&self, critical: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let _guard = self.inner.lock().await;
        critical().await
    }
}
