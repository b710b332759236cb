use std::{future::Future, io, time::Duration};

use local_sync::semaphore::{Semaphore, SemaphorePermit};

use crate::{Error, Result};

/// Runs `fut` under an optional deadline; `None` means it timed out.
pub(crate) async fn with_timeout<F: Future>(timeout: Option<Duration>, fut: F) -> Option<F::Output> {
    match timeout {
        Some(d) => monoio::time::timeout(d, fut).await.ok(),
        None => Some(fut.await),
    }
}

/// FIFO async lock on top of a single-permit semaphore.
pub(crate) struct AsyncMutex {
    sem: Semaphore,
}

impl AsyncMutex {
    pub(crate) fn new() -> Self {
        Self {
            sem: Semaphore::new(1),
        }
    }

    pub(crate) async fn lock(&self) -> Result<SemaphorePermit<'_>> {
        self.sem
            .acquire()
            .await
            .map_err(|_| Error::Close(io::Error::new(io::ErrorKind::Other, "lock closed")))
    }

    #[cfg(test)]
    pub(crate) fn is_locked(&self) -> bool {
        self.sem.available_permits() == 0
    }
}

/// `0, f*2^0, f*2^1, ...`
pub(crate) fn exponential_backoff(factor: f64) -> impl Iterator<Item = Duration> {
    std::iter::once(Duration::ZERO).chain(
        (0..).map(move |n: i32| Duration::from_secs_f64(factor * 2f64.powi(n.min(30)))),
    )
}
