//! Process-wide bound on concurrent part uploads.

use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::error::UploadError;

/// Counting semaphore shared by every [`crate::Uploader`] in the process.
/// Waiters are served in FIFO order.
#[derive(Debug)]
pub struct UploadLimiter {
    semaphore: Arc<Semaphore>,
    capacity: usize,
}

impl UploadLimiter {
    pub fn new(concurrency: usize) -> Self {
        let capacity = concurrency.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn available(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Wait for a permit, giving up with `Cancelled` if `cancel` fires first.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<OwnedSemaphorePermit, UploadError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(UploadError::Cancelled),
            permit = self.semaphore.clone().acquire_owned() => {
                permit.map_err(|_| UploadError::Cancelled)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio_test::{assert_pending, assert_ready, task};

    #[tokio::test]
    async fn permits_are_bounded() {
        let limiter = UploadLimiter::new(2);
        let cancel = CancellationToken::new();
        let a = limiter.acquire(&cancel).await.unwrap();
        let _b = limiter.acquire(&cancel).await.unwrap();
        assert_eq!(limiter.available(), 0);

        let mut third = task::spawn(limiter.acquire(&cancel));
        assert_pending!(third.poll());

        drop(a);
        assert!(third.is_woken());
        assert!(assert_ready!(third.poll()).is_ok());
    }

    #[tokio::test]
    async fn cancellation_wakes_waiter() {
        let limiter = Arc::new(UploadLimiter::new(1));
        let cancel = CancellationToken::new();
        let _held = limiter.acquire(&cancel).await.unwrap();

        let waiter = {
            let limiter = limiter.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { limiter.acquire(&cancel).await.map(|_| ()) })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();
        assert!(matches!(waiter.await.unwrap(), Err(UploadError::Cancelled)));
    }

    #[test]
    fn zero_concurrency_is_raised_to_one() {
        assert_eq!(UploadLimiter::new(0).capacity(), 1);
    }
}
