//! Single-slot mutex (C7) so update sessions never overlap. A `tokio::sync::Semaphore`
//! with one permit; the guard releases it on drop.

use std::sync::Arc;

use tokio::sync::{Semaphore, SemaphorePermit};

#[derive(Clone)]
pub struct Locker {
    semaphore: Arc<Semaphore>,
}

impl Default for Locker {
    fn default() -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(1)),
        }
    }
}

impl Locker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Non-blocking. `None` means a session is already in flight.
    pub fn try_acquire(&self) -> Option<LockerGuard<'_>> {
        self.semaphore.try_acquire().ok().map(LockerGuard)
    }

    /// Waits indefinitely for the slot.
    pub async fn acquire(&self) -> LockerGuard<'_> {
        LockerGuard(self.semaphore.acquire().await.expect("semaphore never closed"))
    }

    /// Waits up to `timeout` for an in-flight session to finish draining.
    pub async fn acquire_timeout(&self, timeout: std::time::Duration) -> Option<LockerGuard<'_>> {
        tokio::time::timeout(timeout, self.acquire()).await.ok()
    }
}

pub struct LockerGuard<'a>(SemaphorePermit<'a>);

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn second_try_acquire_fails_while_held() {
        let locker = Locker::new();
        let guard = locker.try_acquire();
        assert!(guard.is_some());
        assert!(locker.try_acquire().is_none());
        drop(guard);
        assert!(locker.try_acquire().is_some());
    }

    #[tokio::test]
    async fn acquire_timeout_expires_while_held() {
        let locker = Locker::new();
        let _guard = locker.try_acquire().unwrap();
        let result = locker.acquire_timeout(std::time::Duration::from_millis(20)).await;
        assert!(result.is_none());
    }
}
