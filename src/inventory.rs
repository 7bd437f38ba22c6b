use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, warn};
use ulid::Ulid;

use crate::model::DateRange;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InventoryError {
    #[error("inventory unavailable: {0}")]
    Unavailable(String),
    #[error("inventory rejected release: {0}")]
    Rejected(String),
}

impl InventoryError {
    fn is_transient(&self) -> bool {
        matches!(self, InventoryError::Unavailable(_))
    }
}

/// The availability calendar that holds a product for a booking's window.
#[async_trait]
pub trait Inventory: Send + Sync {
    /// Free `window` on `product_id`'s calendar.
    async fn release(&self, product_id: Ulid, window: DateRange) -> Result<(), InventoryError>;
}

/// Stand-in when no inventory service is wired up.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopInventory;

#[async_trait]
impl Inventory for NoopInventory {
    async fn release(&self, product_id: Ulid, window: DateRange) -> Result<(), InventoryError> {
        debug!(
            "inventory release (noop): product {product_id} [{}, {})",
            window.start, window.end
        );
        Ok(())
    }
}

/// Retries transient failures a bounded number of times with a fixed pause.
pub struct RetryingInventory<I> {
    inner: I,
    attempts: u32,
    backoff: Duration,
}

impl<I: Inventory> RetryingInventory<I> {
    pub fn new(inner: I, attempts: u32, backoff: Duration) -> Self {
        Self {
            inner,
            attempts: attempts.max(1),
            backoff,
        }
    }
}

#[async_trait]
impl<I: Inventory> Inventory for RetryingInventory<I> {
    async fn release(&self, product_id: Ulid, window: DateRange) -> Result<(), InventoryError> {
        let mut attempt = 1;
        loop {
            match self.inner.release(product_id, window).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_transient() && attempt < self.attempts => {
                    warn!(
                        "release of product {product_id} failed (attempt {attempt}/{}): {e}",
                        self.attempts
                    );
                    attempt += 1;
                    tokio::time::sleep(self.backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails with `err` for the first `failures` calls.
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
        err: InventoryError,
    }

    #[async_trait]
    impl Inventory for Flaky {
        async fn release(&self, _: Ulid, _: DateRange) -> Result<(), InventoryError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures {
                Err(self.err.clone())
            } else {
                Ok(())
            }
        }
    }

    fn flaky(failures: u32, err: InventoryError) -> Flaky {
        Flaky {
            failures,
            calls: AtomicU32::new(0),
            err,
        }
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let inv = RetryingInventory::new(
            flaky(2, InventoryError::Unavailable("timeout".into())),
            3,
            Duration::from_millis(1),
        );
        inv.release(Ulid::new(), DateRange::new(0, 10)).await.unwrap();
        assert_eq!(inv.inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn gives_up_after_attempts() {
        let inv = RetryingInventory::new(
            flaky(10, InventoryError::Unavailable("down".into())),
            3,
            Duration::from_millis(1),
        );
        let result = inv.release(Ulid::new(), DateRange::new(0, 10)).await;
        assert!(matches!(result, Err(InventoryError::Unavailable(_))));
        assert_eq!(inv.inner.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn rejection_is_not_retried() {
        let inv = RetryingInventory::new(
            flaky(1, InventoryError::Rejected("unknown product".into())),
            5,
            Duration::from_millis(1),
        );
        let result = inv.release(Ulid::new(), DateRange::new(0, 10)).await;
        assert!(matches!(result, Err(InventoryError::Rejected(_))));
        assert_eq!(inv.inner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn noop_always_succeeds() {
        NoopInventory
            .release(Ulid::new(), DateRange::new(5, 6))
            .await
            .unwrap();
    }
}
