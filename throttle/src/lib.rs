//! Concurrency limiting for file transfers
//!
//! This crate bounds how many file transfers run at the same time. A [`TransferLimiter`] owns a
//! fixed pool of permits; every transfer holds a [`TransferPermit`] for its whole lifetime and
//! gives it back when the permit is dropped, whether the transfer succeeded, failed or panicked.
//!
//! # Usage
//!
//! ```rust,no_run
//! use throttle::TransferLimiter;
//! use std::num::NonZeroUsize;
//!
//! # async fn example() {
//! let limiter = TransferLimiter::new(NonZeroUsize::new(4).unwrap());
//! let mut join_set = tokio::task::JoinSet::new();
//! for _ in 0..16 {
//!     // waits here while 4 transfers are already running
//!     let permit = limiter.acquire().await;
//!     join_set.spawn(async move {
//!         let _permit = permit;
//!         // copy file here - the slot is released when `_permit` goes out of scope
//!     });
//! }
//! while join_set.join_next().await.is_some() {}
//! # }
//! ```
//!
//! # Unbounded limiters
//!
//! [`TransferLimiter::unbounded`] never makes the caller wait. It still counts transfers in
//! flight, which lets callers that deliberately skip the bound (for example transfers launched
//! one at a time from change notifications) report the same statistics as bounded ones.
//!
//! # Accounting
//!
//! The limiter keeps track of the number of transfers currently holding a permit and of the
//! highest value that number has reached. Both are cheap atomic reads and are mostly useful for
//! debug logging and for verifying the bound in tests.

mod semaphore;

use std::num::NonZeroUsize;
use std::sync::Arc;

/// Shared handle bounding the number of concurrent transfers.
///
/// Cloning the limiter is cheap and every clone draws from the same permit pool.
#[derive(Debug, Clone)]
pub struct TransferLimiter {
    sem: Arc<semaphore::Semaphore>,
    max_transfers: Option<NonZeroUsize>,
}

/// Slot held by one running transfer. Dropping it frees the slot.
#[derive(Debug)]
pub struct TransferPermit {
    sem: Arc<semaphore::Semaphore>,
    _permit: Option<tokio::sync::OwnedSemaphorePermit>,
}

impl Drop for TransferPermit {
    fn drop(&mut self) {
        self.sem.release();
    }
}

impl TransferLimiter {
    /// Limiter admitting at most `max_transfers` concurrent transfers.
    pub fn new(max_transfers: NonZeroUsize) -> Self {
        Self {
            sem: Arc::new(semaphore::Semaphore::new(max_transfers.get())),
            max_transfers: Some(max_transfers),
        }
    }

    /// Limiter that never blocks.
    pub fn unbounded() -> Self {
        Self {
            sem: Arc::new(semaphore::Semaphore::new(0)),
            max_transfers: None,
        }
    }

    /// Configured bound, `None` for an unbounded limiter.
    pub fn max_transfers(&self) -> Option<NonZeroUsize> {
        self.max_transfers
    }

    /// Wait for a free slot.
    pub async fn acquire(&self) -> TransferPermit {
        let permit = self.sem.acquire().await;
        tracing::trace!(
            "transfer slot acquired, in flight: {}, available: {}",
            self.sem.in_flight(),
            self.sem.available_permits()
        );
        TransferPermit {
            sem: self.sem.clone(),
            _permit: permit,
        }
    }

    /// Number of transfers currently holding a permit.
    pub fn in_flight(&self) -> usize {
        self.sem.in_flight()
    }

    /// Highest number of permits held at the same time since the limiter was created.
    pub fn peak_in_flight(&self) -> usize {
        self.sem.peak()
    }
}

impl Default for TransferLimiter {
    fn default() -> Self {
        Self::new(NonZeroUsize::MIN)
    }
}
