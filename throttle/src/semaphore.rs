use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Permit pool with an on/off switch. When disabled, `acquire` never waits but in-flight
/// accounting still happens.
#[derive(Debug)]
pub struct Semaphore {
    flag: AtomicBool,
    sem: Arc<tokio::sync::Semaphore>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl Semaphore {
    pub fn new(value: usize) -> Self {
        let sem = Arc::new(tokio::sync::Semaphore::new(value));
        Self {
            flag: AtomicBool::new(value > 0),
            sem,
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    pub async fn acquire(&self) -> Option<tokio::sync::OwnedSemaphorePermit> {
        let permit = if self.is_enabled() {
            // the semaphore is owned by self and never closed
            Some(
                self.sem
                    .clone()
                    .acquire_owned()
                    .await
                    .expect("transfer semaphore is never closed"),
            )
        } else {
            None
        };
        let now = self.in_flight.fetch_add(1, Ordering::AcqRel) + 1;
        self.peak.fetch_max(now, Ordering::AcqRel);
        permit
    }

    pub fn release(&self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn available_permits(&self) -> usize {
        self.sem.available_permits()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::Acquire)
    }
}
