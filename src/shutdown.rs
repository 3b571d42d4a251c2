use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Returned by [`Shutdown::sleep`] when the wait was cut short.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

impl core::fmt::Display for Cancelled {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "cancelled by shutdown")
    }
}

impl std::error::Error for Cancelled {}

/// Cloneable shutdown signal. Clones observe the same flag.
#[derive(Debug, Clone, Default)]
pub struct Shutdown {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Shutdown {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        let (flag, cv) = &*self.inner;
        *flag.lock().unwrap_or_else(PoisonError::into_inner) = true;
        cv.notify_all();
    }

    pub fn is_triggered(&self) -> bool {
        *self.inner.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn check(&self) -> Result<(), Cancelled> {
        if self.is_triggered() { Err(Cancelled) } else { Ok(()) }
    }

    /// Sleep for `duration` unless shutdown is triggered first.
    pub fn sleep(&self, duration: Duration) -> Result<(), Cancelled> {
        let (flag, cv) = &*self.inner;
        let deadline = Instant::now() + duration;
        let mut triggered = flag.lock().unwrap_or_else(PoisonError::into_inner);
        while !*triggered {
            let now = Instant::now();
            if now >= deadline {
                return Ok(());
            }
            triggered = cv
                .wait_timeout(triggered, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        Err(Cancelled)
    }
}
