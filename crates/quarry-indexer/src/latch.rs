//! Count-down latch
//!
//! Coordinators block on a latch until every worker has counted down once.
//! Workers hold a `CountDownGuard`, so the count is released on early
//! return, error and panic alike.

use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Blocks waiters until the count reaches zero
#[derive(Debug)]
pub struct CountDownLatch {
    count: Mutex<usize>,
    zero: Condvar,
}

impl CountDownLatch {
    pub fn new(count: usize) -> Self {
        Self {
            count: Mutex::new(count),
            zero: Condvar::new(),
        }
    }

    /// Decrement; extra calls at zero are ignored
    pub fn count_down(&self) {
        let mut count = self.count.lock();
        if *count > 0 {
            *count -= 1;
            if *count == 0 {
                self.zero.notify_all();
            }
        }
    }

    pub fn count(&self) -> usize {
        *self.count.lock()
    }

    /// Block until the count reaches zero
    pub fn wait(&self) {
        let mut count = self.count.lock();
        while *count > 0 {
            self.zero.wait(&mut count);
        }
    }

    /// Block until zero or `timeout`; returns whether zero was reached
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut count = self.count.lock();
        while *count > 0 {
            if self.zero.wait_until(&mut count, deadline).timed_out() {
                return *count == 0;
            }
        }
        true
    }

    /// Guard that counts down once when dropped
    pub fn guard(self: &Arc<Self>) -> CountDownGuard {
        CountDownGuard {
            latch: Arc::clone(self),
        }
    }
}

/// Counts its latch down on drop
#[derive(Debug)]
pub struct CountDownGuard {
    latch: Arc<CountDownLatch>,
}

impl Drop for CountDownGuard {
    fn drop(&mut self) {
        self.latch.count_down();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_wait_releases_at_zero() {
        let latch = Arc::new(CountDownLatch::new(3));
        let handles: Vec<_> = (0..3)
            .map(|_| {
                let latch = Arc::clone(&latch);
                thread::spawn(move || latch.count_down())
            })
            .collect();
        latch.wait();
        assert_eq!(latch.count(), 0);
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn test_timeout() {
        let latch = CountDownLatch::new(1);
        assert!(!latch.wait_timeout(Duration::from_millis(20)));
        latch.count_down();
        latch.count_down();
        assert!(latch.wait_timeout(Duration::from_millis(20)));
    }

    #[test]
    fn test_guard_counts_down_on_panic() {
        let latch = Arc::new(CountDownLatch::new(1));
        let worker = {
            let latch = Arc::clone(&latch);
            thread::spawn(move || {
                let _guard = latch.guard();
                panic!("worker failed");
            })
        };
        assert!(worker.join().is_err());
        assert!(latch.wait_timeout(Duration::from_secs(1)));
    }
}
