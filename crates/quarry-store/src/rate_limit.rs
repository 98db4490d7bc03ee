//! Write throttling for shard directories
//!
//! `RateLimiter` is a token bucket where one token is one byte. Writers call
//! `pause` before handing bytes to the filesystem; when the bucket runs dry
//! the caller sleeps for as long as the refill takes. Burst capacity is one
//! second worth of bytes.

use crate::directory::IndexOutput;
use parking_lot::Mutex;
use quarry_common::Result;
use std::io::{self, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

/// Byte-rate token bucket
#[derive(Debug)]
pub struct RateLimiter {
    /// Bytes added per second
    bytes_per_sec: u64,
    /// Current bucket state
    state: Mutex<BucketState>,
    /// Total time callers spent paused (nanoseconds)
    paused_nanos: AtomicU64,
}

#[derive(Debug)]
struct BucketState {
    /// Available bytes; negative while callers owe sleep time
    available: f64,
    /// Last refill timestamp
    last_refill: Instant,
}

impl RateLimiter {
    /// Create a limiter allowing `bytes_per_sec` sustained throughput
    pub fn new(bytes_per_sec: u64) -> Self {
        let bytes_per_sec = bytes_per_sec.max(1);
        Self {
            bytes_per_sec,
            state: Mutex::new(BucketState {
                available: bytes_per_sec as f64,
                last_refill: Instant::now(),
            }),
            paused_nanos: AtomicU64::new(0),
        }
    }

    /// Configured rate
    pub const fn bytes_per_sec(&self) -> u64 {
        self.bytes_per_sec
    }

    /// Total time spent paused across all callers
    pub fn total_paused(&self) -> Duration {
        Duration::from_nanos(self.paused_nanos.load(Ordering::Relaxed))
    }

    /// Take `bytes` tokens if they are available right now
    pub fn try_acquire(&self, bytes: u64) -> bool {
        let mut state = self.state.lock();
        self.refill(&mut state);
        if state.available >= bytes as f64 {
            state.available -= bytes as f64;
            true
        } else {
            false
        }
    }

    /// Take `bytes` tokens, sleeping until the bucket covers them
    ///
    /// Returns how long the caller slept.
    pub fn pause(&self, bytes: u64) -> Duration {
        let wait = {
            let mut state = self.state.lock();
            self.refill(&mut state);
            state.available -= bytes as f64;
            if state.available >= 0.0 {
                Duration::ZERO
            } else {
                Duration::from_secs_f64(-state.available / self.bytes_per_sec as f64)
            }
        };

        if !wait.is_zero() {
            thread::sleep(wait);
            let nanos = u64::try_from(wait.as_nanos()).unwrap_or(u64::MAX);
            self.paused_nanos.fetch_add(nanos, Ordering::Relaxed);
        }
        wait
    }

    /// Refill tokens based on elapsed time
    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        let burst = self.bytes_per_sec as f64;
        state.available = (state.available + elapsed * burst).min(burst);
        state.last_refill = now;
    }
}

/// `IndexOutput` that pauses on a shared `RateLimiter` before each write
pub struct RateLimitedOutput {
    inner: Box<dyn IndexOutput>,
    limiter: std::sync::Arc<RateLimiter>,
}

impl RateLimitedOutput {
    /// Wrap an output
    pub fn new(inner: Box<dyn IndexOutput>, limiter: std::sync::Arc<RateLimiter>) -> Self {
        Self { inner, limiter }
    }
}

impl Write for RateLimitedOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.limiter.pause(n as u64);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl IndexOutput for RateLimitedOutput {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn bytes_written(&self) -> u64 {
        self.inner.bytes_written()
    }

    fn finish(self: Box<Self>) -> Result<()> {
        self.inner.finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_is_free() {
        let limiter = RateLimiter::new(1_000_000);
        assert_eq!(limiter.pause(10_000), Duration::ZERO);
        assert!(limiter.try_acquire(1_000));
    }

    #[test]
    fn test_try_acquire_rejects_over_budget() {
        let limiter = RateLimiter::new(1_000);
        assert!(limiter.try_acquire(900));
        assert!(!limiter.try_acquire(900));
    }

    #[test]
    fn test_pause_throttles_past_burst() {
        let limiter = RateLimiter::new(10_000);
        let started = Instant::now();
        limiter.pause(10_000);
        // The bucket is empty; another 2_000 bytes cost ~200ms
        let slept = limiter.pause(2_000);
        assert!(slept >= Duration::from_millis(150));
        assert!(started.elapsed() >= Duration::from_millis(150));
        assert!(limiter.total_paused() >= Duration::from_millis(150));
    }
}
