//! Clock and randomness supplied to the core.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use ingest_proto::Timestamp;

/// Time and randomness used by a stream.
///
/// Timestamps, token expiry and staleness follow this clock. Condvar waits
/// (blocked puts, `stop_sync`) are bounded by the monotonic clock instead.
pub trait Platform: Send + Sync {
    /// Current time in 100ns units.
    fn now(&self) -> Timestamp;

    fn random(&self) -> u64;
}

/// Wall clock and thread-local RNG.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemPlatform;

impl Platform for SystemPlatform {
    fn now(&self) -> Timestamp {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| (d.as_nanos() / 100) as Timestamp)
            .unwrap_or(0)
    }

    fn random(&self) -> u64 {
        rand::random()
    }
}

/// Manually advanced clock with a settable random value, for tests and replay.
#[derive(Debug, Default)]
pub struct ManualPlatform {
    now: AtomicU64,
    random: AtomicU64,
}

impl ManualPlatform {
    pub fn new(now: Timestamp) -> Self {
        Self {
            now: AtomicU64::new(now),
            random: AtomicU64::new(0),
        }
    }

    pub fn set_now(&self, now: Timestamp) {
        self.now.store(now, Ordering::SeqCst);
    }

    pub fn advance(&self, delta: Timestamp) {
        self.now.fetch_add(delta, Ordering::SeqCst);
    }

    /// Value returned by every subsequent `random()` call.
    pub fn set_random(&self, value: u64) {
        self.random.store(value, Ordering::SeqCst);
    }
}

impl Platform for ManualPlatform {
    fn now(&self) -> Timestamp {
        self.now.load(Ordering::SeqCst)
    }

    fn random(&self) -> u64 {
        self.random.load(Ordering::SeqCst)
    }
}
