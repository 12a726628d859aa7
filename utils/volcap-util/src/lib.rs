use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, OnceLock,
};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

mod worker;

pub use worker::WorkerQueue;

/// Deadline for idle condvar/channel waits so shutdown stays prompt.
pub const IDLE_WAIT: Duration = Duration::from_millis(100);

static BOOT_INSTANT: OnceLock<Instant> = OnceLock::new();

/// Microseconds since process start, monotonic.
///
/// The first caller anchors the epoch, so this should be touched early in
/// `main` before any timestamps are compared.
pub fn boot_usec() -> u64 {
    let t0 = *BOOT_INSTANT.get_or_init(Instant::now);
    t0.elapsed().as_micros() as u64
}

/// Microseconds since the Unix epoch.
pub fn unix_usec() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as u64)
        .unwrap_or(0)
}

/// Generate a random non-zero process guid.
pub fn generate_guid() -> u64 {
    for _ in 0..4 {
        let guid: u64 = rand::random();
        if guid != 0 {
            return guid;
        }
    }
    tracing::warn!("random guid was zero repeatedly, falling back to clock");
    unix_usec() | 1
}

/// Cooperative termination flag shared between a worker loop and its owner.
#[derive(Clone, Default)]
pub struct TerminateFlag(Arc<AtomicBool>);

impl TerminateFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boot_clock_is_monotonic() {
        let a = boot_usec();
        let b = boot_usec();
        assert!(b >= a);
    }

    #[test]
    fn guid_is_nonzero() {
        for _ in 0..32 {
            assert_ne!(generate_guid(), 0);
        }
    }
}
