//! Monotonic per-process timestamps for attribute bookkeeping.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;

/// Milliseconds since the Unix epoch, as recorded in the `updates` map of
/// stored objects.
pub type Timestamp = u64;

static LAST: AtomicU64 = AtomicU64::new(0);

/// Returns the current timestamp, strictly greater than any timestamp
/// previously returned in this process.
///
/// The wall clock may stand still or jump backwards; consecutive calls are
/// still distinct and ordered.
pub fn next() -> Timestamp {
    let wall = Utc::now().timestamp_millis().max(0) as u64;
    let prev = LAST
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
            Some(wall.max(last + 1))
        })
        .unwrap();
    wall.max(prev + 1)
}

#[cfg(test)]
mod tests {
    use super::next;

    #[test]
    fn timestamps_are_strictly_increasing() {
        let mut prev = next();
        for _ in 0..1_000 {
            let now = next();
            assert!(now > prev);
            prev = now;
        }
    }
}
