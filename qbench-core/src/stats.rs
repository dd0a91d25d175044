//! Process wide byte/message totals, written by every stream worker
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::metrics::{BYTES, MESSAGES};

/// Running totals shared by all stream workers.
///
/// The two counters are independent atomics: a [`Snapshot`] is consistent per
/// field but may catch one field a single `add` ahead of the other.
#[derive(Debug, Default)]
pub struct Stats {
    bytes: AtomicU64,
    messages: AtomicU64,
}

/// point in time view of [`Stats`]
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    /// total bytes recorded
    pub bytes: u64,
    /// total messages recorded
    pub messages: u64,
}

impl Stats {
    /// zeroed counters
    pub fn new() -> Self {
        Self::default()
    }

    /// record `bytes` and `messages`
    #[inline]
    pub fn add(&self, bytes: u64, messages: u64) {
        self.bytes.fetch_add(bytes, Ordering::Relaxed);
        self.messages.fetch_add(messages, Ordering::Relaxed);
        BYTES.inc_by(bytes);
        MESSAGES.inc_by(messages);
    }

    /// read both counters
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            bytes: self.bytes.load(Ordering::Relaxed),
            messages: self.messages.load(Ordering::Relaxed),
        }
    }

    /// zero both counters
    pub fn reset(&self) {
        self.bytes.store(0, Ordering::Relaxed);
        self.messages.store(0, Ordering::Relaxed);
    }
}

impl Snapshot {
    /// growth from `earlier` to `self`, saturating if the counters were reset in between
    pub fn delta(&self, earlier: &Snapshot) -> Snapshot {
        Snapshot {
            bytes: self.bytes.saturating_sub(earlier.bytes),
            messages: self.messages.saturating_sub(earlier.messages),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    #[test]
    fn starts_at_zero() {
        assert_eq!(Stats::new().snapshot(), Snapshot::default());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_adds_sum() {
        let stats = Arc::new(Stats::new());
        let mut tasks = tokio::task::JoinSet::new();
        for worker in 0..32u64 {
            let stats = Arc::clone(&stats);
            tasks.spawn(async move {
                for i in 0..1_000u64 {
                    stats.add(worker + i, 1);
                    if i % 100 == 0 {
                        tokio::task::yield_now().await;
                    }
                }
            });
        }
        while let Some(res) = tasks.join_next().await {
            res.unwrap();
        }

        // sum over workers of (1000 * worker + sum(0..1000))
        let expected_bytes = (0..32u64).map(|w| 1_000 * w + 499_500).sum::<u64>();
        assert_eq!(
            stats.snapshot(),
            Snapshot {
                bytes: expected_bytes,
                messages: 32_000,
            }
        );
    }

    #[test]
    fn reset_and_delta() {
        let stats = Stats::new();
        stats.add(100, 2);
        let first = stats.snapshot();
        stats.add(50, 1);
        let second = stats.snapshot();
        assert_eq!(
            second.delta(&first),
            Snapshot {
                bytes: 50,
                messages: 1
            }
        );

        stats.reset();
        assert_eq!(stats.snapshot(), Snapshot::default());
        assert_eq!(stats.snapshot().delta(&second), Snapshot::default());
    }
}
