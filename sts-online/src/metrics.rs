//! Engine work counters.

use std::sync::atomic::{AtomicU64, Ordering};

/// Counters describing how much work the engine has done.
///
/// Shared behind an `Arc` so a driver can read them while the engine
/// keeps updating; every counter is a relaxed atomic.
#[derive(Debug, Default)]
pub struct EngineMetrics {
    matrix_updates: AtomicU64,
    partials_updates: AtomicU64,
    operations_submitted: AtomicU64,
    operations_skipped: AtomicU64,
    evaluations: AtomicU64,
}

/// Point-in-time copy of [`EngineMetrics`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MetricsSnapshot {
    /// Transition matrices recomputed.
    pub matrix_updates: u64,
    /// Batched combine submissions.
    pub partials_updates: u64,
    /// Combine operations executed.
    pub operations_submitted: u64,
    /// Combine operations avoided because the buffer already held the result.
    pub operations_skipped: u64,
    /// Full log-likelihood evaluations.
    pub evaluations: u64,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_matrix_updates(&self, n: usize) {
        self.matrix_updates.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_operations(&self, submitted: usize, skipped: usize) {
        if submitted > 0 {
            self.partials_updates.fetch_add(1, Ordering::Relaxed);
        }
        self.operations_submitted
            .fetch_add(submitted as u64, Ordering::Relaxed);
        self.operations_skipped
            .fetch_add(skipped as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_evaluation(&self) {
        self.evaluations.fetch_add(1, Ordering::Relaxed);
    }

    /// Read all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            matrix_updates: self.matrix_updates.load(Ordering::Relaxed),
            partials_updates: self.partials_updates.load(Ordering::Relaxed),
            operations_submitted: self.operations_submitted.load(Ordering::Relaxed),
            operations_skipped: self.operations_skipped.load(Ordering::Relaxed),
            evaluations: self.evaluations.load(Ordering::Relaxed),
        }
    }

    /// Zero all counters.
    pub fn reset(&self) {
        for counter in [
            &self.matrix_updates,
            &self.partials_updates,
            &self.operations_submitted,
            &self.operations_skipped,
            &self.evaluations,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn counters_accumulate_and_reset() {
        let metrics = Arc::new(EngineMetrics::new());
        let shared = Arc::clone(&metrics);
        shared.record_matrix_updates(3);
        shared.record_operations(2, 5);
        shared.record_operations(0, 1);
        shared.record_evaluation();
        let snap = metrics.snapshot();
        assert_eq!(
            snap,
            MetricsSnapshot {
                matrix_updates: 3,
                partials_updates: 1,
                operations_submitted: 2,
                operations_skipped: 6,
                evaluations: 1,
            }
        );
        metrics.reset();
        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());
    }
}
