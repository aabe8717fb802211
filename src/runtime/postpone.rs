//! Automatic postpone-write.
//!
//! With postpone enabled, writes issued while a handler is running are left
//! in the outbound ring and flushed once when the handler loop returns, so a
//! burst of small replies costs one interest registration instead of many.
//!
//! The switch flips on when a handler loop processes several requests per
//! readable event, or when the reading lock is repeatedly contended (many
//! requests multiplexed on one connection). It flips back off once writev
//! batches stay the same size for a long run, meaning nothing is being
//! coalesced.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, AtomicUsize, Ordering};

use super::metrics::{self, Metric};

/// Consecutive equal-size batches that switch postpone off.
const SAME_BATCH_THRESHOLD: u8 = 70;
/// Handler iterations per event that switch postpone on.
const LOOP_COUNT_THRESHOLD: u8 = 3;
/// Reading lock contentions that switch postpone on.
const CONTENTION_THRESHOLD: u32 = 5;

/// Pending bytes beyond which postponed output is flushed anyway.
pub const POSTPONE_FLUSH_THRESHOLD: usize = 64 * 1024;

#[derive(Debug, Default)]
pub(crate) struct PostponeWrite {
    enabled: AtomicBool,
    loop_count: AtomicU8,
    contention: AtomicU32,
    prev_batch: AtomicUsize,
    same_batches: AtomicU8,
}

impl PostponeWrite {
    pub(crate) fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub(crate) fn set(&self, on: bool) {
        self.enabled.store(on, Ordering::Release);
    }

    fn switch_on(&self) {
        if !self.enabled.swap(true, Ordering::AcqRel) {
            metrics::add(Metric::TcpPostponeWriteOn, 1);
        }
    }

    /// Feed the segment count of a writev batch.
    pub(crate) fn observe_batch(&self, blocks: usize) {
        let prev = self.prev_batch.swap(blocks, Ordering::Relaxed);
        if prev != 0 && prev != blocks {
            self.same_batches.store(0, Ordering::Relaxed);
            return;
        }
        let same = self.same_batches.fetch_add(1, Ordering::Relaxed).saturating_add(1);
        if same >= SAME_BATCH_THRESHOLD {
            self.same_batches.store(0, Ordering::Relaxed);
            if self.enabled.swap(false, Ordering::AcqRel) {
                metrics::add(Metric::TcpPostponeWriteOff, 1);
            }
        }
    }

    pub(crate) fn reset_loop_count(&self) {
        self.loop_count.store(0, Ordering::Relaxed);
    }

    pub(crate) fn inc_loop_count(&self) {
        let _ = self
            .loop_count
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| c.checked_add(1));
    }

    /// Switch on when the last handler loop ran more than a few iterations.
    pub(crate) fn check_loop_count(&self) {
        if self.loop_count.load(Ordering::Relaxed) > LOOP_COUNT_THRESHOLD {
            self.switch_on();
        }
    }

    pub(crate) fn reset_contention(&self) {
        self.contention.store(0, Ordering::Relaxed);
    }

    /// Record a failed try-lock on the reading side.
    pub(crate) fn inc_contention(&self) {
        if self.contention.fetch_add(1, Ordering::Relaxed) + 1 > CONTENTION_THRESHOLD {
            self.switch_on();
            self.reset_contention();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loop_count_switches_on() {
        let p = PostponeWrite::default();
        p.reset_loop_count();
        for _ in 0..3 {
            p.inc_loop_count();
        }
        p.check_loop_count();
        assert!(!p.enabled());
        p.inc_loop_count();
        p.check_loop_count();
        assert!(p.enabled());
    }

    #[test]
    fn test_contention_switches_on() {
        let p = PostponeWrite::default();
        for _ in 0..5 {
            p.inc_contention();
        }
        assert!(!p.enabled());
        p.inc_contention();
        assert!(p.enabled());
    }

    #[test]
    fn test_steady_batches_switch_off() {
        let p = PostponeWrite::default();
        p.set(true);
        for _ in 0..69 {
            p.observe_batch(2);
        }
        assert!(p.enabled());
        p.observe_batch(2);
        assert!(!p.enabled());
    }

    #[test]
    fn test_varying_batches_keep_postpone() {
        let p = PostponeWrite::default();
        p.set(true);
        for i in 0..200 {
            p.observe_batch(1 + i % 2);
        }
        assert!(p.enabled());
    }
}
