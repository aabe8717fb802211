//! Low-resolution timer wheel for idle eviction.
//!
//! One background thread advances a hashed wheel every [`TIMER_RESOLUTION`].
//! Entries hold a weak reference to their target, so a connection that is
//! dropped simply falls out of the wheel. When an entry's slot comes due the
//! target is asked to check its real idle time: it either acts (closes) or
//! returns the remaining duration, and the entry is re-inserted.

use std::io;
use std::sync::{Mutex, OnceLock, Weak};
use std::thread;
use std::time::Duration;
use tracing::error;

/// Tick length of the wheel.
pub const TIMER_RESOLUTION: Duration = Duration::from_millis(100);

const WHEEL_SLOTS: usize = 512;

/// Which idle clock an entry watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum IdleKind {
    Idle,
    ReadIdle,
    WriteIdle,
}

/// Something that can be evicted for inactivity.
pub(crate) trait IdleWatch: Send + Sync {
    /// Called when an entry comes due. Returns the time left before the
    /// target is really idle, or `None` when nothing more should be scheduled.
    fn on_timer(&self, kind: IdleKind, generation: u64) -> Option<Duration>;
}

struct Entry {
    rounds: usize,
    kind: IdleKind,
    generation: u64,
    target: Weak<dyn IdleWatch>,
}

/// Hashed wheel: each slot holds entries with the number of full turns left.
pub(crate) struct Wheel {
    slots: Vec<Vec<Entry>>,
    cursor: usize,
}

impl Wheel {
    pub(crate) fn new(slots: usize) -> Self {
        let slots = slots.max(1);
        Self {
            slots: (0..slots).map(|_| Vec::new()).collect(),
            cursor: 0,
        }
    }

    fn ticks_for(d: Duration) -> usize {
        let res = TIMER_RESOLUTION.as_millis().max(1);
        let ticks = d.as_millis().div_ceil(res);
        usize::try_from(ticks).unwrap_or(usize::MAX).max(1)
    }

    fn insert(&mut self, d: Duration, kind: IdleKind, generation: u64, target: Weak<dyn IdleWatch>) {
        let ticks = Self::ticks_for(d);
        let n = self.slots.len();
        let slot = (self.cursor + ticks) % n;
        let rounds = (ticks - 1) / n;
        self.slots[slot].push(Entry {
            rounds,
            kind,
            generation,
            target,
        });
    }

    /// Move one tick forward and return entries that came due.
    fn advance(&mut self) -> Vec<Entry> {
        self.cursor = (self.cursor + 1) % self.slots.len();
        let slot = &mut self.slots[self.cursor];
        let mut due = Vec::new();
        let mut i = 0;
        while i < slot.len() {
            if slot[i].rounds == 0 {
                due.push(slot.swap_remove(i));
            } else {
                slot[i].rounds -= 1;
                i += 1;
            }
        }
        due
    }

    fn len(&self) -> usize {
        self.slots.iter().map(Vec::len).sum()
    }
}

struct TimerService {
    wheel: Mutex<Wheel>,
}

impl TimerService {
    fn lock(&self) -> std::sync::MutexGuard<'_, Wheel> {
        self.wheel.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn run(&self) {
        loop {
            thread::sleep(TIMER_RESOLUTION);
            let due = self.lock().advance();
            for entry in due {
                let Some(target) = entry.target.upgrade() else {
                    continue;
                };
                if let Some(left) = target.on_timer(entry.kind, entry.generation) {
                    self.lock()
                        .insert(left, entry.kind, entry.generation, entry.target);
                }
            }
        }
    }
}

static TIMER: OnceLock<Option<&'static TimerService>> = OnceLock::new();

fn service() -> io::Result<&'static TimerService> {
    TIMER
        .get_or_init(|| {
            let svc: &'static TimerService = Box::leak(Box::new(TimerService {
                wheel: Mutex::new(Wheel::new(WHEEL_SLOTS)),
            }));
            let spawned = thread::Builder::new()
                .name("ringnet-timer".to_string())
                .spawn(move || svc.run());
            match spawned {
                Ok(_) => Some(svc),
                Err(e) => {
                    error!(error = %e, "Failed to start timer thread");
                    None
                }
            }
        })
        .ok_or_else(|| io::Error::other("timer thread unavailable"))
}

/// Schedule an idle check on `target` after `d`.
pub(crate) fn schedule(
    d: Duration,
    kind: IdleKind,
    generation: u64,
    target: Weak<dyn IdleWatch>,
) -> io::Result<()> {
    service()?.lock().insert(d, kind, generation, target);
    Ok(())
}

/// Validate an idle duration; zero disables, sub-resolution values are rejected.
pub(crate) fn check_idle_duration(d: Duration) -> io::Result<()> {
    if !d.is_zero() && d < TIMER_RESOLUTION {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("idle timeout {d:?} is below timer resolution {TIMER_RESOLUTION:?}"),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Probe {
        fired: AtomicUsize,
        again: Option<Duration>,
    }

    impl IdleWatch for Probe {
        fn on_timer(&self, _kind: IdleKind, _generation: u64) -> Option<Duration> {
            self.fired.fetch_add(1, Ordering::SeqCst);
            self.again
        }
    }

    fn weak(p: &Arc<Probe>) -> Weak<dyn IdleWatch> {
        let target: Arc<dyn IdleWatch> = p.clone();
        Arc::downgrade(&target)
    }

    #[test]
    fn test_entry_due_after_ticks() {
        let probe = Arc::new(Probe {
            fired: AtomicUsize::new(0),
            again: None,
        });
        let mut wheel = Wheel::new(8);
        wheel.insert(Duration::from_millis(300), IdleKind::Idle, 0, weak(&probe));

        assert!(wheel.advance().is_empty());
        assert!(wheel.advance().is_empty());
        let due = wheel.advance();
        assert_eq!(due.len(), 1);
        assert_eq!(wheel.len(), 0);
    }

    #[test]
    fn test_rounds_for_long_durations() {
        let probe = Arc::new(Probe {
            fired: AtomicUsize::new(0),
            again: None,
        });
        let mut wheel = Wheel::new(4);
        // 10 ticks on a 4-slot wheel: two full turns plus two ticks
        wheel.insert(Duration::from_secs(1), IdleKind::ReadIdle, 0, weak(&probe));
        for _ in 0..9 {
            assert!(wheel.advance().is_empty());
        }
        assert_eq!(wheel.advance().len(), 1);
    }

    #[test]
    fn test_dropped_target_is_skipped() {
        let probe = Arc::new(Probe {
            fired: AtomicUsize::new(0),
            again: None,
        });
        let w = weak(&probe);
        drop(probe);
        assert!(w.upgrade().is_none());
    }

    #[test]
    fn test_check_idle_duration() {
        assert!(check_idle_duration(Duration::ZERO).is_ok());
        assert!(check_idle_duration(Duration::from_millis(100)).is_ok());
        let err = check_idle_duration(Duration::from_millis(10)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_service_fires_and_reschedules() {
        let probe = Arc::new(Probe {
            fired: AtomicUsize::new(0),
            again: Some(Duration::from_millis(100)),
        });
        schedule(Duration::from_millis(100), IdleKind::Idle, 0, weak(&probe)).unwrap();
        thread::sleep(Duration::from_millis(800));
        assert!(probe.fired.load(Ordering::SeqCst) >= 2);
    }
}
