//! Poller pool.
//!
//! Readiness-based model: each poller thread owns a `mio::Poll` and a slab of
//! registered descriptors. Sockets are registered edge-triggered, so every
//! readable event must be drained until `WouldBlock`.
//!
//! ## Cross-thread work
//!
//! Registration and interest changes go straight through the poller's cloned
//! `Registry`, which is safe from any thread. Work that must run on the
//! poller thread itself (resuming a paused reader, for instance) is pushed to
//! the job queue and the poller is woken through its `Waker`.
//!
//! ## Wait strategy
//!
//! After a poll returns events the next poll uses a zero timeout, so bursts
//! are handled without sleeping; an empty zero-timeout poll falls back to a
//! blocking wait.

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use slab::Slab;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, OnceLock, RwLock};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info};

use super::metrics::{self, Metric};

const WAKER_TOKEN: Token = Token(usize::MAX);
const EVENTS_CAPACITY: usize = 1024;

/// Work queued onto a poller thread.
pub(crate) type Job = Box<dyn FnOnce() -> io::Result<()> + Send>;

/// Callbacks a registered descriptor receives from its poller.
pub(crate) trait EventHandler: Send + Sync {
    /// Socket is readable or the peer half-closed.
    fn on_readable(&self) -> io::Result<()>;

    /// Socket is writable.
    fn on_writable(&self) -> io::Result<()> {
        Ok(())
    }

    /// The poller gave up on the descriptor after a callback error or a
    /// socket error event.
    fn on_hangup(&self, err: Option<io::Error>);
}

/// Interest set used when (re)arming a descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Arm {
    Readable,
    ReadWritable,
}

impl Arm {
    fn interest(self) -> Interest {
        match self {
            Arm::Readable => Interest::READABLE,
            Arm::ReadWritable => Interest::READABLE | Interest::WRITABLE,
        }
    }
}

/// One I/O worker.
pub(crate) struct Poller {
    id: usize,
    registry: Registry,
    waker: Waker,
    descs: Mutex<Slab<Arc<dyn EventHandler>>>,
    jobs: Mutex<Vec<Job>>,
}

impl Poller {
    fn spawn(id: usize) -> io::Result<Arc<Poller>> {
        let poll = Poll::new()?;
        let registry = poll.registry().try_clone()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        let poller = Arc::new(Poller {
            id,
            registry,
            waker,
            descs: Mutex::new(Slab::new()),
            jobs: Mutex::new(Vec::new()),
        });

        let worker = Arc::clone(&poller);
        thread::Builder::new()
            .name(format!("ringnet-poller-{id}"))
            .spawn(move || {
                if let Err(e) = worker.run(poll) {
                    error!(poller = id, error = %e, "Poller failed");
                }
            })?;

        info!(poller = id, "Poller started");
        Ok(poller)
    }

    pub(crate) fn id(&self) -> usize {
        self.id
    }

    fn descs(&self) -> MutexGuard<'_, Slab<Arc<dyn EventHandler>>> {
        self.descs.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register `fd` for readable events, returning its token.
    pub(crate) fn attach(&self, fd: RawFd, handler: Arc<dyn EventHandler>) -> io::Result<Token> {
        let token = Token(self.descs().insert(handler));
        if let Err(e) = self
            .registry
            .register(&mut SourceFd(&fd), token, Interest::READABLE)
        {
            self.descs().try_remove(token.0);
            return Err(e);
        }
        Ok(token)
    }

    /// Change the interest set of an attached descriptor.
    pub(crate) fn control(&self, fd: RawFd, token: Token, arm: Arm) -> io::Result<()> {
        self.registry
            .reregister(&mut SourceFd(&fd), token, arm.interest())
    }

    /// Unregister and forget a descriptor.
    pub(crate) fn detach(&self, fd: RawFd, token: Token) {
        let _ = self.registry.deregister(&mut SourceFd(&fd));
        self.descs().try_remove(token.0);
    }

    /// Queue a job for the poller thread and wake it.
    pub(crate) fn trigger(&self, job: Job) -> io::Result<()> {
        self.jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(job);
        self.waker.wake()
    }

    fn run_jobs(&self) {
        let jobs = std::mem::take(&mut *self.jobs.lock().unwrap_or_else(|e| e.into_inner()));
        for job in jobs {
            if let Err(e) = job() {
                debug!(poller = self.id, error = %e, "Poller job failed");
            }
        }
    }

    fn run(&self, mut poll: Poll) -> io::Result<()> {
        let mut events = Events::with_capacity(EVENTS_CAPACITY);
        let mut timeout: Option<Duration> = None;

        loop {
            if timeout.is_some() {
                metrics::add(Metric::PollNoWait, 1);
            }
            if let Err(e) = poll.poll(&mut events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e);
            }

            let count = events.iter().count();
            metrics::add(Metric::PollWait, 1);
            metrics::add(Metric::PollEvents, count as u64);
            timeout = if count > 0 { Some(Duration::ZERO) } else { None };

            for event in events.iter() {
                let token = event.token();
                if token == WAKER_TOKEN {
                    self.run_jobs();
                    continue;
                }

                let handler = match self.descs().get(token.0) {
                    Some(h) => Arc::clone(h),
                    None => continue,
                };

                if event.is_error() {
                    handler.on_hangup(None);
                    continue;
                }
                if event.is_readable() || event.is_read_closed() {
                    if let Err(e) = handler.on_readable() {
                        handler.on_hangup(Some(e));
                        continue;
                    }
                }
                if event.is_writable() {
                    if let Err(e) = handler.on_writable() {
                        handler.on_hangup(Some(e));
                    }
                }
            }
        }
    }
}

/// Round-robin set of pollers shared by the whole process.
struct PollerPool {
    pollers: RwLock<Vec<Arc<Poller>>>,
    next: AtomicUsize,
}

static POOL: OnceLock<PollerPool> = OnceLock::new();

fn pool() -> &'static PollerPool {
    POOL.get_or_init(|| PollerPool {
        pollers: RwLock::new(Vec::new()),
        next: AtomicUsize::new(0),
    })
}

impl PollerPool {
    fn grow_to(&self, n: usize) -> io::Result<()> {
        let mut pollers = self.pollers.write().unwrap_or_else(|e| e.into_inner());
        while pollers.len() < n {
            let id = pollers.len();
            pollers.push(Poller::spawn(id)?);
        }
        Ok(())
    }

    fn pick(&self) -> io::Result<Arc<Poller>> {
        {
            let pollers = self.pollers.read().unwrap_or_else(|e| e.into_inner());
            if !pollers.is_empty() {
                let i = self.next.fetch_add(1, Ordering::Relaxed) % pollers.len();
                return Ok(Arc::clone(&pollers[i]));
            }
        }
        self.grow_to(1)?;
        self.pick()
    }

    fn len(&self) -> usize {
        self.pollers.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Scale the poller pool up to `n` pollers.
///
/// The pool only grows; `n` smaller than the current count is rejected.
pub fn set_num_pollers(n: usize) -> io::Result<()> {
    let pool = pool();
    let current = pool.len();
    if n == 0 || n < current {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("number of pollers can't be smaller than current pollers [{current}]"),
        ));
    }
    pool.grow_to(n)
}

/// Number of running pollers.
pub fn num_pollers() -> usize {
    pool().len()
}

/// Pick a poller for a new descriptor, starting the first one on demand.
pub(crate) fn pick() -> io::Result<Arc<Poller>> {
    pool().pick()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::sync::mpsc;

    struct Probe {
        tx: Mutex<mpsc::Sender<&'static str>>,
    }

    impl EventHandler for Probe {
        fn on_readable(&self) -> io::Result<()> {
            let _ = self.tx.lock().unwrap().send("readable");
            Ok(())
        }

        fn on_hangup(&self, _err: Option<io::Error>) {
            let _ = self.tx.lock().unwrap().send("hangup");
        }
    }

    #[test]
    fn test_set_num_pollers_never_shrinks() {
        set_num_pollers(2).unwrap();
        assert!(num_pollers() >= 2);
        assert!(set_num_pollers(1).is_err());
        assert!(set_num_pollers(0).is_err());
    }

    #[test]
    fn test_readable_dispatch() {
        let (mut left, right) = UnixStream::pair().unwrap();
        right.set_nonblocking(true).unwrap();
        let (tx, rx) = mpsc::channel();
        let poller = pick().unwrap();
        let token = poller
            .attach(right.as_raw_fd(), Arc::new(Probe { tx: Mutex::new(tx) }))
            .unwrap();

        left.write_all(b"x").unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), "readable");
        poller.detach(right.as_raw_fd(), token);
    }

    #[test]
    fn test_trigger_runs_job_on_poller() {
        let (tx, rx) = mpsc::channel();
        let poller = pick().unwrap();
        poller
            .trigger(Box::new(move || {
                let name = thread::current().name().map(str::to_string);
                tx.send(name).unwrap();
                Ok(())
            }))
            .unwrap();
        let name = rx.recv_timeout(Duration::from_secs(5)).unwrap().unwrap();
        assert!(name.starts_with("ringnet-poller-"));
    }
}
