//! TCP connection engine.
//!
//! A [`TcpConn`] is a nonblocking socket bound to one poller, with an inbound
//! and an outbound [`RingBuffer`]. The poller fills the inbound ring with
//! `readv` and drains the outbound ring with `writev`; user code reads and
//! writes the rings from any thread.
//!
//! ## Handler modes
//!
//! - Nonblocking: `on_request` runs inline on the poller thread. Reads that
//!   lack data return `WouldBlock`, which ends the handler loop until the next
//!   readable event.
//! - Blocking: the first readable event starts a handler loop on the system
//!   worker pool. Reads block (honouring the read deadline) until data
//!   arrives. At most one handler loop runs per connection.
//!
//! Without an `on_request` handler the connection is used synchronously:
//! readers simply block on the inbound ring.
//!
//! ## Write path
//!
//! Appends are serialized by the outbound lock. After appending, the writer
//! either arms write interest with the poller, or with flush-write enabled
//! tries the `writev` itself and only arms on `WouldBlock`. The `writing` flag
//! makes sure at most one party owns the drain at a time.
//!
//! ## Lifecycle
//!
//! `Open -> Draining -> Closed`. `close` moves to Draining; the transition to
//! Closed waits for a running handler to return, flushes what it can of the
//! outbound ring, unregisters the socket and then fires `on_closed` once.

use bytes::Bytes;
use std::any::Any;
use std::fmt;
use std::io;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, RwLock, Weak};
use std::time::{Duration, Instant};
use tracing::debug;

use super::buffer::{RingBuffer, DEFAULT_CEILING, DEFAULT_INITIAL_CAPACITY};
use super::error::{again_error, closed_error, is_again, timeout_error};
use super::metrics::{self, Metric};
use super::poller::{self, Arm, EventHandler, Poller};
use super::pool::sys_pool;
use super::postpone::{PostponeWrite, POSTPONE_FLUSH_THRESHOLD};
use super::service::TcpOptions;
use super::timer::{self, IdleKind, IdleWatch};
use mio::Token;

/// Request handler invoked when a connection has unread data.
pub type OnRequest = Arc<dyn Fn(&TcpConn) -> io::Result<()> + Send + Sync>;

/// Callback invoked once after a connection is closed.
pub type OnClosed = Arc<dyn Fn(&TcpConn) + Send + Sync>;

/// Opaque per-connection user data.
pub type Metadata = Arc<dyn Any + Send + Sync>;

/// Writev attempts made while closing with output still pending.
const CLOSE_DRAIN_ATTEMPTS: usize = 8;

static INBOUND_CEILING: AtomicUsize = AtomicUsize::new(DEFAULT_CEILING);
static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);
static CLOCK_START: OnceLock<Instant> = OnceLock::new();

/// Set the inbound ring ceiling for connections created afterwards.
pub fn set_buffer_ceiling(bytes: usize) {
    INBOUND_CEILING.store(bytes.max(DEFAULT_INITIAL_CAPACITY), Ordering::Relaxed);
}

fn now_millis() -> u64 {
    let start = CLOCK_START.get_or_init(Instant::now);
    start.elapsed().as_millis() as u64
}

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ConnState {
    Open = 0,
    Draining = 1,
    Closed = 2,
}

impl ConnState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ConnState::Open,
            1 => ConnState::Draining,
            _ => ConnState::Closed,
        }
    }
}

/// What a writer does when the outbound ring is above the high-water mark.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackpressureMode {
    /// Wait, respecting the write deadline, until the ring drains below
    /// the low-water mark.
    Block,
    /// Return `WouldBlock` immediately.
    Fail,
}

/// Outbound water marks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Backpressure {
    pub high_water: usize,
    pub low_water: usize,
    pub mode: BackpressureMode,
}

impl Default for Backpressure {
    fn default() -> Self {
        Self {
            high_water: 64 * 1024 * 1024,
            low_water: 32 * 1024 * 1024,
            mode: BackpressureMode::Block,
        }
    }
}

struct Inbound {
    ring: RingBuffer,
    /// Reading stopped because the ring hit its ceiling.
    paused: bool,
}

#[derive(Default)]
struct HandlerState {
    running: bool,
    /// Input arrived while a handler was running.
    redispatch: bool,
    close_pending: bool,
}

#[derive(Default)]
struct IdleSlot {
    millis: AtomicU64,
    generation: AtomicU64,
}

pub(crate) struct ConnInner {
    id: u64,
    stream: TcpStream,
    fd: RawFd,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    poller: Arc<Poller>,
    token: OnceLock<Token>,
    weak_self: Weak<ConnInner>,

    state: AtomicU8,
    inbound: Mutex<Inbound>,
    readable: Condvar,
    outbound: Mutex<RingBuffer>,
    drained: Condvar,
    writing: AtomicBool,
    backpressure: Backpressure,
    handler: Mutex<HandlerState>,

    nonblocking: AtomicBool,
    flush_write: AtomicBool,
    postpone: PostponeWrite,

    read_deadline: Mutex<Option<Instant>>,
    write_deadline: Mutex<Option<Instant>>,
    idle: [IdleSlot; 3],
    last_read: AtomicU64,
    last_write: AtomicU64,

    metadata: Mutex<Option<Metadata>>,
    on_request: RwLock<Option<OnRequest>>,
    on_closed: Mutex<Vec<OnClosed>>,
}

/// A TCP connection multiplexed by the poller pool.
///
/// Cheap to clone; all clones refer to the same connection.
#[derive(Clone)]
pub struct TcpConn(Arc<ConnInner>);

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

fn idle_index(kind: IdleKind) -> usize {
    match kind {
        IdleKind::Idle => 0,
        IdleKind::ReadIdle => 1,
        IdleKind::WriteIdle => 2,
    }
}

impl TcpConn {
    /// Wrap a connected stream, apply `options` and attach it to a poller.
    pub(crate) fn attach(stream: TcpStream, options: &TcpOptions) -> io::Result<TcpConn> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        if !options.keep_alive.is_zero() {
            let keepalive = socket2::TcpKeepalive::new().with_time(options.keep_alive);
            socket2::SockRef::from(&stream).set_tcp_keepalive(&keepalive)?;
        }

        let local_addr = stream.local_addr()?;
        let peer_addr = stream.peer_addr()?;
        let poller = poller::pick()?;
        let ceiling = INBOUND_CEILING.load(Ordering::Relaxed);
        let backpressure = options.backpressure;
        let now = now_millis();

        let inner = Arc::new_cyclic(|weak| ConnInner {
            id: NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed),
            fd: stream.as_raw_fd(),
            stream,
            local_addr,
            peer_addr,
            poller,
            token: OnceLock::new(),
            weak_self: weak.clone(),
            state: AtomicU8::new(ConnState::Open as u8),
            inbound: Mutex::new(Inbound {
                ring: RingBuffer::with_capacity(DEFAULT_INITIAL_CAPACITY, ceiling),
                paused: false,
            }),
            readable: Condvar::new(),
            outbound: Mutex::new(RingBuffer::with_capacity(
                DEFAULT_INITIAL_CAPACITY,
                backpressure.high_water,
            )),
            drained: Condvar::new(),
            writing: AtomicBool::new(false),
            backpressure,
            handler: Mutex::new(HandlerState::default()),
            nonblocking: AtomicBool::new(options.nonblocking),
            flush_write: AtomicBool::new(options.flush_write),
            postpone: PostponeWrite::default(),
            read_deadline: Mutex::new(None),
            write_deadline: Mutex::new(None),
            idle: Default::default(),
            last_read: AtomicU64::new(now),
            last_write: AtomicU64::new(now),
            metadata: Mutex::new(None),
            on_request: RwLock::new(options.on_request.clone()),
            on_closed: Mutex::new(options.on_closed.iter().cloned().collect()),
        });
        let conn = TcpConn(inner);

        conn.set_idle_timeout(options.idle_timeout)?;
        conn.set_read_idle_timeout(options.read_idle_timeout)?;
        conn.set_write_idle_timeout(options.write_idle_timeout)?;

        if let Some(on_opened) = &options.on_opened {
            on_opened(&conn)?;
        }

        let handler: Arc<dyn EventHandler> = Arc::new(conn.clone());
        let token = conn.0.poller.attach(conn.0.fd, handler)?;
        let _ = conn.0.token.set(token);
        metrics::add(Metric::TcpConnsCreate, 1);
        debug!(
            conn_id = conn.0.id,
            poller = conn.0.poller.id(),
            peer = %conn.0.peer_addr,
            "Connection attached"
        );
        Ok(conn)
    }

    /// Process-unique connection id.
    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn state(&self) -> ConnState {
        ConnState::from_u8(self.0.state.load(Ordering::Acquire))
    }

    /// True until `close` is called or the peer goes away.
    pub fn is_active(&self) -> bool {
        self.state() == ConnState::Open
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.0.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.0.peer_addr
    }

    /// Number of buffered inbound bytes.
    pub fn len(&self) -> usize {
        lock(&self.0.inbound).ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until at least `n` bytes are buffered.
    fn wait_read(&self, n: usize) -> io::Result<MutexGuard<'_, Inbound>> {
        let mut inbound = lock(&self.0.inbound);
        if n > inbound.ring.ceiling() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("read of {n} bytes exceeds buffer ceiling"),
            ));
        }
        let mut kicked = false;
        loop {
            if inbound.ring.len() >= n {
                return Ok(inbound);
            }
            if self.state() != ConnState::Open {
                return Err(closed_error());
            }
            if self.0.nonblocking.load(Ordering::Acquire) && self.has_handler() {
                return Err(again_error());
            }
            if !kicked {
                // Output postponed by this handler must go out before we
                // wait on the peer.
                kicked = true;
                drop(inbound);
                self.kick_output()?;
                inbound = lock(&self.0.inbound);
                continue;
            }
            let deadline = *lock(&self.0.read_deadline);
            inbound = match deadline {
                None => self
                    .0
                    .readable
                    .wait(inbound)
                    .unwrap_or_else(|e| e.into_inner()),
                Some(at) => {
                    let now = Instant::now();
                    if now >= at {
                        return Err(timeout_error());
                    }
                    self.0
                        .readable
                        .wait_timeout(inbound, at - now)
                        .unwrap_or_else(|e| e.into_inner())
                        .0
                }
            };
        }
    }

    /// Bookkeeping after bytes left the inbound ring.
    fn after_consume(&self, inbound: &mut Inbound) {
        if inbound.ring.is_empty() {
            inbound.ring.shrink();
        }
        if inbound.paused && inbound.ring.len() < inbound.ring.ceiling() / 2 {
            inbound.paused = false;
            let conn = self.clone();
            let resumed = self.0.poller.trigger(Box::new(move || {
                let result = conn.on_readable();
                if result.is_err() {
                    conn.close();
                }
                result
            }));
            if let Err(e) = resumed {
                debug!(conn_id = self.0.id, error = %e, "Failed to resume reading");
            }
        }
    }

    /// Read up to `buf.len()` bytes, waiting for at least one.
    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let mut inbound = self.wait_read(1)?;
        let n = inbound.ring.read(buf);
        self.after_consume(&mut inbound);
        Ok(n)
    }

    /// Read exactly `n` bytes into a new vector.
    pub fn read_n(&self, n: usize) -> io::Result<Vec<u8>> {
        let mut inbound = self.wait_read(n)?;
        let mut out = vec![0u8; n];
        inbound.ring.read(&mut out);
        self.after_consume(&mut inbound);
        Ok(out)
    }

    /// Take exactly `n` bytes as an owned buffer.
    pub fn next(&self, n: usize) -> io::Result<Bytes> {
        self.read_n(n).map(Bytes::from)
    }

    /// Copy `n` bytes without consuming them.
    pub fn peek(&self, n: usize) -> io::Result<Vec<u8>> {
        let inbound = self.wait_read(n)?;
        let mut out = vec![0u8; n];
        inbound.ring.copy_to(&mut out);
        Ok(out)
    }

    /// Discard `n` bytes.
    pub fn skip(&self, n: usize) -> io::Result<()> {
        let mut inbound = self.wait_read(n)?;
        inbound.ring.consume(n);
        self.after_consume(&mut inbound);
        Ok(())
    }

    /// Read through the first occurrence of `delim`. Stops after `limit`
    /// bytes when the delimiter has not shown up by then. Bytes past the
    /// delimiter stay buffered.
    pub fn read_until(&self, delim: &[u8], limit: usize) -> io::Result<Vec<u8>> {
        let mut want = delim.len().clamp(1, limit.max(1));
        loop {
            let mut inbound = self.wait_read(want)?;
            let mut seen = vec![0u8; inbound.ring.len().min(limit)];
            inbound.ring.copy_to(&mut seen);
            let found = seen
                .windows(delim.len().max(1))
                .position(|w| w == delim)
                .map(|pos| pos + delim.len());
            let take = match found {
                Some(end) => end,
                None if seen.len() >= limit => limit,
                None => {
                    want = seen.len() + 1;
                    continue;
                }
            };
            seen.truncate(take);
            inbound.ring.consume(take);
            self.after_consume(&mut inbound);
            return Ok(seen);
        }
    }

    /// Queue `buf` for sending.
    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        self.writev(&[buf])
    }

    /// Queue several segments for sending, in order and without interleaving
    /// with other writers.
    pub fn writev(&self, bufs: &[&[u8]]) -> io::Result<usize> {
        self.check_write_deadline()?;
        let n = self.append_output(bufs)?;
        let sent = if self.postponed() {
            Ok(())
        } else if self.0.postpone.enabled() || !self.0.flush_write.load(Ordering::Acquire) {
            self.notify()
        } else {
            self.flush()
        };
        if let Err(e) = sent {
            self.close();
            return Err(e);
        }
        Ok(n)
    }

    fn check_write_deadline(&self) -> io::Result<()> {
        match *lock(&self.0.write_deadline) {
            Some(at) if Instant::now() >= at => Err(timeout_error()),
            _ => Ok(()),
        }
    }

    fn append_output(&self, bufs: &[&[u8]]) -> io::Result<usize> {
        let total: usize = bufs.iter().map(|b| b.len()).sum();
        let bp = self.0.backpressure;
        if total > bp.high_water {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("write of {total} bytes exceeds backpressure high water mark"),
            ));
        }

        let mut out = lock(&self.0.outbound);
        loop {
            if self.state() != ConnState::Open {
                return Err(closed_error());
            }
            if out.len() + total <= bp.high_water {
                out.append_vectored(bufs)?;
                return Ok(total);
            }
            if bp.mode == BackpressureMode::Fail {
                return Err(io::Error::new(
                    io::ErrorKind::WouldBlock,
                    "outbound buffer above high water mark",
                ));
            }
            let deadline = *lock(&self.0.write_deadline);
            out = match deadline {
                None => self.0.drained.wait(out).unwrap_or_else(|e| e.into_inner()),
                Some(at) => {
                    let now = Instant::now();
                    if now >= at {
                        return Err(timeout_error());
                    }
                    self.0
                        .drained
                        .wait_timeout(out, at - now)
                        .unwrap_or_else(|e| e.into_inner())
                        .0
                }
            };
        }
    }

    /// Wake blocked readers. Taking the lock first orders the wakeup after
    /// any reader that is between its check and its wait.
    fn wake_readers(&self) {
        drop(lock(&self.0.inbound));
        self.0.readable.notify_all();
    }

    fn wake_writers(&self) {
        drop(lock(&self.0.outbound));
        self.0.drained.notify_all();
    }

    fn outbound_len(&self) -> usize {
        lock(&self.0.outbound).len()
    }

    fn handler_running(&self) -> bool {
        lock(&self.0.handler).running
    }

    /// Leave output in the ring for the handler loop to flush on exit.
    fn postponed(&self) -> bool {
        self.0.postpone.enabled()
            && self.handler_running()
            && self.outbound_len() < POSTPONE_FLUSH_THRESHOLD
    }

    fn arm(&self, arm: Arm) -> io::Result<()> {
        match self.0.token.get() {
            Some(token) => self.0.poller.control(self.0.fd, *token, arm),
            None => Ok(()),
        }
    }

    /// Hand the drain to the poller.
    fn notify(&self) -> io::Result<()> {
        if self.0.writing.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        metrics::add(Metric::TcpWriteNotify, 1);
        self.arm(Arm::ReadWritable)
    }

    /// Try the writev on this thread, falling back to the poller.
    fn flush(&self) -> io::Result<()> {
        if self.0.writing.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        match self.write_out() {
            Err(e) if is_again(&e) => {
                metrics::add(Metric::TcpWriteNotify, 1);
                return self.arm(Arm::ReadWritable);
            }
            Err(e) => return Err(e),
            Ok(left) => {
                metrics::add(Metric::TcpFlushCalls, 1);
                if left > 0 {
                    metrics::add(Metric::TcpWriteNotify, 1);
                    return self.arm(Arm::ReadWritable);
                }
            }
        }
        self.0.writing.store(false, Ordering::Release);
        // Catch bytes appended between the drain and the unlock.
        if self.outbound_len() > 0 && !self.0.writing.swap(true, Ordering::AcqRel) {
            metrics::add(Metric::TcpWriteNotify, 1);
            return self.arm(Arm::ReadWritable);
        }
        Ok(())
    }

    /// Push out anything left in the outbound ring.
    fn kick_output(&self) -> io::Result<()> {
        if self.outbound_len() == 0 {
            return Ok(());
        }
        if self.0.flush_write.load(Ordering::Acquire) {
            self.flush()
        } else {
            self.notify()
        }
    }

    /// One writev from the outbound ring. Returns the bytes still queued.
    fn write_out(&self) -> io::Result<usize> {
        let mut out = lock(&self.0.outbound);
        if out.is_empty() {
            return Ok(0);
        }
        metrics::add(Metric::TcpWritevCalls, 1);
        match out.write_to(self.0.fd) {
            Ok((_, blocks)) => {
                metrics::add(Metric::TcpWritevBlocks, blocks as u64);
                self.0.postpone.observe_batch(blocks);
                self.0.last_write.store(now_millis(), Ordering::Relaxed);
                if out.len() <= self.0.backpressure.low_water {
                    self.0.drained.notify_all();
                }
                if out.is_empty() {
                    out.shrink();
                }
                Ok(out.len())
            }
            Err(e) => {
                metrics::add(Metric::TcpWritevFails, 1);
                Err(e)
            }
        }
    }

    fn has_handler(&self) -> bool {
        self.0
            .on_request
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    fn request_handler(&self) -> Option<OnRequest> {
        self.0
            .on_request
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn try_begin_handler(&self) -> bool {
        let mut hs = lock(&self.0.handler);
        if self.state() != ConnState::Open {
            return false;
        }
        if hs.running {
            hs.redispatch = true;
            return false;
        }
        hs.running = true;
        true
    }

    /// Release the handler slot. Returns true when the slot was kept because
    /// input arrived while the handler ran and must be handled again.
    fn end_handler(&self) -> bool {
        if let Err(e) = self.kick_output() {
            debug!(conn_id = self.0.id, error = %e, "Flush after handler failed");
            self.close();
        }
        let close_pending = {
            let mut hs = lock(&self.0.handler);
            if !hs.close_pending
                && std::mem::take(&mut hs.redispatch)
                && self.state() == ConnState::Open
                && !self.is_empty()
            {
                return true;
            }
            hs.running = false;
            hs.redispatch = false;
            std::mem::take(&mut hs.close_pending)
        };
        if close_pending {
            self.finish_close();
        }
        false
    }

    fn dispatch(&self) -> io::Result<()> {
        let Some(handler) = self.request_handler() else {
            return Ok(());
        };
        if !self.try_begin_handler() {
            self.0.postpone.inc_contention();
            return Ok(());
        }

        if self.0.nonblocking.load(Ordering::Acquire) {
            loop {
                let result = self.run_inline(&handler);
                if result.is_err() {
                    while self.end_handler() {}
                    return result;
                }
                if !self.end_handler() {
                    return Ok(());
                }
            }
        }

        let conn = self.clone();
        if let Err(e) = sys_pool().submit(move || conn.handler_loop(handler)) {
            while self.end_handler() {}
            return Err(e);
        }
        Ok(())
    }

    fn run_inline(&self, handler: &OnRequest) -> io::Result<()> {
        self.0.postpone.reset_loop_count();
        while self.len() > 0 && self.state() != ConnState::Closed {
            self.0.postpone.inc_loop_count();
            match handler(self) {
                Ok(()) => continue,
                Err(e) if is_again(&e) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
        self.0.postpone.check_loop_count();
        Ok(())
    }

    fn handler_loop(&self, handler: OnRequest) {
        loop {
            while self.len() > 0 && self.state() != ConnState::Closed {
                match handler(self) {
                    Ok(()) => {}
                    Err(e) if is_again(&e) => break,
                    Err(e) => {
                        debug!(conn_id = self.0.id, error = %e, "Handler failed, closing connection");
                        self.close();
                        break;
                    }
                }
            }
            self.0.postpone.reset_contention();
            if !self.end_handler() {
                return;
            }
        }
    }

    /// Close the connection. Safe to call any number of times from any thread.
    pub fn close(&self) {
        if self
            .0
            .state
            .compare_exchange(
                ConnState::Open as u8,
                ConnState::Draining as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }
        self.wake_readers();
        self.wake_writers();

        {
            let mut hs = lock(&self.0.handler);
            if hs.running {
                hs.close_pending = true;
                return;
            }
        }
        self.finish_close();
    }

    fn finish_close(&self) {
        if self
            .0
            .state
            .compare_exchange(
                ConnState::Draining as u8,
                ConnState::Closed as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return;
        }

        {
            let mut out = lock(&self.0.outbound);
            for _ in 0..CLOSE_DRAIN_ATTEMPTS {
                if out.is_empty() || out.write_to(self.0.fd).is_err() {
                    break;
                }
            }
        }
        if let Some(token) = self.0.token.get() {
            self.0.poller.detach(self.0.fd, *token);
        }
        let _ = self.0.stream.shutdown(Shutdown::Both);
        self.wake_readers();
        self.wake_writers();
        for slot in &self.0.idle {
            slot.generation.fetch_add(1, Ordering::AcqRel);
        }
        metrics::add(Metric::TcpConnsClose, 1);
        debug!(conn_id = self.0.id, peer = %self.0.peer_addr, "Connection closed");

        let callbacks = std::mem::take(&mut *lock(&self.0.on_closed));
        for on_closed in callbacks.iter().rev() {
            on_closed(self);
        }
        // Drop user state so cycles through metadata and handlers are broken.
        lock(&self.0.metadata).take();
        self.0
            .on_request
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }

    /// Install the request handler. Buffered input is dispatched right away.
    pub fn set_on_request(&self, handler: OnRequest) {
        *self
            .0
            .on_request
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(handler);
        if self.len() > 0 {
            let conn = self.clone();
            let _ = self.0.poller.trigger(Box::new(move || conn.dispatch()));
        }
    }

    /// Add a close callback. Callbacks run in reverse registration order.
    pub fn set_on_closed(&self, on_closed: OnClosed) {
        lock(&self.0.on_closed).push(on_closed);
    }

    /// Choose between inline (true) and worker-pool (false) handler loops.
    pub fn set_nonblocking(&self, nonblocking: bool) {
        self.0.nonblocking.store(nonblocking, Ordering::Release);
    }

    /// Try writes eagerly from the writer's thread.
    pub fn set_flush_write(&self, flush_write: bool) {
        self.0.flush_write.store(flush_write, Ordering::Release);
    }

    /// Turn postpone-write on or off; the automatic heuristic may change it
    /// again later.
    pub fn set_postpone_write(&self, postpone: bool) {
        self.0.postpone.set(postpone);
    }

    pub fn set_keep_alive(&self, period: Duration) -> io::Result<()> {
        let sock = socket2::SockRef::from(&self.0.stream);
        if period.is_zero() {
            return sock.set_keepalive(false);
        }
        sock.set_tcp_keepalive(&socket2::TcpKeepalive::new().with_time(period))
    }

    /// Set both read and write deadlines.
    pub fn set_deadline(&self, deadline: Option<Instant>) {
        self.set_read_deadline(deadline);
        self.set_write_deadline(deadline);
    }

    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        *lock(&self.0.read_deadline) = deadline;
        self.wake_readers();
    }

    pub fn set_write_deadline(&self, deadline: Option<Instant>) {
        *lock(&self.0.write_deadline) = deadline;
        self.wake_writers();
    }

    /// Close after `d` without traffic in either direction. Zero disables.
    pub fn set_idle_timeout(&self, d: Duration) -> io::Result<()> {
        self.set_idle(IdleKind::Idle, d)
    }

    /// Close after `d` without inbound traffic. Zero disables.
    pub fn set_read_idle_timeout(&self, d: Duration) -> io::Result<()> {
        self.set_idle(IdleKind::ReadIdle, d)
    }

    /// Close after `d` without outbound traffic. Zero disables.
    pub fn set_write_idle_timeout(&self, d: Duration) -> io::Result<()> {
        self.set_idle(IdleKind::WriteIdle, d)
    }

    fn set_idle(&self, kind: IdleKind, d: Duration) -> io::Result<()> {
        timer::check_idle_duration(d)?;
        let slot = &self.0.idle[idle_index(kind)];
        slot.millis.store(d.as_millis() as u64, Ordering::Release);
        let generation = slot.generation.fetch_add(1, Ordering::AcqRel) + 1;
        if d.is_zero() {
            return Ok(());
        }
        let target: Weak<dyn IdleWatch> = self.0.weak_self.clone();
        timer::schedule(d, kind, generation, target)
    }

    pub fn set_metadata(&self, metadata: Metadata) {
        *lock(&self.0.metadata) = Some(metadata);
    }

    pub fn metadata(&self) -> Option<Metadata> {
        lock(&self.0.metadata).clone()
    }
}

impl EventHandler for TcpConn {
    fn on_readable(&self) -> io::Result<()> {
        if self.state() == ConnState::Closed {
            return Ok(());
        }

        let mut received = false;
        let mut eof = false;
        {
            let mut inbound = lock(&self.0.inbound);
            loop {
                if inbound.ring.is_full() {
                    inbound.paused = true;
                    break;
                }
                metrics::add(Metric::TcpReadvCalls, 1);
                match inbound.ring.read_from(self.0.fd) {
                    Ok(0) => {
                        eof = true;
                        break;
                    }
                    Ok(n) => {
                        metrics::add(Metric::TcpReadvBytes, n as u64);
                        received = true;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        metrics::add(Metric::TcpReadvFails, 1);
                        break;
                    }
                    Err(e) if e.kind() == io::ErrorKind::OutOfMemory => {
                        inbound.paused = true;
                        break;
                    }
                    Err(e) => {
                        metrics::add(Metric::TcpReadvFails, 1);
                        return Err(e);
                    }
                }
            }
        }

        if received {
            self.0.last_read.store(now_millis(), Ordering::Relaxed);
            self.0.readable.notify_all();
            self.dispatch()?;
        }
        if eof {
            debug!(conn_id = self.0.id, "Peer closed connection");
            self.close();
        }
        Ok(())
    }

    fn on_writable(&self) -> io::Result<()> {
        if self.state() == ConnState::Closed || !self.0.writing.load(Ordering::Acquire) {
            return Ok(());
        }
        metrics::add(Metric::TcpOnWriteCalls, 1);
        loop {
            match self.write_out() {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if is_again(&e) => return Ok(()),
                Err(e) => return Err(e),
            }
        }
        self.arm(Arm::Readable)?;
        self.0.writing.store(false, Ordering::Release);
        if self.outbound_len() > 0 && !self.0.writing.swap(true, Ordering::AcqRel) {
            metrics::add(Metric::TcpWriteNotify, 1);
            self.arm(Arm::ReadWritable)?;
        }
        Ok(())
    }

    fn on_hangup(&self, err: Option<io::Error>) {
        match err {
            Some(e) => debug!(conn_id = self.0.id, error = %e, "Connection error"),
            None => debug!(conn_id = self.0.id, "Socket error event"),
        }
        self.close();
    }
}

impl IdleWatch for ConnInner {
    fn on_timer(&self, kind: IdleKind, generation: u64) -> Option<Duration> {
        if ConnState::from_u8(self.state.load(Ordering::Acquire)) != ConnState::Open {
            return None;
        }
        let slot = &self.idle[idle_index(kind)];
        if slot.generation.load(Ordering::Acquire) != generation {
            return None;
        }
        let limit = slot.millis.load(Ordering::Acquire);
        if limit == 0 {
            return None;
        }
        let last = match kind {
            IdleKind::Idle => self
                .last_read
                .load(Ordering::Relaxed)
                .max(self.last_write.load(Ordering::Relaxed)),
            IdleKind::ReadIdle => self.last_read.load(Ordering::Relaxed),
            IdleKind::WriteIdle => self.last_write.load(Ordering::Relaxed),
        };
        let elapsed = now_millis().saturating_sub(last);
        if elapsed < limit {
            return Some(Duration::from_millis(limit - elapsed));
        }

        let conn = TcpConn(self.weak_self.upgrade()?);
        debug!(conn_id = self.id, kind = ?kind, "Idle timeout, closing connection");
        let target = conn.clone();
        if sys_pool().submit(move || target.close()).is_err() {
            conn.close();
        }
        None
    }
}

impl fmt::Debug for TcpConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpConn")
            .field("id", &self.0.id)
            .field("peer", &self.0.peer_addr)
            .field("state", &self.state())
            .finish()
    }
}

impl io::Read for TcpConn {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match TcpConn::read(self, buf) {
            Err(e) if super::error::is_closed(&e) => Ok(0),
            other => other,
        }
    }
}

impl io::Write for TcpConn {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        TcpConn::write(self, buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.kick_output()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::mpsc;

    fn pair(options: &TcpOptions) -> (TcpConn, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        let conn = TcpConn::attach(server, options).unwrap();
        (conn, client)
    }

    fn sync_options() -> TcpOptions {
        TcpOptions::default().with_nonblocking(false)
    }

    #[test]
    fn test_blocking_read_and_write() {
        let (conn, mut peer) = pair(&sync_options());
        peer.write_all(b"hello").unwrap();

        let mut buf = [0u8; 5];
        let mut got = 0;
        while got < 5 {
            got += conn.read(&mut buf[got..]).unwrap();
        }
        assert_eq!(&buf, b"hello");

        conn.write(b"world").unwrap();
        let mut echo = [0u8; 5];
        peer.read_exact(&mut echo).unwrap();
        assert_eq!(&echo, b"world");
    }

    #[test]
    fn test_read_n_peek_skip() {
        let (conn, mut peer) = pair(&sync_options());
        peer.write_all(b"abcdefgh").unwrap();

        assert_eq!(conn.peek(3).unwrap(), b"abc");
        conn.skip(2).unwrap();
        assert_eq!(conn.read_n(3).unwrap(), b"cde");
        assert_eq!(&conn.next(3).unwrap()[..], b"fgh");
        assert_eq!(conn.len(), 0);
    }

    #[test]
    fn test_read_until_keeps_the_rest() {
        let (conn, mut peer) = pair(&sync_options());
        peer.write_all(b"GET / HT").unwrap();
        thread_sleep(50);
        peer.write_all(b"TP/1.1\r\n\r\n\x81\x00").unwrap();

        let head = conn.read_until(b"\r\n\r\n", 1024).unwrap();
        assert_eq!(head, b"GET / HTTP/1.1\r\n\r\n");
        assert_eq!(conn.read_n(2).unwrap(), [0x81, 0x00]);

        peer.write_all(b"no delimiter here").unwrap();
        assert_eq!(conn.read_until(b"\r\n", 5).unwrap(), b"no de");
        assert_eq!(conn.read_n(12).unwrap(), b"limiter here");
    }

    #[test]
    fn test_read_deadline_times_out() {
        let (conn, _peer) = pair(&sync_options());
        conn.set_read_deadline(Some(Instant::now() + Duration::from_millis(50)));
        let mut buf = [0u8; 1];
        let err = conn.read(&mut buf).unwrap_err();
        assert!(super::super::error::is_timeout(&err));
    }

    #[test]
    fn test_write_deadline_in_past_fails() {
        let (conn, _peer) = pair(&sync_options());
        conn.set_write_deadline(Some(Instant::now()));
        let err = conn.write(b"x").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn test_flush_write_sends_eagerly() {
        let (conn, mut peer) = pair(&sync_options().with_flush_write(true));
        conn.writev(&[b"ab", b"cd"]).unwrap();
        let mut buf = [0u8; 4];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"abcd");
    }

    #[test]
    fn test_nonblocking_handler_echo() {
        let handler: OnRequest = Arc::new(|conn: &TcpConn| {
            let data = conn.read_n(conn.len())?;
            conn.write(&data)?;
            Ok(())
        });
        let (conn, mut peer) = pair(&TcpOptions::default().with_on_request(handler));
        peer.write_all(b"ping").unwrap();
        let mut buf = [0u8; 4];
        peer.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
        conn.close();
    }

    #[test]
    fn test_nonblocking_read_returns_again() {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let handler: OnRequest = Arc::new(move |conn: &TcpConn| {
            match conn.read_n(4) {
                Ok(frame) => {
                    let _ = tx.lock().unwrap().send(frame);
                    Ok(())
                }
                Err(e) => Err(e),
            }
        });
        let (_conn, mut peer) = pair(&TcpOptions::default().with_on_request(handler));
        peer.write_all(b"ab").unwrap();
        thread_sleep(50);
        peer.write_all(b"cd").unwrap();
        let frame = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(frame, b"abcd");
    }

    #[test]
    fn test_on_closed_fires_once_on_peer_close() {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let on_closed: OnClosed = Arc::new(move |_conn: &TcpConn| {
            let _ = tx.lock().unwrap().send(());
        });
        let (conn, peer) = pair(&sync_options().with_on_closed(on_closed));
        drop(peer);
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        conn.close();
        conn.close();
        assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
        assert_eq!(conn.state(), ConnState::Closed);
    }

    #[test]
    fn test_close_is_idempotent_and_fails_io() {
        let (conn, _peer) = pair(&sync_options());
        conn.close();
        conn.close();
        assert!(!conn.is_active());
        let err = conn.write(b"x").unwrap_err();
        assert!(super::super::error::is_closed(&err));
    }

    #[test]
    fn test_buffered_bytes_readable_after_peer_close() {
        let (conn, mut peer) = pair(&sync_options());
        peer.write_all(b"bye").unwrap();
        drop(peer);
        thread_sleep(100);
        assert_eq!(conn.read_n(3).unwrap(), b"bye");
        let mut buf = [0u8; 1];
        assert!(conn.read(&mut buf).is_err());
    }

    #[test]
    fn test_idle_timeout_closes_silent_connection() {
        let (tx, rx) = mpsc::channel();
        let tx = Mutex::new(tx);
        let on_closed: OnClosed = Arc::new(move |_conn: &TcpConn| {
            let _ = tx.lock().unwrap().send(Instant::now());
        });
        let start = Instant::now();
        let (conn, _peer) = pair(&sync_options().with_on_closed(on_closed));
        conn.set_idle_timeout(Duration::from_millis(300)).unwrap();
        let closed_at = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        let elapsed = closed_at - start;
        assert!(elapsed >= Duration::from_millis(290));
        assert!(elapsed <= Duration::from_millis(600) + 2 * timer::TIMER_RESOLUTION);
    }

    #[test]
    fn test_idle_timeout_below_resolution_rejected() {
        let (conn, _peer) = pair(&sync_options());
        let err = conn.set_idle_timeout(Duration::from_millis(5)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn test_write_above_high_water_rejected() {
        let bp = Backpressure {
            high_water: 8,
            low_water: 4,
            mode: BackpressureMode::Fail,
        };
        let (conn, _peer) = pair(&sync_options().with_backpressure(bp));
        let err = conn.write(&[0u8; 16]).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    const MIB: usize = 1024 * 1024;

    fn small_backpressure(mode: BackpressureMode) -> Backpressure {
        Backpressure {
            high_water: MIB,
            low_water: MIB / 2,
            mode,
        }
    }

    /// Write `chunk`-sized blocks until a write fails. The peer never reads,
    /// so the socket buffers fill and the outbound ring backs up.
    fn write_until_err(conn: &TcpConn, chunk: usize) -> (usize, io::Error) {
        let block = vec![0x5au8; chunk];
        for i in 0..4096 {
            if let Err(e) = conn.write(&block) {
                return (i, e);
            }
        }
        panic!("outbound ring never backed up");
    }

    #[test]
    fn test_fail_mode_returns_would_block() {
        let options = sync_options().with_backpressure(small_backpressure(BackpressureMode::Fail));
        let (conn, _peer) = pair(&options);
        let chunk = 64 * 1024;
        let (written, err) = write_until_err(&conn, chunk);
        assert!(written > 0);
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        assert!(conn.outbound_len() + chunk > MIB);
        assert!(conn.is_active());
    }

    #[test]
    fn test_block_mode_waits_for_peer() {
        let options = sync_options().with_backpressure(small_backpressure(BackpressureMode::Block));
        let (conn, mut peer) = pair(&options);
        let total = 32 * MIB;
        let done = Arc::new(AtomicBool::new(false));

        let writer = {
            let conn = conn.clone();
            let done = Arc::clone(&done);
            std::thread::spawn(move || {
                let block = vec![0x5au8; MIB / 4];
                let mut sent = 0;
                while sent < total {
                    sent += conn.write(&block)?;
                }
                done.store(true, Ordering::SeqCst);
                Ok::<usize, io::Error>(sent)
            })
        };

        thread_sleep(500);
        assert!(!done.load(Ordering::SeqCst));
        assert!(conn.outbound_len() > MIB / 2);

        let mut received = vec![0u8; total];
        peer.read_exact(&mut received).unwrap();
        assert!(received.iter().all(|&b| b == 0x5a));
        assert_eq!(writer.join().unwrap().unwrap(), total);
        assert!(done.load(Ordering::SeqCst));
    }

    #[test]
    fn test_block_mode_honours_write_deadline() {
        let options = sync_options().with_backpressure(small_backpressure(BackpressureMode::Block));
        let (conn, _peer) = pair(&options);
        let start = Instant::now();
        let timeout = Duration::from_millis(300);
        conn.set_write_deadline(Some(start + timeout));

        let (_, err) = write_until_err(&conn, 64 * 1024);
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert!(start.elapsed() >= timeout);
        assert!(start.elapsed() < timeout + Duration::from_secs(5));
    }

    #[test]
    fn test_full_inbound_ring_pauses_reading() {
        let ceiling = 64 * 1024;
        let (conn, mut peer) = pair(&sync_options());
        *lock(&conn.0.inbound) = Inbound {
            ring: RingBuffer::with_capacity(DEFAULT_INITIAL_CAPACITY, ceiling),
            paused: false,
        };

        let total = MIB;
        let data: Vec<u8> = (0..total).map(|i| (i % 251) as u8).collect();
        let sender = {
            let data = data.clone();
            std::thread::spawn(move || peer.write_all(&data).map(|_| peer))
        };

        let paused = || lock(&conn.0.inbound).paused;
        let end = Instant::now() + Duration::from_secs(5);
        while !paused() && Instant::now() < end {
            thread_sleep(10);
        }
        assert!(paused());
        thread_sleep(100);
        assert_eq!(conn.len(), ceiling);

        // Draining below half the ceiling resumes reading.
        let skipped = 40 * 1024;
        conn.skip(skipped).unwrap();
        let end = Instant::now() + Duration::from_secs(5);
        while conn.len() < ceiling && Instant::now() < end {
            thread_sleep(10);
        }
        assert_eq!(conn.len(), ceiling);

        let mut rest = vec![0u8; total - skipped];
        let mut got = 0;
        let mut buf = [0u8; 8 * 1024];
        while got < rest.len() {
            let n = conn.read(&mut buf).unwrap();
            rest[got..got + n].copy_from_slice(&buf[..n]);
            got += n;
        }
        assert_eq!(&rest[..], &data[skipped..]);
        sender.join().unwrap().unwrap();
    }

    #[test]
    fn test_metadata_cleared_on_close() {
        let (conn, _peer) = pair(&sync_options());
        conn.set_metadata(Arc::new(7u32));
        let meta = conn.metadata().unwrap();
        assert_eq!(meta.downcast_ref::<u32>(), Some(&7));
        conn.close();
        assert!(conn.metadata().is_none());
    }

    fn thread_sleep(ms: u64) {
        std::thread::sleep(Duration::from_millis(ms));
    }
}
