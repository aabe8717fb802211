//! The transport a websocket connection runs on.
//!
//! Framing only needs a small capability set, captured by [`RawConn`]. Plain
//! TCP uses the poller-driven [`TcpConn`]; TLS sessions, whose record layer
//! lives outside this crate, are wrapped in a [`StreamConn`].

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::runtime::{self, Metadata, TcpConn};

/// Byte transport underneath a websocket connection.
///
/// `write` and `writev` either queue or send the whole input, or fail.
pub trait RawConn: Send + Sync + 'static {
    /// Read up to `buf.len()` bytes, blocking for at least one.
    fn read(&self, buf: &mut [u8]) -> io::Result<usize>;

    fn write(&self, buf: &[u8]) -> io::Result<usize>;

    /// Write several segments in order.
    fn writev(&self, bufs: &[&[u8]]) -> io::Result<usize>;

    /// Read through the first occurrence of `delim`, or `limit` bytes if it
    /// has not shown up by then. Bytes past the delimiter stay unread.
    ///
    /// The default reads one byte per call; buffered transports override it.
    fn read_until(&self, delim: &[u8], limit: usize) -> io::Result<Vec<u8>> {
        let mut out = Vec::with_capacity(limit.min(512));
        let mut byte = [0u8; 1];
        while out.len() < limit && (delim.is_empty() || !out.ends_with(delim)) {
            if self.read(&mut byte)? == 0 {
                return Err(io::ErrorKind::UnexpectedEof.into());
            }
            out.push(byte[0]);
        }
        Ok(out)
    }

    /// Idempotent.
    fn close(&self);

    fn is_active(&self) -> bool;

    fn local_addr(&self) -> SocketAddr;

    fn peer_addr(&self) -> SocketAddr;

    fn set_deadline(&self, deadline: Option<Instant>) {
        self.set_read_deadline(deadline);
        self.set_write_deadline(deadline);
    }

    fn set_read_deadline(&self, deadline: Option<Instant>);

    fn set_write_deadline(&self, deadline: Option<Instant>);

    fn set_idle_timeout(&self, d: Duration) -> io::Result<()>;

    fn set_read_idle_timeout(&self, d: Duration) -> io::Result<()>;

    fn set_write_idle_timeout(&self, d: Duration) -> io::Result<()>;

    fn set_metadata(&self, metadata: Metadata);

    fn metadata(&self) -> Option<Metadata>;

    /// The poller-driven connection underneath, if any. Request and close
    /// callbacks are only available there.
    fn as_tcp(&self) -> Option<&TcpConn> {
        None
    }
}

impl RawConn for TcpConn {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        TcpConn::read(self, buf)
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        TcpConn::write(self, buf)
    }

    fn writev(&self, bufs: &[&[u8]]) -> io::Result<usize> {
        TcpConn::writev(self, bufs)
    }

    fn read_until(&self, delim: &[u8], limit: usize) -> io::Result<Vec<u8>> {
        TcpConn::read_until(self, delim, limit)
    }

    fn close(&self) {
        TcpConn::close(self)
    }

    fn is_active(&self) -> bool {
        TcpConn::is_active(self)
    }

    fn local_addr(&self) -> SocketAddr {
        TcpConn::local_addr(self)
    }

    fn peer_addr(&self) -> SocketAddr {
        TcpConn::peer_addr(self)
    }

    fn set_read_deadline(&self, deadline: Option<Instant>) {
        TcpConn::set_read_deadline(self, deadline)
    }

    fn set_write_deadline(&self, deadline: Option<Instant>) {
        TcpConn::set_write_deadline(self, deadline)
    }

    fn set_idle_timeout(&self, d: Duration) -> io::Result<()> {
        TcpConn::set_idle_timeout(self, d)
    }

    fn set_read_idle_timeout(&self, d: Duration) -> io::Result<()> {
        TcpConn::set_read_idle_timeout(self, d)
    }

    fn set_write_idle_timeout(&self, d: Duration) -> io::Result<()> {
        TcpConn::set_write_idle_timeout(self, d)
    }

    fn set_metadata(&self, metadata: Metadata) {
        TcpConn::set_metadata(self, metadata)
    }

    fn metadata(&self) -> Option<Metadata> {
        TcpConn::metadata(self)
    }

    fn as_tcp(&self) -> Option<&TcpConn> {
        Some(self)
    }
}

/// Client side TLS, used by `dial` for `wss://` urls.
pub trait TlsConnector: Send + Sync {
    /// Run the client handshake over `stream` and wrap the session.
    fn connect(&self, server_name: &str, stream: TcpStream) -> io::Result<Arc<dyn RawConn>>;
}

/// Server side TLS. Set with `ServerOptions::with_tls_acceptor`.
pub trait TlsAcceptor: Send + Sync {
    /// Run the server handshake over a freshly accepted `stream`.
    fn accept(&self, stream: TcpStream) -> io::Result<Arc<dyn RawConn>>;
}

type Reader = Box<dyn Read + Send>;
type Writer = Box<dyn Write + Send>;

/// Chunk size for `read_until` on a [`StreamConn`].
const READ_CHUNK: usize = 1024;

struct ReadHalf {
    stream: Reader,
    /// Read past a delimiter; served before the stream.
    pending: Vec<u8>,
}

#[derive(Default)]
struct Timeouts {
    read_deadline: Option<Instant>,
    write_deadline: Option<Instant>,
    idle: Option<Duration>,
    read_idle: Option<Duration>,
    write_idle: Option<Duration>,
}

/// A [`RawConn`] over blocking reader and writer halves of a stream, such as
/// the two sides of a TLS session.
///
/// `socket` is the TCP socket underneath; it is used for addresses, socket
/// timeouts and shutdown. Deadlines and idle timeouts apply to calls started
/// after they are set. `writev` loops `write` since the record layer cannot
/// gather.
pub struct StreamConn {
    socket: TcpStream,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    reader: Mutex<ReadHalf>,
    writer: Mutex<Writer>,
    timeouts: Mutex<Timeouts>,
    closed: AtomicBool,
    metadata: Mutex<Option<Metadata>>,
}

fn lock<T: ?Sized>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

enum Expiry {
    Deadline,
    Idle,
}

impl StreamConn {
    pub fn new(
        socket: TcpStream,
        reader: impl Read + Send + 'static,
        writer: impl Write + Send + 'static,
    ) -> io::Result<StreamConn> {
        Ok(StreamConn {
            local_addr: socket.local_addr()?,
            peer_addr: socket.peer_addr()?,
            socket,
            reader: Mutex::new(ReadHalf {
                stream: Box::new(reader),
                pending: Vec::new(),
            }),
            writer: Mutex::new(Box::new(writer)),
            timeouts: Mutex::new(Timeouts::default()),
            closed: AtomicBool::new(false),
            metadata: Mutex::new(None),
        })
    }

    /// Plain TCP through the same blocking path, mostly for tests and for
    /// peers that are not multiplexed.
    pub fn from_tcp(stream: TcpStream) -> io::Result<StreamConn> {
        let reader = stream.try_clone()?;
        let writer = stream.try_clone()?;
        StreamConn::new(stream, reader, writer)
    }

    /// Pick the socket timeout for the next call and what its expiry means.
    fn arm(
        deadline: Option<Instant>,
        idle: [Option<Duration>; 2],
    ) -> io::Result<Option<(Duration, Expiry)>> {
        let idle = idle.into_iter().flatten().min();
        let until_deadline = match deadline {
            Some(at) => {
                let now = Instant::now();
                if now >= at {
                    return Err(runtime::timeout_error());
                }
                Some(at - now)
            }
            None => None,
        };
        Ok(match (until_deadline, idle) {
            (Some(d), Some(i)) if i < d => Some((i, Expiry::Idle)),
            (Some(d), _) => Some((d, Expiry::Deadline)),
            (None, Some(i)) => Some((i, Expiry::Idle)),
            (None, None) => None,
        })
    }

    fn expired(&self, e: io::Error, expiry: Option<Expiry>) -> io::Error {
        let timed_out = matches!(
            e.kind(),
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
        );
        match expiry {
            Some(Expiry::Deadline) if timed_out => runtime::timeout_error(),
            Some(Expiry::Idle) if timed_out => {
                tracing::debug!(peer = %self.peer_addr, "Idle timeout, closing stream");
                self.close();
                runtime::closed_error()
            }
            _ => e,
        }
    }

    /// One read from the stream under the current deadline and idle timeouts.
    fn read_stream(&self, stream: &mut Reader, buf: &mut [u8]) -> io::Result<usize> {
        let armed = {
            let t = lock(&self.timeouts);
            Self::arm(t.read_deadline, [t.idle, t.read_idle])?
        };
        self.socket.set_read_timeout(armed.as_ref().map(|(d, _)| *d))?;
        match stream.read(buf) {
            Ok(0) if !buf.is_empty() => {
                self.close();
                Err(runtime::closed_error())
            }
            Ok(n) => Ok(n),
            Err(e) => Err(self.expired(e, armed.map(|(_, x)| x))),
        }
    }

    fn check_open(&self) -> io::Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(runtime::closed_error());
        }
        Ok(())
    }
}

impl RawConn for StreamConn {
    fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        self.check_open()?;
        let mut half = lock(&self.reader);
        if half.pending.is_empty() {
            return self.read_stream(&mut half.stream, buf);
        }
        let n = buf.len().min(half.pending.len());
        buf[..n].copy_from_slice(&half.pending[..n]);
        half.pending.drain(..n);
        Ok(n)
    }

    fn read_until(&self, delim: &[u8], limit: usize) -> io::Result<Vec<u8>> {
        self.check_open()?;
        let mut half = lock(&self.reader);
        let mut chunk = [0u8; READ_CHUNK];
        loop {
            let window = half.pending.len().min(limit);
            let found = half.pending[..window]
                .windows(delim.len().max(1))
                .position(|w| w == delim)
                .map(|pos| pos + delim.len());
            let take = match found {
                Some(end) => end,
                None if window >= limit => limit,
                None => {
                    let n = self.read_stream(&mut half.stream, &mut chunk)?;
                    half.pending.extend_from_slice(&chunk[..n]);
                    continue;
                }
            };
            let rest = half.pending.split_off(take);
            return Ok(std::mem::replace(&mut half.pending, rest));
        }
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        self.writev(&[buf])
    }

    fn writev(&self, bufs: &[&[u8]]) -> io::Result<usize> {
        self.check_open()?;
        let mut writer = lock(&self.writer);
        let armed = {
            let t = lock(&self.timeouts);
            Self::arm(t.write_deadline, [t.idle, t.write_idle])?
        };
        self.socket.set_write_timeout(armed.as_ref().map(|(d, _)| *d))?;
        let mut n = 0;
        let mut result = Ok(());
        for b in bufs {
            result = writer.write_all(b);
            if result.is_err() {
                break;
            }
            n += b.len();
        }
        match result.and_then(|()| writer.flush()) {
            Ok(()) => Ok(n),
            Err(e) => Err(self.expired(e, armed.map(|(_, x)| x))),
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.socket.shutdown(Shutdown::Both);
        lock(&self.metadata).take();
    }

    fn is_active(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    fn set_read_deadline(&self, deadline: Option<Instant>) {
        lock(&self.timeouts).read_deadline = deadline;
    }

    fn set_write_deadline(&self, deadline: Option<Instant>) {
        lock(&self.timeouts).write_deadline = deadline;
    }

    fn set_idle_timeout(&self, d: Duration) -> io::Result<()> {
        runtime::check_idle_duration(d)?;
        lock(&self.timeouts).idle = Some(d).filter(|d| !d.is_zero());
        Ok(())
    }

    fn set_read_idle_timeout(&self, d: Duration) -> io::Result<()> {
        runtime::check_idle_duration(d)?;
        lock(&self.timeouts).read_idle = Some(d).filter(|d| !d.is_zero());
        Ok(())
    }

    fn set_write_idle_timeout(&self, d: Duration) -> io::Result<()> {
        runtime::check_idle_duration(d)?;
        lock(&self.timeouts).write_idle = Some(d).filter(|d| !d.is_zero());
        Ok(())
    }

    fn set_metadata(&self, metadata: Metadata) {
        *lock(&self.metadata) = Some(metadata);
    }

    fn metadata(&self) -> Option<Metadata> {
        lock(&self.metadata).clone()
    }
}
