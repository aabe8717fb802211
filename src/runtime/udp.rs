//! UDP packet connections.
//!
//! A [`UdpConn`] shares the poller pool with TCP. Each readable event drains
//! the socket into a bounded packet queue; the handler then runs once per
//! queued packet and pulls it with [`UdpConn::read_from`].

use bytes::Bytes;
use std::collections::VecDeque;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, RwLock};
use std::time::Instant;
use tracing::{debug, info};

use super::connection::Metadata;
use super::error::{again_error, closed_error, is_again, timeout_error};
use super::metrics::{self, Metric};
use super::poller::{self, EventHandler, Poller};
use super::pool::sys_pool;
use mio::Token;

/// Handler invoked once per received packet.
pub type OnPacket = Arc<dyn Fn(&UdpConn) -> io::Result<()> + Send + Sync>;

/// Largest datagram accepted by default.
pub const DEFAULT_MAX_PACKET_SIZE: usize = 65536;

/// Packets queued before new ones are dropped.
const MAX_QUEUED_PACKETS: usize = 4096;

static NEXT_UDP_ID: AtomicU64 = AtomicU64::new(1);

/// Options for UDP connections and services.
#[derive(Clone)]
pub struct UdpOptions {
    pub(crate) nonblocking: bool,
    pub(crate) max_packet_size: usize,
    pub(crate) on_request: Option<OnPacket>,
}

impl Default for UdpOptions {
    fn default() -> Self {
        Self {
            nonblocking: true,
            max_packet_size: DEFAULT_MAX_PACKET_SIZE,
            on_request: None,
        }
    }
}

impl UdpOptions {
    pub fn with_nonblocking(mut self, nonblocking: bool) -> Self {
        self.nonblocking = nonblocking;
        self
    }

    pub fn with_max_packet_size(mut self, size: usize) -> Self {
        self.max_packet_size = size.max(1);
        self
    }

    pub fn with_on_request(mut self, handler: OnPacket) -> Self {
        self.on_request = Some(handler);
        self
    }
}

struct Packet {
    data: Bytes,
    from: SocketAddr,
}

struct UdpInner {
    id: u64,
    socket: UdpSocket,
    fd: RawFd,
    local_addr: SocketAddr,
    peer_addr: Option<SocketAddr>,
    poller: Arc<Poller>,
    token: OnceLock<Token>,
    closed: AtomicBool,
    packets: Mutex<VecDeque<Packet>>,
    arrived: Condvar,
    scratch: Mutex<Vec<u8>>,
    running: AtomicBool,
    nonblocking: AtomicBool,
    read_deadline: Mutex<Option<Instant>>,
    on_request: RwLock<Option<OnPacket>>,
    metadata: Mutex<Option<Metadata>>,
}

/// A UDP socket multiplexed by the poller pool.
#[derive(Clone)]
pub struct UdpConn(Arc<UdpInner>);

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl UdpConn {
    pub(crate) fn attach(socket: UdpSocket, options: &UdpOptions) -> io::Result<UdpConn> {
        socket.set_nonblocking(true)?;
        let local_addr = socket.local_addr()?;
        let peer_addr = socket.peer_addr().ok();
        let poller = poller::pick()?;
        let conn = UdpConn(Arc::new(UdpInner {
            id: NEXT_UDP_ID.fetch_add(1, Ordering::Relaxed),
            fd: socket.as_raw_fd(),
            socket,
            local_addr,
            peer_addr,
            poller,
            token: OnceLock::new(),
            closed: AtomicBool::new(false),
            packets: Mutex::new(VecDeque::new()),
            arrived: Condvar::new(),
            scratch: Mutex::new(vec![0u8; options.max_packet_size]),
            running: AtomicBool::new(false),
            nonblocking: AtomicBool::new(options.nonblocking),
            read_deadline: Mutex::new(None),
            on_request: RwLock::new(options.on_request.clone()),
            metadata: Mutex::new(None),
        }));
        let handler: Arc<dyn EventHandler> = Arc::new(conn.clone());
        let token = conn.0.poller.attach(conn.0.fd, handler)?;
        let _ = conn.0.token.set(token);
        Ok(conn)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.0.local_addr
    }

    /// Connected peer, for dialed connections.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.0.peer_addr
    }

    pub fn is_active(&self) -> bool {
        !self.0.closed.load(Ordering::Acquire)
    }

    /// Number of queued packets.
    pub fn len(&self) -> usize {
        lock(&self.0.packets).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn has_handler(&self) -> bool {
        self.0
            .on_request
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Take the next packet.
    pub fn read_packet(&self) -> io::Result<(Bytes, SocketAddr)> {
        let mut packets = lock(&self.0.packets);
        loop {
            if let Some(p) = packets.pop_front() {
                return Ok((p.data, p.from));
            }
            if !self.is_active() {
                return Err(closed_error());
            }
            if self.0.nonblocking.load(Ordering::Acquire) && self.has_handler() {
                return Err(again_error());
            }
            let deadline = *lock(&self.0.read_deadline);
            packets = match deadline {
                None => self.0.arrived.wait(packets).unwrap_or_else(|e| e.into_inner()),
                Some(at) => {
                    let now = Instant::now();
                    if now >= at {
                        return Err(timeout_error());
                    }
                    self.0
                        .arrived
                        .wait_timeout(packets, at - now)
                        .unwrap_or_else(|e| e.into_inner())
                        .0
                }
            };
        }
    }

    /// Copy the next packet into `buf`; excess bytes are discarded.
    pub fn read_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let (data, from) = self.read_packet()?;
        let n = data.len().min(buf.len());
        buf[..n].copy_from_slice(&data[..n]);
        Ok((n, from))
    }

    pub fn write_to(&self, buf: &[u8], addr: SocketAddr) -> io::Result<usize> {
        if !self.is_active() {
            return Err(closed_error());
        }
        metrics::add(Metric::UdpWriteToCalls, 1);
        self.0.socket.send_to(buf, addr).inspect_err(|_| {
            metrics::add(Metric::UdpWriteToFails, 1);
        })
    }

    /// Send to the connected peer.
    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        match self.0.peer_addr {
            Some(peer) => self.write_to(buf, peer),
            None => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "udp connection has no peer; use write_to",
            )),
        }
    }

    /// Send several datagrams, stopping at the first failure.
    ///
    /// Returns how many datagrams were sent.
    pub fn send_batch(&self, packets: &[(&[u8], SocketAddr)]) -> io::Result<usize> {
        if !self.is_active() {
            return Err(closed_error());
        }
        metrics::add(Metric::UdpSendMmsgCalls, 1);
        let mut sent = 0;
        for (data, addr) in packets {
            match self.0.socket.send_to(data, *addr) {
                Ok(_) => sent += 1,
                Err(e) if sent == 0 => {
                    metrics::add(Metric::UdpSendMmsgFails, 1);
                    return Err(e);
                }
                Err(_) => break,
            }
        }
        metrics::add(Metric::UdpSendMmsgPackets, sent as u64);
        Ok(sent)
    }

    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        *lock(&self.0.read_deadline) = deadline;
        drop(lock(&self.0.packets));
        self.0.arrived.notify_all();
    }

    pub fn set_nonblocking(&self, nonblocking: bool) {
        self.0.nonblocking.store(nonblocking, Ordering::Release);
    }

    pub fn set_on_request(&self, handler: OnPacket) {
        *self
            .0
            .on_request
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    pub fn set_metadata(&self, metadata: Metadata) {
        *lock(&self.0.metadata) = Some(metadata);
    }

    pub fn metadata(&self) -> Option<Metadata> {
        lock(&self.0.metadata).clone()
    }

    /// Close the socket. Idempotent.
    pub fn close(&self) {
        if self.0.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(token) = self.0.token.get() {
            self.0.poller.detach(self.0.fd, *token);
        }
        drop(lock(&self.0.packets));
        self.0.arrived.notify_all();
        lock(&self.0.metadata).take();
        self.0
            .on_request
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        debug!(udp_id = self.0.id, "UDP connection closed");
    }

    fn dispatch(&self) -> io::Result<()> {
        let Some(handler) = self
            .0
            .on_request
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
        else {
            return Ok(());
        };
        if self.0.running.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if self.0.nonblocking.load(Ordering::Acquire) {
            self.run_handler(&handler);
            return Ok(());
        }
        let conn = self.clone();
        sys_pool().submit(move || conn.run_handler(&handler))
    }

    fn run_handler(&self, handler: &OnPacket) {
        loop {
            while !self.is_empty() && self.is_active() {
                match handler(self) {
                    Ok(()) => {}
                    Err(e) if is_again(&e) => break,
                    Err(e) => {
                        debug!(udp_id = self.0.id, error = %e, "Packet handler failed");
                        break;
                    }
                }
            }
            self.0.running.store(false, Ordering::Release);
            if self.is_empty() || self.0.running.swap(true, Ordering::AcqRel) {
                return;
            }
        }
    }
}

impl EventHandler for UdpConn {
    fn on_readable(&self) -> io::Result<()> {
        let mut received = 0usize;
        {
            let mut scratch = lock(&self.0.scratch);
            loop {
                if !self.is_active() {
                    return Ok(());
                }
                metrics::add(Metric::UdpRecvMmsgCalls, 1);
                match self.0.socket.recv_from(&mut scratch) {
                    Ok((n, from)) => {
                        let mut packets = lock(&self.0.packets);
                        if packets.len() >= MAX_QUEUED_PACKETS {
                            debug!(udp_id = self.0.id, "Packet queue full, dropping packet");
                            continue;
                        }
                        packets.push_back(Packet {
                            data: Bytes::copy_from_slice(&scratch[..n]),
                            from,
                        });
                        received += 1;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                        metrics::add(Metric::UdpRecvMmsgFails, 1);
                        break;
                    }
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => {
                        metrics::add(Metric::UdpRecvMmsgFails, 1);
                        return Err(e);
                    }
                }
            }
        }
        if received > 0 {
            metrics::add(Metric::UdpRecvMmsgPackets, received as u64);
            self.0.arrived.notify_all();
            self.dispatch()?;
        }
        Ok(())
    }

    fn on_hangup(&self, err: Option<io::Error>) {
        if let Some(e) = err {
            debug!(udp_id = self.0.id, error = %e, "UDP socket error");
        }
        self.close();
    }
}

/// Create a nonblocking UDP socket with `SO_REUSEADDR` and `SO_REUSEPORT`.
pub fn listen_udp(addr: SocketAddr) -> io::Result<UdpSocket> {
    let socket = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )?;
    socket.set_reuse_port(true)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    Ok(socket.into())
}

/// Packet server: one [`UdpConn`] driven by a handler.
pub struct UdpService {
    socket: Mutex<Option<UdpSocket>>,
    local_addr: SocketAddr,
    options: UdpOptions,
    conn: OnceLock<UdpConn>,
    done: Mutex<bool>,
    done_cv: Condvar,
}

impl UdpService {
    pub fn new(
        socket: UdpSocket,
        handler: OnPacket,
        options: UdpOptions,
    ) -> io::Result<Arc<UdpService>> {
        let local_addr = socket.local_addr()?;
        Ok(Arc::new(UdpService {
            socket: Mutex::new(Some(socket)),
            local_addr,
            options: options.with_on_request(handler),
            conn: OnceLock::new(),
            done: Mutex::new(false),
            done_cv: Condvar::new(),
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Attach the socket and block until [`shutdown`](Self::shutdown).
    pub fn serve(&self) -> io::Result<()> {
        let socket = lock(&self.socket).take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::AlreadyExists, "service is already serving")
        })?;
        let conn = UdpConn::attach(socket, &self.options)?;
        let _ = self.conn.set(conn);
        info!(addr = %self.local_addr, pollers = poller::num_pollers(), "UDP service started");

        let mut done = lock(&self.done);
        while !*done {
            done = self.done_cv.wait(done).unwrap_or_else(|e| e.into_inner());
        }
        Ok(())
    }

    pub fn shutdown(&self) {
        *lock(&self.done) = true;
        if let Some(conn) = self.conn.get() {
            conn.close();
        }
        self.done_cv.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn echo() -> OnPacket {
        Arc::new(|conn: &UdpConn| {
            let (data, from) = conn.read_packet()?;
            conn.write_to(&data, from)?;
            Ok(())
        })
    }

    #[test]
    fn test_udp_echo_service() {
        let socket = listen_udp("127.0.0.1:0".parse().unwrap()).unwrap();
        let service = UdpService::new(socket, echo(), UdpOptions::default()).unwrap();
        let addr = service.local_addr();
        let runner = Arc::clone(&service);
        thread::spawn(move || runner.serve().unwrap());

        let client = super::super::dialer::dial_udp(addr).unwrap();
        client.write(b"datagram").unwrap();
        client.set_read_deadline(Some(Instant::now() + Duration::from_secs(5)));
        let mut buf = [0u8; 64];
        let (n, from) = client.read_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"datagram");
        assert_eq!(from, addr);
        service.shutdown();
    }

    #[test]
    fn test_blocking_handler_per_packet() {
        let socket = listen_udp("127.0.0.1:0".parse().unwrap()).unwrap();
        let service = UdpService::new(
            socket,
            echo(),
            UdpOptions::default().with_nonblocking(false),
        )
        .unwrap();
        let addr = service.local_addr();
        let runner = Arc::clone(&service);
        thread::spawn(move || runner.serve().unwrap());

        let client = super::super::dialer::dial_udp(addr).unwrap();
        client.set_read_deadline(Some(Instant::now() + Duration::from_secs(5)));
        for i in 0..3u8 {
            client.write(&[i; 4]).unwrap();
            let (data, _) = client.read_packet().unwrap();
            assert_eq!(&data[..], &[i; 4]);
        }
        service.shutdown();
    }

    #[test]
    fn test_send_batch() {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let a = UdpConn::attach(socket, &UdpOptions::default()).unwrap();
        let receiver = UdpSocket::bind("127.0.0.1:0").unwrap();
        let to = receiver.local_addr().unwrap();
        let sent = a.send_batch(&[(b"one", to), (b"two", to)]).unwrap();
        assert_eq!(sent, 2);
        let mut buf = [0u8; 8];
        let (n, _) = receiver.recv_from(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"one");
    }

    #[test]
    fn test_closed_conn_rejects_io() {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        let conn = UdpConn::attach(socket, &UdpOptions::default()).unwrap();
        conn.close();
        conn.close();
        assert!(!conn.is_active());
        assert!(conn.write(b"x").is_err());
        assert!(conn.read_packet().is_err());
    }
}
