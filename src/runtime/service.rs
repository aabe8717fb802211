//! TCP service.
//!
//! A [`TcpService`] owns a listening socket attached to a poller. Each
//! readable event on the listener accepts until `WouldBlock`; accepted
//! sockets become [`TcpConn`]s configured from [`TcpOptions`] and are tracked
//! until they close.

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, TcpListener};
use std::os::unix::io::AsRawFd;
use std::sync::{Arc, Condvar, Mutex, OnceLock, Weak};
use std::time::Duration;
use tracing::{debug, info, warn};

use super::connection::{Backpressure, OnClosed, OnRequest, TcpConn};
use super::poller::{self, EventHandler, Poller};
use mio::Token;

/// Callback run on a new connection before it is attached to a poller.
pub type OnOpened = Arc<dyn Fn(&TcpConn) -> io::Result<()> + Send + Sync>;

/// Default TCP keep-alive period.
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(15);

/// Connection options applied by services and dialers.
#[derive(Clone)]
pub struct TcpOptions {
    pub(crate) keep_alive: Duration,
    pub(crate) idle_timeout: Duration,
    pub(crate) read_idle_timeout: Duration,
    pub(crate) write_idle_timeout: Duration,
    pub(crate) nonblocking: bool,
    pub(crate) flush_write: bool,
    pub(crate) backpressure: Backpressure,
    pub(crate) on_request: Option<OnRequest>,
    pub(crate) on_opened: Option<OnOpened>,
    pub(crate) on_closed: Option<OnClosed>,
}

impl Default for TcpOptions {
    fn default() -> Self {
        Self {
            keep_alive: DEFAULT_KEEP_ALIVE,
            idle_timeout: Duration::ZERO,
            read_idle_timeout: Duration::ZERO,
            write_idle_timeout: Duration::ZERO,
            nonblocking: true,
            flush_write: false,
            backpressure: Backpressure::default(),
            on_request: None,
            on_opened: None,
            on_closed: None,
        }
    }
}

impl TcpOptions {
    /// TCP keep-alive period; zero disables keep-alive probes.
    pub fn with_keep_alive(mut self, period: Duration) -> Self {
        self.keep_alive = period;
        self
    }

    pub fn with_idle_timeout(mut self, d: Duration) -> Self {
        self.idle_timeout = d;
        self
    }

    pub fn with_read_idle_timeout(mut self, d: Duration) -> Self {
        self.read_idle_timeout = d;
        self
    }

    pub fn with_write_idle_timeout(mut self, d: Duration) -> Self {
        self.write_idle_timeout = d;
        self
    }

    /// Run `on_request` inline on the poller (true) or on the worker pool.
    pub fn with_nonblocking(mut self, nonblocking: bool) -> Self {
        self.nonblocking = nonblocking;
        self
    }

    pub fn with_flush_write(mut self, flush_write: bool) -> Self {
        self.flush_write = flush_write;
        self
    }

    pub fn with_backpressure(mut self, backpressure: Backpressure) -> Self {
        self.backpressure = backpressure;
        self
    }

    pub fn with_on_request(mut self, handler: OnRequest) -> Self {
        self.on_request = Some(handler);
        self
    }

    pub fn with_on_opened(mut self, on_opened: OnOpened) -> Self {
        self.on_opened = Some(on_opened);
        self
    }

    pub fn with_on_closed(mut self, on_closed: OnClosed) -> Self {
        self.on_closed = Some(on_closed);
        self
    }
}

/// Create a nonblocking TCP listener with `SO_REUSEADDR` and `SO_REUSEPORT`.
pub fn listen(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_port(true)?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(socket.into())
}

/// Accepting TCP server.
pub struct TcpService {
    listener: TcpListener,
    local_addr: SocketAddr,
    options: TcpOptions,
    conns: Mutex<HashMap<u64, TcpConn>>,
    attached: OnceLock<(Arc<Poller>, Token)>,
    done: Mutex<bool>,
    done_cv: Condvar,
}

impl TcpService {
    /// Build a service that runs `handler` for connections accepted on
    /// `listener`.
    pub fn new(
        listener: TcpListener,
        handler: OnRequest,
        options: TcpOptions,
    ) -> io::Result<Arc<TcpService>> {
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        Ok(Arc::new(TcpService {
            listener,
            local_addr,
            options: options.with_on_request(handler),
            conns: Mutex::new(HashMap::new()),
            attached: OnceLock::new(),
            done: Mutex::new(false),
            done_cv: Condvar::new(),
        }))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Number of live connections.
    pub fn num_conns(&self) -> usize {
        self.conns.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Start accepting and block until [`shutdown`](Self::shutdown).
    pub fn serve(self: &Arc<Self>) -> io::Result<()> {
        let poller = poller::pick()?;
        let events: Arc<dyn EventHandler> = Arc::new(Acceptor(Arc::downgrade(self)));
        let token = poller.attach(self.listener.as_raw_fd(), events)?;
        if self.attached.set((Arc::clone(&poller), token)).is_err() {
            poller.detach(self.listener.as_raw_fd(), token);
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "service is already serving",
            ));
        }
        info!(
            addr = %self.local_addr,
            pollers = poller::num_pollers(),
            "TCP service started"
        );
        // Connections may have queued before registration.
        self.accept_all();

        let mut done = self.done.lock().unwrap_or_else(|e| e.into_inner());
        while !*done {
            done = self.done_cv.wait(done).unwrap_or_else(|e| e.into_inner());
        }
        Ok(())
    }

    /// Stop accepting, close every live connection and release `serve`.
    pub fn shutdown(&self) {
        {
            let mut done = self.done.lock().unwrap_or_else(|e| e.into_inner());
            if *done {
                return;
            }
            *done = true;
        }
        if let Some((poller, token)) = self.attached.get() {
            poller.detach(self.listener.as_raw_fd(), *token);
        }
        let conns: Vec<TcpConn> = self
            .conns
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .map(|(_, c)| c)
            .collect();
        for conn in conns {
            conn.close();
        }
        self.done_cv.notify_all();
        info!(addr = %self.local_addr, "TCP service stopped");
    }

    fn is_shutdown(&self) -> bool {
        *self.done.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn accept_all(self: &Arc<Self>) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if self.is_shutdown() {
                        return;
                    }
                    if let Err(e) = self.admit(stream) {
                        debug!(peer = %peer, error = %e, "Failed to set up connection");
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref e) if is_transient_accept_error(e) => {
                    debug!(error = %e, "Transient accept error");
                    continue;
                }
                Err(e) => {
                    warn!(addr = %self.local_addr, error = %e, "Accept error");
                    break;
                }
            }
        }
    }

    fn admit(self: &Arc<Self>, stream: std::net::TcpStream) -> io::Result<()> {
        let service = Arc::downgrade(self);
        let untrack: OnClosed = Arc::new(move |conn: &TcpConn| {
            if let Some(service) = service.upgrade() {
                service
                    .conns
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&conn.id());
            }
        });
        let conn = TcpConn::attach(stream, &self.options)?;
        conn.set_on_closed(untrack);
        if conn.is_active() {
            self.conns
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(conn.id(), conn.clone());
        }
        debug!(conn_id = conn.id(), peer = %conn.peer_addr(), "Accepted connection");
        Ok(())
    }
}

fn is_transient_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset
    )
}

/// Listener readiness handler.
struct Acceptor(Weak<TcpService>);

impl EventHandler for Acceptor {
    fn on_readable(&self) -> io::Result<()> {
        if let Some(service) = self.0.upgrade() {
            service.accept_all();
        }
        Ok(())
    }

    fn on_hangup(&self, err: Option<io::Error>) {
        if let Some(e) = err {
            warn!(error = %e, "Listener error");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::thread;

    fn echo_handler() -> OnRequest {
        Arc::new(|conn: &TcpConn| {
            let data = conn.read_n(conn.len())?;
            conn.write(&data)?;
            Ok(())
        })
    }

    fn start(options: TcpOptions) -> Arc<TcpService> {
        let listener = listen("127.0.0.1:0".parse().unwrap()).unwrap();
        let service = TcpService::new(listener, echo_handler(), options).unwrap();
        let runner = Arc::clone(&service);
        thread::spawn(move || runner.serve().unwrap());
        service
    }

    #[test]
    fn test_default_options() {
        let opts = TcpOptions::default();
        assert_eq!(opts.keep_alive, Duration::from_secs(15));
        assert!(opts.nonblocking);
        assert!(!opts.flush_write);
        assert_eq!(opts.idle_timeout, Duration::ZERO);
    }

    #[test]
    fn test_echo_service() {
        let service = start(TcpOptions::default());
        let mut client = TcpStream::connect(service.local_addr()).unwrap();
        client.write_all(b"hello tcp").unwrap();
        let mut buf = [0u8; 9];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello tcp");
        service.shutdown();
    }

    #[test]
    fn test_blocking_handler_mode() {
        let service = start(TcpOptions::default().with_nonblocking(false));
        let mut client = TcpStream::connect(service.local_addr()).unwrap();
        for _ in 0..3 {
            client.write_all(b"abc").unwrap();
            let mut buf = [0u8; 3];
            client.read_exact(&mut buf).unwrap();
            assert_eq!(&buf, b"abc");
        }
        service.shutdown();
    }

    #[test]
    fn test_closed_connections_are_untracked() {
        let service = start(TcpOptions::default());
        let mut client = TcpStream::connect(service.local_addr()).unwrap();
        client.write_all(b"x").unwrap();
        let mut buf = [0u8; 1];
        client.read_exact(&mut buf).unwrap();
        assert_eq!(service.num_conns(), 1);

        drop(client);
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while service.num_conns() > 0 && std::time::Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(service.num_conns(), 0);
        service.shutdown();
    }

    #[test]
    fn test_on_opened_rejects_connection() {
        let reject: OnOpened = Arc::new(|_conn: &TcpConn| {
            Err(io::Error::new(io::ErrorKind::PermissionDenied, "no"))
        });
        let service = start(TcpOptions::default().with_on_opened(reject));
        let mut client = TcpStream::connect(service.local_addr()).unwrap();
        let mut buf = [0u8; 1];
        client
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        assert_eq!(client.read(&mut buf).unwrap_or(0), 0);
        service.shutdown();
    }
}
