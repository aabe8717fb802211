//! Websocket service.
//!
//! Plain connections are [`TcpConn`]s served by a [`TcpService`]: the first
//! request on a connection is the HTTP upgrade, after which the
//! [`WebSocketConn`] lives in the connection's metadata and every further
//! request goes to the user handler.
//!
//! TLS connections cannot be multiplexed by the poller because the record
//! layer is opaque to it. They are accepted on the thread calling
//! [`Service::serve`] and each one is served by a loop on the worker pool.

use std::collections::HashMap;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use tracing::{debug, info, warn};

use super::conn::{lock, ConnConfig, WebSocketConn};
use super::error::{Error, Result};
use super::handshake::{HandshakeContext, Upgrader};
use super::options::{Handler, ServerOptions};
use super::raw::{RawConn, TlsAcceptor};
use super::Role;
use crate::runtime::{self, OnClosed as TcpOnClosed, OnRequest, TcpConn, TcpOptions, TcpService};

const LISTENER_TOKEN: Token = Token(0);
const WAKER_TOKEN: Token = Token(1);

/// Upgrade `raw` and attach the resulting connection to its metadata.
fn upgrade(options: &ServerOptions, raw: Arc<dyn RawConn>) -> Result<WebSocketConn> {
    let mut ctx = match &options.new_handshake_context {
        Some(new_context) => new_context(),
        None => HandshakeContext::default(),
    };
    let upgrader = Upgrader {
        protocol_select: options.protocol_select.clone(),
        protocol_custom: options.protocol_custom.clone(),
    };
    ctx.prepare(upgrader, raw.local_addr(), raw.peer_addr());
    if let Some(before) = &options.before_handshake {
        before(&mut ctx).map_err(Error::Hook)?;
    }

    let handshake = ctx.upgrader().upgrade(&*raw)?;
    let config = ConnConfig {
        subprotocol: handshake.subprotocol,
        message_type: options.message_type,
        combine_writes: options.combine_writes,
        ping_handler: options.ping_handler.clone(),
        pong_handler: options.pong_handler.clone(),
    };
    ctx.set_path(handshake.path);
    let wc = WebSocketConn::from_raw(Arc::clone(&raw), Role::Server, config);
    raw.set_metadata(Arc::new(wc.clone()));

    if let Some(after) = &options.after_handshake {
        after(&ctx, &wc).map_err(Error::Hook)?;
    }
    Ok(wc)
}

/// Accepting websocket server.
pub struct Service {
    backend: Backend,
}

enum Backend {
    Tcp(Arc<TcpService>),
    Tls(Arc<TlsListener>),
}

impl Service {
    /// Build a service calling `handler` for every request on connections
    /// accepted from `listener`.
    pub fn new(
        listener: TcpListener,
        handler: Handler,
        options: ServerOptions,
    ) -> io::Result<Arc<Service>> {
        let backend = match options.tls_acceptor.clone() {
            Some(acceptor) => Backend::Tls(TlsListener::new(listener, handler, options, acceptor)?),
            None => Backend::Tcp(Self::tcp_service(listener, handler, options)?),
        };
        Ok(Arc::new(Service { backend }))
    }

    fn tcp_service(
        listener: TcpListener,
        handler: Handler,
        options: ServerOptions,
    ) -> io::Result<Arc<TcpService>> {
        let mut tcp_options = TcpOptions::default()
            .with_keep_alive(options.keep_alive)
            .with_idle_timeout(options.idle_timeout)
            .with_nonblocking(false)
            .with_flush_write(true);
        if let Some(on_closed) = options.on_closed.clone() {
            let on_closed: TcpOnClosed = Arc::new(move |conn: &TcpConn| {
                if let Some(wc) = WebSocketConn::from_metadata(conn.metadata()) {
                    on_closed(&wc);
                }
            });
            tcp_options = tcp_options.with_on_closed(on_closed);
        }

        let on_request: OnRequest = Arc::new(move |conn: &TcpConn| {
            match WebSocketConn::from_metadata(conn.metadata()) {
                Some(wc) => handler(&wc).map_err(io::Error::from),
                None => {
                    let raw: Arc<dyn RawConn> = Arc::new(conn.clone());
                    match upgrade(&options, raw) {
                        Ok(_) => Ok(()),
                        Err(e) => {
                            debug!(peer = %conn.peer_addr(), error = %e, "Handshake failed");
                            Err(e.into())
                        }
                    }
                }
            }
        });
        TcpService::new(listener, on_request, tcp_options)
    }

    pub fn local_addr(&self) -> SocketAddr {
        match &self.backend {
            Backend::Tcp(s) => s.local_addr(),
            Backend::Tls(s) => s.local_addr,
        }
    }

    /// Number of live connections, upgraded or not.
    pub fn num_conns(&self) -> usize {
        match &self.backend {
            Backend::Tcp(s) => s.num_conns(),
            Backend::Tls(s) => lock(&s.conns).len(),
        }
    }

    /// Start accepting and block until [`shutdown`](Self::shutdown).
    pub fn serve(&self) -> io::Result<()> {
        match &self.backend {
            Backend::Tcp(s) => s.serve(),
            Backend::Tls(s) => s.serve(),
        }
    }

    /// Stop accepting and close every live connection.
    pub fn shutdown(&self) {
        match &self.backend {
            Backend::Tcp(s) => s.shutdown(),
            Backend::Tls(s) => s.shutdown(),
        }
    }
}

/// Accept loop for TLS connections.
struct TlsListener {
    listener: TcpListener,
    local_addr: SocketAddr,
    acceptor: Arc<dyn TlsAcceptor>,
    handler: Handler,
    options: ServerOptions,
    poll: Mutex<Option<Poll>>,
    waker: Waker,
    done: AtomicBool,
    next_id: AtomicU64,
    conns: Mutex<HashMap<u64, Arc<dyn RawConn>>>,
}

impl TlsListener {
    fn new(
        listener: TcpListener,
        handler: Handler,
        options: ServerOptions,
        acceptor: Arc<dyn TlsAcceptor>,
    ) -> io::Result<Arc<TlsListener>> {
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        Ok(Arc::new(TlsListener {
            listener,
            local_addr,
            acceptor,
            handler,
            options,
            poll: Mutex::new(Some(poll)),
            waker,
            done: AtomicBool::new(false),
            next_id: AtomicU64::new(0),
            conns: Mutex::new(HashMap::new()),
        }))
    }

    fn serve(self: &Arc<Self>) -> io::Result<()> {
        let mut poll = lock(&self.poll).take().ok_or_else(|| {
            io::Error::new(io::ErrorKind::AlreadyExists, "service is already serving")
        })?;
        let fd = self.listener.as_raw_fd();
        poll.registry()
            .register(&mut SourceFd(&fd), LISTENER_TOKEN, Interest::READABLE)?;
        info!(addr = %self.local_addr, "TLS websocket service started");

        let mut events = Events::with_capacity(64);
        while !self.done.load(Ordering::Acquire) {
            self.accept_all();
            if let Err(e) = poll.poll(&mut events, None) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e);
            }
        }
        let _ = poll.registry().deregister(&mut SourceFd(&fd));
        Ok(())
    }

    fn shutdown(&self) {
        if self.done.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.waker.wake();
        let conns: Vec<Arc<dyn RawConn>> = lock(&self.conns).drain().map(|(_, c)| c).collect();
        for conn in conns {
            conn.close();
        }
        info!(addr = %self.local_addr, "TLS websocket service stopped");
    }

    fn accept_all(self: &Arc<Self>) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    if self.done.load(Ordering::Acquire) {
                        return;
                    }
                    let this = Arc::clone(self);
                    let submitted =
                        runtime::sys_pool().submit(move || this.serve_conn(stream, peer));
                    if let Err(e) = submitted {
                        warn!(peer = %peer, error = %e, "Failed to schedule TLS connection");
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(ref e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::ConnectionAborted | io::ErrorKind::ConnectionReset
                    ) =>
                {
                    continue
                }
                Err(e) => {
                    warn!(addr = %self.local_addr, error = %e, "Accept error");
                    break;
                }
            }
        }
    }

    fn serve_conn(&self, stream: TcpStream, peer: SocketAddr) {
        let raw = match self.handshake(stream) {
            Ok(raw) => raw,
            Err(e) => {
                debug!(peer = %peer, error = %e, "TLS handshake failed");
                return;
            }
        };
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.conns).insert(id, Arc::clone(&raw));
        if self.done.load(Ordering::Acquire) {
            raw.close();
        }
        debug!(peer = %peer, "Accepted TLS connection");

        match upgrade(&self.options, Arc::clone(&raw)) {
            Ok(wc) => {
                while wc.is_active() {
                    if let Err(e) = (self.handler)(&wc) {
                        if !e.is_closed() {
                            debug!(peer = %peer, error = %e, "Handler failed, closing connection");
                        }
                        break;
                    }
                }
                wc.close();
                if let Some(on_closed) = &self.options.on_closed {
                    on_closed(&wc);
                }
            }
            Err(e) => {
                debug!(peer = %peer, error = %e, "Handshake failed");
                raw.close();
            }
        }
        lock(&self.conns).remove(&id);
        debug!(peer = %peer, "TLS connection closed");
    }

    fn handshake(&self, stream: TcpStream) -> io::Result<Arc<dyn RawConn>> {
        stream.set_nonblocking(false)?;
        stream.set_nodelay(true)?;
        if !self.options.keep_alive.is_zero() {
            let keepalive = socket2::TcpKeepalive::new().with_time(self.options.keep_alive);
            socket2::SockRef::from(&stream).set_tcp_keepalive(&keepalive)?;
        }
        let raw = self.acceptor.accept(stream)?;
        raw.set_idle_timeout(self.options.idle_timeout)?;
        Ok(raw)
    }
}
