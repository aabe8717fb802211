//! The websocket connection.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

use super::control::ControlHandler;
use super::error::{CloseCode, Error, Result};
use super::options::{Handler, OnClosed};
use super::raw::RawConn;
use super::reader::ReadState;
use super::{MessageType, Role};
use crate::runtime::{Metadata, TcpConn};

/// Per-connection settings fixed at construction.
#[derive(Clone, Default)]
pub struct ConnConfig {
    /// Subprotocol agreed on during the handshake, possibly empty.
    pub subprotocol: String,
    /// Message type used by the byte-stream `read`/`write`. Unset disables them.
    pub message_type: Option<MessageType>,
    /// Write header and payload with a single call on the transport.
    pub combine_writes: bool,
    pub ping_handler: Option<ControlHandler>,
    pub pong_handler: Option<ControlHandler>,
}

/// A websocket connection. Cheap to clone; clones share the connection.
///
/// See the module docs for which calls may run concurrently.
#[derive(Clone)]
pub struct WebSocketConn(pub(super) Arc<WsInner>);

pub(super) struct WsInner {
    pub(super) raw: Arc<dyn RawConn>,
    pub(super) role: Role,
    subprotocol: String,
    pub(super) message_type: Option<MessageType>,
    pub(super) combine_writes: bool,
    /// Held for the whole of every frame written.
    pub(super) write_lock: Mutex<()>,
    pub(super) read: Mutex<ReadState>,
    pub(super) ping: RwLock<Option<ControlHandler>>,
    pub(super) pong: RwLock<Option<ControlHandler>>,
    pub(super) close_sent: AtomicBool,
    metadata: Mutex<Option<Metadata>>,
}

pub(super) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl WebSocketConn {
    /// Wrap a transport that has already completed the opening handshake.
    pub fn from_raw(raw: Arc<dyn RawConn>, role: Role, config: ConnConfig) -> WebSocketConn {
        WebSocketConn(Arc::new(WsInner {
            raw,
            role,
            subprotocol: config.subprotocol,
            message_type: config.message_type,
            combine_writes: config.combine_writes,
            write_lock: Mutex::new(()),
            read: Mutex::new(ReadState::default()),
            ping: RwLock::new(config.ping_handler),
            pong: RwLock::new(config.pong_handler),
            close_sent: AtomicBool::new(false),
            metadata: Mutex::new(None),
        }))
    }

    /// The websocket connection stored in a transport's metadata slot.
    pub(crate) fn from_metadata(metadata: Option<Metadata>) -> Option<WebSocketConn> {
        metadata?.downcast_ref::<WebSocketConn>().cloned()
    }

    pub fn role(&self) -> Role {
        self.0.role
    }

    /// The negotiated subprotocol; empty if none.
    pub fn subprotocol(&self) -> &str {
        &self.0.subprotocol
    }

    pub fn message_type(&self) -> Option<MessageType> {
        self.0.message_type
    }

    pub fn raw(&self) -> &Arc<dyn RawConn> {
        &self.0.raw
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.0.raw.local_addr()
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.0.raw.peer_addr()
    }

    pub fn is_active(&self) -> bool {
        self.0.raw.is_active()
    }

    pub fn set_deadline(&self, deadline: Option<Instant>) {
        self.0.raw.set_deadline(deadline)
    }

    pub fn set_read_deadline(&self, deadline: Option<Instant>) {
        self.0.raw.set_read_deadline(deadline)
    }

    pub fn set_write_deadline(&self, deadline: Option<Instant>) {
        self.0.raw.set_write_deadline(deadline)
    }

    /// Close the connection after `d` without traffic. Zero disables.
    pub fn set_idle_timeout(&self, d: Duration) -> Result<()> {
        Ok(self.0.raw.set_idle_timeout(d)?)
    }

    pub fn set_read_idle_timeout(&self, d: Duration) -> Result<()> {
        Ok(self.0.raw.set_read_idle_timeout(d)?)
    }

    pub fn set_write_idle_timeout(&self, d: Duration) -> Result<()> {
        Ok(self.0.raw.set_write_idle_timeout(d)?)
    }

    /// Attach user data to the connection.
    pub fn set_metadata(&self, metadata: Metadata) {
        *lock(&self.0.metadata) = Some(metadata);
    }

    pub fn metadata(&self) -> Option<Metadata> {
        lock(&self.0.metadata).clone()
    }

    fn set_handler(slot: &RwLock<Option<ControlHandler>>, handler: ControlHandler) {
        *slot.write().unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    /// Replace the default ping reply. The handler runs on the reading thread.
    pub fn set_ping_handler<F>(&self, f: F)
    where
        F: Fn(&WebSocketConn, &[u8]) -> Result<()> + Send + Sync + 'static,
    {
        Self::set_handler(&self.0.ping, ControlHandler::inline(f));
    }

    /// Replace the default pong handling. The handler runs on the reading thread.
    pub fn set_pong_handler<F>(&self, f: F)
    where
        F: Fn(&WebSocketConn, &[u8]) -> Result<()> + Send + Sync + 'static,
    {
        Self::set_handler(&self.0.pong, ControlHandler::inline(f));
    }

    /// Like [`set_ping_handler`](Self::set_ping_handler), but the handler is
    /// submitted to the worker pool and reading continues at once.
    pub fn set_async_ping_handler<F>(&self, f: F)
    where
        F: Fn(&WebSocketConn, &[u8]) -> Result<()> + Send + Sync + 'static,
    {
        Self::set_handler(&self.0.ping, ControlHandler::pool(f));
    }

    pub fn set_async_pong_handler<F>(&self, f: F)
    where
        F: Fn(&WebSocketConn, &[u8]) -> Result<()> + Send + Sync + 'static,
    {
        Self::set_handler(&self.0.pong, ControlHandler::pool(f));
    }

    pub(super) fn ping_handler(&self) -> Option<ControlHandler> {
        self.0.ping.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub(super) fn pong_handler(&self) -> Option<ControlHandler> {
        self.0.pong.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn tcp(&self, op: &'static str) -> Result<&TcpConn> {
        self.0.raw.as_tcp().ok_or(Error::Config(op))
    }

    /// Replace the handler called when data arrives. Only available on
    /// connections over a [`TcpConn`].
    pub fn set_on_request(&self, handler: Handler) -> Result<()> {
        let tcp = self.tcp("set_on_request needs a TcpConn transport")?;
        let conn = self.clone();
        tcp.set_on_request(Arc::new(move |_: &TcpConn| {
            handler(&conn).map_err(io::Error::from)
        }));
        Ok(())
    }

    /// Add a callback run once when the connection closes. Only available on
    /// connections over a [`TcpConn`].
    pub fn set_on_closed(&self, on_closed: OnClosed) -> Result<()> {
        let tcp = self.tcp("set_on_closed needs a TcpConn transport")?;
        let conn = self.clone();
        tcp.set_on_closed(Arc::new(move |_: &TcpConn| on_closed(&conn)));
        Ok(())
    }

    /// Send a normal-closure Close frame if none was sent yet, then close
    /// the transport. Idempotent.
    pub fn close(&self) {
        let _ = self.send_close(CloseCode::NORMAL, "");
        self.0.raw.close();
    }

    /// Close with an explicit status code and reason.
    pub fn close_with_status(&self, code: CloseCode, reason: &str) -> Result<()> {
        let sent = self.send_close(code, reason);
        self.0.raw.close();
        sent
    }
}

impl fmt::Debug for WebSocketConn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketConn")
            .field("role", &self.0.role)
            .field("peer", &self.peer_addr())
            .field("subprotocol", &self.0.subprotocol)
            .field("message_type", &self.0.message_type)
            .finish()
    }
}

/// Byte-stream view. A Close from the peer reads as end of stream.
impl io::Read for WebSocketConn {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match WebSocketConn::read(self, buf) {
            Ok(n) => Ok(n),
            Err(Error::Closed(_)) => Ok(0),
            Err(e) => Err(e.into()),
        }
    }
}

impl io::Write for WebSocketConn {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        WebSocketConn::write(self, buf).map_err(io::Error::from)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
