//! Server and client options.

use std::sync::Arc;
use std::time::Duration;

use super::control::ControlHandler;
use super::error::{BoxError, Result};
use super::handshake::{HandshakeContext, ProtocolCustom, ProtocolSelect};
use super::raw::{TlsAcceptor, TlsConnector};
use super::{MessageType, WebSocketConn};
use crate::runtime::DEFAULT_KEEP_ALIVE;

/// Runs before the upgrade request is read. An error refuses the connection.
pub type BeforeHandshake =
    Arc<dyn Fn(&mut HandshakeContext) -> std::result::Result<(), BoxError> + Send + Sync>;

/// Runs right after a successful upgrade. An error closes the connection.
pub type AfterHandshake = Arc<
    dyn Fn(&HandshakeContext, &WebSocketConn) -> std::result::Result<(), BoxError> + Send + Sync,
>;

/// Builds the context the handshake hooks share.
pub type NewHandshakeContext = Arc<dyn Fn() -> HandshakeContext + Send + Sync>;

/// Called with the connection every time data arrives for it.
pub type Handler = Arc<dyn Fn(&WebSocketConn) -> Result<()> + Send + Sync>;

/// Called once when a connection has closed.
pub type OnClosed = Arc<dyn Fn(&WebSocketConn) + Send + Sync>;

/// Dial timeout used when none is given.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// Options for a websocket [`Service`](super::Service).
#[derive(Clone)]
pub struct ServerOptions {
    pub(crate) before_handshake: Option<BeforeHandshake>,
    pub(crate) after_handshake: Option<AfterHandshake>,
    pub(crate) new_handshake_context: Option<NewHandshakeContext>,
    pub(crate) protocol_select: Option<ProtocolSelect>,
    pub(crate) protocol_custom: Option<ProtocolCustom>,
    pub(crate) ping_handler: Option<ControlHandler>,
    pub(crate) pong_handler: Option<ControlHandler>,
    pub(crate) message_type: Option<MessageType>,
    pub(crate) tls_acceptor: Option<Arc<dyn TlsAcceptor>>,
    pub(crate) keep_alive: Duration,
    pub(crate) idle_timeout: Duration,
    pub(crate) on_closed: Option<OnClosed>,
    pub(crate) combine_writes: bool,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            before_handshake: None,
            after_handshake: None,
            new_handshake_context: None,
            protocol_select: None,
            protocol_custom: None,
            ping_handler: None,
            pong_handler: None,
            message_type: None,
            tls_acceptor: None,
            keep_alive: DEFAULT_KEEP_ALIVE,
            idle_timeout: Duration::ZERO,
            on_closed: None,
            combine_writes: false,
        }
    }
}

impl ServerOptions {
    pub fn with_before_handshake<F>(mut self, f: F) -> Self
    where
        F: Fn(&mut HandshakeContext) -> std::result::Result<(), BoxError> + Send + Sync + 'static,
    {
        self.before_handshake = Some(Arc::new(f));
        self
    }

    pub fn with_after_handshake<F>(mut self, f: F) -> Self
    where
        F: Fn(&HandshakeContext, &WebSocketConn) -> std::result::Result<(), BoxError>
            + Send
            + Sync
            + 'static,
    {
        self.after_handshake = Some(Arc::new(f));
        self
    }

    pub fn with_new_handshake_context<F>(mut self, f: F) -> Self
    where
        F: Fn() -> HandshakeContext + Send + Sync + 'static,
    {
        self.new_handshake_context = Some(Arc::new(f));
        self
    }

    /// Accept the first offered subprotocol for which `f` returns true.
    pub fn with_protocol_select<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        self.protocol_select = Some(Arc::new(f));
        self
    }

    /// Choose the subprotocol from the raw header value. Wins over
    /// [`with_protocol_select`](Self::with_protocol_select).
    pub fn with_protocol_custom<F>(mut self, f: F) -> Self
    where
        F: Fn(&str) -> Option<String> + Send + Sync + 'static,
    {
        self.protocol_custom = Some(Arc::new(f));
        self
    }

    pub fn with_ping_handler<F>(mut self, f: F) -> Self
    where
        F: Fn(&WebSocketConn, &[u8]) -> Result<()> + Send + Sync + 'static,
    {
        self.ping_handler = Some(ControlHandler::inline(f));
        self
    }

    pub fn with_async_ping_handler<F>(mut self, f: F) -> Self
    where
        F: Fn(&WebSocketConn, &[u8]) -> Result<()> + Send + Sync + 'static,
    {
        self.ping_handler = Some(ControlHandler::pool(f));
        self
    }

    pub fn with_pong_handler<F>(mut self, f: F) -> Self
    where
        F: Fn(&WebSocketConn, &[u8]) -> Result<()> + Send + Sync + 'static,
    {
        self.pong_handler = Some(ControlHandler::inline(f));
        self
    }

    pub fn with_async_pong_handler<F>(mut self, f: F) -> Self
    where
        F: Fn(&WebSocketConn, &[u8]) -> Result<()> + Send + Sync + 'static,
    {
        self.pong_handler = Some(ControlHandler::pool(f));
        self
    }

    /// Message type for the byte-stream `read`/`write` of every connection.
    pub fn with_message_type(mut self, tp: MessageType) -> Self {
        self.message_type = Some(tp);
        self
    }

    pub fn with_tls_acceptor(mut self, acceptor: Arc<dyn TlsAcceptor>) -> Self {
        self.tls_acceptor = Some(acceptor);
        self
    }

    pub fn with_keep_alive(mut self, period: Duration) -> Self {
        self.keep_alive = period;
        self
    }

    pub fn with_idle_timeout(mut self, d: Duration) -> Self {
        self.idle_timeout = d;
        self
    }

    pub fn with_on_closed<F>(mut self, f: F) -> Self
    where
        F: Fn(&WebSocketConn) + Send + Sync + 'static,
    {
        self.on_closed = Some(Arc::new(f));
        self
    }

    pub fn with_combined_writes(mut self, combine: bool) -> Self {
        self.combine_writes = combine;
        self
    }
}

/// Options for [`dial`](super::dial).
#[derive(Clone)]
pub struct ClientOptions {
    pub(crate) timeout: Duration,
    pub(crate) subprotocols: Vec<String>,
    pub(crate) message_type: Option<MessageType>,
    pub(crate) tls_connector: Option<Arc<dyn TlsConnector>>,
    pub(crate) server_name: Option<String>,
    pub(crate) combine_writes: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_DIAL_TIMEOUT,
            subprotocols: Vec::new(),
            message_type: None,
            tls_connector: None,
            server_name: None,
            combine_writes: false,
        }
    }
}

impl ClientOptions {
    /// Bound on connecting plus the opening handshake.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_subprotocols<I, S>(mut self, protocols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subprotocols = protocols.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_message_type(mut self, tp: MessageType) -> Self {
        self.message_type = Some(tp);
        self
    }

    pub fn with_tls_connector(mut self, connector: Arc<dyn TlsConnector>) -> Self {
        self.tls_connector = Some(connector);
        self
    }

    /// Name presented to the TLS layer; defaults to the url host.
    pub fn with_server_name(mut self, name: impl Into<String>) -> Self {
        self.server_name = Some(name.into());
        self
    }

    pub fn with_combined_writes(mut self, combine: bool) -> Self {
        self.combine_writes = combine;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_defaults() {
        let opts = ServerOptions::default();
        assert_eq!(opts.keep_alive, Duration::from_secs(15));
        assert_eq!(opts.idle_timeout, Duration::ZERO);
        assert!(opts.message_type.is_none());
        assert!(!opts.combine_writes);
        assert!(opts.tls_acceptor.is_none());
    }

    #[test]
    fn test_server_setters() {
        let opts = ServerOptions::default()
            .with_message_type(MessageType::Binary)
            .with_idle_timeout(Duration::from_secs(3))
            .with_combined_writes(true)
            .with_async_ping_handler(|_, _| Ok(()))
            .with_pong_handler(|_, _| Ok(()))
            .with_protocol_select(|p| p == "chat");
        assert_eq!(opts.message_type, Some(MessageType::Binary));
        assert_eq!(opts.idle_timeout, Duration::from_secs(3));
        assert!(opts.combine_writes);
        assert!(matches!(opts.ping_handler, Some(ControlHandler::Pool(_))));
        assert!(matches!(opts.pong_handler, Some(ControlHandler::Inline(_))));
        assert!(opts.protocol_select.as_ref().unwrap()("chat"));
    }

    #[test]
    fn test_client_defaults() {
        let opts = ClientOptions::default();
        assert_eq!(opts.timeout, DEFAULT_DIAL_TIMEOUT);
        assert!(opts.subprotocols.is_empty());

        let opts = opts
            .with_subprotocols(["chat", "superchat"])
            .with_timeout(Duration::from_secs(1))
            .with_server_name("example.com");
        assert_eq!(opts.subprotocols, vec!["chat", "superchat"]);
        assert_eq!(opts.timeout, Duration::from_secs(1));
        assert_eq!(opts.server_name.as_deref(), Some("example.com"));
    }
}
