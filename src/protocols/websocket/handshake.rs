//! HTTP/1.1 upgrade handshake, both sides.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sha1::{Digest, Sha1};

use super::error::{Error, HandshakeError, Result};
use super::raw::RawConn;
use crate::runtime;

/// Appended to the client key before hashing, RFC 6455 section 1.3.
pub const GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

const MAX_HEAD_LEN: usize = 8 * 1024;
const MAX_HEADERS: usize = 64;

/// Called with each offered subprotocol in order; the first accepted wins.
pub type ProtocolSelect = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Given the whole `Sec-WebSocket-Protocol` value, returns the choice.
pub type ProtocolCustom = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

/// `Sec-WebSocket-Accept` value for a `Sec-WebSocket-Key`.
pub fn derive_accept_key(key: &[u8]) -> String {
    let mut sha = Sha1::new();
    sha.update(key);
    sha.update(GUID.as_bytes());
    STANDARD.encode(sha.finalize())
}

/// A fresh `Sec-WebSocket-Key`: 16 random bytes, base64 encoded.
pub fn new_sec_key() -> String {
    let nonce: [u8; 16] = rand::random();
    STANDARD.encode(nonce)
}

/// Read an HTTP head through the blank line. Anything after it stays in the
/// transport for the frame reader.
fn read_head(raw: &dyn RawConn) -> Result<Vec<u8>> {
    let head = match raw.read_until(b"\r\n\r\n", MAX_HEAD_LEN) {
        Ok(head) => head,
        Err(e) if runtime::is_closed(&e) || e.kind() == io::ErrorKind::UnexpectedEof => {
            return Err(HandshakeError::UnexpectedEof.into())
        }
        Err(e) => return Err(e.into()),
    };
    if !head.ends_with(b"\r\n\r\n") {
        return Err(HandshakeError::HeadTooLarge.into());
    }
    Ok(head)
}

/// Values of every header called `name`, joined by ", ".
fn header_value(headers: &[httparse::Header<'_>], name: &str) -> Option<String> {
    let mut joined: Option<String> = None;
    for h in headers.iter().filter(|h| h.name.eq_ignore_ascii_case(name)) {
        let value = String::from_utf8_lossy(h.value);
        match joined.as_mut() {
            Some(s) => {
                s.push_str(", ");
                s.push_str(value.trim());
            }
            None => joined = Some(value.trim().to_string()),
        }
    }
    joined
}

fn has_token(value: Option<&str>, token: &str) -> bool {
    value.map_or(false, |v| {
        v.split(',')
            .any(|t| t.trim().eq_ignore_ascii_case(token))
    })
}

/// Outcome of a server-side upgrade.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Handshake {
    /// Request target of the upgrade request.
    pub path: String,
    /// Chosen subprotocol, empty if none.
    pub subprotocol: String,
}

/// Server half of the handshake.
#[derive(Clone, Default)]
pub struct Upgrader {
    pub protocol_select: Option<ProtocolSelect>,
    /// Takes precedence over `protocol_select`.
    pub protocol_custom: Option<ProtocolCustom>,
}

impl Upgrader {
    /// Read the upgrade request from `raw` and answer it. On failure an
    /// HTTP error response is written before returning.
    pub fn upgrade(&self, raw: &dyn RawConn) -> Result<Handshake> {
        let head = read_head(raw)?;
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut req = httparse::Request::new(&mut headers);
        let checked = match req.parse(&head) {
            Ok(httparse::Status::Complete(_)) => self.check_request(&req),
            Ok(httparse::Status::Partial) => Err(HandshakeError::UnexpectedEof),
            Err(e) => Err(e.into()),
        };
        match checked {
            Ok((handshake, accept)) => {
                let mut resp = String::with_capacity(160);
                resp.push_str("HTTP/1.1 101 Switching Protocols\r\n");
                resp.push_str("Upgrade: websocket\r\nConnection: Upgrade\r\n");
                let _ = write!(resp, "Sec-WebSocket-Accept: {accept}\r\n");
                if !handshake.subprotocol.is_empty() {
                    let _ = write!(resp, "Sec-WebSocket-Protocol: {}\r\n", handshake.subprotocol);
                }
                resp.push_str("\r\n");
                raw.write(resp.as_bytes())?;
                Ok(handshake)
            }
            Err(e) => {
                let resp: &[u8] = match e {
                    HandshakeError::SecWebSocketVersion => {
                        b"HTTP/1.1 426 Upgrade Required\r\nSec-WebSocket-Version: 13\r\nConnection: close\r\n\r\n"
                    }
                    _ => b"HTTP/1.1 400 Bad Request\r\nConnection: close\r\n\r\n",
                };
                let _ = raw.write(resp);
                Err(e.into())
            }
        }
    }

    fn check_request(
        &self,
        req: &httparse::Request<'_, '_>,
    ) -> std::result::Result<(Handshake, String), HandshakeError> {
        if req.method != Some("GET") {
            return Err(HandshakeError::HttpMethod);
        }
        if req.version != Some(1) {
            return Err(HandshakeError::HttpVersion);
        }
        let headers = &*req.headers;
        if header_value(headers, "Host").is_none() {
            return Err(HandshakeError::HttpHost);
        }
        if !has_token(header_value(headers, "Upgrade").as_deref(), "websocket") {
            return Err(HandshakeError::Upgrade);
        }
        if !has_token(header_value(headers, "Connection").as_deref(), "upgrade") {
            return Err(HandshakeError::Connection);
        }
        if header_value(headers, "Sec-WebSocket-Version").as_deref() != Some("13") {
            return Err(HandshakeError::SecWebSocketVersion);
        }
        let key = header_value(headers, "Sec-WebSocket-Key").ok_or(HandshakeError::SecWebSocketKey)?;
        match STANDARD.decode(key.as_bytes()) {
            Ok(nonce) if nonce.len() == 16 => {}
            _ => return Err(HandshakeError::SecWebSocketKey),
        }

        let offered = header_value(headers, "Sec-WebSocket-Protocol");
        let handshake = Handshake {
            path: req.path.unwrap_or("/").to_string(),
            subprotocol: self.select_protocol(offered.as_deref()),
        };
        Ok((handshake, derive_accept_key(key.as_bytes())))
    }

    fn select_protocol(&self, offered: Option<&str>) -> String {
        let Some(offered) = offered else {
            return String::new();
        };
        if let Some(custom) = &self.protocol_custom {
            return custom(offered).unwrap_or_default();
        }
        if let Some(select) = &self.protocol_select {
            for token in offered.split(',').map(str::trim).filter(|t| !t.is_empty()) {
                if select(token) {
                    return token.to_string();
                }
            }
        }
        String::new()
    }
}

/// Client half: send the upgrade request and check the response. Returns
/// the subprotocol the server chose, empty if none.
pub(crate) fn client_handshake(
    raw: &dyn RawConn,
    host: &str,
    path: &str,
    protocols: &[String],
) -> Result<String> {
    let key = new_sec_key();
    let mut req = String::with_capacity(256);
    let _ = write!(req, "GET {path} HTTP/1.1\r\nHost: {host}\r\n");
    req.push_str("Upgrade: websocket\r\nConnection: Upgrade\r\n");
    let _ = write!(req, "Sec-WebSocket-Key: {key}\r\nSec-WebSocket-Version: 13\r\n");
    if !protocols.is_empty() {
        let _ = write!(req, "Sec-WebSocket-Protocol: {}\r\n", protocols.join(", "));
    }
    req.push_str("\r\n");
    raw.write(req.as_bytes())?;

    let head = read_head(raw)?;
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut resp = httparse::Response::new(&mut headers);
    if resp.parse(&head)?.is_partial() {
        return Err(HandshakeError::UnexpectedEof.into());
    }
    if resp.version != Some(1) {
        return Err(HandshakeError::HttpVersion.into());
    }
    match resp.code {
        Some(101) => {}
        code => return Err(HandshakeError::HttpStatusCode(code.unwrap_or(0)).into()),
    }
    let headers = &*resp.headers;
    if !has_token(header_value(headers, "Upgrade").as_deref(), "websocket") {
        return Err(HandshakeError::Upgrade.into());
    }
    if !has_token(header_value(headers, "Connection").as_deref(), "upgrade") {
        return Err(HandshakeError::Connection.into());
    }
    if header_value(headers, "Sec-WebSocket-Accept").as_deref()
        != Some(derive_accept_key(key.as_bytes()).as_str())
    {
        return Err(HandshakeError::SecWebSocketAccept.into());
    }
    match header_value(headers, "Sec-WebSocket-Protocol") {
        None => Ok(String::new()),
        Some(p) if protocols.iter().any(|offered| *offered == p) => Ok(p),
        Some(p) => Err(Error::Handshake(HandshakeError::SecWebSocketProtocol(p))),
    }
}

/// State shared by the handshake hooks of one connection.
///
/// Besides the fixed keys (upgrader, local and remote address, request
/// path) it holds at most one value per type for the hooks to pass along.
#[derive(Default)]
pub struct HandshakeContext {
    upgrader: Upgrader,
    local_addr: Option<SocketAddr>,
    remote_addr: Option<SocketAddr>,
    path: String,
    values: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl HandshakeContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upgrader(&self) -> &Upgrader {
        &self.upgrader
    }

    /// Hooks may change subprotocol negotiation for this connection only.
    pub fn upgrader_mut(&mut self) -> &mut Upgrader {
        &mut self.upgrader
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    /// Request path; empty until the upgrade request has been read.
    pub fn path(&self) -> &str {
        &self.path
    }

    pub(crate) fn prepare(&mut self, upgrader: Upgrader, local: SocketAddr, remote: SocketAddr) {
        self.upgrader = upgrader;
        self.local_addr = Some(local);
        self.remote_addr = Some(remote);
    }

    pub(crate) fn set_path(&mut self, path: String) {
        self.path = path;
    }

    pub fn insert<T: Any + Send + Sync>(&mut self, value: T) -> Option<T> {
        self.values
            .insert(TypeId::of::<T>(), Box::new(value))
            .and_then(|old| old.downcast::<T>().ok().map(|b| *b))
    }

    pub fn get<T: Any + Send + Sync>(&self) -> Option<&T> {
        self.values.get(&TypeId::of::<T>())?.downcast_ref::<T>()
    }
}
