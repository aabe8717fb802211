//! Ping, pong and close frames that arrive while reading.

use std::sync::Arc;

use tracing::debug;

use super::error::{CloseCode, CloseFrame, Error, Result};
use super::WebSocketConn;
use crate::runtime;

/// User callback for a control frame, given its payload.
pub type ControlFn = Arc<dyn Fn(&WebSocketConn, &[u8]) -> Result<()> + Send + Sync>;

/// Where a control frame callback runs.
#[derive(Clone)]
pub enum ControlHandler {
    /// On the reading thread, before the read continues.
    Inline(ControlFn),
    /// On the worker pool; the read continues immediately.
    Pool(ControlFn),
}

impl ControlHandler {
    pub fn inline<F>(f: F) -> Self
    where
        F: Fn(&WebSocketConn, &[u8]) -> Result<()> + Send + Sync + 'static,
    {
        ControlHandler::Inline(Arc::new(f))
    }

    pub fn pool<F>(f: F) -> Self
    where
        F: Fn(&WebSocketConn, &[u8]) -> Result<()> + Send + Sync + 'static,
    {
        ControlHandler::Pool(Arc::new(f))
    }

    pub(crate) fn call(&self, conn: &WebSocketConn, payload: Vec<u8>) -> Result<()> {
        match self {
            ControlHandler::Inline(f) => f(conn, &payload),
            ControlHandler::Pool(f) => {
                let f = Arc::clone(f);
                let conn = conn.clone();
                runtime::submit(move || {
                    if let Err(e) = f(&conn, &payload) {
                        debug!(peer = %conn.peer_addr(), error = %e, "Control frame handler failed");
                    }
                })?;
                Ok(())
            }
        }
    }
}

/// Parse the body of a Close frame.
pub(crate) fn parse_close(payload: &[u8]) -> Result<CloseFrame> {
    match payload.len() {
        0 => Ok(CloseFrame::new(CloseCode::NO_STATUS, "")),
        1 => Err(Error::protocol(
            CloseCode::PROTOCOL_ERROR,
            "close frame with a one byte body",
        )),
        _ => {
            let code = CloseCode(u16::from_be_bytes([payload[0], payload[1]]));
            if !code.is_sendable() {
                return Err(Error::protocol(
                    CloseCode::PROTOCOL_ERROR,
                    format!("invalid close code {code}"),
                ));
            }
            let reason = std::str::from_utf8(&payload[2..]).map_err(|_| Error::InvalidUtf8)?;
            Ok(CloseFrame::new(code, reason))
        }
    }
}

/// Encode a Close frame body. `NO_STATUS` encodes as an empty body; the
/// reason is cut to fit a control frame.
pub(crate) fn close_body(code: CloseCode, reason: &str) -> Vec<u8> {
    if code == CloseCode::NO_STATUS || !code.is_sendable() {
        return Vec::new();
    }
    let mut end = reason.len().min(123);
    while !reason.is_char_boundary(end) {
        end -= 1;
    }
    let mut body = Vec::with_capacity(2 + end);
    body.extend_from_slice(&code.0.to_be_bytes());
    body.extend_from_slice(&reason.as_bytes()[..end]);
    body
}
