//! RFC 6455 websocket server and client on top of the transport runtime.
//!
//! A [`Service`] accepts TCP (or TLS) connections, performs the HTTP upgrade
//! and then calls the user handler each time a request arrives, with the
//! [`WebSocketConn`] that was attached to the connection at upgrade time.
//! [`dial`] is the client side.
//!
//! Reading is single-reader: only one thread may call `read`,
//! `read_message`, `read_any_message` or `next_message_reader` at a time.
//! `write`, `write_message` and `writev_message` may be called from any
//! number of threads; every message goes out as one unit.

mod client;
mod conn;
mod control;
mod error;
pub mod frame;
mod handshake;
mod options;
mod raw;
mod reader;
mod server;
mod utf8;
mod writer;

use std::fmt;

pub use client::dial;
pub use conn::{ConnConfig, WebSocketConn};
pub use control::{ControlFn, ControlHandler};
pub use error::{BoxError, CloseCode, CloseFrame, Error, HandshakeError, Result};
pub use handshake::{
    derive_accept_key, new_sec_key, Handshake, HandshakeContext, ProtocolCustom, ProtocolSelect,
    Upgrader, GUID,
};
pub use options::{
    AfterHandshake, BeforeHandshake, ClientOptions, Handler, NewHandshakeContext, OnClosed,
    ServerOptions, DEFAULT_DIAL_TIMEOUT,
};
pub use raw::{RawConn, StreamConn, TlsAcceptor, TlsConnector};
pub use reader::MessageReader;
pub use server::Service;
pub use utf8::Utf8Validator;
pub use writer::MessageWriter;

use frame::OpCode;

/// Kind of a websocket message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Text = 1,
    Binary = 2,
    Ping = 3,
    Pong = 4,
    Close = 5,
}

impl MessageType {
    pub const fn opcode(self) -> OpCode {
        match self {
            MessageType::Text => OpCode::Text,
            MessageType::Binary => OpCode::Binary,
            MessageType::Ping => OpCode::Ping,
            MessageType::Pong => OpCode::Pong,
            MessageType::Close => OpCode::Close,
        }
    }

    /// Continuation frames belong to a message and have no type of their own.
    pub const fn from_opcode(opcode: OpCode) -> Option<MessageType> {
        match opcode {
            OpCode::Continue => None,
            OpCode::Text => Some(MessageType::Text),
            OpCode::Binary => Some(MessageType::Binary),
            OpCode::Ping => Some(MessageType::Ping),
            OpCode::Pong => Some(MessageType::Pong),
            OpCode::Close => Some(MessageType::Close),
        }
    }

    pub const fn is_control(self) -> bool {
        matches!(
            self,
            MessageType::Ping | MessageType::Pong | MessageType::Close
        )
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MessageType::Text => "Text",
            MessageType::Binary => "Binary",
            MessageType::Ping => "Ping",
            MessageType::Pong => "Pong",
            MessageType::Close => "Close",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for MessageType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "text" => Ok(MessageType::Text),
            "binary" => Ok(MessageType::Binary),
            _ => Err(Error::Config("message type must be text or binary")),
        }
    }
}

/// Which end of the connection we are. Client frames are masked.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Server,
    Client,
}
