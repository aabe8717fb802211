//! Frame reader: message cursors, continuation frames and control frames
//! interleaved between fragments.

use std::io;

use tracing::{debug, warn};

use super::conn::{lock, WebSocketConn};
use super::control::parse_close;
use super::error::{CloseCode, CloseFrame, Error, Result};
use super::frame::{apply_mask_fast, FrameHead, OpCode, MAX_HEAD_LEN};
use super::utf8::Utf8Validator;
use super::{MessageType, Role};
use crate::runtime;

/// Upper bound on a single buffer growth step while collecting a message.
const READ_CHUNK: usize = 64 * 1024;

/// Payload cursor of the data frame being read.
#[derive(Debug, Default, Clone, Copy)]
struct Cursor {
    remaining: u64,
    mask: Option<[u8; 4]>,
    /// Payload position modulo 4, for unmasking in pieces.
    offset: usize,
    fin: bool,
}

impl Cursor {
    fn new(head: &FrameHead) -> Self {
        Cursor {
            remaining: head.length.to_num(),
            mask: head.mask,
            offset: 0,
            fin: head.fin,
        }
    }
}

/// Reader side of a connection.
#[derive(Default)]
pub(crate) struct ReadState {
    frame: Cursor,
    /// Data message currently open for reading.
    message: Option<MessageType>,
    /// Bumped for every message opened, so stale readers see EOF.
    seq: u64,
    utf8: Utf8Validator,
    /// Fragments collected by `read_any_message` while a control frame is
    /// handed back to the caller.
    partial: Option<(MessageType, Vec<u8>)>,
    /// Set once the peer's Close frame has been read.
    closed: Option<CloseFrame>,
}

impl ReadState {
    fn open(&mut self, tp: MessageType, head: &FrameHead) {
        self.message = Some(tp);
        self.seq += 1;
        self.frame = Cursor::new(head);
        self.utf8.reset();
    }
}

/// Reads the payload of one message, across continuation frames.
///
/// Returned by [`WebSocketConn::next_message_reader`]. Reaches end of file at
/// the end of the message, or once another message has been opened.
pub struct MessageReader<'a> {
    conn: &'a WebSocketConn,
    seq: u64,
    message_type: MessageType,
}

impl MessageReader<'_> {
    pub fn message_type(&self) -> MessageType {
        self.message_type
    }
}

impl io::Read for MessageReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut st = lock(&self.conn.0.read);
        if st.seq != self.seq || st.message.is_none() {
            return Ok(0);
        }
        self.conn.read_payload(&mut st, buf).map_err(io::Error::from)
    }
}

impl WebSocketConn {
    fn read_exact_raw(&self, buf: &mut [u8]) -> Result<()> {
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.0.raw.read(&mut buf[filled..])?;
            if n == 0 {
                return Err(Error::Io(runtime::closed_error()));
            }
            filled += n;
        }
        Ok(())
    }

    /// Report a protocol violation to the peer and drop the connection.
    pub(super) fn fail(&self, err: Error) -> Error {
        let code = match &err {
            Error::Protocol { code, .. } => *code,
            Error::InvalidUtf8 => CloseCode::INVALID_PAYLOAD,
            _ => return err,
        };
        warn!(peer = %self.peer_addr(), error = %err, "Websocket protocol error, closing");
        let _ = self.send_close(code, "");
        self.0.raw.close();
        err
    }

    fn read_head(&self) -> Result<FrameHead> {
        let mut buf = [0u8; MAX_HEAD_LEN];
        self.read_exact_raw(&mut buf[..2])?;
        let len = FrameHead::head_len(buf[1]);
        self.read_exact_raw(&mut buf[2..len])?;
        let head = match FrameHead::decode(&buf[..len]) {
            Ok(Some((head, _))) => head,
            Ok(None) => {
                return Err(self.fail(Error::protocol(
                    CloseCode::PROTOCOL_ERROR,
                    "truncated frame head",
                )))
            }
            Err(e) => return Err(self.fail(e.into())),
        };
        match (self.0.role, head.mask) {
            (Role::Server, None) => Err(self.fail(Error::protocol(
                CloseCode::PROTOCOL_ERROR,
                "client frame is not masked",
            ))),
            (Role::Client, Some(_)) => Err(self.fail(Error::protocol(
                CloseCode::PROTOCOL_ERROR,
                "server frame is masked",
            ))),
            _ => Ok(head),
        }
    }

    /// Read and unmask `len` payload bytes onto the end of `out`.
    fn read_frame_payload(&self, head: &FrameHead, out: &mut Vec<u8>) -> Result<()> {
        let mut remaining = head.length.to_num();
        let mut offset = 0usize;
        while remaining > 0 {
            let n = remaining.min(READ_CHUNK as u64) as usize;
            let start = out.len();
            out.resize(start + n, 0);
            self.read_exact_raw(&mut out[start..])?;
            if let Some(key) = head.mask {
                apply_mask_fast(key, &mut out[start..], offset);
            }
            offset = (offset + n) & 3;
            remaining -= n as u64;
        }
        Ok(())
    }

    fn handle_control(&self, st: &mut ReadState, head: FrameHead) -> Result<()> {
        let mut payload = Vec::with_capacity(head.length.to_num() as usize);
        self.read_frame_payload(&head, &mut payload)?;
        match head.opcode {
            OpCode::Ping => match self.ping_handler() {
                Some(handler) => handler.call(self, payload),
                None => self.write_message(MessageType::Pong, &payload),
            },
            OpCode::Pong => match self.pong_handler() {
                Some(handler) => handler.call(self, payload),
                None => Ok(()),
            },
            _ => Err(self.on_close_frame(st, &payload)),
        }
    }

    /// Answer the peer's Close frame. Reads fail with the returned error from
    /// now on.
    fn on_close_frame(&self, st: &mut ReadState, payload: &[u8]) -> Error {
        let frame = match parse_close(payload) {
            Ok(frame) => frame,
            Err(e) => return self.fail(e),
        };
        if let Err(e) = self.send_close(frame.code, "") {
            debug!(peer = %self.peer_addr(), error = %e, "Failed to answer close frame");
        }
        if self.0.role == Role::Server {
            self.0.raw.close();
        }
        st.message = None;
        st.partial = None;
        st.closed = Some(frame.clone());
        Error::Closed(frame)
    }

    fn check_closed(st: &ReadState) -> Result<()> {
        match &st.closed {
            Some(frame) => Err(Error::Closed(frame.clone())),
            None => Ok(()),
        }
    }

    /// Skip to the first frame of the next data message, running control
    /// handlers on the way, and open it.
    fn begin_message(&self, st: &mut ReadState) -> Result<MessageType> {
        Self::check_closed(st)?;
        if st.partial.is_some() {
            return Err(Error::Config(
                "a fragmented message is half read by read_any_message",
            ));
        }
        if st.message.is_some() {
            self.discard(st)?;
        }
        loop {
            let head = self.read_head()?;
            if head.opcode.is_control() {
                self.handle_control(st, head)?;
                continue;
            }
            let Some(tp) = MessageType::from_opcode(head.opcode) else {
                return Err(self.fail(Error::protocol(
                    CloseCode::PROTOCOL_ERROR,
                    "continuation frame without a message",
                )));
            };
            st.open(tp, &head);
            return Ok(tp);
        }
    }

    /// Read payload of the open message. Returns 0 at its end (given a
    /// non-empty `buf`).
    fn read_payload(&self, st: &mut ReadState, buf: &mut [u8]) -> Result<usize> {
        loop {
            let Some(tp) = st.message else {
                return Ok(0);
            };
            if st.frame.remaining == 0 {
                if st.frame.fin {
                    st.message = None;
                    if tp == MessageType::Text && !st.utf8.finish() {
                        return Err(self.fail(Error::InvalidUtf8));
                    }
                    return Ok(0);
                }
                let head = self.read_head()?;
                if head.opcode.is_control() {
                    self.handle_control(st, head)?;
                    continue;
                }
                if head.opcode != OpCode::Continue {
                    st.message = None;
                    return Err(self.fail(Error::protocol(
                        CloseCode::PROTOCOL_ERROR,
                        "expected a continuation frame",
                    )));
                }
                st.frame = Cursor::new(&head);
                continue;
            }
            if buf.is_empty() {
                return Ok(0);
            }

            let want = st.frame.remaining.min(buf.len() as u64) as usize;
            let n = self.0.raw.read(&mut buf[..want])?;
            if n == 0 {
                return Err(Error::Io(runtime::closed_error()));
            }
            if let Some(key) = st.frame.mask {
                apply_mask_fast(key, &mut buf[..n], st.frame.offset);
            }
            st.frame.offset = (st.frame.offset + n) & 3;
            st.frame.remaining -= n as u64;
            if tp == MessageType::Text && !st.utf8.feed(&buf[..n]) {
                st.message = None;
                return Err(self.fail(Error::InvalidUtf8));
            }
            return Ok(n);
        }
    }

    fn read_to_end(&self, st: &mut ReadState, out: &mut Vec<u8>) -> Result<()> {
        loop {
            let want = (st.frame.remaining.min(READ_CHUNK as u64) as usize).max(512);
            let start = out.len();
            out.resize(start + want, 0);
            let read = self.read_payload(st, &mut out[start..]);
            let n = *read.as_ref().unwrap_or(&0);
            out.truncate(start + n);
            if read? == 0 {
                return Ok(());
            }
        }
    }

    fn discard(&self, st: &mut ReadState) -> Result<()> {
        let mut scratch = [0u8; 4096];
        while self.read_payload(st, &mut scratch)? > 0 {}
        Ok(())
    }

    /// Read a complete Text or Binary message. Control frames on the way are
    /// passed to the ping/pong/close handlers.
    ///
    /// Single reader only.
    pub fn read_message(&self) -> Result<(MessageType, Vec<u8>)> {
        let mut st = lock(&self.0.read);
        let tp = self.begin_message(&mut st)?;
        let mut payload = Vec::new();
        self.read_to_end(&mut st, &mut payload)?;
        Ok((tp, payload))
    }

    /// Open the next Text or Binary message for streaming. Whatever is left
    /// of the previous message is discarded.
    ///
    /// Single reader only.
    pub fn next_message_reader(&self) -> Result<(MessageType, MessageReader<'_>)> {
        let mut st = lock(&self.0.read);
        let tp = self.begin_message(&mut st)?;
        let reader = MessageReader {
            conn: self,
            seq: st.seq,
            message_type: tp,
        };
        Ok((tp, reader))
    }

    /// Read the next message of any type, control frames included, without
    /// running the control handlers. A Close frame is returned like any other
    /// message and is not answered.
    ///
    /// Control frames arriving between the fragments of a data message are
    /// returned first; the next call resumes the data message. Mixing this with
    /// the handler-driven readers while peers ping concurrently can deadlock a
    /// peer waiting for its pong.
    pub fn read_any_message(&self) -> Result<(MessageType, Vec<u8>)> {
        let mut st = lock(&self.0.read);
        Self::check_closed(&st)?;
        if st.message.is_some() {
            self.discard(&mut st)?;
        }
        loop {
            let head = self.read_head()?;
            match MessageType::from_opcode(head.opcode) {
                Some(tp) if tp.is_control() => {
                    let mut payload = Vec::with_capacity(head.length.to_num() as usize);
                    self.read_frame_payload(&head, &mut payload)?;
                    return Ok((tp, payload));
                }
                kind => {
                    let (tp, mut data) = match (st.partial.take(), kind) {
                        (None, Some(tp)) => {
                            st.utf8.reset();
                            (tp, Vec::new())
                        }
                        (Some(partial), None) => partial,
                        (None, None) => {
                            return Err(self.fail(Error::protocol(
                                CloseCode::PROTOCOL_ERROR,
                                "continuation frame without a message",
                            )))
                        }
                        (Some(_), Some(_)) => {
                            return Err(self.fail(Error::protocol(
                                CloseCode::PROTOCOL_ERROR,
                                "expected a continuation frame",
                            )))
                        }
                    };
                    let start = data.len();
                    self.read_frame_payload(&head, &mut data)?;
                    if tp == MessageType::Text && !st.utf8.feed(&data[start..]) {
                        return Err(self.fail(Error::InvalidUtf8));
                    }
                    if !head.fin {
                        st.partial = Some((tp, data));
                        continue;
                    }
                    if tp == MessageType::Text && !st.utf8.finish() {
                        return Err(self.fail(Error::InvalidUtf8));
                    }
                    return Ok((tp, data));
                }
            }
        }
    }

    /// Byte-stream read over messages of the connection-wise message type.
    ///
    /// Payloads of consecutive messages are read as one stream. A message of
    /// another type is discarded and reported as
    /// [`Error::MessageTypeMismatch`]; the next call continues after it.
    ///
    /// Single reader only.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize> {
        let want = self.0.message_type.ok_or(Error::Config(
            "message type is neither Text nor Binary for this connection, cannot use read",
        ))?;
        let mut st = lock(&self.0.read);
        loop {
            if st.message.is_none() {
                let got = self.begin_message(&mut st)?;
                if got != want {
                    self.discard(&mut st)?;
                    return Err(Error::MessageTypeMismatch { got, want });
                }
            }
            let n = self.read_payload(&mut st, buf)?;
            if n > 0 || buf.is_empty() {
                return Ok(n);
            }
        }
    }
}
