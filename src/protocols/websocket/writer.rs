//! Frame writer.

use std::io;
use std::sync::atomic::Ordering;
use std::sync::MutexGuard;

use super::conn::{lock, WebSocketConn};
use super::control::close_body;
use super::error::{CloseCode, Error, Result};
use super::frame::{apply_mask_fast, new_mask_key, FrameHead, OpCode, MAX_CONTROL_PAYLOAD, MAX_HEAD_LEN};
use super::{MessageType, Role};

/// Payload bytes per frame emitted by [`MessageWriter`].
pub const MESSAGE_WRITER_FRAME_SIZE: usize = 4096;

impl WebSocketConn {
    fn lock_write(&self) -> MutexGuard<'_, ()> {
        lock(&self.0.write_lock)
    }

    /// Put one frame on the wire. The caller holds the write lock.
    fn send_frame(
        &self,
        _held: &MutexGuard<'_, ()>,
        fin: bool,
        opcode: OpCode,
        segments: &[&[u8]],
    ) -> Result<()> {
        let len: usize = segments.iter().map(|s| s.len()).sum();
        let mask = match self.0.role {
            Role::Client => Some(new_mask_key()),
            Role::Server => None,
        };
        let head = FrameHead::new(fin, opcode, mask, len as u64);
        let mut head_buf = [0u8; MAX_HEAD_LEN];
        let head_len = head.encode(&mut head_buf);
        let raw = &self.0.raw;

        if self.0.combine_writes || mask.is_some() {
            let mut buf = Vec::with_capacity(len + MAX_HEAD_LEN);
            buf.extend_from_slice(&head_buf[..head_len]);
            for segment in segments {
                buf.extend_from_slice(segment);
            }
            if let Some(key) = mask {
                apply_mask_fast(key, &mut buf[head_len..], 0);
            }
            if self.0.combine_writes || len == 0 {
                raw.write(&buf)?;
            } else {
                raw.write(&buf[..head_len])?;
                raw.write(&buf[head_len..])?;
            }
            return Ok(());
        }

        raw.write(&head_buf[..head_len])?;
        match segments {
            _ if len == 0 => {}
            [one] => {
                raw.write(one)?;
            }
            many => {
                raw.writev(many)?;
            }
        }
        Ok(())
    }

    fn check_control(tp: MessageType, len: usize) -> Result<()> {
        if tp.is_control() && len > MAX_CONTROL_PAYLOAD {
            return Err(Error::Config("control frame payload exceeds 125 bytes"));
        }
        Ok(())
    }

    /// Write a message as a single final frame.
    ///
    /// Safe to call from many threads; each message is written whole.
    pub fn write_message(&self, tp: MessageType, payload: &[u8]) -> Result<()> {
        Self::check_control(tp, payload.len())?;
        let held = self.lock_write();
        if tp == MessageType::Close && self.0.close_sent.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.send_frame(&held, true, tp.opcode(), &[payload])
    }

    /// Write the concatenation of `segments` as a single message.
    ///
    /// On the server side the segments go to the transport as they are. A
    /// client must mask the whole payload, so it joins them first.
    pub fn writev_message(&self, tp: MessageType, segments: &[&[u8]]) -> Result<()> {
        if self.0.role == Role::Client {
            return self.write_message(tp, &segments.concat());
        }
        let len = segments.iter().map(|s| s.len()).sum();
        Self::check_control(tp, len)?;
        let held = self.lock_write();
        if tp == MessageType::Close && self.0.close_sent.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.send_frame(&held, true, tp.opcode(), segments)
    }

    /// Byte-stream write: `buf` goes out as one message of the
    /// connection-wise message type.
    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        let tp = self.0.message_type.ok_or(Error::Config(
            "message type is neither Text nor Binary for this connection, cannot use write",
        ))?;
        self.write_message(tp, buf)?;
        Ok(buf.len())
    }

    /// Send a Close frame unless one was already sent.
    pub(super) fn send_close(&self, code: CloseCode, reason: &str) -> Result<()> {
        self.write_message(MessageType::Close, &close_body(code, reason))
    }

    /// Start a message written in pieces.
    ///
    /// Not safe to share: one streaming writer at a time per connection.
    /// Frames of other writers may land between its fragments.
    pub fn next_message_writer(&self, tp: MessageType) -> Result<MessageWriter<'_>> {
        if tp.is_control() {
            return Err(Error::Config("control messages cannot be streamed"));
        }
        Ok(MessageWriter {
            conn: self,
            message_type: tp,
            buf: Vec::with_capacity(MESSAGE_WRITER_FRAME_SIZE),
            started: false,
        })
    }
}

/// Writes one message as a series of frames.
///
/// Data is buffered up to [`MESSAGE_WRITER_FRAME_SIZE`] bytes per frame.
/// [`close`](Self::close) sends the final frame; dropping the writer without
/// closing it leaves the message unfinished.
pub struct MessageWriter<'a> {
    conn: &'a WebSocketConn,
    message_type: MessageType,
    buf: Vec<u8>,
    started: bool,
}

impl MessageWriter<'_> {
    fn emit(&mut self, fin: bool) -> Result<()> {
        let opcode = if self.started {
            OpCode::Continue
        } else {
            self.message_type.opcode()
        };
        let held = self.conn.lock_write();
        self.conn.send_frame(&held, fin, opcode, &[&self.buf])?;
        self.started = true;
        self.buf.clear();
        Ok(())
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    /// Send what is buffered as the final frame.
    pub fn close(mut self) -> Result<()> {
        self.emit(true)
    }
}

impl io::Write for MessageWriter<'_> {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        if data.is_empty() {
            return Ok(0);
        }
        if self.buf.len() == MESSAGE_WRITER_FRAME_SIZE {
            self.emit(false)?;
        }
        let n = data.len().min(MESSAGE_WRITER_FRAME_SIZE - self.buf.len());
        self.buf.extend_from_slice(&data[..n]);
        Ok(n)
    }

    /// Send what is buffered as a non-final frame.
    fn flush(&mut self) -> io::Result<()> {
        if !self.buf.is_empty() {
            self.emit(false)?;
        }
        Ok(())
    }
}
