//! Websocket data frame.
//!
//! [RFC-6455 Section5](https://datatracker.ietf.org/doc/html/rfc6455#section-5)
//!
//! ```text
//! 0                   1                   2                   3
//! 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
//! +-+-+-+-+-------+-+-------------+-------------------------------+
//! |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
//! |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
//! |N|V|V|V|       |S|             |   (if payload len==126/127)   |
//! | |1|2|3|       |K|             |                               |
//! +-+-+-+-+-------+-+-------------+ - - - - - - - - - - - - - - - +
//! |     Extended payload length continued, if payload len == 127  |
//! + - - - - - - - - - - - - - - - +-------------------------------+
//! |                               |Masking-key, if MASK set to 1  |
//! +-------------------------------+-------------------------------+
//! | Masking-key (continued)       |          Payload Data         |
//! +-------------------------------- - - - - - - - - - - - - - - - +
//! ```

use std::fmt;

/// Largest possible frame head: 2 + 8 (length) + 4 (mask key).
pub const MAX_HEAD_LEN: usize = 14;

/// Control frames carry at most this many payload bytes.
pub const MAX_CONTROL_PAYLOAD: usize = 125;

/// Violations found while decoding a frame head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    ReservedBits,
    IllegalOpCode(u8),
    FragmentedControl,
    ControlTooLong,
    IllegalLength,
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use FrameError::*;
        match self {
            ReservedBits => write!(f, "reserved bits must be zero"),
            IllegalOpCode(op) => write!(f, "illegal opcode {op:#x}"),
            FragmentedControl => write!(f, "control frame must not be fragmented"),
            ControlTooLong => write!(f, "control frame payload exceeds 125 bytes"),
            IllegalLength => write!(f, "most significant bit of 64-bit length is set"),
        }
    }
}

impl std::error::Error for FrameError {}

/// Frame opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Continue = 0x00,
    Text = 0x01,
    Binary = 0x02,
    Close = 0x08,
    Ping = 0x09,
    Pong = 0x0a,
}

impl OpCode {
    /// Parse from the low nibble of the first head byte.
    #[inline]
    pub const fn from_flag(b: u8) -> Result<Self, FrameError> {
        use OpCode::*;
        let opcode = match b & 0x0f {
            0x00 => Continue,
            0x01 => Text,
            0x02 => Binary,
            0x08 => Close,
            0x09 => Ping,
            0x0a => Pong,
            other => return Err(FrameError::IllegalOpCode(other)),
        };
        Ok(opcode)
    }

    #[inline]
    pub const fn is_control(self) -> bool {
        (self as u8) & 0x08 != 0
    }
}

/// Payload length.
///
/// Could be 7 bits, 7+16 bits, or 7+64 bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadLen {
    /// 0 - 125
    Standard(u8),
    /// 126 - 65535
    Extended1(u16),
    /// 65536 and over
    Extended2(u64),
}

impl PayloadLen {
    #[inline]
    pub const fn from_num(n: u64) -> Self {
        if n < 126 {
            PayloadLen::Standard(n as u8)
        } else if n < 65536 {
            PayloadLen::Extended1(n as u16)
        } else {
            PayloadLen::Extended2(n)
        }
    }

    #[inline]
    pub const fn to_num(self) -> u64 {
        match self {
            PayloadLen::Standard(v) => v as u64,
            PayloadLen::Extended1(v) => v as u64,
            PayloadLen::Extended2(v) => v,
        }
    }

    /// The 7-bit length field.
    #[inline]
    pub const fn to_flag(self) -> u8 {
        match self {
            PayloadLen::Standard(b) => b,
            PayloadLen::Extended1(_) => 126,
            PayloadLen::Extended2(_) => 127,
        }
    }

    /// Bytes following the second head byte that encode the length.
    #[inline]
    pub const fn extra_len(flag: u8) -> usize {
        match flag & 0x7f {
            126 => 2,
            127 => 8,
            _ => 0,
        }
    }
}

/// Websocket frame head.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHead {
    pub fin: bool,
    pub opcode: OpCode,
    pub mask: Option<[u8; 4]>,
    pub length: PayloadLen,
}

impl FrameHead {
    pub const fn new(fin: bool, opcode: OpCode, mask: Option<[u8; 4]>, length: u64) -> Self {
        Self {
            fin,
            opcode,
            mask,
            length: PayloadLen::from_num(length),
        }
    }

    /// Total head size given its second byte.
    #[inline]
    pub const fn head_len(b1: u8) -> usize {
        2 + PayloadLen::extra_len(b1) + if b1 & 0x80 != 0 { 4 } else { 0 }
    }

    /// Encoded size of this head.
    pub fn encoded_len(&self) -> usize {
        let ext = match self.length {
            PayloadLen::Standard(_) => 0,
            PayloadLen::Extended1(_) => 2,
            PayloadLen::Extended2(_) => 8,
        };
        2 + ext + if self.mask.is_some() { 4 } else { 0 }
    }

    /// Encode into `buf`, returning the count of written bytes.
    pub fn encode(&self, buf: &mut [u8; MAX_HEAD_LEN]) -> usize {
        buf[0] = (if self.fin { 0x80 } else { 0x00 }) | self.opcode as u8;
        let mask_bit = if self.mask.is_some() { 0x80 } else { 0x00 };
        buf[1] = mask_bit | self.length.to_flag();
        let mut n = 2;
        match self.length {
            PayloadLen::Standard(_) => {}
            PayloadLen::Extended1(v) => {
                buf[2..4].copy_from_slice(&v.to_be_bytes());
                n += 2;
            }
            PayloadLen::Extended2(v) => {
                buf[2..10].copy_from_slice(&v.to_be_bytes());
                n += 8;
            }
        }
        if let Some(key) = self.mask {
            buf[n..n + 4].copy_from_slice(&key);
            n += 4;
        }
        n
    }

    /// Decode from the front of `buf`.
    ///
    /// Returns `Ok(None)` when `buf` does not hold a complete head yet,
    /// otherwise the head and the number of bytes it occupied.
    pub fn decode(buf: &[u8]) -> Result<Option<(FrameHead, usize)>, FrameError> {
        if buf.len() < 2 {
            return Ok(None);
        }
        let (b0, b1) = (buf[0], buf[1]);
        if b0 & 0x70 != 0 {
            return Err(FrameError::ReservedBits);
        }
        let fin = b0 & 0x80 != 0;
        let opcode = OpCode::from_flag(b0)?;

        let total = Self::head_len(b1);
        if buf.len() < total {
            return Ok(None);
        }

        let mut pos = 2;
        let length = match b1 & 0x7f {
            126 => {
                let v = u16::from_be_bytes([buf[2], buf[3]]);
                pos += 2;
                PayloadLen::Extended1(v)
            }
            127 => {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&buf[2..10]);
                pos += 8;
                let v = u64::from_be_bytes(raw);
                if v >> 63 != 0 {
                    return Err(FrameError::IllegalLength);
                }
                PayloadLen::Extended2(v)
            }
            v => PayloadLen::Standard(v),
        };

        let mask = if b1 & 0x80 != 0 {
            let mut key = [0u8; 4];
            key.copy_from_slice(&buf[pos..pos + 4]);
            pos += 4;
            Some(key)
        } else {
            None
        };

        if opcode.is_control() {
            if !fin {
                return Err(FrameError::FragmentedControl);
            }
            if length.to_num() > MAX_CONTROL_PAYLOAD as u64 {
                return Err(FrameError::ControlTooLong);
            }
        }

        Ok(Some((
            FrameHead {
                fin,
                opcode,
                mask,
                length,
            },
            pos,
        )))
    }
}

/// Generate a new random mask key.
#[inline]
pub fn new_mask_key() -> [u8; 4] {
    rand::random::<[u8; 4]>()
}

/// Mask the buffer, byte by byte. `offset` is the position of `buf[0]`
/// within the frame payload, so a payload can be unmasked in pieces.
#[inline]
pub fn apply_mask(key: [u8; 4], buf: &mut [u8], offset: usize) {
    for (i, b) in buf.iter_mut().enumerate() {
        *b ^= key[(offset + i) & 0x03];
    }
}

/// Mask the buffer 8 bytes at a time.
pub fn apply_mask_fast(key: [u8; 4], buf: &mut [u8], offset: usize) {
    let mut rotated = [0u8; 4];
    for (i, b) in rotated.iter_mut().enumerate() {
        *b = key[(offset + i) & 0x03];
    }
    let key8 = u64::from_ne_bytes([
        rotated[0], rotated[1], rotated[2], rotated[3], rotated[0], rotated[1], rotated[2],
        rotated[3],
    ]);

    let mut chunks = buf.chunks_exact_mut(8);
    for chunk in &mut chunks {
        let mut word = [0u8; 8];
        word.copy_from_slice(chunk);
        let masked = u64::from_ne_bytes(word) ^ key8;
        chunk.copy_from_slice(&masked.to_ne_bytes());
    }
    apply_mask(rotated, chunks.into_remainder(), 0);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(head: FrameHead) -> Vec<u8> {
        let mut buf = [0u8; MAX_HEAD_LEN];
        let n = head.encode(&mut buf);
        buf[..n].to_vec()
    }

    #[test]
    fn test_opcode_flags() {
        for v in [0x00, 0x01, 0x02, 0x08, 0x09, 0x0a] {
            assert_eq!(OpCode::from_flag(v).unwrap() as u8, v);
        }
        for v in [0x03, 0x07, 0x0b, 0x0f] {
            assert_eq!(OpCode::from_flag(v), Err(FrameError::IllegalOpCode(v)));
        }
        assert!(OpCode::Ping.is_control());
        assert!(!OpCode::Binary.is_control());
    }

    #[test]
    fn test_length_forms() {
        let cases: [(u64, usize, u8); 7] = [
            (0, 2, 0),
            (1, 2, 1),
            (125, 2, 125),
            (126, 4, 126),
            (127, 4, 126),
            (65535, 4, 126),
            (65536, 10, 127),
        ];
        for (len, head_len, flag) in cases {
            let bytes = encode(FrameHead::new(true, OpCode::Binary, None, len));
            assert_eq!(bytes.len(), head_len, "len {len}");
            assert_eq!(bytes[1] & 0x7f, flag, "len {len}");
            let (head, used) = FrameHead::decode(&bytes).unwrap().unwrap();
            assert_eq!(used, head_len);
            assert_eq!(head.length.to_num(), len);
        }
    }

    #[test]
    fn test_masked_head() {
        let head = FrameHead::new(false, OpCode::Text, Some([1, 2, 3, 4]), 300);
        let bytes = encode(head);
        assert_eq!(bytes.len(), 8);
        assert_eq!(bytes[0], 0x01);
        assert_eq!(bytes[1] & 0x80, 0x80);
        assert_eq!(head.encoded_len(), 8);
        assert_eq!(FrameHead::head_len(bytes[1]), 8);
        let (decoded, _) = FrameHead::decode(&bytes).unwrap().unwrap();
        assert_eq!(decoded, head);
    }

    #[test]
    fn test_decode_incomplete() {
        let bytes = encode(FrameHead::new(true, OpCode::Binary, Some([9; 4]), 70000));
        for cut in 0..bytes.len() {
            assert_eq!(FrameHead::decode(&bytes[..cut]).unwrap(), None);
        }
    }

    #[test]
    fn test_decode_violations() {
        assert_eq!(
            FrameHead::decode(&[0xc1, 0x00]),
            Err(FrameError::ReservedBits)
        );
        assert_eq!(
            FrameHead::decode(&[0x09, 0x00]),
            Err(FrameError::FragmentedControl)
        );
        assert_eq!(
            FrameHead::decode(&[0x89, 126, 0x00, 126]),
            Err(FrameError::ControlTooLong)
        );
        let mut long = vec![0x82, 127];
        long.extend_from_slice(&u64::MAX.to_be_bytes());
        assert_eq!(FrameHead::decode(&long), Err(FrameError::IllegalLength));
    }

    #[test]
    fn test_mask_involution() {
        let key = new_mask_key();
        let buf: Vec<u8> = (0..1024u32).map(|i| (i * 7) as u8).collect();
        let mut masked = buf.clone();
        apply_mask(key, &mut masked, 0);
        apply_mask(key, &mut masked, 0);
        assert_eq!(buf, masked);
    }

    #[test]
    fn test_mask_fast_matches_bytewise() {
        let key = [0x37, 0xfa, 0x21, 0x3d];
        for len in 0..40 {
            for offset in 0..4 {
                let buf: Vec<u8> = (0..len as u8).collect();
                let mut a = buf.clone();
                let mut b = buf.clone();
                apply_mask(key, &mut a, offset);
                apply_mask_fast(key, &mut b, offset);
                assert_eq!(a, b, "len {len} offset {offset}");
            }
        }
    }

    #[test]
    fn test_mask_in_pieces() {
        let key = [1, 2, 3, 4];
        let buf: Vec<u8> = (0..23u8).collect();
        let mut whole = buf.clone();
        apply_mask(key, &mut whole, 0);

        let mut pieces = buf.clone();
        let (a, b) = pieces.split_at_mut(5);
        apply_mask(key, a, 0);
        apply_mask_fast(key, b, 5);
        assert_eq!(whole, pieces);
    }

    #[test]
    fn test_rfc_example() {
        // A single-frame masked text message containing "Hello".
        let wire = [
            0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58,
        ];
        let (head, used) = FrameHead::decode(&wire).unwrap().unwrap();
        assert!(head.fin);
        assert_eq!(head.opcode, OpCode::Text);
        let mut payload = wire[used..].to_vec();
        apply_mask(head.mask.unwrap(), &mut payload, 0);
        assert_eq!(payload, b"Hello");
    }
}
