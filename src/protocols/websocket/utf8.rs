//! Incremental UTF-8 validation for text messages that arrive in pieces.

/// Validates a byte stream chunk by chunk. A code point may be split across
/// chunk (and frame) boundaries.
#[derive(Debug, Default)]
pub struct Utf8Validator {
    pending: [u8; 4],
    pending_len: usize,
}

impl Utf8Validator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next chunk. Returns false as soon as the stream can no longer
    /// be valid UTF-8.
    pub fn feed(&mut self, mut input: &[u8]) -> bool {
        while self.pending_len > 0 {
            let Some((&b, rest)) = input.split_first() else {
                return true;
            };
            input = rest;
            self.pending[self.pending_len] = b;
            self.pending_len += 1;
            match std::str::from_utf8(&self.pending[..self.pending_len]) {
                Ok(_) => self.pending_len = 0,
                Err(e) if e.error_len().is_some() => return false,
                Err(_) if self.pending_len == self.pending.len() => return false,
                Err(_) => {}
            }
        }

        match std::str::from_utf8(input) {
            Ok(_) => true,
            Err(e) if e.error_len().is_some() => false,
            Err(e) => {
                let tail = &input[e.valid_up_to()..];
                self.pending[..tail.len()].copy_from_slice(tail);
                self.pending_len = tail.len();
                true
            }
        }
    }

    /// End of message: valid only if no code point is left incomplete.
    /// Resets the validator for the next message.
    pub fn finish(&mut self) -> bool {
        let complete = self.pending_len == 0;
        self.pending_len = 0;
        complete
    }

    pub fn reset(&mut self) {
        self.pending_len = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ascii() {
        let mut v = Utf8Validator::new();
        assert!(v.feed(b"hello"));
        assert!(v.finish());
    }

    #[test]
    fn test_split_code_points() {
        let text = "κόσμε ☃ 𝄞 end".as_bytes();
        for split in 0..text.len() {
            let mut v = Utf8Validator::new();
            assert!(v.feed(&text[..split]), "split {split}");
            assert!(v.feed(&text[split..]), "split {split}");
            assert!(v.finish(), "split {split}");
        }
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut v = Utf8Validator::new();
        for b in "𝄞☃é".as_bytes() {
            assert!(v.feed(std::slice::from_ref(b)));
        }
        assert!(v.finish());
    }

    #[test]
    fn test_invalid() {
        let mut v = Utf8Validator::new();
        assert!(!v.feed(&[0xce, 0xba, 0xe1, 0xbd, 0xb9, 0xcf, 0x83, 0xce, 0xbc, 0xce, 0xb5, 0xed, 0xa0, 0x80]));

        let mut v = Utf8Validator::new();
        assert!(!v.feed(&[0xff]));

        // A lead byte completed by something that is not a continuation.
        let mut v = Utf8Validator::new();
        assert!(v.feed(&[0xe2, 0x98]));
        assert!(!v.feed(b"a"));
    }

    #[test]
    fn test_truncated_at_end() {
        let mut v = Utf8Validator::new();
        assert!(v.feed(&[0xf0, 0x9d, 0x84]));
        assert!(!v.finish());
        // Finish resets, so the next message starts clean.
        assert!(v.feed(b"ok"));
        assert!(v.finish());
    }
}
