//! Incremental UTF-8 decoding of remote output.
//!
//! SSH reads are split at arbitrary byte boundaries, so a multi-byte
//! character can straddle two chunks. The decoder holds back an incomplete
//! trailing sequence until the next chunk arrives. Bytes that can never form
//! valid UTF-8 are dropped.

#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn decode(&mut self, chunk: &[u8]) -> String {
        self.pending.extend_from_slice(chunk);
        let mut out = String::with_capacity(self.pending.len());
        let mut rest: &[u8] = &self.pending;

        loop {
            match std::str::from_utf8(rest) {
                Ok(valid) => {
                    out.push_str(valid);
                    rest = &[];
                    break;
                }
                Err(e) => {
                    let (valid, after) = rest.split_at(e.valid_up_to());
                    // valid_up_to() guarantees this prefix decodes.
                    out.push_str(std::str::from_utf8(valid).unwrap_or_default());
                    match e.error_len() {
                        Some(bad) => rest = &after[bad..],
                        // Incomplete sequence at the end; wait for more bytes.
                        None => {
                            rest = after;
                            break;
                        }
                    }
                }
            }
        }

        self.pending = rest.to_vec();
        out
    }

    /// Bytes held back waiting for the rest of a character.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_passes_through() {
        let mut d = Utf8Decoder::new();
        assert_eq!(d.decode(b"root@host:~# "), "root@host:~# ");
        assert_eq!(d.pending(), 0);
    }

    #[test]
    fn split_character_is_joined() {
        let bytes = "héllo".as_bytes();
        let mut d = Utf8Decoder::new();
        assert_eq!(d.decode(&bytes[..2]), "h");
        assert_eq!(d.pending(), 1);
        assert_eq!(d.decode(&bytes[2..]), "éllo");
        assert_eq!(d.pending(), 0);
    }

    #[test]
    fn invalid_bytes_are_dropped() {
        let mut d = Utf8Decoder::new();
        assert_eq!(d.decode(b"a\xffb\xfe"), "ab");
        assert_eq!(d.pending(), 0);
    }

    #[test]
    fn four_byte_split_over_three_chunks() {
        let bytes = "🙂".as_bytes();
        let mut d = Utf8Decoder::new();
        assert_eq!(d.decode(&bytes[..1]), "");
        assert_eq!(d.decode(&bytes[1..3]), "");
        assert_eq!(d.decode(&bytes[3..]), "🙂");
    }
}
