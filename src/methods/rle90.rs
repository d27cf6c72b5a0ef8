//! Generic run-length decoder used by BinHex and SIT method 1: a literal
//! byte `0x90` (parameterized here as `escape`, though every caller uses
//! the same value) followed by a repeat count `n` means "repeat the
//! previous byte `n` more times"; `n == 0` means the escape byte itself
//! was a literal `0x90`. Grounded on `hqx_rle_decode` in `hqx.c`.

use crate::error::{MunboxError, Result};

pub struct Rle90Decoder {
    escape: u8,
    last_byte: Option<u8>,
    pending_repeats: usize,
}

impl Rle90Decoder {
    pub fn new(escape: u8) -> Self {
        Rle90Decoder {
            escape,
            last_byte: None,
            pending_repeats: 0,
        }
    }

    /// Decode from `input` (the raw compressed byte source, already stripped
    /// of any outer framing) into `out`, pulling one byte at a time via
    /// `next_in`. Returns the number of bytes written.
    pub fn fill(
        &mut self,
        mut next_in: impl FnMut() -> Result<Option<u8>>,
        out: &mut [u8],
    ) -> Result<usize> {
        let mut produced = 0;
        while produced < out.len() {
            if self.pending_repeats > 0 {
                out[produced] = self.last_byte.unwrap_or(0);
                produced += 1;
                self.pending_repeats -= 1;
                continue;
            }

            let byte = match next_in()? {
                Some(b) => b,
                None => break,
            };

            if byte != self.escape {
                out[produced] = byte;
                produced += 1;
                self.last_byte = Some(byte);
                continue;
            }

            let count = match next_in()? {
                Some(b) => b,
                None => {
                    // A dangling escape byte at end-of-stream is a literal.
                    out[produced] = self.escape;
                    produced += 1;
                    self.last_byte = Some(self.escape);
                    continue;
                }
            };

            if count == 0 {
                out[produced] = self.escape;
                produced += 1;
                self.last_byte = Some(self.escape);
                continue;
            }

            if count == 1 {
                return Err(MunboxError::TruncatedInput(
                    "RLE90 repeat count of 1 is not a valid encoding".into(),
                ));
            }

            // One copy already accounted for implicitly: `count` total
            // repeats of `last_byte`, one of which we emit now.
            self.pending_repeats = count as usize - 1;
            out[produced] = self.last_byte.unwrap_or(0);
            produced += 1;
        }
        Ok(produced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_all(escape: u8, input: &[u8]) -> Vec<u8> {
        let mut pos = 0;
        let mut decoder = Rle90Decoder::new(escape);
        let mut out = Vec::new();
        loop {
            let mut buf = [0u8; 16];
            let n = decoder
                .fill(
                    || {
                        if pos < input.len() {
                            let b = input[pos];
                            pos += 1;
                            Ok(Some(b))
                        } else {
                            Ok(None)
                        }
                    },
                    &mut buf,
                )
                .unwrap();
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buf[..n]);
        }
        out
    }

    #[test]
    fn literal_run_passthrough() {
        assert_eq!(decode_all(0x90, b"abc"), b"abc");
    }

    #[test]
    fn run_expands_repeat_count() {
        // 'A' 0x90 0x05 -> 'A' repeated 5 times total
        let input = [b'A', 0x90, 0x05];
        assert_eq!(decode_all(0x90, &input), vec![b'A'; 5]);
    }

    #[test]
    fn escape_zero_count_is_literal_escape_byte() {
        let input = [b'A', 0x90, 0x00, b'B'];
        assert_eq!(decode_all(0x90, &input), vec![b'A', 0x90, b'B']);
    }

    #[test]
    fn escape_count_one_is_truncated_input_error() {
        let input = [b'A', 0x90, 0x01];
        let mut pos = 0;
        let mut decoder = Rle90Decoder::new(0x90);
        let mut buf = [0u8; 16];
        let err = decoder
            .fill(
                || {
                    if pos < input.len() {
                        let b = input[pos];
                        pos += 1;
                        Ok(Some(b))
                    } else {
                        Ok(None)
                    }
                },
                &mut buf,
            )
            .unwrap_err();
        assert!(matches!(err, MunboxError::TruncatedInput(_)));
    }
}
