//! SIT method 13: LZSS with a 64 KiB sliding window, two literal/length
//! Huffman trees and one offset tree. Grounded on `sit13.c`
//! (`sit13_setup`/`sit13_produce`/`tree_to_value`/`tree_from_code_lengths`/
//! `extract_tree_with_metacode`), which this module generalizes from a
//! one-shot C decoder into a `Read`-like streaming Rust type. The five
//! built-in static code-length tables and the dynamic-tree metacode tables
//! live in [`crate::methods::sit13_tables`] since they are format constants.

use crate::error::{MunboxError, Result};
use crate::methods::sit13_tables as tables;

const WINDOW_SIZE: usize = 1 << 16;
const WINDOW_MASK: usize = WINDOW_SIZE - 1;

/// MSB-first bit reader over an in-memory buffer (archive layers buffer
/// their whole input already, so method 13's compressed fork is always a
/// plain slice — no need for the C reference's streaming supplier here).
struct BitReader<'a> {
    buf: &'a [u8],
    bit_pos: usize,
}

impl<'a> BitReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        BitReader { buf, bit_pos: 0 }
    }

    /// Read `n` bits (n <= 24), MSB of the window first.
    fn next_bits(&mut self, n: u32) -> Result<u32> {
        if n == 0 {
            return Ok(0);
        }
        let mut acc: u32 = 0;
        for _ in 0..n {
            let byte_idx = self.bit_pos / 8;
            let bit_idx = 7 - (self.bit_pos % 8);
            let bit = if byte_idx < self.buf.len() {
                (self.buf[byte_idx] >> bit_idx) & 1
            } else {
                return Err(MunboxError::TruncatedInput(
                    "method 13 bit reader ran past end of compressed data".into(),
                ));
            };
            acc = (acc << 1) | bit as u32;
            self.bit_pos += 1;
        }
        Ok(acc)
    }
}

const INVALID_VALUE: i32 = -1;

/// A binary prefix-free tree; only leaves carry a value.
#[derive(Clone)]
struct Tree {
    // child[node][0/1]; INVALID_VALUE (-1) marks "no child"
    child: Vec<[i32; 2]>,
    value: Vec<i32>,
}

impl Tree {
    fn new() -> Self {
        Tree {
            child: vec![[INVALID_VALUE; 2]],
            value: vec![INVALID_VALUE],
        }
    }

    fn new_node(&mut self) -> usize {
        self.child.push([INVALID_VALUE; 2]);
        self.value.push(INVALID_VALUE);
        self.child.len() - 1
    }

    fn add_code(&mut self, code: u32, code_length: u32, value: i32) {
        let mut node = 0usize;
        for bp in (0..code_length).rev() {
            let bit = ((code >> bp) & 1) as usize;
            if self.child[node][bit] == INVALID_VALUE {
                let n = self.new_node();
                self.child[node][bit] = n as i32;
            }
            node = self.child[node][bit] as usize;
        }
        self.value[node] = value;
    }

    fn decode(&self, reader: &mut BitReader) -> Result<i32> {
        let mut node = 0usize;
        while self.value[node] == INVALID_VALUE {
            let bit = reader.next_bits(1)? as usize;
            let next = self.child[node][bit];
            if next == INVALID_VALUE {
                return Err(MunboxError::TruncatedInput(
                    "method 13 prefix code did not resolve to a leaf".into(),
                ));
            }
            node = next as usize;
        }
        Ok(self.value[node])
    }
}

/// Canonical assignment: codes of the same length are assigned sequentially
/// in symbol order, exactly as `tree_from_code_lengths` in `sit13.c` does.
fn tree_from_code_lengths(lengths: &[i8]) -> Tree {
    let mut tree = Tree::new();
    let n_codes = lengths.len();
    let mut completed = 0usize;
    let mut symbol: u32 = 0;
    let mut length: i32 = -1;
    while completed < n_codes {
        length += 1;
        for (i, &l) in lengths.iter().enumerate() {
            if l as i32 == length {
                if length > 0 {
                    tree.add_code(symbol, length as u32, i as i32);
                }
                symbol += 1;
                completed += 1;
            }
        }
        symbol <<= 1;
    }
    tree
}

fn build_metacode_tree() -> Tree {
    let mut tree = Tree::new();
    for i in 0..tables::METACODE_SIZE {
        tree.add_code(
            tables::META_CODE_WORDS[i] as u32,
            tables::META_CODE_LENGTHS[i] as u32,
            i as i32,
        );
    }
    tree
}

/// Extract a tree by reading code-length metadata from the input using the
/// metacode. Mirrors `extract_tree_with_metacode` in `sit13.c` verbatim.
fn extract_tree_with_metacode(
    metacode: &Tree,
    input: &mut BitReader,
    n_codes: usize,
) -> Result<Tree> {
    let mut lengths = vec![0i8; n_codes];
    let mut length: i32 = 0;
    let mut i = 0usize;
    while i < n_codes {
        let next_code = metacode.decode(input)?;
        if next_code < 31 {
            length = next_code + 1;
        } else {
            match next_code {
                31 => length = 0,
                32 => length += 1,
                33 => length -= 1,
                34 => {
                    if input.next_bits(1)? != 0 {
                        lengths[i] = length as i8;
                        i += 1;
                    }
                    continue;
                }
                35 => {
                    let mut repeat = input.next_bits(3)? as i32 + 2;
                    while repeat > 0 && i < n_codes {
                        lengths[i] = length as i8;
                        i += 1;
                        repeat -= 1;
                    }
                    continue;
                }
                36 => {
                    let mut repeat = input.next_bits(6)? as i32 + 10;
                    while repeat > 0 && i < n_codes {
                        lengths[i] = length as i8;
                        i += 1;
                        repeat -= 1;
                    }
                    continue;
                }
                _ => {
                    return Err(MunboxError::TruncatedInput(
                        "invalid method 13 metacode command".into(),
                    ))
                }
            }
        }
        lengths[i] = length as i8;
        i += 1;
    }
    Ok(tree_from_code_lengths(&lengths))
}

pub struct Method13Decoder<'a> {
    input: BitReader<'a>,
    window: Vec<u8>,
    out_pos: usize,
    first_tree: Tree,
    second_tree: Tree,
    offset_tree: Tree,
    use_first: bool,
    pending_match_len: usize,
    pending_match_src: usize,
}

impl<'a> Method13Decoder<'a> {
    pub fn new(data: &'a [u8]) -> Result<Self> {
        let mut input = BitReader::new(data);
        let byte0 = input.next_bits(8)?;
        let code_set = byte0 >> 4;

        let (first_tree, second_tree, offset_tree) = if code_set == 0 {
            let metacode = build_metacode_tree();
            let first_tree = extract_tree_with_metacode(&metacode, &mut input, tables::MAX_CODE)?;
            // Bit 3 of byte0 means "second tree is identical to the first"
            // (sit13_setup aliases the same tree pointer in that case); we
            // clone rather than alias since Rust ownership makes a shared
            // pointer awkward here and the tree is read-only once built.
            let second_tree = if byte0 & 0x08 != 0 {
                first_tree.clone()
            } else {
                extract_tree_with_metacode(&metacode, &mut input, tables::MAX_CODE)?
            };
            let offset_count = (byte0 & 0x07) + 10;
            let offset_tree = extract_tree_with_metacode(&metacode, &mut input, offset_count as usize)?;
            (first_tree, second_tree, offset_tree)
        } else if code_set < 6 {
            let idx = (code_set - 1) as usize;
            let first_tree = tree_from_code_lengths(&tables::FIRST_TREE_LENGTHS[idx]);
            let second_tree = tree_from_code_lengths(&tables::SECOND_TREE_LENGTHS[idx]);
            let off_len = tables::OFFSET_TREE_LEN[idx];
            let offset_tree = tree_from_code_lengths(&tables::OFFSET_TREE_LENGTHS[idx][..off_len]);
            (first_tree, second_tree, offset_tree)
        } else {
            return Err(MunboxError::UnsupportedFeature(
                "method 13 code set out of range".into(),
            ));
        };

        Ok(Method13Decoder {
            input,
            window: vec![0u8; WINDOW_SIZE],
            out_pos: 0,
            first_tree,
            second_tree,
            offset_tree,
            use_first: true,
            pending_match_len: 0,
            pending_match_src: 0,
        })
    }

    /// Produce up to `out.len()` decompressed bytes. Mirrors `sit13_produce`.
    pub fn fill(&mut self, out: &mut [u8]) -> Result<usize> {
        let mut produced = 0;
        while produced < out.len() {
            if self.pending_match_len > 0 {
                let b = self.window[self.pending_match_src & WINDOW_MASK];
                self.pending_match_src += 1;
                out[produced] = b;
                produced += 1;
                self.window[self.out_pos & WINDOW_MASK] = b;
                self.out_pos += 1;
                self.pending_match_len -= 1;
                if self.pending_match_len == 0 {
                    self.use_first = false; // switch to second tree after a match
                }
                continue;
            }

            let tree = if self.use_first {
                &self.first_tree
            } else {
                &self.second_tree
            };
            let next_value = tree.decode(&mut self.input)?;

            if next_value < 256 {
                let b = next_value as u8;
                out[produced] = b;
                produced += 1;
                self.window[self.out_pos & WINDOW_MASK] = b;
                self.out_pos += 1;
                self.use_first = true;
                continue;
            }

            let length: i32 = if next_value < 318 {
                next_value - 253
            } else if next_value == 318 {
                self.input.next_bits(10)? as i32 + 65
            } else if next_value == 319 {
                self.input.next_bits(15)? as i32 + 65
            } else {
                return Err(MunboxError::TruncatedInput(
                    "method 13: invalid length symbol".into(),
                ));
            };

            let ov = self.offset_tree.decode(&mut self.input)?;
            let offset: i64 = if ov == 0 {
                1
            } else {
                (1i64 << (ov - 1)) + self.input.next_bits((ov - 1) as u32)? as i64 + 1
            };
            let src_index = self.out_pos as i64 - offset;
            if src_index < 0 {
                return Err(MunboxError::TruncatedInput(
                    "method 13 match references before start of window".into(),
                ));
            }
            self.pending_match_len = length as usize;
            self.pending_match_src = src_index as usize;
        }
        Ok(produced)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_code_set_one_decodes_single_literal_run() {
        // code_set = 1 (byte0 high nibble) selects the first built-in static
        // table. With that table, symbol 'A' (0x41) has a canonical code we
        // don't hand-construct here; instead this test exercises the lower
        // layer (tree_from_code_lengths / BitReader) directly, since hand
        // deriving a bitstream for the 321-symbol static table by hand is
        // not something to get right without running the encoder.
        let lengths = [2i8, 2, 2, 2]; // 4 equal-length symbols: canonical codes 00,01,10,11
        let tree = tree_from_code_lengths(&lengths);
        let data = [0b00_01_10_11u8];
        let mut r = BitReader::new(&data);
        assert_eq!(tree.decode(&mut r).unwrap(), 0);
        assert_eq!(tree.decode(&mut r).unwrap(), 1);
        assert_eq!(tree.decode(&mut r).unwrap(), 2);
        assert_eq!(tree.decode(&mut r).unwrap(), 3);
    }

    #[test]
    fn bit_reader_reads_msb_first() {
        let data = [0b1010_0000u8];
        let mut r = BitReader::new(&data);
        assert_eq!(r.next_bits(1).unwrap(), 1);
        assert_eq!(r.next_bits(1).unwrap(), 0);
        assert_eq!(r.next_bits(1).unwrap(), 1);
        assert_eq!(r.next_bits(1).unwrap(), 0);
    }
}
