//! SIT method 15 "Arsenic": arithmetic coding -> zero-run -> MTF -> inverse
//! BWT -> randomization -> final RLE.
//!
//! Unlike every other method in this module, there is no reference
//! implementation anywhere in the retrieval corpus to ground this against;
//! `sit15.c` is an unimplemented stub (license header and includes only).
//! This decoder is therefore built directly from the stage-by-stage
//! description in the specification rather than transliterated from a
//! known-good decoder. Two points are explicit, documented departures
//! rather than transcription choices:
//!
//! - The adaptive arithmetic coder here is a standard LZMA-style 12-bit
//!   probability binary range coder (bit-at-a-time renormalization, per
//!   the spec's "32-bit accumulator, MSB-first bit extraction" note), with
//!   a binary bit-tree used to decode the 11-way selector and per-group
//!   extra bits, and equal-probability "direct bits" used for the raw
//!   per-block fields (`randomized`, `bwt_primary_index`, the block-footer
//!   flags and CRC) so that they can be interleaved with modeled symbols
//!   on one continuous coded bitstream. The spec does not pin down the
//!   exact adaptation rate or tree shape; this follows the common shape
//!   used across this family of coders (the selector's zero-run encoding
//!   is explicitly modeled on bzip2's MTF-value RUNA/RUNB scheme).
//! - The randomization stage's 256-entry offset table is never given a
//!   concrete value anywhere in the corpus or the specification (which
//!   refers to "fixed constants below" that are absent from it). The
//!   table below is a placeholder deterministic sequence, *not* the real
//!   Arsenic constants; streams produced by a genuine Arsenic encoder with
//!   `randomized` set will not round-trip correctly through this stage.
//!   Noted in DESIGN.md.

use crate::error::{MunboxError, Result};

const TOP: u32 = 1 << 24;
const PROB_BITS: u32 = 12;
const PROB_MAX: u16 = 1 << PROB_BITS;
const PROB_INIT: u16 = PROB_MAX / 2;
const MOVE_BITS: u32 = 5;

struct BitSource<'a> {
    buf: &'a [u8],
    byte_pos: usize,
    bit_mask: u8,
}

impl<'a> BitSource<'a> {
    fn new(buf: &'a [u8]) -> Self {
        BitSource {
            buf,
            byte_pos: 0,
            bit_mask: 0x80,
        }
    }

    fn next_bit(&mut self) -> u32 {
        let bit = if self.byte_pos < self.buf.len() {
            (self.buf[self.byte_pos] & self.bit_mask != 0) as u32
        } else {
            0
        };
        self.bit_mask >>= 1;
        if self.bit_mask == 0 {
            self.bit_mask = 0x80;
            self.byte_pos += 1;
        }
        bit
    }

    fn next_bits(&mut self, n: u32) -> u32 {
        let mut acc = 0u32;
        for _ in 0..n {
            acc = (acc << 1) | self.next_bit();
        }
        acc
    }
}

/// Adaptive binary range decoder: 26-bit range, renormalizing one bit at a
/// time while `range <= 2^24`.
struct RangeDecoder<'a> {
    bits: BitSource<'a>,
    range: u32,
    code: u32,
}

impl<'a> RangeDecoder<'a> {
    fn new(buf: &'a [u8]) -> Self {
        let mut bits = BitSource::new(buf);
        let mut code = 0u32;
        for _ in 0..32 {
            code = (code << 1) | bits.next_bit();
        }
        RangeDecoder {
            bits,
            range: 0xFFFF_FFFF,
            code,
        }
    }

    fn normalize(&mut self) {
        while self.range <= TOP {
            self.range <<= 1;
            self.code = (self.code << 1) | self.bits.next_bit();
        }
    }

    fn decode_bit(&mut self, prob: &mut u16) -> u32 {
        let bound = (self.range >> PROB_BITS) * (*prob as u32);
        let bit = if self.code < bound {
            self.range = bound;
            *prob += (PROB_MAX - *prob) >> MOVE_BITS;
            0
        } else {
            self.range -= bound;
            self.code -= bound;
            *prob -= *prob >> MOVE_BITS;
            1
        };
        self.normalize();
        bit
    }

    /// Decode `n` equal-probability bits without touching any adaptive
    /// model, for raw fields interleaved on the coded bitstream.
    fn decode_direct_bits(&mut self, n: u32) -> u32 {
        let mut acc = 0u32;
        for _ in 0..n {
            self.range >>= 1;
            let bit = if self.code >= self.range {
                self.code -= self.range;
                1
            } else {
                0
            };
            self.normalize();
            acc = (acc << 1) | bit;
        }
        acc
    }
}

/// A binary bit-tree context, used to decode small fixed-width symbols
/// (the selector, and per-group extra bits) through the adaptive coder.
struct BitTree {
    probs: Vec<u16>,
    bits: u32,
}

impl BitTree {
    fn new(bits: u32) -> Self {
        BitTree {
            probs: vec![PROB_INIT; 1 << bits],
            bits,
        }
    }

    fn decode(&mut self, rc: &mut RangeDecoder) -> u32 {
        let mut m = 1u32;
        for _ in 0..self.bits {
            let bit = rc.decode_bit(&mut self.probs[m as usize]);
            m = (m << 1) | bit;
        }
        m - (1 << self.bits)
    }
}

const SELECTOR_COUNT: u32 = 11;
const END_OF_BLOCK: u32 = 10;

/// Group base values and bit widths for selectors 3..9 (7 groups):
/// {2,3}, {4..7}, {8..15}, {16..31}, {32..63}, {64..127}, {128..255}.
const GROUP_BASE: [u32; 7] = [2, 4, 8, 16, 32, 64, 128];
const GROUP_BITS: [u32; 7] = [1, 2, 3, 4, 5, 6, 7];

/// Placeholder randomization offset deltas; see module docs.
const RAND_TABLE: [u8; 256] = {
    let mut t = [0u8; 256];
    let mut i = 0;
    let mut x: u32 = 1;
    while i < 256 {
        x = x.wrapping_mul(1103515245).wrapping_add(12345);
        t[i] = ((x >> 16) % 256) as u8;
        i += 1;
    }
    t
};

/// Per-block selector/group models, fresh for every block (matching the
/// MTF list's own per-block reset).
struct SelectorDecoder {
    selector_tree: BitTree,
    group_trees: Vec<BitTree>,
}

impl SelectorDecoder {
    fn new() -> Self {
        SelectorDecoder {
            selector_tree: BitTree::new(4), // ceil(log2(11)) = 4 -> 16 leaves, uses 0..10
            group_trees: GROUP_BITS.iter().map(|&b| BitTree::new(b)).collect(),
        }
    }

    fn decode_selector(&mut self, rc: &mut RangeDecoder) -> u32 {
        loop {
            let s = self.selector_tree.decode(rc);
            if s < SELECTOR_COUNT {
                return s;
            }
            // The tree's unused leaves (11..15) are never emitted by a
            // well-formed stream; looping keeps the model well-defined
            // instead of introducing a separate error path for them.
        }
    }
}

/// Decode one block's symbol stream (zero-run / MTF-index / end-of-block)
/// into raw bytes via the 256-entry move-to-front list.
fn decode_block_symbols(
    rc: &mut RangeDecoder,
    selectors: &mut SelectorDecoder,
    block_len: usize,
) -> Result<Vec<u8>> {
    let mut mtf: Vec<u8> = (0..=255u8).collect();
    let mut out = Vec::with_capacity(block_len);

    loop {
        let mut run_length: u64 = 0;
        let mut i: u32 = 0;
        let mut sel = selectors.decode_selector(rc);
        while sel == 0 || sel == 1 {
            run_length += (if sel == 0 { 1 } else { 2 }) << i;
            i += 1;
            if out.len() as u64 + run_length > block_len as u64 + 1 {
                return Err(MunboxError::TruncatedInput(
                    "arsenic zero-run exceeded block length".into(),
                ));
            }
            sel = selectors.decode_selector(rc);
        }
        for _ in 0..run_length {
            out.push(mtf[0]);
        }

        if sel == END_OF_BLOCK {
            break;
        }

        let mtf_index = if sel == 2 {
            1u32
        } else {
            let group = (sel - 3) as usize;
            let extra = selectors.group_trees[group].decode(rc);
            GROUP_BASE[group] + extra
        };

        if mtf_index as usize >= mtf.len() {
            return Err(MunboxError::TruncatedInput(
                "arsenic MTF index out of range".into(),
            ));
        }
        let byte = mtf.remove(mtf_index as usize);
        mtf.insert(0, byte);
        out.push(byte);

        if out.len() > block_len {
            return Err(MunboxError::TruncatedInput(
                "arsenic block produced more bytes than its declared length".into(),
            ));
        }
    }

    Ok(out)
}

/// Stable counting-sort inverse Burrows-Wheeler transform.
fn inverse_bwt(data: &[u8], primary_index: usize) -> Result<Vec<u8>> {
    let n = data.len();
    if n == 0 {
        return Ok(Vec::new());
    }
    if primary_index >= n {
        return Err(MunboxError::TruncatedInput(
            "arsenic bwt_primary_index out of range".into(),
        ));
    }
    let mut counts = [0usize; 256];
    for &b in data {
        counts[b as usize] += 1;
    }
    let mut base = [0usize; 256];
    let mut total = 0usize;
    for (i, &c) in counts.iter().enumerate() {
        base[i] = total;
        total += c;
    }

    let mut transform = vec![0usize; n];
    let mut next = base;
    for (i, &b) in data.iter().enumerate() {
        transform[next[b as usize]] = i;
        next[b as usize] += 1;
    }

    let mut out = Vec::with_capacity(n);
    let mut cur = transform[primary_index];
    for _ in 0..n {
        out.push(data[cur]);
        cur = transform[cur];
    }
    Ok(out)
}

fn derandomize(data: &mut [u8]) {
    let mut cumulative: usize = 0;
    let mut table_idx = 0usize;
    loop {
        cumulative += RAND_TABLE[table_idx % RAND_TABLE.len()] as usize + 1;
        table_idx += 1;
        if cumulative > data.len() {
            break;
        }
        data[cumulative - 1] ^= 1;
    }
}

/// Final RLE stage: four identical bytes followed by one extra byte giving
/// the additional repeat count (0 terminates the run at exactly 4 copies).
fn final_rle_decode(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len());
    let mut i = 0;
    while i < data.len() {
        let b = data[i];
        let mut run = 1;
        while i + run < data.len() && run < 4 && data[i + run] == b {
            run += 1;
        }
        for _ in 0..run {
            out.push(b);
        }
        i += run;
        if run == 4 && i < data.len() {
            let extra = data[i];
            i += 1;
            for _ in 0..extra {
                out.push(b);
            }
        }
    }
    out
}

pub struct ArsenicDecoder {
    output: std::collections::VecDeque<u8>,
}

impl ArsenicDecoder {
    /// Decode the entire Arsenic stream up front. Archive layers already
    /// buffer the whole compressed fork in memory, and the
    /// block/BWT/RLE pipeline has no natural streaming decomposition, so
    /// this type exposes the same pull-style `fill` interface as the other
    /// methods while doing its work eagerly on construction.
    pub fn new(data: &[u8]) -> Result<Self> {
        let mut header_bits = BitSource::new(data);
        let magic0 = header_bits.next_bits(8);
        let magic1 = header_bits.next_bits(8);
        if magic0 != b'A' as u32 || magic1 != b's' as u32 {
            return Err(MunboxError::TruncatedInput(
                "arsenic stream missing 'As' marker".into(),
            ));
        }
        let block_bits = header_bits.next_bits(4);
        if block_bits > 16 {
            return Err(MunboxError::OutOfMemory(
                "arsenic block_bits exceeds sanity ceiling".into(),
            ));
        }
        let block_len = 1usize << (block_bits + 9);
        let _end_of_stream = header_bits.next_bits(1);

        let mut rc = RangeDecoder::new(&data[header_bits.byte_pos..]);
        let mut output = std::collections::VecDeque::new();

        loop {
            let randomized = rc.decode_direct_bits(1) != 0;
            let primary_index = rc.decode_direct_bits(block_bits + 9) as usize;

            let mut selectors = SelectorDecoder::new();
            let symbols = decode_block_symbols(&mut rc, &mut selectors, block_len)?;
            let bwt_output = inverse_bwt(&symbols, primary_index)?;
            let mut derandomized = bwt_output;
            if randomized {
                derandomize(&mut derandomized);
            }
            let block_out = final_rle_decode(&derandomized);
            output.extend(block_out);

            let last_block = rc.decode_direct_bits(1) != 0;
            if last_block {
                let _crc32 = rc.decode_direct_bits(32);
                break;
            }
        }

        Ok(ArsenicDecoder { output })
    }

    pub fn fill(&mut self, out: &mut [u8]) -> Result<usize> {
        let mut n = 0;
        while n < out.len() {
            match self.output.pop_front() {
                Some(b) => {
                    out[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inverse_bwt_of_single_byte() {
        let out = inverse_bwt(&[b'x'], 0).unwrap();
        assert_eq!(out, vec![b'x']);
    }

    #[test]
    fn final_rle_expands_run_of_four_plus_extra() {
        // 'a','a','a','a', extra=2 -> six 'a's total
        let data = [b'a', b'a', b'a', b'a', 2];
        assert_eq!(final_rle_decode(&data), vec![b'a'; 6]);
    }

    #[test]
    fn final_rle_run_of_four_with_zero_extra_stays_four() {
        let data = [b'a', b'a', b'a', b'a', 0];
        assert_eq!(final_rle_decode(&data), vec![b'a'; 4]);
    }

    #[test]
    fn final_rle_passes_short_runs_through() {
        let data = [b'a', b'b', b'b', b'c'];
        assert_eq!(final_rle_decode(&data), data.to_vec());
    }

    #[test]
    fn rejects_missing_magic() {
        let data = [b'X', b's', 0, 0, 0, 0];
        assert!(ArsenicDecoder::new(&data).is_err());
    }

    // Known-failing: this module's range-coder probability shape and its
    // randomization table are placeholders (see DESIGN.md), not the real
    // Arsenic constants. A method-15 fork from a real StuffIt encoder does
    // not decode bit-exact through this stage. Re-enable once the real
    // constants are sourced.
    #[test]
    #[ignore = "Arsenic randomization table and range-coder shape are placeholders, see DESIGN.md"]
    fn decodes_real_method_15_fork_bit_exact() {
        unimplemented!("needs a real Arsenic-encoded fixture and the real randomization constants");
    }
}
