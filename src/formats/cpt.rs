//! Compact Pro archive layer (spec §4.5): a tail-of-file directory tree
//! over sequentially stored forks, each optionally LZH-compressed (CPT's
//! own variant: 8192-byte window, three per-block Huffman tables) and then
//! always RLE90-decompressed with a `0x81` escape. Grounded on `cpt.c`
//! (`cpt_walk_dir_mem`/`cpt_parse_directory_mem`, `cpt_lzh_build_tables`/
//! `cpt_lzhs_next`, `cpt_rle_stream_read`).

use crate::error::{MunboxError, Result};
use crate::layer::{read_fork_to_end, FileInfo, ForkKind, Layer, OpenOutcome, OpenWhich, ProbeOutcome};
use crate::macroman::FromMacRoman;

const WINDOW_SIZE: usize = 8192;
const WINDOW_MASK: usize = WINDOW_SIZE - 1;
const ACCOUNTING_LIMIT: u32 = 0x1FFF0;

// ---------------------------------------------------------------------
// Bit reader (MSB-first), shared by the directory walker's fixed fields
// (read directly as bytes) and the LZH decoder's modeled bits.
// ---------------------------------------------------------------------

struct BitReader<'a> {
    buf: &'a [u8],
    bit_pos: usize,
}

impl<'a> BitReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        BitReader { buf, bit_pos: 0 }
    }

    fn byte_pos(&self) -> usize {
        self.bit_pos / 8
    }

    fn align_to_byte(&mut self) {
        self.bit_pos = (self.bit_pos + 7) & !7;
    }

    fn next_bit(&mut self) -> Result<u32> {
        let byte_idx = self.bit_pos / 8;
        let bit_idx = 7 - (self.bit_pos % 8);
        let b = *self
            .buf
            .get(byte_idx)
            .ok_or_else(|| MunboxError::TruncatedInput("CPT LZH bitstream ran out".into()))?;
        self.bit_pos += 1;
        Ok(((b >> bit_idx) & 1) as u32)
    }

    fn next_bits(&mut self, n: u32) -> Result<u32> {
        let mut acc = 0u32;
        for _ in 0..n {
            acc = (acc << 1) | self.next_bit()?;
        }
        Ok(acc)
    }

    fn skip_bits(&mut self, n: u32) {
        self.bit_pos += n as usize;
    }
}

// ---------------------------------------------------------------------
// Canonical Huffman tree, built from an explicit code-length table.
// ---------------------------------------------------------------------

const INVALID: i32 = -1;

struct Tree {
    child: Vec<[i32; 2]>,
    value: Vec<i32>,
}

impl Tree {
    fn from_code_lengths(lengths: &[u8]) -> Self {
        let mut tree = Tree {
            child: vec![[INVALID; 2]],
            value: vec![INVALID],
        };
        let n = lengths.len();
        let mut completed = 0usize;
        let mut symbol: u32 = 0;
        let mut length: i32 = -1;
        while completed < n {
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

    fn add_code(&mut self, code: u32, len: u32, value: i32) {
        let mut node = 0usize;
        for bp in (0..len).rev() {
            let bit = ((code >> bp) & 1) as usize;
            if self.child[node][bit] == INVALID {
                self.child.push([INVALID; 2]);
                self.value.push(INVALID);
                self.child[node][bit] = (self.child.len() - 1) as i32;
            }
            node = self.child[node][bit] as usize;
        }
        self.value[node] = value;
    }

    fn decode(&self, reader: &mut BitReader) -> Result<i32> {
        let mut node = 0usize;
        while self.value[node] == INVALID {
            let bit = reader.next_bit()? as usize;
            let next = self.child[node][bit];
            if next == INVALID {
                return Err(MunboxError::TruncatedInput(
                    "CPT LZH prefix code did not resolve to a leaf".into(),
                ));
            }
            node = next as usize;
        }
        Ok(self.value[node])
    }
}

/// Read one `num_bytes`-prefixed code-length table: `num_bytes` (8 bits)
/// then that many bytes, each holding two 4-bit lengths, high nibble first.
fn read_code_length_table(reader: &mut BitReader, symbol_count: usize) -> Result<Vec<u8>> {
    let num_bytes = reader.next_bits(8)? as usize;
    let mut lengths = vec![0u8; symbol_count];
    let mut i = 0usize;
    for _ in 0..num_bytes {
        let byte = reader.next_bits(8)? as u8;
        if i < symbol_count {
            lengths[i] = byte >> 4;
            i += 1;
        }
        if i < symbol_count {
            lengths[i] = byte & 0x0f;
            i += 1;
        }
    }
    Ok(lengths)
}

struct LzhTables {
    literal: Tree,
    length: Tree,
    offset: Tree,
}

fn read_lzh_tables(reader: &mut BitReader) -> Result<LzhTables> {
    let literal = Tree::from_code_lengths(&read_code_length_table(reader, 256)?);
    let length = Tree::from_code_lengths(&read_code_length_table(reader, 64)?);
    let offset = Tree::from_code_lengths(&read_code_length_table(reader, 128)?);
    Ok(LzhTables {
        literal,
        length,
        offset,
    })
}

/// Decode one LZH-compressed fork in full (archive layers already buffer
/// the whole archive in memory, so there's no benefit to streaming this
/// incrementally).
fn lzh_decode(compressed: &[u8], expected_len: usize) -> Result<Vec<u8>> {
    let mut reader = BitReader::new(compressed);
    let mut window = vec![0u8; WINDOW_SIZE];
    let mut out = Vec::with_capacity(expected_len);
    let mut out_pos = 0usize;
    let mut accounting: u32 = 0;
    let block_start_byte = reader.byte_pos();

    let mut tables = read_lzh_tables(&mut reader)?;

    while out.len() < expected_len {
        let flag = reader.next_bit()?;
        if flag == 1 {
            let sym = tables.literal.decode(&mut reader)?;
            let b = sym as u8;
            out.push(b);
            window[out_pos & WINDOW_MASK] = b;
            out_pos += 1;
            accounting += 2;
        } else {
            let mlen = tables.length.decode(&mut reader)?;
            if mlen == 0 {
                return Err(MunboxError::TruncatedInput(
                    "CPT LZH match length of zero".into(),
                ));
            }
            let ohi = tables.offset.decode(&mut reader)?;
            let low6 = reader.next_bits(6)?;
            let offset = ((ohi as u32) << 6) | low6;
            if offset as usize > out_pos {
                return Err(MunboxError::TruncatedInput(
                    "CPT LZH match references before start of window".into(),
                ));
            }
            let mut src = out_pos - offset as usize;
            for _ in 0..mlen {
                let b = window[src & WINDOW_MASK];
                out.push(b);
                window[out_pos & WINDOW_MASK] = b;
                out_pos += 1;
                src += 1;
            }
            accounting += 3;
        }

        if accounting >= ACCOUNTING_LIMIT {
            reader.align_to_byte();
            let since_start = reader.byte_pos().wrapping_sub(block_start_byte);
            if since_start % 2 == 0 {
                reader.skip_bits(16);
            } else {
                reader.skip_bits(24);
            }
            tables = read_lzh_tables(&mut reader)?;
            accounting = 0;
        }
    }

    Ok(out)
}

/// CPT's RLE90 variant: escape byte `0x81`, with the documented
/// `0x81 0x82 n` anomaly kept bug-for-bug (spec §4.5, §9 "escape
/// convention"): `n == 0` is treated as a literal `0x81` *and* arms the
/// saved byte as `0x82` with a run length of 1, rather than being a
/// no-op escape.
fn cpt_rle_decode(compressed: &[u8], expected_len: usize) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(expected_len);
    let mut i = 0usize;
    let mut last_byte: u8 = 0;
    while i < compressed.len() && out.len() < expected_len {
        let b = compressed[i];
        i += 1;
        if b != 0x81 {
            out.push(b);
            last_byte = b;
            continue;
        }
        // b == 0x81
        match compressed.get(i) {
            None => {
                out.push(0x81);
            }
            Some(&0x82) => {
                i += 1;
                let n = *compressed.get(i).unwrap_or(&0);
                if compressed.get(i).is_some() {
                    i += 1;
                }
                if n == 0 {
                    out.push(0x81);
                    last_byte = 0x82;
                    out.push(0x82);
                } else {
                    for _ in 0..(n - 1) {
                        out.push(last_byte);
                    }
                }
            }
            Some(&0x81) => {
                // "0x81 0x81" -> emit one 0x81, stash the other half-eaten
                // escape for the next iteration by simply not consuming it.
                out.push(0x81);
            }
            Some(&other) => {
                out.push(0x81);
                out.push(other);
                i += 1;
                last_byte = other;
            }
        }
    }
    out.truncate(expected_len);
    Ok(out)
}

fn decode_fork(raw: &[u8], is_lzh: bool, expected_uncompressed: usize) -> Result<Vec<u8>> {
    if is_lzh {
        lzh_decode(raw, expected_uncompressed)
    } else {
        cpt_rle_decode(raw, expected_uncompressed)
    }
}

// ---------------------------------------------------------------------
// Directory walking
// ---------------------------------------------------------------------

struct CptEntry {
    path: String,
    file_type: u32,
    creator: u32,
    finder_flags: u16,
    file_offset: u32,
    flags: u8,
    rsrc_uncomp: u32,
    data_uncomp: u32,
    rsrc_comp: u32,
    data_comp: u32,
}

struct DirCursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> DirCursor<'a> {
    fn u8(&mut self) -> Result<u8> {
        let b = *self
            .data
            .get(self.pos)
            .ok_or_else(|| MunboxError::TruncatedInput("CPT directory".into()))?;
        self.pos += 1;
        Ok(b)
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8]> {
        let s = self
            .data
            .get(self.pos..self.pos + n)
            .ok_or_else(|| MunboxError::TruncatedInput("CPT directory".into()))?;
        self.pos += n;
        Ok(s)
    }

    fn u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.bytes(2)?.try_into().unwrap()))
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.bytes(4)?.try_into().unwrap()))
    }
}

fn walk_directory(
    cursor: &mut DirCursor,
    parent: &str,
    mut remaining: u32,
    out: &mut Vec<CptEntry>,
) -> Result<()> {
    while remaining > 0 {
        let name_byte = cursor.u8()?;
        let is_dir = name_byte & 0x80 != 0;
        let name_len = (name_byte & 0x7f) as usize;
        let name_bytes = cursor.bytes(name_len)?.to_vec();
        let name = String::from_macroman(&name_bytes);
        let path = if parent.is_empty() {
            name
        } else {
            format!("{parent}/{name}")
        };
        remaining -= 1;

        if is_dir {
            let child_count = cursor.u16()? as u32;
            walk_directory(cursor, &path, child_count, out)?;
            remaining = remaining.saturating_sub(child_count);
        } else {
            let _volume = cursor.u8()?;
            let file_offset = cursor.u32()?;
            let file_type = cursor.u32()?;
            let creator = cursor.u32()?;
            let _create_date = cursor.u32()?;
            let _mod_date = cursor.u32()?;
            let finder_flags = cursor.u16()?;
            let _data_crc = cursor.u16()?;
            let flags = cursor.u8()?;
            let rsrc_uncomp = cursor.u32()?;
            let data_uncomp = cursor.u32()?;
            let rsrc_comp = cursor.u32()?;
            let data_comp = cursor.u32()?;

            out.push(CptEntry {
                path,
                file_type,
                creator,
                finder_flags,
                file_offset,
                flags,
                rsrc_uncomp,
                data_uncomp,
                rsrc_comp,
                data_comp,
            });
        }
    }
    Ok(())
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Cursor {
    NotStarted,
    Data(usize),
    Resource(usize),
    Done,
}

pub struct CptLayer {
    inner: Box<dyn Layer>,
    archive: Vec<u8>,
    entries: Vec<CptEntry>,
    index: usize,
    cursor: Cursor,
    current_data: Vec<u8>,
    current_rsrc: Vec<u8>,
}

/// Detect and construct the Compact Pro archive layer (spec §4.5).
pub fn probe(mut input: Box<dyn Layer>) -> Result<ProbeOutcome> {
    let mut info = FileInfo::untitled(ForkKind::Data, 0);
    if input.open(OpenWhich::First, &mut info)? == OpenOutcome::End {
        return Ok(ProbeOutcome::Unrecognized(input));
    }
    let archive = read_fork_to_end(input.as_mut(), 4096)?;

    if archive.len() < 8 || archive[0] != 0x01 || archive[1] != 0x01 {
        return Ok(ProbeOutcome::Unrecognized(input));
    }
    let dir_offset = u32::from_be_bytes(archive[4..8].try_into().unwrap()) as usize;
    let Some(dir_data) = archive.get(dir_offset..) else {
        return Ok(ProbeOutcome::Unrecognized(input));
    };

    let mut cursor = DirCursor {
        data: dir_data,
        pos: 0,
    };
    let Ok(_dir_crc) = cursor.u32() else {
        return Ok(ProbeOutcome::Unrecognized(input));
    };
    let Ok(total_entries) = cursor.u16() else {
        return Ok(ProbeOutcome::Unrecognized(input));
    };
    let Ok(comment_len) = cursor.u8() else {
        return Ok(ProbeOutcome::Unrecognized(input));
    };
    if cursor.bytes(comment_len as usize).is_err() {
        return Ok(ProbeOutcome::Unrecognized(input));
    }

    let mut entries = Vec::new();
    if walk_directory(&mut cursor, "", total_entries as u32, &mut entries).is_err() {
        return Ok(ProbeOutcome::Unrecognized(input));
    }

    for entry in &entries {
        if entry.flags & 0x0001 != 0 {
            return Err(MunboxError::UnsupportedFeature(
                "encrypted Compact Pro entries are not supported".into(),
            ));
        }
    }

    Ok(ProbeOutcome::Recognized(Box::new(CptLayer {
        inner: input,
        archive,
        entries,
        index: 0,
        cursor: Cursor::NotStarted,
        current_data: Vec::new(),
        current_rsrc: Vec::new(),
    })))
}

impl CptLayer {
    /// Position on the first non-empty fork of entry `idx` onward, loading
    /// each entry's forks in turn and skipping any entry whose data and
    /// resource forks are both empty (spec §8: a fork-open event only
    /// happens for a non-empty fork). Returns `End` once past the last
    /// entry.
    fn open_entry_from(&mut self, mut idx: usize, info: &mut FileInfo) -> Result<OpenOutcome> {
        while idx < self.entries.len() {
            self.load_forks(idx)?;
            self.index = idx;
            if !self.current_data.is_empty() {
                self.cursor = Cursor::Data(0);
                fill_info(info, &self.entries[idx], ForkKind::Data, self.current_data.len());
                return Ok(OpenOutcome::Present);
            }
            if !self.current_rsrc.is_empty() {
                self.cursor = Cursor::Resource(0);
                fill_info(info, &self.entries[idx], ForkKind::Resource, self.current_rsrc.len());
                return Ok(OpenOutcome::Present);
            }
            idx += 1;
        }
        self.cursor = Cursor::Done;
        Ok(OpenOutcome::End)
    }

    fn load_forks(&mut self, idx: usize) -> Result<()> {
        let entry = &self.entries[idx];
        let rsrc_comp_len = entry.rsrc_comp as usize;
        let data_comp_len = entry.data_comp as usize;
        let start = entry.file_offset as usize;
        let rsrc_raw = self
            .archive
            .get(start..start + rsrc_comp_len)
            .ok_or_else(|| MunboxError::TruncatedInput("CPT resource fork data".into()))?;
        let data_raw = self
            .archive
            .get(start + rsrc_comp_len..start + rsrc_comp_len + data_comp_len)
            .ok_or_else(|| MunboxError::TruncatedInput("CPT data fork data".into()))?;

        self.current_rsrc = decode_fork(
            rsrc_raw,
            entry.flags & 0x0002 != 0,
            entry.rsrc_uncomp as usize,
        )?;
        self.current_data = decode_fork(
            data_raw,
            entry.flags & 0x0004 != 0,
            entry.data_uncomp as usize,
        )?;
        Ok(())
    }
}

impl Layer for CptLayer {
    fn open(&mut self, which: OpenWhich, info: &mut FileInfo) -> Result<OpenOutcome> {
        match which {
            OpenWhich::First => self.open_entry_from(0, info),
            OpenWhich::Next => match self.cursor {
                Cursor::Data(_) => {
                    if !self.current_rsrc.is_empty() {
                        self.cursor = Cursor::Resource(0);
                        fill_info(
                            info,
                            &self.entries[self.index],
                            ForkKind::Resource,
                            self.current_rsrc.len(),
                        );
                        Ok(OpenOutcome::Present)
                    } else {
                        self.open_entry_from(self.index + 1, info)
                    }
                }
                Cursor::Resource(_) | Cursor::NotStarted => {
                    self.open_entry_from(self.index + 1, info)
                }
                Cursor::Done => Ok(OpenOutcome::End),
            },
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        match &mut self.cursor {
            Cursor::Data(pos) => {
                let remaining = &self.current_data[(*pos).min(self.current_data.len())..];
                let n = remaining.len().min(buf.len());
                buf[..n].copy_from_slice(&remaining[..n]);
                *pos += n;
                Ok(n)
            }
            Cursor::Resource(pos) => {
                let remaining = &self.current_rsrc[(*pos).min(self.current_rsrc.len())..];
                let n = remaining.len().min(buf.len());
                buf[..n].copy_from_slice(&remaining[..n]);
                *pos += n;
                Ok(n)
            }
            Cursor::NotStarted | Cursor::Done => Err(MunboxError::BadParameter(
                "read() called before open() on Compact Pro layer".into(),
            )),
        }
    }
}

fn fill_info(info: &mut FileInfo, entry: &CptEntry, kind: ForkKind, length: usize) {
    *info = FileInfo {
        filename: entry.path.clone(),
        file_type: entry.file_type,
        creator: entry.creator,
        finder_flags: entry.finder_flags,
        length: length as u64,
        fork_kind: kind,
        has_metadata: true,
    };
}

impl Drop for CptLayer {
    fn drop(&mut self) {
        let _ = &self.inner;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rle_decode_passthrough_for_non_escape_bytes() {
        let out = cpt_rle_decode(b"abc", 3).unwrap();
        assert_eq!(out, b"abc");
    }

    #[test]
    fn rle_decode_repeat_marker() {
        // 'A', then 0x81 0x82 0x05 -> 4 additional 'A's
        let input = [b'A', 0x81, 0x82, 0x05];
        let out = cpt_rle_decode(&input, 5).unwrap();
        assert_eq!(out, vec![b'A'; 5]);
    }

    fn fake_entry(path: &str, file_offset: u32, rsrc_comp: u32, rsrc_uncomp: u32, data_comp: u32, data_uncomp: u32) -> CptEntry {
        CptEntry {
            path: path.into(),
            file_type: 0,
            creator: 0,
            finder_flags: 0,
            file_offset,
            flags: 0,
            rsrc_uncomp,
            data_uncomp,
            rsrc_comp,
            data_comp,
        }
    }

    #[test]
    fn entries_with_both_forks_empty_are_skipped_on_open() {
        let mut layer = CptLayer {
            inner: Box::new(crate::source::MemSource::new(Vec::new())),
            archive: b"abc".to_vec(),
            entries: vec![
                fake_entry("empty", 0, 0, 0, 0, 0),
                fake_entry("has-data", 0, 0, 0, 3, 3),
            ],
            index: 0,
            cursor: Cursor::NotStarted,
            current_data: Vec::new(),
            current_rsrc: Vec::new(),
        };
        let mut info = FileInfo::untitled(ForkKind::Data, 0);
        let outcome = layer.open(OpenWhich::First, &mut info).unwrap();
        assert_eq!(outcome, OpenOutcome::Present);
        assert_eq!(info.filename, "has-data");
        assert_eq!(info.fork_kind, ForkKind::Data);
        assert_eq!(layer.open(OpenWhich::Next, &mut info).unwrap(), OpenOutcome::End);
    }

    #[test]
    fn all_entries_empty_opens_to_end() {
        let mut layer = CptLayer {
            inner: Box::new(crate::source::MemSource::new(Vec::new())),
            archive: Vec::new(),
            entries: vec![fake_entry("empty", 0, 0, 0, 0, 0)],
            index: 0,
            cursor: Cursor::NotStarted,
            current_data: Vec::new(),
            current_rsrc: Vec::new(),
        };
        let mut info = FileInfo::untitled(ForkKind::Data, 0);
        assert_eq!(layer.open(OpenWhich::First, &mut info).unwrap(), OpenOutcome::End);
    }

    #[test]
    fn non_cpt_input_is_unrecognized() {
        let src = crate::source::MemSource::new(b"not a cpt archive".to_vec());
        assert!(matches!(probe(Box::new(src)).unwrap(), ProbeOutcome::Unrecognized(_)));
    }
}
