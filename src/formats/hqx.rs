//! BinHex 4.0 transformer (spec §4.3): 6-bit ASCII armor wrapping an
//! RLE90-compressed byte stream that holds a small header, a data fork and
//! a resource fork, each followed by a CRC-16/XMODEM. Grounded on `hqx.c`.

use crate::crc16::XmodemCrc;
use crate::error::{MunboxError, Result};
use crate::layer::{read_fork_to_end, FileInfo, ForkKind, Layer, OpenOutcome, OpenWhich, ProbeOutcome};
use crate::macroman::FromMacRoman;
use crate::methods::rle90::Rle90Decoder;

/// The canonical 64-character BinHex 4.0 armor alphabet (as used by every
/// BinHex implementation in the wild, including the historical CPython
/// `binhex` module this is cross-checked against): note it deliberately
/// skips `7`, `O`, `W` and several lowercase letters to stay unambiguous
/// when read aloud or retyped.
const ALPHABET: &[u8; 64] =
    b"!\"#$%&'()*+,-012345689@ABCDEFGHIJKLMNPQRSTUVXYZ[`abcdefhijklmpqr";

fn decode_table() -> [i8; 256] {
    let mut table = [-1i8; 256];
    for (i, &c) in ALPHABET.iter().enumerate() {
        table[c as usize] = i as i8;
    }
    table
}

/// Strip the banner line and `:`...`:` armor, translating 6-bit groups of 4
/// characters into 3 raw bytes.
fn dearmor(data: &[u8]) -> Result<Vec<u8>> {
    let start = data
        .iter()
        .position(|&b| b == b':')
        .ok_or_else(|| MunboxError::TruncatedInput("BinHex opening ':' not found".into()))?;
    let rest = &data[start + 1..];
    let end = rest
        .iter()
        .position(|&b| b == b':')
        .ok_or_else(|| MunboxError::TruncatedInput("BinHex closing ':' not found".into()))?;
    let armored = &rest[..end];

    let table = decode_table();
    let mut bits: u32 = 0;
    let mut nbits: u32 = 0;
    let mut out = Vec::with_capacity(armored.len() * 3 / 4);
    for &c in armored {
        if c == b'\r' || c == b'\n' {
            continue;
        }
        let v = table[c as usize];
        if v < 0 {
            continue;
        }
        bits = (bits << 6) | v as u32;
        nbits += 6;
        if nbits >= 8 {
            nbits -= 8;
            out.push((bits >> nbits) as u8);
        }
    }
    Ok(out)
}

struct Header {
    filename: Vec<u8>,
    file_type: u32,
    file_creator: u32,
    flags: u16,
    data_len: u32,
    rsrc_len: u32,
}

fn parse_header(data: &[u8]) -> Result<(Header, usize)> {
    let mut pos = 0usize;
    let read_u8 = |data: &[u8], pos: &mut usize| -> Result<u8> {
        let b = *data
            .get(*pos)
            .ok_or_else(|| MunboxError::TruncatedInput("BinHex header".into()))?;
        *pos += 1;
        Ok(b)
    };
    let name_len = read_u8(data, &mut pos)? as usize;
    let filename = data
        .get(pos..pos + name_len)
        .ok_or_else(|| MunboxError::TruncatedInput("BinHex filename".into()))?
        .to_vec();
    pos += name_len;
    pos += 1; // zero-byte name terminator

    let read_u32 = |data: &[u8], pos: &mut usize| -> Result<u32> {
        let b = data
            .get(*pos..*pos + 4)
            .ok_or_else(|| MunboxError::TruncatedInput("BinHex header field".into()))?;
        *pos += 4;
        Ok(u32::from_be_bytes(b.try_into().unwrap()))
    };
    let read_u16 = |data: &[u8], pos: &mut usize| -> Result<u16> {
        let b = data
            .get(*pos..*pos + 2)
            .ok_or_else(|| MunboxError::TruncatedInput("BinHex header field".into()))?;
        *pos += 2;
        Ok(u16::from_be_bytes(b.try_into().unwrap()))
    };

    let file_type = read_u32(data, &mut pos)?;
    let file_creator = read_u32(data, &mut pos)?;
    let flags = read_u16(data, &mut pos)?;
    let data_len = read_u32(data, &mut pos)?;
    let rsrc_len = read_u32(data, &mut pos)?;
    let header_crc = read_u16(data, &mut pos)?;

    let mut running = XmodemCrc::new();
    for &b in &data[..pos - 2] {
        running.update(b);
    }
    running.update(0);
    running.update(0);
    if running.value() != header_crc {
        return Err(MunboxError::ChecksumMismatch {
            context: "BinHex header".into(),
            expected: header_crc as u32,
            computed: running.value() as u32,
        });
    }

    Ok((
        Header {
            filename,
            file_type,
            file_creator,
            flags,
            data_len,
            rsrc_len,
        },
        pos,
    ))
}

fn verify_fork_crc(context: &str, fork: &[u8], expected: u16) -> Result<()> {
    let mut running = XmodemCrc::new();
    for &b in fork {
        running.update(b);
    }
    running.update(0);
    running.update(0);
    if running.value() != expected {
        return Err(MunboxError::ChecksumMismatch {
            context: context.into(),
            expected: expected as u32,
            computed: running.value() as u32,
        });
    }
    Ok(())
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Cursor {
    NotStarted,
    Data,
    Resource,
    Done,
}

impl Cursor {
    fn from_fork_kind(kind: ForkKind) -> Self {
        match kind {
            ForkKind::Data => Cursor::Data,
            ForkKind::Resource => Cursor::Resource,
        }
    }

    fn fork_kind(self) -> Option<ForkKind> {
        match self {
            Cursor::Data => Some(ForkKind::Data),
            Cursor::Resource => Some(ForkKind::Resource),
            Cursor::NotStarted | Cursor::Done => None,
        }
    }
}

pub struct HqxLayer {
    inner: Box<dyn Layer>,
    header: Header,
    data_fork: Vec<u8>,
    rsrc_fork: Vec<u8>,
    cursor: Cursor,
    read_pos: usize,
}

/// Detect and construct the BinHex transformer. Returns
/// `ProbeOutcome::Unrecognized` when the input has no `:`-delimited BinHex
/// armor, per the `format_unrecognized` convention (spec §9).
pub fn probe(mut input: Box<dyn Layer>) -> Result<ProbeOutcome> {
    let mut info = FileInfo::untitled(ForkKind::Data, 0);
    if input.open(OpenWhich::First, &mut info)? == OpenOutcome::End {
        return Ok(ProbeOutcome::Unrecognized(input));
    }
    let raw = read_fork_to_end(input.as_mut(), 1024)?;

    if !raw.iter().any(|&b| b == b':') {
        return Ok(ProbeOutcome::Unrecognized(input));
    }
    let armored = match dearmor(&raw) {
        Ok(v) => v,
        Err(_) => return Ok(ProbeOutcome::Unrecognized(input)),
    };

    let mut rle = Rle90Decoder::new(0x90);
    let mut pos = 0usize;
    let decompressed = {
        let mut out = Vec::with_capacity(armored.len() * 2);
        loop {
            let mut chunk = [0u8; 4096];
            let n = rle.fill(
                || {
                    if pos < armored.len() {
                        let b = armored[pos];
                        pos += 1;
                        Ok(Some(b))
                    } else {
                        Ok(None)
                    }
                },
                &mut chunk,
            )?;
            if n == 0 {
                break;
            }
            out.extend_from_slice(&chunk[..n]);
        }
        out
    };

    let (header, mut cursor_pos) = match parse_header(&decompressed) {
        Ok(v) => v,
        Err(_) => return Ok(ProbeOutcome::Unrecognized(input)),
    };

    let data_len = header.data_len as usize;
    let data_fork = decompressed
        .get(cursor_pos..cursor_pos + data_len)
        .ok_or_else(|| MunboxError::TruncatedInput("BinHex data fork".into()))?
        .to_vec();
    cursor_pos += data_len;
    let data_crc = u16::from_be_bytes(
        decompressed
            .get(cursor_pos..cursor_pos + 2)
            .ok_or_else(|| MunboxError::TruncatedInput("BinHex data fork CRC".into()))?
            .try_into()
            .unwrap(),
    );
    cursor_pos += 2;
    verify_fork_crc("BinHex data fork", &data_fork, data_crc)?;

    let rsrc_len = header.rsrc_len as usize;
    let rsrc_fork = decompressed
        .get(cursor_pos..cursor_pos + rsrc_len)
        .ok_or_else(|| MunboxError::TruncatedInput("BinHex resource fork".into()))?
        .to_vec();
    cursor_pos += rsrc_len;
    let rsrc_crc = u16::from_be_bytes(
        decompressed
            .get(cursor_pos..cursor_pos + 2)
            .ok_or_else(|| MunboxError::TruncatedInput("BinHex resource fork CRC".into()))?
            .try_into()
            .unwrap(),
    );
    verify_fork_crc("BinHex resource fork", &rsrc_fork, rsrc_crc)?;

    Ok(ProbeOutcome::Recognized(Box::new(HqxLayer {
        inner: input,
        header,
        data_fork,
        rsrc_fork,
        cursor: Cursor::NotStarted,
        read_pos: 0,
    })))
}

const FORK_ORDER: [ForkKind; 2] = [ForkKind::Data, ForkKind::Resource];

impl Layer for HqxLayer {
    fn open(&mut self, which: OpenWhich, info: &mut FileInfo) -> Result<OpenOutcome> {
        let filename = String::from_macroman(&self.header.filename);

        // Position just past whatever fork `self.cursor` currently names,
        // so `Next` resumes after it; `First` always starts at the front,
        // and either call skips a fork that turns out to be zero-length.
        let mut idx = match which {
            OpenWhich::First => 0,
            OpenWhich::Next => FORK_ORDER
                .iter()
                .position(|k| Some(*k) == self.cursor.fork_kind())
                .map(|i| i + 1)
                .unwrap_or(FORK_ORDER.len()),
        };

        while idx < FORK_ORDER.len() {
            let kind = FORK_ORDER[idx];
            let fork = match kind {
                ForkKind::Data => &self.data_fork,
                ForkKind::Resource => &self.rsrc_fork,
            };
            if fork.is_empty() {
                idx += 1;
                continue;
            }
            self.read_pos = 0;
            self.cursor = Cursor::from_fork_kind(kind);
            *info = FileInfo {
                filename,
                file_type: self.header.file_type,
                creator: self.header.file_creator,
                finder_flags: self.header.flags,
                length: fork.len() as u64,
                fork_kind: kind,
                has_metadata: true,
            };
            return Ok(OpenOutcome::Present);
        }
        self.cursor = Cursor::Done;
        Ok(OpenOutcome::End)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let fork = match self.cursor {
            Cursor::Data => &self.data_fork,
            Cursor::Resource => &self.rsrc_fork,
            Cursor::NotStarted | Cursor::Done => {
                return Err(MunboxError::BadParameter(
                    "read() called before open() on BinHex layer".into(),
                ))
            }
        };
        let remaining = &fork[self.read_pos.min(fork.len())..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.read_pos += n;
        Ok(n)
    }
}

impl Drop for HqxLayer {
    fn drop(&mut self) {
        let _ = &self.inner;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn armor(raw: &[u8]) -> Vec<u8> {
        let table = decode_table();
        let mut alphabet = [0u8; 64];
        for (c, &v) in table.iter().enumerate() {
            if v >= 0 {
                alphabet[v as usize] = c as u8;
            }
        }
        let mut bits: u32 = 0;
        let mut nbits: u32 = 0;
        let mut out = Vec::new();
        out.push(b':');
        for &b in raw {
            bits = (bits << 8) | b as u32;
            nbits += 8;
            while nbits >= 6 {
                nbits -= 6;
                out.push(alphabet[((bits >> nbits) & 0x3f) as usize]);
            }
        }
        if nbits > 0 {
            out.push(alphabet[((bits << (6 - nbits)) & 0x3f) as usize]);
        }
        out.push(b':');
        out
    }

    #[test]
    fn dearmor_round_trips_raw_bytes() {
        let raw = b"hello binhex world";
        let armored = armor(raw);
        let decoded = dearmor(&armored).unwrap();
        assert_eq!(&decoded[..raw.len()], raw);
    }

    #[test]
    fn non_binhex_input_is_unrecognized() {
        let src = crate::source::MemSource::new(b"plain text, no colons here".to_vec());
        assert!(matches!(probe(Box::new(src)).unwrap(), ProbeOutcome::Unrecognized(_)));
    }

    /// Naive RLE90 encode: escape literal 0x90 bytes, no run compression.
    fn rle90_encode(raw: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        for &b in raw {
            out.push(b);
            if b == 0x90 {
                out.push(0x00);
            }
        }
        out
    }

    fn build_archive(data: &[u8], rsrc: &[u8]) -> Vec<u8> {
        let name = b"Test";
        let mut plain = Vec::new();
        plain.push(name.len() as u8);
        plain.extend_from_slice(name);
        plain.push(0);
        plain.extend_from_slice(&0u32.to_be_bytes()); // file_type
        plain.extend_from_slice(&0u32.to_be_bytes()); // file_creator
        plain.extend_from_slice(&0u16.to_be_bytes()); // flags
        plain.extend_from_slice(&(data.len() as u32).to_be_bytes());
        plain.extend_from_slice(&(rsrc.len() as u32).to_be_bytes());

        let mut header_crc = XmodemCrc::new();
        for &b in &plain {
            header_crc.update(b);
        }
        header_crc.update(0);
        header_crc.update(0);
        plain.extend_from_slice(&header_crc.value().to_be_bytes());

        plain.extend_from_slice(data);
        let mut data_crc = XmodemCrc::new();
        for &b in data {
            data_crc.update(b);
        }
        data_crc.update(0);
        data_crc.update(0);
        plain.extend_from_slice(&data_crc.value().to_be_bytes());

        plain.extend_from_slice(rsrc);
        let mut rsrc_crc = XmodemCrc::new();
        for &b in rsrc {
            rsrc_crc.update(b);
        }
        rsrc_crc.update(0);
        rsrc_crc.update(0);
        plain.extend_from_slice(&rsrc_crc.value().to_be_bytes());

        armor(&rle90_encode(&plain))
    }

    #[test]
    fn empty_data_fork_with_resource_fork_yields_resource_first() {
        let archive = build_archive(b"", b"abc");
        let src = crate::source::MemSource::new(archive);
        let mut layer = match probe(Box::new(src)).unwrap() {
            ProbeOutcome::Recognized(layer) => layer,
            ProbeOutcome::Unrecognized(_) => panic!("expected BinHex to be recognized"),
        };

        let mut info = FileInfo::untitled(ForkKind::Data, 0);
        assert_eq!(
            layer.open(OpenWhich::First, &mut info).unwrap(),
            OpenOutcome::Present
        );
        assert_eq!(info.fork_kind, ForkKind::Resource);
        assert_eq!(
            layer.open(OpenWhich::Next, &mut info).unwrap(),
            OpenOutcome::End
        );
    }

    #[test]
    fn both_forks_empty_opens_to_end() {
        let archive = build_archive(b"", b"");
        let src = crate::source::MemSource::new(archive);
        let mut layer = match probe(Box::new(src)).unwrap() {
            ProbeOutcome::Recognized(layer) => layer,
            ProbeOutcome::Unrecognized(_) => panic!("expected BinHex to be recognized"),
        };

        let mut info = FileInfo::untitled(ForkKind::Data, 0);
        assert_eq!(
            layer.open(OpenWhich::First, &mut info).unwrap(),
            OpenOutcome::End
        );
    }
}
