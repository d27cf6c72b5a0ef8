//! StuffIt classic archive layer (spec §4.6): a flat sequential stream of
//! 112-byte entry headers, using special method bytes 32/33 as a folder
//! enter/leave marker rather than a separate directory section. Grounded
//! on `sit.c`.

use log::debug;

use crate::crc16::sit_crc;
use crate::error::{MunboxError, Result};
use crate::layer::{read_fork_to_end, FileInfo, ForkKind, Layer, OpenOutcome, OpenWhich, ProbeOutcome};
use crate::macroman::FromMacRoman;
use crate::methods::decode_sit_method;

const HEADER_LEN: usize = 112;
const FOLDER_ENTER: u8 = 32;
const FOLDER_LEAVE: u8 = 33;
const MAX_FOLDER_DEPTH: usize = 10;

const MAGICS: &[[u8; 4]] = &[
    *b"SIT!", *b"ST46", *b"ST50", *b"ST60", *b"ST65", *b"STin", *b"STi2", *b"STi3", *b"STi4",
];

struct Entry {
    path: String,
    file_type: u32,
    creator: u32,
    finder_flags: u16,
    rsrc_method: u8,
    data_method: u8,
    rsrc_uncomp: u32,
    data_uncomp: u32,
    rsrc_comp: u32,
    data_comp: u32,
    rsrc_crc: u16,
    data_crc: u16,
    rsrc_offset: usize,
    data_offset: usize,
}

fn parse_entries(archive: &[u8], start: usize) -> Result<Vec<Entry>> {
    let mut entries = Vec::new();
    let mut pos = start;
    let mut stack: Vec<String> = Vec::new();

    while pos + HEADER_LEN <= archive.len() {
        let header = &archive[pos..pos + HEADER_LEN];
        let rsrc_method = header[0];
        let data_method = header[1];

        if rsrc_method == FOLDER_ENTER || data_method == FOLDER_ENTER {
            let name_len = header[2] as usize;
            let name = String::from_macroman(&header[3..3 + name_len.min(63)]);
            if stack.len() >= MAX_FOLDER_DEPTH {
                return Err(MunboxError::BadParameter(
                    "StuffIt classic folder nesting exceeds the 10-level limit".into(),
                ));
            }
            stack.push(name);
            pos += HEADER_LEN;
            continue;
        }
        if rsrc_method == FOLDER_LEAVE || data_method == FOLDER_LEAVE {
            stack.pop();
            pos += HEADER_LEN;
            continue;
        }
        // Method nibble >= 32 (& 0xE0 set) is never a real compression
        // method; `sit.c` treats it as a folder-stack operation it doesn't
        // otherwise recognize and skips the header rather than erroring.
        if rsrc_method & 0xE0 != 0 || data_method & 0xE0 != 0 {
            debug!(
                "StuffIt classic: skipping header at offset {pos} with non-file method byte(s) {rsrc_method:#x}/{data_method:#x}"
            );
            pos += HEADER_LEN;
            continue;
        }

        let name_len = header[2] as usize;
        let name = String::from_macroman(&header[3..3 + name_len.min(63)]);
        let path = if stack.is_empty() {
            name
        } else {
            format!("{}/{}", stack.join("/"), name)
        };

        let file_type = u32::from_be_bytes(header[66..70].try_into().unwrap());
        let creator = u32::from_be_bytes(header[70..74].try_into().unwrap());
        let finder_flags = u16::from_be_bytes(header[74..76].try_into().unwrap());
        let rsrc_uncomp = u32::from_be_bytes(header[84..88].try_into().unwrap());
        let data_uncomp = u32::from_be_bytes(header[88..92].try_into().unwrap());
        let rsrc_comp = u32::from_be_bytes(header[92..96].try_into().unwrap());
        let data_comp = u32::from_be_bytes(header[96..100].try_into().unwrap());
        let rsrc_crc = u16::from_be_bytes(header[100..102].try_into().unwrap());
        let data_crc = u16::from_be_bytes(header[102..104].try_into().unwrap());

        let rsrc_offset = pos + HEADER_LEN;
        let data_offset = rsrc_offset + rsrc_comp as usize;

        entries.push(Entry {
            path,
            file_type,
            creator,
            finder_flags,
            rsrc_method,
            data_method,
            rsrc_uncomp,
            data_uncomp,
            rsrc_comp,
            data_comp,
            rsrc_crc,
            data_crc,
            rsrc_offset,
            data_offset,
        });

        pos = data_offset + data_comp as usize;
    }

    Ok(entries)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Cursor {
    NotStarted,
    Data(usize),
    Resource(usize),
    Done,
}

pub struct SitClassicLayer {
    inner: Box<dyn Layer>,
    archive: Vec<u8>,
    entries: Vec<Entry>,
    index: usize,
    cursor: Cursor,
    current_data: Vec<u8>,
    current_rsrc: Vec<u8>,
}

/// Detect and construct the StuffIt classic archive layer (spec §4.6).
pub fn probe(mut input: Box<dyn Layer>) -> Result<ProbeOutcome> {
    let mut info = FileInfo::untitled(ForkKind::Data, 0);
    if input.open(OpenWhich::First, &mut info)? == OpenOutcome::End {
        return Ok(ProbeOutcome::Unrecognized(input));
    }
    let archive = read_fork_to_end(input.as_mut(), 4096)?;

    if archive.len() < 22 {
        return Ok(ProbeOutcome::Unrecognized(input));
    }
    let magic: [u8; 4] = archive[0..4].try_into().unwrap();
    if !MAGICS.contains(&magic) {
        return Ok(ProbeOutcome::Unrecognized(input));
    }
    if &archive[10..14] != b"rLau" {
        return Ok(ProbeOutcome::Unrecognized(input));
    }

    let entries = match parse_entries(&archive, 22) {
        Ok(e) => e,
        Err(_) => return Ok(ProbeOutcome::Unrecognized(input)),
    };

    Ok(ProbeOutcome::Recognized(Box::new(SitClassicLayer {
        inner: input,
        archive,
        entries,
        index: 0,
        cursor: Cursor::NotStarted,
        current_data: Vec::new(),
        current_rsrc: Vec::new(),
    })))
}

impl SitClassicLayer {
    fn load_forks(&mut self, idx: usize) -> Result<()> {
        let entry = &self.entries[idx];
        let rsrc_raw = self
            .archive
            .get(entry.rsrc_offset..entry.rsrc_offset + entry.rsrc_comp as usize)
            .ok_or_else(|| MunboxError::TruncatedInput("SIT classic resource fork".into()))?;
        let data_raw = self
            .archive
            .get(entry.data_offset..entry.data_offset + entry.data_comp as usize)
            .ok_or_else(|| MunboxError::TruncatedInput("SIT classic data fork".into()))?;

        self.current_rsrc = decode_sit_method(
            entry.rsrc_method & 0x0f,
            rsrc_raw,
            entry.rsrc_uncomp as usize,
        )?;
        if sit_crc(&self.current_rsrc) != entry.rsrc_crc {
            return Err(MunboxError::ChecksumMismatch {
                context: format!("{} resource fork", entry.path),
                expected: entry.rsrc_crc as u32,
                computed: sit_crc(&self.current_rsrc) as u32,
            });
        }

        self.current_data = decode_sit_method(
            entry.data_method & 0x0f,
            data_raw,
            entry.data_uncomp as usize,
        )?;
        if sit_crc(&self.current_data) != entry.data_crc {
            return Err(MunboxError::ChecksumMismatch {
                context: format!("{} data fork", entry.path),
                expected: entry.data_crc as u32,
                computed: sit_crc(&self.current_data) as u32,
            });
        }
        Ok(())
    }

    /// Position on the first non-empty fork of entry `idx` onward, skipping
    /// any entry whose data and resource forks are both empty (spec §8: a
    /// fork-open event only happens for a non-empty fork). Returns `End`
    /// once past the last entry.
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
}

impl Layer for SitClassicLayer {
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
                "read() called before open() on StuffIt classic layer".into(),
            )),
        }
    }
}

fn fill_info(info: &mut FileInfo, entry: &Entry, kind: ForkKind, length: usize) {
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

impl Drop for SitClassicLayer {
    fn drop(&mut self) {
        let _ = &self.inner;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_sit_input_is_unrecognized() {
        let src = crate::source::MemSource::new(b"definitely not a stuffit archive".to_vec());
        assert!(matches!(probe(Box::new(src)).unwrap(), ProbeOutcome::Unrecognized(_)));
    }

    #[test]
    fn unknown_high_method_byte_is_skipped_not_an_error() {
        let mut archive = vec![0u8; HEADER_LEN];
        archive[0] = 40; // not a real method, not 32/33 either
        let entries = parse_entries(&archive, 0).unwrap();
        assert!(entries.is_empty());
    }

    #[test]
    fn rejects_missing_rlau_marker() {
        let mut archive = vec![0u8; 22];
        archive[0..4].copy_from_slice(b"SIT!");
        // bytes 10..14 intentionally left as zero, not "rLau"
        let src = crate::source::MemSource::new(archive);
        assert!(matches!(probe(Box::new(src)).unwrap(), ProbeOutcome::Unrecognized(_)));
    }

    fn fake_entry(path: &str, rsrc_offset: usize, rsrc_len: usize, data_offset: usize, data_bytes: &[u8]) -> Entry {
        Entry {
            path: path.into(),
            file_type: 0,
            creator: 0,
            finder_flags: 0,
            rsrc_method: 0,
            data_method: 0,
            rsrc_uncomp: rsrc_len as u32,
            data_uncomp: data_bytes.len() as u32,
            rsrc_comp: rsrc_len as u32,
            data_comp: data_bytes.len() as u32,
            rsrc_crc: 0,
            data_crc: sit_crc(data_bytes),
            rsrc_offset,
            data_offset,
        }
    }

    #[test]
    fn entries_with_both_forks_empty_are_skipped_on_open() {
        let archive = b"abc".to_vec();
        let mut empty = fake_entry("empty", 0, 0, 0, &[]);
        empty.rsrc_crc = sit_crc(&[]);
        empty.data_crc = sit_crc(&[]);
        let mut has_data = fake_entry("has-data", 0, 0, 0, b"abc");
        has_data.rsrc_crc = sit_crc(&[]);
        let mut layer = SitClassicLayer {
            inner: Box::new(crate::source::MemSource::new(Vec::new())),
            archive,
            entries: vec![empty, has_data],
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
        let mut empty = fake_entry("empty", 0, 0, 0, &[]);
        empty.rsrc_crc = sit_crc(&[]);
        empty.data_crc = sit_crc(&[]);
        let mut layer = SitClassicLayer {
            inner: Box::new(crate::source::MemSource::new(Vec::new())),
            archive: Vec::new(),
            entries: vec![empty],
            index: 0,
            cursor: Cursor::NotStarted,
            current_data: Vec::new(),
            current_rsrc: Vec::new(),
        };
        let mut info = FileInfo::untitled(ForkKind::Data, 0);
        assert_eq!(layer.open(OpenWhich::First, &mut info).unwrap(), OpenOutcome::End);
    }
}
