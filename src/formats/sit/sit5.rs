//! StuffIt 5 archive layer (spec §4.7): a flat, sequential stream of
//! variable-length entries (`0xA5A5A5A4` magic... actually `0xA5A5A5A5`),
//! each linked back to its containing directory by a `parent_offset`
//! rather than being physically nested. Grounded on `sit.c`'s SIT5 path.
//!
//! One simplification, recorded in DESIGN.md: the spec's description of
//! the per-fork "resource info" and password-length fields leaves the
//! exact byte layout of where password bytes and fork bytes interleave
//! underspecified. This implementation assumes, in disk order after the
//! fixed header blocks: resource password bytes (if a resource fork is
//! present), resource fork bytes, data password bytes, data fork bytes.

use crate::crc16::sit_crc;
use crate::error::{MunboxError, Result};
use crate::layer::{read_fork_to_end, FileInfo, ForkKind, Layer, OpenOutcome, OpenWhich, ProbeOutcome};
use crate::macroman::FromMacRoman;
use crate::methods::decode_sit_method;
use std::collections::HashMap;

const ENTRY_MAGIC: u32 = 0xA5A5_A5A5;
const HEADER2_LEN: usize = 36; // 14-byte prefix + 22 skipped bytes
const RESOURCE_INFO_LEN: usize = 14;
const DIR_FLAG: u8 = 0x40;
const ENCRYPTED_FLAG: u8 = 0x20;
const HAS_RESOURCE_FLAG: u16 = 0x0001;
const PHANTOM_LENGTH: u32 = 0xFFFF_FFFF;

struct RawEntry {
    offset: usize,
    header1_len: usize,
    parent_offset: u32,
    flags: u8,
    name: String,
    data_length: u32,
    data_comp_len: u32,
    data_crc: u16,
    data_method: u8,
    data_password_len: u8,
    numfiles: u16,
    flags2: u16,
    file_type: u32,
    creator: u32,
    finder_flags: u16,
    has_resource: bool,
    rsrc_length: u32,
    rsrc_comp_len: u32,
    rsrc_crc: u16,
    rsrc_method: u8,
    rsrc_password_len: u8,
    total_entry_len: usize,
}

fn parse_entry(archive: &[u8], offset: usize) -> Result<RawEntry> {
    let eof = || MunboxError::TruncatedInput("SIT5 entry header".into());
    let header1_len =
        u16::from_be_bytes(archive.get(offset + 6..offset + 8).ok_or_else(eof)?.try_into().unwrap())
            as usize;
    let header1 = archive
        .get(offset..offset + header1_len)
        .ok_or_else(eof)?;

    let version = header1[4];
    if version != 1 {
        return Err(MunboxError::UnsupportedFeature(format!(
            "unsupported SIT5 entry version {version}"
        )));
    }
    let flags = header1[9];
    let parent_offset = u32::from_be_bytes(header1[26..30].try_into().unwrap());
    let name_len = u16::from_be_bytes(header1[30..32].try_into().unwrap()) as usize;
    let data_length = u32::from_be_bytes(header1[34..38].try_into().unwrap());
    let data_comp_len = u32::from_be_bytes(header1[38..42].try_into().unwrap());
    let data_crc = u16::from_be_bytes(header1[42..44].try_into().unwrap());
    let data_method = header1[46];
    let data_password_len = header1[47];
    let numfiles = u16::from_be_bytes(header1[46..48].try_into().unwrap());
    let name = String::from_macroman(
        header1
            .get(48..48 + name_len)
            .ok_or_else(eof)?,
    );

    let is_dir = flags & DIR_FLAG != 0;
    let is_phantom = is_dir && data_length == PHANTOM_LENGTH;

    if is_dir {
        return Ok(RawEntry {
            offset,
            header1_len,
            parent_offset,
            flags,
            name,
            data_length,
            data_comp_len: 0,
            data_crc: 0,
            data_method: 0,
            data_password_len: 0,
            numfiles,
            flags2: 0,
            file_type: 0,
            creator: 0,
            finder_flags: 0,
            has_resource: false,
            rsrc_length: 0,
            rsrc_comp_len: 0,
            rsrc_crc: 0,
            rsrc_method: 0,
            rsrc_password_len: 0,
            total_entry_len: if is_phantom { header1_len } else { header1_len },
        });
    }

    if flags & ENCRYPTED_FLAG != 0 && data_password_len > 0 {
        return Err(MunboxError::UnsupportedFeature(
            "encrypted SIT5 entries are not supported".into(),
        ));
    }

    let header2_start = offset + header1_len;
    let header2 = archive
        .get(header2_start..header2_start + HEADER2_LEN)
        .ok_or_else(eof)?;
    let flags2 = u16::from_be_bytes(header2[0..2].try_into().unwrap());
    let file_type = u32::from_be_bytes(header2[4..8].try_into().unwrap());
    let creator = u32::from_be_bytes(header2[8..12].try_into().unwrap());
    let finder_flags = u16::from_be_bytes(header2[12..14].try_into().unwrap());

    let mut cursor = header2_start + HEADER2_LEN;
    let has_resource = flags2 & HAS_RESOURCE_FLAG != 0;
    let (rsrc_length, rsrc_comp_len, rsrc_crc, rsrc_method, rsrc_password_len) = if has_resource {
        let block = archive
            .get(cursor..cursor + RESOURCE_INFO_LEN)
            .ok_or_else(eof)?;
        let length = u32::from_be_bytes(block[0..4].try_into().unwrap());
        let comp_len = u32::from_be_bytes(block[4..8].try_into().unwrap());
        let crc = u16::from_be_bytes(block[8..10].try_into().unwrap());
        let method = block[10];
        let password_len = block[11];
        cursor += RESOURCE_INFO_LEN;
        (length, comp_len, crc, method, password_len)
    } else {
        (0, 0, 0, 0, 0)
    };

    cursor += rsrc_password_len as usize;
    cursor += rsrc_comp_len as usize;
    cursor += data_password_len as usize;
    let data_fork_end = cursor + data_comp_len as usize;

    Ok(RawEntry {
        offset,
        header1_len,
        parent_offset,
        flags,
        name,
        data_length,
        data_comp_len,
        data_crc,
        data_method,
        data_password_len,
        numfiles,
        flags2,
        file_type,
        creator,
        finder_flags,
        has_resource,
        rsrc_length,
        rsrc_comp_len,
        rsrc_crc,
        rsrc_method,
        rsrc_password_len,
        total_entry_len: data_fork_end - offset,
    })
}

struct FileEntry {
    path: String,
    file_type: u32,
    creator: u32,
    finder_flags: u16,
    data_method: u8,
    data_length: u32,
    data_comp_len: u32,
    data_crc: u16,
    data_offset: usize,
    has_resource: bool,
    rsrc_method: u8,
    rsrc_length: u32,
    rsrc_comp_len: u32,
    rsrc_crc: u16,
    rsrc_offset: usize,
}

fn walk_entries(archive: &[u8], start_cursor: usize, total_entries: u32) -> Result<Vec<FileEntry>> {
    let mut paths: HashMap<usize, String> = HashMap::new();
    let mut files = Vec::new();
    let mut cursor = start_cursor;
    let mut remaining = total_entries;

    while remaining > 0 {
        if cursor + 4 > archive.len() {
            break;
        }
        let magic = u32::from_be_bytes(archive[cursor..cursor + 4].try_into().unwrap());
        if magic != ENTRY_MAGIC {
            return Err(MunboxError::TruncatedInput(
                "SIT5 entry magic mismatch".into(),
            ));
        }
        let entry = parse_entry(archive, cursor)?;
        remaining -= 1;

        let parent_path = if entry.parent_offset == 0 {
            String::new()
        } else {
            paths.get(&(entry.parent_offset as usize)).cloned().unwrap_or_default()
        };
        let path = if parent_path.is_empty() {
            entry.name.clone()
        } else {
            format!("{parent_path}/{}", entry.name)
        };

        let is_dir = entry.flags & DIR_FLAG != 0;
        let is_phantom = is_dir && entry.data_length == PHANTOM_LENGTH;

        if is_dir {
            if is_phantom {
                remaining += 1;
            } else {
                paths.insert(entry.offset, path);
                remaining += entry.numfiles as u32;
            }
        } else {
            let header2_start = entry.offset + entry.header1_len;
            let mut fork_cursor = header2_start + HEADER2_LEN;
            if entry.has_resource {
                fork_cursor += RESOURCE_INFO_LEN;
            }
            let rsrc_offset = fork_cursor + entry.rsrc_password_len as usize;
            let data_offset =
                rsrc_offset + entry.rsrc_comp_len as usize + entry.data_password_len as usize;

            files.push(FileEntry {
                path,
                file_type: entry.file_type,
                creator: entry.creator,
                finder_flags: entry.finder_flags,
                data_method: entry.data_method,
                data_length: entry.data_length,
                data_comp_len: entry.data_comp_len,
                data_crc: entry.data_crc,
                data_offset,
                has_resource: entry.has_resource,
                rsrc_method: entry.rsrc_method,
                rsrc_length: entry.rsrc_length,
                rsrc_comp_len: entry.rsrc_comp_len,
                rsrc_crc: entry.rsrc_crc,
                rsrc_offset,
            });
        }

        cursor = entry.offset + entry.total_entry_len;
    }

    Ok(files)
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Cursor {
    NotStarted,
    Data(usize),
    Resource(usize),
    Done,
}

pub struct Sit5Layer {
    inner: Box<dyn Layer>,
    archive: Vec<u8>,
    entries: Vec<FileEntry>,
    index: usize,
    cursor: Cursor,
    current_data: Vec<u8>,
    current_rsrc: Vec<u8>,
}

/// Detect and construct the StuffIt 5 archive layer (spec §4.7).
pub fn probe(mut input: Box<dyn Layer>) -> Result<ProbeOutcome> {
    let mut info = FileInfo::untitled(ForkKind::Data, 0);
    if input.open(OpenWhich::First, &mut info)? == OpenOutcome::End {
        return Ok(ProbeOutcome::Unrecognized(input));
    }
    let archive = read_fork_to_end(input.as_mut(), 4096)?;

    if archive.len() < 96 || !archive.starts_with(b"StuffIt (c)1997-") {
        return Ok(ProbeOutcome::Unrecognized(input));
    }
    let total_entries = u16::from_be_bytes(archive[92..94].try_into().unwrap()) as u32;
    let first_cursor = u32::from_be_bytes(archive[94..98].try_into().unwrap()) as usize;

    let entries = match walk_entries(&archive, first_cursor, total_entries) {
        Ok(e) => e,
        Err(_) => return Ok(ProbeOutcome::Unrecognized(input)),
    };

    Ok(ProbeOutcome::Recognized(Box::new(Sit5Layer {
        inner: input,
        archive,
        entries,
        index: 0,
        cursor: Cursor::NotStarted,
        current_data: Vec::new(),
        current_rsrc: Vec::new(),
    })))
}

impl Sit5Layer {
    fn load_forks(&mut self, idx: usize) -> Result<()> {
        let entry = &self.entries[idx];

        self.current_data = if entry.data_comp_len > 0 || entry.data_length > 0 {
            let raw = self
                .archive
                .get(entry.data_offset..entry.data_offset + entry.data_comp_len as usize)
                .ok_or_else(|| MunboxError::TruncatedInput("SIT5 data fork".into()))?;
            let decoded = decode_sit_method(entry.data_method, raw, entry.data_length as usize)?;
            if sit_crc(&decoded) != entry.data_crc {
                return Err(MunboxError::ChecksumMismatch {
                    context: format!("{} data fork", entry.path),
                    expected: entry.data_crc as u32,
                    computed: sit_crc(&decoded) as u32,
                });
            }
            decoded
        } else {
            Vec::new()
        };

        self.current_rsrc = if entry.has_resource {
            let raw = self
                .archive
                .get(entry.rsrc_offset..entry.rsrc_offset + entry.rsrc_comp_len as usize)
                .ok_or_else(|| MunboxError::TruncatedInput("SIT5 resource fork".into()))?;
            let decoded = decode_sit_method(entry.rsrc_method, raw, entry.rsrc_length as usize)?;
            if sit_crc(&decoded) != entry.rsrc_crc {
                return Err(MunboxError::ChecksumMismatch {
                    context: format!("{} resource fork", entry.path),
                    expected: entry.rsrc_crc as u32,
                    computed: sit_crc(&decoded) as u32,
                });
            }
            decoded
        } else {
            Vec::new()
        };
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

impl Layer for Sit5Layer {
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
                "read() called before open() on SIT5 layer".into(),
            )),
        }
    }
}

fn fill_info(info: &mut FileInfo, entry: &FileEntry, kind: ForkKind, length: usize) {
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

impl Drop for Sit5Layer {
    fn drop(&mut self) {
        let _ = &self.inner;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_sit5_input_is_unrecognized() {
        let src = crate::source::MemSource::new(b"not a sit5 archive at all".to_vec());
        assert!(matches!(probe(Box::new(src)).unwrap(), ProbeOutcome::Unrecognized(_)));
    }

    fn empty_entry(path: &str) -> FileEntry {
        FileEntry {
            path: path.into(),
            file_type: 0,
            creator: 0,
            finder_flags: 0,
            data_method: 0,
            data_length: 0,
            data_comp_len: 0,
            data_crc: 0,
            data_offset: 0,
            has_resource: false,
            rsrc_method: 0,
            rsrc_length: 0,
            rsrc_comp_len: 0,
            rsrc_crc: 0,
            rsrc_offset: 0,
        }
    }

    #[test]
    fn entries_with_both_forks_empty_are_skipped_on_open() {
        let mut has_data = empty_entry("has-data");
        has_data.data_length = 3;
        has_data.data_comp_len = 3;
        has_data.data_crc = sit_crc(b"abc");
        let mut layer = Sit5Layer {
            inner: Box::new(crate::source::MemSource::new(Vec::new())),
            archive: b"abc".to_vec(),
            entries: vec![empty_entry("empty"), has_data],
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
        let mut layer = Sit5Layer {
            inner: Box::new(crate::source::MemSource::new(Vec::new())),
            archive: Vec::new(),
            entries: vec![empty_entry("empty")],
            index: 0,
            cursor: Cursor::NotStarted,
            current_data: Vec::new(),
            current_rsrc: Vec::new(),
        };
        let mut info = FileInfo::untitled(ForkKind::Data, 0);
        assert_eq!(layer.open(OpenWhich::First, &mut info).unwrap(), OpenOutcome::End);
    }
}
