//! MacBinary I/II/III transformer (spec §4.4): a 128-byte header describing
//! a data fork and a resource fork, both padded to the next multiple of
//! 128 bytes. Grounded directly on the teacher crate's `Header`/`MacBinary`
//! parsing (originally `src/lib.rs`), generalized here from a whole-buffer
//! parse into a two-fork [`Layer`].

use crc::{Crc, CRC_16_XMODEM};
use log::debug;

use crate::binary::read::{ReadBinary, ReadCtxt, ReadScope};
use crate::binary::{NumFrom, U32Be};
use crate::error::{MunboxError, Result};
use crate::layer::{read_fork_to_end, FileInfo, ForkKind, Layer, OpenOutcome, OpenWhich, ProbeOutcome};
use crate::macroman::FromMacRoman;

const MBIN_SIG: u32 = u32::from_be_bytes(*b"mBIN");

#[derive(Debug, Copy, Clone, Eq, PartialEq, PartialOrd, Ord)]
enum Version {
    I = 1,
    II = 2,
    III = 3,
}

struct Header {
    filename: Vec<u8>,
    secondary_header_len: u16,
    data_fork_len: u32,
    rsrc_fork_len: u32,
    file_type: u32,
    file_creator: u32,
    finder_flags: u8,
    finder_flags2: u8,
    crc: u16,
}

impl ReadBinary for Header {
    type HostType<'a> = Header;

    fn read<'a>(ctxt: &mut ReadCtxt<'a>) -> std::result::Result<Header, crate::error::ParseError> {
        let _ = ctxt.read_u8()?;
        let filename_len = ctxt.read_u8()?;
        ctxt.check((1..=63).contains(&filename_len))?;
        let filename_data = ctxt.read_slice(63)?;
        let file_type = ctxt.read::<U32Be>()?;
        let file_creator = ctxt.read::<U32Be>()?;
        let finder_flags = ctxt.read_u8()?;
        let _ = ctxt.read_u8()?;
        let _vpos = ctxt.read_u16be()?;
        let _hpos = ctxt.read_u16be()?;
        let _window_or_folder_id = ctxt.read_u16be()?;
        let _protected = ctxt.read_u8()?;
        let _ = ctxt.read_u8()?;
        let data_fork_len = ctxt.read_u32be()?;
        let rsrc_fork_len = ctxt.read_u32be()?;
        let _created = ctxt.read_u32be()?;
        let _modified = ctxt.read_u32be()?;
        let _comment_len = ctxt.read_u16be()?;
        let finder_flags2 = ctxt.read_u8()?;
        let _signature = ctxt.read::<U32Be>()?;
        let _script = ctxt.read_u8()?;
        let _extended_finder_flags = ctxt.read_u8()?;
        let _ = ctxt.read_slice(8)?;
        let _ = ctxt.read_u32be()?;
        let secondary_header_len = ctxt.read_u16be()?;
        let _version = ctxt.read_u8()?;
        let _min_version = ctxt.read_u8()?;
        let crc = ctxt.read_u16be()?;
        let _ = ctxt.read_u16be()?;

        Ok(Header {
            filename: filename_data[..usize::from(filename_len)].to_vec(),
            secondary_header_len,
            data_fork_len,
            rsrc_fork_len,
            file_type,
            file_creator,
            finder_flags,
            finder_flags2,
            crc,
        })
    }
}

/// Clear Finder-flag bits 0, 1, 8, 9, 10 on ingest (spec §3/§4.4): these are
/// desktop-database/window-position bits that don't survive MacBinary
/// encapsulation meaningfully and are sanitized away rather than carried
/// through verbatim.
fn sanitize_finder_flags(flags: u16) -> u16 {
    const CLEARED: u16 = (1 << 0) | (1 << 1) | (1 << 8) | (1 << 9) | (1 << 10);
    flags & !CLEARED
}

fn next_multiple_of_128(value: u32) -> Result<u32> {
    let rem = value % 128;
    if rem == 0 {
        Ok(value)
    } else {
        value
            .checked_add(128 - rem)
            .ok_or_else(|| MunboxError::BadParameter("MacBinary fork length overflow".into()))
    }
}

fn detect_version(data: &[u8]) -> Option<Version> {
    if data.len() < 128 || data[0] != 0 {
        return None;
    }
    if ReadScope::new(&data[102..][..4]).read::<U32Be>() == Ok(MBIN_SIG) {
        return Some(Version::III);
    }
    if data[74] != 0 || data[82] != 0 {
        return None;
    }
    let crc = u16::from_be_bytes(data[124..][..2].try_into().unwrap());
    let crc_table: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);
    if crc == crc_table.checksum(&data[..124]) {
        return Some(Version::II);
    }
    let data_fork_len = u32::from_be_bytes(data[83..][..4].try_into().unwrap());
    let rsrc_fork_len = u32::from_be_bytes(data[87..][..4].try_into().unwrap());
    let macbinary1 = data[101..=125].iter().all(|b| *b == 0)
        && (1..=63).contains(&data[2])
        && data_fork_len <= 0x007F_FFFF
        && rsrc_fork_len <= 0x007F_FFFF;
    macbinary1.then_some(Version::I)
}

/// Recognize the leading bytes of a fork as one of the StuffIt magics (spec
/// §9's "prefer resource fork when it looks like SIT" heuristic). Grounded
/// on `looks_like_sit` in the C reference's `bin.c`.
fn looks_like_sit(buf: &[u8]) -> bool {
    if buf.len() >= 78
        && &buf[0..16] == b"StuffIt (c)1997-"
        && &buf[20..78] == b" Aladdin Systems, Inc., http://www.aladdinsys.com/StuffIt/"
    {
        return true;
    }
    const CLASSIC_MAGICS: &[&[u8; 4]] = &[
        b"SIT!", b"ST46", b"ST50", b"ST60", b"ST65", b"STin", b"STi2", b"STi3", b"STi4",
    ];
    buf.len() >= 4 && CLASSIC_MAGICS.iter().any(|m| &buf[0..4] == *m)
}

/// Which fork is currently positioned.
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

pub struct BinLayer {
    inner: Box<dyn Layer>,
    header: Header,
    data_fork: Vec<u8>,
    rsrc_fork: Vec<u8>,
    cursor: Cursor,
    read_pos: usize,
    /// Spec §9 open question 2: if `true` (the default) and the data fork
    /// does not look like a StuffIt archive while the resource fork does,
    /// `open(First)` streams the resource fork instead of the data fork —
    /// compatibility with `.sea.bin` self-extracting archives whose real
    /// payload lives in the resource fork. Toggleable per spec's
    /// instruction; not part of the MacBinary specification itself.
    sniff_resource_fork: bool,
}

/// Detect and construct the MacBinary transformer (spec §4.4). Returns
/// `ProbeOutcome::Unrecognized` (not an error) when `input` is not
/// MacBinary-shaped, handing the untouched input back per the crate's
/// `format_unrecognized` convention (spec §9).
///
/// Whole-archive buffering here mirrors the archive-layer convention (spec
/// §3 "Lifecycles"): MacBinary's header gives no way to know fork lengths
/// without reading the whole thing, so there is nothing to gain from
/// pretending this is a streaming transformer.
pub fn probe(input: Box<dyn Layer>) -> Result<ProbeOutcome> {
    probe_with_options(input, true)
}

/// Like [`probe`], but with explicit control over the §9 resource-fork
/// sniffing heuristic.
pub fn probe_with_options(mut input: Box<dyn Layer>, sniff_resource_fork: bool) -> Result<ProbeOutcome> {
    let mut info = FileInfo::untitled(ForkKind::Data, 0);
    if input.open(OpenWhich::First, &mut info)? == OpenOutcome::End {
        return Ok(ProbeOutcome::Unrecognized(input));
    }
    let raw = read_fork_to_end(input.as_mut(), 256)?;

    let Some(version) = detect_version(&raw) else {
        return Ok(ProbeOutcome::Unrecognized(input));
    };

    let crc_data = &raw[..124];
    let header = ReadScope::new(&raw).read::<Header>()?;

    let crc_table: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);
    if version >= Version::II && crc_table.checksum(crc_data) != header.crc {
        return Err(MunboxError::ChecksumMismatch {
            context: "MacBinary header".into(),
            expected: header.crc as u32,
            computed: crc_table.checksum(crc_data) as u32,
        });
    }

    let mut pos = 128usize;
    pos += usize::num_from(next_multiple_of_128(header.secondary_header_len as u32)?);

    let data_len = usize::num_from(header.data_fork_len);
    let data_fork = raw
        .get(pos..pos + data_len)
        .ok_or_else(|| MunboxError::TruncatedInput("MacBinary data fork".into()))?
        .to_vec();
    pos += usize::num_from(next_multiple_of_128(header.data_fork_len)?);

    let rsrc_len = usize::num_from(header.rsrc_fork_len);
    let rsrc_fork = raw
        .get(pos..pos + rsrc_len)
        .ok_or_else(|| MunboxError::TruncatedInput("MacBinary resource fork".into()))?
        .to_vec();

    Ok(ProbeOutcome::Recognized(Box::new(BinLayer {
        inner: input,
        header,
        data_fork,
        rsrc_fork,
        cursor: Cursor::NotStarted,
        read_pos: 0,
        sniff_resource_fork,
    })))
}

impl BinLayer {
    fn filename(&self) -> String {
        String::from_macroman(&self.header.filename)
    }
}

impl Layer for BinLayer {
    fn open(&mut self, which: OpenWhich, info: &mut FileInfo) -> Result<OpenOutcome> {
        let finder_flags = sanitize_finder_flags(
            ((self.header.finder_flags as u16) << 8) | self.header.finder_flags2 as u16,
        );
        let prefer_resource = self.sniff_resource_fork
            && !self.rsrc_fork.is_empty()
            && !looks_like_sit(&self.data_fork)
            && looks_like_sit(&self.rsrc_fork);
        let order: [ForkKind; 2] = if prefer_resource {
            if which == OpenWhich::First {
                debug!(
                    "{}: data fork doesn't look like StuffIt but resource fork does, streaming resource fork first",
                    self.filename()
                );
            }
            [ForkKind::Resource, ForkKind::Data]
        } else {
            [ForkKind::Data, ForkKind::Resource]
        };

        // Position just past whatever fork `self.cursor` currently names in
        // `order`, so `Next` resumes after it; `First` always starts at 0.
        let mut idx = match which {
            OpenWhich::First => 0,
            OpenWhich::Next => order
                .iter()
                .position(|k| Some(*k) == self.cursor.fork_kind())
                .map(|i| i + 1)
                .unwrap_or(order.len()),
        };

        while idx < order.len() {
            let kind = order[idx];
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
                filename: self.filename(),
                file_type: self.header.file_type,
                creator: self.header.file_creator,
                finder_flags,
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
                    "read() called before open() on MacBinary layer".into(),
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

// `self.inner` is kept alive only for the duration this layer owns the
// underlying input; there is nothing further to read from it once the
// whole archive has been buffered, so no explicit drop glue is needed
// beyond the default field-wise one.
impl Drop for BinLayer {
    fn drop(&mut self) {
        let _ = &self.inner;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemSource;

    fn sample_header(data_len: u32, rsrc_len: u32) -> Vec<u8> {
        let mut h = vec![0u8; 128];
        h[1] = 4; // filename length
        h[2..6].copy_from_slice(b"Test");
        h[65..69].copy_from_slice(b"TEXT");
        h[69..73].copy_from_slice(b"ttxt");
        h[83..87].copy_from_slice(&data_len.to_be_bytes());
        h[87..91].copy_from_slice(&rsrc_len.to_be_bytes());
        let crc_table: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);
        let crc = crc_table.checksum(&h[..124]);
        h[124..126].copy_from_slice(&crc.to_be_bytes());
        h
    }

    #[test]
    fn finder_flags_clears_reserved_bits() {
        // bits 0,1,8,9,10 set, plus one bit (2) that should survive.
        let raw: u16 = 0b0000_0111_0000_0111;
        let sanitized = sanitize_finder_flags(raw);
        assert_eq!(sanitized, 0b0000_0000_0000_0100);
    }

    #[test]
    fn detects_macbinary_ii_via_crc() {
        let mut archive = sample_header(5, 0);
        archive.extend_from_slice(b"hello");
        archive.extend(std::iter::repeat(0u8).take(123)); // pad to 128
        let src = MemSource::new(archive);
        let layer = probe(Box::new(src)).unwrap();
        assert!(matches!(layer, ProbeOutcome::Recognized(_)));
    }

    #[test]
    fn non_macbinary_input_is_unrecognized() {
        let src = MemSource::new(b"not a macbinary file at all, too short".to_vec());
        let layer = probe(Box::new(src)).unwrap();
        assert!(matches!(layer, ProbeOutcome::Unrecognized(_)));
    }

    #[test]
    fn data_then_resource_fork_iteration() {
        let mut archive = sample_header(5, 3);
        archive.extend_from_slice(b"hello");
        archive.extend(std::iter::repeat(0u8).take(123)); // pad data fork to 128
        archive.extend_from_slice(b"abc");
        archive.extend(std::iter::repeat(0u8).take(125)); // pad rsrc fork to 128
        let src = MemSource::new(archive);
        let mut layer = match probe(Box::new(src)).unwrap() {
            ProbeOutcome::Recognized(layer) => layer,
            ProbeOutcome::Unrecognized(_) => panic!("expected MacBinary to be recognized"),
        };

        let mut info = FileInfo::untitled(ForkKind::Data, 0);
        assert_eq!(
            layer.open(OpenWhich::First, &mut info).unwrap(),
            OpenOutcome::Present
        );
        assert_eq!(info.fork_kind, ForkKind::Data);
        let mut buf = [0u8; 5];
        assert_eq!(layer.read(&mut buf).unwrap(), 5);
        assert_eq!(&buf, b"hello");

        assert_eq!(
            layer.open(OpenWhich::Next, &mut info).unwrap(),
            OpenOutcome::Present
        );
        assert_eq!(info.fork_kind, ForkKind::Resource);
        let mut buf2 = [0u8; 3];
        assert_eq!(layer.read(&mut buf2).unwrap(), 3);
        assert_eq!(&buf2, b"abc");

        assert_eq!(
            layer.open(OpenWhich::Next, &mut info).unwrap(),
            OpenOutcome::End
        );
    }

    #[test]
    fn sniffs_resource_fork_for_sea_bin_style_archives() {
        let mut sit_payload = b"SIT!".to_vec();
        sit_payload.extend(std::iter::repeat(0u8).take(18));
        sit_payload.extend_from_slice(b"rLau");
        sit_payload.extend(std::iter::repeat(0u8).take(4));

        let mut archive = sample_header(5, sit_payload.len() as u32);
        archive.extend_from_slice(b"plain"); // data fork: not SIT-shaped
        archive.extend(std::iter::repeat(0u8).take(123));
        archive.extend_from_slice(&sit_payload);
        let pad = (128 - sit_payload.len() % 128) % 128;
        archive.extend(std::iter::repeat(0u8).take(pad));

        let src = MemSource::new(archive);
        let mut layer = match probe(Box::new(src)).unwrap() {
            ProbeOutcome::Recognized(layer) => layer,
            ProbeOutcome::Unrecognized(_) => panic!("expected MacBinary to be recognized"),
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
    fn sniff_disabled_keeps_data_fork_first() {
        let mut sit_payload = b"SIT!".to_vec();
        sit_payload.extend(std::iter::repeat(0u8).take(18));
        sit_payload.extend_from_slice(b"rLau");
        sit_payload.extend(std::iter::repeat(0u8).take(4));

        let mut archive = sample_header(5, sit_payload.len() as u32);
        archive.extend_from_slice(b"plain");
        archive.extend(std::iter::repeat(0u8).take(123));
        archive.extend_from_slice(&sit_payload);
        let pad = (128 - sit_payload.len() % 128) % 128;
        archive.extend(std::iter::repeat(0u8).take(pad));

        let src = MemSource::new(archive);
        let mut layer = match probe_with_options(Box::new(src), false).unwrap() {
            ProbeOutcome::Recognized(layer) => layer,
            ProbeOutcome::Unrecognized(_) => panic!("expected MacBinary to be recognized"),
        };

        let mut info = FileInfo::untitled(ForkKind::Data, 0);
        assert_eq!(
            layer.open(OpenWhich::First, &mut info).unwrap(),
            OpenOutcome::Present
        );
        assert_eq!(info.fork_kind, ForkKind::Data);
    }

    #[test]
    fn trivial_archive_with_both_forks_empty_opens_to_end() {
        let archive = sample_header(0, 0);
        let src = MemSource::new(archive);
        let mut layer = match probe(Box::new(src)).unwrap() {
            ProbeOutcome::Recognized(layer) => layer,
            ProbeOutcome::Unrecognized(_) => panic!("expected MacBinary to be recognized"),
        };

        let mut info = FileInfo::untitled(ForkKind::Data, 0);
        assert_eq!(
            layer.open(OpenWhich::First, &mut info).unwrap(),
            OpenOutcome::End
        );
    }

    #[test]
    fn empty_data_fork_with_resource_fork_yields_resource_first() {
        let mut archive = sample_header(0, 3);
        archive.extend_from_slice(b"abc");
        archive.extend(std::iter::repeat(0u8).take(125)); // pad rsrc fork to 128
        let src = MemSource::new(archive);
        let mut layer = match probe(Box::new(src)).unwrap() {
            ProbeOutcome::Recognized(layer) => layer,
            ProbeOutcome::Unrecognized(_) => panic!("expected MacBinary to be recognized"),
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
}
