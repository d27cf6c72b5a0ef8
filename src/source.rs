//! Source layers (spec §4.2): file-backed and memory-backed producers of a
//! single data fork with no metadata. Grounded on `file_layer_*`/`mem_layer_*`
//! in `munbox.c`.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use crate::error::{MunboxError, Result};
use crate::layer::{FileInfo, ForkKind, Layer, OpenOutcome, OpenWhich};

/// A source layer backed by an open file. Rewindable: `open(First)` seeks
/// back to the start regardless of prior reads, as required of source
/// layers so detection factories can re-probe (spec §3 invariants).
pub struct FileSource {
    file: File,
    opened: bool,
    len: u64,
}

impl FileSource {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        Ok(FileSource {
            file,
            opened: false,
            len,
        })
    }
}

impl Layer for FileSource {
    fn open(&mut self, which: OpenWhich, info: &mut FileInfo) -> Result<OpenOutcome> {
        match which {
            OpenWhich::First => {
                self.file.seek(SeekFrom::Start(0))?;
                self.opened = true;
                *info = FileInfo::untitled(ForkKind::Data, self.len);
                Ok(OpenOutcome::Present)
            }
            OpenWhich::Next => Ok(OpenOutcome::End),
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if !self.opened {
            return Err(MunboxError::BadParameter(
                "read() called before open() on file source".into(),
            ));
        }
        Ok(self.file.read(buf)?)
    }
}

/// A source layer backed by an in-memory buffer.
pub struct MemSource {
    data: Vec<u8>,
    pos: usize,
    opened: bool,
}

impl MemSource {
    pub fn new(data: Vec<u8>) -> Self {
        MemSource {
            data,
            pos: 0,
            opened: false,
        }
    }
}

impl Layer for MemSource {
    fn open(&mut self, which: OpenWhich, info: &mut FileInfo) -> Result<OpenOutcome> {
        match which {
            OpenWhich::First => {
                self.pos = 0;
                self.opened = true;
                *info = FileInfo::untitled(ForkKind::Data, self.data.len() as u64);
                Ok(OpenOutcome::Present)
            }
            OpenWhich::Next => Ok(OpenOutcome::End),
        }
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        if !self.opened {
            return Err(MunboxError::BadParameter(
                "read() called before open() on memory source".into(),
            ));
        }
        let remaining = &self.data[self.pos..];
        let n = remaining.len().min(buf.len());
        buf[..n].copy_from_slice(&remaining[..n]);
        self.pos += n;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mem_source_rewind_idempotence() {
        let mut src = MemSource::new(b"hello world".to_vec());
        let mut info = FileInfo::untitled(ForkKind::Data, 0);
        assert_eq!(
            src.open(OpenWhich::First, &mut info).unwrap(),
            OpenOutcome::Present
        );
        let mut buf = [0u8; 5];
        assert_eq!(src.read(&mut buf).unwrap(), 5);
        assert_eq!(&buf, b"hello");

        // Rewind and read again: identical sequence (spec §8 rewind idempotence).
        assert_eq!(
            src.open(OpenWhich::First, &mut info).unwrap(),
            OpenOutcome::Present
        );
        let mut buf2 = [0u8; 5];
        assert_eq!(src.read(&mut buf2).unwrap(), 5);
        assert_eq!(buf2, buf);
    }

    #[test]
    fn mem_source_open_next_is_end() {
        let mut src = MemSource::new(b"x".to_vec());
        let mut info = FileInfo::untitled(ForkKind::Data, 0);
        src.open(OpenWhich::First, &mut info).unwrap();
        assert_eq!(
            src.open(OpenWhich::Next, &mut info).unwrap(),
            OpenOutcome::End
        );
    }

    #[test]
    fn read_before_open_is_error() {
        let mut src = MemSource::new(b"x".to_vec());
        let mut buf = [0u8; 1];
        assert!(src.read(&mut buf).is_err());
    }
}
