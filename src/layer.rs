//! The polymorphic `Layer` contract (spec §2 / §4.9) that every source,
//! transformer and archive component in this crate implements.

use crate::error::Result;

/// Which fork/entry to position on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenWhich {
    First,
    Next,
}

/// Result of an `open` call: either a fork is now positioned and `info` was
/// filled in, or there is nothing more to open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenOutcome {
    Present,
    End,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForkKind {
    Data,
    Resource,
}

/// Metadata of the currently open fork (spec §3 `FileInfo`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub filename: String,
    pub file_type: u32,
    pub creator: u32,
    pub finder_flags: u16,
    pub length: u64,
    pub fork_kind: ForkKind,
    pub has_metadata: bool,
}

impl FileInfo {
    pub fn untitled(fork_kind: ForkKind, length: u64) -> Self {
        FileInfo {
            filename: String::from("untitled"),
            file_type: 0,
            creator: 0,
            finder_flags: 0,
            length,
            fork_kind,
            has_metadata: false,
        }
    }
}

/// A layer wraps an input (except for source layers, which have none) and
/// exposes a sequence of forks through the three-operation contract of
/// spec §2. `close` is expressed as `Drop`: an implementation's `Drop` impl
/// is expected to release the layer it owns, recursively, the same as the
/// C reference's `*_layer_close` functions do explicitly.
pub trait Layer {
    /// Position on the first/next fork. Must be called before any `read`.
    fn open(&mut self, which: OpenWhich, info: &mut FileInfo) -> Result<OpenOutcome>;

    /// Produce up to `buf.len()` decoded bytes of the currently open fork.
    /// Returns `0` at end-of-fork.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;
}

/// The result of a factory's probe: either it recognized the input and
/// took ownership, producing a wrapping layer, or it declined — handing
/// the (possibly partially read, since recognizing a format may require
/// reading it in full) input layer back so the pipeline can rewind it via
/// `open(First)` and offer it to the next factory.
pub enum ProbeOutcome {
    Recognized(Box<dyn Layer>),
    Unrecognized(Box<dyn Layer>),
}

/// A factory inspects (and may partially consume) `input` and either takes
/// ownership of it, returning a new wrapping layer, or declines —
/// format-unrecognized is structurally distinct from a hard error per spec
/// §9, so a factory only ever returns `Err` for a genuine parse failure
/// once it has committed to recognizing the format (e.g. a bad CRC).
pub type Factory = fn(Box<dyn Layer>) -> Result<ProbeOutcome>;

/// Read a layer's current fork to completion into a `Vec<u8>`. Used by
/// archive layers, which must buffer their entire input at construction
/// (spec §3 "Lifecycles").
pub fn read_fork_to_end(layer: &mut dyn Layer, hint: usize) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(hint.min(1 << 20));
    let mut chunk = [0u8; 64 * 1024];
    loop {
        let n = layer.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        out.extend_from_slice(&chunk[..n]);
    }
    Ok(out)
}
