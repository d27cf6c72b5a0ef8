//! The `munbox` CLI: an external driver over the `munbox` library (spec
//! §6.4). Not part of the decode core — it just wires a file source into
//! [`munbox::pipeline::detect_and_wrap`] and writes out what comes back.

use std::fs;
use std::path::{Path, PathBuf};

use clap::Parser;
use log::{debug, warn};

use munbox::error::{MunboxError, Result};
use munbox::layer::{FileInfo, ForkKind, Layer, OpenOutcome, OpenWhich};
use munbox::pipeline::detect_and_wrap;
use munbox::source::FileSource;

/// Extract legacy Macintosh archive/encapsulation files (BinHex, MacBinary,
/// Compact Pro, StuffIt classic, StuffIt 5).
#[derive(Parser)]
#[command(name = "munbox", version, about)]
struct Args {
    /// Archive or encapsulated files to decode.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// Directory to write extracted entries into (default: current directory).
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Preserve resource forks and Finder metadata as `._name` AppleDouble
    /// side-car files, instead of discarding resource forks.
    #[arg(long)]
    apple_double: bool,
}

fn main() {
    env_logger::init();
    let args = Args::parse();

    let mut failed = false;
    for input in &args.inputs {
        if let Err(err) = process_one(input, &args) {
            eprintln!("munbox: {}: {err}", input.display());
            failed = true;
        }
    }

    if failed {
        std::process::exit(1);
    }
}

fn process_one(input: &Path, args: &Args) -> Result<()> {
    let out_dir = args.output.as_deref().unwrap_or_else(|| Path::new("."));

    let source = FileSource::open(input)?;
    let mut layer = detect_and_wrap(Box::new(source))?;

    let mut info = FileInfo::untitled(ForkKind::Data, 0);
    let mut which = OpenWhich::First;

    loop {
        let outcome = layer.open(which, &mut info)?;
        if outcome == OpenOutcome::End {
            break;
        }
        which = OpenWhich::Next;

        let bytes = read_fork(layer.as_mut())?;
        debug!(
            "{}: {} fork, {} bytes",
            info.filename,
            fork_label(info.fork_kind),
            bytes.len()
        );

        match info.fork_kind {
            ForkKind::Data => write_data_fork(out_dir, &info, &bytes)?,
            ForkKind::Resource if args.apple_double => write_apple_double(out_dir, &info, &bytes)?,
            ForkKind::Resource => warn!("{}: discarding resource fork", info.filename),
        }
    }

    Ok(())
}

fn fork_label(kind: ForkKind) -> &'static str {
    match kind {
        ForkKind::Data => "data",
        ForkKind::Resource => "resource",
    }
}

fn read_fork(layer: &mut dyn Layer) -> Result<Vec<u8>> {
    let mut out = Vec::new();
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

/// Join `filename` (a `/`-separated path from inside an archive) onto
/// `out_dir`, rejecting `..` and absolute components so a crafted entry
/// can't escape the output root (spec.md §3: "the driver is responsible").
fn entry_path(out_dir: &Path, filename: &str) -> Result<PathBuf> {
    use std::path::Component;

    let mut path = out_dir.to_path_buf();
    for component in Path::new(filename).components() {
        match component {
            Component::Normal(part) => path.push(part),
            Component::CurDir => {}
            Component::ParentDir | Component::RootDir | Component::Prefix(_) => {
                return Err(MunboxError::BadParameter(format!(
                    "entry path {filename:?} escapes the output directory"
                )));
            }
        }
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(MunboxError::Io)?;
    }
    Ok(path)
}

fn write_data_fork(out_dir: &Path, info: &FileInfo, data: &[u8]) -> Result<()> {
    let path = entry_path(out_dir, &info.filename)?;
    fs::write(path, data).map_err(MunboxError::Io)?;
    Ok(())
}

/// Write a `._name` AppleDouble side-car: a Finder Info entry (file type,
/// creator, Finder flags) and a Resource Fork entry, per spec §6.4.
fn write_apple_double(out_dir: &Path, info: &FileInfo, rsrc_fork: &[u8]) -> Result<()> {
    const MAGIC: u32 = 0x0005_1607;
    const VERSION: u32 = 0x0002_0000;
    const ENTRY_FINDER_INFO: u32 = 9;
    const ENTRY_RESOURCE_FORK: u32 = 2;
    const FINDER_INFO_LEN: u32 = 32;

    let header_len = 4 + 4 + 16 + 2; // magic, version, filler, num_entries
    let descriptor_len = 2 * (4 + 4 + 4);
    let finder_info_offset = (header_len + descriptor_len) as u32;
    let rsrc_offset = finder_info_offset + FINDER_INFO_LEN;

    let mut out = Vec::with_capacity(rsrc_offset as usize + rsrc_fork.len());
    out.extend_from_slice(&MAGIC.to_be_bytes());
    out.extend_from_slice(&VERSION.to_be_bytes());
    out.extend_from_slice(&[0u8; 16]);
    out.extend_from_slice(&2u16.to_be_bytes());

    out.extend_from_slice(&ENTRY_FINDER_INFO.to_be_bytes());
    out.extend_from_slice(&finder_info_offset.to_be_bytes());
    out.extend_from_slice(&FINDER_INFO_LEN.to_be_bytes());

    out.extend_from_slice(&ENTRY_RESOURCE_FORK.to_be_bytes());
    out.extend_from_slice(&rsrc_offset.to_be_bytes());
    out.extend_from_slice(&(rsrc_fork.len() as u32).to_be_bytes());

    out.extend_from_slice(&info.file_type.to_be_bytes());
    out.extend_from_slice(&info.creator.to_be_bytes());
    out.extend_from_slice(&info.finder_flags.to_be_bytes());
    out.extend_from_slice(&[0u8; 32 - 10]);

    out.extend_from_slice(rsrc_fork);

    let path = entry_path(out_dir, &info.filename)?;
    let side_car = side_car_path(&path);
    fs::write(side_car, out).map_err(MunboxError::Io)?;
    Ok(())
}

fn side_car_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("._{name}"))
}
