//! munbox: a decoder for legacy Macintosh archive and encapsulation formats.
//!
//! Supports BinHex 4.0 (`.hqx`), MacBinary I/II/III (`.bin`), Compact Pro
//! (`.cpt`), and StuffIt classic and StuffIt 5 (`.sit`). Every supported
//! format is expressed as a [`Layer`]: a small trait with `open`/`read`,
//! so that a BinHex-wrapped MacBinary-wrapped StuffIt archive is just a
//! chain of layers, each unwrapping the one before it.
//!
//! ### Specifications:
//!
//! - [MacBinary I](https://web.archive.org/web/20050307030202/http://www.lazerware.com/formats/macbinary/macbinary.html)
//! - [MacBinary II](https://web.archive.org/web/20050305042909/http://www.lazerware.com/formats/macbinary/macbinary_ii.html)
//! - [MacBinary III](https://web.archive.org/web/20050305044255/http://www.lazerware.com/formats/macbinary/macbinary_iii.html)
//!
//! ### Other references:
//!
//! - [Detecting MacBinary format](https://entropymine.wordpress.com/2019/02/13/detecting-macbinary-format/)
//!
//! ## Example
//!
//! ```no_run
//! use munbox::source::FileSource;
//! use munbox::layer::{FileInfo, ForkKind, Layer, OpenOutcome, OpenWhich};
//!
//! # fn main() -> munbox::error::Result<()> {
//! let source = FileSource::open("archive.sit")?;
//! let mut layer = munbox::pipeline::detect_and_wrap(Box::new(source))?;
//!
//! let mut info = FileInfo::untitled(ForkKind::Data, 0);
//! let mut which = OpenWhich::First;
//! while layer.open(which, &mut info)? == OpenOutcome::Present {
//!     let mut buf = vec![0u8; info.length as usize];
//!     let mut read = 0;
//!     while read < buf.len() {
//!         let n = layer.read(&mut buf[read..])?;
//!         if n == 0 {
//!             break;
//!         }
//!         read += n;
//!     }
//!     which = OpenWhich::Next;
//! }
//! # Ok(())
//! # }
//! ```

pub(crate) mod binary;
pub mod crc16;
pub mod error;
pub mod formats;
pub mod layer;
pub mod macroman;
pub mod methods;
pub mod pipeline;
pub mod source;

pub use crate::error::{MunboxError, Result};
pub use crate::layer::{FileInfo, ForkKind, Layer, OpenOutcome, OpenWhich, ProbeOutcome};
pub use crate::pipeline::detect_and_wrap;
