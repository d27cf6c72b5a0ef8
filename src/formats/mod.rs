//! Source-format transformers and archive layers (spec §4.3-§4.7).

pub mod bin;
pub mod cpt;
pub mod hqx;
pub mod sit;
