//! The two StuffIt archive formats. Kept as two separate modules/factories
//! (spec §4.1's literal registry lists `sit_classic` and `sit5`
//! separately) even though the C reference combines them into one
//! `munbox_new_sit_layer` that dispatches on the magic it sees first: the
//! two on-disk layouts differ enough (fixed 112-byte headers with inline
//! folder markers vs. variable-length self-describing entries linked by
//! parent offsets) that sharing a single parsing module would mean
//! branching through most of it anyway.

pub mod classic;
pub mod sit5;
