//! The detection pipeline (spec §4.1/§4.9): repeatedly try each registered
//! factory against the current layer chain until one recognizes the input,
//! wrapping it; stop when no factory recognizes the current layer. The
//! ordered factory list matches the specification's literal registry.

use log::{debug, trace};

use crate::error::Result;
use crate::formats::{bin, cpt, hqx, sit};
use crate::layer::{Factory, Layer, ProbeOutcome};

const FACTORIES: &[(&str, Factory)] = &[
    ("sit_classic", sit::classic::probe),
    ("sit5", sit::sit5::probe),
    ("hqx", hqx::probe),
    ("bin", bin::probe),
    ("cpt", cpt::probe),
];

/// Wrap `input` in every transformer/archive layer that recognizes it, in
/// registry order, until none do. Each factory that declines hands the
/// input layer back unchanged (its own `open(First)` having rewound it),
/// so the next factory in the list always sees the same bytes from the
/// start. Returns the final, outermost wrapped layer ready for
/// `open`/`read` iteration.
pub fn detect_and_wrap(mut input: Box<dyn Layer>) -> Result<Box<dyn Layer>> {
    'outer: loop {
        for (name, factory) in FACTORIES {
            match factory(input)? {
                ProbeOutcome::Recognized(wrapped) => {
                    debug!("{name}: recognized, wrapping");
                    input = wrapped;
                    continue 'outer;
                }
                ProbeOutcome::Unrecognized(returned) => {
                    trace!("{name}: declined");
                    input = returned;
                }
            }
        }
        return Ok(input);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::MemSource;

    #[test]
    fn unrecognized_input_passes_through_unwrapped() {
        let src = MemSource::new(b"plain data, no known archive format".to_vec());
        let layer = detect_and_wrap(Box::new(src)).unwrap();
        let mut info = crate::layer::FileInfo::untitled(crate::layer::ForkKind::Data, 0);
        let mut layer = layer;
        assert_eq!(
            layer.open(crate::layer::OpenWhich::First, &mut info).unwrap(),
            crate::layer::OpenOutcome::Present
        );
    }
}
