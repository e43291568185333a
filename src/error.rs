use thiserror::Error;

/// Errors surfaced while assembling the matcher or feeding it inputs.
///
/// Construction problems (`UnknownWeightProfile`, `WeightShape`) are reported
/// eagerly by [`crate::SuperGlue::new`] rather than on first use. `ShapeMismatch`
/// is the only call-time error; degenerate inputs (zero keypoints) are not
/// errors and take the bypass path instead.
#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown weight profile {name:?}, expected \"indoor\" or \"outdoor\"")]
    UnknownWeightProfile { name: String },

    #[error("unknown graph layer kind {name:?}, expected \"self\" or \"cross\"")]
    UnknownLayerKind { name: String },

    #[error("weight shape for {what}: expected {expected}, found {found}")]
    WeightShape {
        what: &'static str,
        expected: String,
        found: String,
    },

    #[error("input shape for {what}: expected {expected}, found {found}")]
    ShapeMismatch {
        what: &'static str,
        expected: String,
        found: String,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
