use thiserror::Error;

/// Errors reported by the finder and the free-energy layer.
///
/// Only invalid inputs and invalid configuration are errors; failing to
/// converge within the step budget is reported through the diagnostics
/// instead.
#[derive(Debug, Error)]
pub enum FinderError {
    /// An input array is inconsistent with the frozen system sizes.
    #[error("shape mismatch: {0}")]
    Shape(String),

    /// A volume fraction is outside its physical range.
    #[error("invalid volume fractions: {0}")]
    VolumeFraction(String),

    /// An option value the solver cannot act on.
    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type FinderResult<T> = Result<T, FinderError>;
