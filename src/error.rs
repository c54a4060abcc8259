/// Errors that abort an episode.
///
/// Nothing in this crate retries: the triggering condition is returned to the caller, which may
/// decide to skip the episode.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum MetaError {
    /// A parameter vector does not have the expected number of elements.
    #[error("Parameter vector has {actual} elements, expected {expected}")]
    LengthMismatch {
        /// Expected number of elements.
        expected: usize,
        /// Received number of elements.
        actual: usize,
    },

    /// A named parameter was requested with the wrong rank.
    #[error("Parameter `{name}` has rank {actual}, requested rank {expected}")]
    RankMismatch {
        /// Name of the parameter.
        name: String,
        /// Requested rank.
        expected: usize,
        /// Rank recorded in the layout.
        actual: usize,
    },

    /// A parameter name that is not part of the layout.
    #[error("Unknown parameter `{0}`")]
    UnknownParam(String),

    /// The learner was used before parameters were injected into the given container.
    #[error("Learner has no {0} parameters loaded")]
    MissingParams(&'static str),

    /// Inputs and targets disagree on the number of samples.
    #[error("Got {inputs} input samples but {targets} target samples")]
    SampleMismatch {
        /// Number of input samples.
        inputs: usize,
        /// Number of target samples.
        targets: usize,
    },

    /// The learner produced a non-finite loss or gradient.
    #[error("Non-finite {quantity} at update {update}")]
    NonFinite {
        /// Either `loss` or `gradient`.
        quantity: &'static str,
        /// Index of the update within the episode.
        update: usize,
    },

    /// A recurrent state that does not fit the meta-learner it is given to.
    #[error("Incompatible state: {0}")]
    IncompatibleState(String),

    /// Invalid configuration value.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}
