//! Error taxonomy shared by the scheduler, the tagged heap and the frame driver.

use thiserror::Error;

/// Errors reported by riven.
///
/// Errors raised while bootstrapping are fatal to startup and are returned
/// synchronously. Errors inside a running tear are the tear's own business;
/// the scheduler never sees them.
#[derive(Debug, Error)]
pub enum RivenError {
    /// A null procedure, a bad alignment, or a hint outside its legal range.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The tagged heap or the fiber pool could not satisfy a request.
    #[error("out of memory: {what} ({requested} bytes requested)")]
    OutOfMemory { what: &'static str, requested: usize },

    /// The buffer handed to bootstrap is smaller than the queried size.
    #[error("bootstrap buffer holds {supplied} bytes but {required} are required")]
    InsufficientMemory { required: usize, supplied: usize },

    /// A required frame stage callback was not supplied.
    #[error("missing callback: {0}")]
    MissingCallback(&'static str),

    /// No candidate backend of the requested kind could be initialized.
    #[error("no working backend for {0}")]
    NoFallback(&'static str),

    #[error("feature unsupported: {0}")]
    FeatureUnsupported(String),

    #[error("failed to spawn worker thread")]
    ThreadSpawn(#[source] std::io::Error),

    #[error("{0} worker thread(s) panicked")]
    WorkerPanicked(usize),
}

impl RivenError {
    /// Stable result code for the C API. Zero is reserved for success.
    pub fn code(&self) -> i32 {
        match self {
            RivenError::InvalidArgument(_) => -1,
            RivenError::OutOfMemory { .. } => -2,
            RivenError::InsufficientMemory { .. } => -2,
            RivenError::MissingCallback(_) => -3,
            RivenError::NoFallback(_) => -4,
            RivenError::FeatureUnsupported(_) => -5,
            RivenError::ThreadSpawn(_) => -6,
            RivenError::WorkerPanicked(_) => -7,
        }
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        RivenError::InvalidArgument(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, RivenError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_negative() {
        let errors = [
            RivenError::invalid("x"),
            RivenError::OutOfMemory {
                what: "slab",
                requested: 1,
            },
            RivenError::InsufficientMemory {
                required: 2,
                supplied: 1,
            },
            RivenError::MissingCallback("simulation"),
            RivenError::NoFallback("audio"),
            RivenError::FeatureUnsupported("x".into()),
            RivenError::WorkerPanicked(1),
        ];
        for e in &errors {
            assert!(e.code() < 0, "{e} should map to a negative code");
        }
    }

    #[test]
    fn test_insufficient_memory_message() {
        let e = RivenError::InsufficientMemory {
            required: 4096,
            supplied: 100,
        };
        assert_eq!(
            e.to_string(),
            "bootstrap buffer holds 100 bytes but 4096 are required"
        );
    }
}
