//! Error handling for the clutch scheduler crates.

use core::fmt;

/// Common error type used throughout the scheduler and simulator.
///
/// Errors describe illegal input rejected at construction or at a quiescent
/// mutation point. Invariant violations inside the scheduler are programming
/// errors and abort with a diagnostic instead of surfacing here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Invalid argument
    InvalidArgument(String),
    /// Operation not valid in the current state
    InvalidState(String),
    /// Resource not found
    NotFound(String),
    /// Identifier already in use
    AlreadyExists(String),
    /// Configuration error
    ConfigError(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::InvalidArgument(msg) => write!(f, "Invalid argument: {}", msg),
            Error::InvalidState(msg) => write!(f, "Invalid state: {}", msg),
            Error::NotFound(msg) => write!(f, "Not found: {}", msg),
            Error::AlreadyExists(msg) => write!(f, "Already exists: {}", msg),
            Error::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
        }
    }
}

impl std::error::Error for Error {}

/// Common result type used throughout the scheduler and simulator.
pub type Result<T> = core::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_message() {
        let err = Error::InvalidArgument("rt_period must be positive".into());
        assert_eq!(
            err.to_string(),
            "Invalid argument: rt_period must be positive"
        );
    }
}
