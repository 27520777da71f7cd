use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by this crate.
///
/// Only construction can fail: inconsistent configuration refuses to build
/// the component. Malformed runtime input (feedback for unknown sequence
/// numbers, duplicate acknowledgments) is dropped and logged instead of
/// being returned as an error.
#[derive(Error, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    #[error("invalid congestion detector config: {0}")]
    ErrInvalidDetectorConfig(String),
    #[error("invalid nack tracker config: {0}")]
    ErrInvalidNackTrackerConfig(String),
}
