use thiserror::Error;

/// An error a job body can fail with.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors surfaced by the limiter.
///
/// A reservation miss is not an error; misses drive escalation internally and
/// only surface as [`Error::ModelsExhausted`] once every candidate has been
/// tried.
#[derive(Debug, Error)]
pub enum Error {
    /// The limiter was constructed with an invalid configuration.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Every model in the escalation order was rejected by the backend or
    /// timed out waiting for capacity.
    #[error("all models rejected by backend or exhausted")]
    ModelsExhausted,

    /// The job body failed without delegating.
    #[error("job rejected: {0}")]
    JobRejected(BoxError),

    /// The limiter has been stopped; no new jobs are accepted and pending
    /// waiters complete with this error.
    #[error("limiter is shut down")]
    Shutdown,

    /// The distributed backend failed.
    #[error("backend error: {0}")]
    Backend(String),
}

/// Crate-wide result alias.
pub type Result<T, E = Error> = std::result::Result<T, E>;
