use thiserror::Error;

/// Errors that can escape the scheduling engine.
///
/// Failures of the executed command itself are never represented here; they
/// are captured into the run's stderr and its success flag.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The job does not say unambiguously what to run.
    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    /// The recurrence parameters are unusable (bad value, unknown key, out of range).
    #[error("Invalid recurrence: {0}")]
    InvalidRecurrence(String),

    /// Unrecognised frequency name.
    #[error("Unknown frequency: {0}")]
    UnknownFrequency(String),

    /// No job with the given ID exists in the store.
    #[error("Job not found: {id}")]
    JobNotFound { id: String },

    /// The repository collaborator failed.
    #[error("Storage error: {0}")]
    Storage(String),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Failure reported by a [`crate::notify::Notifier`]. Logged by the engine,
/// never propagated.
#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Notification transport failed: {0}")]
    Transport(String),

    #[error("Invalid recipient: {0}")]
    InvalidRecipient(String),
}
