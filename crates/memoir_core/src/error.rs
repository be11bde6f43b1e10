use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

/// Typed failure taxonomy for narrative operations.
///
/// Backend and timeout failures on the full-generation path are recovered
/// internally via the fallback generator and never reach callers; the
/// variants exist for the incremental path and for logs. Conflict and
/// context errors are always surfaced so the caller can decide whether to
/// retry the whole read-decide-write cycle.
#[derive(Debug, Error)]
pub enum NarrativeError {
    /// The memory list was empty and the caller forbade the fallback
    /// narrative. Recoverable by allowing the fallback.
    #[error("invalid generation context: {0}")]
    InvalidContext(String),

    /// The text backend failed after retries.
    #[error("text generation backend failed: {0}")]
    GenerationBackend(String),

    /// The text backend did not answer within the configured bound. The
    /// operation aborted with no persistence write.
    #[error("text generation timed out after {0:?}")]
    GenerationTimeout(Duration),

    /// A concurrent writer changed the biography between read and write.
    /// Retry the whole cycle; never merge partial results.
    #[error("concurrent biography write detected for user {0}")]
    PersistenceConflict(Uuid),

    /// Reserved for a strict assignment policy that rejects overlapping
    /// chapter age ranges. The default policy tie-breaks deterministically
    /// (lowest sequence wins) and never raises this.
    #[error("ambiguous chapter assignment: {0}")]
    AssignmentAmbiguity(String),

    /// Infrastructure failure (database, serialization).
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}
