use std::time::Duration;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Error kinds surfaced by the engine and its collaborators.
///
/// Store and keeper implementations are expected to map their backend
/// failures onto these kinds so that the engine can tell a retryable
/// condition apart from a fatal one.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An entity lookup missed. The parser treats a missing dag template as
    /// fatal for the instance being parsed.
    #[error("{kind} `{id}` not found")]
    NotFound { kind: &'static str, id: String },

    /// An optimistic update lost the race. Retried with backoff for a
    /// bounded number of attempts.
    #[error("conflicting update on `{0}`")]
    Conflict(String),

    /// A transport-level failure that is worth retrying.
    #[error("transient failure: {0}")]
    Transient(String),

    /// The keeper reported too many consecutive heartbeat failures; dispatch
    /// is paused until it reconnects.
    #[error("keeper is disconnected")]
    KeeperDown,

    /// A dag template failed validation.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// An action stage exceeded its budget.
    #[error("deadline of {0:?} exceeded")]
    Timeout(Duration),

    /// The surrounding context was canceled.
    #[error("canceled")]
    Canceled,

    /// A non-nil error returned by an action. Only retryable through the
    /// `Retry` command.
    #[error("action failed: {0:#}")]
    Action(#[source] anyhow::Error),

    /// A programming error. Logged, the task fails, the instance continues.
    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn not_found(kind: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            id: id.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Whether the operation may succeed if simply tried again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Conflict(_) | Self::Transient(_))
    }
}

/// Rejections produced while validating a dag template.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("task list is empty")]
    Empty,

    #[error("duplicate task id `{0}`")]
    DuplicateTaskId(String),

    #[error("task `{task}` depends on unknown task `{depend}`")]
    UnknownDependency { task: String, depend: String },

    #[error("tasks form a cycle through {0:?}")]
    CycleDetected(Vec<String>),

    #[error("no action registered under `{0}`")]
    UnknownAction(String),

    #[error("dag template `{0}` is stopped")]
    DagStopped(String),

    #[error("{0}")]
    Malformed(String),
}
