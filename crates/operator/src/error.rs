use thiserror::Error;

/// Failure of a single reconcile pass. Every variant is surfaced to the
/// controller runtime, which owns retry and backoff.
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to get Alpine: {0}")]
    Get(#[source] kube::Error),
    #[error("failed to list child pods: {0}")]
    List(#[source] IndexError),
    #[error("failed to update Alpine status: {0}")]
    StatusWrite(#[source] kube::Error),
    #[error("failed to construct pod: {0}")]
    Construct(#[source] ConstructError),
    #[error("failed to create pod: {0}")]
    Create(#[source] kube::Error),
    #[error("reconcile deadline exceeded before {0}")]
    DeadlineExceeded(&'static str),
    #[error("MissingObjectKey: {0}")]
    MissingObjectKey(&'static str),
}

impl Error {
    /// Short label used for metrics and event reasons.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Get(_) => "get",
            Self::List(_) => "list",
            Self::StatusWrite(_) => "status_write",
            Self::Construct(_) => "construct",
            Self::Create(_) => "create",
            Self::DeadlineExceeded(_) => "deadline",
            Self::MissingObjectKey(_) => "missing_key",
        }
    }
}

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("owner index has not completed its initial pod listing")]
    NotSynced,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConstructError {
    #[error("cannot set controller reference on pod for {0}: owner has no uid")]
    Ownership(String),
    #[error("Alpine is missing {0}")]
    MissingField(&'static str),
}

/// Returns true for the API server's `409 AlreadyExists`/`Conflict` answers.
pub fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(ae) if ae.code == 409)
}
