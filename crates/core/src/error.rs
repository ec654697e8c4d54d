//! Error taxonomy shared by the engine, the cluster layer and mods.
//!
//! `Error` is serializable so a mod's failure crosses the process boundary
//! with its code intact.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
#[serde(tag = "code", content = "message", rename_all = "snake_case")]
pub enum Error {
    /// Commit-time conflict. The pipeline retries the whole pass on this.
    #[error("aborted: {0}")]
    Aborted(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("failed precondition: {0}")]
    FailedPrecondition(String),
    #[error("unavailable: {0}")]
    Unavailable(String),
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),
    #[error("internal: {0}")]
    Internal(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    pub fn is_aborted(&self) -> bool { matches!(self, Error::Aborted(_)) }

    pub fn is_not_found(&self) -> bool { matches!(self, Error::NotFound(_)) }

    pub fn message(&self) -> &str {
        match self {
            Error::Aborted(m)
            | Error::NotFound(m)
            | Error::InvalidArgument(m)
            | Error::FailedPrecondition(m)
            | Error::Unavailable(m)
            | Error::DeadlineExceeded(m)
            | Error::Internal(m) => m,
        }
    }

    /// Prefix the message with `ctx`, keeping the error code.
    pub fn context(self, ctx: impl std::fmt::Display) -> Self {
        let wrap = |m: String| format!("{ctx}: {m}");
        match self {
            Error::Aborted(m) => Error::Aborted(wrap(m)),
            Error::NotFound(m) => Error::NotFound(wrap(m)),
            Error::InvalidArgument(m) => Error::InvalidArgument(wrap(m)),
            Error::FailedPrecondition(m) => Error::FailedPrecondition(wrap(m)),
            Error::Unavailable(m) => Error::Unavailable(wrap(m)),
            Error::DeadlineExceeded(m) => Error::DeadlineExceeded(wrap(m)),
            Error::Internal(m) => Error::Internal(wrap(m)),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self { Error::InvalidArgument(format!("decoding object: {e}")) }
}
