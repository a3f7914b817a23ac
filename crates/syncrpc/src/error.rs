use std::io;
use std::path::PathBuf;
use std::time::Duration;

use crate::bridge::protocol::{CallError, codes};
use crate::lockfile::LockError;
use crate::orchestrator::OrchestratorError;

/// Errors surfaced to callers of a [`RemoteFn`](crate::RemoteFn).
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The worker could not be started or reached. Fatal for the session.
    #[error("worker startup failed: {0}")]
    Startup(#[from] OrchestratorError),

    /// The blocking transport failed or returned something unreadable.
    #[error("{transport} transport failed: {detail}")]
    Transport {
        transport: &'static str,
        detail: String,
    },

    /// The callable (or the worker on its behalf) reported a failure.
    #[error(transparent)]
    Remote(#[from] CallError),

    #[error("no response in lock file {path:?} after {waited:?}")]
    LockTimeout { path: PathBuf, waited: Duration },

    #[error("worker exited before responding")]
    WorkerExited,

    /// The handle was issued by a worker that has since been shut down.
    #[error("handle belongs to a worker that is no longer running")]
    StaleHandle,

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Remote error code, if the failure came from the worker side.
    pub fn code(&self) -> Option<&str> {
        match self {
            Self::Remote(e) => Some(e.code()),
            _ => None,
        }
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote(_))
    }
}

impl From<LockError> for Error {
    fn from(e: LockError) -> Self {
        match e {
            LockError::Timeout { path, waited } => Self::LockTimeout { path, waited },
            LockError::Abandoned { .. } => Self::WorkerExited,
            LockError::Io(e) => Self::Io(e),
            LockError::Decode(e) => Self::Protocol(format!("malformed lock file: {e}")),
            LockError::Payload(e) => Self::Remote(CallError::new(codes::IO, e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_errors_keep_code() {
        let err = Error::from(CallError::new("E_FOO", "bad arg"));
        assert_eq!(err.code(), Some("E_FOO"));
        assert_eq!(err.to_string(), "E_FOO: bad arg");
        assert!(Error::WorkerExited.code().is_none());
    }

    #[test]
    fn lock_errors_map_to_call_outcomes() {
        let abandoned = LockError::Abandoned {
            path: PathBuf::from("/tmp/x.json"),
        };
        assert!(matches!(Error::from(abandoned), Error::WorkerExited));

        let timeout = LockError::Timeout {
            path: PathBuf::from("/tmp/x.json"),
            waited: Duration::from_secs(1),
        };
        assert!(matches!(Error::from(timeout), Error::LockTimeout { .. }));
    }
}
