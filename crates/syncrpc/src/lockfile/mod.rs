//! Lock-file channel: the warm-path response handoff.
//!
//! Each warm call owns a pair of files in the session's lock directory:
//!
//! - **signal file** (`response-<request id>.json`): the response metadata. It is
//!   created writable and flipped to read-only once fully written; read-only is the
//!   only readiness signal.
//! - **content file** (`<signal file>.content`): raw bytes of any binary payload,
//!   written and marked read-only before the signal file.
//!
//! The worker writes ([`LockWriter`]), the client waits and consumes
//! ([`LockReader`]) and then deletes both files whatever the outcome.

mod reader;
mod writer;

use std::ffi::OsString;
use std::fs::Permissions;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::bridge::protocol::{Handoff, RequestId, Response};
use crate::payload::PayloadError;

pub use reader::LockReader;
pub use writer::LockWriter;

/// Default bound on both sides of the channel.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("timed out after {waited:?} waiting for lock file {path:?}")]
    Timeout { path: PathBuf, waited: Duration },

    /// The writer went away before the signal file became ready.
    #[error("writer went away before lock file {path:?} was ready")]
    Abandoned { path: PathBuf },

    #[error("lock file I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("malformed lock file: {0}")]
    Decode(#[from] serde_json::Error),

    #[error(transparent)]
    Payload(#[from] PayloadError),
}

/// Signal/content file locations for one call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockPaths {
    signal: PathBuf,
    content: PathBuf,
}

impl LockPaths {
    /// Derive the pair from a signal path. The content path appends `.content` to
    /// the signal file name, so the two can never coincide.
    pub fn from_signal(signal: impl Into<PathBuf>) -> Self {
        let signal = signal.into();
        let mut name = signal
            .file_name()
            .map(OsString::from)
            .unwrap_or_else(|| OsString::from("response"));
        name.push(".content");
        let content = signal.with_file_name(name);
        Self { signal, content }
    }

    pub fn for_request(dir: &Path, id: RequestId) -> Self {
        Self::from_signal(dir.join(format!("response-{id}.json")))
    }

    pub fn signal(&self) -> &Path {
        &self.signal
    }

    pub fn content(&self) -> &Path {
        &self.content
    }

    pub fn handoff(&self) -> Handoff {
        Handoff {
            signal_path: self.signal.clone(),
        }
    }
}

/// What the signal file holds: the response with binary payloads replaced by
/// content references, plus the content file location when there is one.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockRecord {
    #[serde(flatten)]
    response: Response,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    content_path: Option<PathBuf>,
}

/// True once `path` exists and has been marked read-only.
pub fn is_ready(path: &Path) -> io::Result<bool> {
    match std::fs::metadata(path) {
        Ok(meta) => Ok(meta.is_file() && meta.permissions().readonly()),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

fn read_only(mut permissions: Permissions) -> Permissions {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        permissions.set_mode(0o444);
    }
    #[cfg(not(unix))]
    permissions.set_readonly(true);
    permissions
}

fn remove_file(path: &Path) -> io::Result<()> {
    // Windows refuses to delete read-only files.
    #[cfg(windows)]
    if let Ok(meta) = std::fs::metadata(path) {
        let mut permissions = meta.permissions();
        permissions.set_readonly(false);
        let _ = std::fs::set_permissions(path, permissions);
    }
    match std::fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Delete both files of a pair. Missing files are not an error.
pub fn remove_pair(paths: &LockPaths) -> io::Result<()> {
    let content = remove_file(paths.content());
    remove_file(paths.signal())?;
    content
}
