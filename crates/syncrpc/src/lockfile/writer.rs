//! Worker side of the lock-file channel.

use std::io;
use std::path::Path;
use std::time::{Duration, Instant};

use tokio::fs;

use super::{DEFAULT_LOCK_TIMEOUT, LockError, LockPaths, LockRecord, read_only, remove_pair};
use crate::bridge::protocol::Response;
use crate::payload;

/// Writes responses into lock-file pairs.
///
/// If the signal path is still occupied the writer waits up to `timeout` for the
/// reader to clear it. Request ids make names unique per call, so an occupant that
/// outlives the timeout can only be left over from a reader that died; it is
/// replaced rather than blocking the worker forever.
#[derive(Debug, Clone)]
pub struct LockWriter {
    timeout: Duration,
    poll_interval: Duration,
}

impl Default for LockWriter {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_TIMEOUT, Duration::from_millis(5))
    }
}

impl LockWriter {
    pub fn new(timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            timeout,
            poll_interval,
        }
    }

    pub async fn write(&self, paths: &LockPaths, mut response: Response) -> Result<(), LockError> {
        self.wait_for_vacancy(paths).await?;

        let mut content = Vec::new();
        if let Some(value) = response.value.as_mut() {
            payload::extract_bytes(value, &mut content);
        }

        let content_path = if content.is_empty() {
            None
        } else {
            write_read_only(paths.content(), &content).await?;
            Some(paths.content().to_path_buf())
        };

        let record = LockRecord {
            response,
            content_path,
        };
        let metadata = serde_json::to_vec(&record)?;
        write_read_only(paths.signal(), &metadata).await?;

        tracing::trace!(
            path = %paths.signal().display(),
            content_bytes = content.len(),
            "Lock file ready"
        );
        Ok(())
    }

    async fn wait_for_vacancy(&self, paths: &LockPaths) -> Result<(), LockError> {
        let started = Instant::now();
        while fs::try_exists(paths.signal()).await? {
            if started.elapsed() >= self.timeout {
                tracing::warn!(
                    path = %paths.signal().display(),
                    waited_ms = started.elapsed().as_millis() as u64,
                    "Signal file never cleared, replacing stale occupant"
                );
                break;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
        // A stale content file would otherwise be spliced into this response.
        remove_pair(paths)?;
        Ok(())
    }
}

async fn write_read_only(path: &Path, data: &[u8]) -> io::Result<()> {
    fs::write(path, data).await?;
    let permissions = fs::metadata(path).await?.permissions();
    fs::set_permissions(path, read_only(permissions)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::CallError;
    use crate::lockfile::is_ready;
    use serde_json::json;

    #[tokio::test]
    async fn writes_signal_last_and_read_only() {
        let dir = tempfile::tempdir().unwrap();
        let paths = LockPaths::from_signal(dir.path().join("response.json"));

        LockWriter::default()
            .write(&paths, Response::success(None, json!({"ok": true})))
            .await
            .unwrap();

        assert!(is_ready(paths.signal()).unwrap());
        assert!(!paths.content().exists());

        let record: LockRecord =
            serde_json::from_slice(&std::fs::read(paths.signal()).unwrap()).unwrap();
        assert!(record.content_path.is_none());
        assert_eq!(record.response.value, Some(json!({"ok": true})));
    }

    #[tokio::test]
    async fn binary_payload_goes_to_content_file() {
        let dir = tempfile::tempdir().unwrap();
        let paths = LockPaths::from_signal(dir.path().join("response.json"));
        let raw = "line\u{2028}break".as_bytes();

        LockWriter::default()
            .write(&paths, Response::success(None, payload::bytes(raw)))
            .await
            .unwrap();

        assert!(is_ready(paths.content()).unwrap());
        assert_eq!(std::fs::read(paths.content()).unwrap(), raw);

        let record: LockRecord =
            serde_json::from_slice(&std::fs::read(paths.signal()).unwrap()).unwrap();
        assert_eq!(record.content_path.as_deref(), Some(paths.content()));
        assert_eq!(
            record.response.value,
            Some(json!({"$content": [0, raw.len()]}))
        );
    }

    #[tokio::test]
    async fn failure_is_written_without_content() {
        let dir = tempfile::tempdir().unwrap();
        let paths = LockPaths::from_signal(dir.path().join("response.json"));

        LockWriter::default()
            .write(&paths, Response::failure(None, CallError::new("E_FOO", "bad arg")))
            .await
            .unwrap();

        let record: LockRecord =
            serde_json::from_slice(&std::fs::read(paths.signal()).unwrap()).unwrap();
        assert!(!record.response.succeeded);
        assert!(!paths.content().exists());
    }

    #[tokio::test]
    async fn stale_occupant_is_replaced_after_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let paths = LockPaths::from_signal(dir.path().join("response.json"));
        std::fs::write(paths.signal(), b"stale").unwrap();

        let writer = LockWriter::new(Duration::from_millis(50), Duration::from_millis(5));
        writer
            .write(&paths, Response::success(None, json!("fresh")))
            .await
            .unwrap();

        let record: LockRecord =
            serde_json::from_slice(&std::fs::read(paths.signal()).unwrap()).unwrap();
        assert_eq!(record.response.value, Some(json!("fresh")));
    }

    #[tokio::test]
    async fn waits_for_reader_to_clear_previous_occupant() {
        let dir = tempfile::tempdir().unwrap();
        let paths = LockPaths::from_signal(dir.path().join("response.json"));
        std::fs::write(paths.signal(), b"previous").unwrap();

        let signal = paths.signal().to_path_buf();
        let clearer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            fs::remove_file(signal).await.unwrap();
        });

        let started = Instant::now();
        LockWriter::default()
            .write(&paths, Response::success(None, json!(1)))
            .await
            .unwrap();
        clearer.await.unwrap();

        assert!(started.elapsed() >= Duration::from_millis(30));
        assert!(is_ready(paths.signal()).unwrap());
    }
}
