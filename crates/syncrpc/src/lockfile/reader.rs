//! Client side of the lock-file channel. Fully synchronous: callers block.

use std::path::Path;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use notify::{RecursiveMode, Watcher};
use serde_json::Value;

use super::{DEFAULT_LOCK_TIMEOUT, LockError, LockPaths, LockRecord, is_ready, remove_pair};
use crate::bridge::protocol::Response;
use crate::payload;

/// Longest sleep between readiness checks while a watcher is active. Events can be
/// coalesced or dropped, so the watcher only shortens the wait.
const WATCH_FALLBACK_STEP: Duration = Duration::from_millis(50);

/// Waits for a signal file to become ready, consumes the pair and deletes it.
pub struct LockReader {
    timeout: Duration,
    poll_interval: Duration,
    watcher: Option<DirWatcher>,
}

impl std::fmt::Debug for LockReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockReader")
            .field("timeout", &self.timeout)
            .field("poll_interval", &self.poll_interval)
            .field("watching", &self.watcher.is_some())
            .finish()
    }
}

impl Default for LockReader {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_TIMEOUT, Duration::from_millis(2))
    }
}

impl LockReader {
    /// Reader that polls every `poll_interval`.
    pub fn new(timeout: Duration, poll_interval: Duration) -> Self {
        Self {
            timeout,
            poll_interval,
            watcher: None,
        }
    }

    /// Reader woken by filesystem events in `dir`. Falls back to polling when the
    /// platform watcher cannot be created.
    pub fn watching(dir: &Path, timeout: Duration, poll_interval: Duration) -> Self {
        let watcher = match DirWatcher::new(dir) {
            Ok(watcher) => Some(watcher),
            Err(e) => {
                tracing::debug!(dir = %dir.display(), error = %e, "No directory watcher, polling");
                None
            }
        };
        Self {
            timeout,
            poll_interval,
            watcher,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn is_watching(&self) -> bool {
        self.watcher.is_some()
    }

    /// Block until the pair at `paths` is ready, then consume it.
    pub fn read(&self, paths: &LockPaths) -> Result<Response, LockError> {
        self.read_while(paths, || true)
    }

    /// Like [`read`](Self::read), but gives up with [`LockError::Abandoned`] as soon
    /// as `alive` reports that the writer is gone.
    ///
    /// Both files are deleted before returning, whatever the outcome.
    pub fn read_while(
        &self,
        paths: &LockPaths,
        mut alive: impl FnMut() -> bool,
    ) -> Result<Response, LockError> {
        let started = Instant::now();
        let result = loop {
            match is_ready(paths.signal()) {
                Ok(true) => break consume(paths),
                Ok(false) => {}
                Err(e) => break Err(e.into()),
            }
            if !alive() {
                // The writer may have finished right before exiting.
                if matches!(is_ready(paths.signal()), Ok(true)) {
                    break consume(paths);
                }
                break Err(LockError::Abandoned {
                    path: paths.signal().to_path_buf(),
                });
            }
            let waited = started.elapsed();
            if waited >= self.timeout {
                break Err(LockError::Timeout {
                    path: paths.signal().to_path_buf(),
                    waited,
                });
            }
            self.pause(self.timeout - waited);
        };

        if let Err(e) = remove_pair(paths) {
            tracing::warn!(path = %paths.signal().display(), error = %e, "Failed to remove lock files");
        }
        result
    }

    fn pause(&self, remaining: Duration) {
        match &self.watcher {
            Some(watcher) => watcher.wait(WATCH_FALLBACK_STEP.max(self.poll_interval).min(remaining)),
            None => std::thread::sleep(self.poll_interval.min(remaining)),
        }
    }
}

fn consume(paths: &LockPaths) -> Result<Response, LockError> {
    let record: LockRecord = serde_json::from_slice(&std::fs::read(paths.signal())?)?;
    let mut response = record.response;
    if response.succeeded
        && let Some(value) = response.value.as_mut()
    {
        let content = match record.content_path {
            Some(_) => std::fs::read(paths.content())?,
            None => Vec::new(),
        };
        payload::splice_bytes(value, &content)?;
    }
    if response.succeeded && response.value.is_none() {
        response.value = Some(Value::Null);
    }
    Ok(response)
}

/// Directory watch that turns any event into a wakeup.
struct DirWatcher {
    _watcher: notify::RecommendedWatcher,
    rx: mpsc::Receiver<()>,
}

impl DirWatcher {
    fn new(dir: &Path) -> notify::Result<Self> {
        let (tx, rx) = mpsc::channel();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            if res.is_ok() {
                let _ = tx.send(());
            }
        })?;
        watcher.watch(dir, RecursiveMode::NonRecursive)?;
        Ok(Self {
            _watcher: watcher,
            rx,
        })
    }

    fn wait(&self, timeout: Duration) {
        if self.rx.recv_timeout(timeout).is_ok() {
            while self.rx.try_recv().is_ok() {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::CallError;
    use crate::lockfile::LockWriter;
    use serde_json::json;
    use std::thread;

    fn short_reader() -> LockReader {
        LockReader::new(Duration::from_millis(200), Duration::from_millis(2))
    }

    fn write_blocking(paths: &LockPaths, response: Response) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(LockWriter::default().write(paths, response))
            .unwrap();
    }

    #[test]
    fn writable_signal_file_is_not_ready() {
        let dir = tempfile::tempdir().unwrap();
        let paths = LockPaths::from_signal(dir.path().join("response.json"));
        std::fs::write(paths.signal(), br#"{"succeeded":true,"value":1}"#).unwrap();

        let err = short_reader().read(&paths).unwrap_err();
        assert!(matches!(err, LockError::Timeout { .. }));
        assert!(!paths.signal().exists());
    }

    #[test]
    fn reads_and_removes_pair() {
        let dir = tempfile::tempdir().unwrap();
        let paths = LockPaths::from_signal(dir.path().join("response.json"));
        let raw = [0xe2u8, 0x80, 0xa8, 0x00, 0xff];
        write_blocking(
            &paths,
            Response::success(None, json!({"blob": payload::bytes(raw), "n": 1})),
        );

        let response = short_reader().read(&paths).unwrap();
        let value = response.into_result().unwrap();
        assert_eq!(payload::as_bytes(&value["blob"]).unwrap(), raw);
        assert_eq!(value["n"], 1);
        assert!(!paths.signal().exists());
        assert!(!paths.content().exists());
    }

    #[test]
    fn content_shaped_user_values_come_back_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let paths = LockPaths::from_signal(dir.path().join("response.json"));
        let values = [
            json!({"$content": [0, 1]}),
            json!({"user": {"$content": [0, 1]}, "blob": payload::bytes(b"xyz")}),
            json!({"empty": payload::bytes(b"")}),
        ];
        for value in values {
            write_blocking(&paths, Response::success(None, value.clone()));
            let read = short_reader().read(&paths).unwrap().into_result().unwrap();
            assert_eq!(read, value);
        }
    }

    #[test]
    fn failed_response_is_consumed_and_removed() {
        let dir = tempfile::tempdir().unwrap();
        let paths = LockPaths::from_signal(dir.path().join("response.json"));
        write_blocking(&paths, Response::failure(None, CallError::new("E_FOO", "bad arg")));

        let err = short_reader().read(&paths).unwrap().into_result().unwrap_err();
        assert_eq!(err, CallError::new("E_FOO", "bad arg"));
        assert!(!paths.signal().exists());
    }

    #[test]
    fn abandoned_when_writer_dies() {
        let dir = tempfile::tempdir().unwrap();
        let paths = LockPaths::from_signal(dir.path().join("response.json"));

        let mut checks = 0;
        let err = LockReader::new(Duration::from_secs(5), Duration::from_millis(1))
            .read_while(&paths, || {
                checks += 1;
                checks < 3
            })
            .unwrap_err();
        assert!(matches!(err, LockError::Abandoned { .. }));
    }

    #[test]
    fn watching_reader_wakes_on_late_write() {
        let dir = tempfile::tempdir().unwrap();
        let paths = LockPaths::from_signal(dir.path().join("response.json"));
        let reader = LockReader::watching(dir.path(), Duration::from_secs(5), Duration::from_millis(2));

        let writer_paths = paths.clone();
        let writer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(30));
            write_blocking(&writer_paths, Response::success(None, json!("late")));
        });

        let value = reader.read(&paths).unwrap().into_result().unwrap();
        writer.join().unwrap();
        assert_eq!(value, json!("late"));
    }
}
