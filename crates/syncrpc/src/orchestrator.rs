//! Worker process lifecycle on the client side.
//!
//! Flow:
//! 1. Pick a free loopback port
//! 2. Spawn the worker with that port and a piped stdin it watches for EOF
//! 3. Ping directly until it answers `pong`, failing fast if it exits
//! 4. On drop: close stdin, SIGTERM, then kill

use std::ffi::OsString;
use std::io;
use std::net::{Ipv4Addr, TcpListener};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::time::{Duration, Instant};

use crate::bridge::codec::PING_FRAME;
use crate::bridge::protocol::PONG;
use crate::transport::{exchange_direct, hide_console_window};
use crate::worker::WATCH_STDIN_ENV;

/// Grace period between closing the worker's stdin and signalling it.
const EXIT_GRACE: Duration = Duration::from_millis(200);

const STARTUP_RETRY: Duration = Duration::from_millis(10);

#[derive(Debug, thiserror::Error)]
pub enum SpawnError {
    #[error("failed to spawn worker: {0}")]
    Spawn(#[from] io::Error),
    #[error("{0}")]
    Other(String),
}

/// Starts worker processes. The child must serve on `127.0.0.1:port`.
pub trait WorkerSpawner: Send + Sync {
    fn spawn(&self, port: u16) -> Result<Child, SpawnError>;
}

/// Spawns `<program> <args..> <port>`.
#[derive(Debug, Clone)]
pub struct CommandSpawner {
    program: PathBuf,
    args: Vec<OsString>,
}

impl CommandSpawner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
        }
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

impl WorkerSpawner for CommandSpawner {
    fn spawn(&self, port: u16) -> Result<Child, SpawnError> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .arg(port.to_string())
            .env(WATCH_STDIN_ENV, "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit());
        hide_console_window(&mut command);
        Ok(command.spawn()?)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("failed to spawn worker: {0}")]
    Spawn(String),
    #[error("worker did not answer ping within {waited:?} (last reply: {last_reply})")]
    SetupTimeout { waited: Duration, last_reply: String },
    #[error("worker exited during startup: {0}")]
    WorkerExited(String),
    #[error("no transport could reach the worker")]
    NoTransport,
    #[error("startup I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Ask the OS for a free loopback port.
///
/// The probe listener is closed before the worker binds, so another process could
/// take the port in between; startup then fails with a timeout or early exit.
pub fn find_port() -> io::Result<u16> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))?;
    Ok(listener.local_addr()?.port())
}

/// A running worker process. Terminated on drop.
#[derive(Debug)]
pub struct WorkerProcess {
    child: Child,
    port: u16,
}

impl WorkerProcess {
    pub fn spawn(spawner: &dyn WorkerSpawner, port: u16) -> Result<Self, OrchestratorError> {
        tracing::info!(port, "Spawning worker");
        let child = spawner
            .spawn(port)
            .map_err(|e| OrchestratorError::Spawn(e.to_string()))?;
        tracing::debug!(pid = child.id(), port, "Worker spawned");
        Ok(Self { child, port })
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Whether the process is still running. Reaps it if it has exited.
    pub fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    /// Exit status text if the process has exited.
    pub fn exit_status(&mut self) -> Option<String> {
        match self.child.try_wait() {
            Ok(Some(status)) => Some(status.to_string()),
            Ok(None) => None,
            Err(e) => Some(format!("unknown ({e})")),
        }
    }

    /// Ping the worker directly until it answers `pong`.
    ///
    /// Fails as soon as the process exits instead of waiting out `timeout`.
    pub fn wait_for_alive(&mut self, timeout: Duration) -> Result<(), OrchestratorError> {
        let started = Instant::now();
        let mut attempts = 0u32;

        loop {
            if let Some(status) = self.exit_status() {
                return Err(OrchestratorError::WorkerExited(status));
            }

            attempts += 1;
            let last_reply = match direct_ping(self.port) {
                Ok(reply) if reply == PONG.as_bytes() => {
                    tracing::info!(
                        port = self.port,
                        attempts,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Worker is alive"
                    );
                    return Ok(());
                }
                Ok(reply) => format!("{:?}", String::from_utf8_lossy(&reply)),
                Err(e) => e.to_string(),
            };

            if started.elapsed() >= timeout {
                return Err(OrchestratorError::SetupTimeout {
                    waited: started.elapsed(),
                    last_reply,
                });
            }
            std::thread::sleep(STARTUP_RETRY);
        }
    }

    /// Close stdin, give the worker a moment, then signal and kill it.
    pub fn terminate(&mut self) {
        drop(self.child.stdin.take());
        if self.wait_until_exit(EXIT_GRACE) {
            tracing::debug!(pid = self.pid(), "Worker exited after stdin closed");
            return;
        }

        #[cfg(unix)]
        {
            use nix::sys::signal::{Signal, kill};
            use nix::unistd::Pid;
            if let Ok(pid) = i32::try_from(self.child.id())
                && kill(Pid::from_raw(pid), Signal::SIGTERM).is_ok()
                && self.wait_until_exit(EXIT_GRACE)
            {
                tracing::debug!(pid, "Worker exited after SIGTERM");
                return;
            }
        }

        tracing::warn!(pid = self.pid(), "Killing unresponsive worker");
        if let Err(e) = self.child.kill() {
            tracing::debug!(error = %e, "Kill failed");
        }
        let _ = self.child.wait();
    }

    fn wait_until_exit(&mut self, grace: Duration) -> bool {
        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            if !self.is_running() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        !self.is_running()
    }
}

impl Drop for WorkerProcess {
    fn drop(&mut self) {
        if self.is_running() {
            self.terminate();
        }
    }
}

fn direct_ping(port: u16) -> io::Result<Vec<u8>> {
    let mut reply = Vec::new();
    exchange_direct(
        port,
        PING_FRAME.as_bytes(),
        Some(Duration::from_secs(1)),
        &mut reply,
    )?;
    Ok(reply)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingSpawner;

    impl WorkerSpawner for FailingSpawner {
        fn spawn(&self, _port: u16) -> Result<Child, SpawnError> {
            Err(SpawnError::Other("no worker for you".to_string()))
        }
    }

    #[cfg(unix)]
    struct ShellSpawner(&'static str);

    #[cfg(unix)]
    impl WorkerSpawner for ShellSpawner {
        fn spawn(&self, _port: u16) -> Result<Child, SpawnError> {
            Ok(Command::new("sh")
                .arg("-c")
                .arg(self.0)
                .stdin(Stdio::piped())
                .spawn()?)
        }
    }

    #[test]
    fn find_port_returns_bindable_port() {
        let port = find_port().unwrap();
        assert_ne!(port, 0);
        TcpListener::bind((Ipv4Addr::LOCALHOST, port)).unwrap();
    }

    #[test]
    fn spawner_errors_become_spawn_errors() {
        let err = WorkerProcess::spawn(&FailingSpawner, 1).unwrap_err();
        assert!(matches!(err, OrchestratorError::Spawn(msg) if msg == "no worker for you"));
    }

    #[test]
    fn missing_program_fails_to_spawn() {
        let spawner = CommandSpawner::new("/nonexistent/syncrpc-worker");
        let err = WorkerProcess::spawn(&spawner, 1).unwrap_err();
        assert!(matches!(err, OrchestratorError::Spawn(_)));
    }

    #[cfg(unix)]
    #[test]
    fn early_exit_is_detected_before_timeout() {
        let port = find_port().unwrap();
        let mut worker = WorkerProcess::spawn(&ShellSpawner("exit 3"), port).unwrap();
        let started = Instant::now();
        let err = worker.wait_for_alive(Duration::from_secs(10)).unwrap_err();
        assert!(matches!(err, OrchestratorError::WorkerExited(_)));
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[cfg(unix)]
    #[test]
    fn silent_worker_times_out() {
        let port = find_port().unwrap();
        let mut worker = WorkerProcess::spawn(&ShellSpawner("sleep 30"), port).unwrap();
        let err = worker.wait_for_alive(Duration::from_millis(100)).unwrap_err();
        match err {
            OrchestratorError::SetupTimeout { last_reply, .. } => {
                assert!(!last_reply.is_empty(), "timeout should carry the last ping outcome");
            }
            other => panic!("expected setup timeout, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[test]
    fn drop_terminates_worker() {
        let port = find_port().unwrap();
        let mut worker = WorkerProcess::spawn(&ShellSpawner("sleep 30"), port).unwrap();
        assert!(worker.is_running());
        worker.terminate();
        assert!(!worker.is_running());
    }
}
