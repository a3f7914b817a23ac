//! Blocking transports: how a synchronous caller gets one frame to the worker and
//! the direct reply back.
//!
//! The cold path runs a child process per call and blocks on it. [`NetcatTransport`]
//! pipes the frame through `nc`; [`RelayTransport`] re-invokes a worker binary in
//! relay mode. [`DirectTransport`] skips the subprocess and uses a blocking socket.
//! [`TransportProber`] picks the first one that answers a ping.

mod direct;
mod netcat;
mod probe;
mod relay;

use std::io::{self, Write};
use std::process::{Command, Output, Stdio};

pub use direct::DirectTransport;
pub(crate) use direct::exchange as exchange_direct;
pub use netcat::NetcatTransport;
pub use probe::TransportProber;
pub use relay::{DEFAULT_INLINE_LIMIT, RelayTransport, run_relay};

/// What a blocking round trip produced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportOutput {
    /// Exit code of the transport process; `Some(0)` for in-process transports.
    pub status: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl TransportOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// Human-readable failure detail: the exit status plus whatever either stream
    /// printed, each cut to [`OUTPUT_EXCERPT`] characters.
    pub fn describe_failure(&self) -> String {
        let mut detail = match self.status {
            Some(code) => format!("exit status {code}"),
            None => "terminated by signal".to_string(),
        };
        for (stream, raw) in [("stdout", &self.stdout), ("stderr", &self.stderr)] {
            let text = String::from_utf8_lossy(raw);
            let text = text.trim();
            if !text.is_empty() {
                detail.push_str(&format!("; {stream}: {}", excerpt(text, OUTPUT_EXCERPT)));
            }
        }
        detail
    }
}

/// Characters of each output stream kept in failure details.
pub const OUTPUT_EXCERPT: usize = 200;

fn excerpt(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

impl From<Output> for TransportOutput {
    fn from(output: Output) -> Self {
        Self {
            status: output.status.code(),
            stdout: output.stdout,
            stderr: output.stderr,
        }
    }
}

/// Sends one CRLF-terminated frame to the worker on `127.0.0.1:port` and blocks
/// until the worker closes the connection.
///
/// Implementations must not run an async runtime: callers may already be inside one.
pub trait BlockingTransport: Send + Sync {
    fn name(&self) -> &'static str;

    fn round_trip(&self, port: u16, frame: &str) -> io::Result<TransportOutput>;
}

/// Run `command` to completion, feeding `input` on stdin and capturing both output
/// streams.
pub(crate) fn run_captured(mut command: Command, input: Option<&[u8]>) -> io::Result<TransportOutput> {
    command
        .stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    hide_console_window(&mut command);

    let mut child = command.spawn()?;
    let stdin = child.stdin.take();

    // Writing on a separate thread: a large frame would fill the pipe while the
    // child blocks writing its own output.
    let output = std::thread::scope(|scope| {
        if let (Some(mut stdin), Some(input)) = (stdin, input) {
            scope.spawn(move || {
                if let Err(e) = stdin.write_all(input)
                    && e.kind() != io::ErrorKind::BrokenPipe
                {
                    tracing::debug!(error = %e, "Failed to write transport stdin");
                }
            });
        }
        child.wait_with_output()
    })?;

    Ok(output.into())
}

/// Keep transport subprocesses from flashing a console window on Windows.
pub(crate) fn hide_console_window(command: &mut Command) {
    #[cfg(windows)]
    {
        use std::os::windows::process::CommandExt;
        const CREATE_NO_WINDOW: u32 = 0x0800_0000;
        command.creation_flags(CREATE_NO_WINDOW);
    }
    #[cfg(not(windows))]
    let _ = command;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn describe_failure_includes_both_streams() {
        let output = TransportOutput {
            status: Some(1),
            stdout: Vec::new(),
            stderr: b"connection refused\n".to_vec(),
        };
        assert!(!output.success());
        assert_eq!(output.describe_failure(), "exit status 1; stderr: connection refused");

        let noisy = TransportOutput {
            status: Some(0),
            stdout: b"not json".to_vec(),
            stderr: b"warning: slow\n".to_vec(),
        };
        assert_eq!(
            noisy.describe_failure(),
            "exit status 0; stdout: not json; stderr: warning: slow"
        );

        let killed = TransportOutput::default();
        assert_eq!(killed.describe_failure(), "terminated by signal");
    }

    #[test]
    fn excerpt_respects_char_boundaries() {
        assert_eq!(excerpt("héllo", 2), "hé");
        assert_eq!(excerpt("hi", 10), "hi");
    }

    #[cfg(unix)]
    #[test]
    fn run_captured_feeds_stdin() {
        let output = run_captured(Command::new("cat"), Some(b"frame\r\n")).unwrap();
        assert!(output.success());
        assert_eq!(output.stdout, b"frame\r\n");
    }

    #[cfg(unix)]
    #[test]
    fn run_captured_survives_child_ignoring_stdin() {
        let big = vec![b'x'; 1 << 20];
        let output = run_captured(Command::new("true"), Some(&big)).unwrap();
        assert!(output.success());
    }
}
