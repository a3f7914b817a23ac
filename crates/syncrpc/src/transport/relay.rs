use std::ffi::OsString;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::process::Command;

use super::direct::exchange;
use super::{BlockingTransport, TransportOutput, run_captured};
use crate::bridge::codec::TERMINATOR;

/// Frames shorter than this travel as a command-line argument, longer ones on stdin.
pub const DEFAULT_INLINE_LIMIT: usize = 1000;

/// Runs a second instance of a worker binary in relay mode:
/// `<program> <args..> relay <port> [frame]`.
///
/// The relay forwards the frame over loopback and copies the reply to its stdout.
#[derive(Debug, Clone)]
pub struct RelayTransport {
    program: PathBuf,
    args: Vec<OsString>,
    inline_limit: usize,
}

impl RelayTransport {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            inline_limit: DEFAULT_INLINE_LIMIT,
        }
    }

    /// Arguments placed before the `relay` subcommand.
    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_inline_limit(mut self, limit: usize) -> Self {
        self.inline_limit = limit;
        self
    }

    fn uses_stdin(&self, frame: &str) -> bool {
        frame.len() >= self.inline_limit
    }
}

impl BlockingTransport for RelayTransport {
    fn name(&self) -> &'static str {
        "relay"
    }

    fn round_trip(&self, port: u16, frame: &str) -> io::Result<TransportOutput> {
        let mut command = Command::new(&self.program);
        command.args(&self.args).arg("relay").arg(port.to_string());
        if self.uses_stdin(frame) {
            run_captured(command, Some(frame.as_bytes()))
        } else {
            // Line breaks do not survive every shell quoting scheme; the relay
            // puts the terminator back.
            command.arg(frame.trim_end_matches(['\r', '\n']));
            run_captured(command, None)
        }
    }
}

/// Relay-mode body: forward one frame (from `frame`, or stdin when absent) to the
/// worker on `port` and copy its reply to stdout.
pub fn run_relay(port: u16, frame: Option<String>) -> io::Result<()> {
    let mut frame = match frame {
        Some(frame) => frame.into_bytes(),
        None => {
            let mut buf = Vec::new();
            io::stdin().lock().read_to_end(&mut buf)?;
            buf
        }
    };
    if !frame.ends_with(TERMINATOR) {
        frame.extend_from_slice(TERMINATOR);
    }

    let stdout = io::stdout();
    let mut out = stdout.lock();
    exchange(port, &frame, None, &mut out)?;
    out.flush()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn large_frames_go_through_stdin() {
        let relay = RelayTransport::new("syncrpc-worker").with_inline_limit(8);
        assert!(!relay.uses_stdin("ping\r\n"));
        assert!(relay.uses_stdin("01234567"));
        assert!(RelayTransport::new("w").uses_stdin(&"x".repeat(DEFAULT_INLINE_LIMIT)));
    }

    #[test]
    fn missing_program_is_spawn_error() {
        let relay = RelayTransport::new("/nonexistent/syncrpc-worker").with_args(["--quiet"]);
        let err = relay.round_trip(1, "ping\r\n").unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
