use std::io;
use std::process::Command;

use super::{BlockingTransport, TransportOutput, run_captured};

/// Pipes the frame through `nc 127.0.0.1 <port>`.
#[derive(Debug, Clone)]
pub struct NetcatTransport {
    program: String,
}

impl Default for NetcatTransport {
    fn default() -> Self {
        Self::new("nc")
    }
}

impl NetcatTransport {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }
}

impl BlockingTransport for NetcatTransport {
    fn name(&self) -> &'static str {
        "netcat"
    }

    fn round_trip(&self, port: u16, frame: &str) -> io::Result<TransportOutput> {
        let mut command = Command::new(&self.program);
        command.arg("127.0.0.1").arg(port.to_string());
        run_captured(command, Some(frame.as_bytes()))
    }
}
