use std::io::{self, Write};
use std::net::{Ipv4Addr, Shutdown, TcpStream};
use std::time::Duration;

use super::{BlockingTransport, TransportOutput};

/// Blocking loopback socket, no subprocess.
#[derive(Debug, Clone, Default)]
pub struct DirectTransport {
    read_timeout: Option<Duration>,
}

impl DirectTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }
}

impl BlockingTransport for DirectTransport {
    fn name(&self) -> &'static str {
        "direct"
    }

    fn round_trip(&self, port: u16, frame: &str) -> io::Result<TransportOutput> {
        let mut stdout = Vec::new();
        exchange(port, frame.as_bytes(), self.read_timeout, &mut stdout)?;
        Ok(TransportOutput {
            status: Some(0),
            stdout,
            stderr: Vec::new(),
        })
    }
}

/// Write one frame to the worker and copy everything it sends back into `sink`
/// until it closes the connection.
pub(crate) fn exchange(
    port: u16,
    frame: &[u8],
    read_timeout: Option<Duration>,
    sink: &mut impl Write,
) -> io::Result<u64> {
    let mut stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port))?;
    stream.set_read_timeout(read_timeout)?;
    stream.write_all(frame)?;
    stream.flush()?;
    // Half-close so the worker sees EOF if it keeps reading after the frame.
    stream.shutdown(Shutdown::Write)?;
    io::copy(&mut stream, sink)
}
