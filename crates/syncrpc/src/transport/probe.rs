use std::sync::Arc;

use super::BlockingTransport;
use crate::bridge::codec::PING_FRAME;
use crate::bridge::protocol::PONG;

/// Picks the first candidate transport that completes a ping round trip.
#[derive(Clone)]
pub struct TransportProber {
    candidates: Vec<Arc<dyn BlockingTransport>>,
}

impl std::fmt::Debug for TransportProber {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<_> = self.candidates.iter().map(|t| t.name()).collect();
        f.debug_struct("TransportProber")
            .field("candidates", &names)
            .finish()
    }
}

impl TransportProber {
    /// Candidates are tried in order.
    pub fn new(candidates: Vec<Arc<dyn BlockingTransport>>) -> Self {
        Self { candidates }
    }

    pub fn candidates(&self) -> &[Arc<dyn BlockingTransport>] {
        &self.candidates
    }

    /// First candidate whose ping gets exactly `pong` back, or `None`.
    pub fn select(&self, port: u16) -> Option<Arc<dyn BlockingTransport>> {
        self.candidates
            .iter()
            .find(|transport| answers_ping(transport.as_ref(), port))
            .cloned()
    }
}

fn answers_ping(transport: &dyn BlockingTransport, port: u16) -> bool {
    match transport.round_trip(port, PING_FRAME) {
        Ok(output) if output.success() && output.stdout == PONG.as_bytes() => {
            tracing::debug!(transport = transport.name(), port, "Transport answered ping");
            true
        }
        Ok(output) => {
            tracing::debug!(
                transport = transport.name(),
                detail = %output.describe_failure(),
                stdout_bytes = output.stdout.len(),
                "Transport did not answer ping"
            );
            false
        }
        Err(e) => {
            tracing::debug!(transport = transport.name(), error = %e, "Transport unavailable");
            false
        }
    }
}
