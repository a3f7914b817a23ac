//! Wire protocol types for client-worker communication.
//!
//! Every exchange starts with one CRLF-terminated frame carrying either the literal
//! liveness probe or a JSON [`Request`]. The reply is bare JSON written straight back
//! (after which the worker closes the connection), or a lock-file record when the
//! request carries a [`Handoff`].

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Liveness probe payload.
pub const PING: &str = "ping";

/// Complete reply to [`PING`].
pub const PONG: &str = "pong";

/// Error codes produced by the worker itself (callables may use any code).
pub mod codes {
    pub const UNKNOWN_MODULE: &str = "E_UNKNOWN_MODULE";
    pub const UNKNOWN_HANDLE: &str = "E_UNKNOWN_HANDLE";
    pub const BAD_REQUEST: &str = "E_BAD_REQUEST";
    pub const PANIC: &str = "E_PANIC";
    pub const CANCELLED: &str = "E_CANCELLED";
    pub const IO: &str = "E_IO";
    pub const UNKNOWN: &str = "E_UNKNOWN";
}

/// Correlation id carried by every request and echoed by its response.
///
/// UUID v4 so lock-file names derived from it never collide across calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(uuid::Uuid);

impl RequestId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }

    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        let uuid = uuid::Uuid::parse_str(s)?;
        Ok(Self(uuid))
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Index into the worker's handle table. Only meaningful for the worker process
/// that assigned it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Handle(u64);

impl Handle {
    pub fn new(index: u64) -> Self {
        Self(index)
    }

    pub fn index(&self) -> u64 {
        self.0
    }
}

impl std::fmt::Display for Handle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Out-of-band response location for warm-path requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Handoff {
    pub signal_path: PathBuf,
}

/// One framed request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub id: RequestId,
    #[serde(flatten)]
    pub body: RequestBody,
    /// Present only on the warm path: respond through the lock-file channel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handoff: Option<Handoff>,
}

impl Request {
    pub fn new(body: RequestBody) -> Self {
        Self {
            id: RequestId::new(),
            body,
            handoff: None,
        }
    }

    pub fn with_handoff(mut self, handoff: Handoff) -> Self {
        self.handoff = Some(handoff);
        self
    }

    pub fn is_load(&self) -> bool {
        matches!(self.body, RequestBody::Load { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RequestBody {
    /// Construct a callable from a registry key and append it to the handle table.
    Load {
        module_ref: String,
        #[serde(default)]
        argument: Value,
    },

    Invoke {
        handle: Handle,
        #[serde(default)]
        argument: Value,
    },
}

/// Failure raised by a callable (or by the worker on its behalf).
///
/// Round-trips end to end so the client sees the original code and message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{code}: {message}")]
pub struct CallError {
    #[serde(default)]
    pub code: String,
    pub message: String,
}

impl CallError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn unknown_module(module_ref: &str) -> Self {
        Self::new(
            codes::UNKNOWN_MODULE,
            format!("no constructor registered for '{module_ref}'"),
        )
    }

    pub fn unknown_handle(handle: Handle) -> Self {
        Self::new(codes::UNKNOWN_HANDLE, format!("handle {handle} was never loaded"))
    }

    pub fn bad_request(reason: impl Into<String>) -> Self {
        Self::new(codes::BAD_REQUEST, reason)
    }

    pub fn panicked(message: impl Into<String>) -> Self {
        Self::new(codes::PANIC, message)
    }

    pub fn io(error: &std::io::Error) -> Self {
        Self::new(codes::IO, error.to_string())
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

/// Reply to a [`Request`]. `value` is meaningful only when `succeeded`, `error`
/// only when not.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<RequestId>,
    pub succeeded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<CallError>,
}

impl Response {
    pub fn success(id: Option<RequestId>, value: Value) -> Self {
        Self {
            id,
            succeeded: true,
            value: Some(value),
            error: None,
        }
    }

    pub fn failure(id: Option<RequestId>, error: CallError) -> Self {
        Self {
            id,
            succeeded: false,
            value: None,
            error: Some(error),
        }
    }

    pub fn from_result(id: Option<RequestId>, result: Result<Value, CallError>) -> Self {
        match result {
            Ok(value) => Self::success(id, value),
            Err(error) => Self::failure(id, error),
        }
    }

    pub fn into_result(self) -> Result<Value, CallError> {
        if self.succeeded {
            Ok(self.value.unwrap_or(Value::Null))
        } else {
            Err(self.error.unwrap_or_else(|| {
                CallError::new(codes::UNKNOWN, "failed response carried no error")
            }))
        }
    }
}
