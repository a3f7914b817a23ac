//! Wire layer shared by the client and the worker.
//!
//! # Architecture
//!
//! - **protocol**: Message types (Request, Response, CallError, Handle)
//! - **codec**: CRLF framing codec for AsyncRead/AsyncWrite plus the blocking-side
//!   frame encoder

pub mod codec;
pub mod protocol;
