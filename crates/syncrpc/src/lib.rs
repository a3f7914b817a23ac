//! syncrpc: blocking calls into an async worker process over loopback.
//!
//! A [`Session`] lazily spawns a worker binary, waits until it answers a ping and
//! picks a blocking transport. [`Session::create_client`] loads a registered
//! callable and returns a [`RemoteFn`] whose calls block until the worker replies.
//! Worker binaries build a [`Registry`] and hand it to [`entrypoint::main`].

pub mod bridge;
pub mod client;
pub mod entrypoint;
pub mod error;
pub mod lockfile;
pub mod orchestrator;
pub mod payload;
pub mod registry;
pub mod transport;
pub mod worker;

pub use bridge::protocol::{CallError, Handle, Request, RequestBody, RequestId, Response};
pub use client::{ClientConfig, RemoteFn, Session};
pub use error::Error;
pub use registry::{Callable, Constructor, Registry, callable_fn, constructor_fn};
pub use worker::{Worker, WorkerConfig, run_worker};
