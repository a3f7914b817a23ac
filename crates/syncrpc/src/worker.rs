//! Worker process: the dispatch server on loopback.
//!
//! Listens on 127.0.0.1 and reads CRLF frames from each connection:
//!
//! - `ping` gets `pong` and the connection is closed. No other effect.
//! - A request without a handoff is answered with bare JSON on the same
//!   connection, which is then closed.
//! - A request with a handoff is executed as its own task and answered through the
//!   lock-file channel; the connection stays open for further frames.
//!
//! Callables run on spawned tasks, so a panic fails one call instead of the worker.
//! The worker exits on SIGINT/SIGTERM and, when asked to watch it, on EOF of its
//! stdin (the parent holds the write end and never writes).

use std::any::Any;
use std::future::Future;
use std::io::{self, Read};
use std::net::Ipv4Addr;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use futures::StreamExt;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::codec::FramedRead;

use crate::bridge::codec::{DEFAULT_MAX_FRAME_LENGTH, Frame, FrameCodec, encode_response};
use crate::bridge::protocol::{
    CallError, Handle, Handoff, PONG, Request, RequestBody, Response, codes,
};
use crate::lockfile::{DEFAULT_LOCK_TIMEOUT, LockPaths, LockWriter};
use crate::registry::{Callable, Registry};

/// Set to `1` by the spawning client: exit when stdin reaches EOF.
pub const WATCH_STDIN_ENV: &str = "SYNCRPC_WATCH_STDIN";

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How long to wait for a previous signal file to clear before replacing it.
    pub lock_write_timeout: Duration,
    pub lock_poll_interval: Duration,
    pub max_frame_length: usize,
    /// Exit when stdin closes (the spawning parent went away).
    pub watch_stdin: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            lock_write_timeout: DEFAULT_LOCK_TIMEOUT,
            lock_poll_interval: Duration::from_millis(5),
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            watch_stdin: false,
        }
    }
}

impl WorkerConfig {
    /// Defaults plus `SYNCRPC_WATCH_STDIN`.
    pub fn from_env() -> Self {
        Self {
            watch_stdin: std::env::var(WATCH_STDIN_ENV).as_deref() == Ok("1"),
            ..Self::default()
        }
    }

    pub fn with_watch_stdin(mut self, watch: bool) -> Self {
        self.watch_stdin = watch;
        self
    }

    pub fn with_max_frame_length(mut self, max: usize) -> Self {
        self.max_frame_length = max;
        self
    }
}

/// Append-only table of loaded callables. A handle is an index into it and stays
/// valid for the life of the worker.
#[derive(Default)]
pub struct HandleTable {
    entries: RwLock<Vec<Arc<dyn Callable>>>,
}

impl HandleTable {
    pub fn push(&self, callable: Arc<dyn Callable>) -> Handle {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.push(callable);
        Handle::new((entries.len() - 1) as u64)
    }

    pub fn get(&self, handle: Handle) -> Option<Arc<dyn Callable>> {
        let index = usize::try_from(handle.index()).ok()?;
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(index)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct Worker {
    registry: Registry,
    handles: HandleTable,
    lock_writer: LockWriter,
    max_frame_length: usize,
}

impl Worker {
    pub fn new(registry: Registry, config: &WorkerConfig) -> Self {
        Self {
            registry,
            handles: HandleTable::default(),
            lock_writer: LockWriter::new(config.lock_write_timeout, config.lock_poll_interval),
            max_frame_length: config.max_frame_length,
        }
    }

    pub fn handles(&self) -> &HandleTable {
        &self.handles
    }

    /// Bind the loopback listener. Port 0 picks a free port.
    pub async fn bind(port: u16) -> io::Result<TcpListener> {
        TcpListener::bind((Ipv4Addr::LOCALHOST, port)).await
    }

    /// Accept connections until the listener fails.
    pub async fn serve(self: Arc<Self>, listener: TcpListener) -> io::Result<()> {
        loop {
            let (stream, peer) = match listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) if is_transient_accept_error(&e) => {
                    tracing::warn!(error = %e, "Accept failed, retrying");
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    continue;
                }
                Err(e) => return Err(e),
            };
            tracing::trace!(%peer, "Connection accepted");
            let worker = Arc::clone(&self);
            tokio::spawn(async move {
                if let Err(e) = worker.handle_connection(stream).await {
                    tracing::debug!(%peer, error = %e, "Connection ended with error");
                }
            });
        }
    }

    /// Run one request body. LOAD yields the new handle as a JSON number.
    pub async fn execute(&self, body: RequestBody) -> Result<Value, CallError> {
        match body {
            RequestBody::Load {
                module_ref,
                argument,
            } => {
                let constructor = self
                    .registry
                    .get(&module_ref)
                    .ok_or_else(|| CallError::unknown_module(&module_ref))?;
                let callable = isolate(async move { constructor.construct(argument).await }).await?;
                let handle = self.handles.push(callable);
                tracing::info!(%module_ref, %handle, "Module loaded");
                Ok(Value::from(handle.index()))
            }
            RequestBody::Invoke { handle, argument } => {
                let callable = self
                    .handles
                    .get(handle)
                    .ok_or_else(|| CallError::unknown_handle(handle))?;
                isolate(async move { callable.call(argument).await }).await
            }
        }
    }

    pub async fn respond_to(&self, request: Request) -> Response {
        let id = request.id;
        let result = self.execute(request.body).await;
        if let Err(e) = &result {
            tracing::debug!(%id, code = %e.code, "Call failed");
        }
        Response::from_result(Some(id), result)
    }

    async fn handle_connection(self: Arc<Self>, stream: TcpStream) -> io::Result<()> {
        let (read_half, mut write_half) = stream.into_split();
        let mut frames = FramedRead::new(
            read_half,
            FrameCodec::with_max_length(self.max_frame_length),
        );
        let mut dispatched = 0usize;

        while let Some(frame) = frames.next().await {
            match frame {
                Ok(Frame::Ping) => {
                    write_half.write_all(PONG.as_bytes()).await?;
                    write_half.shutdown().await?;
                    return Ok(());
                }
                Ok(Frame::Invalid(reason)) => {
                    tracing::warn!(%reason, "Rejecting invalid frame");
                    let response = Response::failure(None, CallError::bad_request(reason));
                    return write_reply(&mut write_half, &response).await;
                }
                Ok(Frame::Request(mut request)) => match request.handoff.take() {
                    None => {
                        let response = self.respond_to(request).await;
                        return write_reply(&mut write_half, &response).await;
                    }
                    Some(handoff) => {
                        dispatched += 1;
                        let worker = Arc::clone(&self);
                        tokio::spawn(async move {
                            worker.respond_via_lock_file(request, handoff).await;
                        });
                    }
                },
                Err(e) => {
                    // Nobody waits on a lock file for a frame that never parsed.
                    if dispatched == 0 {
                        let response = Response::failure(None, CallError::io(&e));
                        let _ = write_reply(&mut write_half, &response).await;
                    }
                    return Err(e);
                }
            }
        }

        tracing::trace!(dispatched, "Connection closed by client");
        Ok(())
    }

    async fn respond_via_lock_file(&self, request: Request, handoff: Handoff) {
        let id = request.id;
        let paths = LockPaths::from_signal(handoff.signal_path);
        let response = self.respond_to(request).await;

        if let Err(e) = self.lock_writer.write(&paths, response).await {
            tracing::error!(%id, path = %paths.signal().display(), error = %e, "Failed to write lock file");
            // Let the reader fail fast instead of timing out.
            let fallback = Response::failure(Some(id), CallError::new(codes::IO, e.to_string()));
            if let Err(e) = self.lock_writer.write(&paths, fallback).await {
                tracing::error!(%id, error = %e, "Failed to write fallback lock file");
            }
        }
    }
}

fn is_transient_accept_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    ) || e.raw_os_error().is_some_and(is_fd_exhaustion)
}

#[cfg(unix)]
fn is_fd_exhaustion(code: i32) -> bool {
    code == nix::errno::Errno::EMFILE as i32 || code == nix::errno::Errno::ENFILE as i32
}

#[cfg(not(unix))]
fn is_fd_exhaustion(_code: i32) -> bool {
    false
}

async fn write_reply(write_half: &mut OwnedWriteHalf, response: &Response) -> io::Result<()> {
    let bytes = encode_response(response)?;
    write_half.write_all(&bytes).await?;
    write_half.shutdown().await
}

/// Run `fut` on its own task so a panic becomes an `E_PANIC` failure.
async fn isolate<T, F>(fut: F) -> Result<T, CallError>
where
    T: Send + 'static,
    F: Future<Output = Result<T, CallError>> + Send + 'static,
{
    match tokio::spawn(fut).await {
        Ok(result) => result,
        Err(e) if e.is_panic() => {
            let message = panic_message(e.into_panic());
            tracing::error!(%message, "Callable panicked");
            Err(CallError::panicked(message))
        }
        Err(e) => Err(CallError::new(codes::CANCELLED, e.to_string())),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "callable panicked".to_string()
    }
}

/// Serve `registry` on `127.0.0.1:port` until a shutdown signal arrives or the
/// parent goes away.
pub async fn run_worker(registry: Registry, config: WorkerConfig, port: u16) -> io::Result<()> {
    let listener = Worker::bind(port).await?;
    let local = listener.local_addr()?;
    tracing::info!(%local, modules = registry.len(), "Worker listening");

    let worker = Arc::new(Worker::new(registry, &config));

    tokio::select! {
        biased;

        _ = shutdown_signal() => {
            tracing::info!("Shutdown signal received");
        }
        _ = parent_closed(config.watch_stdin) => {
            tracing::info!("Stdin closed (parent died?), exiting");
        }
        result = Arc::clone(&worker).serve(listener) => {
            result?;
        }
    }

    tracing::info!(loaded = worker.handles().len(), "Worker exiting");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

/// Resolves once stdin reaches EOF. Never resolves when `enabled` is false.
async fn parent_closed(enabled: bool) {
    if !enabled {
        return std::future::pending().await;
    }

    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    // Blocking read on a plain thread: it must not hold up runtime shutdown.
    let spawned = std::thread::Builder::new()
        .name("syncrpc-stdin".to_string())
        .spawn(move || {
            let mut stdin = io::stdin().lock();
            let mut buf = [0u8; 256];
            loop {
                match stdin.read(&mut buf) {
                    Ok(0) => break,
                    Ok(_) => continue,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(_) => break,
                }
            }
            let _ = tx.send(());
        });

    if let Err(e) = spawned {
        tracing::warn!(error = %e, "Failed to start stdin watcher");
        return std::future::pending().await;
    }
    let _ = rx.await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::codec::{PING_FRAME, encode_frame};
    use crate::lockfile::LockReader;
    use crate::registry::callable_fn;
    use serde_json::json;
    use tokio::io::AsyncReadExt;

    fn test_registry() -> Registry {
        Registry::new()
            .with("echo", |_| async { Ok(callable_fn(|x| async move { Ok(x) })) })
            .with("fail", |_| async {
                Ok(callable_fn(|_| async {
                    Err(CallError::new("E_FOO", "bad arg"))
                }))
            })
            .with("delay", |_| async {
                Ok(callable_fn(|x: Value| async move {
                    let ms = x["ms"].as_u64().unwrap_or(0);
                    tokio::time::sleep(Duration::from_millis(ms)).await;
                    Ok(x["value"].clone())
                }))
            })
            .with("panic", |_| async {
                Ok(callable_fn(|x: Value| async move {
                    if x.is_null() {
                        panic!("callable blew up");
                    }
                    Ok(x)
                }))
            })
    }

    async fn start() -> (Arc<Worker>, u16) {
        let worker = Arc::new(Worker::new(test_registry(), &WorkerConfig::default()));
        let listener = Worker::bind(0).await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(Arc::clone(&worker).serve(listener));
        (worker, port)
    }

    async fn exchange(port: u16, frame: &str) -> String {
        let mut stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await.unwrap();
        stream.write_all(frame.as_bytes()).await.unwrap();
        let mut out = String::new();
        stream.read_to_string(&mut out).await.unwrap();
        out
    }

    async fn call(port: u16, body: RequestBody) -> Response {
        let frame = encode_frame(&Request::new(body)).unwrap();
        serde_json::from_str(&exchange(port, &frame).await).unwrap()
    }

    fn load(module_ref: &str) -> RequestBody {
        RequestBody::Load {
            module_ref: module_ref.to_string(),
            argument: Value::Null,
        }
    }

    fn invoke(handle: u64, argument: Value) -> RequestBody {
        RequestBody::Invoke {
            handle: Handle::new(handle),
            argument,
        }
    }

    #[tokio::test]
    async fn run_worker_serves_on_requested_port() {
        let port = crate::orchestrator::find_port().unwrap();
        let task = tokio::spawn(run_worker(test_registry(), WorkerConfig::default(), port));

        let mut reply = None;
        for _ in 0..200 {
            if let Ok(mut stream) = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await {
                stream.write_all(PING_FRAME.as_bytes()).await.unwrap();
                let mut out = String::new();
                stream.read_to_string(&mut out).await.unwrap();
                reply = Some(out);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(reply.as_deref(), Some("pong"));

        let response = call(port, load("echo")).await;
        assert_eq!(response.into_result().unwrap(), json!(0));
        assert!(!task.is_finished());
        task.abort();
    }

    #[tokio::test]
    async fn run_worker_fails_when_port_is_taken() {
        let taken = Worker::bind(0).await.unwrap();
        let port = taken.local_addr().unwrap().port();
        let err = run_worker(test_registry(), WorkerConfig::default(), port)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AddrInUse);
    }

    #[tokio::test]
    async fn ping_answers_pong_without_side_effects() {
        let (worker, port) = start().await;
        assert_eq!(exchange(port, PING_FRAME).await, "pong");
        assert_eq!(exchange(port, PING_FRAME).await, "pong");
        assert!(worker.handles().is_empty());
    }

    #[tokio::test]
    async fn load_then_invoke() {
        let (_worker, port) = start().await;
        let handle = call(port, load("echo")).await.into_result().unwrap();
        assert_eq!(handle, json!(0));

        let response = call(port, invoke(0, json!({"a": 1}))).await;
        assert!(response.id.is_some());
        assert_eq!(response.into_result().unwrap(), json!({"a": 1}));
    }

    #[tokio::test]
    async fn handles_are_assigned_in_order() {
        let (worker, port) = start().await;
        for expected in 0..3 {
            let handle = call(port, load("echo")).await.into_result().unwrap();
            assert_eq!(handle, json!(expected));
        }
        assert_eq!(worker.handles().len(), 3);
    }

    #[tokio::test]
    async fn callable_error_keeps_code_and_message() {
        let (_worker, port) = start().await;
        call(port, load("fail")).await.into_result().unwrap();
        let err = call(port, invoke(0, Value::Null)).await.into_result().unwrap_err();
        assert_eq!(err, CallError::new("E_FOO", "bad arg"));
    }

    #[tokio::test]
    async fn unknown_module_and_handle_fail() {
        let (worker, port) = start().await;
        let err = call(port, load("nope")).await.into_result().unwrap_err();
        assert_eq!(err.code(), codes::UNKNOWN_MODULE);
        assert!(worker.handles().is_empty());

        let err = call(port, invoke(9, Value::Null)).await.into_result().unwrap_err();
        assert_eq!(err.code(), codes::UNKNOWN_HANDLE);
    }

    #[tokio::test]
    async fn invalid_frame_gets_bad_request() {
        let (_worker, port) = start().await;
        let reply = exchange(port, "{not json\r\n").await;
        let response: Response = serde_json::from_str(&reply).unwrap();
        assert!(response.id.is_none());
        assert_eq!(response.into_result().unwrap_err().code(), codes::BAD_REQUEST);
    }

    #[tokio::test]
    async fn panic_fails_only_that_call() {
        let (_worker, port) = start().await;
        call(port, load("panic")).await.into_result().unwrap();
        call(port, load("echo")).await.into_result().unwrap();

        let err = call(port, invoke(0, Value::Null)).await.into_result().unwrap_err();
        assert_eq!(err.code(), codes::PANIC);
        assert!(err.message().contains("callable blew up"));

        let value = call(port, invoke(1, json!("still here"))).await.into_result().unwrap();
        assert_eq!(value, json!("still here"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn handoff_requests_answer_through_lock_files() {
        let (_worker, port) = start().await;
        call(port, load("delay")).await.into_result().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let mut stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).await.unwrap();

        // The slow call goes first; both are in flight on one connection.
        let mut pending = Vec::new();
        for (ms, value) in [(150, "slow"), (0, "fast")] {
            let request = Request::new(invoke(0, json!({"ms": ms, "value": value})));
            let paths = LockPaths::for_request(dir.path(), request.id);
            let request = request.with_handoff(paths.handoff());
            stream
                .write_all(encode_frame(&request).unwrap().as_bytes())
                .await
                .unwrap();
            pending.push((request.id, paths, value));
        }

        for (id, paths, expected) in pending {
            let response = tokio::task::spawn_blocking(move || {
                LockReader::new(Duration::from_secs(5), Duration::from_millis(2))
                    .read(&paths)
                    .unwrap()
            })
            .await
            .unwrap();
            assert_eq!(response.id, Some(id));
            assert_eq!(response.into_result().unwrap(), json!(expected));
        }
    }
}
