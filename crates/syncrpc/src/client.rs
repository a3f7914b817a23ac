//! Blocking client: start a worker on first use, then make synchronous calls.
//!
//! The first call spawns the worker, waits until it answers a ping and picks a
//! transport. LOAD requests, and any call without a persistent socket, take the
//! cold path: one blocking transport round trip. INVOKE requests otherwise take
//! the warm path: the frame goes over the persistent socket and the response comes
//! back through a lock-file pair.

use std::ffi::OsString;
use std::io::Write;
use std::net::{Ipv4Addr, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use crate::bridge::codec::encode_frame;
use crate::bridge::protocol::{Handle, Request, RequestBody, Response};
use crate::error::Error;
use crate::lockfile::{DEFAULT_LOCK_TIMEOUT, LockPaths, LockReader};
use crate::orchestrator::{
    CommandSpawner, OrchestratorError, WorkerProcess, WorkerSpawner, find_port,
};
use crate::transport::{
    BlockingTransport, DEFAULT_INLINE_LIMIT, NetcatTransport, RelayTransport, TransportProber,
};

pub const LOCK_DIR_ENV: &str = "SYNCRPC_LOCK_DIR";
pub const READ_TIMEOUT_ENV: &str = "SYNCRPC_READ_TIMEOUT_MS";
pub const STARTUP_TIMEOUT_ENV: &str = "SYNCRPC_STARTUP_TIMEOUT_MS";

#[derive(Clone)]
pub struct ClientConfig {
    /// Worker binary. Also the relay program for the default transport list.
    pub program: PathBuf,
    /// Arguments placed before the port (worker) or `relay` subcommand.
    pub program_args: Vec<OsString>,
    /// Overrides the default [`CommandSpawner`].
    pub spawner: Option<Arc<dyn WorkerSpawner>>,
    /// Transport candidates in priority order. Defaults to netcat, then relay.
    pub transports: Option<Vec<Arc<dyn BlockingTransport>>>,
    pub startup_timeout: Duration,
    /// Bound on each warm-path lock-file wait.
    pub read_timeout: Duration,
    pub lock_poll_interval: Duration,
    /// Shared lock directory. A private temporary directory is used when unset.
    pub lock_dir: Option<PathBuf>,
    /// Use the persistent socket and lock files for INVOKE calls.
    pub keep_alive: bool,
    pub inline_limit: usize,
}

impl std::fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let transports: Option<Vec<_>> = self
            .transports
            .as_ref()
            .map(|ts| ts.iter().map(|t| t.name()).collect());
        f.debug_struct("ClientConfig")
            .field("program", &self.program)
            .field("program_args", &self.program_args)
            .field("custom_spawner", &self.spawner.is_some())
            .field("transports", &transports)
            .field("startup_timeout", &self.startup_timeout)
            .field("read_timeout", &self.read_timeout)
            .field("lock_poll_interval", &self.lock_poll_interval)
            .field("lock_dir", &self.lock_dir)
            .field("keep_alive", &self.keep_alive)
            .field("inline_limit", &self.inline_limit)
            .finish()
    }
}

impl ClientConfig {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            program_args: Vec::new(),
            spawner: None,
            transports: None,
            startup_timeout: Duration::from_secs(10),
            read_timeout: DEFAULT_LOCK_TIMEOUT,
            lock_poll_interval: Duration::from_millis(2),
            lock_dir: None,
            keep_alive: true,
            inline_limit: DEFAULT_INLINE_LIMIT,
        }
    }

    /// [`new`](Self::new) with `SYNCRPC_LOCK_DIR`, `SYNCRPC_READ_TIMEOUT_MS` and
    /// `SYNCRPC_STARTUP_TIMEOUT_MS` applied.
    pub fn from_env(program: impl Into<PathBuf>) -> Self {
        let mut config = Self::new(program);
        if let Some(dir) = std::env::var_os(LOCK_DIR_ENV).filter(|d| !d.is_empty()) {
            config.lock_dir = Some(PathBuf::from(dir));
        }
        if let Some(timeout) = env_millis(READ_TIMEOUT_ENV) {
            config.read_timeout = timeout;
        }
        if let Some(timeout) = env_millis(STARTUP_TIMEOUT_ENV) {
            config.startup_timeout = timeout;
        }
        config
    }

    pub fn with_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.program_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_spawner(mut self, spawner: Arc<dyn WorkerSpawner>) -> Self {
        self.spawner = Some(spawner);
        self
    }

    pub fn with_transports(mut self, transports: Vec<Arc<dyn BlockingTransport>>) -> Self {
        self.transports = Some(transports);
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout = timeout;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_lock_poll_interval(mut self, interval: Duration) -> Self {
        self.lock_poll_interval = interval;
        self
    }

    pub fn with_lock_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.lock_dir = Some(dir.into());
        self
    }

    pub fn with_keep_alive(mut self, keep_alive: bool) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn with_inline_limit(mut self, limit: usize) -> Self {
        self.inline_limit = limit;
        self
    }

    /// The relay transport for this program.
    pub fn relay_transport(&self) -> RelayTransport {
        RelayTransport::new(&self.program)
            .with_args(self.program_args.iter().cloned())
            .with_inline_limit(self.inline_limit)
    }

    fn spawner(&self) -> Arc<dyn WorkerSpawner> {
        match &self.spawner {
            Some(spawner) => Arc::clone(spawner),
            None => Arc::new(
                CommandSpawner::new(&self.program).with_args(self.program_args.iter().cloned()),
            ),
        }
    }

    fn prober(&self) -> TransportProber {
        let candidates = match &self.transports {
            Some(transports) => transports.clone(),
            None => vec![
                Arc::new(NetcatTransport::default()) as Arc<dyn BlockingTransport>,
                Arc::new(self.relay_transport()),
            ],
        };
        TransportProber::new(candidates)
    }
}

fn env_millis(name: &str) -> Option<Duration> {
    let raw = std::env::var(name).ok()?;
    match raw.trim().parse::<u64>() {
        Ok(ms) => Some(Duration::from_millis(ms)),
        Err(e) => {
            tracing::warn!(name, value = %raw, error = %e, "Ignoring invalid duration override");
            None
        }
    }
}

/// One worker process and everything needed to talk to it.
///
/// Cheap to clone; clones share the worker. The worker is terminated when the
/// last clone (including every [`RemoteFn`]) is dropped, or on [`shutdown`].
///
/// [`shutdown`]: Session::shutdown
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

struct SessionInner {
    config: ClientConfig,
    state: Mutex<Option<Connection>>,
    /// Bumped for every worker started; handles carry the value they were issued under.
    generations: AtomicU64,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("program", &self.inner.config.program)
            .field("port", &self.port())
            .field("transport", &self.transport_name())
            .finish()
    }
}

impl Session {
    /// A session that starts its worker lazily, on the first call.
    pub fn new(config: ClientConfig) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                config,
                state: Mutex::new(None),
                generations: AtomicU64::new(0),
            }),
        }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Load `module_ref` with `init_arg` and return a blocking handle to it.
    pub fn create_client(&self, module_ref: &str, init_arg: Value) -> Result<RemoteFn, Error> {
        let (generation, value) = self.send(
            RequestBody::Load {
                module_ref: module_ref.to_string(),
                argument: init_arg,
            },
            None,
        )?;
        let handle = value
            .as_u64()
            .map(Handle::new)
            .ok_or_else(|| Error::Protocol(format!("LOAD returned {value} instead of a handle")))?;
        tracing::debug!(module_ref, %handle, "Client created");
        Ok(RemoteFn {
            session: self.clone(),
            handle,
            generation,
            module_ref: module_ref.to_string(),
        })
    }

    /// Start the worker now instead of on the first call.
    pub fn start(&self) -> Result<(), Error> {
        let mut state = self.lock_state();
        if state.is_none() {
            *state = Some(self.establish()?);
        }
        Ok(())
    }

    pub fn is_started(&self) -> bool {
        self.lock_state().is_some()
    }

    pub fn port(&self) -> Option<u16> {
        self.lock_state().as_ref().map(|c| c.worker.port())
    }

    /// Name of the transport the prober selected.
    pub fn transport_name(&self) -> Option<&'static str> {
        self.lock_state().as_ref().map(|c| c.transport.name())
    }

    /// Terminate the worker. Clients created so far fail with
    /// [`Error::StaleHandle`] from now on; the next `create_client` starts a fresh
    /// worker.
    pub fn shutdown(&self) {
        let connection = self.lock_state().take();
        if let Some(connection) = connection {
            tracing::info!(port = connection.worker.port(), "Shutting down worker");
            drop(connection);
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, Option<Connection>> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn establish(&self) -> Result<Connection, Error> {
        let mut connection = Connection::establish(&self.inner.config)?;
        connection.generation = self.inner.generations.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(connection)
    }

    /// Send `body` to the worker, starting one if needed. With `issued_under`, the
    /// call is refused unless the current worker is the one that issued the handle.
    fn send(&self, body: RequestBody, issued_under: Option<u64>) -> Result<(u64, Value), Error> {
        let mut state = self.lock_state();
        if let Some(generation) = issued_under
            && state.as_ref().map(|c| c.generation) != Some(generation)
        {
            return Err(Error::StaleHandle);
        }
        let connection = match state.take() {
            Some(connection) => connection,
            None => self.establish()?,
        };
        let connection = state.insert(connection);
        let generation = connection.generation;

        let request = Request::new(body);
        let id = request.id;
        let response = connection.dispatch(request)?;
        if let Some(echoed) = response.id
            && echoed != id
        {
            return Err(Error::Protocol(format!(
                "response for request {echoed} arrived for request {id}"
            )));
        }
        Ok((generation, response.into_result()?))
    }
}

struct Connection {
    generation: u64,
    worker: WorkerProcess,
    transport: Arc<dyn BlockingTransport>,
    keep_alive: Option<TcpStream>,
    use_keep_alive: bool,
    reader: LockReader,
    lock_dir: LockDir,
}

impl Connection {
    fn establish(config: &ClientConfig) -> Result<Self, Error> {
        let port = find_port().map_err(OrchestratorError::Io)?;
        let spawner = config.spawner();
        let mut worker = WorkerProcess::spawn(spawner.as_ref(), port)?;
        worker.wait_for_alive(config.startup_timeout)?;

        let transport = config
            .prober()
            .select(port)
            .ok_or(OrchestratorError::NoTransport)?;

        let lock_dir = LockDir::create(config.lock_dir.as_deref())?;
        let reader = LockReader::watching(
            lock_dir.path(),
            config.read_timeout,
            config.lock_poll_interval,
        );

        tracing::info!(
            port,
            pid = worker.pid(),
            transport = transport.name(),
            lock_dir = %lock_dir.path().display(),
            watching = reader.is_watching(),
            "Session ready"
        );

        Ok(Self {
            generation: 0,
            worker,
            transport,
            keep_alive: None,
            use_keep_alive: config.keep_alive,
            reader,
            lock_dir,
        })
    }

    fn dispatch(&mut self, request: Request) -> Result<Response, Error> {
        if !self.worker.is_running() {
            return Err(Error::WorkerExited);
        }

        if !request.is_load() && self.use_keep_alive && self.ensure_keep_alive() {
            let paths = LockPaths::for_request(self.lock_dir.path(), request.id);
            let frame = encode_frame(&request.clone().with_handoff(paths.handoff()))?;
            if self.send_keep_alive(&frame) {
                tracing::trace!(request_id = %request.id, "Warm call");
                let worker = &mut self.worker;
                return Ok(self.reader.read_while(&paths, || worker.is_running())?);
            }
        }

        self.cold(&request)
    }

    fn cold(&self, request: &Request) -> Result<Response, Error> {
        tracing::trace!(request_id = %request.id, transport = self.transport.name(), "Cold call");
        let frame = encode_frame(request)?;
        let output = self
            .transport
            .round_trip(self.worker.port(), &frame)
            .map_err(|e| Error::Transport {
                transport: self.transport.name(),
                detail: e.to_string(),
            })?;

        serde_json::from_slice::<Response>(&output.stdout).map_err(|e| Error::Transport {
            transport: self.transport.name(),
            detail: format!("undecodable reply ({e}); {}", output.describe_failure()),
        })
    }

    /// Connect the persistent socket if it is not connected. False if that fails.
    fn ensure_keep_alive(&mut self) -> bool {
        if self.keep_alive.is_some() {
            return true;
        }
        match TcpStream::connect((Ipv4Addr::LOCALHOST, self.worker.port())) {
            Ok(stream) => {
                let _ = stream.set_nodelay(true);
                tracing::debug!(port = self.worker.port(), "Persistent socket connected");
                self.keep_alive = Some(stream);
                true
            }
            Err(e) => {
                tracing::debug!(error = %e, "Persistent socket unavailable, using cold path");
                false
            }
        }
    }

    /// Write a frame on the persistent socket, dropping the socket on failure.
    fn send_keep_alive(&mut self, frame: &str) -> bool {
        let Some(stream) = self.keep_alive.as_mut() else {
            return false;
        };
        match stream.write_all(frame.as_bytes()).and_then(|()| stream.flush()) {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(error = %e, "Persistent socket write failed, falling back to cold path");
                self.keep_alive = None;
                false
            }
        }
    }
}

/// Lock directory for one session; removed on drop when the session created it.
struct LockDir {
    path: PathBuf,
    owned: bool,
}

impl LockDir {
    fn create(configured: Option<&Path>) -> std::io::Result<Self> {
        let (path, owned) = match configured {
            Some(path) => (path.to_path_buf(), false),
            None => (
                std::env::temp_dir().join(format!(
                    "syncrpc-{}-{}",
                    std::process::id(),
                    uuid::Uuid::new_v4().simple()
                )),
                true,
            ),
        };
        std::fs::create_dir_all(&path)?;
        Ok(Self { path, owned })
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockDir {
    fn drop(&mut self) {
        if self.owned
            && let Err(e) = std::fs::remove_dir_all(&self.path)
        {
            tracing::debug!(path = %self.path.display(), error = %e, "Failed to remove lock directory");
        }
    }
}

/// A loaded callable in the worker. Each call blocks until it resolves.
#[derive(Debug, Clone)]
pub struct RemoteFn {
    session: Session,
    handle: Handle,
    /// Worker generation that issued `handle`.
    generation: u64,
    module_ref: String,
}

impl RemoteFn {
    /// Invoke the callable. Fails with [`Error::StaleHandle`] once the worker that
    /// loaded it has been shut down.
    ///
    /// An object whose only key is `$bytes` is read as a binary payload (see
    /// [`payload`](crate::payload)).
    pub fn call(&self, argument: Value) -> Result<Value, Error> {
        let (_, value) = self.session.send(
            RequestBody::Invoke {
                handle: self.handle,
                argument,
            },
            Some(self.generation),
        )?;
        Ok(value)
    }

    /// [`call`](Self::call) with serde conversion on both sides.
    pub fn call_as<A, R>(&self, argument: &A) -> Result<R, Error>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let argument = serde_json::to_value(argument)
            .map_err(|e| Error::Protocol(format!("argument is not representable as JSON: {e}")))?;
        let value = self.call(argument)?;
        serde_json::from_value(value)
            .map_err(|e| Error::Protocol(format!("unexpected result for {}: {e}", self.module_ref)))
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn module_ref(&self) -> &str {
        &self.module_ref
    }

    pub fn session(&self) -> &Session {
        &self.session
    }
}
