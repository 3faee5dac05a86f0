//! Resident server for one target tool.
//!
//! The server listens on the target's endpoint socket and serves `Check` and
//! `Run` requests, one thread per connection so health checks are answered
//! while a run is in progress. Runs themselves are serialized by a single
//! mutex around the context pool. A monitor thread retires the server when it
//! has been idle too long or when the target is rebuilt.

use std::env;
use std::ffi::{OsStr, OsString};
use std::io;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use super::monitor::{RetireReason, ServerMonitor};
use super::protocol::{
    ErrorCode, ErrorResponse, FramedMessage, HealthStatus, PROTOCOL_VERSION, Request, RunRequest,
    Response, decode_message, default_socket_dir, endpoint_name, read_frame, socket_path,
    write_frame,
};
use crate::context::loader::ToolLoader;
use crate::context::native_deps_from_env;
use crate::logging::{LogLine, LogSink};
use crate::pool::{ExecutionContextPool, PoolConfig};

const SINGLE_INSTANCE_RETRIES: usize = 10;
const SINGLE_INSTANCE_WAIT: Duration = Duration::from_millis(20);
const ACCEPT_POLL: Duration = Duration::from_millis(10);

/// Configuration for the exec server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Absolute path of the tool this server hosts.
    pub target: PathBuf,
    /// Path to the endpoint socket.
    pub socket_path: PathBuf,
    /// Native dependency files or directories loaded alongside the tool.
    pub native_deps: Vec<PathBuf>,
    /// Context pool settings.
    pub pool: PoolConfig,
    /// Idle shutdown timeout (0 = never shutdown).
    pub idle_timeout: Duration,
    /// Sampling interval of the monitor thread.
    pub monitor_interval: Duration,
}

impl ServerConfig {
    /// Defaults for `target`, with the socket in the default socket directory.
    pub fn new(target: impl Into<PathBuf>) -> Self {
        let target = target.into();
        let socket_path = socket_path(&default_socket_dir(), &endpoint_name(&target));
        Self {
            target,
            socket_path,
            native_deps: Vec::new(),
            pool: PoolConfig::default(),
            idle_timeout: Duration::from_secs(300),
            monitor_interval: Duration::from_secs(1),
        }
    }

    /// Load config from environment variables.
    pub fn from_env(target: impl Into<PathBuf>) -> Self {
        let mut cfg = Self::new(target);
        cfg.native_deps = native_deps_from_env();
        cfg.pool = PoolConfig::from_env();

        if let Ok(val) = dotenvy::var("EXEC_SERVER_IDLE_TIMEOUT_SECS")
            && let Ok(secs) = val.parse()
        {
            cfg.idle_timeout = Duration::from_secs(secs);
        }

        if let Ok(val) = dotenvy::var("EXEC_SERVER_MONITOR_INTERVAL_MS")
            && let Ok(ms) = val.parse::<u64>()
            && ms > 0
        {
            cfg.monitor_interval = Duration::from_millis(ms);
        }

        cfg
    }
}

/// How a call to [`ExecutionServer::serve`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeOutcome {
    /// Another live server already owns the endpoint.
    AlreadyRunning,
    /// The monitor retired the server.
    Retired(RetireReason),
    /// A `Shutdown` request or [`ExecutionServer::request_shutdown`].
    ShutdownRequested,
}

/// Exec server state.
pub struct ExecutionServer {
    config: ServerConfig,
    pool: ExecutionContextPool,
    monitor: ServerMonitor,
    run_lock: Mutex<()>,
    start_time: Instant,
    total_runs: AtomicU64,
    shutdown: AtomicBool,
    outcome: Mutex<Option<ServeOutcome>>,
    last_activity: RwLock<Instant>,
}

impl ExecutionServer {
    /// Create a server with the given configuration and tool loader.
    pub fn new(config: ServerConfig, loader: Arc<dyn ToolLoader>) -> Self {
        let monitor = ServerMonitor::new(&config.target, config.idle_timeout);
        let pool = ExecutionContextPool::new(config.pool.clone(), loader);
        Self {
            config,
            pool,
            monitor,
            run_lock: Mutex::new(()),
            start_time: Instant::now(),
            total_runs: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
            outcome: Mutex::new(None),
            last_activity: RwLock::new(Instant::now()),
        }
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Get current uptime in seconds.
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    pub fn total_runs(&self) -> u64 {
        self.total_runs.load(Ordering::Relaxed)
    }

    /// Update last activity timestamp.
    fn touch_activity(&self) {
        *self.last_activity.write() = Instant::now();
    }

    /// Request the server to stop. The first recorded reason wins.
    fn stop(&self, outcome: ServeOutcome) {
        let mut slot = self.outcome.lock();
        if slot.is_none() {
            *slot = Some(outcome);
        }
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Request the server to shutdown.
    pub fn request_shutdown(&self) {
        self.stop(ServeOutcome::ShutdownRequested);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Bind the endpoint and serve until retired or asked to stop.
    ///
    /// Returns [`ServeOutcome::AlreadyRunning`] without serving when another
    /// live server owns the endpoint.
    pub fn serve(self: &Arc<Self>) -> io::Result<ServeOutcome> {
        let Some(listener) = bind_single_instance(&self.config.socket_path)? else {
            info!(
                socket = %self.config.socket_path.display(),
                "Endpoint already served by a live server"
            );
            return Ok(ServeOutcome::AlreadyRunning);
        };
        listener.set_nonblocking(true)?;

        info!(
            socket = %self.config.socket_path.display(),
            target = %self.config.target.display(),
            pooling = self.pool.pooling_enabled(),
            idle_timeout_secs = self.config.idle_timeout.as_secs(),
            "Exec server listening"
        );

        let monitor = {
            let server = Arc::clone(self);
            thread::Builder::new()
                .name("exec-server-monitor".into())
                .spawn(move || server.monitor_loop())?
        };

        while !self.is_shutting_down() {
            match listener.accept() {
                Ok((stream, _addr)) => {
                    self.touch_activity();
                    let server = Arc::clone(self);
                    let spawned = thread::Builder::new()
                        .name("exec-server-conn".into())
                        .spawn(move || {
                            if let Err(e) = server.handle_connection(stream) {
                                debug!(error = %e, "Connection error");
                            }
                        });
                    if let Err(e) = spawned {
                        error!(error = %e, "Failed to spawn connection thread");
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL);
                }
                Err(e) => {
                    error!(error = %e, "Accept error");
                    thread::sleep(Duration::from_millis(100));
                }
            }
        }

        // Give the endpoint up first so a replacement server can bind while
        // the last run drains.
        drop(listener);
        if self.config.socket_path.exists() {
            let _ = std::fs::remove_file(&self.config.socket_path);
        }
        if monitor.join().is_err() {
            warn!("Monitor thread panicked");
        }

        {
            let _running = self.run_lock.lock();
            self.pool.shutdown();
        }

        let outcome = (*self.outcome.lock()).unwrap_or(ServeOutcome::ShutdownRequested);
        info!(?outcome, total_runs = self.total_runs(), "Exec server stopped");
        Ok(outcome)
    }

    fn monitor_loop(&self) {
        while !self.is_shutting_down() {
            thread::sleep(self.config.monitor_interval);
            if self.pool.pooling_enabled() {
                let recycled = self.pool.recycle();
                if recycled > 0 {
                    debug!(recycled, "Recycled stale execution contexts");
                }
            }
            let last = *self.last_activity.read();
            if let Some(reason) = self.monitor.check(last, self.run_lock.is_locked()) {
                info!(%reason, "Retiring exec server");
                self.stop(ServeOutcome::Retired(reason));
            }
        }
    }

    /// Handle a single client connection.
    fn handle_connection(&self, mut stream: UnixStream) -> io::Result<()> {
        stream.set_nonblocking(false)?;

        while let Some(payload) = read_frame(&mut stream)? {
            self.touch_activity();

            let (request_id, response) = match decode_message::<Request>(&payload) {
                Ok(msg) if msg.version != PROTOCOL_VERSION => {
                    warn!(
                        client = msg.version,
                        server = PROTOCOL_VERSION,
                        "Protocol version mismatch"
                    );
                    (
                        msg.request_id,
                        error_response(
                            ErrorCode::VersionMismatch,
                            format!(
                                "protocol version {} not supported (server speaks {PROTOCOL_VERSION})",
                                msg.version
                            ),
                        ),
                    )
                }
                Ok(msg) => {
                    let response = self.handle_request(&msg.request_id, msg.payload, &stream)?;
                    (msg.request_id, response)
                }
                Err(e) => {
                    warn!(error = %e, "Failed to decode request");
                    (
                        "error".to_string(),
                        error_response(ErrorCode::InvalidInput, e.to_string()),
                    )
                }
            };

            let done = matches!(response, Response::Shutdown { .. });
            write_frame(&mut stream, &FramedMessage::new(request_id, response))?;
            if done {
                return Ok(());
            }
        }

        debug!("Client disconnected");
        Ok(())
    }

    /// Handle a single request.
    fn handle_request(
        &self,
        request_id: &str,
        request: Request,
        stream: &UnixStream,
    ) -> io::Result<Response> {
        Ok(match request {
            Request::Check => Response::Check(HealthStatus {
                uptime_secs: self.uptime_secs(),
                version: PROTOCOL_VERSION,
                pid: std::process::id(),
                target: self.config.target.clone(),
                total_runs: self.total_runs(),
                pooled_contexts: self.pool.len(),
            }),

            Request::Run(_) if self.is_shutting_down() => {
                debug!(request_id = %request_id, "Run refused, server is shutting down");
                error_response(
                    ErrorCode::ShuttingDown,
                    "exec server is shutting down".to_string(),
                )
            }

            Request::Run(run) => {
                let sink = ConnectionSink::new(stream.try_clone()?, request_id);
                let status = self.execute(&run, &sink);
                Response::Exit { status }
            }

            Request::Shutdown => {
                info!(request_id = %request_id, "Shutdown requested");
                self.request_shutdown();
                Response::Shutdown {
                    message: "exec server shutting down".to_string(),
                }
            }
        })
    }

    /// Run the target once under the run lock and return its status.
    pub fn execute(&self, run: &RunRequest, sink: &dyn LogSink) -> i32 {
        let _running = self.run_lock.lock();
        let started = Instant::now();
        debug!(args = run.args.len(), "Run started");

        let status = {
            let _environment = RunEnvironment::apply(run);
            match self
                .pool
                .run(&self.config.target, &self.config.native_deps, &run.args, sink)
            {
                Ok(status) => status,
                Err(e) => {
                    sink.error(&format!("Unable to run {}: {e}", self.config.target.display()));
                    1
                }
            }
        };

        self.total_runs.fetch_add(1, Ordering::Relaxed);
        self.touch_activity();
        info!(
            status,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Run finished"
        );
        status
    }
}

fn error_response(code: ErrorCode, message: String) -> Response {
    Response::Error(ErrorResponse { code, message })
}

/// Bind `socket_path`, deferring to a live server and replacing a stale socket.
///
/// Returns `Ok(None)` when another server answers on the socket.
pub fn bind_single_instance(socket_path: &Path) -> io::Result<Option<UnixListener>> {
    if let Some(parent) = socket_path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    match UnixListener::bind(socket_path) {
        Ok(listener) => return Ok(Some(listener)),
        Err(err) => {
            for _ in 0..SINGLE_INSTANCE_RETRIES {
                if UnixStream::connect(socket_path).is_ok() {
                    return Ok(None);
                }
                thread::sleep(SINGLE_INSTANCE_WAIT);
            }
            debug!(
                socket = %socket_path.display(),
                error = %err,
                "Socket bind failed and nobody answers, treating as stale"
            );
        }
    }

    let _ = std::fs::remove_file(socket_path);
    UnixListener::bind(socket_path).map(Some)
}

/// Streams a run's log lines to the client as `Log` frames.
struct ConnectionSink {
    stream: Mutex<UnixStream>,
    request_id: String,
    broken: AtomicBool,
}

impl ConnectionSink {
    fn new(stream: UnixStream, request_id: &str) -> Self {
        Self {
            stream: Mutex::new(stream),
            request_id: request_id.to_string(),
            broken: AtomicBool::new(false),
        }
    }
}

impl LogSink for ConnectionSink {
    fn log(&self, line: LogLine) {
        if self.broken.load(Ordering::Relaxed) {
            return;
        }
        let msg = FramedMessage::new(self.request_id.clone(), Response::Log(line));
        if let Err(e) = write_frame(&mut *self.stream.lock(), &msg) {
            debug!(error = %e, "Client went away, dropping further log lines");
            self.broken.store(true, Ordering::Relaxed);
        }
    }
}

/// The client's working directory and environment, applied for one run and
/// reverted on drop.
struct RunEnvironment {
    previous_dir: Option<PathBuf>,
    previous_vars: Vec<(String, Option<OsString>)>,
}

impl RunEnvironment {
    fn apply(run: &RunRequest) -> Self {
        let mut previous_dir = None;
        if let Some(dir) = &run.working_dir {
            let current = env::current_dir().ok();
            match env::set_current_dir(dir) {
                Ok(()) => previous_dir = current,
                Err(e) => warn!(dir = %dir.display(), error = %e, "Cannot enter client working directory"),
            }
        }

        let mut previous_vars = Vec::new();
        for (key, value) in &run.env {
            if key.is_empty() || key.contains(['=', '\0']) || value.contains('\0') {
                continue;
            }
            let old = env::var_os(key);
            if old.as_deref() == Some(OsStr::new(value)) {
                continue;
            }
            // SAFETY: runs are serialized by the run lock and nothing else in
            // the server reads the environment once it is serving.
            unsafe { env::set_var(key, value) };
            previous_vars.push((key.clone(), old));
        }

        Self {
            previous_dir,
            previous_vars,
        }
    }
}

impl Drop for RunEnvironment {
    fn drop(&mut self) {
        for (key, old) in self.previous_vars.drain(..).rev() {
            // SAFETY: see `RunEnvironment::apply`.
            unsafe {
                match old {
                    Some(value) => env::set_var(&key, value),
                    None => env::remove_var(&key),
                }
            }
        }
        if let Some(dir) = self.previous_dir.take()
            && let Err(e) = env::set_current_dir(&dir)
        {
            warn!(dir = %dir.display(), error = %e, "Cannot restore working directory");
        }
    }
}
