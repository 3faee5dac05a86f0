//! Exec client: forwards one tool invocation to the target's resident server.
//!
//! The client checks the endpoint, spawns a detached server when nobody
//! answers (at most once per invocation) and retries with a fixed wait until
//! a run is accepted. Once a run has been submitted it is never retried.

use std::io;
use std::os::unix::net::UnixStream;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use thiserror::Error;
use tracing::{debug, info, warn};

use super::protocol::{
    ErrorCode, FramedMessage, HealthStatus, PROTOCOL_VERSION, Request, Response, RunRequest, decode_message,
    default_socket_dir, endpoint_name, read_frame, socket_path, write_frame,
};
use crate::logging::LogSink;

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("exec server unreachable at {path}: {source}")]
    Unreachable { path: PathBuf, source: io::Error },

    #[error("exec server is retiring: {0}")]
    Retiring(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("connection to exec server lost after the run was submitted: {0}")]
    Broken(io::Error),
}

/// Configuration for the exec client.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Tool the server hosts.
    pub target: PathBuf,
    /// Path to the endpoint socket.
    pub socket_path: PathBuf,
    /// Attempts before giving up.
    pub max_retries: u32,
    /// Sleep between attempts.
    pub retry_wait: Duration,
    /// Bound on the `Check` exchange.
    pub connect_timeout: Duration,
    /// Binary started as the server (current executable if unset).
    pub server_binary: Option<PathBuf>,
}

impl ClientConfig {
    pub fn new(target: impl Into<PathBuf>) -> Self {
        let target = target.into();
        let socket_path = socket_path(&default_socket_dir(), &endpoint_name(&target));
        Self {
            target,
            socket_path,
            max_retries: 10,
            retry_wait: Duration::from_millis(500),
            connect_timeout: Duration::from_millis(100),
            server_binary: None,
        }
    }

    /// Load config from environment variables.
    pub fn from_env(target: impl Into<PathBuf>) -> Self {
        let mut cfg = Self::new(target);

        if let Ok(val) = dotenvy::var("EXEC_SERVER_MAX_RETRIES")
            && let Ok(n) = val.parse::<u32>()
        {
            cfg.max_retries = n.max(1);
        }

        if let Ok(val) = dotenvy::var("EXEC_SERVER_RETRY_WAIT_MS")
            && let Ok(ms) = val.parse::<u64>()
        {
            cfg.retry_wait = Duration::from_millis(ms);
        }

        if let Ok(val) = dotenvy::var("EXEC_SERVER_CONNECT_TIMEOUT_MS")
            && let Ok(ms) = val.parse::<u64>()
            && ms > 0
        {
            cfg.connect_timeout = Duration::from_millis(ms);
        }

        if let Ok(path) = dotenvy::var("EXEC_SERVER_BINARY") {
            cfg.server_binary = Some(PathBuf::from(path));
        }

        cfg
    }
}

/// Starts a server for a target when none is reachable.
pub trait ServerSpawner: Send + Sync {
    fn spawn(&self, target: &Path) -> io::Result<()>;
}

/// Spawns `<binary> /server <target>` as a detached background process.
#[derive(Debug, Clone, Default)]
pub struct ProcessSpawner {
    binary: Option<PathBuf>,
}

impl ProcessSpawner {
    pub fn new(binary: Option<PathBuf>) -> Self {
        Self { binary }
    }
}

impl ServerSpawner for ProcessSpawner {
    fn spawn(&self, target: &Path) -> io::Result<()> {
        let binary = match &self.binary {
            Some(binary) => binary.clone(),
            None => std::env::current_exe()?,
        };

        let child = Command::new(&binary)
            .arg("/server")
            .arg(target)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .process_group(0)
            .spawn()?;

        info!(
            pid = child.id(),
            binary = %binary.display(),
            target = %target.display(),
            "Spawned exec server process"
        );
        Ok(())
    }
}

/// Unix Domain Socket client for one target's exec server.
pub struct ExecClient {
    config: ClientConfig,
    spawner: Box<dyn ServerSpawner>,
    request_counter: AtomicU64,
}

impl ExecClient {
    pub fn new(config: ClientConfig, spawner: Box<dyn ServerSpawner>) -> Self {
        Self {
            config,
            spawner,
            request_counter: AtomicU64::new(0),
        }
    }

    /// Client for `target` with environment config and the process spawner.
    pub fn with_defaults(target: impl Into<PathBuf>) -> Self {
        let config = ClientConfig::from_env(target);
        let spawner = ProcessSpawner::new(config.server_binary.clone());
        Self::new(config, Box::new(spawner))
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    fn next_request_id(&self) -> String {
        format!(
            "exec-{}-{}",
            std::process::id(),
            self.request_counter.fetch_add(1, Ordering::Relaxed)
        )
    }

    fn connect(&self) -> Result<UnixStream, ClientError> {
        let unreachable = |source| ClientError::Unreachable {
            path: self.config.socket_path.clone(),
            source,
        };
        let stream = UnixStream::connect(&self.config.socket_path).map_err(unreachable)?;
        stream
            .set_read_timeout(Some(self.config.connect_timeout))
            .map_err(unreachable)?;
        stream
            .set_write_timeout(Some(self.config.connect_timeout))
            .map_err(unreachable)?;
        Ok(stream)
    }

    fn read_response(&self, stream: &mut UnixStream) -> io::Result<Option<Response>> {
        let Some(payload) = read_frame(stream)? else {
            return Ok(None);
        };
        let msg: FramedMessage<Response> = decode_message(&payload)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        if msg.version != PROTOCOL_VERSION {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "protocol version mismatch: expected {PROTOCOL_VERSION}, got {}",
                    msg.version
                ),
            ));
        }
        Ok(Some(msg.payload))
    }

    /// Send `Check` on `stream` and wait for the answer.
    fn check_on(&self, stream: &mut UnixStream) -> Result<HealthStatus, ClientError> {
        let unreachable = |source| ClientError::Unreachable {
            path: self.config.socket_path.clone(),
            source,
        };
        write_frame(stream, &FramedMessage::new(self.next_request_id(), Request::Check))
            .map_err(unreachable)?;
        match self.read_response(stream).map_err(unreachable)? {
            Some(Response::Check(health)) => Ok(health),
            Some(Response::Error(err)) => Err(ClientError::Protocol(err.message)),
            Some(other) => Err(ClientError::Protocol(format!(
                "unexpected response: {other:?}"
            ))),
            None => Err(unreachable(io::Error::from(io::ErrorKind::UnexpectedEof))),
        }
    }

    /// Ask the server for its health.
    pub fn check(&self) -> Result<HealthStatus, ClientError> {
        let mut stream = self.connect()?;
        self.check_on(&mut stream)
    }

    /// Single attempt: `Check`, then `Run`, streaming log lines into `sink`.
    ///
    /// Errors before the run is submitted are [`ClientError::Unreachable`];
    /// errors afterwards are [`ClientError::Broken`]. A server that refuses
    /// the run because it is retiring yields [`ClientError::Retiring`].
    pub fn run(&self, request: &RunRequest, sink: &dyn LogSink) -> Result<i32, ClientError> {
        let mut stream = self.connect()?;
        let health = self.check_on(&mut stream)?;
        debug!(
            pid = health.pid,
            uptime_secs = health.uptime_secs,
            total_runs = health.total_runs,
            "Exec server is alive"
        );

        let request_id = self.next_request_id();
        write_frame(
            &mut stream,
            &FramedMessage::new(&request_id, Request::Run(request.clone())),
        )
        .map_err(|source| ClientError::Unreachable {
            path: self.config.socket_path.clone(),
            source,
        })?;

        // The run itself is unbounded.
        stream.set_read_timeout(None).map_err(ClientError::Broken)?;

        loop {
            match self.read_response(&mut stream).map_err(ClientError::Broken)? {
                Some(Response::Log(line)) => sink.log(line),
                Some(Response::Exit { status }) => {
                    debug!(request_id = %request_id, status, "Run completed");
                    return Ok(status);
                }
                // Refused before running anything, so a retry is safe.
                Some(Response::Error(err)) if err.code == ErrorCode::ShuttingDown => {
                    return Err(ClientError::Retiring(err.message));
                }
                Some(Response::Error(err)) => return Err(ClientError::Protocol(err.message)),
                Some(other) => {
                    return Err(ClientError::Protocol(format!(
                        "unexpected response: {other:?}"
                    )));
                }
                None => return Err(ClientError::Broken(io::ErrorKind::UnexpectedEof.into())),
            }
        }
    }

    /// Forward `args` with this process's working directory and environment,
    /// spawning a server if needed. Returns the tool's status, or 1 on failure.
    pub fn execute(&self, args: &[String], sink: &dyn LogSink) -> i32 {
        let request = RunRequest {
            args: args.to_vec(),
            working_dir: std::env::current_dir().ok(),
            env: std::env::vars().collect(),
        };

        let attempts = self.config.max_retries.max(1);
        let mut spawned = false;
        let mut last_error = None;

        for attempt in 1..=attempts {
            match self.run(&request, sink) {
                Ok(status) => return status,
                Err(ClientError::Unreachable { source, .. }) => {
                    debug!(attempt, error = %source, "Exec server not reachable");
                    last_error = Some(source);
                    if !spawned {
                        spawned = true;
                        if let Err(e) = self.spawner.spawn(&self.config.target) {
                            warn!(error = %e, "Failed to spawn exec server");
                        }
                    }
                    if attempt < attempts {
                        std::thread::sleep(self.config.retry_wait);
                    }
                }
                Err(ClientError::Retiring(message)) => {
                    // The old server still owns the endpoint; spawning now
                    // would only defer to it. Wait for it to go away.
                    debug!(attempt, %message, "Exec server retiring");
                    last_error = Some(io::Error::other(message));
                    if attempt < attempts {
                        std::thread::sleep(self.config.retry_wait);
                    }
                }
                Err(e) => {
                    sink.error(&format!("ERROR {e}"));
                    return 1;
                }
            }
        }

        if let Some(e) = last_error {
            debug!(error = %e, attempts, "Giving up on exec server");
        }
        sink.error(&format!(
            "ERROR cannot connect to exec server: {}",
            command_line(&self.config.target, args)
        ));
        1
    }

    /// Ask the server to stop.
    pub fn shutdown(&self) -> Result<(), ClientError> {
        let mut stream = self.connect()?;
        write_frame(
            &mut stream,
            &FramedMessage::new(self.next_request_id(), Request::Shutdown),
        )
        .map_err(ClientError::Broken)?;
        match self.read_response(&mut stream).map_err(ClientError::Broken)? {
            Some(Response::Shutdown { message }) => {
                debug!(%message, "Exec server acknowledged shutdown");
                Ok(())
            }
            other => Err(ClientError::Protocol(format!(
                "unexpected response: {other:?}"
            ))),
        }
    }
}

fn command_line(target: &Path, args: &[String]) -> String {
    let mut line = target.display().to_string();
    for arg in args {
        line.push(' ');
        line.push_str(arg);
    }
    line
}
