//! Wire protocol between the exec client and the resident server.
//!
//! Every message is a [`FramedMessage`] serialized with MessagePack and sent
//! with a 4-byte big-endian length prefix over a Unix Domain Socket.
//!
//! A run is one request followed by any number of [`Response::Log`] frames
//! and exactly one terminating [`Response::Exit`] (or [`Response::Error`]).

use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::logging::LogLine;

/// Protocol version for compatibility checks between client and server builds.
pub const PROTOCOL_VERSION: u32 = 1;

/// Upper bound on a single frame.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Environment variable overriding the socket directory.
pub const SOCKET_DIR_ENV: &str = "EXEC_SERVER_SOCKET_DIR";

// sun_path is 108 bytes on Linux and 104 on macOS, including the NUL.
const MAX_SOCKET_PATH: usize = 100;

/// Endpoint name for a target tool: its absolute path with separators, drive
/// colons and `#` replaced by `_`.
pub fn endpoint_name(target: &Path) -> String {
    target
        .to_string_lossy()
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '#' => '_',
            other => other,
        })
        .collect()
}

/// Directory holding the endpoint sockets.
pub fn default_socket_dir() -> PathBuf {
    if let Ok(dir) = dotenvy::var(SOCKET_DIR_ENV) {
        return PathBuf::from(dir);
    }
    if let Some(dirs) = directories::BaseDirs::new()
        && let Some(runtime) = dirs.runtime_dir()
    {
        return runtime.join("exec-server");
    }

    let user = std::env::var("USER").unwrap_or_else(|_| "unknown".into());
    // Sanitize: keep only alphanumeric, dash, underscore to prevent path traversal
    let safe_user: String = user
        .chars()
        .filter(|c| c.is_alphanumeric() || *c == '-' || *c == '_')
        .take(64)
        .collect();
    let safe_user = if safe_user.is_empty() {
        "unknown".to_string()
    } else {
        safe_user
    };
    std::env::temp_dir().join(format!("exec-server-{safe_user}"))
}

/// Socket path for an endpoint. Names too long for `sun_path` are replaced by
/// their CRC32.
pub fn socket_path(dir: &Path, endpoint: &str) -> PathBuf {
    let candidate = dir.join(format!("{endpoint}.sock"));
    if candidate.as_os_str().len() <= MAX_SOCKET_PATH {
        return candidate;
    }
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(endpoint.as_bytes());
    dir.join(format!("exec-{:08x}.sock", hasher.finalize()))
}

/// Request types for the exec server protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Request {
    /// Liveness check.
    Check,

    /// Run the target tool once.
    Run(RunRequest),

    /// Request graceful shutdown.
    Shutdown,
}

/// Arguments and process environment for one run.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct RunRequest {
    /// Tool arguments, without the tool path.
    pub args: Vec<String>,
    /// Client working directory, applied for the duration of the run.
    pub working_dir: Option<PathBuf>,
    /// Client environment, applied for the duration of the run.
    pub env: Vec<(String, String)>,
}

/// Response types from the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Response {
    /// Liveness check answer.
    Check(HealthStatus),

    /// One line of tool output. Zero or more precede `Exit`.
    Log(LogLine),

    /// Final status of a run.
    Exit { status: i32 },

    /// Shutdown acknowledgement.
    Shutdown { message: String },

    /// Error response.
    Error(ErrorResponse),
}

/// Server health.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    /// Server uptime in seconds.
    pub uptime_secs: u64,
    /// Protocol version.
    pub version: u32,
    /// Server process id.
    pub pid: u32,
    /// Tool served by this endpoint.
    pub target: PathBuf,
    /// Runs served so far.
    pub total_runs: u64,
    /// Contexts currently pooled.
    pub pooled_contexts: usize,
}

/// Error response from the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error code for programmatic handling.
    pub code: ErrorCode,
    /// Human-readable error message.
    pub message: String,
}

/// Error codes for server errors.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ErrorCode {
    /// Unknown or internal error.
    Internal,
    /// Request could not be decoded.
    InvalidInput,
    /// Protocol version mismatch.
    VersionMismatch,
    /// Server is retiring and no longer accepts runs.
    ShuttingDown,
}

/// Framed message wrapper for length-prefixed protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FramedMessage<T> {
    /// Protocol version.
    pub version: u32,
    /// Request ID for correlation.
    pub request_id: String,
    /// Payload.
    pub payload: T,
}

impl<T> FramedMessage<T> {
    pub fn new(request_id: impl Into<String>, payload: T) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            request_id: request_id.into(),
            payload,
        }
    }
}

#[derive(Debug, Clone, Error)]
#[error("encode error: {0}")]
pub struct EncodeError(pub String);

#[derive(Debug, Clone, Error)]
#[error("decode error: {0}")]
pub struct DecodeError(pub String);

/// Encode a message to MessagePack bytes with length prefix.
pub fn encode_message<T: Serialize>(msg: &FramedMessage<T>) -> Result<Vec<u8>, EncodeError> {
    let payload = rmp_serde::to_vec(msg).map_err(|e| EncodeError(e.to_string()))?;
    let len = u32::try_from(payload.len())
        .map_err(|_| EncodeError(format!("message too large: {} bytes", payload.len())))?;
    let mut buf = Vec::with_capacity(4 + payload.len());
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(&payload);
    Ok(buf)
}

/// Decode a message from MessagePack bytes (without length prefix).
pub fn decode_message<T: for<'de> Deserialize<'de>>(
    data: &[u8],
) -> Result<FramedMessage<T>, DecodeError> {
    rmp_serde::from_slice(data).map_err(|e| DecodeError(e.to_string()))
}

/// Encode and write one frame.
pub fn write_frame<T: Serialize, W: Write>(writer: &mut W, msg: &FramedMessage<T>) -> io::Result<()> {
    let encoded = encode_message(msg).map_err(|e| io::Error::other(e.to_string()))?;
    writer.write_all(&encoded)?;
    writer.flush()
}

/// Read one frame payload. Returns `Ok(None)` on a clean end of stream.
pub fn read_frame<R: Read>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame too large: {len} bytes"),
        ));
    }

    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok(Some(payload))
}
