//! Resident exec server and its client.
//!
//! A server hosts exactly one target tool and keeps it loaded between
//! invocations. Clients find the server through the target's endpoint name:
//!
//! ```text
//! /opt/tools/compiler.so  ->  _opt_tools_compiler.so  ->  <socketDir>/_opt_tools_compiler.so.sock
//! ```
//!
//! The first client to find nobody listening spawns `exec-server /server
//! <target>` in the background; every later client just connects. A server
//! retires itself when idle or when its target is rebuilt, and the next client
//! starts a fresh one.
//!
//! ## Usage
//!
//! ```ignore
//! use exec_server::daemon::{ExecClient, ExecutionServer, ServerConfig};
//!
//! // Client usage (auto-spawns the server if not running)
//! let client = ExecClient::with_defaults("/opt/tools/compiler.so");
//! let status = client.execute(&args, &ConsoleSink);
//!
//! // Server usage (for the detached server process)
//! let server = Arc::new(ExecutionServer::new(ServerConfig::from_env(target), Arc::new(DylibLoader)));
//! server.serve()?;
//! ```

pub mod client;
pub mod core;
pub mod monitor;
pub mod protocol;

pub use client::{ClientConfig, ClientError, ExecClient, ProcessSpawner, ServerSpawner};
pub use core::{ExecutionServer, ServeOutcome, ServerConfig};
pub use monitor::{RetireReason, ServerMonitor};
pub use protocol::{PROTOCOL_VERSION, Request, Response, endpoint_name, socket_path};
