pub mod context;
pub mod daemon;
pub mod logging;
pub mod pool;
pub mod shadow;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{CommandFactory, Parser};
use tracing::info;

use context::{DylibLoader, native_deps_from_env};
use daemon::{ExecClient, ExecutionServer, ServeOutcome, ServerConfig};
use logging::ConsoleSink;
use pool::{ExecutionContextPool, PoolConfig};
use shadow::ShadowCache;

const USAGE: &str = "\
Modes:
  exec-server /direct <target> [args...]   run the tool once in this process
  exec-server /server <target>             host the tool (started by clients)
  exec-server <target> [args...]           run the tool through its server";

/// Command-line interface.
#[derive(Parser, Debug)]
#[command(
    name = "exec-server",
    version,
    about = "Keeps slow-starting command-line tools loaded between invocations",
    after_help = USAGE
)]
pub struct Cli {
    /// Mode token, target tool and the tool's own arguments
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, num_args = 0..)]
    pub args: Vec<String>,
}

/// What the process was asked to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mode {
    Usage,
    Direct { target: PathBuf, args: Vec<String> },
    Server { target: PathBuf },
    Client { target: PathBuf, args: Vec<String> },
}

impl Mode {
    /// Select the mode from the raw arguments (program name excluded).
    pub fn from_args(args: &[String]) -> Result<Self> {
        let Some((first, rest)) = args.split_first() else {
            return Ok(Mode::Usage);
        };

        match first.as_str() {
            "/direct" => {
                let Some((target, tool_args)) = rest.split_first() else {
                    bail!("/direct requires a target tool");
                };
                Ok(Mode::Direct {
                    target: absolute(target)?,
                    args: tool_args.to_vec(),
                })
            }
            "/server" => match rest {
                [target] => Ok(Mode::Server {
                    target: absolute(target)?,
                }),
                [] => bail!("/server requires a target tool"),
                _ => bail!("/server takes only the target tool"),
            },
            _ => Ok(Mode::Client {
                target: absolute(first)?,
                args: rest.to_vec(),
            }),
        }
    }
}

fn absolute(target: &str) -> Result<PathBuf> {
    std::path::absolute(target).with_context(|| format!("invalid target path {target:?}"))
}

/// Parse the command line and run the selected mode. Returns the exit status.
pub fn run() -> Result<i32> {
    let cli = Cli::parse();

    match Mode::from_args(&cli.args)? {
        Mode::Usage => {
            Cli::command().print_help()?;
            Ok(0)
        }
        Mode::Direct { target, args } => {
            logging::init_console();
            run_direct(&target, &args)
        }
        Mode::Server { target } => run_server(&target),
        Mode::Client { target, args } => {
            logging::init_console();
            Ok(ExecClient::with_defaults(target).execute(&args, &ConsoleSink))
        }
    }
}

/// Run the tool once in a throwaway context.
pub fn run_direct(target: &Path, args: &[String]) -> Result<i32> {
    let pool = ExecutionContextPool::new(PoolConfig::default(), Arc::new(DylibLoader));
    pool.run(target, &native_deps_from_env(), args, &ConsoleSink)
        .with_context(|| format!("cannot run {}", target.display()))
}

/// Host `target` until the server retires. Exits 0 when another server
/// already owns the endpoint.
pub fn run_server(target: &Path) -> Result<i32> {
    let log_dir = ShadowCache::for_target(target).root().join("logs");
    let _log_guard = match logging::init_server(&log_dir) {
        Ok(guard) => Some(guard),
        Err(_) => {
            logging::init_console();
            None
        }
    };

    let config = ServerConfig::from_env(target);
    let server = Arc::new(ExecutionServer::new(config, Arc::new(DylibLoader)));
    let outcome = server
        .serve()
        .with_context(|| format!("exec server for {} failed", target.display()))?;
    if outcome == ServeOutcome::AlreadyRunning {
        info!(target = %target.display(), "Another exec server is already running");
    }
    Ok(0)
}
