//! Loading a tool image into an isolated, droppable unit.
//!
//! A tool is a shared library exporting the entry point
//!
//! ```c
//! int exec_server_main(int argc, const char *const *argv);
//! ```
//!
//! where `argv` holds only the tool arguments (no program name). A tool may
//! additionally export
//!
//! ```c
//! typedef void (*exec_server_log_fn)(void *ctx, int level, const char *text);
//! void exec_server_set_log(exec_server_log_fn callback, void *ctx);
//! ```
//!
//! to route its output into the current run's [`LogSink`]. The hook is
//! installed before every run and cleared (null callback) afterwards.
//!
//! Each load opens the shadow copy of the library, never the original file, so
//! a rebuilt tool lands at a new path and gets its own mapping and statics.

use std::ffi::{CStr, CString, c_char, c_int, c_void};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::Context;
use libloading::Library;
use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

use crate::logging::{LogLevel, LogLine, LogSink};

/// Exported entry point every tool library must provide.
pub const ENTRY_SYMBOL: &str = "exec_server_main";

/// Optional export used to redirect tool output.
pub const LOG_HOOK_SYMBOL: &str = "exec_server_set_log";

type EntryFn = unsafe extern "C" fn(argc: c_int, argv: *const *const c_char) -> c_int;
type LogCallback = unsafe extern "C" fn(ctx: *mut c_void, level: c_int, text: *const c_char);
type SetLogFn = unsafe extern "C" fn(callback: Option<LogCallback>, ctx: *mut c_void);

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to load tool library {path}: {source}")]
    Library {
        path: PathBuf,
        source: libloading::Error,
    },

    #[error("tool library {path} does not export `{symbol}`: {source}")]
    MissingEntry {
        path: PathBuf,
        symbol: &'static str,
        source: libloading::Error,
    },
}

/// A native dependency resolved to its shadow copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NativeLibrary {
    /// File name the tool resolves the library by.
    pub file_name: String,
    /// Shadow copy to load instead of the original.
    pub path: PathBuf,
}

/// Everything a loader needs to bring a tool up.
#[derive(Debug, Clone)]
pub struct ToolImage {
    /// Original tool path, used for naming only.
    pub target: PathBuf,
    /// Shadow copy of the tool to load.
    pub image: PathBuf,
    /// Shadow copies of the native dependencies, in registration order.
    pub natives: Vec<NativeLibrary>,
}

/// One loaded copy of a tool. Dropping it unloads the tool.
pub trait LoadedTool: Send {
    /// Call the tool's entry point and return its status code.
    fn invoke(&mut self, args: &[String], sink: &dyn LogSink) -> anyhow::Result<i32>;
}

/// Creates isolated loads of a tool image.
pub trait ToolLoader: Send + Sync {
    fn load(&self, image: &ToolImage) -> Result<Box<dyn LoadedTool>, LoadError>;
}

/// Loads tools as shared libraries with `libloading`.
#[derive(Debug, Default, Clone, Copy)]
pub struct DylibLoader;

impl ToolLoader for DylibLoader {
    fn load(&self, image: &ToolImage) -> Result<Box<dyn LoadedTool>, LoadError> {
        // Preload dependencies from their shadow paths so the dynamic linker
        // resolves the tool's needed entries against the already-mapped copies.
        let mut natives = Vec::with_capacity(image.natives.len());
        for native in &image.natives {
            // SAFETY: running library initializers is the purpose of the load;
            // the files come from the tool's own dependency list.
            match unsafe { Library::new(&native.path) } {
                Ok(lib) => natives.push(lib),
                Err(e) => warn!(
                    library = %native.path.display(),
                    error = %e,
                    "Native dependency could not be preloaded"
                ),
            }
        }

        // SAFETY: see above.
        let library = unsafe { Library::new(&image.image) }.map_err(|source| LoadError::Library {
            path: image.image.clone(),
            source,
        })?;

        // SAFETY: the symbol type matches the documented tool contract. The
        // copied function pointers stay valid while `library` is alive, and
        // `DylibTool` owns it.
        let entry = unsafe { library.get::<EntryFn>(ENTRY_SYMBOL.as_bytes()) }
            .map(|sym| *sym)
            .map_err(|source| LoadError::MissingEntry {
                path: image.image.clone(),
                symbol: ENTRY_SYMBOL,
                source,
            })?;
        // SAFETY: as above.
        let set_log = unsafe { library.get::<SetLogFn>(LOG_HOOK_SYMBOL.as_bytes()) }
            .ok()
            .map(|sym| *sym);

        debug!(
            image = %image.image.display(),
            natives = natives.len(),
            log_hook = set_log.is_some(),
            "Tool library loaded"
        );

        Ok(Box::new(DylibTool {
            entry,
            set_log,
            library,
            natives,
        }))
    }
}

// Field order is drop order: the tool goes before the libraries it links.
struct DylibTool {
    entry: EntryFn,
    set_log: Option<SetLogFn>,
    #[allow(dead_code)]
    library: Library,
    #[allow(dead_code)]
    natives: Vec<Library>,
}

impl LoadedTool for DylibTool {
    fn invoke(&mut self, args: &[String], sink: &dyn LogSink) -> anyhow::Result<i32> {
        let c_args = args
            .iter()
            .map(|a| CString::new(a.as_str()))
            .collect::<Result<Vec<_>, _>>()
            .context("tool argument contains a NUL byte")?;
        let argv: Vec<*const c_char> = c_args.iter().map(|a| a.as_ptr()).collect();
        let argc = c_int::try_from(argv.len()).context("too many tool arguments")?;

        let sink_ref: &dyn LogSink = sink;
        let ctx = &sink_ref as *const &dyn LogSink as *mut c_void;

        if let Some(set_log) = self.set_log {
            // SAFETY: `ctx` outlives the call; the hook is cleared below
            // before `sink_ref` goes out of scope.
            unsafe { set_log(Some(forward_log), ctx) };
        }
        // SAFETY: `argv` points at `argc` NUL-terminated strings kept alive by `c_args`.
        let status = unsafe { (self.entry)(argc, argv.as_ptr()) };
        if let Some(set_log) = self.set_log {
            // SAFETY: clearing the hook.
            unsafe { set_log(None, std::ptr::null_mut()) };
        }

        Ok(status)
    }
}

unsafe extern "C" fn forward_log(ctx: *mut c_void, level: c_int, text: *const c_char) {
    if ctx.is_null() || text.is_null() {
        return;
    }
    // SAFETY: `ctx` was produced by `DylibTool::invoke` from a live `&&dyn LogSink`.
    let sink = unsafe { &*(ctx as *const &dyn LogSink) };
    // SAFETY: the tool passes a NUL-terminated string valid for the call.
    let text = unsafe { CStr::from_ptr(text) }.to_string_lossy().into_owned();
    sink.log(LogLine::new(LogLevel::from_raw(level), text));
}

/// Signature of a tool hosted directly in this process.
pub type ToolFn = dyn Fn(&[String], &dyn LogSink) -> anyhow::Result<i32> + Send + Sync;

/// Hosts a Rust closure as the tool. Each load is a separate handle so load
/// and unload counts stay observable, which embedders and tests rely on.
#[derive(Clone)]
pub struct InProcessLoader {
    entry: Arc<ToolFn>,
    loads: Arc<AtomicUsize>,
    live: Arc<AtomicUsize>,
    images: Arc<Mutex<Vec<ToolImage>>>,
}

impl InProcessLoader {
    pub fn new<F>(entry: F) -> Self
    where
        F: Fn(&[String], &dyn LogSink) -> anyhow::Result<i32> + Send + Sync + 'static,
    {
        Self {
            entry: Arc::new(entry),
            loads: Arc::new(AtomicUsize::new(0)),
            live: Arc::new(AtomicUsize::new(0)),
            images: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Total number of loads performed.
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    /// Loads that have not been dropped yet.
    pub fn live_count(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Images passed to `load`, oldest first.
    pub fn images(&self) -> Vec<ToolImage> {
        self.images.lock().clone()
    }
}

impl std::fmt::Debug for InProcessLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcessLoader")
            .field("loads", &self.load_count())
            .field("live", &self.live_count())
            .finish()
    }
}

impl ToolLoader for InProcessLoader {
    fn load(&self, image: &ToolImage) -> Result<Box<dyn LoadedTool>, LoadError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        self.live.fetch_add(1, Ordering::SeqCst);
        self.images.lock().push(image.clone());
        Ok(Box::new(InProcessTool {
            entry: Arc::clone(&self.entry),
            live: Arc::clone(&self.live),
        }))
    }
}

struct InProcessTool {
    entry: Arc<ToolFn>,
    live: Arc<AtomicUsize>,
}

impl LoadedTool for InProcessTool {
    fn invoke(&mut self, args: &[String], sink: &dyn LogSink) -> anyhow::Result<i32> {
        (self.entry)(args, sink)
    }
}

impl Drop for InProcessTool {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}
