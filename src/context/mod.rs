//! Execution contexts: one isolated load of a target tool.
//!
//! A context is created cheaply; the tool and its native dependencies are
//! shadow-copied and loaded on the first [`ExecutionContext::run`]. From then
//! on the context remembers the last-write time of every file it loaded and
//! reports itself stale as soon as one of them changes on disk.
//!
//! Mutual exclusion is a single compare-and-set flag. It is not a queue:
//! a caller that fails [`ExecutionContext::try_acquire`] has to find or
//! create another context.

pub mod loader;

use std::fs;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Instant, SystemTime};

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::logging::LogSink;
use crate::shadow::{ShadowCache, ShadowError};
use loader::{LoadError, LoadedTool, NativeLibrary, ToolImage, ToolLoader};

pub use loader::{DylibLoader, InProcessLoader};

static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Error)]
pub enum ContextError {
    #[error("target tool {0} does not exist")]
    TargetMissing(PathBuf),

    #[error("execution context {0} must be acquired before running")]
    NotAcquired(String),

    #[error("execution context {0} has been disposed")]
    Disposed(String),

    #[error("cannot enumerate native dependencies in {path}: {source}")]
    Dependencies { path: PathBuf, source: io::Error },

    #[error(transparent)]
    Shadow(#[from] ShadowError),

    #[error(transparent)]
    Load(#[from] LoadError),
}

/// Last-write time of a file at load time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStamp {
    pub path: PathBuf,
    pub modified: SystemTime,
}

impl FileStamp {
    pub fn new(path: impl Into<PathBuf>, modified: SystemTime) -> Self {
        Self {
            path: path.into(),
            modified,
        }
    }

    /// True while the file still exists with the recorded timestamp.
    pub fn is_current(&self) -> bool {
        fs::metadata(&self.path)
            .and_then(|m| m.modified())
            .is_ok_and(|t| t == self.modified)
    }
}

/// Environment variable listing native dependency files or directories,
/// separated like `PATH`.
pub const NATIVE_DEPS_ENV: &str = "EXEC_SERVER_NATIVE_DEPS";

/// Dependency specs from [`NATIVE_DEPS_ENV`]; empty when unset.
pub fn native_deps_from_env() -> Vec<PathBuf> {
    match dotenvy::var(NATIVE_DEPS_ENV) {
        Ok(raw) => std::env::split_paths(&raw)
            .filter(|p| !p.as_os_str().is_empty())
            .collect(),
        Err(_) => Vec::new(),
    }
}

/// Whether a directory entry looks like a native library.
pub fn is_native_library(path: &Path) -> bool {
    let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };
    let lower = name.to_ascii_lowercase();
    lower.ends_with(".so")
        || lower.ends_with(".dylib")
        || lower.ends_with(".dll")
        || lower.contains(".so.")
}

/// One isolated load of a target tool plus its native dependencies.
pub struct ExecutionContext {
    id: u64,
    name: String,
    target: PathBuf,
    dependency_specs: Vec<PathBuf>,
    cache: ShadowCache,
    loader: Arc<dyn ToolLoader>,
    locked: AtomicBool,
    stale: AtomicBool,
    disposed: AtomicBool,
    loaded_files: Mutex<Vec<FileStamp>>,
    tool: Mutex<Option<Box<dyn LoadedTool>>>,
    last_run: Mutex<Instant>,
    runs: AtomicU64,
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("name", &self.name)
            .field("target", &self.target)
            .field("locked", &self.locked.load(Ordering::Relaxed))
            .field("stale", &self.stale.load(Ordering::Relaxed))
            .field("runs", &self.runs.load(Ordering::Relaxed))
            .finish()
    }
}

impl ExecutionContext {
    /// Create a context for `target`. Fails if the target does not exist.
    pub fn new(
        target: impl Into<PathBuf>,
        dependency_specs: Vec<PathBuf>,
        loader: Arc<dyn ToolLoader>,
    ) -> Result<Self, ContextError> {
        let target = target.into();
        if !target.is_file() {
            return Err(ContextError::TargetMissing(target));
        }

        let id = NEXT_CONTEXT_ID.fetch_add(1, Ordering::Relaxed);
        let stem = target
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "tool".to_string());
        let name = format!("{stem}#{id}");
        debug!(context = %name, target = %target.display(), "Execution context created");

        Ok(Self {
            id,
            name,
            cache: ShadowCache::for_target(&target),
            target,
            dependency_specs,
            loader,
            locked: AtomicBool::new(false),
            stale: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            loaded_files: Mutex::new(Vec::new()),
            tool: Mutex::new(None),
            last_run: Mutex::new(Instant::now()),
            runs: AtomicU64::new(0),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Files recorded at load time. Empty until the first run.
    pub fn loaded_files(&self) -> Vec<FileStamp> {
        self.loaded_files.lock().clone()
    }

    /// Instant the last run started or finished.
    pub fn last_run(&self) -> Instant {
        *self.last_run.lock()
    }

    /// Number of completed runs.
    pub fn run_count(&self) -> u64 {
        self.runs.load(Ordering::Relaxed)
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Acquire)
    }

    /// Take exclusive ownership of this context. Returns false if already taken.
    pub fn try_acquire(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Give up ownership without tearing anything down.
    pub fn release(&self) {
        self.locked.store(false, Ordering::Release);
    }

    /// Whether every loaded file still has its recorded timestamp.
    ///
    /// Once this returns false it keeps returning false.
    pub fn is_up_to_date(&self) -> bool {
        if self.stale.load(Ordering::Acquire) {
            return false;
        }

        let stamps = self.loaded_files.lock().clone();
        for stamp in &stamps {
            if !stamp.is_current() {
                info!(
                    context = %self.name,
                    file = %stamp.path.display(),
                    "Loaded file changed"
                );
                self.stale.store(true, Ordering::Release);
                return false;
            }
        }
        true
    }

    /// Run the tool with `args`. The caller must hold the context.
    ///
    /// Failures inside the tool, including a failed load, are reported to
    /// `sink` and turned into status 1.
    pub fn run(&self, args: &[String], sink: &dyn LogSink) -> Result<i32, ContextError> {
        if !self.is_locked() {
            return Err(ContextError::NotAcquired(self.name.clone()));
        }
        if self.disposed.load(Ordering::Acquire) {
            return Err(ContextError::Disposed(self.name.clone()));
        }

        *self.last_run.lock() = Instant::now();
        let mut tool = self.tool.lock();

        if tool.is_none() {
            match self.load() {
                Ok(loaded) => *tool = Some(loaded),
                Err(e) => {
                    error!(context = %self.name, error = %e, "Tool load failed");
                    sink.error(&format!("Unable to load {}: {e}", self.target.display()));
                    return Ok(1);
                }
            }
        }
        let Some(loaded) = tool.as_mut() else {
            return Ok(1);
        };

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| loaded.invoke(args, sink)));
        let status = match outcome {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                error!(context = %self.name, error = %e, "Tool invocation failed");
                sink.error(&format!("Unexpected error: {e:#}"));
                1
            }
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!(context = %self.name, panic = %message, "Tool invocation panicked");
                sink.error(&format!("Unexpected panic: {message}"));
                1
            }
        };
        drop(tool);

        *self.last_run.lock() = Instant::now();
        self.runs.fetch_add(1, Ordering::Relaxed);
        debug!(context = %self.name, status, "Run finished");
        Ok(status)
    }

    /// Unload the tool. Idempotent.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        let loaded = self.tool.lock().take();
        let was_loaded = loaded.is_some();
        drop(loaded);
        info!(context = %self.name, was_loaded, "Execution context disposed");
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    fn load(&self) -> Result<Box<dyn LoadedTool>, ContextError> {
        let image = self.cache.ensure_copied(&self.target)?;
        let mut stamps = vec![FileStamp::new(&self.target, image.modified)];
        let mut natives = Vec::new();

        for file in self.dependency_files()? {
            let copy = self.cache.ensure_copied(&file)?;
            let file_name = file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            debug!(
                context = %self.name,
                library = %file_name,
                shadow = %copy.directory().display(),
                "Registered native dependency"
            );
            natives.push(NativeLibrary {
                file_name,
                path: copy.path.clone(),
            });
            stamps.push(FileStamp::new(file, copy.modified));
        }

        *self.loaded_files.lock() = stamps;

        let image = ToolImage {
            target: self.target.clone(),
            image: image.path,
            natives,
        };
        let loaded = self.loader.load(&image)?;
        info!(
            context = %self.name,
            image = %image.image.display(),
            natives = image.natives.len(),
            "Tool loaded"
        );
        Ok(loaded)
    }

    /// Expand the dependency specs into concrete files.
    fn dependency_files(&self) -> Result<Vec<PathBuf>, ContextError> {
        let base = self.target.parent().unwrap_or_else(|| Path::new("."));
        let mut files = Vec::new();

        for spec in &self.dependency_specs {
            let path = base.join(spec);
            if path.is_file() {
                files.push(path);
                continue;
            }

            let entries = fs::read_dir(&path).map_err(|source| ContextError::Dependencies {
                path: path.clone(),
                source,
            })?;
            let mut found: Vec<PathBuf> = entries
                .filter_map(|e| e.ok())
                .map(|e| e.path())
                .filter(|p| p.is_file() && is_native_library(p))
                .collect();
            found.sort();
            files.extend(found);
        }

        Ok(files)
    }
}

impl Drop for ExecutionContext {
    fn drop(&mut self) {
        self.dispose();
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
