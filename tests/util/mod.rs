use exec_server::logging::{LogLine, LogSink};
use exec_server::shadow::{CACHE_FOLDER, NATIVE_FOLDER};
use parking_lot::Mutex;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::OnceLock;
use std::time::{Duration, UNIX_EPOCH};
use tempfile::TempDir;

/// Captures tracing output for tests.
#[allow(dead_code)]
pub struct TestTracing {
    buffer: std::sync::Arc<std::sync::Mutex<Vec<u8>>>,
}

#[allow(dead_code)]
impl TestTracing {
    pub fn new() -> Self {
        Self {
            buffer: std::sync::Arc::new(std::sync::Mutex::new(Vec::new())),
        }
    }

    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let writer = self.buffer.clone();
        let make_writer = move || TestWriter(writer.clone());
        let subscriber = tracing_subscriber::fmt()
            .with_ansi(false)
            .without_time()
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(make_writer)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn output(&self) -> String {
        let buf = self.buffer.lock().unwrap();
        String::from_utf8_lossy(&buf).to_string()
    }

    /// Assert that the captured log output contains the provided substring.
    pub fn assert_contains(&self, needle: &str) {
        let out = self.output();
        assert!(
            out.contains(needle),
            "expected logs to contain `{needle}`, got:\n{out}"
        );
    }
}

struct TestWriter(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

impl std::io::Write for TestWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let mut guard = self.0.lock().unwrap();
        guard.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Collects tool output lines.
#[allow(dead_code)]
#[derive(Default)]
pub struct CollectSink(Mutex<Vec<LogLine>>);

#[allow(dead_code)]
impl CollectSink {
    pub fn lines(&self) -> Vec<LogLine> {
        self.0.lock().clone()
    }

    pub fn texts(&self) -> Vec<String> {
        self.0.lock().iter().map(|l| l.text.clone()).collect()
    }
}

impl LogSink for CollectSink {
    fn log(&self, line: LogLine) {
        self.0.lock().push(line);
    }
}

/// A scratch directory holding a target tool and optional native libraries.
#[allow(dead_code)]
pub struct ToolFixture {
    pub dir: TempDir,
    pub target: PathBuf,
}

#[allow(dead_code)]
impl ToolFixture {
    /// Target `compiler.so` with a fixed last-write time.
    pub fn new() -> Self {
        let dir = TempDir::new().expect("tempdir");
        let target = dir.path().join("compiler.so");
        std::fs::write(&target, b"compiler image").expect("write target");
        set_modified(&target, 1_000);
        Self { dir, target }
    }

    /// Target `tool.so` copied from the echo-tool library, same fixed time.
    pub fn echo_tool() -> Self {
        let dir = TempDir::new().expect("tempdir");
        let target = dir.path().join("tool.so");
        std::fs::copy(echo_tool_library(), &target).expect("copy echo-tool");
        set_modified(&target, 1_000);
        Self { dir, target }
    }

    /// The shadow copy of the target inside its only cache key directory.
    pub fn shadow_image(&self) -> PathBuf {
        let dirs = self.shadow_dirs();
        assert_eq!(dirs.len(), 1, "expected one shadow dir, got {dirs:?}");
        dirs[0].join(self.target.file_name().expect("target file name"))
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Write `native/<name>` next to the target and return its path.
    pub fn add_native(&self, name: &str) -> PathBuf {
        let native_dir = self.dir.path().join("native");
        std::fs::create_dir_all(&native_dir).expect("create native dir");
        let path = native_dir.join(name);
        std::fs::write(&path, name.as_bytes()).expect("write native");
        set_modified(&path, 1_000);
        path
    }

    /// Key directories currently present in the shadow cache.
    pub fn shadow_dirs(&self) -> Vec<PathBuf> {
        let root = self.dir.path().join(CACHE_FOLDER).join(NATIVE_FOLDER);
        let Ok(entries) = std::fs::read_dir(root) else {
            return Vec::new();
        };
        let mut dirs: Vec<PathBuf> = entries
            .filter_map(Result::ok)
            .map(|e| e.path())
            .filter(|p| {
                p.is_dir()
                    && !p
                        .file_name()
                        .is_some_and(|n| n.to_string_lossy().starts_with('.'))
            })
            .collect();
        dirs.sort();
        dirs
    }
}

/// Set a file's last-write time to `secs` after the Unix epoch.
#[allow(dead_code)]
pub fn set_modified(path: &Path, secs: u64) {
    let file = std::fs::OpenOptions::new()
        .write(true)
        .open(path)
        .expect("open for set_modified");
    file.set_modified(UNIX_EPOCH + Duration::from_secs(secs))
        .expect("set_modified");
}

/// Poll `cond` until it holds or `timeout` elapses.
#[allow(dead_code)]
pub fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = std::time::Instant::now() + timeout;
    while std::time::Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    cond()
}

/// Shared library built from `tests/fixtures/echo-tool`, compiled once per
/// test binary. It exports the real tool entry point and log hook.
#[allow(dead_code)]
pub fn echo_tool_library() -> &'static Path {
    static LIBRARY: OnceLock<PathBuf> = OnceLock::new();
    LIBRARY.get_or_init(|| {
        let manifest = Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("tests")
            .join("fixtures")
            .join("echo-tool")
            .join("Cargo.toml");
        let target_dir = Path::new(env!("CARGO_TARGET_TMPDIR")).join("echo-tool");
        let cargo = std::env::var_os("CARGO").unwrap_or_else(|| "cargo".into());
        let status = Command::new(cargo)
            .args(["build", "--quiet", "--offline", "--manifest-path"])
            .arg(&manifest)
            .arg("--target-dir")
            .arg(&target_dir)
            .env_remove("CARGO_BUILD_TARGET")
            .status()
            .expect("run cargo for echo-tool");
        assert!(status.success(), "building echo-tool failed: {status}");

        let file = format!(
            "{}echo_tool{}",
            std::env::consts::DLL_PREFIX,
            std::env::consts::DLL_SUFFIX
        );
        let library = target_dir.join("debug").join(file);
        assert!(library.is_file(), "missing {}", library.display());
        library
    })
}

/// Whether a file at `path` is currently mapped into this process.
#[allow(dead_code)]
pub fn is_mapped(path: &Path) -> bool {
    let maps = std::fs::read_to_string("/proc/self/maps").expect("read /proc/self/maps");
    let resolved = path.canonicalize().unwrap_or_else(|_| path.to_path_buf());
    let needle = resolved.to_string_lossy();
    maps.lines().any(|line| line.ends_with(needle.as_ref()))
}
