//! Minimal tool library used by the integration tests.
//!
//! `exec_server_main` reports its arguments and a per-load run counter through
//! the log hook, then exits with `40 + argc` unless the first argument is
//! `exit <code>`.

use std::ffi::{CStr, CString, c_char, c_int, c_void};
use std::sync::atomic::{AtomicUsize, Ordering};

type LogCallback = unsafe extern "C" fn(ctx: *mut c_void, level: c_int, text: *const c_char);

static CALLBACK: AtomicUsize = AtomicUsize::new(0);
static CONTEXT: AtomicUsize = AtomicUsize::new(0);
static RUNS: AtomicUsize = AtomicUsize::new(0);

#[unsafe(no_mangle)]
pub unsafe extern "C" fn exec_server_set_log(callback: Option<LogCallback>, ctx: *mut c_void) {
    CONTEXT.store(ctx as usize, Ordering::SeqCst);
    CALLBACK.store(callback.map_or(0, |cb| cb as usize), Ordering::SeqCst);
}

fn emit(level: c_int, text: &str) {
    let raw = CALLBACK.load(Ordering::SeqCst);
    if raw == 0 {
        return;
    }
    // SAFETY: non-zero values are only ever stored from a `LogCallback`.
    let callback: LogCallback = unsafe { std::mem::transmute::<usize, LogCallback>(raw) };
    let Ok(text) = CString::new(text) else {
        return;
    };
    let ctx = CONTEXT.load(Ordering::SeqCst) as *mut c_void;
    // SAFETY: the host keeps `ctx` alive while the callback is installed.
    unsafe { callback(ctx, level, text.as_ptr()) };
}

#[unsafe(no_mangle)]
pub unsafe extern "C" fn exec_server_main(argc: c_int, argv: *const *const c_char) -> c_int {
    let args: Vec<String> = (0..usize::try_from(argc).unwrap_or(0))
        // SAFETY: the host passes `argc` valid NUL-terminated strings.
        .map(|i| unsafe { CStr::from_ptr(*argv.add(i)) }.to_string_lossy().into_owned())
        .collect();
    let run = RUNS.fetch_add(1, Ordering::SeqCst) + 1;

    emit(0, &format!("argc={argc} args={}", args.join(",")));
    emit(1, &format!("run={run}"));

    match args.as_slice() {
        [cmd, code, ..] if cmd == "exit" => code.parse().unwrap_or(1),
        _ => 40 + argc,
    }
}
