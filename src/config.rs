use std::time::Duration;

/// Environment variable that turns on per-call diagnostics when set to `1`.
pub const DEBUG_VAR: &[u8] = b"MALLOC_TALLY_DEBUG\0";

/// Environment variable naming the directory that receives the final snapshot.
pub const DUMP_DIR_VAR: &str = "MALLOC_TALLY_DIR";

/// Default period between two reports printed by the reporting thread.
pub const REPORT_INTERVAL: Duration = Duration::from_secs(5);

/// What happens to the reporting thread when the program's `main` returns.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ShutdownPolicy {
    /// Wake the thread and let it exit on its own; the process does not wait.
    Detach,
    /// Wake the thread and wait until it has exited.
    Join,
}

/// Settings of a [`Tally`](crate::Tally).  All constructors are `const`, so a
/// configured profiler can live in a `static`.
#[derive(Clone, Copy, Debug)]
pub struct Config {
    /// Nul-terminated name of the debug toggle variable.
    pub debug_var: &'static [u8],
    /// Name of the snapshot directory variable.
    pub dump_dir_var: &'static str,
    pub interval: Duration,
    pub shutdown: ShutdownPolicy,
}

impl Config {
    pub const fn new() -> Self {
        Config {
            debug_var: DEBUG_VAR,
            dump_dir_var: DUMP_DIR_VAR,
            interval: REPORT_INTERVAL,
            shutdown: ShutdownPolicy::Detach,
        }
    }

    pub const fn with_interval(self, interval: Duration) -> Self {
        Config { interval, ..self }
    }

    pub const fn with_shutdown(self, shutdown: ShutdownPolicy) -> Self {
        Config { shutdown, ..self }
    }

    /// `name` must end with a nul byte.
    pub const fn with_debug_var(self, name: &'static [u8]) -> Self {
        Config {
            debug_var: name,
            ..self
        }
    }

    pub const fn with_dump_dir_var(self, name: &'static str) -> Self {
        Config {
            dump_dir_var: name,
            ..self
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::new()
    }
}

/// Read a boolean toggle with `getenv`, which does not allocate.  Only the exact
/// value `1` enables it.
pub(crate) fn env_flag(name: &'static [u8]) -> bool {
    if name.last() != Some(&0) {
        return false;
    }
    let value = unsafe { libc::getenv(name.as_ptr() as *const libc::c_char) };
    if value.is_null() {
        return false;
    }
    unsafe { std::ffi::CStr::from_ptr(value) }.to_bytes() == b"1"
}
