//! Process-wide heap counters and the report printed from them.

use std::{
    ffi::CStr,
    fmt::{self, Display, Formatter},
    fs, io,
    path::{Path, PathBuf},
    process,
    sync::atomic::{AtomicBool, AtomicI64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

use num_format::{Locale, ToFormattedString};
use serde::{Deserialize, Serialize};

const UNITS: [&str; 5] = ["B", "kB", "MB", "GB", "TB"];

const TIME_BUFFER_SIZE: usize = 80;

/// Prefix of the snapshot files written at exit.
pub const SNAPSHOT_PREFIX: &str = "malloc_tally";

/// Atomic counters updated by every intercepted call.  Byte counters are signed
/// so that a shrinking `realloc` can be expressed as a negative delta.
pub struct Stats {
    reserved: AtomicI64,
    total_reserved: AtomicI64,
    peak: AtomicI64,
    freed: AtomicI64,

    num_allocs: AtomicI64,
    num_zero_allocs: AtomicI64,
    num_resizes: AtomicI64,
    num_releases: AtomicI64,

    reporting_enabled: AtomicBool,
}

impl Stats {
    pub const fn new() -> Self {
        Stats {
            reserved: AtomicI64::new(0),
            total_reserved: AtomicI64::new(0),
            peak: AtomicI64::new(0),
            freed: AtomicI64::new(0),
            num_allocs: AtomicI64::new(0),
            num_zero_allocs: AtomicI64::new(0),
            num_resizes: AtomicI64::new(0),
            num_releases: AtomicI64::new(0),
            reporting_enabled: AtomicBool::new(true),
        }
    }

    pub fn record_allocate(&self, size: i64) {
        self.reserve(size);
        self.num_allocs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_zero_allocate(&self, size: i64) {
        self.reserve(size);
        self.num_zero_allocs.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a `realloc` that changed the usable size of a block by `delta`.
    /// The delta goes to both `reserved` and `total_reserved` whatever its
    /// sign; only `free` adds to the freed total.
    pub fn record_resize(&self, delta: i64) {
        self.reserve(delta);
        self.num_resizes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_release(&self, size: i64) {
        self.reserved.fetch_sub(size, Ordering::Relaxed);
        self.freed.fetch_add(size, Ordering::Relaxed);
        self.num_releases.fetch_add(1, Ordering::Relaxed);
    }

    fn reserve(&self, size: i64) {
        let current = self.reserved.fetch_add(size, Ordering::Relaxed) + size;
        self.total_reserved.fetch_add(size, Ordering::Relaxed);
        self.raise_peak(current);
    }

    fn raise_peak(&self, current: i64) {
        let mut peak = self.peak.load(Ordering::Relaxed);
        while current > peak {
            match self.peak.compare_exchange_weak(
                peak,
                current,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(p) => peak = p,
            }
        }
    }

    /// Stop periodic reporting.  Idempotent.
    pub fn disable_reporting(&self) {
        self.reporting_enabled.store(false, Ordering::SeqCst);
    }

    pub fn reporting_enabled(&self) -> bool {
        self.reporting_enabled.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            taken_at: unix_now(),
            reserved: self.reserved.load(Ordering::Relaxed),
            peak: self.peak.load(Ordering::Relaxed),
            total_reserved: self.total_reserved.load(Ordering::Relaxed),
            freed: self.freed.load(Ordering::Relaxed),
            num_allocs: self.num_allocs.load(Ordering::Relaxed),
            num_zero_allocs: self.num_zero_allocs.load(Ordering::Relaxed),
            num_resizes: self.num_resizes.load(Ordering::Relaxed),
            num_releases: self.num_releases.load(Ordering::Relaxed),
        }
    }

    /// Write a timestamped report of the current counters to `sink` in a single
    /// `write_all`, so that concurrent reports do not interleave.
    pub fn report<W: io::Write>(&self, sink: &mut W) -> io::Result<()> {
        self.snapshot().report(sink)
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of [`Stats`].
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Snapshot {
    /// Seconds since the unix epoch.
    pub taken_at: i64,
    pub reserved: i64,
    pub peak: i64,
    pub total_reserved: i64,
    pub freed: i64,
    pub num_allocs: i64,
    pub num_zero_allocs: i64,
    pub num_resizes: i64,
    pub num_releases: i64,
}

impl Snapshot {
    /// Write the report text to `sink` in a single `write_all`.
    pub fn report<W: io::Write>(&self, sink: &mut W) -> io::Result<()> {
        sink.write_all(self.to_string().as_bytes())
    }

    /// Store the snapshot as YAML in `dir/malloc_tally.<pid>.yaml`.
    pub fn save(&self, dir: &Path) -> io::Result<PathBuf> {
        let yaml = serde_yaml::to_string(self)
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}.{}.yaml", SNAPSHOT_PREFIX, process::id()));
        fs::write(&path, yaml)?;
        Ok(path)
    }

    pub fn load(path: &Path) -> Result<Self, anyhow::Error> {
        let bytes = fs::read(path)?;
        Ok(serde_yaml::from_slice(&bytes)?)
    }
}

impl Display for Snapshot {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(f, "\n\n>>>>>>>>>>>>> {} <<<<<<<<<<<", local_time(self.taken_at))?;
        writeln!(f, "Overall stats (with alignment):")?;
        write_size(f, "Currently reserved:", self.reserved)?;
        writeln!(f)?;
        write_size(f, "Peak memory:", self.peak)?;
        write_size(f, "Total reserved:", self.total_reserved)?;
        write_size(f, "Total freed:", self.freed)?;
        writeln!(f)?;
        write_count(f, "Number of mallocs:", self.num_allocs)?;
        write_count(f, "Number of callocs:", self.num_zero_allocs)?;
        write_count(f, "Number of reallocs:", self.num_resizes)?;
        write_count(f, "Number of frees:", self.num_releases)?;
        writeln!(f)
    }
}

/// Scale `bytes` to the largest unit that keeps the value non-zero, by repeated
/// integer division by 1024.
pub fn scale(mut bytes: i64) -> (i64, &'static str) {
    let mut unit = 0;
    while bytes / 1024 != 0 && unit < UNITS.len() - 1 {
        bytes /= 1024;
        unit += 1;
    }
    (bytes, UNITS[unit])
}

fn write_size(f: &mut Formatter<'_>, label: &str, bytes: i64) -> fmt::Result {
    let (value, unit) = scale(bytes);
    writeln!(f, "{} {} {}", label, value, unit)
}

fn write_count(f: &mut Formatter<'_>, label: &str, count: i64) -> fmt::Result {
    writeln!(f, "{} {}", label, count.to_formatted_string(&Locale::en))
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

// Render a unix timestamp as local time, like `date` does ("%c %Z").
fn local_time(secs: i64) -> String {
    let t = secs as libc::time_t;
    let mut tm: libc::tm = unsafe { std::mem::zeroed() };
    let mut buf = [0 as libc::c_char; TIME_BUFFER_SIZE];
    let len = unsafe {
        if libc::localtime_r(&t, &mut tm).is_null() {
            return secs.to_string();
        }
        libc::strftime(
            buf.as_mut_ptr(),
            TIME_BUFFER_SIZE,
            b"%c %Z\0".as_ptr() as *const libc::c_char,
            &tm,
        )
    };
    if len == 0 {
        return secs.to_string();
    }
    unsafe { CStr::from_ptr(buf.as_ptr()) }
        .to_string_lossy()
        .into_owned()
}
