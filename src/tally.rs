//! The replacement heap primitives and the `main` wrapper.

use std::{
    env, io,
    path::PathBuf,
    ptr,
    sync::{Mutex, PoisonError},
};

use libc::{c_char, c_int, c_void};

use crate::{
    arena::{Arena, BOOTSTRAP_CAPACITY},
    config::Config,
    control::{Control, Primitives, Strategy},
    debug::fatal,
    debug_msg,
    reporter::{Report, Reporter},
    runtime::{HookRuntime, MainFn, StartMainFn, Symbol},
    stats::{Snapshot, Stats},
};

/// Heap profiler state: the real allocator, the bootstrap arena, the counters
/// and the reporting thread.
///
/// A process normally has exactly one, in a `static`, whose methods are called
/// from the exported `malloc`, `calloc`, `realloc`, `free` and
/// `__libc_start_main` symbols.
pub struct Tally<R> {
    runtime: R,
    config: Config,
    control: Control,
    arena: Arena<BOOTSTRAP_CAPACITY>,
    stats: Stats,
    reporter: Mutex<Option<Reporter>>,
}

impl<R> Tally<R> {
    pub const fn new(runtime: R, config: Config) -> Self {
        Tally {
            runtime,
            control: Control::new(config.debug_var),
            config,
            arena: Arena::new(),
            stats: Stats::new(),
            reporter: Mutex::new(None),
        }
    }

    pub fn debug(&self) -> bool {
        self.control.debug()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn control(&self) -> &Control {
        &self.control
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn runtime(&self) -> &R {
        &self.runtime
    }

    /// Whether `ptr` was handed out by the bootstrap arena.
    pub fn is_bootstrap(&self, ptr: *const c_void) -> bool {
        self.arena.owns(ptr as *const u8)
    }

    fn bootstrap(&self, size: usize) -> *mut c_void {
        debug_msg!(self, "[INFO] Bootstrap malloc (size: {})\n", size);
        match self.arena.allocate(size) {
            Ok(p) => p.as_ptr() as *mut c_void,
            Err(e) => fatal(format_args!("[ERROR] {}\n", e)),
        }
    }
}

impl<R: HookRuntime> Tally<R> {
    fn primitives(&self) -> &Primitives {
        match self.control.resolve(&self.runtime) {
            Ok(primitives) => primitives,
            Err(e) => fatal(format_args!("[ERROR] {}\n", e)),
        }
    }

    // Bytes behind `ptr`, whoever handed it out.
    unsafe fn block_size(&self, ptr: *mut c_void) -> usize {
        match self.arena.block_size(ptr as *const u8) {
            Some(size) => size,
            None => self.runtime.usable_size(ptr),
        }
    }

    /// `malloc`.
    ///
    /// # Safety
    ///
    /// Same contract as `malloc(3)`.
    pub unsafe fn allocate(&self, size: usize) -> *mut c_void {
        debug_msg!(self, "[INFO] Malloc call (size: {})\n", size);
        match self.control.strategy() {
            Strategy::Bootstrap => self.bootstrap(size),
            Strategy::Delegated => {
                let p = (self.primitives().malloc)(size);
                if p.is_null() {
                    debug_msg!(self, "[WARN] Malloc failed (size: {})\n", size);
                    return p;
                }
                self.stats
                    .record_allocate(self.runtime.usable_size(p) as i64);
                p
            }
        }
    }

    /// `calloc`.  Until the real `calloc` is known this is `malloc` followed
    /// by a zero fill, and is counted as a `malloc`.
    ///
    /// # Safety
    ///
    /// Same contract as `calloc(3)`.
    pub unsafe fn zero_allocate(&self, count: usize, size: usize) -> *mut c_void {
        debug_msg!(self, "[INFO] Calloc call (num: {}, size: {})\n", count, size);
        let real = match self.control.primitives() {
            Some(real) => real,
            None => {
                let total = match count.checked_mul(size) {
                    Some(total) => total,
                    None => return ptr::null_mut(),
                };
                let p = self.allocate(total);
                if !p.is_null() {
                    ptr::write_bytes(p as *mut u8, 0, total);
                }
                return p;
            }
        };

        let p = (real.calloc)(count, size);
        if p.is_null() {
            debug_msg!(self, "[WARN] Calloc failed (num: {}, size: {})\n", count, size);
            return p;
        }
        self.stats
            .record_zero_allocate(self.runtime.usable_size(p) as i64);
        p
    }

    /// `realloc`.  Records the change in usable size of the block.
    ///
    /// # Safety
    ///
    /// Same contract as `realloc(3)`.
    pub unsafe fn resize(&self, ptr: *mut c_void, size: usize) -> *mut c_void {
        debug_msg!(self, "[INFO] Realloc call (ptr: {:p}, size: {})\n", ptr, size);

        // The real allocator knows nothing about arena blocks.
        if let Some(old) = self.arena.block_size(ptr as *const u8) {
            return self.relocate(ptr, old, size);
        }

        let real = match self.control.primitives() {
            Some(real) => real,
            None => return self.relocate(ptr, self.block_size(ptr), size),
        };

        let before = self.runtime.usable_size(ptr) as i64;
        let p = (real.realloc)(ptr, size);
        if p.is_null() {
            if size == 0 && !ptr.is_null() {
                // realloc(ptr, 0) released the block.
                self.stats.record_resize(-before);
            } else {
                debug_msg!(self, "[WARN] Realloc failed (ptr: {:p}, size: {})\n", ptr, size);
            }
            return p;
        }
        let after = self.runtime.usable_size(p) as i64;
        self.stats.record_resize(after - before);
        p
    }

    // Move `old_size` bytes of `ptr` into a fresh block the hard way.
    unsafe fn relocate(&self, ptr: *mut c_void, old_size: usize, size: usize) -> *mut c_void {
        let p = self.allocate(size);
        if !p.is_null() && !ptr.is_null() {
            ptr::copy_nonoverlapping(ptr as *const u8, p as *mut u8, old_size.min(size));
            self.release(ptr);
        }
        p
    }

    /// `free`.  Arena blocks are never reclaimed, so releasing one does nothing.
    ///
    /// # Safety
    ///
    /// Same contract as `free(3)`.
    pub unsafe fn release(&self, ptr: *mut c_void) {
        debug_msg!(self, "[INFO] Free call (ptr: {:p})\n", ptr);
        if self.is_bootstrap(ptr) {
            debug_msg!(self, "[INFO] Free pointer allocated by bootstrap malloc\n");
            return;
        }

        let real = self.primitives();
        let size = self.runtime.usable_size(ptr);
        self.stats.record_release(size as i64);
        (real.free)(ptr);
    }

    /// Write a report of the current counters to stderr.
    pub fn report(&self) {
        let _ = self.stats.report(&mut io::stderr());
    }

    /// `__libc_start_main`: remember the program's `main` and start the
    /// program through the real `__libc_start_main` with `hook` in its place.
    /// `hook` must end up calling [`Tally::run_main`] on this same instance.
    ///
    /// # Safety
    ///
    /// Same contract as `__libc_start_main`.
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn start_main(
        &self,
        main: MainFn,
        argc: c_int,
        argv: *mut *mut c_char,
        init: *mut c_void,
        fini: *mut c_void,
        rtld_fini: *mut c_void,
        stack_end: *mut c_void,
        hook: MainFn,
    ) -> c_int {
        if !self.control.set_entry_point(main) {
            debug_msg!(self, "[WARN] Entry point already captured\n");
        }
        let real: StartMainFn = match self.runtime.resolve(Symbol::StartMain) {
            Ok(addr) => std::mem::transmute(addr.as_ptr()),
            Err(e) => fatal(format_args!("[ERROR] {}\n", e)),
        };
        real(hook, argc, argv, init, fini, rtld_fini, stack_end)
    }

    /// Run the program's real `main` between the start and the end of
    /// reporting, and return its exit code unchanged.
    ///
    /// # Safety
    ///
    /// Same contract as the program's `main`.
    pub unsafe fn run_main(
        &'static self,
        argc: c_int,
        argv: *mut *mut c_char,
        envp: *mut *mut c_char,
    ) -> c_int
    where
        R: 'static,
    {
        let main = match self.control.entry_point() {
            Some(main) => main,
            None => fatal(format_args!("[ERROR] failed to hook main: entry point unknown\n")),
        };
        self.start_reporting();
        let code = main(argc, argv, envp);
        debug_msg!(self, "[INFO] Actual main function completed (exit code: {})\n", code);
        self.finish();
        code
    }

    fn start_reporting(&'static self)
    where
        R: 'static,
    {
        let mut slot = self.reporter.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_some() {
            return;
        }
        match Reporter::spawn(self, self.config.interval) {
            Ok(reporter) => *slot = Some(reporter),
            Err(e) => eprintln!("malloc_tally: failed to start reporting thread: {}", e),
        }
    }

    /// Stop periodic reporting, retire the reporting thread, print the final
    /// report and store the final snapshot if a snapshot directory is set.
    pub fn finish(&self) {
        self.stats.disable_reporting();
        let reporter = self
            .reporter
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(reporter) = reporter {
            reporter.retire(self.config.shutdown);
        }

        let snapshot = self.stats.snapshot();
        let _ = snapshot.report(&mut io::stderr());
        if let Some(dir) = self.dump_dir() {
            save_snapshot(&snapshot, dir);
        }
    }

    fn dump_dir(&self) -> Option<PathBuf> {
        env::var_os(self.config.dump_dir_var)
            .filter(|dir| !dir.is_empty())
            .map(PathBuf::from)
    }
}

fn save_snapshot(snapshot: &Snapshot, dir: PathBuf) {
    snapshot
        .save(&dir)
        .map(|_| ())
        .unwrap_or_else(|e| eprintln!("malloc_tally: failed to write snapshot: {}", e));
}

impl<R: HookRuntime> Report for Tally<R> {
    fn reporting_enabled(&self) -> bool {
        self.stats.reporting_enabled()
    }

    fn report(&self) {
        Tally::report(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::ShutdownPolicy,
        reporter::ReporterState,
        runtime::{
            fake::{self, FakeRuntime},
            ResolveError,
        },
    };
    use std::{
        process::Command,
        ptr::NonNull,
        slice,
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    const QUIET: &[u8] = b"MALLOC_TALLY_TEST_TALLY_QUIET\0";

    fn config() -> Config {
        Config::new()
            .with_debug_var(QUIET)
            .with_dump_dir_var("MALLOC_TALLY_TEST_TALLY_NO_DIR")
    }

    fn tally() -> Box<Tally<FakeRuntime>> {
        Box::new(Tally::new(FakeRuntime::new(), config()))
    }

    fn check_invariants<R>(tally: &Tally<R>) {
        let s = tally.stats().snapshot();
        assert_eq!(s.reserved, s.total_reserved - s.freed);
        assert!(s.peak >= s.reserved);
    }

    #[test]
    fn allocate_then_release() {
        let tally = tally();
        let before = tally.stats().snapshot().reserved;
        unsafe {
            let p = tally.allocate(100);
            assert!(!p.is_null());
            assert_eq!(tally.stats().snapshot().reserved - before, 112);
            tally.release(p);
        }
        let s = tally.stats().snapshot();
        assert_eq!(s.reserved, before);
        assert_eq!(s.num_allocs, 1);
        assert_eq!(s.num_releases, 1);
        assert_eq!(s.total_reserved, 112);
        assert_eq!(s.freed, 112);
        assert_eq!(s.peak, 112);
        assert_eq!(tally.control().resolutions(), 1);
    }

    #[test]
    fn calloc_before_resolution_falls_back_to_malloc() {
        let tally = tally();
        assert!(tally.control().primitives().is_none());
        unsafe {
            let p = tally.zero_allocate(10, 8);
            assert!(!p.is_null());
            assert!(fake::block_usable_size(p) >= 80);
            assert!(slice::from_raw_parts(p as *const u8, 80)
                .iter()
                .all(|b| *b == 0));
            tally.release(p);
        }
        let s = tally.stats().snapshot();
        assert_eq!(s.num_allocs, 1);
        assert_eq!(s.num_zero_allocs, 0);
        check_invariants(&tally);
    }

    #[test]
    fn calloc_after_resolution_is_counted_as_calloc() {
        let tally = tally();
        unsafe {
            tally.release(tally.allocate(1));
            let p = tally.zero_allocate(3, 7);
            assert!(slice::from_raw_parts(p as *const u8, 21)
                .iter()
                .all(|b| *b == 0));
            assert_eq!(tally.stats().snapshot().num_zero_allocs, 1);
            assert_eq!(tally.stats().snapshot().reserved, 32);
            tally.release(p);
            assert!(tally.zero_allocate(usize::MAX, 2).is_null());
        }
        check_invariants(&tally);
    }

    #[test]
    fn resize_records_usable_size_difference() {
        let tally = tally();
        unsafe {
            let p = tally.allocate(64);
            let before = tally.stats().snapshot();
            let q = tally.resize(p, 256);
            assert!(!q.is_null());
            let after = tally.stats().snapshot();
            assert_eq!(
                after.reserved - before.reserved,
                (fake::round_up(256) - fake::round_up(64)) as i64
            );
            assert_eq!(after.num_resizes, 1);

            let r = tally.resize(q, 20);
            assert_eq!(tally.stats().snapshot().reserved, 32);
            tally.release(r);
        }
        check_invariants(&tally);
        assert_eq!(tally.stats().snapshot().reserved, 0);
    }

    #[test]
    fn resize_usable_size_is_not_the_requested_size() {
        let tally = tally();
        unsafe {
            let p = tally.allocate(60);
            let before = tally.stats().snapshot().reserved;
            let q = tally.resize(p, 250);
            let grown = tally.stats().snapshot().reserved - before;
            assert_eq!(grown, 256 - 64);
            assert_ne!(grown, 250 - 60);
            tally.release(q);
        }
    }

    #[test]
    fn resize_keeps_contents() {
        let tally = tally();
        unsafe {
            let p = tally.allocate(16) as *mut u8;
            for i in 0..16 {
                *p.add(i) = i as u8;
            }
            let q = tally.resize(p as *mut c_void, 4096) as *mut u8;
            assert_eq!(
                slice::from_raw_parts(q, 16),
                &(0..16).collect::<Vec<u8>>()[..]
            );
            tally.release(q as *mut c_void);
        }
    }

    #[test]
    fn realloc_to_zero_releases() {
        let tally = tally();
        unsafe {
            let p = tally.allocate(40);
            assert!(tally.resize(p, 0).is_null());
        }
        let s = tally.stats().snapshot();
        assert_eq!(s.reserved, 0);
        assert_eq!((s.total_reserved, s.freed), (0, 0));
        assert_eq!((s.num_resizes, s.num_releases), (1, 0));
        check_invariants(&tally);
    }

    #[test]
    fn resize_before_resolution_allocates_fresh_block() {
        let tally = tally();
        unsafe {
            let p = tally.resize(ptr::null_mut(), 24);
            assert!(!p.is_null());
            tally.release(p);
        }
        let s = tally.stats().snapshot();
        assert_eq!(s.num_allocs, 1);
        assert_eq!(s.num_resizes, 0);
        check_invariants(&tally);
    }

    #[test]
    fn failed_allocations_are_not_counted() {
        let tally = tally();
        unsafe {
            assert!(tally.allocate(fake::FAIL_ABOVE + 1).is_null());
            let p = tally.allocate(8);
            let before = tally.stats().snapshot();
            assert!(tally.resize(p, fake::FAIL_ABOVE + 1).is_null());
            assert_eq!(tally.stats().snapshot().reserved, before.reserved);
            assert_eq!(tally.stats().snapshot().num_resizes, 0);
            tally.release(p);
        }
        let s = tally.stats().snapshot();
        assert_eq!(s.num_allocs, 1);
        assert_eq!(s.total_reserved, 16);
        check_invariants(&tally);
    }

    #[test]
    fn invariants_hold_over_mixed_sequence() {
        let tally = tally();
        let mut live = Vec::new();
        unsafe {
            for i in 0..200usize {
                match i % 5 {
                    0 | 1 => live.push(tally.allocate(i * 3)),
                    2 => live.push(tally.zero_allocate(i, 4)),
                    3 => {
                        if let Some(p) = live.pop() {
                            live.push(tally.resize(p, i * 7 % 500 + 1));
                        }
                    }
                    _ => {
                        if let Some(p) = live.pop() {
                            tally.release(p);
                        }
                    }
                }
                check_invariants(&tally);
            }
            for p in live.drain(..) {
                tally.release(p);
                check_invariants(&tally);
            }
        }
        assert_eq!(tally.stats().snapshot().reserved, 0);
        assert_eq!(tally.control().resolutions(), 1);
    }

    #[test]
    fn arena_blocks_are_released_silently() {
        let tally = tally();
        let p = tally.bootstrap(48);
        assert!(tally.is_bootstrap(p));
        unsafe { tally.release(tally.allocate(8)) };

        let before = tally.stats().snapshot();
        let frees = fake::real_frees();
        unsafe { tally.release(p) };
        let after = tally.stats().snapshot();

        assert_eq!(fake::real_frees(), frees);
        assert_eq!(
            (after.reserved, after.freed, after.num_releases),
            (before.reserved, before.freed, before.num_releases)
        );
    }

    #[test]
    fn resizing_an_arena_block_moves_it_to_the_real_heap() {
        let tally = tally();
        let p = tally.bootstrap(4) as *mut u8;
        unsafe {
            p.copy_from_nonoverlapping(b"abcd".as_ptr(), 4);
            let q = tally.resize(p as *mut c_void, 64);
            assert!(!tally.is_bootstrap(q));
            assert_eq!(slice::from_raw_parts(q as *const u8, 4), b"abcd");
            tally.release(q);
        }
        let s = tally.stats().snapshot();
        assert_eq!(s.num_allocs, 1);
        assert_eq!(s.num_releases, 1);
        assert_eq!(s.reserved, 0);
    }

    // A runtime whose lookups allocate, like `dlsym` does when it needs to
    // report an error.
    struct AllocatingRuntime {
        inner: FakeRuntime,
        tally: AtomicUsize,
        nested: AtomicUsize,
    }

    unsafe impl HookRuntime for AllocatingRuntime {
        fn resolve(&self, symbol: Symbol) -> Result<NonNull<c_void>, ResolveError> {
            let tally = self.tally.load(Ordering::SeqCst) as *const Tally<AllocatingRuntime>;
            if let Some(tally) = unsafe { tally.as_ref() } {
                unsafe {
                    let p = tally.allocate(32);
                    let q = tally.zero_allocate(2, 8);
                    if tally.is_bootstrap(p) && tally.is_bootstrap(q) {
                        self.nested.fetch_add(1, Ordering::SeqCst);
                    }
                    tally.release(q);
                }
            }
            self.inner.resolve(symbol)
        }

        unsafe fn usable_size(&self, ptr: *mut c_void) -> usize {
            self.inner.usable_size(ptr)
        }
    }

    #[test]
    fn allocations_during_resolution_use_the_arena() {
        let runtime = AllocatingRuntime {
            inner: FakeRuntime::new(),
            tally: AtomicUsize::new(0),
            nested: AtomicUsize::new(0),
        };
        let tally = Box::new(Tally::new(runtime, config()));
        tally
            .runtime()
            .tally
            .store(&*tally as *const _ as usize, Ordering::SeqCst);

        unsafe {
            let p = tally.allocate(10);
            assert!(!tally.is_bootstrap(p));
            tally.release(p);
        }
        assert_eq!(tally.runtime().nested.load(Ordering::SeqCst), 4);
        let s = tally.stats().snapshot();
        assert_eq!((s.num_allocs, s.num_zero_allocs, s.num_releases), (1, 0, 1));
        assert_eq!(s.reserved, 0);
        assert_eq!(tally.control().resolutions(), 1);
    }

    unsafe extern "C" fn fake_main(argc: c_int, _: *mut *mut c_char, _: *mut *mut c_char) -> c_int {
        argc + 40
    }

    unsafe extern "C" fn hook_main(argc: c_int, _: *mut *mut c_char, _: *mut *mut c_char) -> c_int {
        -argc
    }

    #[test]
    fn start_main_captures_entry_and_installs_hook() {
        let tally = tally();
        let code = unsafe {
            tally.start_main(
                fake_main,
                3,
                ptr::null_mut(),
                ptr::null_mut(),
                ptr::null_mut(),
                ptr::null_mut(),
                ptr::null_mut(),
                hook_main,
            )
        };
        assert_eq!(code, -3);
        let main = tally.control().entry_point().unwrap();
        assert_eq!(unsafe { main(2, ptr::null_mut(), ptr::null_mut()) }, 42);
    }

    #[test]
    fn run_main_returns_exit_code_and_stops_reporting() {
        let tally: &'static Tally<FakeRuntime> = Box::leak(Box::new(Tally::new(
            FakeRuntime::new(),
            config()
                .with_interval(Duration::from_millis(1))
                .with_shutdown(ShutdownPolicy::Join),
        )));
        assert!(tally.control().set_entry_point(fake_main));

        assert_eq!(tally.config().shutdown, ShutdownPolicy::Join);
        let code = unsafe { tally.run_main(2, ptr::null_mut(), ptr::null_mut()) };
        assert_eq!(code, 42);
        assert!(!tally.stats().reporting_enabled());
        assert!(tally.reporter.lock().unwrap().is_none());

        tally.finish();
        assert!(!tally.stats().reporting_enabled());
    }

    #[test]
    fn reporter_runs_while_main_runs() {
        let tally: &'static Tally<FakeRuntime> =
            Box::leak(Box::new(Tally::new(FakeRuntime::new(), config())));
        tally.start_reporting();
        {
            let slot = tally.reporter.lock().unwrap();
            assert_eq!(slot.as_ref().unwrap().state(), ReporterState::Running);
        }
        tally.finish();
        assert!(tally.reporter.lock().unwrap().is_none());
    }

    #[test]
    fn final_snapshot_is_saved_when_directory_is_set() {
        let dir = std::env::temp_dir().join(format!("malloc_tally_tally_test.{}", std::process::id()));
        std::env::set_var("MALLOC_TALLY_TEST_TALLY_DIR", &dir);
        let tally = Tally::new(
            FakeRuntime::new(),
            config().with_dump_dir_var("MALLOC_TALLY_TEST_TALLY_DIR"),
        );
        unsafe { tally.allocate(1000) };
        tally.finish();

        let path = dir.join(format!("malloc_tally.{}.yaml", std::process::id()));
        let saved = Snapshot::load(&path).unwrap();
        let _ = std::fs::remove_dir_all(&dir);
        assert_eq!(saved.num_allocs, 1);
        assert_eq!(saved.reserved, 1008);
    }

    const FATAL_CHILD_VAR: &str = "MALLOC_TALLY_TEST_FATAL_CHILD";

    // Runs for real only inside the child process spawned below.
    #[test]
    fn missing_free_is_fatal_child() {
        if std::env::var_os(FATAL_CHILD_VAR).is_none() {
            return;
        }
        let tally = Box::new(Tally::new(FakeRuntime::without(Symbol::Free), config()));
        unsafe { tally.allocate(8) };
        unreachable!("allocation must not survive a failed resolution");
    }

    #[test]
    fn missing_free_exits_with_status_one() {
        let output = Command::new(std::env::current_exe().unwrap())
            .args(&[
                "--exact",
                "tally::tests::missing_free_is_fatal_child",
                "--test-threads=1",
                "--nocapture",
            ])
            .env(FATAL_CHILD_VAR, "1")
            .output()
            .unwrap();
        assert_eq!(output.status.code(), Some(1));
        let stderr = String::from_utf8_lossy(&output.stderr);
        assert!(
            stderr.contains("[ERROR] failed to hook free: undefined symbol"),
            "{}",
            stderr
        );
    }
}
