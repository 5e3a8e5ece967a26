//! Companion crate to [`malloc_tally`].  This crate compiles into a dynamic library that can be
//! loaded via `LD_PRELOAD` to intercept the `malloc`, `calloc`, `realloc` and `free` calls
//! issued by the program, and its start-up through `__libc_start_main`, and redirect them to
//! the `malloc_tally` profiler.

use libc::{c_char, c_int, c_void, size_t};
use malloc_tally::{Config, DlsymRuntime, MainFn, Tally};

static TALLY: Tally<DlsymRuntime> = Tally::new(DlsymRuntime, Config::new());

/// Records the usable size of the returned block before handing it back.
///
/// # Safety
///
/// Same contract as `malloc(3)`.
#[no_mangle]
pub unsafe extern "C" fn malloc(size: size_t) -> *mut c_void {
    TALLY.allocate(size)
}

/// # Safety
///
/// Same contract as `calloc(3)`.
#[no_mangle]
pub unsafe extern "C" fn calloc(count: size_t, size: size_t) -> *mut c_void {
    TALLY.zero_allocate(count, size)
}

/// # Safety
///
/// Same contract as `realloc(3)`.
#[no_mangle]
pub unsafe extern "C" fn realloc(ptr: *mut c_void, size: size_t) -> *mut c_void {
    TALLY.resize(ptr, size)
}

/// # Safety
///
/// Same contract as `free(3)`.
#[no_mangle]
pub unsafe extern "C" fn free(ptr: *mut c_void) {
    TALLY.release(ptr)
}

/// Starts the program with [`main_hook`] in place of its `main`.
///
/// # Safety
///
/// Only ever called by the C runtime's start-up code.
#[no_mangle]
pub unsafe extern "C" fn __libc_start_main(
    main: MainFn,
    argc: c_int,
    argv: *mut *mut c_char,
    init: *mut c_void,
    fini: *mut c_void,
    rtld_fini: *mut c_void,
    stack_end: *mut c_void,
) -> c_int {
    TALLY.start_main(main, argc, argv, init, fini, rtld_fini, stack_end, main_hook)
}

unsafe extern "C" fn main_hook(
    argc: c_int,
    argv: *mut *mut c_char,
    envp: *mut *mut c_char,
) -> c_int {
    TALLY.run_main(argc, argv, envp)
}
