//! The seam between the profiler and the dynamic linker.
//!
//! In production the real primitives are found with `dlsym(RTLD_NEXT, ..)` and
//! the block sizes are read with `malloc_usable_size`.  Everything above this
//! module only talks to [`HookRuntime`], so it can be exercised in tests with an
//! allocator that is not interposed at all.

use std::{error::Error, ffi::CStr, fmt, ptr::NonNull};

use libc::{c_char, c_int, c_void, dlerror, dlsym, size_t, RTLD_NEXT};

pub type MallocFn = unsafe extern "C" fn(size: size_t) -> *mut c_void;
pub type CallocFn = unsafe extern "C" fn(count: size_t, size: size_t) -> *mut c_void;
pub type ReallocFn = unsafe extern "C" fn(ptr: *mut c_void, size: size_t) -> *mut c_void;
pub type FreeFn = unsafe extern "C" fn(ptr: *mut c_void);
pub type MainFn =
    unsafe extern "C" fn(argc: c_int, argv: *mut *mut c_char, envp: *mut *mut c_char) -> c_int;

/// `__libc_start_main`.  The `init`, `fini` and `rtld_fini` callbacks and the
/// stack end are passed through untouched, so they are kept opaque.
pub type StartMainFn = unsafe extern "C" fn(
    main: MainFn,
    argc: c_int,
    argv: *mut *mut c_char,
    init: *mut c_void,
    fini: *mut c_void,
    rtld_fini: *mut c_void,
    stack_end: *mut c_void,
) -> c_int;

/// Symbols the profiler replaces.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Symbol {
    Malloc,
    Calloc,
    Realloc,
    Free,
    StartMain,
}

impl Symbol {
    pub const HEAP: [Symbol; 4] = [Symbol::Malloc, Symbol::Calloc, Symbol::Realloc, Symbol::Free];

    pub fn name(self) -> &'static str {
        match self {
            Symbol::Malloc => "malloc",
            Symbol::Calloc => "calloc",
            Symbol::Realloc => "realloc",
            Symbol::Free => "free",
            Symbol::StartMain => "__libc_start_main",
        }
    }

    fn c_name(self) -> &'static [u8] {
        match self {
            Symbol::Malloc => b"malloc\0",
            Symbol::Calloc => b"calloc\0",
            Symbol::Realloc => b"realloc\0",
            Symbol::Free => b"free\0",
            Symbol::StartMain => b"__libc_start_main\0",
        }
    }
}

impl fmt::Display for Symbol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The real implementation of a symbol could not be found.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolveError {
    pub symbol: Symbol,
    pub reason: Option<String>,
}

impl fmt::Display for ResolveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "failed to hook {}", self.symbol)?;
        if let Some(reason) = &self.reason {
            write!(f, ": {}", reason)?;
        }
        Ok(())
    }
}

impl Error for ResolveError {}

/// Access to the original implementations of the hooked symbols.
///
/// # Safety
///
/// Implementations must return, for each [`Symbol`], the address of a function
/// with the matching signature (`MallocFn`, `CallocFn`, ...), and
/// `usable_size` must accept every pointer returned by those functions.
pub unsafe trait HookRuntime: Sync {
    /// Find the real implementation of `symbol`.
    fn resolve(&self, symbol: Symbol) -> Result<NonNull<c_void>, ResolveError>;

    /// Number of bytes actually reserved for a block returned by the real
    /// allocator; 0 for a null pointer.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a live block of the real allocator.
    unsafe fn usable_size(&self, ptr: *mut c_void) -> usize;
}

/// The dynamic linker: the next definition of each symbol after ours, i.e. the
/// one in libc.
#[derive(Clone, Copy, Debug, Default)]
pub struct DlsymRuntime;

unsafe impl HookRuntime for DlsymRuntime {
    fn resolve(&self, symbol: Symbol) -> Result<NonNull<c_void>, ResolveError> {
        let addr = unsafe { dlsym(RTLD_NEXT, symbol.c_name().as_ptr() as *const c_char) };
        NonNull::new(addr).ok_or_else(|| {
            let err = unsafe { dlerror() };
            let reason = if err.is_null() {
                None
            } else {
                Some(unsafe { CStr::from_ptr(err) }.to_string_lossy().into_owned())
            };
            ResolveError { symbol, reason }
        })
    }

    unsafe fn usable_size(&self, ptr: *mut c_void) -> usize {
        if ptr.is_null() {
            return 0;
        }
        libc::malloc_usable_size(ptr)
    }
}
