//! Where the real allocator lives, and whether we are still looking for it.

use std::{
    mem,
    sync::atomic::{AtomicBool, AtomicUsize, Ordering},
};

use once_cell::sync::OnceCell;

use crate::{
    config,
    runtime::{CallocFn, FreeFn, HookRuntime, MainFn, MallocFn, ReallocFn, ResolveError, Symbol},
};

/// How an allocation request is served.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Strategy {
    /// The real allocator is being resolved; carve the block out of the
    /// bootstrap arena.
    Bootstrap,
    /// Forward to the real allocator, resolving it first if needed.
    Delegated,
}

/// The four real heap primitives.  Only ever built as a whole, so they are
/// either all known or all unknown.
#[derive(Clone, Copy)]
pub struct Primitives {
    pub malloc: MallocFn,
    pub calloc: CallocFn,
    pub realloc: ReallocFn,
    pub free: FreeFn,
}

impl Primitives {
    pub fn resolve<R: HookRuntime>(runtime: &R) -> Result<Self, ResolveError> {
        // SAFETY: `HookRuntime` implementations return functions with the
        // signature that matches the symbol.
        unsafe {
            Ok(Primitives {
                malloc: mem::transmute(runtime.resolve(Symbol::Malloc)?.as_ptr()),
                calloc: mem::transmute(runtime.resolve(Symbol::Calloc)?.as_ptr()),
                realloc: mem::transmute(runtime.resolve(Symbol::Realloc)?.as_ptr()),
                free: mem::transmute(runtime.resolve(Symbol::Free)?.as_ptr()),
            })
        }
    }
}

pub struct Control {
    initializing: AtomicBool,
    debug_var: &'static [u8],
    debug: OnceCell<bool>,
    primitives: OnceCell<Primitives>,
    entry: OnceCell<MainFn>,
    resolutions: AtomicUsize,
}

impl Control {
    /// `debug_var` is the nul-terminated name of the debug toggle.
    pub const fn new(debug_var: &'static [u8]) -> Self {
        Control {
            initializing: AtomicBool::new(false),
            debug_var,
            debug: OnceCell::new(),
            primitives: OnceCell::new(),
            entry: OnceCell::new(),
            resolutions: AtomicUsize::new(0),
        }
    }

    /// Debug toggle, read from the environment on first use.
    pub fn debug(&self) -> bool {
        *self.debug.get_or_init(|| config::env_flag(self.debug_var))
    }

    pub fn initializing(&self) -> bool {
        self.initializing.load(Ordering::SeqCst)
    }

    pub fn strategy(&self) -> Strategy {
        if self.initializing() {
            Strategy::Bootstrap
        } else {
            Strategy::Delegated
        }
    }

    /// The real primitives, if they have been resolved already.
    pub fn primitives(&self) -> Option<&Primitives> {
        self.primitives.get()
    }

    /// Resolve the real primitives unless that happened already.  Allocations
    /// made by the runtime while resolving see [`Strategy::Bootstrap`]; other
    /// threads that need the primitives wait for the first resolution to end.
    pub fn resolve<R: HookRuntime>(&self, runtime: &R) -> Result<&Primitives, ResolveError> {
        if let Some(primitives) = self.primitives.get() {
            return Ok(primitives);
        }
        self.primitives.get_or_try_init(|| {
            crate::debug_msg!(self, "[INFO] Start init!\n");
            self.initializing.store(true, Ordering::SeqCst);
            self.resolutions.fetch_add(1, Ordering::SeqCst);
            let primitives = Primitives::resolve(runtime);
            self.initializing.store(false, Ordering::SeqCst);
            crate::debug_msg!(self, "[INFO] End init!\n");
            primitives
        })
    }

    /// Number of times resolution was attempted.
    pub fn resolutions(&self) -> usize {
        self.resolutions.load(Ordering::SeqCst)
    }

    /// Remember the program's real `main`.  Returns `false` if it was already
    /// set, in which case the first value is kept.
    pub fn set_entry_point(&self, main: MainFn) -> bool {
        self.entry.set(main).is_ok()
    }

    pub fn entry_point(&self) -> Option<MainFn> {
        self.entry.get().copied()
    }
}
