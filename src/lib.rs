//! `malloc_tally` is a heap usage profiler that runs inside an unmodified program.  It replaces
//! `malloc`, `calloc`, `realloc` and `free`, forwards every call to the real allocator, and
//! keeps a running tally of how many bytes the program holds, the most it ever held, and how
//! many bytes it reserved and released in total.  The tally is printed to stderr every five
//! seconds and once more when the program's `main` returns.
//!
//! All sizes are the *usable* sizes reported by the allocator (`malloc_usable_size`), not the
//! sizes the program asked for, so the numbers include the rounding done by the allocator's
//! size classes.
//!
//! `malloc_tally` works with programs in Rust or any other compiled language that links
//! against glibc.
//!
//! ## Using `malloc_tally` via `LD_PRELOAD`
//!
//! The companion [`lib_malloc_tally`] crate produces a dynamic library that intercepts the
//! allocator calls of any program:
//!
//! ```bash
//! LD_PRELOAD=libmalloc_tally.so ./my_program
//! ```
//!
//! Set `MALLOC_TALLY_DEBUG=1` to log every intercepted call to stderr.
//!
//! ## Keeping the final tally
//!
//! If `MALLOC_TALLY_DIR` is set when the program's `main` returns, the final tally is also
//! stored in `$MALLOC_TALLY_DIR/malloc_tally.<pid>.yaml`.  Use the `mt_print` tool from this
//! crate to print stored tallies:
//!
//! ```bash
//! mt_print --dir $MALLOC_TALLY_DIR
//! ```
//!
//! ## Bootstrapping
//!
//! The real allocator is located with `dlsym(RTLD_NEXT, ..)` on first use, and `dlsym` may
//! itself call `malloc` or `calloc`.  Those nested calls are served from a small static
//! arena ([`arena`]) that is never reclaimed; freeing a block from the arena does nothing.
//!
//! ## Testing without `LD_PRELOAD`
//!
//! [`Tally`] only reaches the real allocator through [`HookRuntime`], so it can be driven in
//! tests by any allocator that implements that trait.

pub mod arena;
pub mod config;
pub mod control;
pub mod debug;
pub mod reporter;
pub mod runtime;
pub mod stats;
pub mod tally;

pub use config::{Config, ShutdownPolicy};
pub use control::Strategy;
pub use runtime::{DlsymRuntime, HookRuntime, MainFn, ResolveError, Symbol};
pub use stats::{Snapshot, Stats};
pub use tally::Tally;
