//! Bump allocator that serves the requests issued while the real allocator is
//! being located.  `dlsym` is free to call `malloc`/`calloc` and we cannot
//! forward those calls anywhere yet, so they are carved out of a static buffer
//! that is never reclaimed.

use std::{
    cell::UnsafeCell,
    error::Error,
    fmt,
    ptr::{self, NonNull},
    sync::{Mutex, PoisonError},
};

/// Capacity of the arena embedded in every [`Tally`](crate::Tally).
pub const BOOTSTRAP_CAPACITY: usize = 80_000;

/// Alignment of every block handed out, matching `max_align_t` on x86-64/aarch64.
pub const BLOCK_ALIGN: usize = 16;

// Every block is preceded by a header that stores the requested size, so that
// a block can be copied out when it is resized later.
const HEADER: usize = BLOCK_ALIGN;

#[repr(C, align(16))]
struct Buffer<const N: usize>([u8; N]);

/// The arena ran out of space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArenaExhausted {
    pub requested: usize,
    pub used: usize,
    pub capacity: usize,
}

impl fmt::Display for ArenaExhausted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "bootstrap arena exhausted: {} bytes requested, {} of {} bytes in use",
            self.requested, self.used, self.capacity
        )
    }
}

impl Error for ArenaExhausted {}

pub struct Arena<const N: usize> {
    buf: UnsafeCell<Buffer<N>>,
    // Offset of the first free byte; always a multiple of `BLOCK_ALIGN`.
    used: Mutex<usize>,
}

// Blocks are disjoint and the offset is only advanced under the lock.
unsafe impl<const N: usize> Sync for Arena<N> {}

impl<const N: usize> Arena<N> {
    pub const fn new() -> Self {
        Arena {
            buf: UnsafeCell::new(Buffer([0; N])),
            used: Mutex::new(0),
        }
    }

    fn base(&self) -> *mut u8 {
        self.buf.get() as *mut u8
    }

    pub const fn capacity(&self) -> usize {
        N
    }

    /// Bytes consumed so far, headers and padding included.
    pub fn used(&self) -> usize {
        *self.used.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Carve a `size`-byte block out of the arena.  The block is zero-filled
    /// since arena memory is never reused.
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>, ArenaExhausted> {
        let mut used = self.used.lock().unwrap_or_else(PoisonError::into_inner);
        let exhausted = ArenaExhausted {
            requested: size,
            used: *used,
            capacity: N,
        };
        let padded = size
            .checked_add(BLOCK_ALIGN - 1)
            .map(|s| s & !(BLOCK_ALIGN - 1))
            .and_then(|s| s.checked_add(HEADER))
            .ok_or(exhausted)?;
        let end = used.checked_add(padded).ok_or(exhausted)?;
        if end > N {
            return Err(exhausted);
        }

        // SAFETY: `*used + HEADER + size <= N`, and the range is not handed
        // out to anyone else because `used` only grows.
        unsafe {
            let header = self.base().add(*used);
            ptr::write(header as *mut usize, size);
            *used = end;
            Ok(NonNull::new_unchecked(header.add(HEADER)))
        }
    }

    /// Whether `ptr` points into this arena's buffer.  Takes no lock: bytes
    /// past [`Arena::used`] are never handed out, so the only pointers into
    /// the buffer a caller can hold are those of handed-out blocks.
    pub fn owns(&self, ptr: *const u8) -> bool {
        let base = self.base() as usize;
        let addr = ptr as usize;
        addr >= base && addr < base + N
    }

    /// Size requested for the block starting at `ptr`, or `None` if `ptr` is
    /// not a block of this arena.
    pub fn block_size(&self, ptr: *const u8) -> Option<usize> {
        if !self.owns(ptr) {
            return None;
        }
        let offset = ptr as usize - self.base() as usize;
        if offset < HEADER || offset % BLOCK_ALIGN != 0 || offset > self.used() {
            return None;
        }
        // SAFETY: every aligned block start below `used` is preceded by a header.
        Some(unsafe { ptr::read(ptr.sub(HEADER) as *const usize) })
    }
}

impl<const N: usize> Default for Arena<N> {
    fn default() -> Self {
        Self::new()
    }
}
