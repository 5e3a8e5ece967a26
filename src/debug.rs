//! Diagnostics that are safe to emit from inside `malloc`.
//!
//! `eprintln!` and friends are fine once the real allocator is known, but the
//! messages below are printed on the allocation path itself, possibly before
//! `dlsym` has returned.  They are formatted into a fixed stack buffer and
//! handed straight to `write(2)`, so printing never re-enters the allocator.

use std::{fmt, process};

const LINE_CAPACITY: usize = 256;

// Fixed-size line buffer; output that does not fit is truncated.
struct StackLine {
    buf: [u8; LINE_CAPACITY],
    len: usize,
}

impl StackLine {
    const fn new() -> Self {
        StackLine {
            buf: [0; LINE_CAPACITY],
            len: 0,
        }
    }

    fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

impl fmt::Write for StackLine {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let room = LINE_CAPACITY - self.len;
        let n = s.len().min(room);
        self.buf[self.len..self.len + n].copy_from_slice(&s.as_bytes()[..n]);
        self.len += n;
        Ok(())
    }
}

/// Format `args` without allocating and write the result to stderr.
pub fn write_stderr(args: fmt::Arguments<'_>) {
    let mut line = StackLine::new();
    let _ = fmt::write(&mut line, args);
    let bytes = line.as_bytes();
    let mut written = 0;
    while written < bytes.len() {
        let res = unsafe {
            libc::write(
                libc::STDERR_FILENO,
                bytes[written..].as_ptr() as *const libc::c_void,
                bytes.len() - written,
            )
        };
        if res <= 0 {
            return;
        }
        written += res as usize;
    }
}

/// Print a diagnostic and terminate the process with status 1.
pub fn fatal(args: fmt::Arguments<'_>) -> ! {
    write_stderr(args);
    process::exit(1)
}

/// Print a diagnostic when the debug toggle of `$tally` is on.
#[macro_export]
macro_rules! debug_msg {
    ($tally:expr, $($arg:tt)*) => {
        if $tally.debug() {
            $crate::debug::write_stderr(format_args!($($arg)*));
        }
    };
}

#[cfg(test)]
mod tests {
    use super::StackLine;
    use std::fmt::Write;

    #[test]
    fn long_lines_are_truncated() {
        let mut line = StackLine::new();
        for _ in 0..100 {
            write!(line, "0123456789").unwrap();
        }
        assert_eq!(line.as_bytes().len(), super::LINE_CAPACITY);
        assert!(line.as_bytes().starts_with(b"0123456789"));
    }

    #[test]
    fn formats_numbers_and_pointers() {
        let mut line = StackLine::new();
        write!(line, "[INFO] malloc(size: {}) -> {:p}\n", 42, 0x10 as *const u8).unwrap();
        assert_eq!(line.as_bytes(), b"[INFO] malloc(size: 42) -> 0x10\n");
    }
}
