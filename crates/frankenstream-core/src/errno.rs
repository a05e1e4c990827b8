//! Error number definitions.
//!
//! Thread-local errno storage for callers that still speak the C convention.
//! The engine sets `EBADF` when an operation accesses a stream in a direction
//! it was never opened for.

use std::cell::Cell;

thread_local! {
    static ERRNO: Cell<i32> = const { Cell::new(0) };
}

/// Well-known errno constants used by the engine.
pub const EINTR: i32 = 4;
pub const EIO: i32 = 5;
pub const EBADF: i32 = 9;
pub const ECHILD: i32 = 10;
pub const EAGAIN: i32 = 11;
pub const ENOMEM: i32 = 12;
pub const EINVAL: i32 = 22;
pub const ESPIPE: i32 = 29;
pub const EPIPE: i32 = 32;

/// Returns the current thread-local errno value.
pub fn get_errno() -> i32 {
    ERRNO.get()
}

/// Sets the current thread-local errno value.
pub fn set_errno(value: i32) {
    ERRNO.set(value);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_is_thread_local() {
        set_errno(EBADF);
        let other = std::thread::spawn(get_errno).join().unwrap();
        assert_eq!(other, 0);
        assert_eq!(get_errno(), EBADF);
        set_errno(0);
    }
}
