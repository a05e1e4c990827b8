//! Wait-status decoding and signal helpers for coprocess reaping.
//!
//! Bit layout matches glibc's `<sys/wait.h>` macros.

/// Signal raised on writes to a pipe with no reader.
pub const SIGPIPE: i32 = 13;

/// `SIGTERM`, the default signal for stopping a coprocess early.
pub const SIGTERM: i32 = 15;

// ---------------------------------------------------------------------------
// Wait-status decoding
// ---------------------------------------------------------------------------

/// True if the child terminated normally (via `_exit` or `exit`).
#[must_use]
pub const fn wifexited(status: i32) -> bool {
    (status & 0x7f) == 0
}

/// Exit code of a normally-terminated child (valid only when `wifexited`).
#[must_use]
pub const fn wexitstatus(status: i32) -> i32 {
    (status >> 8) & 0xff
}

/// True if the child was killed by a signal.
#[must_use]
pub const fn wifsignaled(status: i32) -> bool {
    let low7 = status & 0x7f;
    low7 != 0 && low7 != 0x7f
}

/// Signal number that killed the child (valid only when `wifsignaled`).
#[must_use]
pub const fn wtermsig(status: i32) -> i32 {
    status & 0x7f
}

/// Build the raw status a normal exit with `code` would produce.
#[must_use]
pub const fn exited_status(code: i32) -> i32 {
    (code & 0xff) << 8
}

/// Build the raw status death by `sig` would produce.
#[must_use]
pub const fn signaled_status(sig: i32) -> i32 {
    sig & 0x7f
}

/// Returns true if `sig` is in the valid POSIX signal range [1, 64].
#[must_use]
pub const fn valid_signal(sig: i32) -> bool {
    sig >= 1 && sig <= 64
}
