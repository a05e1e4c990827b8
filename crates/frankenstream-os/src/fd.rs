//! Descriptor I/O through libc.

use std::ffi::c_int;
use std::io;

use frankenstream_core::{LowLevelIo, Whence};

#[inline]
fn check(rc: isize) -> io::Result<usize> {
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(rc as usize)
    }
}

const fn whence(w: Whence) -> c_int {
    match w {
        Whence::Set => libc::SEEK_SET,
        Whence::Current => libc::SEEK_CUR,
        Whence::End => libc::SEEK_END,
    }
}

/// `read`/`write`/`lseek`/`close` on real descriptors.
#[derive(Debug, Default, Clone, Copy)]
pub struct FdIo;

impl LowLevelIo for FdIo {
    fn read(&self, fd: i32, buf: &mut [u8]) -> io::Result<usize> {
        // SAFETY: `buf` is a valid writable region of `buf.len()` bytes.
        check(unsafe { libc::read(fd, buf.as_mut_ptr().cast(), buf.len()) })
    }

    fn write(&self, fd: i32, buf: &[u8]) -> io::Result<usize> {
        // SAFETY: `buf` is a valid readable region of `buf.len()` bytes.
        check(unsafe { libc::write(fd, buf.as_ptr().cast(), buf.len()) })
    }

    fn seek(&self, fd: i32, offset: i64, w: Whence) -> io::Result<i64> {
        // SAFETY: lseek takes no pointers.
        let rc = unsafe { libc::lseek(fd, offset as libc::off_t, whence(w)) };
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(rc as i64)
        }
    }

    fn close(&self, fd: i32) -> io::Result<()> {
        // SAFETY: the stream owns `fd` and never uses it after close.
        if unsafe { libc::close(fd) } < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipe() -> (i32, i32) {
        let mut fds = [0 as c_int; 2];
        // SAFETY: `fds` has room for the two descriptors.
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        (fds[0], fds[1])
    }

    #[test]
    fn pipe_round_trip_and_espipe() {
        let (r, w) = pipe();
        assert_eq!(FdIo.write(w, b"ping").unwrap(), 4);
        let mut buf = [0u8; 8];
        assert_eq!(FdIo.read(r, &mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"ping");
        let err = FdIo.seek(r, 0, Whence::Current).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ESPIPE));
        FdIo.close(r).unwrap();
        FdIo.close(w).unwrap();
    }
}
