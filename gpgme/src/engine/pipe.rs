//! Pipes and descriptor flags.

use std::fs::File;
use std::io;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};

/// Creates a pipe, returning the read and the write end.
///
/// Both ends are closed on `exec`.  Use [`set_cloexec`] in a
/// `pre_exec` hook to hand one end to a child.
pub(crate) fn pipe() -> io::Result<(File, File)> {
    let mut fds: [libc::c_int; 2] = [-1, -1];
    if unsafe { raw_pipe(&mut fds) } != 0 {
        return Err(io::Error::last_os_error());
    }

    let (r, w) = unsafe {
        (File::from_raw_fd(fds[0]), File::from_raw_fd(fds[1]))
    };
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    {
        set_cloexec(r.as_raw_fd(), true)?;
        set_cloexec(w.as_raw_fd(), true)?;
    }
    Ok((r, w))
}

/// Creates the descriptors atomically with `O_CLOEXEC`, so that
/// children spawned concurrently do not inherit them.
#[cfg(any(target_os = "linux", target_os = "android"))]
unsafe fn raw_pipe(fds: &mut [libc::c_int; 2]) -> libc::c_int {
    libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC)
}

#[cfg(not(any(target_os = "linux", target_os = "android")))]
unsafe fn raw_pipe(fds: &mut [libc::c_int; 2]) -> libc::c_int {
    libc::pipe(fds.as_mut_ptr())
}

/// Sets or clears `FD_CLOEXEC`.
///
/// This is async-signal-safe and may be called between `fork` and
/// `exec`.
pub(crate) fn set_cloexec(fd: RawFd, on: bool) -> io::Result<()> {
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFD);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        let flags = if on {
            flags | libc::FD_CLOEXEC
        } else {
            flags & ! libc::FD_CLOEXEC
        };
        if libc::fcntl(fd, libc::F_SETFD, flags) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}

/// Puts the descriptor into non-blocking mode.
pub(crate) fn set_nonblocking<F: AsRawFd>(f: &F) -> io::Result<()> {
    let fd = f.as_raw_fd();
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL);
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(io::Error::last_os_error());
        }
    }
    Ok(())
}
