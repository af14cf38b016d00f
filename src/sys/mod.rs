pub mod fd;
pub mod socket;
pub mod epoll;
pub mod eventfd;
pub mod timerfd;
pub mod signalfd;

use std::io;

/// Turn a raw `c_int` return value already obtained from a syscall into a
/// `Result`, the way `std`'s own unix backend does for calls that don't fit
/// the simple "-1 on error" shape of [`syscall!`](crate::macros).
pub fn cvt(res: libc::c_int) -> io::Result<libc::c_int> {
    if res == -1 {
        Err(io::Error::last_os_error())
    } else {
        Ok(res)
    }
}
