use std::io;
use std::mem;
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd};

use super::fd::FileDesc;

pub const SFD_CLOEXEC: i32 = libc::SFD_CLOEXEC;
pub const SFD_NONBLOCK: i32 = libc::SFD_NONBLOCK;

/// A Linux `signalfd(2)`, read by `eventq::EventQ` as the substitute for
/// kqueue's `EVFILT_SIGNAL` (and, via `SIGCHLD`, for `EVFILT_PROC`; see
/// REDESIGN FLAGS).
///
/// Signals delivered through a `signalfd` must first be blocked in the
/// process signal mask (`block`), or the kernel's default/ignored
/// disposition races the fd read.
#[derive(Debug)]
pub struct SignalFd {
    inner: FileDesc,
    mask: libc::sigset_t,
}

impl SignalFd {
    pub fn new(signals: &[libc::c_int]) -> io::Result<SignalFd> {
        let mask = Self::mask_of(signals);
        let fd = syscall!(signalfd(-1, &mask, SFD_CLOEXEC | SFD_NONBLOCK))?;
        Ok(SignalFd {
            inner: FileDesc::new(fd),
            mask,
        })
    }

    /// Replace the signal set this fd reports.
    pub fn set_mask(&mut self, signals: &[libc::c_int]) -> io::Result<()> {
        let mask = Self::mask_of(signals);
        syscall!(signalfd(self.inner.raw(), &mask, 0))?;
        self.mask = mask;
        Ok(())
    }

    fn mask_of(signals: &[libc::c_int]) -> libc::sigset_t {
        unsafe {
            let mut mask: libc::sigset_t = mem::zeroed();
            libc::sigemptyset(&mut mask);
            for &sig in signals {
                libc::sigaddset(&mut mask, sig);
            }
            mask
        }
    }

    /// Block `signals` in the calling thread's mask so they queue for
    /// `signalfd` instead of running their default disposition.
    pub fn block(signals: &[libc::c_int]) -> io::Result<()> {
        let mask = Self::mask_of(signals);
        syscall!(pthread_sigmask(libc::SIG_BLOCK, &mask, std::ptr::null_mut()))?;
        Ok(())
    }

    pub fn unblock(signals: &[libc::c_int]) -> io::Result<()> {
        let mask = Self::mask_of(signals);
        syscall!(pthread_sigmask(libc::SIG_UNBLOCK, &mask, std::ptr::null_mut()))?;
        Ok(())
    }

    /// Drains one `signalfd_siginfo` frame, returning the signal number.
    /// Returns `WouldBlock` if no signal is currently pending.
    pub fn read(&self) -> io::Result<libc::c_int> {
        let mut info: libc::signalfd_siginfo = unsafe { mem::zeroed() };
        let buf = unsafe {
            std::slice::from_raw_parts_mut(
                &mut info as *mut _ as *mut u8,
                mem::size_of::<libc::signalfd_siginfo>(),
            )
        };
        let n = syscall!(read(
            self.inner.raw(),
            buf.as_mut_ptr() as *mut libc::c_void,
            buf.len()
        ))?;
        if n as usize != buf.len() {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "short signalfd read"));
        }
        Ok(info.ssi_signo as libc::c_int)
    }
}

impl FromRawFd for SignalFd {
    unsafe fn from_raw_fd(fd: RawFd) -> Self {
        SignalFd {
            inner: FileDesc::new(fd),
            mask: mem::zeroed(),
        }
    }
}

impl IntoRawFd for SignalFd {
    fn into_raw_fd(self) -> RawFd {
        self.inner.into_raw()
    }
}

impl AsRawFd for SignalFd {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.raw()
    }
}
