//! Subprocess spawning with IPC-verified `exec`: the parent learns whether
//! the child's `execvp` actually succeeded instead of guessing from a
//! closed pipe that could mean anything.
//!
//! Grounded in the crate's own `sys::socket::Socket::new_pair` (stdio
//! plumbing) and `sys::fd::FileDesc` (cloexec/nonblocking toggling);
//! the exec-status handshake generalizes the single-byte
//! tag-plus-errno convention `original_source/` sibling modules use for
//! reporting post-fork failures across a pipe.

use std::ffi::CString;
use std::os::unix::io::{AsRawFd, IntoRawFd, RawFd};

use crate::error::{Error, Result};
use crate::reactor::Reactor;
use crate::stream::{AddrFamily, Handle};
use crate::sys::socket::Socket;

/// Tag byte identifying which post-fork step failed, carried alongside
/// the raw `errno` in the 5-byte IPC frame `{tag, errno: i32 LE}`.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum IpcTag {
    ExecFailed = b'A',
    StdioSetupFailed = b'B',
}

impl IpcTag {
    fn from_byte(b: u8) -> Option<IpcTag> {
        match b {
            b'A' => Some(IpcTag::ExecFailed),
            b'B' => Some(IpcTag::StdioSetupFailed),
            _ => None,
        }
    }
}

/// A spawned child process and its stdio streams.
pub struct Child {
    pid: libc::pid_t,
    reaped_status: Option<i32>,
    pub stdin: Handle,
    pub stdout: Handle,
    pub stderr: Handle,
}

/// Spawns `argv[0]` with `argv[1..]` as arguments, searched on `PATH` via
/// `execvp`. Waits (suspending on the scheduler, never blocking the
/// thread) until the child has either failed to exec or successfully
/// replaced its image.
pub async fn execute(reactor: &Reactor, argv: &[impl AsRef<str>]) -> Result<Child> {
    if argv.is_empty() {
        return Err(Error::BadArgument("argv must have at least one element".into()));
    }

    let (stdin_parent, stdin_child) =
        Socket::new_pair(libc::AF_UNIX, libc::SOCK_STREAM).map_err(Error::Io)?;
    let (stdout_parent, stdout_child) =
        Socket::new_pair(libc::AF_UNIX, libc::SOCK_STREAM).map_err(Error::Io)?;
    let (stderr_parent, stderr_child) =
        Socket::new_pair(libc::AF_UNIX, libc::SOCK_STREAM).map_err(Error::Io)?;
    let (ipc_parent, ipc_child) =
        Socket::new_pair(libc::AF_UNIX, libc::SOCK_STREAM).map_err(Error::Io)?;

    let c_argv: Vec<CString> = argv
        .iter()
        .map(|s| CString::new(s.as_ref()).map_err(|_| Error::BadArgument("argv contains a NUL byte".into())))
        .collect::<Result<Vec<CString>>>()?;
    let mut c_argv_ptrs: Vec<*const libc::c_char> = c_argv.iter().map(|s| s.as_ptr()).collect();
    c_argv_ptrs.push(std::ptr::null());

    let stdin_child_fd = stdin_child.as_raw_fd();
    let stdout_child_fd = stdout_child.as_raw_fd();
    let stderr_child_fd = stderr_child.as_raw_fd();
    let ipc_child_fd = ipc_child.as_raw_fd();

    let pid = unsafe { libc::fork() };
    if pid < 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }

    if pid == 0 {
        unsafe {
            run_child(
                stdin_child_fd,
                stdout_child_fd,
                stderr_child_fd,
                ipc_child_fd,
                c_argv_ptrs.as_ptr(),
            );
        }
        unreachable!("run_child never returns");
    }

    drop(stdin_child);
    drop(stdout_child);
    drop(stderr_child);
    drop(ipc_child);

    ipc_parent.set_nonblocking(true).map_err(Error::Io)?;
    let ipc_fd = ipc_parent.as_raw_fd();

    let mut frame = [0u8; 5];
    let mut filled = 0;
    let outcome = loop {
        reactor.readable(ipc_fd).await.map_err(Error::Io)?;
        match ipc_parent.read(&mut frame[filled..]) {
            Ok(0) => break None,
            Ok(n) => {
                filled += n;
                if filled == frame.len() {
                    break Some(frame);
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => continue,
            Err(e) => return Err(Error::Io(e)),
        }
    };

    reap_blocking_if_failed(pid, &outcome);

    match outcome {
        None => {}
        Some(frame) => {
            let tag = IpcTag::from_byte(frame[0]).ok_or(Error::IpcCorrupt)?;
            let errno = i32::from_le_bytes([frame[1], frame[2], frame[3], frame[4]]);
            let err = std::io::Error::from_raw_os_error(errno);
            return Err(match tag {
                IpcTag::ExecFailed => Error::ExecFailed(err),
                IpcTag::StdioSetupFailed => Error::CouldNotPrepareStdio(err),
            });
        }
    }

    // Safety: each fd was just produced by `Socket::new_pair` above and is
    // owned exclusively by the `Socket` we take it from here.
    Ok(Child {
        pid,
        reaped_status: None,
        stdin: unsafe { crate::stream::from_owned_fd(stdin_parent.into_raw_fd(), AddrFamily::Local)? },
        stdout: unsafe { crate::stream::from_owned_fd(stdout_parent.into_raw_fd(), AddrFamily::Local)? },
        stderr: unsafe { crate::stream::from_owned_fd(stderr_parent.into_raw_fd(), AddrFamily::Local)? },
    })
}

/// If the child reported a setup/exec failure, it's about to `_exit`; reap
/// it synchronously so it doesn't linger as a zombie. This is the one
/// blocking wait in the module, bounded by the child already being past
/// the failure point.
fn reap_blocking_if_failed(pid: libc::pid_t, outcome: &Option<[u8; 5]>) {
    if outcome.is_some() {
        let mut status = 0;
        loop {
            let r = unsafe { libc::waitpid(pid, &mut status, 0) };
            if r >= 0 || std::io::Error::last_os_error().kind() != std::io::ErrorKind::Interrupted {
                break;
            }
        }
    }
}

/// Runs entirely in the forked child. Never returns: either `execvp`
/// replaces the image, or a failure frame is sent and the process exits
/// via `_exit`, bypassing Rust's normal unwind/drop machinery (which
/// would otherwise run destructors meant for the parent's state).
unsafe fn run_child(
    stdin_fd: RawFd,
    stdout_fd: RawFd,
    stderr_fd: RawFd,
    ipc_fd: RawFd,
    argv: *const *const libc::c_char,
) -> ! {
    let setup = (|| -> std::io::Result<()> {
        dup2_checked(stdin_fd, 0)?;
        dup2_checked(stdout_fd, 1)?;
        dup2_checked(stderr_fd, 2)?;
        dup2_checked(ipc_fd, 3)?;

        let max_fd = libc::sysconf(libc::_SC_OPEN_MAX).max(4) as RawFd;
        for fd in 4..max_fd {
            libc::close(fd);
        }

        for fd in 0..=2 {
            let flags = libc::fcntl(fd, libc::F_GETFD);
            if flags >= 0 {
                libc::fcntl(fd, libc::F_SETFD, flags & !libc::FD_CLOEXEC);
            }
            let flags = libc::fcntl(fd, libc::F_GETFL);
            if flags >= 0 {
                libc::fcntl(fd, libc::F_SETFL, flags & !libc::O_NONBLOCK);
            }
        }

        Ok(())
    })();

    if let Err(e) = setup {
        send_failure_frame(3, IpcTag::StdioSetupFailed, e.raw_os_error().unwrap_or(0));
        libc::_exit(127);
    }

    libc::execvp(*argv, argv);
    let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
    send_failure_frame(3, IpcTag::ExecFailed, errno);
    libc::_exit(127);
}

unsafe fn dup2_checked(from: RawFd, to: RawFd) -> std::io::Result<()> {
    loop {
        let r = libc::dup2(from, to);
        if r >= 0 {
            return Ok(());
        }
        let err = std::io::Error::last_os_error();
        if err.kind() != std::io::ErrorKind::Interrupted {
            return Err(err);
        }
    }
}

unsafe fn send_failure_frame(fd: RawFd, tag: IpcTag, errno: i32) {
    let mut frame = [0u8; 5];
    frame[0] = tag as u8;
    frame[1..].copy_from_slice(&errno.to_le_bytes());
    let mut written = 0;
    while written < frame.len() {
        let n = libc::write(
            fd,
            frame[written..].as_ptr() as *const libc::c_void,
            frame.len() - written,
        );
        if n < 0 {
            break;
        }
        written += n as usize;
    }
}

impl Child {
    pub fn pid(&self) -> libc::pid_t {
        self.pid
    }

    /// Sends `signal` (default caller should pass `libc::SIGTERM`); a
    /// no-op once the child has been reaped.
    pub fn kill(&self, signal: libc::c_int) -> Result<()> {
        if self.reaped_status.is_some() {
            return Ok(());
        }
        if unsafe { libc::kill(self.pid, signal) } == -1 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                return Err(Error::Io(err));
            }
        }
        Ok(())
    }

    /// Non-blockingly reaps the child. `Some(n)` for `n >= 0` is a normal
    /// exit status; `Some(n)` for `n < 0` is `-signal`; `None` means
    /// still running.
    pub fn wait(&mut self) -> Result<Option<i32>> {
        if let Some(status) = self.reaped_status {
            return Ok(Some(status));
        }
        let mut raw = 0;
        let r = unsafe { libc::waitpid(self.pid, &mut raw, libc::WNOHANG) };
        if r == 0 {
            return Ok(None);
        }
        if r < 0 {
            return Err(Error::Io(std::io::Error::last_os_error()));
        }
        let status = decode_status(raw);
        self.reaped_status = Some(status);
        Ok(Some(status))
    }

    /// Closes all stdio streams, force-kills the child, and blocks (with
    /// `EINTR` retry) until it is reaped. Idempotent.
    pub fn close(&mut self) {
        self.stdin.close();
        self.stdout.close();
        self.stderr.close();
        if self.reaped_status.is_some() {
            return;
        }
        unsafe {
            libc::kill(self.pid, libc::SIGKILL);
        }
        let mut raw = 0;
        loop {
            let r = unsafe { libc::waitpid(self.pid, &mut raw, 0) };
            if r >= 0 {
                self.reaped_status = Some(decode_status(raw));
                return;
            }
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::ECHILD) {
                self.reaped_status = Some(0);
                return;
            }
            if err.kind() != std::io::ErrorKind::Interrupted {
                return;
            }
        }
    }
}

fn decode_status(raw: libc::c_int) -> i32 {
    if libc::WIFEXITED(raw) {
        libc::WEXITSTATUS(raw)
    } else if libc::WIFSIGNALED(raw) {
        -libc::WTERMSIG(raw)
    } else {
        0
    }
}

impl Drop for Child {
    fn drop(&mut self) {
        if self.reaped_status.is_none() {
            self.close();
        }
    }
}
