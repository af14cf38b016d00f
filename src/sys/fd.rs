use std::io::{self, Read, Write, Seek, SeekFrom, IoSlice, IoSliceMut};
use std::fs::File;
use std::os::unix::io::{FromRawFd, AsRawFd, IntoRawFd, RawFd};
use std::os::unix::fs::FileExt;

use super::cvt;

/// An owning wrapper around a raw fd, closed on drop.
///
/// Backed by `std::fs::File` so file-only operations (`Seek`, `FileExt`)
/// come for free; socket-only operations (vectored I/O, cloexec toggling)
/// are implemented directly against the raw fd since `File` doesn't expose
/// them.
#[derive(Debug)]
pub struct FileDesc(File);

impl FileDesc {
    pub fn new(fd: RawFd) -> Self {
        unsafe { FileDesc(File::from_raw_fd(fd)) }
    }

    pub fn raw(&self) -> RawFd {
        self.0.as_raw_fd()
    }

    pub fn into_raw(self) -> RawFd {
        self.0.into_raw_fd()
    }

    pub fn try_clone(&self) -> io::Result<FileDesc> {
        Ok(FileDesc(self.0.try_clone()?))
    }

    pub fn duplicate(&self) -> io::Result<FileDesc> {
        self.try_clone()
    }

    pub fn set_cloexec(&self) -> io::Result<()> {
        unsafe {
            let prev = cvt(libc::fcntl(self.raw(), libc::F_GETFD))?;
            cvt(libc::fcntl(self.raw(), libc::F_SETFD, prev | libc::FD_CLOEXEC))?;
        }
        Ok(())
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> io::Result<()> {
        unsafe {
            let prev = cvt(libc::fcntl(self.raw(), libc::F_GETFL))?;
            let next = if nonblocking {
                prev | libc::O_NONBLOCK
            } else {
                prev & !libc::O_NONBLOCK
            };
            cvt(libc::fcntl(self.raw(), libc::F_SETFL, next))?;
        }
        Ok(())
    }

    pub fn read_vectored(&self, bufs: &mut [IoSliceMut<'_>]) -> io::Result<usize> {
        let n = syscall!(readv(
            self.raw(),
            bufs.as_ptr() as *const libc::iovec,
            std::cmp::min(bufs.len(), libc::c_int::MAX as usize) as libc::c_int
        ))?;
        Ok(n as usize)
    }

    pub fn write_vectored(&self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        let n = syscall!(writev(
            self.raw(),
            bufs.as_ptr() as *const libc::iovec,
            std::cmp::min(bufs.len(), libc::c_int::MAX as usize) as libc::c_int
        ))?;
        Ok(n as usize)
    }
}

impl FromRawFd for FileDesc {
    unsafe fn from_raw_fd(fd: RawFd) -> Self {
        FileDesc(File::from_raw_fd(fd))
    }
}

impl AsRawFd for FileDesc {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_raw_fd()
    }
}

impl IntoRawFd for FileDesc {
    fn into_raw_fd(self) -> RawFd {
        self.0.into_raw_fd()
    }
}

impl Read for FileDesc {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.0.read(buf)
    }
}

impl Read for &FileDesc {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        (&self.0).read(buf)
    }
}

impl Write for FileDesc {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Write for &FileDesc {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        (&self.0).write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Seek for FileDesc {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.0.seek(pos)
    }
}

impl Seek for &FileDesc {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        (&self.0).seek(pos)
    }
}

impl FileExt for FileDesc {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        self.0.read_at(buf, offset)
    }
    fn write_at(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        self.0.write_at(buf, offset)
    }
}
