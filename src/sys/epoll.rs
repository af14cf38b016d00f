use std::cmp;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use libc::{self, c_int};
use libc::{EPOLLERR, EPOLLET, EPOLLHUP, EPOLLIN, EPOLLONESHOT, EPOLLOUT, EPOLLPRI, EPOLLRDHUP};

/// Opaque slot handed back on delivery; carries no meaning of its own, just
/// the `u64` epoll stores alongside a registration.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Token(pub u64);

macro_rules! bitset {
    ($name:ident { $($flag:ident = $val:expr),* $(,)* }) => {
        #[derive(Copy, Clone, Debug, PartialEq, Eq)]
        pub struct $name(u8);

        impl $name {
            $(pub const $flag: $name = $name($val);)*

            pub fn empty() -> $name {
                $name(0)
            }

            pub fn contains(self, other: $name) -> bool {
                (self.0 & other.0) == other.0
            }
        }

        impl std::ops::BitOr for $name {
            type Output = $name;
            fn bitor(self, other: $name) -> $name {
                $name(self.0 | other.0)
            }
        }

        impl std::ops::BitOrAssign for $name {
            fn bitor_assign(&mut self, other: $name) {
                self.0 |= other.0;
            }
        }
    };
}

bitset!(Ready {
    READABLE = 0b0001,
    WRITABLE = 0b0010,
    ERROR    = 0b0100,
    HUP      = 0b1000,
});

bitset!(EpollOpt {
    EDGE    = 0b001,
    ONESHOT = 0b010,
    LEVEL   = 0b100,
});

#[derive(Copy, Clone, Debug)]
pub struct Event {
    kind: Ready,
    token: Token,
}

impl Event {
    pub fn token(&self) -> Token {
        self.token
    }

    pub fn readiness(&self) -> Ready {
        self.kind
    }
}

pub struct Epoll {
    epfd: RawFd,
}

impl Epoll {
    pub fn new() -> io::Result<Epoll> {
        let epfd = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;
        Ok(Epoll { epfd })
    }

    pub fn wait(&self, evts: &mut Events, timeout: Option<Duration>) -> io::Result<usize> {
        let timeout_ms = timeout
            .map(|to| cmp::min(to.as_millis(), libc::c_int::MAX as u128) as libc::c_int)
            .unwrap_or(-1);

        let cnt = syscall!(epoll_wait(
            self.epfd,
            evts.events.as_mut_ptr(),
            evts.events.capacity() as i32,
            timeout_ms
        ))?;

        unsafe { evts.events.set_len(cnt as usize) };
        Ok(cnt as usize)
    }

    pub fn add(&self, fd: RawFd, token: Token, interests: Ready, opts: EpollOpt) -> io::Result<()> {
        let mut info = libc::epoll_event {
            events: ioevent_to_epoll(interests, opts),
            u64: token.0,
        };
        syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_ADD, fd, &mut info))?;
        Ok(())
    }

    pub fn modify(&self, fd: RawFd, token: Token, interests: Ready, opts: EpollOpt) -> io::Result<()> {
        let mut info = libc::epoll_event {
            events: ioevent_to_epoll(interests, opts),
            u64: token.0,
        };
        syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_MOD, fd, &mut info))?;
        Ok(())
    }

    pub fn delete(&self, fd: RawFd) -> io::Result<()> {
        let mut info = libc::epoll_event { events: 0, u64: 0 };
        match syscall!(epoll_ctl(self.epfd, libc::EPOLL_CTL_DEL, fd, &mut info)) {
            Ok(_) => Ok(()),
            Err(ref e) if e.raw_os_error() == Some(libc::ENOENT) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Releases the epoll fd immediately rather than waiting for `Drop`.
    /// Idempotent: a second call is a no-op.
    pub fn close(&mut self) {
        if self.epfd != -1 {
            unsafe {
                libc::close(self.epfd);
            }
            self.epfd = -1;
        }
    }
}

fn ioevent_to_epoll(interest: Ready, opts: EpollOpt) -> u32 {
    let mut kind = 0;

    if interest.contains(Ready::READABLE) {
        kind |= EPOLLIN;
    }
    if interest.contains(Ready::WRITABLE) {
        kind |= EPOLLOUT;
    }
    if interest.contains(Ready::HUP) {
        kind |= EPOLLRDHUP;
    }
    if opts.contains(EpollOpt::EDGE) {
        kind |= EPOLLET;
    }
    if opts.contains(EpollOpt::ONESHOT) {
        kind |= EPOLLONESHOT;
    }
    if opts.contains(EpollOpt::LEVEL) {
        kind &= !EPOLLET;
    }

    kind as u32
}

impl AsRawFd for Epoll {
    fn as_raw_fd(&self) -> RawFd {
        self.epfd
    }
}

impl Drop for Epoll {
    fn drop(&mut self) {
        self.close();
    }
}

pub struct Events {
    events: Vec<libc::epoll_event>,
}

impl Events {
    pub fn with_capacity(cap: usize) -> Events {
        Events {
            events: Vec::with_capacity(cap),
        }
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn get(&self, idx: usize) -> Option<Event> {
        self.events.get(idx).map(|event| {
            let epoll = event.events as c_int;
            let mut kind = Ready::empty();

            if (epoll & EPOLLIN) != 0 || (epoll & EPOLLPRI) != 0 {
                kind |= Ready::READABLE;
            }
            if (epoll & EPOLLOUT) != 0 {
                kind |= Ready::WRITABLE;
            }
            if (epoll & EPOLLERR) != 0 {
                kind |= Ready::ERROR;
            }
            if (epoll & EPOLLRDHUP) != 0 || (epoll & EPOLLHUP) != 0 {
                kind |= Ready::HUP;
            }

            Event {
                kind,
                token: Token(event.u64),
            }
        })
    }
}
