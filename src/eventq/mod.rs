//! The event-source registry: a single kernel queue multiplexing per-fd
//! readiness, signals, child-process exits, and one-shot timers, each
//! carrying a user-supplied opaque callback token.
//!
//! Built on Linux `epoll` plus `signalfd` and `timerfd` sources rather than
//! a single kqueue descriptor; see `SPEC_FULL.md` §9 REDESIGN FLAGS.

use std::collections::HashMap;
use std::io;
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use log::{debug, trace, warn};

use crate::sys::epoll::{Epoll, EpollOpt, Events, Ready, Token};
use crate::sys::signalfd::SignalFd;
use crate::sys::timerfd::{SetTimeFlags, TimerFd, TimerSpec};

/// Whether a registration is removed automatically after its first
/// delivery.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Persistence {
    Persistent,
    OneShot,
}

/// A stable identity for a timer, distinct from any fd/signal/pid, unique
/// for the lifetime of the owning `EventQ`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

struct FdEntry<T> {
    read: Option<(T, Persistence)>,
    write: Option<(T, Persistence)>,
}

impl<T> FdEntry<T> {
    fn empty() -> Self {
        FdEntry { read: None, write: None }
    }

    fn interest(&self) -> Ready {
        let mut r = Ready::empty();
        if self.read.is_some() {
            r |= Ready::READABLE;
        }
        if self.write.is_some() {
            r |= Ready::WRITABLE;
        }
        r
    }

    fn is_empty(&self) -> bool {
        self.read.is_none() && self.write.is_none()
    }
}

struct TimerEntry<T> {
    timerfd: TimerFd,
    token: T,
}

/// A single-owner event demultiplexer.
///
/// `T` is the opaque callback token type; it must be cheaply `Clone`-able
/// (typical instantiations are `usize` or `std::task::Waker`) since
/// persistent registrations hand a fresh reference to every delivery
/// without giving up ownership.
pub struct EventQ<T> {
    epoll: Epoll,
    events: Events,
    fds: HashMap<RawFd, FdEntry<T>>,
    timers: HashMap<TimerId, TimerEntry<T>>,
    next_timer_id: u64,
    signalfd: Option<SignalFd>,
    signals: HashMap<libc::c_int, T>,
    pids: HashMap<libc::pid_t, T>,
    closed: bool,
}

impl<T: Clone> EventQ<T> {
    pub fn new() -> io::Result<EventQ<T>> {
        EventQ::with_capacity(64)
    }

    /// Convenience constructor reading `event_capacity` off a shared
    /// [`crate::config::Config`].
    pub fn with_config(config: &crate::config::Config) -> io::Result<EventQ<T>> {
        EventQ::with_capacity(config.event_capacity)
    }

    pub fn with_capacity(capacity: usize) -> io::Result<EventQ<T>> {
        Ok(EventQ {
            epoll: Epoll::new()?,
            events: Events::with_capacity(capacity),
            fds: HashMap::new(),
            timers: HashMap::new(),
            next_timer_id: 0,
            signalfd: None,
            signals: HashMap::new(),
            pids: HashMap::new(),
            closed: false,
        })
    }

    fn check_open(&self) -> io::Result<()> {
        if self.closed {
            Err(io::Error::new(io::ErrorKind::Other, "event queue is closed"))
        } else {
            Ok(())
        }
    }

    fn opts_for(persistence: Persistence) -> EpollOpt {
        match persistence {
            Persistence::OneShot => EpollOpt::LEVEL | EpollOpt::ONESHOT,
            Persistence::Persistent => EpollOpt::LEVEL,
        }
    }

    fn sync_fd_registration(&mut self, fd: RawFd, existed_before: bool) -> io::Result<()> {
        let entry = self.fds.get(&fd).expect("fd entry must exist");
        let interest = entry.interest();
        let is_empty = entry.is_empty();

        // combine persistence conservatively: oneshot only if every armed
        // interest on this fd is oneshot, matching epoll's per-fd EPOLLONESHOT.
        let persistence = match (&entry.read, &entry.write) {
            (Some((_, p)), Some((_, q))) if *p == Persistence::OneShot && *q == Persistence::OneShot => {
                Persistence::OneShot
            }
            (Some((_, p)), None) => *p,
            (None, Some((_, q))) => *q,
            _ => Persistence::Persistent,
        };

        if is_empty {
            self.fds.remove(&fd);
            return self.epoll.delete(fd);
        }

        let opts = Self::opts_for(persistence);

        if existed_before {
            self.epoll.modify(fd, Token(fd as u64), interest, opts)
        } else {
            self.epoll.add(fd, Token(fd as u64), interest, opts)
        }
    }

    pub fn register_fd_read(&mut self, fd: RawFd, token: T, persistence: Persistence) -> io::Result<()> {
        self.check_open()?;
        let existed = self.fds.contains_key(&fd);
        let entry = self.fds.entry(fd).or_insert_with(FdEntry::empty);
        entry.read = Some((token, persistence));
        self.sync_fd_registration(fd, existed)
    }

    pub fn register_fd_write(&mut self, fd: RawFd, token: T, persistence: Persistence) -> io::Result<()> {
        self.check_open()?;
        let existed = self.fds.contains_key(&fd);
        let entry = self.fds.entry(fd).or_insert_with(FdEntry::empty);
        entry.write = Some((token, persistence));
        self.sync_fd_registration(fd, existed)
    }

    pub fn unregister_fd_read(&mut self, fd: RawFd) -> io::Result<()> {
        self.check_open()?;
        if let Some(entry) = self.fds.get_mut(&fd) {
            entry.read = None;
            return self.sync_fd_registration(fd, true);
        }
        Ok(())
    }

    pub fn unregister_fd_write(&mut self, fd: RawFd) -> io::Result<()> {
        self.check_open()?;
        if let Some(entry) = self.fds.get_mut(&fd) {
            entry.write = None;
            return self.sync_fd_registration(fd, true);
        }
        Ok(())
    }

    /// Removes both filters for `fd` in one call, tolerating either (or
    /// both) being absent already.
    pub fn deregister_fd(&mut self, fd: RawFd) -> io::Result<()> {
        self.check_open()?;
        if self.fds.remove(&fd).is_some() {
            self.epoll.delete(fd)?;
        }
        Ok(())
    }

    fn ensure_signalfd(&mut self) -> io::Result<()> {
        if self.signalfd.is_none() {
            let sfd = SignalFd::new(&[])?;
            self.epoll
                .add(sfd.as_raw_fd(), Token(sfd.as_raw_fd() as u64), Ready::READABLE, EpollOpt::LEVEL)?;
            self.signalfd = Some(sfd);
        }
        Ok(())
    }

    fn resync_signal_mask(&mut self) -> io::Result<()> {
        self.ensure_signalfd()?;
        let mut wanted: Vec<libc::c_int> = self.signals.keys().copied().collect();
        if !self.pids.is_empty() {
            wanted.push(libc::SIGCHLD);
        }
        crate::sys::signalfd::SignalFd::block(&wanted)?;
        self.signalfd.as_mut().unwrap().set_mask(&wanted)
    }

    /// Arms `sig`; also sets its disposition so asynchronous delivery
    /// cannot kill the process (blocked in the process mask for
    /// `signalfd`, mirroring the original's `SIG_IGN`-before-`EV_ADD`).
    pub fn register_signal(&mut self, sig: libc::c_int, token: T) -> io::Result<()> {
        self.check_open()?;
        self.signals.insert(sig, token);
        self.resync_signal_mask()
    }

    pub fn unregister_signal(&mut self, sig: libc::c_int) -> io::Result<()> {
        self.check_open()?;
        self.signals.remove(&sig);
        self.resync_signal_mask()
    }

    /// Always one-shot: fires once when `pid` exits, then auto-removes.
    pub fn register_pid(&mut self, pid: libc::pid_t, token: T) -> io::Result<()> {
        self.check_open()?;
        self.pids.insert(pid, token);
        self.resync_signal_mask()
    }

    /// Removes both the registry entry and the kernel-level registration
    /// consistently (the original has a documented filter-mismatch bug
    /// here; we do not reproduce it — see `DESIGN.md`).
    pub fn unregister_pid(&mut self, pid: libc::pid_t) -> io::Result<()> {
        self.check_open()?;
        self.pids.remove(&pid);
        self.resync_signal_mask()
    }

    /// Arms a one-shot relative timer with nanosecond resolution.
    pub fn add_timer(&mut self, delay: Duration, token: T) -> io::Result<TimerId> {
        self.check_open()?;
        let timerfd = TimerFd::new()?;
        timerfd.settime(
            TimerSpec { interval: Duration::ZERO, value: if delay.is_zero() { Duration::from_nanos(1) } else { delay } },
            SetTimeFlags::Default,
        )?;

        let fd = timerfd.as_raw_fd();
        self.epoll
            .add(fd, Token(fd as u64), Ready::READABLE, EpollOpt::LEVEL | EpollOpt::ONESHOT)?;

        let id = TimerId(self.next_timer_id);
        self.next_timer_id += 1;
        self.timers.insert(id, TimerEntry { timerfd, token });
        Ok(id)
    }

    pub fn remove_timer(&mut self, id: TimerId) -> io::Result<()> {
        self.check_open()?;
        if let Some(entry) = self.timers.remove(&id) {
            self.epoll.delete(entry.timerfd.as_raw_fd())?;
        }
        Ok(())
    }

    fn fd_for_timer(&self, id: TimerId) -> Option<RawFd> {
        self.timers.get(&id).map(|e| e.timerfd.as_raw_fd())
    }

    fn drain_signalfd(&mut self, fired: &mut Vec<T>) {
        loop {
            let signo = match self.signalfd.as_ref().unwrap().read() {
                Ok(signo) => signo,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!("signalfd read failed: {}", e);
                    break;
                }
            };

            if signo == libc::SIGCHLD {
                let pids: Vec<libc::pid_t> = self.pids.keys().copied().collect();
                for pid in pids {
                    let mut status = 0;
                    let res = unsafe { libc::waitpid(pid, &mut status, libc::WNOHANG) };
                    if res == pid {
                        if let Some(token) = self.pids.remove(&pid) {
                            trace!("pid {} reaped via signalfd/SIGCHLD", pid);
                            fired.push(token);
                        }
                    }
                }
            }

            if let Some(token) = self.signals.get(&signo) {
                fired.push(token.clone());
            }
        }
    }

    /// Blocks until at least one event is ready, invoking `callback` (if
    /// given) once per delivered token in kernel-reported order. One-shot
    /// registrations are removed from the registry before their callback
    /// runs. Returns the number of tokens delivered.
    pub fn wait(&mut self, mut callback: Option<&mut dyn FnMut(&T)>) -> io::Result<usize> {
        self.check_open()?;
        self.wait_impl(None, &mut callback)
    }

    /// Like `wait`, but returns immediately (zero timeout); an interrupted
    /// syscall is treated as "no events" rather than retried.
    pub fn poll(&mut self, mut callback: Option<&mut dyn FnMut(&T)>) -> io::Result<usize> {
        self.check_open()?;
        match self.epoll.wait(&mut self.events, Some(Duration::ZERO)) {
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => return Ok(0),
            Err(e) => return Err(e),
            Ok(_) => {}
        }
        self.dispatch(&mut callback)
    }

    fn wait_impl(&mut self, timeout: Option<Duration>, callback: &mut Option<&mut dyn FnMut(&T)>) -> io::Result<usize> {
        loop {
            match self.epoll.wait(&mut self.events, timeout) {
                Ok(_) => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        self.dispatch(callback)
    }

    fn dispatch(&mut self, callback: &mut Option<&mut dyn FnMut(&T)>) -> io::Result<usize> {
        // Snapshot the raw deliveries before touching the registry or
        // invoking any callback: a callback may itself register/unregister
        // sources, which must not perturb events already decided for this
        // batch (reentrancy safety, per SPEC_FULL.md §4.1).
        let snapshot: Vec<(RawFd, Ready)> = (0..self.events.len())
            .filter_map(|i| self.events.get(i))
            .map(|e| (e.token().0 as RawFd, e.readiness()))
            .collect();

        let mut fired: Vec<T> = Vec::new();

        for (fd, ready) in snapshot {
            if Some(fd) == self.signalfd.as_ref().map(|s| s.as_raw_fd()) {
                self.drain_signalfd(&mut fired);
                continue;
            }

            if self.timers.values().any(|e| e.timerfd.as_raw_fd() == fd) {
                let id = self
                    .timers
                    .iter()
                    .find(|(_, e)| e.timerfd.as_raw_fd() == fd)
                    .map(|(id, _)| *id)
                    .unwrap();
                if let Some(entry) = self.timers.remove(&id) {
                    let _ = entry.timerfd.read();
                    let _ = self.epoll.delete(fd);
                    fired.push(entry.token);
                }
                continue;
            }

            if let Some(entry) = self.fds.get_mut(&fd) {
                if ready.contains(Ready::READABLE) || ready.contains(Ready::ERROR) || ready.contains(Ready::HUP) {
                    if let Some((token, persistence)) = entry.read.clone() {
                        if persistence == Persistence::OneShot {
                            entry.read = None;
                        }
                        fired.push(token);
                    }
                }
                if ready.contains(Ready::WRITABLE) {
                    if let Some((token, persistence)) = entry.write.clone() {
                        if persistence == Persistence::OneShot {
                            entry.write = None;
                        }
                        fired.push(token);
                    }
                }
                let _ = self.sync_fd_registration(fd, true);
            }
        }

        let count = fired.len();
        if let Some(cb) = callback.as_mut() {
            for token in &fired {
                cb(token);
            }
        }
        Ok(count)
    }

    pub fn close(&mut self) {
        if !self.closed {
            debug!("closing event queue");
            self.closed = true;
            self.fds.clear();
            self.timers.clear();
            self.signals.clear();
            self.pids.clear();
            self.signalfd = None;
            self.epoll.close();
        }
    }
}

impl<T> Drop for EventQ<T> {
    fn drop(&mut self) {
        if !self.closed {
            self.closed = true;
            self.signalfd = None;
        }
        self.epoll.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_timer_zero_fires_promptly() {
        let mut q: EventQ<&'static str> = EventQ::new().unwrap();
        q.add_timer(Duration::from_secs(0), "fired").unwrap();
        let mut seen = Vec::new();
        let mut cb = |t: &&'static str| seen.push(*t);
        let n = q.wait(Some(&mut cb)).unwrap();
        assert_eq!(n, 1);
        assert_eq!(seen, vec!["fired"]);
    }

    #[test]
    fn timer_fan_out_delivers_in_deadline_order() {
        let mut q: EventQ<&'static str> = EventQ::new().unwrap();
        q.add_timer(Duration::from_millis(30), "c").unwrap();
        q.add_timer(Duration::from_millis(10), "a").unwrap();
        q.add_timer(Duration::from_millis(40), "d").unwrap();
        q.add_timer(Duration::from_millis(20), "b").unwrap();

        std::thread::sleep(Duration::from_millis(25));

        let mut seen = Vec::new();
        let mut cb = |t: &&'static str| seen.push(*t);
        q.poll(Some(&mut cb)).unwrap();
        assert_eq!(seen, vec!["a", "b"]);
    }

    #[test]
    fn poll_with_no_events_returns_zero() {
        let mut q: EventQ<()> = EventQ::new().unwrap();
        assert_eq!(q.poll(None).unwrap(), 0);
    }
}
