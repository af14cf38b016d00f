//! The minimal concrete scheduler that drives `stream`/`pg` suspension
//! points on one OS thread.
//!
//! Grounded in `src/evloop/mod.rs`'s blocking `run_once` shape and
//! `src/waker.rs`'s eventfd-backed wake primitive, generalized from "wake a
//! `mio`-style `Poll`" to "wake a parked `Future`".

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::io;
use std::os::unix::io::RawFd;
use std::pin::Pin;
use std::rc::Rc;
use std::sync::Arc;
use std::task::{Context, Poll, Wake};

use crate::eventq::{EventQ, Persistence};

struct WakerInner {
    ready: Cell<bool>,
    task: RefCell<Option<std::task::Waker>>,
}

/// The waking half of a cooperative sleeper/waker pair.
#[derive(Clone)]
pub struct Waker {
    inner: Rc<WakerInner>,
}

impl Waker {
    /// Marks the paired `Sleeper` ready and wakes whatever task last polled
    /// it, if any.
    pub fn wake(&self) {
        self.inner.ready.set(true);
        if let Some(task) = self.inner.task.borrow_mut().take() {
            task.wake();
        }
    }
}

/// The parking half of a cooperative sleeper/waker pair; resolves once its
/// paired `Waker::wake` has been called. `Clone`able so a single pair
/// minted once (e.g. by `pg::DbConn` at connect time) can be re-awaited
/// across many suspend points instead of minting a fresh pair each time.
#[derive(Clone)]
pub struct Sleeper {
    inner: Rc<WakerInner>,
}

impl Future for Sleeper {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.inner.ready.replace(false) {
            Poll::Ready(())
        } else {
            *self.inner.task.borrow_mut() = Some(cx.waker().clone());
            Poll::Pending
        }
    }
}

struct NoopWake;

impl Wake for NoopWake {
    fn wake(self: Arc<Self>) {}
    fn wake_by_ref(self: &Arc<Self>) {}
}

/// The single-threaded cooperative executor/reactor. Owns one `EventQ`
/// keyed by `reactor::Waker` tokens; `readable`/`writable` futures register
/// a fresh pair on first poll and resolve when `EventQ::wait` fires it.
pub struct Reactor {
    queue: RefCell<EventQ<Waker>>,
}

impl Reactor {
    pub fn new() -> io::Result<Reactor> {
        Reactor::with_capacity(64)
    }

    pub fn with_capacity(capacity: usize) -> io::Result<Reactor> {
        Ok(Reactor {
            queue: RefCell::new(EventQ::with_capacity(capacity)?),
        })
    }

    /// Convenience constructor reading `event_capacity` off a shared
    /// [`crate::config::Config`].
    pub fn with_config(config: &crate::config::Config) -> io::Result<Reactor> {
        Reactor::with_capacity(config.event_capacity)
    }

    /// A fresh sleeper/waker pair for a non-fd suspension condition (used by
    /// `pg::DbConn`'s dual-stream coordination).
    pub fn notify(&self) -> (Sleeper, Waker) {
        let inner = Rc::new(WakerInner {
            ready: Cell::new(false),
            task: RefCell::new(None),
        });
        (Sleeper { inner: inner.clone() }, Waker { inner })
    }

    /// A one-shot variant: semantically identical to `notify`, but intended
    /// for single-use join points (e.g. the first caller into a deferred
    /// result FIFO) where the caller will not park on it a second time.
    pub fn sync(&self) -> (Sleeper, Waker) {
        self.notify()
    }

    pub async fn readable(&self, fd: RawFd) -> io::Result<()> {
        let (sleeper, waker) = self.notify();
        self.queue.borrow_mut().register_fd_read(fd, waker, Persistence::OneShot)?;
        sleeper.await;
        Ok(())
    }

    pub async fn writable(&self, fd: RawFd) -> io::Result<()> {
        let (sleeper, waker) = self.notify();
        self.queue.borrow_mut().register_fd_write(fd, waker, Persistence::OneShot)?;
        sleeper.await;
        Ok(())
    }

    pub fn deregister_fd(&self, fd: RawFd) -> io::Result<()> {
        self.queue.borrow_mut().deregister_fd(fd)
    }

    /// Drains one batch of kernel events, waking whatever futures were
    /// registered for them. Blocks if nothing is ready yet.
    fn drive_once(&self) -> io::Result<()> {
        let mut queue = self.queue.borrow_mut();
        queue.wait(Some(&mut |w: &Waker| w.wake()))?;
        Ok(())
    }

    /// Runs `fut` to completion on this thread, parking in `EventQ::wait`
    /// between polls instead of busy-spinning.
    pub fn block_on<F: Future>(&self, fut: F) -> F::Output {
        let waker = std::task::Waker::from(Arc::new(NoopWake));
        let mut cx = Context::from_waker(&waker);
        let mut fut = std::pin::pin!(fut);

        loop {
            match fut.as_mut().poll(&mut cx) {
                Poll::Ready(v) => return v,
                Poll::Pending => {
                    self.drive_once().expect("reactor I/O error");
                }
            }
        }
    }
}

/// Either of two futures, whichever resolves first. Hand-rolled instead of
/// depending on `futures`/`futures-lite`, matching this crate's otherwise
/// syscall-level dependency footprint.
pub enum Either<A, B> {
    Left(A),
    Right(B),
}

pub async fn select2<A, B>(a: A, b: B) -> Either<A::Output, B::Output>
where
    A: Future,
    B: Future,
{
    let mut a = std::pin::pin!(a);
    let mut b = std::pin::pin!(b);
    std::future::poll_fn(move |cx| {
        if let Poll::Ready(v) = a.as_mut().poll(cx) {
            return Poll::Ready(Either::Left(v));
        }
        if let Poll::Ready(v) = b.as_mut().poll(cx) {
            return Poll::Ready(Either::Right(v));
        }
        Poll::Pending
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notify_wakes_parked_sleeper() {
        let reactor = Reactor::new().unwrap();
        let (sleeper, waker) = reactor.notify();
        waker.wake();
        reactor.block_on(sleeper);
    }
}
