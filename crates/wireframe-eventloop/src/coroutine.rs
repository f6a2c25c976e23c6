use std::cell::RefCell;
use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::time::Duration;

use tokio::task::LocalSet;

use wireframe_core::error::CoreError;
use wireframe_core::ids::{WatcherId, WatcherIdAllocator};

use crate::poll_backend::{PollEventLoop, PollFlavor};
use crate::timer::TimerCallback;
use crate::watcher::{IoCallback, SignalCallback};
use crate::{ErrorHandler, EventLoop};

/// Tracks whether a spawned coroutine should keep the loop alive on its
/// own (referenced, the default) or merely ride along while something
/// else keeps the loop running (unreferenced) — the same distinction
/// `unref()` timers/handles expose in event-driven runtimes so a
/// best-effort background task never blocks shutdown.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reference {
    Referenced,
    Unreferenced,
}

/// A coroutine-flavored event loop: fiber-style `async fn` handlers are
/// spawned onto a single-threaded [`LocalSet`] so they can `.await` a
/// [`crate::suspension::Suspension`] mid-handler instead of being driven
/// purely by readiness callbacks. I/O readiness, timers, and signals are
/// still delegated to an inner [`PollEventLoop`]; this type only adds the
/// local task scheduler and reference counting on top.
pub struct CoroutineEventLoop {
    inner: PollEventLoop,
    local: LocalSet,
    rt: tokio::runtime::Runtime,
    referenced: Rc<RefCell<HashMap<WatcherId, Reference>>>,
    ids: WatcherIdAllocator,
}

impl CoroutineEventLoop {
    pub fn new() -> std::io::Result<Self> {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()?;
        Ok(Self {
            inner: PollEventLoop::new(PollFlavor::Select)?,
            local: LocalSet::new(),
            rt,
            referenced: Rc::new(RefCell::new(HashMap::new())),
            ids: WatcherIdAllocator::new(),
        })
    }

    /// Spawns a coroutine-style handler onto the local task set. Returns a
    /// [`WatcherId`] the caller can use with [`CoroutineEventLoop::unref`]
    /// to let the loop exit without waiting on it. The id is dropped from
    /// the liveness bookkeeping as soon as the future completes, so a
    /// finished coroutine never keeps [`EventLoop::run`] spinning.
    pub fn spawn<F>(&mut self, future: F) -> WatcherId
    where
        F: std::future::Future<Output = ()> + 'static,
    {
        let id = self.ids.next();
        self.referenced.borrow_mut().insert(id, Reference::Referenced);
        let referenced = self.referenced.clone();
        self.local.spawn_local(async move {
            future.await;
            referenced.borrow_mut().remove(&id);
        });
        id
    }

    /// Marks a spawned coroutine as unreferenced: its continued execution
    /// no longer counts toward [`EventLoop::run`]'s liveness check. A no-op
    /// if the coroutine already finished.
    pub fn unref(&mut self, id: WatcherId) {
        if let Some(slot) = self.referenced.borrow_mut().get_mut(&id) {
            *slot = Reference::Unreferenced;
        }
    }

    fn has_referenced_work(&self) -> bool {
        self.referenced
            .borrow()
            .values()
            .any(|r| *r == Reference::Referenced)
    }
}

impl EventLoop for CoroutineEventLoop {
    fn run(&mut self) {
        // Interleave one local-task tick with one inner poll/timer tick per
        // iteration of the same loop so a coroutine that `.await`s a
        // `Suspension` actually gets woken once whatever resumes it (an fd
        // callback or timer firing on `self.inner`) runs, instead of the
        // local tasks only ever getting a single tick before control is
        // handed to the inner loop for good.
        self.inner.reset_stop();
        while !self.inner.stop_requested()
            && (self.inner.has_live_work() || self.has_referenced_work())
        {
            self.inner.tick();
            let local = &self.local;
            self.rt
                .block_on(local.run_until(async { tokio::task::yield_now().await }));
        }
    }

    fn stop(&mut self) {
        self.inner.stop();
    }

    fn delay(&mut self, after: Duration, cb: TimerCallback) -> WatcherId {
        self.inner.delay(after, cb)
    }

    fn repeat(&mut self, interval: Duration, cb: TimerCallback) -> WatcherId {
        self.inner.repeat(interval, cb)
    }

    fn cancel_timer(&mut self, id: WatcherId) {
        self.inner.cancel_timer(id)
    }

    fn on_readable(&mut self, fd: RawFd, cb: IoCallback) -> WatcherId {
        self.inner.on_readable(fd, cb)
    }

    fn on_writable(&mut self, fd: RawFd, cb: IoCallback) -> WatcherId {
        self.inner.on_writable(fd, cb)
    }

    fn off_readable(&mut self, fd: RawFd) {
        self.inner.off_readable(fd)
    }

    fn off_writable(&mut self, fd: RawFd) {
        self.inner.off_writable(fd)
    }

    fn on_signal(&mut self, signum: i32, cb: SignalCallback) -> WatcherId {
        self.inner.on_signal(signum, cb)
    }

    fn off_signal(&mut self, signum: i32) {
        self.inner.off_signal(signum)
    }

    fn set_error_handler(&mut self, handler: ErrorHandler) {
        self.inner.set_error_handler(handler)
    }

    fn timer_count(&self) -> usize {
        self.inner.timer_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn spawned_coroutine_can_be_unreferenced() {
        let mut lp = CoroutineEventLoop::new().unwrap();
        let ran = Rc::new(RefCell::new(false));
        let ran2 = ran.clone();
        let id = lp.spawn(async move {
            *ran2.borrow_mut() = true;
        });
        lp.unref(id);
        assert!(!lp.has_referenced_work());
    }

    #[test]
    fn spawn_defaults_to_referenced() {
        let mut lp = CoroutineEventLoop::new().unwrap();
        let id = lp.spawn(async {});
        assert!(lp.has_referenced_work());
        lp.unref(id);
        assert!(!lp.has_referenced_work());
    }
}
