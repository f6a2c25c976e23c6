use std::cell::RefCell;
use std::os::unix::io::RawFd;
use std::panic::Location;
use std::rc::Rc;
use std::time::Duration;

use wireframe_core::error::{CoreError, ErrorKind};
use wireframe_core::ids::WatcherId;

use crate::timer::TimerCallback;
use crate::watcher::{IoCallback, SignalCallback};
use crate::{ErrorHandler, EventLoop};

/// Wraps any [`EventLoop`] backend and records the call-site of every
/// watcher registration, so a later `InvalidCallbackId` or dispatch error
/// can be logged with where the watcher was originally created — the
/// debug-trace mode spec.md §6 gates behind `EVENT_LOOP_DRIVER_DEBUG_TRACE`.
struct SiteEntry {
    site: &'static Location<'static>,
    /// Set once `cancel_timer` has been called for this id through this
    /// wrapper; a second cancel is what lets us tell a stale id apart from
    /// a first, legitimate one without needing the inner backend to report
    /// anything back.
    cancelled: bool,
}

pub struct TracingEventLoop<D: EventLoop> {
    inner: D,
    sites: std::collections::HashMap<WatcherId, SiteEntry>,
    error_handler: Rc<RefCell<Option<ErrorHandler>>>,
}

impl<D: EventLoop> TracingEventLoop<D> {
    pub fn new(inner: D) -> Self {
        Self {
            inner,
            sites: std::collections::HashMap::new(),
            error_handler: Rc::new(RefCell::new(None)),
        }
    }

    fn report(&mut self, err: CoreError) {
        if let Some(handler) = self.error_handler.borrow_mut().as_mut() {
            handler(err);
        } else {
            tracing::error!(code = err.code(), message = %err.message(), "uncaught error propagated to loop driver");
        }
    }

    fn record(&mut self, id: WatcherId, site: &'static Location<'static>) -> WatcherId {
        tracing::trace!(watcher = %id, file = site.file(), line = site.line(), "watcher registered");
        self.sites.insert(id, SiteEntry { site, cancelled: false });
        id
    }

    /// The call-site a still-registered, not-yet-cancelled watcher was
    /// created at, if any.
    pub fn site_of(&self, id: WatcherId) -> Option<&'static Location<'static>> {
        self.sites.get(&id).filter(|e| !e.cancelled).map(|e| e.site)
    }
}

impl<D: EventLoop> EventLoop for TracingEventLoop<D> {
    fn run(&mut self) {
        self.inner.run()
    }

    fn stop(&mut self) {
        self.inner.stop()
    }

    #[track_caller]
    fn delay(&mut self, after: Duration, cb: TimerCallback) -> WatcherId {
        let site = Location::caller();
        let id = self.inner.delay(after, cb);
        self.record(id, site)
    }

    #[track_caller]
    fn repeat(&mut self, interval: Duration, cb: TimerCallback) -> WatcherId {
        let site = Location::caller();
        let id = self.inner.repeat(interval, cb);
        self.record(id, site)
    }

    fn cancel_timer(&mut self, id: WatcherId) {
        self.inner.cancel_timer(id);
        match self.sites.get_mut(&id) {
            Some(entry) if entry.cancelled => {
                let site = entry.site;
                let err = annotate_with_site(
                    CoreError::new(
                        ErrorKind::InvalidCallbackId,
                        format!("cancel_timer called twice for watcher id {id}"),
                    ),
                    Some(site),
                );
                self.report(err);
            }
            Some(entry) => entry.cancelled = true,
            None => {
                let err = CoreError::new(
                    ErrorKind::InvalidCallbackId,
                    format!("cancel_timer called with unknown watcher id {id}"),
                );
                self.report(err);
            }
        }
    }

    #[track_caller]
    fn on_readable(&mut self, fd: RawFd, cb: IoCallback) -> WatcherId {
        let site = Location::caller();
        let id = self.inner.on_readable(fd, cb);
        self.record(id, site)
    }

    #[track_caller]
    fn on_writable(&mut self, fd: RawFd, cb: IoCallback) -> WatcherId {
        let site = Location::caller();
        let id = self.inner.on_writable(fd, cb);
        self.record(id, site)
    }

    fn off_readable(&mut self, fd: RawFd) {
        self.inner.off_readable(fd)
    }

    fn off_writable(&mut self, fd: RawFd) {
        self.inner.off_writable(fd)
    }

    #[track_caller]
    fn on_signal(&mut self, signum: i32, cb: SignalCallback) -> WatcherId {
        let site = Location::caller();
        let id = self.inner.on_signal(signum, cb);
        self.record(id, site)
    }

    fn off_signal(&mut self, signum: i32) {
        self.inner.off_signal(signum)
    }

    fn set_error_handler(&mut self, handler: ErrorHandler) {
        *self.error_handler.borrow_mut() = Some(handler);
        let shared = self.error_handler.clone();
        self.inner.set_error_handler(Box::new(move |err| {
            if let Some(handler) = shared.borrow_mut().as_mut() {
                handler(err);
            }
        }));
    }

    fn timer_count(&self) -> usize {
        self.inner.timer_count()
    }
}

/// Attaches the recorded call-site (if any) to an uncaught error's message
/// before it reaches the loop's error handler.
pub fn annotate_with_site(err: CoreError, site: Option<&Location<'static>>) -> CoreError {
    match site {
        Some(site) => {
            let message = format!("{} (registered at {}:{})", err.message(), site.file(), site.line());
            CoreError::new(err.kind(), message)
        }
        None => err,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poll_backend::{PollEventLoop, PollFlavor};

    #[test]
    fn registration_site_is_recorded() {
        let inner = PollEventLoop::new(PollFlavor::Select).unwrap();
        let mut lp = TracingEventLoop::new(inner);
        let id = lp.delay(Duration::from_secs(60), Box::new(|| {}));
        assert!(lp.site_of(id).is_some());
        lp.cancel_timer(id);
        assert!(lp.site_of(id).is_none());
    }
}
