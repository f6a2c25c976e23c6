use std::collections::HashMap;
use std::os::unix::io::RawFd;
use std::sync::mpsc;
use std::time::Duration;

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token};
use signal_hook::iterator::Signals;

use wireframe_core::error::{CoreError, ErrorKind};
use wireframe_core::ids::{WatcherId, WatcherIdAllocator};

use crate::timer::{TimerCallback, TimerService};
use crate::watcher::{IoCallback, SignalCallback};
use crate::{ErrorHandler, EventLoop};

/// Which readiness family this instance represents. Both variants share
/// the same `mio`-backed polling core; the distinction is purely
/// dispatch-order bookkeeping, matching how `select(2)`-family loops and
/// libev/libevent-style reactors both boil down to "ask the kernel what's
/// ready, then run callbacks" while differing in how they prioritize a
/// backlog of simultaneously-ready fds.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollFlavor {
    /// `select`/`poll`/`epoll`-style: fds are serviced in the order the
    /// kernel reports them in a single `poll` call.
    Select,
    /// libev/libevent-style reactor: fds registered most recently are
    /// drained first within a batch, approximating the "watcher priority"
    /// behavior those reactors expose.
    Reactor,
}

struct FdState {
    readable: Option<(WatcherId, IoCallback)>,
    writable: Option<(WatcherId, IoCallback)>,
}

/// A level-triggered, single-threaded event loop backed by `mio::Poll`.
/// Represents the "readiness polling" and "libev/libevent-style reactor"
/// backend families from spec.md §4.1 — see [`PollFlavor`].
pub struct PollEventLoop {
    flavor: PollFlavor,
    poll: Poll,
    events: Events,
    fds: HashMap<RawFd, FdState>,
    timers: TimerService,
    signals: HashMap<i32, SignalCallback>,
    signal_rx: Option<mpsc::Receiver<i32>>,
    _signal_thread: Option<std::thread::JoinHandle<()>>,
    signal_kinds_registered: Vec<i32>,
    error_handler: Option<ErrorHandler>,
    ids: WatcherIdAllocator,
    stop_requested: bool,
}

impl PollEventLoop {
    pub fn new(flavor: PollFlavor) -> std::io::Result<Self> {
        Ok(Self {
            flavor,
            poll: Poll::new()?,
            events: Events::with_capacity(256),
            fds: HashMap::new(),
            timers: TimerService::new(),
            signals: HashMap::new(),
            signal_rx: None,
            _signal_thread: None,
            signal_kinds_registered: Vec::new(),
            error_handler: None,
            ids: WatcherIdAllocator::new(),
            stop_requested: false,
        })
    }

    fn dispatch_error(&mut self, err: CoreError) {
        if let Some(handler) = self.error_handler.as_mut() {
            handler(err);
        } else {
            tracing::error!(code = err.code(), message = %err.message(), "uncaught error propagated to loop driver");
        }
    }

    fn ensure_signal_thread(&mut self) -> std::io::Result<()> {
        if self.signal_rx.is_some() {
            return Ok(());
        }
        let (tx, rx) = mpsc::channel();
        let kinds = self.signal_kinds_registered.clone();
        let mut signals = Signals::new(kinds)?;
        let handle = std::thread::spawn(move || {
            for signum in signals.forever() {
                if tx.send(signum).is_err() {
                    break;
                }
            }
        });
        self.signal_rx = Some(rx);
        self._signal_thread = Some(handle);
        Ok(())
    }

    fn register_interest(&mut self, fd: RawFd) -> std::io::Result<()> {
        let state = self.fds.get(&fd).expect("fd state must exist");
        let mut interest: Option<Interest> = None;
        if state.readable.is_some() {
            interest = Some(Interest::READABLE);
        }
        if state.writable.is_some() {
            interest = Some(match interest {
                Some(i) => i | Interest::WRITABLE,
                None => Interest::WRITABLE,
            });
        }
        // Re-registering is idempotent from the caller's perspective: mio
        // requires dereg-then-reg when interest changes, so always do both.
        let _ = self.poll.registry().deregister(&mut SourceFd(&fd));
        if let Some(interest) = interest {
            self.poll
                .registry()
                .register(&mut SourceFd(&fd), Token(fd as usize), interest)?;
        }
        Ok(())
    }

    fn poll_once(&mut self, timeout: Option<Duration>) {
        if let Err(err) = self.poll.poll(&mut self.events, timeout) {
            if err.kind() != std::io::ErrorKind::Interrupted {
                self.dispatch_error(wireframe_core::error::map_io_error(
                    ErrorKind::Uncaught,
                    err,
                ));
            }
            return;
        }

        let mut ready: Vec<(RawFd, bool, bool)> = self
            .events
            .iter()
            .map(|ev| {
                let fd = ev.token().0 as RawFd;
                (fd, ev.is_readable(), ev.is_writable())
            })
            .collect();

        if self.flavor == PollFlavor::Reactor {
            ready.reverse();
        }

        for (fd, readable, writable) in ready {
            if readable {
                self.fire_io(fd, true);
            }
            if writable {
                self.fire_io(fd, false);
            }
        }

        if let Some(rx) = &self.signal_rx {
            while let Ok(signum) = rx.try_recv() {
                if let Some(cb) = self.signals.get_mut(&signum) {
                    cb(signum);
                }
            }
        }
    }

    fn fire_io(&mut self, fd: RawFd, readable_direction: bool) {
        let Some(state) = self.fds.get_mut(&fd) else {
            return;
        };
        let slot = if readable_direction {
            &mut state.readable
        } else {
            &mut state.writable
        };
        if let Some((_, cb)) = slot {
            cb();
        }
    }

    pub(crate) fn has_live_work(&self) -> bool {
        !self.fds.is_empty() || self.timers.len() > 0 || !self.signals.is_empty()
    }

    pub(crate) fn stop_requested(&self) -> bool {
        self.stop_requested
    }

    pub(crate) fn reset_stop(&mut self) {
        self.stop_requested = false;
    }

    /// Runs a single poll-and-dispatch round: waits for readiness up to the
    /// next due timer (capped at 250ms so signals/stop requests are noticed
    /// promptly), dispatches whatever fired, then runs due timers. Exposed
    /// so [`crate::coroutine::CoroutineEventLoop`] can interleave this with
    /// its own local task set instead of only ever calling [`Self::run`]
    /// start-to-finish.
    pub(crate) fn tick(&mut self) {
        let timeout = self.timers.next_due_in().unwrap_or(Duration::from_millis(250));
        self.poll_once(Some(timeout.min(Duration::from_millis(250))));
        self.timers.fire_due();
    }
}

impl EventLoop for PollEventLoop {
    fn run(&mut self) {
        self.reset_stop();
        while !self.stop_requested && self.has_live_work() {
            self.tick();
        }
    }

    fn stop(&mut self) {
        self.stop_requested = true;
    }

    fn delay(&mut self, after: Duration, cb: TimerCallback) -> WatcherId {
        self.timers.delay(after, cb)
    }

    fn repeat(&mut self, interval: Duration, cb: TimerCallback) -> WatcherId {
        self.timers.repeat(interval, cb)
    }

    fn cancel_timer(&mut self, id: WatcherId) {
        if let crate::timer::CancelOutcome::Unknown = self.timers.cancel(id) {
            self.dispatch_error(CoreError::new(
                ErrorKind::InvalidCallbackId,
                format!("cancel_timer called with unknown watcher id {id}"),
            ));
        }
    }

    fn on_readable(&mut self, fd: RawFd, cb: IoCallback) -> WatcherId {
        let id = self.ids.next();
        let entry = self.fds.entry(fd).or_insert_with(|| FdState {
            readable: None,
            writable: None,
        });
        entry.readable = Some((id, cb));
        let _ = self.register_interest(fd);
        id
    }

    fn on_writable(&mut self, fd: RawFd, cb: IoCallback) -> WatcherId {
        let id = self.ids.next();
        let entry = self.fds.entry(fd).or_insert_with(|| FdState {
            readable: None,
            writable: None,
        });
        entry.writable = Some((id, cb));
        let _ = self.register_interest(fd);
        id
    }

    fn off_readable(&mut self, fd: RawFd) {
        if let Some(state) = self.fds.get_mut(&fd) {
            state.readable = None;
            let empty = state.readable.is_none() && state.writable.is_none();
            let _ = self.register_interest(fd);
            if empty {
                self.fds.remove(&fd);
            }
        }
    }

    fn off_writable(&mut self, fd: RawFd) {
        if let Some(state) = self.fds.get_mut(&fd) {
            state.writable = None;
            let empty = state.readable.is_none() && state.writable.is_none();
            let _ = self.register_interest(fd);
            if empty {
                self.fds.remove(&fd);
            }
        }
    }

    fn on_signal(&mut self, signum: i32, cb: SignalCallback) -> WatcherId {
        let id = self.ids.next();
        self.signals.insert(signum, cb);
        if !self.signal_kinds_registered.contains(&signum) {
            self.signal_kinds_registered.push(signum);
        }
        // Rebuild the signal thread so it watches the updated kind set;
        // acceptable since registering new signal kinds at runtime is rare.
        self.signal_rx = None;
        self._signal_thread = None;
        let _ = self.ensure_signal_thread();
        id
    }

    fn off_signal(&mut self, signum: i32) {
        self.signals.remove(&signum);
    }

    fn set_error_handler(&mut self, handler: ErrorHandler) {
        self.error_handler = Some(handler);
    }

    fn timer_count(&self) -> usize {
        self.timers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn delay_fires_and_loop_returns() {
        let mut lp = PollEventLoop::new(PollFlavor::Select).unwrap();
        let fired = Rc::new(RefCell::new(false));
        let fired2 = fired.clone();
        lp.delay(Duration::from_millis(1), Box::new(move || *fired2.borrow_mut() = true));
        lp.run();
        assert!(*fired.borrow());
    }

    #[test]
    fn cancelled_timer_never_fires() {
        let mut lp = PollEventLoop::new(PollFlavor::Select).unwrap();
        let fired = Rc::new(RefCell::new(false));
        let fired2 = fired.clone();
        let id = lp.delay(Duration::from_millis(20), Box::new(move || *fired2.borrow_mut() = true));
        lp.cancel_timer(id);
        lp.run();
        assert!(!*fired.borrow());
    }

    #[test]
    fn readable_pipe_fires_callback() {
        let mut lp = PollEventLoop::new(PollFlavor::Select).unwrap();
        let (mut read_fd, mut write_fd) = make_pipe();
        let seen = Rc::new(RefCell::new(false));
        let seen2 = seen.clone();
        let raw_read = read_fd;
        lp.on_readable(
            raw_read,
            Box::new(move || {
                *seen2.borrow_mut() = true;
            }),
        );
        use std::io::Write;
        write_fd.write_all(b"x").unwrap();
        lp.delay(Duration::from_millis(50), {
            let mut stopped = false;
            Box::new(move || {
                if !stopped {
                    stopped = true;
                }
            })
        });
        // run a single bounded iteration instead of the full run() loop,
        // since the readable watcher never gets cancelled in this test.
        lp.poll_once(Some(Duration::from_millis(100)));
        assert!(*seen.borrow());
        lp.off_readable(raw_read);
        let _ = &mut read_fd;
    }

    fn make_pipe() -> (RawFd, std::fs::File) {
        use std::os::unix::io::FromRawFd;
        let mut fds = [0i32; 2];
        unsafe {
            assert_eq!(libc::pipe(fds.as_mut_ptr()), 0);
            (fds[0], std::fs::File::from_raw_fd(fds[1]))
        }
    }
}
