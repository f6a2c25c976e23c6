//! The event-loop contract (spec.md §4.1) and its backends: a level-
//! triggered readiness poller (`select`/`ev`/`event`-style), a fiber-based
//! coroutine reactor, and an opt-in tracing decorator. Every backend is
//! single-threaded and cooperative: one callback runs to completion before
//! the next is dispatched.

pub mod coroutine;
pub mod factory;
pub mod poll_backend;
pub mod suspension;
pub mod timer;
pub mod tracing_backend;
pub mod watcher;

use std::os::unix::io::RawFd;
use std::time::Duration;

use wireframe_core::error::CoreError;
use wireframe_core::ids::WatcherId;

pub use timer::TimerCallback;
pub use watcher::{IoCallback, SignalCallback};

pub type ErrorHandler = Box<dyn FnMut(CoreError)>;

/// A shared handle to a running loop. Watcher callbacks are plain
/// `FnMut()` closures with no way to reach the loop that invoked them, so
/// anything that needs to re-register itself mid-callback (a connection
/// installing a writability watcher after a partial write, for instance)
/// captures one of these instead.
pub type LoopHandle = std::rc::Rc<std::cell::RefCell<dyn EventLoop>>;

/// Uniform contract implemented by every backend (spec.md §4.1).
///
/// A single callback runs to completion before the next is dispatched;
/// callbacks enqueued during the current dispatch (deferred work) run
/// after it and before the loop re-polls I/O.
pub trait EventLoop {
    /// Blocks while at least one enabled, referenced callback remains;
    /// returns when none remain or after [`EventLoop::stop`] was called.
    fn run(&mut self);

    /// Requests the loop exit after the current dispatch returns.
    fn stop(&mut self);

    /// Registers a one-shot timer, minimum granularity 1 ms.
    fn delay(&mut self, after: Duration, cb: TimerCallback) -> WatcherId;

    /// Registers a periodic timer. Missed fires are not coalesced: they
    /// fire back-to-back until the loop has caught up.
    fn repeat(&mut self, interval: Duration, cb: TimerCallback) -> WatcherId;

    /// Cancels a timer registered via `delay`/`repeat`. Idempotent.
    fn cancel_timer(&mut self, id: WatcherId);

    /// Registers interest in `fd` becoming readable. A second registration
    /// on the same fd replaces (cancels) the first.
    fn on_readable(&mut self, fd: RawFd, cb: IoCallback) -> WatcherId;

    /// Registers interest in `fd` becoming writable. A second registration
    /// on the same fd replaces (cancels) the first.
    fn on_writable(&mut self, fd: RawFd, cb: IoCallback) -> WatcherId;

    /// Idempotent cancel of a readable registration on `fd`.
    fn off_readable(&mut self, fd: RawFd);

    /// Idempotent cancel of a writable registration on `fd`.
    fn off_writable(&mut self, fd: RawFd);

    /// Registers a POSIX signal handler. Delivery happens on the loop's
    /// own dispatch, not inside an async-signal-safe handler.
    fn on_signal(&mut self, signum: i32, cb: SignalCallback) -> WatcherId;

    /// Idempotent cancel of a signal registration.
    fn off_signal(&mut self, signum: i32);

    /// Installs a loop-level handler receiving any error raised by a user
    /// callback. Without one installed, the error propagates to the
    /// driver (`run`'s caller sees it via a panic or, in this port, a
    /// `tracing::error!` plus the loop unwinding its current dispatch).
    fn set_error_handler(&mut self, handler: ErrorHandler);

    /// Count of pending (non-cancelled) timers.
    fn timer_count(&self) -> usize;
}
