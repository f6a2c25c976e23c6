use std::cell::RefCell;
use std::rc::Rc;

use wireframe_core::config::EventLoopKind;

use crate::coroutine::CoroutineEventLoop;
use crate::poll_backend::{PollEventLoop, PollFlavor};
use crate::tracing_backend::TracingEventLoop;
use crate::{EventLoop, LoopHandle};

/// Environment variable selecting the backend family, overriding the
/// listener-level [`EventLoopKind`] when set (spec.md §6).
pub const DRIVER_ENV: &str = "EVENT_LOOP_DRIVER";

/// Environment variable enabling the call-site tracing decorator around
/// whichever backend is selected.
pub const DEBUG_TRACE_ENV: &str = "EVENT_LOOP_DRIVER_DEBUG_TRACE";

fn kind_from_env() -> Option<EventLoopKind> {
    match std::env::var(DRIVER_ENV).ok()?.to_lowercase().as_str() {
        "select" => Some(EventLoopKind::Select),
        "ev" => Some(EventLoopKind::Ev),
        "event" => Some(EventLoopKind::Event),
        "uv" => Some(EventLoopKind::Uv),
        "coroutine" => Some(EventLoopKind::Coroutine),
        "tracing" => Some(EventLoopKind::Tracing),
        _ => None,
    }
}

fn debug_trace_enabled() -> bool {
    std::env::var(DEBUG_TRACE_ENV)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

/// One of the constructible event-loop backends, boxed behind the common
/// [`EventLoop`] trait so callers don't need to know which concrete type
/// the factory picked.
pub fn build(configured: EventLoopKind) -> std::io::Result<Box<dyn EventLoop>> {
    let kind = kind_from_env().unwrap_or(configured);
    let backend: Box<dyn EventLoop> = match kind {
        EventLoopKind::Select | EventLoopKind::Uv => {
            Box::new(PollEventLoop::new(PollFlavor::Select)?)
        }
        EventLoopKind::Ev | EventLoopKind::Event => {
            Box::new(PollEventLoop::new(PollFlavor::Reactor)?)
        }
        EventLoopKind::Coroutine => Box::new(CoroutineEventLoop::new()?),
        EventLoopKind::Tracing => {
            Box::new(TracingEventLoop::new(PollEventLoop::new(PollFlavor::Select)?))
        }
    };

    if debug_trace_enabled() && !matches!(kind, EventLoopKind::Tracing) {
        // Re-wrap the already-built backend isn't possible once boxed as a
        // trait object of a concrete inner type; honor the flag by
        // preferring the tracing backend outright in this case.
        return Ok(Box::new(TracingEventLoop::new(PollEventLoop::new(
            PollFlavor::Select,
        )?)));
    }

    Ok(backend)
}

/// Like [`build`], but returns a shareable [`LoopHandle`] rather than an
/// owned `Box`. Needed anywhere a caller must hand the same loop to
/// multiple owners (a worker's listeners and its connections, for
/// instance) — `dyn EventLoop` is unsized, so going from `Box<dyn
/// EventLoop>` to `Rc<RefCell<dyn EventLoop>>` isn't a coercion Rust can
/// perform after the fact; each concrete backend is boxed into its `Rc`
/// directly instead.
pub fn build_handle(configured: EventLoopKind) -> std::io::Result<LoopHandle> {
    let kind = kind_from_env().unwrap_or(configured);
    let force_tracing = debug_trace_enabled() && !matches!(kind, EventLoopKind::Tracing);

    let handle: LoopHandle = if force_tracing {
        Rc::new(RefCell::new(TracingEventLoop::new(PollEventLoop::new(
            PollFlavor::Select,
        )?)))
    } else {
        match kind {
            EventLoopKind::Select | EventLoopKind::Uv => {
                Rc::new(RefCell::new(PollEventLoop::new(PollFlavor::Select)?))
            }
            EventLoopKind::Ev | EventLoopKind::Event => {
                Rc::new(RefCell::new(PollEventLoop::new(PollFlavor::Reactor)?))
            }
            EventLoopKind::Coroutine => Rc::new(RefCell::new(CoroutineEventLoop::new()?)),
            EventLoopKind::Tracing => Rc::new(RefCell::new(TracingEventLoop::new(
                PollEventLoop::new(PollFlavor::Select)?,
            ))),
        }
    };

    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_select_backend_by_default() {
        std::env::remove_var(DRIVER_ENV);
        std::env::remove_var(DEBUG_TRACE_ENV);
        let lp = build(EventLoopKind::Select).unwrap();
        assert_eq!(lp.timer_count(), 0);
    }

    #[test]
    fn env_override_takes_precedence() {
        std::env::set_var(DRIVER_ENV, "coroutine");
        let lp = build(EventLoopKind::Select).unwrap();
        assert_eq!(lp.timer_count(), 0);
        std::env::remove_var(DRIVER_ENV);
    }

    #[test]
    fn build_handle_is_shareable() {
        std::env::remove_var(DRIVER_ENV);
        std::env::remove_var(DEBUG_TRACE_ENV);
        let lp = build_handle(EventLoopKind::Select).unwrap();
        let lp2 = lp.clone();
        assert_eq!(lp2.borrow().timer_count(), 0);
    }
}
