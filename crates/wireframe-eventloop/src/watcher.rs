use std::os::unix::io::RawFd;

use wireframe_core::ids::WatcherId;

pub type IoCallback = Box<dyn FnMut()>;
pub type SignalCallback = Box<dyn FnMut(i32)>;

/// What a single registration is waiting on. Kept distinct from
/// [`crate::timer::TimerKind`] since fd and signal watchers are indexed by
/// fd/signum for `off*` cancellation rather than by [`WatcherId`] alone.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum WatchTarget {
    Readable(RawFd),
    Writable(RawFd),
    Signal(i32),
}

pub struct IoRegistration {
    pub id: WatcherId,
    pub target: WatchTarget,
    pub enabled: bool,
    pub referenced: bool,
}
