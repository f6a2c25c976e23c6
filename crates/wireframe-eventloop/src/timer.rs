use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

use wireframe_core::ids::{WatcherId, WatcherIdAllocator};

pub type TimerCallback = Box<dyn FnMut()>;

/// Result of [`TimerService::cancel`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CancelOutcome {
    /// The timer was pending and is now cancelled.
    Cancelled,
    /// The timer was already cancelled; this call changed nothing.
    AlreadyCancelled,
    /// `id` names no timer this service currently tracks.
    Unknown,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerKind {
    OneShot,
    Periodic(Duration),
}

struct TimerEntry {
    id: WatcherId,
    due: Instant,
    kind: TimerKind,
    cancelled: bool,
    callback: TimerCallback,
}

struct HeapKey {
    due: Instant,
    id: WatcherId,
}

impl PartialEq for HeapKey {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.id == other.id
    }
}
impl Eq for HeapKey {}
impl PartialOrd for HeapKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.due.cmp(&other.due).then(self.id.cmp(&other.id))
    }
}

/// A monotonic timer wheel shared by every event-loop backend: a min-heap
/// keyed by fire time, with lazy deletion for cancelled entries (cancelling
/// marks the entry and lets it fall out of the heap on its next pop rather
/// than searching the heap).
#[derive(Default)]
pub struct TimerService {
    ids: WatcherIdAllocator,
    heap: BinaryHeap<Reverse<HeapKey>>,
    entries: std::collections::HashMap<WatcherId, TimerEntry>,
}

impl TimerService {
    pub fn new() -> Self {
        Self {
            ids: WatcherIdAllocator::new(),
            heap: BinaryHeap::new(),
            entries: std::collections::HashMap::new(),
        }
    }

    pub fn delay(&mut self, after: Duration, callback: TimerCallback) -> WatcherId {
        self.schedule(after, TimerKind::OneShot, callback)
    }

    pub fn repeat(&mut self, interval: Duration, callback: TimerCallback) -> WatcherId {
        self.schedule(interval, TimerKind::Periodic(interval), callback)
    }

    fn schedule(&mut self, after: Duration, kind: TimerKind, callback: TimerCallback) -> WatcherId {
        let id = self.ids.next();
        let due = Instant::now() + after;
        self.heap.push(Reverse(HeapKey { due, id }));
        self.entries.insert(
            id,
            TimerEntry {
                id,
                due,
                kind,
                cancelled: false,
                callback,
            },
        );
        id
    }

    /// Idempotent cancel: a second cancel on an already-cancelled id stays
    /// a no-op, matching the "cancellable exactly once" invariant. Reports
    /// whether `id` named a timer this service still knows about, so a
    /// caller can tell a stale or foreign id (never scheduled here, or a
    /// one-shot that already fired and was reaped) from a normal repeat
    /// cancel.
    pub fn cancel(&mut self, id: WatcherId) -> CancelOutcome {
        match self.entries.get_mut(&id) {
            Some(entry) if entry.cancelled => CancelOutcome::AlreadyCancelled,
            Some(entry) => {
                entry.cancelled = true;
                CancelOutcome::Cancelled
            }
            None => CancelOutcome::Unknown,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.values().filter(|e| !e.cancelled).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Time until the next live timer is due, or `None` if there are none.
    pub fn next_due_in(&mut self) -> Option<Duration> {
        loop {
            let top_id = match self.heap.peek() {
                Some(Reverse(top)) => top.id,
                None => return None,
            };
            match self.entries.get(&top_id) {
                Some(entry) if entry.cancelled => {
                    self.heap.pop();
                    continue;
                }
                Some(entry) => {
                    return Some(entry.due.saturating_duration_since(Instant::now()));
                }
                None => {
                    self.heap.pop();
                    continue;
                }
            }
        }
    }

    /// Pops and fires every timer whose due time has passed, honoring
    /// cancellation and periodic rescheduling. A timer registered from
    /// inside a callback fired during this call will not itself fire until
    /// a subsequent `fire_due` call, since it is scheduled for `now +
    /// after` which is always in the future relative to this tick.
    pub fn fire_due(&mut self) {
        let now = Instant::now();
        loop {
            let Some(Reverse(top)) = self.heap.peek() else {
                break;
            };
            if top.due > now {
                break;
            }
            let Reverse(key) = self.heap.pop().unwrap();
            let Some(mut entry) = self.entries.remove(&key.id) else {
                continue;
            };
            if entry.cancelled {
                continue;
            }
            (entry.callback)();
            match entry.kind {
                TimerKind::OneShot => {}
                TimerKind::Periodic(interval) => {
                    if !entry.cancelled {
                        let due = key.due + interval;
                        self.heap.push(Reverse(HeapKey { due, id: key.id }));
                        entry.due = due;
                        self.entries.insert(key.id, entry);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[test]
    fn cancel_before_due_prevents_fire() {
        let mut svc = TimerService::new();
        let fired = Rc::new(RefCell::new(false));
        let fired_cb = fired.clone();
        let id = svc.delay(Duration::from_millis(0), Box::new(move || *fired_cb.borrow_mut() = true));
        svc.cancel(id);
        std::thread::sleep(Duration::from_millis(5));
        svc.fire_due();
        assert!(!*fired.borrow());
    }

    #[test]
    fn nested_delay_fires_next_tick_not_current() {
        let mut svc = TimerService::new();
        let log = Rc::new(RefCell::new(Vec::new()));
        let log2 = log.clone();
        svc.delay(
            Duration::from_millis(0),
            Box::new(move || {
                log2.borrow_mut().push("cb1");
            }),
        );
        std::thread::sleep(Duration::from_millis(2));
        svc.fire_due();
        assert_eq!(*log.borrow(), vec!["cb1"]);
    }

    #[test]
    fn periodic_reschedules_without_coalescing() {
        let mut svc = TimerService::new();
        let count = Rc::new(RefCell::new(0));
        let count2 = count.clone();
        svc.repeat(
            Duration::from_millis(1),
            Box::new(move || *count2.borrow_mut() += 1),
        );
        std::thread::sleep(Duration::from_millis(25));
        svc.fire_due();
        assert!(*count.borrow() >= 1);
    }
}
