use std::sync::atomic::{AtomicU64, Ordering};

/// In-process counters for a single worker, aggregated into the status
/// file on `SIGUSR2` (spec.md §4.4). All fields are plain atomics rather
/// than a mutex-guarded struct since a worker is single-threaded for
/// everything except these counters, which may be read from a signal
/// dispatch thread.
#[derive(Debug, Default)]
pub struct Statistics {
    total_accepted: AtomicU64,
    current_connections: AtomicU64,
    bytes_read: AtomicU64,
    bytes_written: AtomicU64,
    send_failures: AtomicU64,
    total_throws: AtomicU64,
}

impl Statistics {
    pub const fn new() -> Self {
        Self {
            total_accepted: AtomicU64::new(0),
            current_connections: AtomicU64::new(0),
            bytes_read: AtomicU64::new(0),
            bytes_written: AtomicU64::new(0),
            send_failures: AtomicU64::new(0),
            total_throws: AtomicU64::new(0),
        }
    }

    pub fn record_accept(&self) {
        self.total_accepted.fetch_add(1, Ordering::Relaxed);
        self.current_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_close(&self) {
        self.current_connections.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn record_read(&self, bytes: u64) {
        self.bytes_read.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_write(&self, bytes: u64) {
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_send_failure(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_throw(&self) {
        self.total_throws.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatisticsSnapshot {
        StatisticsSnapshot {
            total_accepted: self.total_accepted.load(Ordering::Relaxed),
            current_connections: self.current_connections.load(Ordering::Relaxed),
            bytes_read: self.bytes_read.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            total_throws: self.total_throws.load(Ordering::Relaxed),
        }
    }
}

/// A point-in-time copy of [`Statistics`], cheap to pass across the signal
/// boundary and to render in the status file.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatisticsSnapshot {
    pub total_accepted: u64,
    pub current_connections: u64,
    pub bytes_read: u64,
    pub bytes_written: u64,
    pub send_failures: u64,
    pub total_throws: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accept_and_close_track_current_connections() {
        let stats = Statistics::new();
        stats.record_accept();
        stats.record_accept();
        stats.record_close();
        let snap = stats.snapshot();
        assert_eq!(snap.total_accepted, 2);
        assert_eq!(snap.current_connections, 1);
    }
}
