use std::fmt::Write as _;
use std::time::Duration;

use wireframe_core::stats::StatisticsSnapshot;

use crate::state::WorkerState;

/// One worker's row in a status snapshot (spec.md §4.4 "Statistics").
#[derive(Clone, Debug)]
pub struct WorkerReport {
    pub pid: i32,
    pub group: String,
    pub state: WorkerState,
    pub stats: StatisticsSnapshot,
}

/// The full snapshot rendered on `SIGUSR2`, human-readable with a master
/// section followed by one section per worker (spec.md §6 "Persisted
/// state").
#[derive(Clone, Debug)]
pub struct StatusReport {
    pub master_pid: i32,
    pub uptime: Duration,
    pub workers: Vec<WorkerReport>,
}

pub fn render(report: &StatusReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "[master]");
    let _ = writeln!(out, "pid = {}", report.master_pid);
    let _ = writeln!(out, "uptime_secs = {}", report.uptime.as_secs());
    let _ = writeln!(out, "workers = {}", report.workers.len());

    for worker in &report.workers {
        let _ = writeln!(out);
        render_worker_section(worker, &mut out);
    }

    out
}

fn render_worker_section(worker: &WorkerReport, out: &mut String) {
    let _ = writeln!(out, "[worker.{}]", worker.pid);
    let _ = writeln!(out, "group = {}", worker.group);
    let _ = writeln!(out, "state = {}", worker.state);
    let _ = writeln!(out, "total_accepted = {}", worker.stats.total_accepted);
    let _ = writeln!(
        out,
        "current_connections = {}",
        worker.stats.current_connections
    );
    let _ = writeln!(out, "bytes_read = {}", worker.stats.bytes_read);
    let _ = writeln!(out, "bytes_written = {}", worker.stats.bytes_written);
    let _ = writeln!(out, "send_failures = {}", worker.stats.send_failures);
    let _ = writeln!(out, "total_throws = {}", worker.stats.total_throws);
}

/// Renders just one worker's section, written by that worker itself to a
/// per-pid file on `SIGUSR2` since a worker has no shared memory with the
/// master to publish through directly; the master concatenates these
/// files (plus its own `[master]` header) when a `status` request needs
/// the full picture.
pub fn render_worker_only(worker: &WorkerReport) -> String {
    let mut out = String::new();
    render_worker_section(worker, &mut out);
    out
}

/// One connection's row in a `SIGQUIT` diagnostic dump.
#[derive(Clone, Debug)]
pub struct ConnectionTrace {
    pub id: u64,
    pub remote_addr: Option<String>,
    pub status: &'static str,
    pub bytes_buffered: usize,
}

pub fn render_connection_dump(worker_pid: i32, traces: &[ConnectionTrace]) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "[worker.{worker_pid}.connections]");
    let _ = writeln!(out, "count = {}", traces.len());
    for trace in traces {
        let _ = writeln!(
            out,
            "#{} remote={} status={} buffered={}",
            trace.id,
            trace.remote_addr.as_deref().unwrap_or("-"),
            trace.status,
            trace.bytes_buffered
        );
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn renders_master_and_worker_sections() {
        let report = StatusReport {
            master_pid: 1,
            uptime: Duration::from_secs(60),
            workers: vec![WorkerReport {
                pid: 2,
                group: "echo".into(),
                state: WorkerState::Running,
                stats: StatisticsSnapshot {
                    total_accepted: 5,
                    current_connections: 3,
                    bytes_read: 100,
                    bytes_written: 200,
                    send_failures: 0,
                    total_throws: 0,
                },
            }],
        };
        let rendered = render(&report);
        assert!(rendered.contains("[master]"));
        assert!(rendered.contains("pid = 1"));
        assert!(rendered.contains("[worker.2]"));
        assert!(rendered.contains("state = running"));
        assert!(rendered.contains("total_accepted = 5"));
    }

    #[test]
    fn renders_connection_dump() {
        let traces = vec![ConnectionTrace {
            id: 7,
            remote_addr: Some("127.0.0.1:9000".into()),
            status: "established",
            bytes_buffered: 0,
        }];
        let rendered = render_connection_dump(42, &traces);
        assert!(rendered.contains("[worker.42.connections]"));
        assert!(rendered.contains("#7 remote=127.0.0.1:9000 status=established buffered=0"));
    }
}
