//! A single worker process's event loop (spec.md §4.4: "Each worker runs
//! its own event loop"). Runs entirely inside the forked child — nothing
//! here ever touches the master's pid table or signal dispatch.

use std::cell::RefCell;
use std::net::ToSocketAddrs;
use std::rc::Rc;
use std::sync::Arc;
use std::time::Duration;

use wireframe_core::ids::ConnectionIdAllocator;
use wireframe_core::stats::Statistics;
use wireframe_core::uri::{EndpointUri, TransportScheme};
use wireframe_eventloop::{factory, EventLoop, LoopHandle};
use wireframe_transport::Listener;

use crate::context::WorkerContext;
use crate::signals::{SIGHUP, SIGQUIT, SIGTERM, SIGUSR1, SIGUSR2};
use crate::state::WorkerState;
use crate::statusfile::{render_connection_dump, render_worker_only, ConnectionTrace};

/// Runs one worker to completion; returns the process exit code.
pub fn run(ctx: WorkerContext) -> i32 {
    let lp = match factory::build_handle(ctx.config.event_loop) {
        Ok(lp) => lp,
        Err(err) => {
            tracing::error!(error = %err, "worker failed to build its event loop");
            return 70;
        }
    };

    let ids = Rc::new(ConnectionIdAllocator::new());
    let stats = Arc::new(Statistics::new());

    let listener = match build_listener(&ctx, lp.clone(), ids, stats.clone()) {
        Ok(listener) => listener,
        Err(err) => {
            tracing::error!(error = %err, group = %ctx.group_name, "worker failed to bind its listener");
            return 70;
        }
    };

    listener.borrow_mut().start();

    let state = Rc::new(RefCell::new(WorkerState::Running));
    install_lifecycle_signals(&lp, listener.clone(), &ctx, state.clone(), stats.clone());

    tracing::info!(pid = std::process::id(), group = %ctx.group_name, "worker started");
    lp.borrow_mut().run();
    tracing::info!(pid = std::process::id(), group = %ctx.group_name, "worker exiting");

    0
}

fn build_listener(
    ctx: &WorkerContext,
    lp: LoopHandle,
    ids: Rc<ConnectionIdAllocator>,
    stats: Arc<Statistics>,
) -> Result<Rc<RefCell<Listener>>, wireframe_core::error::CoreError> {
    let uri = EndpointUri::parse(&ctx.config.listen).map_err(|err| {
        wireframe_core::error::CoreError::new(
            wireframe_core::error::ErrorKind::ConnectFail,
            err.to_string(),
        )
    })?;

    match uri.transport() {
        Some(TransportScheme::Unix) => {
            let fd = ctx.listener_fd.expect("unix listeners are always pre-bound by the master");
            Listener::from_inherited_unix_fd(
                fd,
                ctx.codec.clone(),
                ctx.config.max_connections,
                ctx.config.max_package_size,
                ctx.config.max_send_buffer_size,
                ctx.callbacks.clone(),
                lp,
                ids,
                stats,
            )
        }
        Some(TransportScheme::Udp) => match ctx.listener_fd {
            Some(fd) => Listener::from_inherited_udp_fd(
                fd,
                ctx.codec.clone(),
                ctx.config.max_package_size,
                ctx.config.max_send_buffer_size,
                ctx.callbacks.clone(),
                lp,
                ids,
                stats,
            ),
            None => {
                let addr = format!("{}:{}", uri.host, uri.port.unwrap_or(0))
                    .to_socket_addrs()
                    .map_err(|err| {
                        wireframe_core::error::map_io_error(
                            wireframe_core::error::ErrorKind::ConnectFail,
                            err,
                        )
                    })?
                    .next()
                    .ok_or_else(|| {
                        wireframe_core::error::CoreError::new(
                            wireframe_core::error::ErrorKind::ConnectFail,
                            "listen address did not resolve to any socket address",
                        )
                    })?;
                Listener::bind_udp_endpoint(
                    addr,
                    ctx.config.reuse_port,
                    ctx.codec.clone(),
                    ctx.config.max_package_size,
                    ctx.config.max_send_buffer_size,
                    ctx.callbacks.clone(),
                    lp,
                    ids,
                    stats,
                )
            }
        },
        _ => match ctx.listener_fd {
            Some(fd) => Listener::from_inherited_tcp_fd(
                fd,
                ctx.codec.clone(),
                ctx.tls_config.clone(),
                ctx.config.max_connections,
                ctx.config.max_package_size,
                ctx.config.max_send_buffer_size,
                ctx.callbacks.clone(),
                lp,
                ids,
                stats,
            ),
            None => {
                let addr = format!("{}:{}", uri.host, uri.port.unwrap_or(0))
                    .to_socket_addrs()
                    .map_err(|err| {
                        wireframe_core::error::map_io_error(
                            wireframe_core::error::ErrorKind::ConnectFail,
                            err,
                        )
                    })?
                    .next()
                    .ok_or_else(|| {
                        wireframe_core::error::CoreError::new(
                            wireframe_core::error::ErrorKind::ConnectFail,
                            "listen address did not resolve to any socket address",
                        )
                    })?;
                Listener::bind_tcp_endpoint(
                    addr,
                    ctx.config.reuse_port,
                    ctx.codec.clone(),
                    ctx.tls_config.clone(),
                    ctx.config.max_connections,
                    ctx.config.max_package_size,
                    ctx.config.max_send_buffer_size,
                    ctx.callbacks.clone(),
                    lp,
                    ids,
                    stats,
                )
            }
        },
    }
}

/// Wires the worker's signal kit onto the loop's own `on_signal` watchers
/// (spec.md §4.4 "Signals (worker): same kit forwarded through its loop's
/// `onSignal`").
fn install_lifecycle_signals(
    lp: &LoopHandle,
    listener: Rc<RefCell<Listener>>,
    ctx: &WorkerContext,
    state: Rc<RefCell<WorkerState>>,
    stats: Arc<Statistics>,
) {
    let stop_timeout = Duration::from_secs(ctx.config.stop_timeout);
    let on_stop = ctx.on_stop.clone();
    let group_name = ctx.group_name.clone();

    for signum in [SIGTERM, SIGUSR1] {
        let listener = listener.clone();
        let lp_inner = lp.clone();
        let state = state.clone();
        let on_stop = on_stop.clone();
        lp.borrow_mut().on_signal(
            signum,
            Box::new(move || {
                begin_shutdown(lp_inner.clone(), listener.clone(), state.clone(), &on_stop, stop_timeout);
            }),
        );
    }

    {
        let listener = listener.clone();
        let group_name = group_name.clone();
        lp.borrow_mut().on_signal(
            SIGQUIT,
            Box::new(move || {
                let mut traces = Vec::new();
                listener.borrow().for_each_connection(|conn| {
                    traces.push(ConnectionTrace {
                        id: conn.id().get(),
                        remote_addr: conn.remote_addr().map(str::to_string),
                        status: status_label(conn.status()),
                        bytes_buffered: conn.bytes_read(),
                    });
                });
                let rendered = render_connection_dump(std::process::id() as i32, &traces);
                tracing::info!(group = %group_name, "{}", rendered);
            }),
        );
    }

    {
        let group_name = group_name.clone();
        lp.borrow_mut().on_signal(
            SIGHUP,
            Box::new(move || {
                tracing::info!(group = %group_name, "worker reopening log file on SIGHUP");
            }),
        );
    }

    {
        let status_file = ctx.config.status_file.clone();
        let group_name = group_name.clone();
        let state = state.clone();
        lp.borrow_mut().on_signal(
            SIGUSR2,
            Box::new(move || {
                let Some(status_file) = &status_file else { return };
                let report = crate::statusfile::WorkerReport {
                    pid: std::process::id() as i32,
                    group: group_name.clone(),
                    state: *state.borrow(),
                    stats: stats.snapshot(),
                };
                let path = format!("{status_file}.{}", report.pid);
                if let Err(err) = std::fs::write(&path, render_worker_only(&report)) {
                    tracing::warn!(error = %err, path = %path, "failed to write per-worker status file");
                }
            }),
        );
    }
}

fn begin_shutdown(
    lp: LoopHandle,
    listener: Rc<RefCell<Listener>>,
    state: Rc<RefCell<WorkerState>>,
    on_stop: &Option<Rc<dyn Fn()>>,
    stop_timeout: Duration,
) {
    if *state.borrow() == WorkerState::Stopping || *state.borrow() == WorkerState::Stopped {
        return;
    }
    *state.borrow_mut() = WorkerState::Stopping;

    listener.borrow_mut().stop_accepting();
    if let Some(cb) = on_stop {
        cb();
    }

    if listener.borrow().connection_count() == 0 {
        finish_shutdown(&lp, &listener, &state);
        return;
    }

    let poll_interval = Duration::from_millis(50);
    let deadline = stop_timeout;
    let elapsed = Rc::new(RefCell::new(Duration::ZERO));

    schedule_drain_check(lp, listener, state, poll_interval, deadline, elapsed);
}

fn schedule_drain_check(
    lp: LoopHandle,
    listener: Rc<RefCell<Listener>>,
    state: Rc<RefCell<WorkerState>>,
    poll_interval: Duration,
    deadline: Duration,
    elapsed: Rc<RefCell<Duration>>,
) {
    let lp_inner = lp.clone();
    lp.borrow_mut().delay(
        poll_interval,
        Box::new(move || {
            *elapsed.borrow_mut() += poll_interval;
            if listener.borrow().connection_count() == 0 {
                finish_shutdown(&lp_inner, &listener, &state);
                return;
            }
            if *elapsed.borrow() >= deadline {
                tracing::warn!("stopTimeout elapsed with connections still open, forcing close");
                listener.borrow_mut().destroy_all();
                finish_shutdown(&lp_inner, &listener, &state);
                return;
            }
            schedule_drain_check(
                lp_inner.clone(),
                listener.clone(),
                state.clone(),
                poll_interval,
                deadline,
                elapsed.clone(),
            );
        }),
    );
}

fn finish_shutdown(lp: &LoopHandle, listener: &Rc<RefCell<Listener>>, state: &Rc<RefCell<WorkerState>>) {
    let _ = listener;
    *state.borrow_mut() = WorkerState::Stopped;
    lp.borrow_mut().stop();
}

fn status_label(status: wireframe_core::status::ConnectionStatus) -> &'static str {
    use wireframe_core::status::ConnectionStatus::*;
    match status {
        Initial => "initial",
        Connecting => "connecting",
        Handshaking => "handshaking",
        Established => "established",
        Closing => "closing",
        Closed => "closed",
    }
}
