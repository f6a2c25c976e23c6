//! Master/worker process supervision for the wireframe socket-server
//! framework (spec.md §4.4 "Worker supervisor"). The master binds
//! listening sockets, forks a worker pool per listener group, and
//! supervises them through signals; each worker runs its own event loop
//! and accept/connection machinery from `wireframe-transport`.

mod context;
mod fault;
mod master;
mod state;
mod statusfile;
mod worker;

pub mod pidfile;
pub mod signals;

pub use context::{WorkerContext, WorkerGroup};
pub use fault::ForkWindow;
pub use master::{reload_target_path, Master};
pub use state::WorkerState;
pub use statusfile::{render, render_connection_dump, render_worker_only, ConnectionTrace, StatusReport, WorkerReport};
