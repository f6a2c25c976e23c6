//! Configuration loading, CLI argument parsing and daemonization glue for
//! the wireframe socket-server framework. The binary entry point lives in
//! `src/bin/wireframe.rs`; this library only holds the pieces worth unit
//! testing independently of `main`.

mod cli;
mod codecs;
mod config;
mod daemon;

pub use cli::{parse_args, Command};
pub use codecs::builtin_registry;
pub use config::load_listener_configs;
pub use daemon::daemonize;
