//! Shared foundation for the wireframe socket-server framework: the error
//! taxonomy, connection/watcher id allocators, recv/send buffers, the
//! connection status state machine, listener configuration knobs, endpoint
//! URI parsing and in-process statistics counters.
//!
//! Everything here is pure data and logic — no I/O, no event loop. The
//! event loop lives in `wireframe-eventloop`, the connection engine in
//! `wireframe-transport`.

pub mod buffer;
pub mod config;
pub mod error;
pub mod ids;
pub mod stats;
pub mod status;
pub mod uri;

pub mod prelude {
    pub use crate::buffer::{BackpressureEdge, RecvBuffer, SendBuffer};
    pub use crate::config::{EventLoopKind, ListenerConfig};
    pub use crate::error::{map_io_error, CoreError, ErrorKind, Result, UncaughtThrowable};
    pub use crate::ids::{ConnectionId, ConnectionIdAllocator, WatcherId, WatcherIdAllocator};
    pub use crate::stats::{Statistics, StatisticsSnapshot};
    pub use crate::status::ConnectionStatus;
    pub use crate::uri::{EndpointUri, TransportScheme, UriParseError};
}
