use std::os::unix::io::RawFd;
use std::rc::Rc;
use std::sync::Arc;

use wireframe_codec::FrameCodec;
use wireframe_core::config::ListenerConfig;
use wireframe_transport::Callbacks;

/// Everything the master knows about one configured listener group before
/// any worker for it has forked (spec.md §4.4 "Process model"). One group
/// per `ListenerConfig` entry; `count` workers run from the same group.
pub struct WorkerGroup {
    pub config: ListenerConfig,
    pub codec: Option<Arc<dyn FrameCodec>>,
    pub tls_config: Option<Arc<rustls::ServerConfig>>,
    pub callbacks: Rc<Callbacks>,
    /// Invoked once, synchronously, during this worker's shutdown
    /// protocol step 2 ("deliver `stop` callback to the user").
    pub on_stop: Option<Rc<dyn Fn()>>,
}

/// Handed to a worker's entry point right after `fork`. `listener_fd` is
/// either a pre-bound socket inherited from the master (plain mode) or
/// `None` when `reuse_port` is set, in which case the worker binds its own
/// socket with `SO_REUSEPORT` instead of inheriting one.
pub struct WorkerContext {
    pub group_name: String,
    pub config: ListenerConfig,
    pub listener_fd: Option<RawFd>,
    pub codec: Option<Arc<dyn FrameCodec>>,
    pub tls_config: Option<Arc<rustls::ServerConfig>>,
    pub callbacks: Rc<Callbacks>,
    pub on_stop: Option<Rc<dyn Fn()>>,
}
