use serde::Deserialize;

fn default_stop_timeout() -> u64 {
    2
}

fn default_max_package_size() -> usize {
    10 * 1024 * 1024
}

fn default_max_send_buffer_size() -> usize {
    1024 * 1024
}

fn default_reloadable() -> bool {
    true
}

fn default_worker_count() -> usize {
    1
}

fn default_max_connections() -> usize {
    10_000
}

/// The event-loop backend a listener's workers should run. Selects among
/// the families spec.md §4.1 describes; `Select`/`Ev`/`Event` all resolve
/// to the readiness-polling family, `Uv` to the reactor family, `Coroutine`
/// to the fiber family, and `Tracing` wraps whichever backend
/// `EVENT_LOOP_DRIVER` otherwise selects in the opt-in diagnostic decorator.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventLoopKind {
    #[default]
    Select,
    Ev,
    Event,
    Uv,
    Coroutine,
    Tracing,
}

/// Configuration knobs for a single listener, per spec.md §6. Wire field
/// names are camelCase (`reusePort`, `stopTimeout`, ...) to match the
/// naming spec.md uses; Rust-side fields stay snake_case.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListenerConfig {
    pub name: String,
    #[serde(default = "default_worker_count")]
    pub count: usize,
    pub user: Option<String>,
    pub group: Option<String>,
    #[serde(default)]
    pub reuse_port: bool,
    pub listen: String,
    pub protocol: Option<String>,
    pub handler: Option<String>,
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout: u64,
    #[serde(default = "default_reloadable")]
    pub reloadable: bool,
    #[serde(default = "default_max_package_size")]
    pub max_package_size: usize,
    #[serde(default = "default_max_send_buffer_size")]
    pub max_send_buffer_size: usize,
    /// Per-worker cap on simultaneously open connections for this
    /// listener; not a named knob in spec.md §6 but required by the
    /// accept-loop's backpressure behavior (spec.md §4.2).
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    pub pid_file: Option<String>,
    pub status_file: Option<String>,
    pub log_file: Option<String>,
    pub stdout_file: Option<String>,
    #[serde(default)]
    pub event_loop: EventLoopKind,
}

impl ListenerConfig {
    /// How many workers in this group may be mid-restart at once during a
    /// rolling `SIGUSR1` reload. `reloadable` only gates whether this group
    /// takes part at all; the concurrency bound itself isn't a named knob,
    /// so half the group (rounded up) restarts at a time, leaving the rest
    /// serving traffic.
    pub fn reload_concurrency(&self) -> usize {
        if !self.reloadable {
            return 0;
        }
        self.count.div_ceil(2).max(1)
    }

    /// A config suitable for tests and for programmatic construction,
    /// skipping the serde file-loading path.
    pub fn new(name: impl Into<String>, listen: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            count: default_worker_count(),
            user: None,
            group: None,
            reuse_port: false,
            listen: listen.into(),
            protocol: None,
            handler: None,
            stop_timeout: default_stop_timeout(),
            reloadable: default_reloadable(),
            max_package_size: default_max_package_size(),
            max_send_buffer_size: default_max_send_buffer_size(),
            max_connections: default_max_connections(),
            pid_file: None,
            status_file: None,
            log_file: None,
            stdout_file: None,
            event_loop: EventLoopKind::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_spec() {
        let cfg = ListenerConfig::new("echo", "tcp://127.0.0.1:0");
        assert_eq!(cfg.stop_timeout, 2);
        assert_eq!(cfg.max_package_size, 10 * 1024 * 1024);
        assert_eq!(cfg.max_send_buffer_size, 1024 * 1024);
        assert!(cfg.reloadable);
        assert_eq!(cfg.event_loop, EventLoopKind::Select);
    }

    #[test]
    fn deserializes_from_yaml() {
        let yaml = r#"
name: echo
listen: "tcp://0.0.0.0:9000"
count: 4
reusePort: true
eventLoop: coroutine
maxPackageSize: 2048
"#;
        let cfg: ListenerConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(cfg.name, "echo");
        assert_eq!(cfg.count, 4);
        assert!(cfg.reuse_port);
        assert_eq!(cfg.event_loop, EventLoopKind::Coroutine);
        assert_eq!(cfg.max_package_size, 2048);
        // Fields left unset still fall back to their spec.md defaults.
        assert_eq!(cfg.stop_timeout, default_stop_timeout());
    }
}
