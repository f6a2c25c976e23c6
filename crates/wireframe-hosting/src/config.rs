//! Loads a listener list from a YAML or TOML file (spec.md §6 "Configuration
//! knobs"), mirroring the teacher's `configuration::source::ConfigSource`
//! pattern trimmed to a single file-backed implementation — no hot-reload
//! event bus, since config hot reload is out of scope (reload here means
//! *worker* reload, not config reload).

use std::path::Path;

use serde::Deserialize;
use wireframe_core::config::ListenerConfig;
use wireframe_core::error::{CoreError, ErrorKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum ConfigFormat {
    Yaml,
    Toml,
}

impl ConfigFormat {
    fn from_path(path: &Path) -> Result<Self, CoreError> {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("yaml") | Some("yml") => Ok(Self::Yaml),
            Some("toml") => Ok(Self::Toml),
            other => Err(CoreError::new(
                ErrorKind::Uncaught,
                format!("unsupported config extension {other:?}, expected .yaml/.yml/.toml"),
            )),
        }
    }
}

/// The on-disk shape: a bare `listeners:` list, one entry per configured
/// group.
#[derive(Deserialize)]
struct ConfigFile {
    listeners: Vec<ListenerConfig>,
}

pub fn load_listener_configs(path: &Path) -> Result<Vec<ListenerConfig>, CoreError> {
    let format = ConfigFormat::from_path(path)?;
    let contents = std::fs::read_to_string(path)
        .map_err(|err| wireframe_core::error::map_io_error(ErrorKind::Uncaught, err))?;
    let parsed: ConfigFile = match format {
        ConfigFormat::Yaml => serde_yaml::from_str(&contents)
            .map_err(|err| CoreError::new(ErrorKind::Uncaught, err.to_string()))?,
        ConfigFormat::Toml => toml::from_str(&contents)
            .map_err(|err| CoreError::new(ErrorKind::Uncaught, err.to_string()))?,
    };
    if parsed.listeners.is_empty() {
        return Err(CoreError::new(
            ErrorKind::Uncaught,
            "config file declares no listeners",
        ));
    }
    Ok(parsed.listeners)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_temp(name: &str, contents: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("{name}-{}", std::process::id()));
        std::fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn loads_yaml_listener_list() {
        let path = write_temp(
            "wireframe-hosting-test.yaml",
            "listeners:\n  - name: echo\n    listen: \"tcp://127.0.0.1:9000\"\n",
        );
        let configs = load_listener_configs(&path).unwrap();
        assert_eq!(configs.len(), 1);
        assert_eq!(configs[0].name, "echo");
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn loads_toml_listener_list() {
        let path = write_temp(
            "wireframe-hosting-test.toml",
            "[[listeners]]\nname = \"echo\"\nlisten = \"tcp://127.0.0.1:9000\"\ncount = 2\n",
        );
        let configs = load_listener_configs(&path).unwrap();
        assert_eq!(configs[0].count, 2);
        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn rejects_unknown_extension() {
        let path = std::path::Path::new("/tmp/wireframe.conf");
        assert!(load_listener_configs(path).is_err());
    }

    #[test]
    fn rejects_empty_listener_list() {
        let path = write_temp("wireframe-hosting-test-empty.yaml", "listeners: []\n");
        assert!(load_listener_configs(&path).is_err());
        std::fs::remove_file(&path).unwrap();
    }
}
