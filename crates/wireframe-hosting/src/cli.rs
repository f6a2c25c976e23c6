//! A minimal subcommand dispatcher over `std::env::args` (spec.md §6 "CLI
//! surface", scoped as an external collaborator — deliberately not a
//! `clap` app, matching how thin the teacher keeps its own binaries).

use wireframe_core::error::{CoreError, ErrorKind};

/// One of the six subcommands spec.md §6 names.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// `start [-d]` — boot the master; `-d` daemonizes first.
    Start { daemonize: bool },
    /// `stop` — signal a running master to shut down and wait for it.
    Stop,
    /// `restart` — `stop` followed by `start`.
    Restart,
    /// `reload [-g <name>]` — rolling `SIGUSR1`, optionally scoped to one
    /// listener group.
    Reload { group: Option<String> },
    /// `status [-d]` — print the last status snapshot; `-d` requests a
    /// fresh one first.
    Status { dump: bool },
    /// `connections` — trigger and print a per-connection diagnostic dump.
    Connections,
}

pub fn parse_args(args: &[String]) -> Result<Command, CoreError> {
    let Some(verb) = args.first() else {
        return Err(usage_error());
    };

    match verb.as_str() {
        "start" => Ok(Command::Start {
            daemonize: args.iter().any(|a| a == "-d"),
        }),
        "stop" => Ok(Command::Stop),
        "restart" => Ok(Command::Restart),
        "reload" => {
            let group = args
                .iter()
                .position(|a| a == "-g")
                .and_then(|idx| args.get(idx + 1))
                .cloned();
            Ok(Command::Reload { group })
        }
        "status" => Ok(Command::Status {
            dump: args.iter().any(|a| a == "-d"),
        }),
        "connections" => Ok(Command::Connections),
        other => Err(CoreError::new(
            ErrorKind::Uncaught,
            format!("unknown subcommand {other:?}; expected start|stop|restart|reload|status|connections"),
        )),
    }
}

fn usage_error() -> CoreError {
    CoreError::new(
        ErrorKind::Uncaught,
        "usage: wireframe <start|stop|restart|reload|status|connections> [options]",
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(words: &[&str]) -> Vec<String> {
        words.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_start_with_daemonize_flag() {
        assert_eq!(
            parse_args(&args(&["start", "-d"])).unwrap(),
            Command::Start { daemonize: true }
        );
        assert_eq!(
            parse_args(&args(&["start"])).unwrap(),
            Command::Start { daemonize: false }
        );
    }

    #[test]
    fn parses_reload_group_flag() {
        assert_eq!(
            parse_args(&args(&["reload", "-g", "echo"])).unwrap(),
            Command::Reload {
                group: Some("echo".to_string())
            }
        );
        assert_eq!(
            parse_args(&args(&["reload"])).unwrap(),
            Command::Reload { group: None }
        );
    }

    #[test]
    fn rejects_unknown_subcommand() {
        assert!(parse_args(&args(&["frobnicate"])).is_err());
    }

    #[test]
    fn rejects_missing_subcommand() {
        assert!(parse_args(&args(&[])).is_err());
    }
}
