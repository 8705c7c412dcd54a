//! Error types for listener setup, worker spawning and the admission loop

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Fatal errors raised while preparing the listening socket.
///
/// Every variant aborts startup; nothing here is retried.
#[derive(Debug, Error)]
pub enum SetupError {
    /// Creating or binding the socket failed
    #[error("bind {}: {source}", .path.display())]
    Bind { path: PathBuf, source: io::Error },

    /// Switching the socket to listening mode failed
    #[error("listen (backlog {backlog}): {source}")]
    Listen { backlog: u32, source: io::Error },

    /// Dropping the group id failed
    #[error("setgid {gid}: {source}")]
    SetGid { gid: u32, source: io::Error },

    /// Dropping the user id failed
    #[error("setuid {uid}: {source}")]
    SetUid { uid: u32, source: io::Error },
}

/// Failure to start a worker for an accepted connection.
///
/// Recoverable: the controller rolls back its accounting and keeps serving.
#[derive(Debug, Error)]
pub enum SpawnError {
    /// The connection could not be turned into the worker's stdio
    #[error("connection descriptor: {0}")]
    Descriptor(#[source] io::Error),

    /// The OS refused to start the program
    #[error("spawn {program}: {source}")]
    Spawn { program: String, source: io::Error },
}

/// Fatal errors raised by the admission loop after startup.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Waiting for a worker failed while the controller was saturated
    #[error("wait: {0}")]
    Wait(#[source] io::Error),
}

/// Invalid admission parameters
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", .path.display())]
    Read { path: PathBuf, source: io::Error },

    #[error("failed to parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("invalid command line {command:?}: {reason}")]
    Command { command: String, reason: String },

    #[error("{0} not found in environment")]
    MissingEnv(&'static str),

    #[error("invalid {name} number: {value:?}")]
    InvalidId { name: &'static str, value: String },

    #[error("configuration errors:\n  - {}", .0.join("\n  - "))]
    Invalid(Vec<String>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_setup_error_names_the_failing_call() {
        let err = SetupError::SetUid {
            uid: 4242,
            source: io::Error::from_raw_os_error(libc::EPERM),
        };
        assert!(err.to_string().starts_with("setuid 4242: "));

        let err = SetupError::Bind {
            path: PathBuf::from("/tmp/x.sock"),
            source: io::Error::from(io::ErrorKind::AddrInUse),
        };
        assert!(err.to_string().starts_with("bind /tmp/x.sock: "));
    }

    #[test]
    fn test_invalid_config_lists_every_problem() {
        let err = ConfigError::Invalid(vec!["a".to_string(), "b".to_string()]);
        assert_eq!(err.to_string(), "configuration errors:\n  - a\n  - b");
    }

    #[test]
    fn test_wait_error_names_the_cause_once() {
        let err = ControllerError::Wait(io::Error::from_raw_os_error(libc::ECHILD));
        let rendered = anyhow::Error::from(err).to_string();
        assert!(rendered.starts_with("wait: "));
        assert_eq!(rendered.matches("(os error").count(), 1);
    }
}
