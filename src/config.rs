use crate::error::ConfigError;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// How much the server prints
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Verbosity {
    /// Print nothing, not even errors
    Quiet,
    /// Print error messages only
    Errors,
    /// Print errors and status lines
    #[default]
    Verbose,
}

impl Verbosity {
    /// Default `tracing` filter directive for this level
    pub fn filter_directive(self) -> &'static str {
        match self {
            Verbosity::Quiet => "off",
            Verbosity::Errors => "warn",
            Verbosity::Verbose => "info",
        }
    }

    pub fn status_enabled(self) -> bool {
        self == Verbosity::Verbose
    }
}

/// Program and arguments run for each connection.
///
/// Accepts either a shell-style string or an explicit array in TOML.
#[derive(Debug, Deserialize, Clone, PartialEq)]
#[serde(untagged)]
pub enum CommandSpec {
    Line(String),
    Argv(Vec<String>),
}

impl CommandSpec {
    pub fn into_argv(self) -> Result<Vec<String>, ConfigError> {
        match self {
            CommandSpec::Argv(argv) => Ok(argv),
            CommandSpec::Line(line) => {
                shell_words::split(&line).map_err(|e| ConfigError::Command {
                    command: line.clone(),
                    reason: e.to_string(),
                })
            }
        }
    }
}

/// Optional settings file; every field falls back to the built-in default
#[derive(Debug, Deserialize, Clone, Default)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    pub socket: Option<PathBuf>,
    pub command: Option<CommandSpec>,
    pub max_connections: Option<usize>,
    pub backlog: Option<u32>,
    pub uid: Option<u32>,
    pub gid: Option<u32>,
    pub banner: Option<String>,
    pub verbosity: Option<Verbosity>,
    pub delete_on_exit: Option<bool>,
}

impl FileConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }
}

/// Admission parameters, fixed at startup and shared read-only afterwards
#[derive(Debug, Clone)]
pub struct Config {
    /// Filesystem path of the listening socket
    pub socket_path: PathBuf,

    /// Program followed by its arguments, passed through unmodified
    pub command: Vec<String>,

    /// Maximum number of simultaneously live workers (default: 10)
    pub max_connections: usize,

    /// Listen backlog (default: 128)
    pub backlog: u32,

    /// User id assumed after the socket is bound
    pub uid: Option<u32>,

    /// Group id assumed after the socket is bound
    pub gid: Option<u32>,

    /// Bytes written to each client before the program starts
    pub banner: Option<Vec<u8>>,

    pub verbosity: Verbosity,

    /// Remove the socket file on clean shutdown (default: true)
    pub delete_on_exit: bool,
}

impl Config {
    /// Build a config with defaults for everything but the socket and command
    pub fn new(socket_path: impl Into<PathBuf>, command: Vec<String>) -> Self {
        Self {
            socket_path: socket_path.into(),
            command,
            max_connections: default_max_connections(),
            backlog: default_backlog(),
            uid: None,
            gid: None,
            banner: None,
            verbosity: Verbosity::default(),
            delete_on_exit: true,
        }
    }

    /// Set the worker ceiling (builder pattern)
    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    /// Set the banner (builder pattern)
    pub fn with_banner(mut self, banner: impl Into<Vec<u8>>) -> Self {
        self.banner = Some(banner.into());
        self
    }

    pub fn with_delete_on_exit(mut self, delete_on_exit: bool) -> Self {
        self.delete_on_exit = delete_on_exit;
        self
    }

    pub fn with_identity(mut self, uid: Option<u32>, gid: Option<u32>) -> Self {
        self.uid = uid;
        self.gid = gid;
        self
    }

    /// Name of the program run for each connection
    pub fn program(&self) -> &str {
        self.command.first().map(String::as_str).unwrap_or_default()
    }

    pub fn program_args(&self) -> &[String] {
        self.command.get(1..).unwrap_or_default()
    }

    /// Validate all configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.socket_path.as_os_str().is_empty() {
            errors.push("socket path must not be empty".to_string());
        }
        if self.command.is_empty() || self.program().is_empty() {
            errors.push("a program to run is required".to_string());
        }
        if self.command.iter().any(|arg| arg.contains('\0')) {
            errors.push("program and arguments must not contain NUL bytes".to_string());
        }
        if self.max_connections == 0 {
            errors.push("connection limit must be greater than 0".to_string());
        }
        if self.backlog == 0 {
            errors.push("backlog must be greater than 0".to_string());
        }

        if !errors.is_empty() {
            return Err(ConfigError::Invalid(errors));
        }
        Ok(())
    }
}

fn default_max_connections() -> usize {
    10
}

fn default_backlog() -> u32 {
    128
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::new("/tmp/s.sock", vec!["cat".to_string()]);
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.backlog, 128);
        assert_eq!(config.verbosity, Verbosity::Verbose);
        assert!(config.delete_on_exit);
        assert!(config.banner.is_none());
        assert!(config.uid.is_none() && config.gid.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_program_and_args() {
        let config = Config::new(
            "/tmp/s.sock",
            vec!["sh".to_string(), "-c".to_string(), "echo hi".to_string()],
        );
        assert_eq!(config.program(), "sh");
        assert_eq!(config.program_args(), ["-c", "echo hi"]);
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let mut config = Config::new("", Vec::new()).with_max_connections(0);
        config.backlog = 0;

        match config.validate() {
            Err(ConfigError::Invalid(errors)) => assert_eq!(errors.len(), 4),
            other => panic!("expected validation errors, got {:?}", other),
        }
    }

    #[test]
    fn test_nul_in_command_rejected() {
        let config = Config::new("/tmp/s.sock", vec!["cat".into(), "a\0b".into()]);
        match config.validate() {
            Err(ConfigError::Invalid(errors)) => {
                assert_eq!(errors, ["program and arguments must not contain NUL bytes"])
            }
            other => panic!("expected validation errors, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_file_config() {
        let toml = r#"
socket = "/run/echo.sock"
command = "cat -n"
max_connections = 4
backlog = 16
uid = 1000
gid = 100
banner = "hello\n"
verbosity = "errors"
delete_on_exit = false
"#;
        let file = FileConfig::parse(toml).unwrap();
        assert_eq!(file.socket, Some(PathBuf::from("/run/echo.sock")));
        assert_eq!(
            file.command.clone().unwrap().into_argv().unwrap(),
            vec!["cat", "-n"]
        );
        assert_eq!(file.max_connections, Some(4));
        assert_eq!(file.backlog, Some(16));
        assert_eq!(file.uid, Some(1000));
        assert_eq!(file.gid, Some(100));
        assert_eq!(file.banner.as_deref(), Some("hello\n"));
        assert_eq!(file.verbosity, Some(Verbosity::Errors));
        assert_eq!(file.delete_on_exit, Some(false));
    }

    #[test]
    fn test_command_array() {
        let file = FileConfig::parse(r#"command = ["sh", "-c", "echo a b"]"#).unwrap();
        assert_eq!(
            file.command.unwrap().into_argv().unwrap(),
            vec!["sh", "-c", "echo a b"]
        );
    }

    #[test]
    fn test_command_line_with_unbalanced_quote() {
        let spec = CommandSpec::Line("sh -c 'oops".to_string());
        assert!(matches!(spec.into_argv(), Err(ConfigError::Command { .. })));
    }

    #[test]
    fn test_unknown_key_rejected() {
        assert!(FileConfig::parse("port = 80").is_err());
    }

    #[test]
    fn test_empty_file_config() {
        let file = FileConfig::parse("").unwrap();
        assert!(file.socket.is_none());
        assert!(file.command.is_none());
    }

    #[test]
    fn test_verbosity_levels() {
        assert_eq!(Verbosity::Quiet.filter_directive(), "off");
        assert_eq!(Verbosity::Errors.filter_directive(), "warn");
        assert_eq!(Verbosity::Verbose.filter_directive(), "info");
        assert!(Verbosity::Verbose.status_enabled());
        assert!(!Verbosity::Errors.status_enabled());
        assert!(!Verbosity::Quiet.status_enabled());
    }
}
