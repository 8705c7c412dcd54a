//! Command line parsing for the `sockspawn` binary

use crate::config::{Config, FileConfig, Verbosity};
use crate::error::ConfigError;
use clap::{CommandFactory, FromArgMatches, Parser};
use std::ffi::OsString;
use std::path::PathBuf;

/// Command line arguments.
///
/// Everything after SOCKET is the program and its arguments, passed through
/// unmodified. When several verbosity, delete or identity flags are given,
/// the last one wins.
#[derive(Parser, Debug, Clone, Default)]
#[command(
    name = "sockspawn",
    version,
    about = "Accept connections on a Unix socket and run a program for each one",
    args_override_self = true
)]
pub struct CliArgs {
    /// Quiet. Do not print any messages.
    #[arg(short = 'q', overrides_with_all = ["errors_only", "verbose"])]
    pub quiet: bool,

    /// Print error messages only.
    #[arg(short = 'Q', overrides_with_all = ["quiet", "verbose"])]
    pub errors_only: bool,

    /// Verbose. Print error and status messages (default).
    #[arg(short = 'v', overrides_with_all = ["quiet", "errors_only"])]
    pub verbose: bool,

    /// Do not delete the socket file on exit.
    #[arg(short = 'd', overrides_with = "delete_socket")]
    pub keep_socket: bool,

    /// Delete the socket file on exit (default).
    #[arg(short = 'D', overrides_with = "keep_socket")]
    pub delete_socket: bool,

    /// Change user id to UID after creating the socket.
    #[arg(short = 'u', value_name = "UID")]
    pub uid: Option<u32>,

    /// Change group id to GID after creating the socket.
    #[arg(short = 'g', value_name = "GID")]
    pub gid: Option<u32>,

    /// Same as '-u $UID -g $GID'.
    #[arg(short = 'U')]
    pub env_ids: bool,

    /// Where the identity flags last appeared on the command line
    #[arg(skip)]
    pub id_order: IdOrder,

    /// Do not handle more than N simultaneous connections (default 10).
    #[arg(short = 'c', value_name = "N")]
    pub max_connections: Option<usize>,

    /// Allow a backlog of N connections (default 128).
    #[arg(short = 'b', value_name = "N")]
    pub backlog: Option<u32>,

    /// Write BANNER to the client immediately after connecting.
    #[arg(short = 'B', value_name = "BANNER")]
    pub banner: Option<String>,

    /// Read defaults from a TOML file; command line flags take precedence.
    #[arg(short = 'f', long = "config", value_name = "FILE")]
    pub config: Option<PathBuf>,

    /// Path of the listening socket.
    #[arg(value_name = "SOCKET")]
    pub socket: Option<PathBuf>,

    /// Program to run for each connection, followed by its arguments.
    #[arg(
        value_name = "PROGRAM",
        trailing_var_arg = true,
        allow_hyphen_values = true
    )]
    pub command: Vec<String>,
}

/// Positions of the last `-u`, `-g` and `-U` on the command line
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IdOrder {
    pub uid: Option<usize>,
    pub gid: Option<usize>,
    pub env_ids: Option<usize>,
}

impl IdOrder {
    /// Whether `-U` decides the id set by the flag at `explicit`
    fn env_wins(&self, explicit: Option<usize>) -> bool {
        match (self.env_ids, explicit) {
            (Some(env), Some(explicit)) => env > explicit,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }
}

impl CliArgs {
    /// Parse arguments, recording where the identity flags appeared so that
    /// `-u`/`-g` and `-U` can override each other by position.
    pub fn try_parse_args_from<I, T>(args: I) -> Result<Self, clap::Error>
    where
        I: IntoIterator<Item = T>,
        T: Into<OsString> + Clone,
    {
        let matches = Self::command().try_get_matches_from(args)?;
        let mut parsed = Self::from_arg_matches(&matches)?;
        let last = |id: &str| matches.indices_of(id).and_then(|indices| indices.max());
        parsed.id_order = IdOrder {
            uid: last("uid"),
            gid: last("gid"),
            env_ids: last("env_ids"),
        };
        Ok(parsed)
    }

    fn verbosity(&self) -> Option<Verbosity> {
        if self.quiet {
            Some(Verbosity::Quiet)
        } else if self.errors_only {
            Some(Verbosity::Errors)
        } else if self.verbose {
            Some(Verbosity::Verbose)
        } else {
            None
        }
    }

    fn delete_on_exit(&self) -> Option<bool> {
        if self.keep_socket {
            Some(false)
        } else if self.delete_socket {
            Some(true)
        } else {
            None
        }
    }

    /// Resolve the final configuration, reading `-U` ids through `env`.
    pub fn resolve<F>(self, env: F) -> Result<Config, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let file = match &self.config {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default(),
        };

        let (env_uid, env_gid) = if self.env_ids {
            (
                Some(id_from_env(&env, "UID")?),
                Some(id_from_env(&env, "GID")?),
            )
        } else {
            (None, None)
        };

        let command = if self.command.is_empty() {
            match file.command.clone() {
                Some(spec) => spec.into_argv()?,
                None => Vec::new(),
            }
        } else {
            self.command.clone()
        };

        let socket_path = self.socket.clone().or(file.socket).unwrap_or_default();

        let mut config = Config::new(socket_path, command);
        if let Some(n) = self.max_connections.or(file.max_connections) {
            config.max_connections = n;
        }
        if let Some(n) = self.backlog.or(file.backlog) {
            config.backlog = n;
        }
        config.uid = if self.id_order.env_wins(self.id_order.uid) {
            env_uid
        } else {
            self.uid.or(env_uid)
        }
        .or(file.uid);
        config.gid = if self.id_order.env_wins(self.id_order.gid) {
            env_gid
        } else {
            self.gid.or(env_gid)
        }
        .or(file.gid);
        config.banner = self
            .banner
            .clone()
            .or(file.banner)
            .map(String::into_bytes);
        if let Some(verbosity) = self.verbosity().or(file.verbosity) {
            config.verbosity = verbosity;
        }
        if let Some(delete) = self.delete_on_exit().or(file.delete_on_exit) {
            config.delete_on_exit = delete;
        }

        config.validate()?;
        Ok(config)
    }
}

impl TryFrom<CliArgs> for Config {
    type Error = ConfigError;

    fn try_from(args: CliArgs) -> Result<Self, Self::Error> {
        args.resolve(|key| std::env::var(key).ok())
    }
}

fn id_from_env<F>(env: &F, name: &'static str) -> Result<u32, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let value = env(name).ok_or(ConfigError::MissingEnv(name))?;
    let parsed = value.trim().parse::<u32>();
    parsed.map_err(|_| ConfigError::InvalidId { name, value })
}
