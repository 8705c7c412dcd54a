//! Per-connection environment exported to each worker

use std::path::Path;
use tokio::net::UnixStream;
use tokio::process::Command;
use tracing::debug;

/// Prepares a worker's command for one accepted connection.
///
/// Runs in the controller before the worker is spawned, so it must not block.
pub trait ConnectionSetup: Send + Sync {
    fn prepare(&self, conn: &UnixStream, socket_path: &Path, cmd: &mut Command);
}

/// Exports the UCSPI variables describing a Unix-domain connection:
/// `PROTO`, `UNIXLOCALPATH`, `UNIXLOCALPID`, and the peer's
/// `UNIXREMOTEPID`, `UNIXREMOTEEUID`, `UNIXREMOTEEGID` when the kernel
/// reports peer credentials.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnixEnv;

impl UnixEnv {
    /// Variables for one connection, in the order they are set
    pub fn variables(conn: &UnixStream, socket_path: &Path) -> Vec<(&'static str, String)> {
        let mut vars = vec![
            ("PROTO", "UNIX".to_string()),
            ("UNIXLOCALPATH", socket_path.to_string_lossy().into_owned()),
            ("UNIXLOCALPID", std::process::id().to_string()),
        ];

        match conn.peer_cred() {
            Ok(cred) => {
                if let Some(pid) = cred.pid() {
                    vars.push(("UNIXREMOTEPID", pid.to_string()));
                }
                vars.push(("UNIXREMOTEEUID", cred.uid().to_string()));
                vars.push(("UNIXREMOTEEGID", cred.gid().to_string()));
            }
            Err(e) => {
                debug!(error = %e, "Peer credentials unavailable");
            }
        }

        vars
    }
}

impl ConnectionSetup for UnixEnv {
    fn prepare(&self, conn: &UnixStream, socket_path: &Path, cmd: &mut Command) {
        for (key, value) in Self::variables(conn, socket_path) {
            cmd.env(key, value);
        }
    }
}
