//! Listening socket setup and cleanup

use crate::config::Config;
use crate::error::SetupError;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::net::{UnixListener, UnixSocket};
use tracing::{debug, info, warn};

/// Filesystem path of the bound socket, removed at most once
#[derive(Debug)]
pub struct SocketPath {
    path: PathBuf,
    removed: AtomicBool,
}

impl SocketPath {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            removed: AtomicBool::new(false),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the socket file. Only the first call touches the filesystem;
    /// later calls return `false`.
    pub fn remove_once(&self) -> bool {
        if self.removed.swap(true, Ordering::SeqCst) {
            return false;
        }
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                debug!(path = %self.path.display(), "Socket file removed");
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                warn!(path = %self.path.display(), error = %e, "Failed to remove socket file");
            }
        }
        true
    }
}

/// A bound, listening endpoint, ready for the admission loop
pub struct Endpoint {
    listener: UnixListener,
    path: Arc<SocketPath>,
}

impl Endpoint {
    /// Bind and listen on the configured path, then drop identity.
    ///
    /// Must be called from within a tokio runtime. On failure the socket
    /// file, if it was created, is removed again.
    pub fn bind(config: &Config) -> Result<Self, SetupError> {
        let path = Arc::new(SocketPath::new(&config.socket_path));
        remove_stale(path.path());

        let result = listen(path.path(), config.backlog)
            .and_then(|listener| drop_identity(config.uid, config.gid).map(|()| listener));

        match result {
            Ok(listener) => {
                info!(
                    path = %path.path().display(),
                    backlog = config.backlog,
                    uid = ?config.uid,
                    gid = ?config.gid,
                    "Listening"
                );
                Ok(Self { listener, path })
            }
            Err(e) => {
                path.remove_once();
                Err(e)
            }
        }
    }

    pub fn listener(&self) -> &UnixListener {
        &self.listener
    }

    /// Shared handle to the socket path, for cleanup at shutdown
    pub fn socket_path(&self) -> Arc<SocketPath> {
        Arc::clone(&self.path)
    }
}

fn remove_stale(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => debug!(path = %path.display(), "Removed stale socket file"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        // bind reports the real problem
        Err(e) => warn!(path = %path.display(), error = %e, "Could not remove existing socket path"),
    }
}

fn listen(path: &Path, backlog: u32) -> Result<UnixListener, SetupError> {
    let bind_err = |source| SetupError::Bind {
        path: path.to_path_buf(),
        source,
    };
    let socket = UnixSocket::new_stream().map_err(bind_err)?;
    socket.bind(path).map_err(bind_err)?;
    socket
        .listen(backlog)
        .map_err(|source| SetupError::Listen { backlog, source })
}

/// Switch to the configured group, then user.
///
/// Group first: after `setuid` an unprivileged process can no longer change
/// its group.
pub fn drop_identity(uid: Option<u32>, gid: Option<u32>) -> Result<(), SetupError> {
    if let Some(gid) = gid {
        // SAFETY: setgid has no memory-safety preconditions
        if unsafe { libc::setgid(gid as libc::gid_t) } != 0 {
            return Err(SetupError::SetGid {
                gid,
                source: io::Error::last_os_error(),
            });
        }
    }
    if let Some(uid) = uid {
        // SAFETY: setuid has no memory-safety preconditions
        if unsafe { libc::setuid(uid as libc::uid_t) } != 0 {
            return Err(SetupError::SetUid {
                uid,
                source: io::Error::last_os_error(),
            });
        }
    }
    Ok(())
}
