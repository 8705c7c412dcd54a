//! Spawning one worker process per accepted connection

use crate::config::Config;
use crate::env::ConnectionSetup;
use crate::error::SpawnError;
use std::ffi::{c_char, CString};
use std::io;
use std::os::fd::OwnedFd;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use tokio::net::UnixStream;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::debug;

/// Exit code of a worker whose program could not be executed
pub const EXEC_FAILED_EXIT: i32 = 127;

/// Termination notice for one worker, sent exactly once by its reaper task
#[derive(Debug)]
pub struct WorkerExit {
    pub pid: u32,
    pub status: io::Result<ExitStatus>,
}

/// Sending half of the controller's exit queue
pub type ExitSender = mpsc::UnboundedSender<WorkerExit>;

/// Starts workers wired to accepted connections
pub struct Spawner {
    config: Arc<Config>,
    setup: Arc<dyn ConnectionSetup>,
}

impl Spawner {
    pub fn new(config: Arc<Config>, setup: Arc<dyn ConnectionSetup>) -> Self {
        Self { config, setup }
    }

    /// Spawn a worker owning `conn` as its stdin and stdout.
    ///
    /// The child writes the banner, if any, once its stdio is in place and
    /// then executes the program itself. A program that cannot be executed
    /// is reported on stderr by the child, which exits with
    /// [`EXEC_FAILED_EXIT`]; to the caller that is a worker like any other.
    /// Only failures before the child exists are returned as errors.
    ///
    /// The parent's copies of the connection are closed before this returns,
    /// whatever the outcome. On success a reaper task is started that reports
    /// the worker's exit on `exits`.
    pub fn spawn(&self, conn: UnixStream, exits: &ExitSender) -> Result<u32, SpawnError> {
        let spawn_error = |source| SpawnError::Spawn {
            program: self.config.program().to_string(),
            source,
        };
        let image = ExecImage::new(&self.config.command).map_err(spawn_error)?;

        let mut cmd = Command::new(self.config.program());
        cmd.args(self.config.program_args());
        self.setup.prepare(&conn, &self.config.socket_path, &mut cmd);

        let (stdin, stdout) = into_stdio(conn).map_err(SpawnError::Descriptor)?;
        cmd.stdin(stdin);
        cmd.stdout(stdout);
        cmd.stderr(Stdio::inherit());

        let banner = self.config.banner.clone();
        // SAFETY: the hook only calls write(2), execvp(3) and _exit(2) on
        // memory prepared before the fork, and does not allocate
        unsafe {
            cmd.pre_exec(move || {
                if let Some(banner) = &banner {
                    write_banner(banner);
                }
                image.exec()
            });
        }

        let result = cmd.spawn();
        // Closes the parent's copies of the connection descriptor
        drop(cmd);

        let child = result.map_err(spawn_error)?;
        let pid = child.id().unwrap_or(0);
        debug!(pid, program = %self.config.program(), "Worker spawned");

        tokio::spawn(reap(child, pid, exits.clone()));
        Ok(pid)
    }
}

/// Program, argument vector and failure message, built before the fork so
/// the child only has to read them.
struct ExecImage {
    program: CString,
    _args: Vec<CString>,
    argv: Vec<*const c_char>,
    failure: Vec<u8>,
}

// SAFETY: `argv` only points into the heap buffers of `_args`, which the
// image owns and never mutates
unsafe impl Send for ExecImage {}
unsafe impl Sync for ExecImage {}

impl ExecImage {
    fn new(command: &[String]) -> io::Result<Self> {
        let args = command
            .iter()
            .map(|arg| CString::new(arg.as_bytes()))
            .collect::<Result<Vec<_>, _>>()?;
        let program = args
            .first()
            .cloned()
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "empty command"))?;
        let mut argv: Vec<*const c_char> = args.iter().map(|arg| arg.as_ptr()).collect();
        argv.push(std::ptr::null());
        let failure = format!("sockspawn: exec {}: os error ", command[0]).into_bytes();

        Ok(Self {
            program,
            _args: args,
            argv,
            failure,
        })
    }

    /// Replace the process image. Runs in the child between fork and exec
    /// and never returns: on failure the child reports the error on stderr
    /// and exits.
    fn exec(&self) -> ! {
        // SAFETY: `program` and `argv` are NUL-terminated and outlive the call
        unsafe {
            libc::execvp(self.program.as_ptr(), self.argv.as_ptr());
        }
        let errno = io::Error::last_os_error().raw_os_error().unwrap_or(0);

        write_all(libc::STDERR_FILENO, &self.failure);
        let mut digits = [0u8; 12];
        write_all(libc::STDERR_FILENO, format_decimal(errno, &mut digits));
        write_all(libc::STDERR_FILENO, b"\n");

        // SAFETY: _exit(2) skips atexit handlers inherited from the parent
        unsafe { libc::_exit(EXEC_FAILED_EXIT) }
    }
}

/// Format a non-negative `n` into the tail of `buf` without allocating
fn format_decimal(n: i32, buf: &mut [u8; 12]) -> &[u8] {
    let mut n = n.unsigned_abs();
    let mut start = buf.len();
    loop {
        start -= 1;
        buf[start] = b'0' + (n % 10) as u8;
        n /= 10;
        if n == 0 {
            break;
        }
    }
    &buf[start..]
}

/// Two blocking descriptors for the same connection, for stdin and stdout
fn into_stdio(conn: UnixStream) -> io::Result<(Stdio, Stdio)> {
    let stream = conn.into_std()?;
    // The worker expects ordinary blocking I/O
    stream.set_nonblocking(false)?;
    let input: OwnedFd = stream.into();
    let output = input.try_clone()?;
    Ok((Stdio::from(input), Stdio::from(output)))
}

/// Write the whole banner to stdout. Runs in the child between fork and exec.
///
/// The peer may already be gone; the program finds out on its own.
fn write_banner(banner: &[u8]) {
    write_all(libc::STDOUT_FILENO, banner);
}

/// write(2) until `bytes` is out or the descriptor fails
fn write_all(fd: libc::c_int, bytes: &[u8]) {
    let mut rest = bytes;
    while !rest.is_empty() {
        // SAFETY: `rest` is a valid slice for the duration of the call
        let n = unsafe { libc::write(fd, rest.as_ptr().cast(), rest.len()) };
        if n < 0 {
            if io::Error::last_os_error().kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return;
        }
        rest = &rest[n as usize..];
    }
}

async fn reap(mut child: Child, pid: u32, exits: ExitSender) {
    let status = child.wait().await;
    // The controller owns the receiver for its whole lifetime; a send error
    // only happens during shutdown
    let _ = exits.send(WorkerExit { pid, status });
}
