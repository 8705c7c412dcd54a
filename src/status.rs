//! Line-oriented status output.
//!
//! Status lines are part of the user-visible interface and always go to the
//! status sink (stdout by default) in a fixed format. Diagnostics go through
//! `tracing` instead.

use parking_lot::Mutex;
use std::io::{self, Write};
use std::process::ExitStatus;

/// Prefix on every status line
pub const STATUS_PREFIX: &str = "sockspawn";

/// Writes status lines when enabled, discards them otherwise
pub struct StatusLog {
    enabled: bool,
    out: Mutex<Box<dyn Write + Send>>,
}

impl StatusLog {
    /// Status log on stdout
    pub fn stdout(enabled: bool) -> Self {
        Self::with_writer(enabled, io::stdout())
    }

    pub fn with_writer(enabled: bool, out: impl Write + Send + 'static) -> Self {
        Self {
            enabled,
            out: Mutex::new(Box::new(out)),
        }
    }

    /// `<live>/<ceiling>` after every change of the live count
    pub fn live(&self, live: usize, ceiling: usize) {
        self.line(format_args!("status: {}/{}", live, ceiling));
    }

    pub fn started(&self, pid: u32) {
        self.line(format_args!("pid {}", pid));
    }

    pub fn ended(&self, pid: u32, status: ExitStatus) {
        self.line(format_args!("end {} status {}", pid, raw_status(status)));
    }

    fn line(&self, args: std::fmt::Arguments<'_>) {
        if !self.enabled {
            return;
        }
        let mut out = self.out.lock();
        // A closed stdout must not take the server down
        let _ = writeln!(out, "{}: {}", STATUS_PREFIX, args).and_then(|_| out.flush());
    }
}

/// Raw wait status, the value `waitpid` reports
fn raw_status(status: ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status.into_raw()
}

/// Shared in-memory sink, for capturing status output in tests
#[cfg(test)]
#[derive(Clone, Default)]
pub(crate) struct SharedBuffer(std::sync::Arc<Mutex<Vec<u8>>>);

#[cfg(test)]
impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contents(&self) -> String {
        String::from_utf8_lossy(&self.0.lock()).into_owned()
    }

    pub fn lines(&self) -> Vec<String> {
        self.contents().lines().map(str::to_string).collect()
    }
}

#[cfg(test)]
impl Write for SharedBuffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;

    #[test]
    fn test_status_line_formats() {
        let buf = SharedBuffer::new();
        let log = StatusLog::with_writer(true, buf.clone());

        log.live(3, 10);
        log.started(4242);
        log.ended(4242, ExitStatus::from_raw(256));

        assert_eq!(
            buf.lines(),
            vec![
                "sockspawn: status: 3/10",
                "sockspawn: pid 4242",
                "sockspawn: end 4242 status 256",
            ]
        );
    }

    #[test]
    fn test_disabled_log_writes_nothing() {
        let buf = SharedBuffer::new();
        let log = StatusLog::with_writer(false, buf.clone());

        log.live(1, 1);
        log.started(1);
        log.ended(1, ExitStatus::from_raw(0));

        assert!(buf.contents().is_empty());
    }
}
