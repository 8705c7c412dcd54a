//! Process signal handling

use std::io;
use tokio::signal::unix::{signal, Signal, SignalKind};
use tracing::debug;

/// Signal streams the server listens to.
///
/// SIGINT, SIGTERM and SIGQUIT request shutdown. SIGHUP and SIGALRM are
/// swallowed so they cannot terminate the server. Handlers are reset on exec,
/// so workers see default dispositions.
pub struct Signals {
    interrupt: Signal,
    terminate: Signal,
    quit: Signal,
    hangup: Signal,
    alarm: Signal,
}

impl Signals {
    /// Install the handlers. Must be called from within a tokio runtime.
    pub fn install() -> io::Result<Self> {
        Ok(Self {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
            quit: signal(SignalKind::quit())?,
            hangup: signal(SignalKind::hangup())?,
            alarm: signal(SignalKind::alarm())?,
        })
    }

    /// Wait for a shutdown request and return the signal's name
    pub async fn shutdown(&mut self) -> &'static str {
        loop {
            tokio::select! {
                _ = self.interrupt.recv() => return "SIGINT",
                _ = self.terminate.recv() => return "SIGTERM",
                _ = self.quit.recv() => return "SIGQUIT",
                _ = self.hangup.recv() => debug!("Ignoring SIGHUP"),
                _ = self.alarm.recv() => debug!("Ignoring SIGALRM"),
            }
        }
    }
}
