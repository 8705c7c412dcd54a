//! The accept / spawn / reap loop.
//!
//! The controller is a single task. While fewer than `max_connections`
//! workers are live it waits on the listener; at the ceiling it stops
//! accepting and waits for exactly one worker to exit before re-checking.
//! Pending connections stay in the kernel backlog meanwhile.
//!
//! Worker exits arrive on a single-consumer queue fed by one reaper task per
//! worker. Only this task reads the queue and only this task touches the
//! live count, so accounting updates never interleave.

use crate::config::Config;
use crate::env::ConnectionSetup;
use crate::error::ControllerError;
use crate::listener::Endpoint;
use crate::status::StatusLog;
use crate::worker::{ExitSender, Spawner, WorkerExit};
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Whether the controller takes new connections right now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Live count below the ceiling: waiting on accept
    Accepting,
    /// Live count at the ceiling: waiting for a worker to exit
    Draining,
}

/// Read-only view of the live count, for observers outside the controller
#[derive(Debug, Clone)]
pub struct LiveHandle(Arc<AtomicUsize>);

impl LiveHandle {
    pub fn get(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }
}

/// Number of spawned, not yet reaped workers
#[derive(Debug)]
struct LiveCount {
    live: Arc<AtomicUsize>,
    ceiling: usize,
}

impl LiveCount {
    fn new(ceiling: usize) -> Self {
        Self {
            live: Arc::new(AtomicUsize::new(0)),
            ceiling,
        }
    }

    fn get(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    fn admission(&self) -> Admission {
        if self.get() < self.ceiling {
            Admission::Accepting
        } else {
            Admission::Draining
        }
    }

    fn increment(&mut self) -> usize {
        self.live.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn decrement(&mut self) -> usize {
        let current = self.get();
        match current.checked_sub(1) {
            Some(next) => {
                self.live.store(next, Ordering::SeqCst);
                next
            }
            None => {
                error!("Worker exit with no live workers recorded");
                debug_assert!(false, "live count underflow");
                0
            }
        }
    }

    fn handle(&self) -> LiveHandle {
        LiveHandle(Arc::clone(&self.live))
    }
}

/// Admission and lifecycle controller for one listening endpoint
pub struct AdmissionController {
    endpoint: Endpoint,
    spawner: Spawner,
    live: LiveCount,
    status: Arc<StatusLog>,
    exits_tx: ExitSender,
    exits_rx: mpsc::UnboundedReceiver<WorkerExit>,
}

impl AdmissionController {
    pub fn new(
        endpoint: Endpoint,
        config: Arc<Config>,
        setup: Arc<dyn ConnectionSetup>,
        status: Arc<StatusLog>,
    ) -> Self {
        let (exits_tx, exits_rx) = mpsc::unbounded_channel();
        Self {
            endpoint,
            live: LiveCount::new(config.max_connections),
            spawner: Spawner::new(config, setup),
            status,
            exits_tx,
            exits_rx,
        }
    }

    pub fn live(&self) -> usize {
        self.live.get()
    }

    pub fn ceiling(&self) -> usize {
        self.live.ceiling
    }

    pub fn live_handle(&self) -> LiveHandle {
        self.live.handle()
    }

    pub fn admission(&self) -> Admission {
        self.live.admission()
    }

    /// Serve until `shutdown` resolves.
    ///
    /// Returns `Ok(())` on shutdown and an error only when waiting for a
    /// worker fails while saturated. Live workers are left running in both
    /// cases.
    pub async fn run<F>(&mut self, shutdown: F) -> Result<(), ControllerError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        info!(ceiling = self.ceiling(), "Admission controller started");
        self.report_live();

        loop {
            match self.admission() {
                Admission::Accepting => {
                    tokio::select! {
                        biased;
                        _ = &mut shutdown => break,
                        Some(exit) = self.exits_rx.recv() => {
                            self.reap_pending(exit);
                        }
                        accepted = self.endpoint.listener().accept() => match accepted {
                            Ok((conn, _)) => self.admit(conn),
                            // Nothing a healthy listener returns here is worth
                            // giving up on
                            Err(e) => debug!(error = %e, "Accept failed, retrying"),
                        },
                    }
                }
                Admission::Draining => {
                    tokio::select! {
                        biased;
                        _ = &mut shutdown => break,
                        // The controller holds a sender, so the queue never
                        // closes while it runs
                        Some(exit) = self.exits_rx.recv() => self.reap_one(exit)?,
                    }
                }
            }
        }

        info!(live = self.live(), "Admission controller stopped");
        Ok(())
    }

    /// Count a freshly accepted connection and start its worker, rolling the
    /// count back if the worker cannot be started.
    fn admit(&mut self, conn: UnixStream) {
        let live = self.live.increment();
        self.report_live();

        match self.spawner.spawn(conn, &self.exits_tx) {
            Ok(pid) => {
                debug!(pid, live, ceiling = self.ceiling(), "Worker started");
                self.status.started(pid);
            }
            Err(e) => {
                let live = self.live.decrement();
                error!(error = %e, live, "Failed to start worker");
                self.report_live();
            }
        }
    }

    /// Account for `first` and every other exit already queued.
    ///
    /// Used while accepting; returns the number of workers reaped.
    fn reap_pending(&mut self, first: WorkerExit) -> usize {
        self.record_exit(first);
        let mut reaped = 1;
        while let Ok(exit) = self.exits_rx.try_recv() {
            self.record_exit(exit);
            reaped += 1;
        }
        reaped
    }

    /// Account for exactly one exit while saturated.
    ///
    /// A failed wait is fatal here.
    fn reap_one(&mut self, exit: WorkerExit) -> Result<(), ControllerError> {
        match exit.status {
            Ok(status) => {
                let live = self.live.decrement();
                debug!(pid = exit.pid, ?status, live, "Worker exited");
                self.status.ended(exit.pid, status);
                self.report_live();
                Ok(())
            }
            Err(e) => Err(ControllerError::Wait(e)),
        }
    }

    fn record_exit(&mut self, exit: WorkerExit) {
        let live = self.live.decrement();
        match exit.status {
            Ok(status) => {
                debug!(pid = exit.pid, ?status, live, "Worker exited");
                self.status.ended(exit.pid, status);
            }
            Err(e) => {
                warn!(pid = exit.pid, error = %e, live, "Failed to collect worker exit status");
            }
        }
        self.report_live();
    }

    fn report_live(&self) {
        self.status.live(self.live(), self.ceiling());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::env::UnixEnv;
    use crate::status::SharedBuffer;
    use std::io;
    use std::os::unix::process::ExitStatusExt;
    use std::process::ExitStatus;
    use tempfile::TempDir;

    fn controller(command: &[&str], ceiling: usize) -> (AdmissionController, SharedBuffer, TempDir) {
        let dir = TempDir::new().unwrap();
        let config = Config::new(
            dir.path().join("s.sock"),
            command.iter().map(|s| s.to_string()).collect(),
        )
        .with_max_connections(ceiling);
        let endpoint = Endpoint::bind(&config).unwrap();
        let buf = SharedBuffer::new();
        let status = Arc::new(StatusLog::with_writer(true, buf.clone()));
        let controller =
            AdmissionController::new(endpoint, Arc::new(config), Arc::new(UnixEnv), status);
        (controller, buf, dir)
    }

    fn exited(pid: u32, code: i32) -> WorkerExit {
        WorkerExit {
            pid,
            status: Ok(ExitStatus::from_raw(code << 8)),
        }
    }

    #[test]
    fn test_live_count_admission() {
        let mut count = LiveCount::new(2);
        assert_eq!(count.admission(), Admission::Accepting);
        assert_eq!(count.increment(), 1);
        assert_eq!(count.admission(), Admission::Accepting);
        assert_eq!(count.increment(), 2);
        assert_eq!(count.admission(), Admission::Draining);
        assert_eq!(count.decrement(), 1);
        assert_eq!(count.admission(), Admission::Accepting);

        let handle = count.handle();
        assert_eq!(handle.get(), 1);
        count.decrement();
        assert_eq!(handle.get(), 0);
    }

    #[tokio::test]
    async fn test_spawn_failure_rolls_back() {
        let (mut controller, buf, _dir) = controller(&["cat", "nul\0byte"], 1);
        let (server, _client) = UnixStream::pair().unwrap();

        controller.admit(server);

        assert_eq!(controller.live(), 0);
        assert_eq!(controller.admission(), Admission::Accepting);
        assert_eq!(
            buf.lines(),
            vec!["sockspawn: status: 1/1", "sockspawn: status: 0/1"]
        );
    }

    #[tokio::test]
    async fn test_admit_and_reap_real_worker() {
        let (mut controller, buf, _dir) = controller(&["true"], 1);
        let (server, _client) = UnixStream::pair().unwrap();

        controller.admit(server);
        assert_eq!(controller.live(), 1);
        assert_eq!(controller.admission(), Admission::Draining);

        let exit = controller.exits_rx.recv().await.unwrap();
        controller.reap_one(exit).unwrap();
        assert_eq!(controller.live(), 0);

        let lines = buf.lines();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0], "sockspawn: status: 1/1");
        assert!(lines[1].starts_with("sockspawn: pid "));
        assert!(lines[2].ends_with(" status 0"));
        assert_eq!(lines[3], "sockspawn: status: 0/1");
    }

    #[tokio::test]
    async fn test_saturated_wait_reaps_one_at_a_time() {
        let (mut controller, buf, _dir) = controller(&["cat"], 3);
        for _ in 0..3 {
            controller.live.increment();
        }
        for pid in [101, 102, 103] {
            controller.exits_tx.send(exited(pid, 0)).unwrap();
        }
        assert_eq!(controller.admission(), Admission::Draining);

        let exit = controller.exits_rx.recv().await.unwrap();
        controller.reap_one(exit).unwrap();

        // Back below the ceiling after one exit; the other two stay queued
        assert_eq!(controller.live(), 2);
        assert_eq!(controller.admission(), Admission::Accepting);
        assert_eq!(
            buf.lines(),
            vec!["sockspawn: end 101 status 0", "sockspawn: status: 2/3"]
        );

        let first = controller.exits_rx.recv().await.unwrap();
        assert_eq!(controller.reap_pending(first), 2);
        assert_eq!(controller.live(), 0);
    }

    #[tokio::test]
    async fn test_notification_drains_every_queued_exit() {
        let (mut controller, buf, _dir) = controller(&["cat"], 10);
        for _ in 0..4 {
            controller.live.increment();
        }
        for pid in [1, 2, 3] {
            controller.exits_tx.send(exited(pid, pid as i32)).unwrap();
        }

        let first = controller.exits_rx.recv().await.unwrap();
        assert_eq!(controller.reap_pending(first), 3);
        assert_eq!(controller.live(), 1);
        assert!(controller.exits_rx.try_recv().is_err());

        assert_eq!(
            buf.lines(),
            vec![
                "sockspawn: end 1 status 256",
                "sockspawn: status: 3/10",
                "sockspawn: end 2 status 512",
                "sockspawn: status: 2/10",
                "sockspawn: end 3 status 768",
                "sockspawn: status: 1/10",
            ]
        );
    }

    #[tokio::test]
    async fn test_failed_collection_still_releases_slot() {
        let (mut controller, _buf, _dir) = controller(&["cat"], 2);
        controller.live.increment();

        controller.reap_pending(WorkerExit {
            pid: 7,
            status: Err(io::Error::from_raw_os_error(libc::ECHILD)),
        });

        assert_eq!(controller.live(), 0);
    }

    #[tokio::test]
    async fn test_wait_failure_while_saturated_is_fatal() {
        let (mut controller, _buf, _dir) = controller(&["cat"], 1);
        controller.live.increment();

        let err = controller
            .reap_one(WorkerExit {
                pid: 7,
                status: Err(io::Error::from_raw_os_error(libc::ECHILD)),
            })
            .unwrap_err();
        assert!(matches!(err, ControllerError::Wait(_)));
    }

    #[tokio::test]
    async fn test_run_fails_on_wait_error_while_saturated() {
        let (mut controller, buf, _dir) = controller(&["cat"], 1);
        controller.live.increment();
        controller
            .exits_tx
            .send(WorkerExit {
                pid: 9,
                status: Err(io::Error::from_raw_os_error(libc::ECHILD)),
            })
            .unwrap();

        let err = controller.run(std::future::pending()).await.unwrap_err();

        assert!(matches!(err, ControllerError::Wait(_)));
        assert_eq!(controller.live(), 1);
        assert_eq!(buf.lines(), vec!["sockspawn: status: 1/1"]);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (mut controller, buf, _dir) = controller(&["cat"], 2);

        controller.run(async {}).await.unwrap();

        assert_eq!(buf.lines(), vec!["sockspawn: status: 0/2"]);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown_while_saturated() {
        let (mut controller, _buf, _dir) = controller(&["cat"], 1);
        controller.live.increment();
        assert_eq!(controller.admission(), Admission::Draining);

        let shutdown = tokio::time::sleep(std::time::Duration::from_millis(50));
        controller.run(shutdown).await.unwrap();

        // No exit arrived, so nothing was reaped
        assert_eq!(controller.live(), 1);
    }
}
