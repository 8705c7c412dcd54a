//! Listener plus admission loop, with socket cleanup on the way out

use crate::config::Config;
use crate::controller::{AdmissionController, LiveHandle};
use crate::env::{ConnectionSetup, UnixEnv};
use crate::error::{ControllerError, SetupError};
use crate::listener::{Endpoint, SocketPath};
use crate::status::StatusLog;
use std::future::Future;
use std::sync::Arc;
use tracing::info;

pub struct Server {
    config: Arc<Config>,
    controller: AdmissionController,
    socket_path: Arc<SocketPath>,
}

impl Server {
    /// Bind the socket and prepare the controller, with the default UCSPI
    /// environment for workers
    pub fn bind(config: Arc<Config>, status: Arc<StatusLog>) -> Result<Self, SetupError> {
        Self::with_setup(config, status, Arc::new(UnixEnv))
    }

    pub fn with_setup(
        config: Arc<Config>,
        status: Arc<StatusLog>,
        setup: Arc<dyn ConnectionSetup>,
    ) -> Result<Self, SetupError> {
        let endpoint = Endpoint::bind(&config)?;
        let socket_path = endpoint.socket_path();
        let controller = AdmissionController::new(endpoint, Arc::clone(&config), setup, status);
        Ok(Self {
            config,
            controller,
            socket_path,
        })
    }

    pub fn live_handle(&self) -> LiveHandle {
        self.controller.live_handle()
    }

    /// Serve until `shutdown` resolves, then clean up the socket file.
    ///
    /// On clean shutdown the file is removed only if `delete_on_exit` is set;
    /// after a fatal error it is always removed. Live workers are not waited
    /// for.
    pub async fn run<F>(mut self, shutdown: F) -> Result<(), ControllerError>
    where
        F: Future<Output = ()>,
    {
        let result = self.controller.run(shutdown).await;

        match &result {
            Ok(()) if self.config.delete_on_exit => {
                self.socket_path.remove_once();
            }
            Ok(()) => {
                info!(path = %self.socket_path.path().display(), "Leaving socket file in place");
            }
            Err(_) => {
                self.socket_path.remove_once();
            }
        }
        result
    }
}
