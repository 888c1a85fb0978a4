//! Embedded (no-daemon) variant: host the daemon inside the client process.
//!
//! Exists so the build logic can run in-process for tests and pure-library
//! usage. The server implementation is linked in behind [`EmbeddedServer`]
//! and installed with [`DaemonConnector::with_embedded_server`]; it still
//! registers itself in the shared registry and accepts a loopback socket, so
//! the handshake here shares its semantics with the launch path.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::config::DaemonParameters;
use crate::connect::{ClientOutput, ConnectError, DaemonClientConnection, DaemonConnector};
use crate::registry::DaemonId;

/// Poll interval while waiting for the in-process daemon to come up.
pub const EMBEDDED_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Everything the in-process daemon needs, threaded explicitly instead of
/// through process-global state.
pub struct EmbeddedConfig {
    pub daemon_id: DaemonId,
    pub parameters: DaemonParameters,
}

/// A daemon implementation hosted on a background thread of the client.
pub trait EmbeddedServer: Send + 'static {
    /// Run the daemon until it shuts down. Expected to register itself in
    /// the shared registry and accept loopback connections like any other
    /// daemon.
    fn run(self: Box<Self>, config: EmbeddedConfig)
        -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

impl DaemonConnector {
    /// Install the server used when the parameters request no-daemon mode.
    pub fn with_embedded_server(self, server: Box<dyn EmbeddedServer>) -> Self {
        *self.embedded.lock().expect("embedded slot poisoned") = Some(server);
        self
    }

    pub(crate) fn connect_embedded(
        &self,
        _output: &dyn ClientOutput,
    ) -> crate::Result<DaemonClientConnection> {
        let Some(server) = self.embedded.lock().expect("embedded slot poisoned").take() else {
            return Err(ConnectError::Unsupported {
                reason: "no embedded daemon server is installed".to_string(),
            }
            .into());
        };

        let daemon_id = DaemonId::embedded(std::process::id(), self.clock().now_ms());
        let config = EmbeddedConfig {
            daemon_id: daemon_id.clone(),
            parameters: self.parameters().clone(),
        };
        tracing::debug!(daemon = %daemon_id, "starting internal daemon");

        let failure: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&failure);
        let handle = std::thread::Builder::new()
            .name(format!("mvnd-embedded-{daemon_id}"))
            .spawn(move || {
                if let Err(e) = server.run(config) {
                    *slot.lock().expect("failure slot poisoned") = Some(e.to_string());
                }
            })
            .map_err(|e| ConnectError::Embedded {
                reason: format!("failed to start the server thread: {e}"),
            })?;

        let start = self.clock().now_ms();
        let budget = crate::connect::DEFAULT_CONNECT_TIMEOUT.as_millis() as u64;
        loop {
            if let Some(connection) = self.connect_to_daemon_with_id(&daemon_id, true)? {
                return Ok(connection);
            }
            self.checked_sleep(EMBEDDED_POLL_INTERVAL)?;
            let within_budget = self.clock().now_ms().saturating_sub(start) < budget;
            if handle.is_finished() || !within_budget {
                break;
            }
        }

        let reason = failure
            .lock()
            .expect("failure slot poisoned")
            .take()
            .unwrap_or_else(|| "the internal daemon did not register itself".to_string());
        Err(ConnectError::Embedded { reason }.into())
    }
}
