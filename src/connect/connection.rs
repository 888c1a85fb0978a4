//! Client-side session wrapper and stale-address cleanup.

use std::sync::Arc;

use crate::config::DaemonParameters;
use crate::registry::{DaemonInfo, DaemonRegistry, DaemonStopEvent};
use crate::clock::Clock;

use super::dial::DaemonConnection;
use super::ConnectError;

/// Reason recorded when a client evicts a daemon it could not reach.
pub(crate) const STALE_ADDRESS_REASON: &str = "by user or operating system";

/// Invoked after a connect failure against a specific daemon, and again on
/// any later discovery that the session has died.
pub trait StaleAddressDetector: Send {
    /// Returns true when the address was treated as stale.
    fn maybe_stale_address(&self, failure: &ConnectError) -> bool;
}

/// Evicts the daemon's record and records a stop event. Idempotent: the
/// registry remove is a no-op once the record is gone, and duplicate stop
/// events collapse during the connector's dedup pass.
pub struct CleanupOnStaleAddress {
    daemon: DaemonInfo,
    registry: Arc<dyn DaemonRegistry>,
    clock: Arc<dyn Clock>,
}

impl CleanupOnStaleAddress {
    pub fn new(daemon: DaemonInfo, registry: Arc<dyn DaemonRegistry>, clock: Arc<dyn Clock>) -> Self {
        Self {
            daemon,
            registry,
            clock,
        }
    }
}

impl StaleAddressDetector for CleanupOnStaleAddress {
    fn maybe_stale_address(&self, failure: &ConnectError) -> bool {
        tracing::debug!(
            daemon = %self.daemon.id,
            error = %failure,
            "removing daemon from the registry after a communication failure"
        );
        self.registry.store_stop_event(DaemonStopEvent {
            daemon_id: self.daemon.id.clone(),
            timestamp_ms: self.clock.now_ms(),
            status: None,
            reason: STALE_ADDRESS_REASON.to_string(),
        });
        self.registry.remove(&self.daemon.id);
        true
    }
}

/// An established session with one daemon.
///
/// Owns the socket; the wire protocol layered on top is out of scope here.
/// The stale-address detector travels with the connection so a later session
/// death can evict the record too.
pub struct DaemonClientConnection {
    connection: DaemonConnection,
    daemon: DaemonInfo,
    detector: Box<dyn StaleAddressDetector>,
    new_daemon: bool,
    parameters: DaemonParameters,
}

impl DaemonClientConnection {
    pub(crate) fn new(
        connection: DaemonConnection,
        daemon: DaemonInfo,
        detector: Box<dyn StaleAddressDetector>,
        new_daemon: bool,
        parameters: DaemonParameters,
    ) -> Self {
        Self {
            connection,
            daemon,
            detector,
            new_daemon,
            parameters,
        }
    }

    pub fn daemon(&self) -> &DaemonInfo {
        &self.daemon
    }

    /// True only for a connection obtained during the post-launch handshake.
    pub fn is_new_daemon(&self) -> bool {
        self.new_daemon
    }

    pub fn connection(&self) -> &DaemonConnection {
        &self.connection
    }

    pub fn parameters(&self) -> &DaemonParameters {
        &self.parameters
    }

    /// Report that the session died; evicts the daemon's record best-effort.
    pub fn mark_failed(&self, failure: &ConnectError) -> bool {
        self.detector.maybe_stale_address(failure)
    }
}

impl std::fmt::Debug for DaemonClientConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DaemonClientConnection")
            .field("daemon", &self.daemon)
            .field("peer", &self.connection.peer_addr())
            .field("new_daemon", &self.new_daemon)
            .finish_non_exhaustive()
    }
}
