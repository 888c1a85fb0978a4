//! Connection orchestrator.
//!
//! [`DaemonConnector::connect`] arbitrates between reusing an idle daemon,
//! waiting for a canceled one to come back, and launching a fresh process,
//! all within a bounded connect budget. Registry drift is normal: any record
//! may vanish or change between reads, and a connect failure against a
//! supposedly idle daemon is proof the record is stale.

pub mod compat;
pub mod connection;
pub mod dial;
pub mod diagnostics;
pub mod launch;

use std::collections::BTreeMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::config::DaemonParameters;
use crate::error::Transience;
use crate::registry::{DaemonId, DaemonInfo, DaemonRegistry, DaemonState, DaemonStopEvent};
use crate::clock::{CancelToken, Clock, SystemClock};

pub use compat::{Compatibility, CompatibilitySpec};
pub use connection::{CleanupOnStaleAddress, DaemonClientConnection, StaleAddressDetector};
pub use dial::{dial, DaemonConnection, CONNECT_TIMEOUT};
pub use diagnostics::DaemonDiagnostics;
pub use launch::{DaemonProcess, Launcher, ProcessLauncher, StartError};

/// Total budget for reaching a freshly launched daemon.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
/// How long to wait for a canceled daemon to become idle again.
pub const CANCELED_WAIT_TIMEOUT: Duration = Duration::from_secs(3);
/// Poll interval for both the canceled wait and the handshake.
pub const HANDSHAKE_POLL_INTERVAL: Duration = Duration::from_millis(200);
/// Stop events older than this are garbage collected.
pub const STOP_EVENT_RETENTION: Duration = Duration::from_secs(60 * 60);

/// Sink for user-facing status lines ("Looking up daemon...").
pub trait ClientOutput {
    fn status(&self, message: &str);
}

impl<F: Fn(&str)> ClientOutput for F {
    fn status(&self, message: &str) {
        self(message)
    }
}

/// Transport-level failure reaching a daemon.
///
/// Recovered locally (evict and try the next candidate) except for budget
/// exhaustion, interruption, and unsupported configurations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ConnectError {
    #[error("could not connect to daemon on {addr}: {source}")]
    Dial {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("socket connected to itself on {addr}")]
    SelfConnect { addr: SocketAddr },

    #[error("could not connect to the Maven daemon.\n{diagnostics}")]
    NewDaemon {
        id: DaemonId,
        diagnostics: String,
        #[source]
        source: Box<ConnectError>,
    },

    #[error("Timeout waiting to connect to the Maven daemon.\n{diagnostics}")]
    Timeout { diagnostics: String },

    #[error("connect canceled by the caller")]
    Interrupted,

    #[error("no-daemon mode is not supported: {reason}")]
    Unsupported { reason: String },

    #[cfg(feature = "embedded")]
    #[error("unable to connect to internal daemon: {reason}")]
    Embedded { reason: String },
}

impl ConnectError {
    pub fn code(&self) -> &'static str {
        match self {
            ConnectError::Dial { .. } => "dial_failed",
            ConnectError::SelfConnect { .. } => "self_connect",
            ConnectError::NewDaemon { .. } => "new_daemon_unreachable",
            ConnectError::Timeout { .. } => "connect_timeout",
            ConnectError::Interrupted => "interrupted",
            ConnectError::Unsupported { .. } => "unsupported",
            #[cfg(feature = "embedded")]
            ConnectError::Embedded { .. } => "embedded_failed",
        }
    }

    pub fn transience(&self) -> Transience {
        match self {
            ConnectError::Dial { .. } | ConnectError::SelfConnect { .. } => Transience::Retryable,
            ConnectError::Timeout { .. } | ConnectError::NewDaemon { .. } => Transience::Unknown,
            ConnectError::Interrupted | ConnectError::Unsupported { .. } => Transience::Permanent,
            #[cfg(feature = "embedded")]
            ConnectError::Embedded { .. } => Transience::Unknown,
        }
    }
}

/// The top-level connection policy.
///
/// Safe to call from multiple threads; all shared mutable state lives in the
/// registry, which serializes access on its own.
pub struct DaemonConnector {
    parameters: DaemonParameters,
    registry: Arc<dyn DaemonRegistry>,
    launcher: Box<dyn Launcher>,
    clock: Arc<dyn Clock>,
    cancel: CancelToken,
    #[cfg(feature = "embedded")]
    pub(crate) embedded: std::sync::Mutex<Option<Box<dyn crate::embedded::EmbeddedServer>>>,
}

impl DaemonConnector {
    pub fn new(parameters: DaemonParameters, registry: Arc<dyn DaemonRegistry>) -> Self {
        let launcher = Box::new(ProcessLauncher::new(parameters.clone()));
        Self {
            parameters,
            registry,
            launcher,
            clock: Arc::new(SystemClock),
            cancel: CancelToken::new(),
            #[cfg(feature = "embedded")]
            embedded: std::sync::Mutex::new(None),
        }
    }

    /// Replace the production launcher (tests script this seam).
    pub fn with_launcher(mut self, launcher: Box<dyn Launcher>) -> Self {
        self.launcher = launcher;
        self
    }

    /// Replace the wall clock (tests run the poll loops in simulated time).
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// A handle the caller can trip to abort the next sleep boundary.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Obtain a session with exactly one compatible daemon, launching one if
    /// necessary.
    ///
    /// Ordered policy: idle daemons first, then canceled daemons given a
    /// short window to come back, then a fresh launch followed by the
    /// handshake poll.
    pub fn connect(&self, output: &dyn ClientOutput) -> crate::Result<DaemonClientConnection> {
        if self.parameters.no_daemon {
            return self.connect_embedded(output);
        }

        let constraint = CompatibilitySpec::from_parameters(&self.parameters);
        output.status("Looking up daemon...");

        let (idle, busy): (Vec<_>, Vec<_>) = self
            .registry
            .get_all()
            .into_iter()
            .partition(|d| d.state == DaemonState::Idle);

        if let Some(connection) = self.connect_to_idle_daemon(&idle, &constraint) {
            return Ok(connection);
        }

        if let Some(connection) = self.connect_to_canceled_daemon(&busy, &constraint)? {
            return Ok(connection);
        }

        // No compatible daemon available: launch a new one.
        let daemon_id = DaemonId::random();
        let message = self.handle_stop_events(&daemon_id, &idle, &busy);
        output.status(&message);
        self.start_daemon(daemon_id)
    }

    /// Try compatible daemons once, without waiting or launching.
    pub fn maybe_connect(&self, constraint: &CompatibilitySpec) -> Option<DaemonClientConnection> {
        let compatible = self.compatible_daemons(&self.registry.get_all(), constraint);
        self.find_connection(compatible)
    }

    /// Try one already-known daemon record directly, with no compatibility
    /// check. A connect failure evicts the record and yields `None`.
    pub fn maybe_connect_daemon(&self, daemon: &DaemonInfo) -> Option<DaemonClientConnection> {
        let detector = CleanupOnStaleAddress::new(
            daemon.clone(),
            Arc::clone(&self.registry),
            Arc::clone(&self.clock),
        );
        match self.connect_to_daemon(daemon.clone(), Box::new(detector), false) {
            Ok(connection) => Some(connection),
            Err(e) => {
                tracing::debug!(daemon = %daemon.id, error = %e, "cannot connect to daemon, ignoring");
                None
            }
        }
    }

    #[cfg(not(feature = "embedded"))]
    fn connect_embedded(&self, _output: &dyn ClientOutput) -> crate::Result<DaemonClientConnection> {
        Err(ConnectError::Unsupported {
            reason: "this build does not include the embedded daemon".to_string(),
        }
        .into())
    }

    fn connect_to_idle_daemon(
        &self,
        idle: &[DaemonInfo],
        constraint: &CompatibilitySpec,
    ) -> Option<DaemonClientConnection> {
        let compatible = self.compatible_daemons(idle, constraint);
        tracing::debug!(
            idle = idle.len(),
            compatible = compatible.len(),
            "scanned idle daemons"
        );
        self.find_connection(compatible)
    }

    fn connect_to_canceled_daemon(
        &self,
        busy: &[DaemonInfo],
        constraint: &CompatibilitySpec,
    ) -> Result<Option<DaemonClientConnection>, ConnectError> {
        let canceled: Vec<DaemonInfo> = busy
            .iter()
            .filter(|d| d.state == DaemonState::Canceled)
            .cloned()
            .collect();
        let compatible = self.compatible_daemons(&canceled, constraint);
        tracing::debug!(
            busy = busy.len(),
            canceled = canceled.len(),
            compatible = compatible.len(),
            "scanned busy daemons"
        );
        if compatible.is_empty() {
            return Ok(None);
        }

        tracing::debug!("waiting for daemons with canceled builds to become available");
        let start = self.clock.now_ms();
        let budget = CANCELED_WAIT_TIMEOUT.as_millis() as u64;
        let mut connection = None;
        while connection.is_none() && self.clock.now_ms().saturating_sub(start) < budget {
            self.checked_sleep(HANDSHAKE_POLL_INTERVAL)?;
            connection = self.connect_to_idle_daemon(&self.registry.get_idle(), constraint);
        }
        Ok(connection)
    }

    fn compatible_daemons(
        &self,
        daemons: &[DaemonInfo],
        constraint: &CompatibilitySpec,
    ) -> Vec<DaemonInfo> {
        let mut compatible = Vec::new();
        for daemon in daemons {
            let result = constraint.check(daemon);
            if result.compatible {
                compatible.push(daemon.clone());
            } else {
                tracing::debug!(
                    daemon = %daemon.id,
                    state = ?daemon.state,
                    why = %result.why,
                    "daemon does not match the desired criteria"
                );
            }
        }
        compatible
    }

    /// Dial candidates in snapshot order; first success wins, failures evict
    /// and move on.
    fn find_connection(&self, compatible: Vec<DaemonInfo>) -> Option<DaemonClientConnection> {
        for daemon in compatible {
            let id = daemon.id.clone();
            let detector = CleanupOnStaleAddress::new(
                daemon.clone(),
                Arc::clone(&self.registry),
                Arc::clone(&self.clock),
            );
            match self.connect_to_daemon(daemon, Box::new(detector), false) {
                Ok(connection) => return Some(connection),
                Err(e) => {
                    tracing::debug!(
                        daemon = %id,
                        error = %e,
                        "cannot connect to daemon, trying a different daemon"
                    );
                }
            }
        }
        None
    }

    /// GC old stop events, dedup the recent ones, and describe why a new
    /// daemon is being started.
    fn handle_stop_events(
        &self,
        daemon_id: &DaemonId,
        idle: &[DaemonInfo],
        busy: &[DaemonInfo],
    ) -> String {
        let cutoff = self
            .clock
            .now_ms()
            .saturating_sub(STOP_EVENT_RETENTION.as_millis() as u64);
        let (recent, old): (Vec<_>, Vec<_>) = self
            .registry
            .get_stop_events()
            .into_iter()
            .partition(|e| e.timestamp_ms >= cutoff);
        self.registry.remove_stop_events(&old);

        // One event per daemon: a concrete status beats none, and among
        // concrete statuses the greatest wins. Ties keep the first seen.
        let mut deduped: BTreeMap<DaemonId, DaemonStopEvent> = BTreeMap::new();
        for event in recent {
            let replace = match deduped.get(&event.daemon_id) {
                Some(kept) => kept.status < event.status,
                None => true,
            };
            if replace {
                deduped.insert(event.daemon_id.clone(), event);
            }
        }
        for event in deduped.values() {
            tracing::debug!(
                daemon = %event.daemon_id,
                stopped_at = %event.timestamp_rfc3339(),
                reason = %event.reason,
                "previous daemon stopped"
            );
        }

        startup_message(daemon_id, busy.len(), idle.len(), deduped.len())
    }

    /// Launch a fresh daemon and poll until it registers itself and accepts
    /// a connection, the child dies, or the budget expires.
    fn start_daemon(&self, daemon_id: DaemonId) -> crate::Result<DaemonClientConnection> {
        let mut process = self.launcher.launch(&daemon_id)?;
        tracing::debug!(daemon = %daemon_id, "started daemon");

        let start = self.clock.now_ms();
        let budget = DEFAULT_CONNECT_TIMEOUT.as_millis() as u64;
        loop {
            if let Some(connection) = self.connect_to_daemon_with_id(&daemon_id, true)? {
                return Ok(connection);
            }
            self.checked_sleep(HANDSHAKE_POLL_INTERVAL)?;
            let within_budget = self.clock.now_ms().saturating_sub(start) < budget;
            if !(process.is_alive() && within_budget) {
                break;
            }
        }

        let pid = self.registry.get(&daemon_id).map(|d| d.pid);
        let diagnostics = DaemonDiagnostics::new(&daemon_id, &self.parameters)
            .with_pid(pid)
            .describe(self.clock.now_ms());
        Err(ConnectError::Timeout { diagnostics }.into())
    }

    /// One handshake attempt against a daemon we launched ourselves.
    ///
    /// An absent record is not an error (the daemon has not registered yet);
    /// a present-but-unreachable record is a hard failure with diagnostics.
    pub(crate) fn connect_to_daemon_with_id(
        &self,
        id: &DaemonId,
        new_daemon: bool,
    ) -> Result<Option<DaemonClientConnection>, ConnectError> {
        // Our daemon sits among the busy ones: it registers itself in Busy
        // state so that nobody else grabs it.
        let Some(daemon) = self.registry.get(id) else {
            return Ok(None);
        };
        let pid = daemon.pid;
        let detector = CleanupOnStaleAddress::new(
            daemon.clone(),
            Arc::clone(&self.registry),
            Arc::clone(&self.clock),
        );
        match self.connect_to_daemon(daemon, Box::new(detector), new_daemon) {
            Ok(connection) => Ok(Some(connection)),
            Err(source) => {
                let diagnostics = DaemonDiagnostics::new(id, &self.parameters)
                    .with_pid(Some(pid))
                    .describe(self.clock.now_ms());
                Err(ConnectError::NewDaemon {
                    id: id.clone(),
                    diagnostics,
                    source: Box::new(source),
                })
            }
        }
    }

    fn connect_to_daemon(
        &self,
        daemon: DaemonInfo,
        detector: Box<dyn StaleAddressDetector>,
        new_daemon: bool,
    ) -> Result<DaemonClientConnection, ConnectError> {
        tracing::debug!(daemon = %daemon.id, port = daemon.address, "connecting to daemon");
        match dial::dial(daemon.address) {
            Ok(connection) => Ok(DaemonClientConnection::new(
                connection,
                daemon,
                detector,
                new_daemon,
                self.parameters.clone(),
            )),
            Err(e) => {
                // Eviction is best-effort; the dial error is what propagates.
                detector.maybe_stale_address(&e);
                Err(e)
            }
        }
    }

    pub(crate) fn checked_sleep(&self, duration: Duration) -> Result<(), ConnectError> {
        if self.cancel.is_canceled() {
            return Err(ConnectError::Interrupted);
        }
        self.clock.sleep(duration);
        if self.cancel.is_canceled() {
            return Err(ConnectError::Interrupted);
        }
        Ok(())
    }

    #[cfg(feature = "embedded")]
    pub(crate) fn parameters(&self) -> &DaemonParameters {
        &self.parameters
    }

    #[cfg(feature = "embedded")]
    pub(crate) fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }
}

/// The status line shown when a new daemon has to be started.
pub fn startup_message(
    daemon_id: &DaemonId,
    num_busy: usize,
    num_incompatible: usize,
    num_stopped: usize,
) -> String {
    let total_unavailable = num_busy + num_incompatible + num_stopped;
    if total_unavailable > 0 {
        let mut reasons = Vec::new();
        if num_busy > 0 {
            reasons.push(format!("{num_busy} busy"));
        }
        if num_incompatible > 0 {
            reasons.push(format!("{num_incompatible} incompatible"));
        }
        if num_stopped > 0 {
            reasons.push(format!("{num_stopped} stopped"));
        }
        format!(
            "Starting new daemon {daemon_id}, {} daemon{} could not be reused, use --status for details",
            reasons.join(" and "),
            if total_unavailable > 1 { "s" } else { "" },
        )
    } else {
        format!("Starting new daemon {daemon_id} (subsequent builds will be faster)...")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{ExpirationStatus, MemoryRegistry, RuntimeProfile};
    use crate::clock::FakeClock;
    use std::path::PathBuf;

    const HOUR_MS: u64 = 60 * 60 * 1_000;

    fn connector_with(
        registry: Arc<MemoryRegistry>,
        clock: Arc<FakeClock>,
    ) -> DaemonConnector {
        DaemonConnector::new(DaemonParameters::default(), registry).with_clock(clock)
    }

    fn stop_event(id: &str, timestamp_ms: u64, status: Option<ExpirationStatus>) -> DaemonStopEvent {
        DaemonStopEvent {
            daemon_id: DaemonId::new(id),
            timestamp_ms,
            status,
            reason: "stopped".to_string(),
        }
    }

    fn busy_daemon(id: &str) -> DaemonInfo {
        DaemonInfo::new(
            DaemonId::new(id),
            7000,
            42,
            RuntimeProfile {
                java_home: PathBuf::from("/opt/jdk"),
                daemon_opts: BTreeMap::new(),
            },
        )
    }

    #[test]
    fn startup_message_with_no_rejections() {
        let id = DaemonId::new("cafe0001");
        assert_eq!(
            startup_message(&id, 0, 0, 0),
            "Starting new daemon cafe0001 (subsequent builds will be faster)..."
        );
    }

    #[test]
    fn startup_message_singular() {
        let id = DaemonId::new("cafe0001");
        assert_eq!(
            startup_message(&id, 1, 0, 0),
            "Starting new daemon cafe0001, 1 busy daemon could not be reused, use --status for details"
        );
    }

    #[test]
    fn startup_message_joins_reasons_with_and() {
        let id = DaemonId::new("cafe0001");
        assert_eq!(
            startup_message(&id, 2, 1, 3),
            "Starting new daemon cafe0001, 2 busy and 1 incompatible and 3 stopped daemons could not be reused, use --status for details"
        );
    }

    #[test]
    fn startup_message_skips_zero_counts() {
        let id = DaemonId::new("cafe0001");
        assert_eq!(
            startup_message(&id, 0, 0, 2),
            "Starting new daemon cafe0001, 2 stopped daemons could not be reused, use --status for details"
        );
    }

    #[test]
    fn handle_stop_events_garbage_collects_old_events() {
        let registry = Arc::new(MemoryRegistry::new());
        let clock = Arc::new(FakeClock::new(2 * HOUR_MS));
        registry.store_stop_event(stop_event("aaaa0001", HOUR_MS / 2, None));
        registry.store_stop_event(stop_event("aaaa0002", 2 * HOUR_MS - 1_000, None));
        let connector = connector_with(registry.clone(), clock);

        let message = connector.handle_stop_events(&DaemonId::new("cafe0001"), &[], &[]);

        // The event from half an hour into the epoch is beyond retention.
        let remaining = registry.get_stop_events();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].daemon_id.as_str(), "aaaa0002");
        assert!(message.contains("1 stopped"), "{message}");
    }

    #[test]
    fn stop_event_dedup_prefers_highest_status() {
        let registry = Arc::new(MemoryRegistry::new());
        let clock = Arc::new(FakeClock::new(HOUR_MS));
        // Same daemon, three events: no status, quiet, immediate.
        registry.store_stop_event(stop_event("aaaa0001", HOUR_MS - 100, None));
        registry.store_stop_event(stop_event(
            "aaaa0001",
            HOUR_MS - 200,
            Some(ExpirationStatus::ImmediateExpire),
        ));
        registry.store_stop_event(stop_event(
            "aaaa0001",
            HOUR_MS - 300,
            Some(ExpirationStatus::QuietExpire),
        ));
        let connector = connector_with(registry, clock);

        let message = connector.handle_stop_events(&DaemonId::new("cafe0001"), &[], &[]);
        assert!(message.contains("1 stopped"), "{message}");
    }

    #[test]
    fn stop_event_dedup_counts_one_per_daemon() {
        let registry = Arc::new(MemoryRegistry::new());
        let clock = Arc::new(FakeClock::new(HOUR_MS));
        registry.store_stop_event(stop_event("aaaa0001", HOUR_MS - 100, None));
        registry.store_stop_event(stop_event("aaaa0001", HOUR_MS - 200, None));
        registry.store_stop_event(stop_event("aaaa0002", HOUR_MS - 300, None));
        let connector = connector_with(registry, clock);

        let message = connector.handle_stop_events(&DaemonId::new("cafe0001"), &[], &[]);
        assert!(message.contains("2 stopped"), "{message}");
    }

    #[test]
    fn busy_and_idle_counts_flow_into_the_message() {
        let registry = Arc::new(MemoryRegistry::new());
        let clock = Arc::new(FakeClock::new(HOUR_MS));
        let connector = connector_with(registry, clock);

        let busy = vec![busy_daemon("aaaa0001"), busy_daemon("aaaa0002")];
        let idle = vec![busy_daemon("aaaa0003").with_state(DaemonState::Idle)];
        let message = connector.handle_stop_events(&DaemonId::new("cafe0001"), &idle, &busy);
        assert!(message.contains("2 busy and 1 incompatible"), "{message}");
    }

    #[test]
    fn canceled_connector_fails_interrupted_at_next_sleep() {
        let registry = Arc::new(MemoryRegistry::new());
        let clock = Arc::new(FakeClock::new(0));
        let connector = connector_with(registry, clock);
        connector.cancel_token().cancel();

        let err = connector
            .checked_sleep(Duration::from_millis(200))
            .expect_err("sleep should be interrupted");
        assert!(matches!(err, ConnectError::Interrupted));
    }
}
