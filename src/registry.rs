//! Daemon registry records and the consuming interface.
//!
//! The registry itself (a memory-mapped file with locking) is owned by a
//! separate subsystem; the connector only depends on [`DaemonRegistry`].
//! Every operation is atomic with respect to other clients, and between two
//! calls the registry may change arbitrarily; callers never assume a record
//! they just read still exists.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Daemon identifier.
///
/// Spawned daemons get 8 lowercase hex chars drawn from a random 32-bit
/// integer; the embedded variant uses `"<pid>-<millis>"`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DaemonId(String);

impl DaemonId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Mint a fresh id for a daemon about to be spawned.
    pub fn random() -> Self {
        use rand::Rng;
        Self(format!("{:08x}", rand::rng().random::<u32>()))
    }

    /// Mint an id for an in-process daemon.
    pub fn embedded(pid: u32, millis: u64) -> Self {
        Self(format!("{pid}-{millis}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for DaemonId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DaemonId({:?})", self.0)
    }
}

impl fmt::Display for DaemonId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state a daemon records for itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DaemonState {
    Idle,
    Busy,
    Canceled,
    Stopped,
    Broken,
}

/// The runtime data the compatibility predicate consults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeProfile {
    pub java_home: PathBuf,
    /// Discriminating options: a later client considers this daemon
    /// compatible only when its own option map is identical.
    #[serde(default)]
    pub daemon_opts: BTreeMap<String, String>,
}

/// One registered daemon.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonInfo {
    pub id: DaemonId,
    /// Loopback TCP port the daemon listens on.
    pub address: u16,
    pub pid: u32,
    pub runtime: RuntimeProfile,
    pub state: DaemonState,
    /// Timestamp the daemon itself refreshes, in milliseconds since epoch.
    pub last_seen_ms: u64,
}

impl DaemonInfo {
    /// A newly launched daemon writes its record in `Busy` state so that no
    /// concurrent client grabs it during the handshake.
    pub fn new(id: DaemonId, address: u16, pid: u32, runtime: RuntimeProfile) -> Self {
        Self {
            id,
            address,
            pid,
            runtime,
            state: DaemonState::Busy,
            last_seen_ms: 0,
        }
    }

    pub fn with_state(mut self, state: DaemonState) -> Self {
        self.state = state;
        self
    }
}

/// Fine-grained termination cause carried by a stop event.
///
/// The ordering matters: stop-event dedup keeps the greatest status per
/// daemon (see the connector's stop-event handling).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpirationStatus {
    QuietExpire,
    GracefulExpire,
    ImmediateExpire,
}

/// Emitted when a daemon terminates or a client evicts its stale record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DaemonStopEvent {
    pub daemon_id: DaemonId,
    pub timestamp_ms: u64,
    pub status: Option<ExpirationStatus>,
    pub reason: String,
}

impl DaemonStopEvent {
    /// Human-readable timestamp for logs and diagnostics.
    pub fn timestamp_rfc3339(&self) -> String {
        format_wall_ms(self.timestamp_ms)
    }
}

pub(crate) fn format_wall_ms(ms: u64) -> String {
    OffsetDateTime::from_unix_timestamp_nanos(ms as i128 * 1_000_000)
        .ok()
        .and_then(|t| t.format(&Rfc3339).ok())
        .unwrap_or_else(|| format!("{ms}ms"))
}

/// The directory of known daemons and recent stop events.
///
/// Implementations must make every operation atomic with respect to other
/// processes; no ordering is guaranteed across calls.
pub trait DaemonRegistry: Send + Sync {
    /// Snapshot of all known daemons.
    fn get_all(&self) -> Vec<DaemonInfo>;

    /// Snapshot filtered to `Idle` state.
    fn get_idle(&self) -> Vec<DaemonInfo> {
        self.get_all()
            .into_iter()
            .filter(|d| d.state == DaemonState::Idle)
            .collect()
    }

    fn get(&self, id: &DaemonId) -> Option<DaemonInfo>;

    /// Remove a daemon record. A no-op when the record is already gone.
    fn remove(&self, id: &DaemonId);

    fn get_stop_events(&self) -> Vec<DaemonStopEvent>;

    fn store_stop_event(&self, event: DaemonStopEvent);

    /// Remove exactly the given events (matched structurally).
    fn remove_stop_events(&self, events: &[DaemonStopEvent]);
}

#[derive(Default)]
struct MemoryRegistryInner {
    daemons: BTreeMap<DaemonId, DaemonInfo>,
    stop_events: Vec<DaemonStopEvent>,
}

/// In-memory reference implementation.
///
/// Used by the embedded variant and the test suite; real deployments plug in
/// the persistent registry subsystem instead.
#[derive(Default)]
pub struct MemoryRegistry {
    inner: Mutex<MemoryRegistryInner>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a daemon record. This is the daemon-side half of the
    /// registry contract; the connector itself never stores records.
    pub fn store(&self, info: DaemonInfo) {
        let mut inner = self.lock();
        inner.daemons.insert(info.id.clone(), info);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryRegistryInner> {
        self.inner.lock().expect("registry lock poisoned")
    }
}

impl DaemonRegistry for MemoryRegistry {
    fn get_all(&self) -> Vec<DaemonInfo> {
        self.lock().daemons.values().cloned().collect()
    }

    fn get(&self, id: &DaemonId) -> Option<DaemonInfo> {
        self.lock().daemons.get(id).cloned()
    }

    fn remove(&self, id: &DaemonId) {
        self.lock().daemons.remove(id);
    }

    fn get_stop_events(&self) -> Vec<DaemonStopEvent> {
        self.lock().stop_events.clone()
    }

    fn store_stop_event(&self, event: DaemonStopEvent) {
        self.lock().stop_events.push(event);
    }

    fn remove_stop_events(&self, events: &[DaemonStopEvent]) {
        self.lock().stop_events.retain(|e| !events.contains(e));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(id: &str, state: DaemonState) -> DaemonInfo {
        DaemonInfo::new(
            DaemonId::new(id),
            7000,
            42,
            RuntimeProfile {
                java_home: PathBuf::from("/opt/jdk"),
                daemon_opts: BTreeMap::new(),
            },
        )
        .with_state(state)
    }

    #[test]
    fn random_id_is_eight_hex_chars() {
        for _ in 0..32 {
            let id = DaemonId::random();
            assert_eq!(id.as_str().len(), 8);
            assert!(id.as_str().chars().all(|c| c.is_ascii_hexdigit()));
        }
    }

    #[test]
    fn embedded_id_combines_pid_and_millis() {
        let id = DaemonId::embedded(123, 456_789);
        assert_eq!(id.as_str(), "123-456789");
    }

    #[test]
    fn new_record_starts_busy() {
        let info = info("aaaa0001", DaemonState::Busy);
        assert_eq!(info.state, DaemonState::Busy);
    }

    #[test]
    fn get_idle_filters_states() {
        let registry = MemoryRegistry::new();
        registry.store(info("aaaa0001", DaemonState::Idle));
        registry.store(info("aaaa0002", DaemonState::Busy));
        registry.store(info("aaaa0003", DaemonState::Canceled));

        let idle = registry.get_idle();
        assert_eq!(idle.len(), 1);
        assert_eq!(idle[0].id.as_str(), "aaaa0001");
        assert_eq!(registry.get_all().len(), 3);
    }

    #[test]
    fn remove_is_idempotent() {
        let registry = MemoryRegistry::new();
        registry.store(info("aaaa0001", DaemonState::Idle));
        let id = DaemonId::new("aaaa0001");
        registry.remove(&id);
        registry.remove(&id);
        assert!(registry.get(&id).is_none());
    }

    #[test]
    fn remove_stop_events_matches_structurally() {
        let registry = MemoryRegistry::new();
        let old = DaemonStopEvent {
            daemon_id: DaemonId::new("aaaa0001"),
            timestamp_ms: 1_000,
            status: None,
            reason: "old".into(),
        };
        let recent = DaemonStopEvent {
            daemon_id: DaemonId::new("aaaa0001"),
            timestamp_ms: 2_000,
            status: None,
            reason: "recent".into(),
        };
        registry.store_stop_event(old.clone());
        registry.store_stop_event(recent.clone());

        registry.remove_stop_events(std::slice::from_ref(&old));
        assert_eq!(registry.get_stop_events(), vec![recent]);
    }

    #[test]
    fn expiration_status_orders_immediate_highest() {
        assert!(ExpirationStatus::ImmediateExpire > ExpirationStatus::GracefulExpire);
        assert!(ExpirationStatus::GracefulExpire > ExpirationStatus::QuietExpire);
        // Option ordering puts None below any Some, which stop-event dedup
        // relies on.
        assert!(Some(ExpirationStatus::QuietExpire) > None::<ExpirationStatus>);
    }

    #[test]
    fn daemon_info_serde_roundtrip() {
        let info = info("aaaa0001", DaemonState::Canceled);
        let json = serde_json::to_string(&info).unwrap();
        let parsed: DaemonInfo = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, info.id);
        assert_eq!(parsed.state, DaemonState::Canceled);
    }
}
