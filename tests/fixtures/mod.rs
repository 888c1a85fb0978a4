//! Shared wiring for connector integration tests: a scripted registry, a
//! scripted launcher, and a status sink, all driven by the simulated clock.

use std::collections::BTreeMap;
use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use mvnd_client::connect::{ClientOutput, DaemonProcess, Launcher, StartError};
use mvnd_client::registry::{
    DaemonId, DaemonInfo, DaemonRegistry, DaemonState, DaemonStopEvent, MemoryRegistry,
    RuntimeProfile,
};
use mvnd_client::clock::{Clock, FakeClock};
use mvnd_client::DaemonParameters;

pub const JAVA_HOME: &str = "/opt/jdk17";

/// Collects the status lines the connector emits.
#[derive(Clone, Default)]
pub struct StatusSink {
    messages: Arc<Mutex<Vec<String>>>,
}

impl StatusSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().expect("status lock poisoned").clone()
    }
}

impl ClientOutput for StatusSink {
    fn status(&self, message: &str) {
        self.messages
            .lock()
            .expect("status lock poisoned")
            .push(message.to_string());
    }
}

/// Registry whose records can appear or turn idle at scripted simulated
/// times, settling lazily on every read the way a drifting shared registry
/// would.
pub struct SimRegistry {
    inner: MemoryRegistry,
    clock: FakeClock,
    pending: Mutex<Vec<(u64, DaemonInfo)>>,
    idle_at: Mutex<Vec<(u64, DaemonId)>>,
}

impl SimRegistry {
    pub fn new(clock: FakeClock) -> Self {
        Self {
            inner: MemoryRegistry::new(),
            clock,
            pending: Mutex::new(Vec::new()),
            idle_at: Mutex::new(Vec::new()),
        }
    }

    pub fn store(&self, info: DaemonInfo) {
        self.inner.store(info);
    }

    /// Make `info` appear in the registry once the clock reaches `at_ms`.
    pub fn store_at(&self, at_ms: u64, info: DaemonInfo) {
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .push((at_ms, info));
    }

    /// Flip an existing record to `Idle` once the clock reaches `at_ms`.
    pub fn idle_at(&self, at_ms: u64, id: DaemonId) {
        self.idle_at
            .lock()
            .expect("idle lock poisoned")
            .push((at_ms, id));
    }

    fn settle(&self) {
        let now = self.clock.now_ms();
        self.pending
            .lock()
            .expect("pending lock poisoned")
            .retain(|(at, info)| {
                if *at <= now {
                    self.inner.store(info.clone());
                    false
                } else {
                    true
                }
            });
        self.idle_at
            .lock()
            .expect("idle lock poisoned")
            .retain(|(at, id)| {
                if *at <= now {
                    if let Some(info) = self.inner.get(id) {
                        self.inner.store(info.with_state(DaemonState::Idle));
                    }
                    false
                } else {
                    true
                }
            });
    }
}

impl DaemonRegistry for SimRegistry {
    fn get_all(&self) -> Vec<DaemonInfo> {
        self.settle();
        self.inner.get_all()
    }

    fn get(&self, id: &DaemonId) -> Option<DaemonInfo> {
        self.settle();
        self.inner.get(id)
    }

    fn remove(&self, id: &DaemonId) {
        self.inner.remove(id);
    }

    fn get_stop_events(&self) -> Vec<DaemonStopEvent> {
        self.inner.get_stop_events()
    }

    fn store_stop_event(&self, event: DaemonStopEvent) {
        self.inner.store_stop_event(event);
    }

    fn remove_stop_events(&self, events: &[DaemonStopEvent]) {
        self.inner.remove_stop_events(events);
    }
}

/// Child handle that dies at a scripted simulated time (or never).
pub struct ScriptedProcess {
    clock: FakeClock,
    dies_at_ms: Option<u64>,
}

impl ScriptedProcess {
    pub fn immortal(clock: FakeClock) -> Self {
        Self {
            clock,
            dies_at_ms: None,
        }
    }

    pub fn dying_at(clock: FakeClock, at_ms: u64) -> Self {
        Self {
            clock,
            dies_at_ms: Some(at_ms),
        }
    }
}

impl DaemonProcess for ScriptedProcess {
    fn is_alive(&mut self) -> bool {
        self.dies_at_ms.is_none_or(|at| self.clock.now_ms() < at)
    }
}

type LaunchScript =
    Box<dyn Fn(&DaemonId) -> Result<Box<dyn DaemonProcess>, StartError> + Send + Sync>;

/// Launcher seam: runs a script instead of spawning a JVM, counting calls.
pub struct ScriptedLauncher {
    calls: AtomicUsize,
    script: LaunchScript,
}

impl ScriptedLauncher {
    pub fn new(script: LaunchScript) -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
            script,
        })
    }

    /// For paths where a launch would violate the scenario.
    pub fn panicking() -> Arc<Self> {
        Self::new(Box::new(|id| {
            panic!("launcher must not be invoked (daemon id {id})")
        }))
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Launcher for ScriptedLauncher {
    fn launch(&self, id: &DaemonId) -> Result<Box<dyn DaemonProcess>, StartError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        (self.script)(id)
    }
}

pub fn runtime_profile() -> RuntimeProfile {
    RuntimeProfile {
        java_home: PathBuf::from(JAVA_HOME),
        daemon_opts: BTreeMap::new(),
    }
}

pub fn daemon(id: &str, port: u16, state: DaemonState) -> DaemonInfo {
    DaemonInfo::new(DaemonId::new(id), port, 4242, runtime_profile()).with_state(state)
}

pub fn parameters(storage: &std::path::Path) -> DaemonParameters {
    let mut params = DaemonParameters::default();
    params.java_home = PathBuf::from(JAVA_HOME);
    params.daemon_opts = BTreeMap::new();
    params.storage_dir = storage.to_owned();
    params.registry_path = storage.join("registry.bin");
    params
}

/// Bind a loopback listener and keep it alive for the test's duration.
pub fn bind_listener(keep: &Mutex<Vec<TcpListener>>) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind listener");
    let port = listener.local_addr().expect("local addr").port();
    keep.lock().expect("listener lock poisoned").push(listener);
    port
}

/// A loopback port with nothing listening on it.
pub fn dead_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind listener");
    listener.local_addr().expect("local addr").port()
}
