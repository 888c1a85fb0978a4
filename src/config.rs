//! Connector parameters: loading and persistence.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::paths;
use crate::registry::DaemonId;

/// Everything the connector needs to select, launch and talk to a daemon.
///
/// Values come from `<config_dir>/mvnd.toml` when present, with `MVND_*`
/// environment overrides applied on top (see [`DaemonParameters::discover`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonParameters {
    /// Run the build inside the client process instead of a daemon.
    pub no_daemon: bool,
    pub java_home: PathBuf,
    pub mvnd_home: PathBuf,
    /// The project directory builds run in; also the daemon's working dir.
    pub project_dir: PathBuf,
    pub user_home: PathBuf,
    /// Daemon registries and per-daemon logs live here.
    pub storage_dir: PathBuf,
    pub registry_path: PathBuf,
    pub log_config_path: PathBuf,
    /// Free-form JVM args, whitespace-separated.
    pub jvm_args: Option<String>,
    pub min_heap_size: Option<String>,
    pub max_heap_size: Option<String>,
    /// Suspend the daemon JVM waiting for a remote debugger.
    pub debug: bool,
    pub debug_address: String,
    /// Discriminating daemon options: a daemon is only reused by clients
    /// whose option map is identical.
    pub daemon_opts: BTreeMap<String, String>,
}

impl Default for DaemonParameters {
    fn default() -> Self {
        let mvnd_home = paths::mvnd_home();
        Self {
            no_daemon: false,
            java_home: paths::java_home(),
            log_config_path: mvnd_home
                .join("mvn")
                .join("conf")
                .join("logging")
                .join("logback.xml"),
            mvnd_home,
            project_dir: PathBuf::from("."),
            user_home: dirs::home_dir().unwrap_or_else(|| PathBuf::from("/tmp")),
            storage_dir: paths::daemon_storage(),
            registry_path: paths::registry_path(),
            jvm_args: None,
            min_heap_size: None,
            max_heap_size: None,
            debug: false,
            debug_address: "8000".to_string(),
            daemon_opts: BTreeMap::new(),
        }
    }
}

impl DaemonParameters {
    /// Parameters for a build in `project_dir`: file config when present,
    /// defaults otherwise, environment overrides on top.
    pub fn discover(project_dir: impl Into<PathBuf>) -> Self {
        let path = config_path();
        let mut params = if path.exists() {
            match load_from(&path) {
                Ok(params) => params,
                Err(e) => {
                    tracing::warn!("config load failed, using defaults: {e}");
                    Self::default()
                }
            }
        } else {
            Self::default()
        };
        params.project_dir = project_dir.into();
        params.apply_env_overrides();
        params
    }

    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("MVND_NO_DAEMON") {
            self.no_daemon = matches!(v.trim(), "1" | "true");
        }
        for (var, field) in [
            ("MVND_HOME", &mut self.mvnd_home),
            ("MVND_JAVA_HOME", &mut self.java_home),
            ("MVND_DAEMON_STORAGE", &mut self.storage_dir),
            ("MVND_REGISTRY", &mut self.registry_path),
        ] {
            if let Ok(v) = std::env::var(var)
                && !v.trim().is_empty()
            {
                *field = PathBuf::from(v);
            }
        }
    }

    /// Per-project JVM options file, one whitespace-separated list.
    pub fn jvm_config_path(&self) -> PathBuf {
        self.project_dir.join(".mvn").join("jvm.config")
    }

    /// The file a spawned daemon's stdout and stderr are appended to.
    pub fn daemon_out_log(&self, id: &DaemonId) -> PathBuf {
        self.storage_dir.join(format!("daemon-{id}.out.log"))
    }
}

pub fn config_path() -> PathBuf {
    paths::config_dir().join("mvnd.toml")
}

pub fn load_from(path: &Path) -> Result<DaemonParameters, ConfigError> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_owned(),
        source,
    })?;
    toml::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_owned(),
        source,
    })
}

/// Persist parameters atomically (write-then-rename in the target directory).
pub fn write_config(path: &Path, params: &DaemonParameters) -> Result<(), ConfigError> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).map_err(|source| ConfigError::Persist {
            path: path.to_owned(),
            source,
        })?;
    }
    let contents = toml::to_string_pretty(params).map_err(|e| ConfigError::Render {
        path: path.to_owned(),
        reason: e.to_string(),
    })?;
    atomic_write(path, contents.as_bytes())
}

fn atomic_write(path: &Path, data: &[u8]) -> Result<(), ConfigError> {
    let persist_err = |source: io::Error| ConfigError::Persist {
        path: path.to_owned(),
        source,
    };
    let dir = path.parent().ok_or_else(|| ConfigError::Render {
        path: path.to_owned(),
        reason: "config path missing parent directory".to_string(),
    })?;
    let temp = tempfile::NamedTempFile::new_in(dir).map_err(persist_err)?;
    fs::write(temp.path(), data).map_err(persist_err)?;
    temp.persist(path).map_err(|e| persist_err(e.error))?;
    Ok(())
}

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to render {}: {reason}", path.display())]
    Render { path: PathBuf, reason: String },

    #[error("failed to persist {}: {source}", path.display())]
    Persist {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
}
