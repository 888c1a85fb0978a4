//! Compatibility predicate: does a daemon's recorded runtime profile satisfy
//! the caller's requirements?

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::config::DaemonParameters;
use crate::registry::DaemonInfo;

/// The caller's runtime requirements.
#[derive(Debug, Clone)]
pub struct CompatibilitySpec {
    java_home: PathBuf,
    daemon_opts: BTreeMap<String, String>,
}

/// Verdict plus a diagnostic reason on mismatch.
#[derive(Debug, Clone)]
pub struct Compatibility {
    pub compatible: bool,
    pub why: String,
}

impl Compatibility {
    fn ok() -> Self {
        Self {
            compatible: true,
            why: String::new(),
        }
    }

    fn incompatible(why: impl Into<String>) -> Self {
        Self {
            compatible: false,
            why: why.into(),
        }
    }
}

impl CompatibilitySpec {
    pub fn new(java_home: PathBuf, daemon_opts: BTreeMap<String, String>) -> Self {
        Self {
            java_home,
            daemon_opts,
        }
    }

    pub fn from_parameters(parameters: &DaemonParameters) -> Self {
        Self::new(parameters.java_home.clone(), parameters.daemon_opts.clone())
    }

    /// Pure and side-effect-free; callers log `why` on mismatch.
    pub fn check(&self, daemon: &DaemonInfo) -> Compatibility {
        if !same_path(&self.java_home, &daemon.runtime.java_home) {
            return Compatibility::incompatible(format!(
                "JVM is incompatible: daemon uses {}, requested {}",
                daemon.runtime.java_home.display(),
                self.java_home.display(),
            ));
        }

        // Discriminating options must match exactly, both ways.
        for (key, wanted) in &self.daemon_opts {
            match daemon.runtime.daemon_opts.get(key) {
                Some(actual) if actual == wanted => {}
                Some(actual) => {
                    return Compatibility::incompatible(format!(
                        "option {key} is {actual:?}, requested {wanted:?}"
                    ));
                }
                None => {
                    return Compatibility::incompatible(format!(
                        "option {key} is not set on the daemon, requested {wanted:?}"
                    ));
                }
            }
        }
        if let Some(extra) = daemon
            .runtime
            .daemon_opts
            .keys()
            .find(|key| !self.daemon_opts.contains_key(*key))
        {
            return Compatibility::incompatible(format!(
                "daemon sets option {extra} which was not requested"
            ));
        }

        Compatibility::ok()
    }
}

/// Symlink-tolerant path equality: compare canonical forms when both resolve.
fn same_path(a: &Path, b: &Path) -> bool {
    if a == b {
        return true;
    }
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}
