//! XDG directory helpers for the mvnd installation and daemon storage.

use std::path::PathBuf;

/// The mvnd installation directory.
///
/// Uses `MVND_HOME` if set, otherwise `$XDG_DATA_HOME/mvnd` or
/// `~/.local/share/mvnd`.
pub(crate) fn mvnd_home() -> PathBuf {
    if let Ok(dir) = std::env::var("MVND_HOME")
        && !dir.trim().is_empty()
    {
        return PathBuf::from(dir);
    }
    data_dir()
}

/// Base directory for configuration files.
///
/// Uses `MVND_CONFIG_DIR` if set, otherwise `$XDG_CONFIG_HOME/mvnd` or
/// `~/.config/mvnd`.
pub(crate) fn config_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("MVND_CONFIG_DIR")
        && !dir.trim().is_empty()
    {
        return PathBuf::from(dir);
    }

    std::env::var("XDG_CONFIG_HOME")
        .ok()
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".config")
        })
        .join("mvnd")
}

/// Directory for daemon registries and per-daemon logs.
///
/// Uses `MVND_DAEMON_STORAGE` if set, otherwise `<data>/daemon`.
pub(crate) fn daemon_storage() -> PathBuf {
    if let Ok(dir) = std::env::var("MVND_DAEMON_STORAGE")
        && !dir.trim().is_empty()
    {
        return PathBuf::from(dir);
    }
    data_dir().join("daemon")
}

/// The shared daemon registry file.
pub(crate) fn registry_path() -> PathBuf {
    if let Ok(path) = std::env::var("MVND_REGISTRY")
        && !path.trim().is_empty()
    {
        return PathBuf::from(path);
    }
    daemon_storage().join("registry.bin")
}

/// The JVM installation daemons are launched with.
///
/// Uses `MVND_JAVA_HOME`, then `JAVA_HOME`, then `/usr`.
pub(crate) fn java_home() -> PathBuf {
    for var in ["MVND_JAVA_HOME", "JAVA_HOME"] {
        if let Ok(dir) = std::env::var(var)
            && !dir.trim().is_empty()
        {
            return PathBuf::from(dir);
        }
    }
    PathBuf::from("/usr")
}

fn data_dir() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .ok()
        .filter(|s| !s.is_empty())
        .map(PathBuf::from)
        .unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("/tmp"))
                .join(".local")
                .join("share")
        })
        .join("mvnd")
}
