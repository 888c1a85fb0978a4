//! Daemon launcher: assemble the JVM command line and spawn a detached
//! daemon process.
//!
//! The launcher never waits for the daemon to become ready; that is the
//! orchestrator's handshake poll.

use std::fs::{self, OpenOptions};
use std::io;
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;

use thiserror::Error;

use crate::config::DaemonParameters;
use crate::registry::DaemonId;

/// Entry point class of the daemon JVM.
const DAEMON_MAIN_CLASS: &str = "org.mvndaemon.mvnd.common.MavenDaemon";

const COMMON_JAR_PREFIX: &str = "mvnd-common-";
const AGENT_JAR_PREFIX: &str = "mvnd-agent-";

/// A spawned daemon, observed only for liveness during the handshake.
///
/// The client does not own the daemon: it is never killed or waited on
/// beyond these polls.
pub trait DaemonProcess: Send {
    fn is_alive(&mut self) -> bool;
}

impl DaemonProcess for Child {
    fn is_alive(&mut self) -> bool {
        matches!(self.try_wait(), Ok(None))
    }
}

/// Spawns daemons. A trait so tests can script the launch.
pub trait Launcher: Send + Sync {
    fn launch(&self, id: &DaemonId) -> Result<Box<dyn DaemonProcess>, StartError>;
}

impl<T: Launcher + ?Sized> Launcher for Arc<T> {
    fn launch(&self, id: &DaemonId) -> Result<Box<dyn DaemonProcess>, StartError> {
        self.as_ref().launch(id)
    }
}

/// Production launcher: spawns a daemon JVM detached from the client, with
/// stdout and stderr appended to the per-daemon log file.
pub struct ProcessLauncher {
    parameters: DaemonParameters,
}

impl ProcessLauncher {
    pub fn new(parameters: DaemonParameters) -> Self {
        Self { parameters }
    }

    /// Assemble the full argv, executable first, entry-point class last.
    fn daemon_args(&self, id: &DaemonId) -> Result<Vec<String>, StartError> {
        let params = &self.parameters;
        let (common_jar, agent_jar) = find_daemon_artifacts(params)?;

        let java = params
            .java_home
            .join("bin")
            .join(if cfg!(windows) { "java.exe" } else { "java" });
        let classpath_sep = if cfg!(windows) { ";" } else { ":" };

        let mut args = vec![
            java.display().to_string(),
            "-classpath".to_string(),
            format!(
                "{}{}{}",
                common_jar.display(),
                classpath_sep,
                agent_jar.display()
            ),
            format!("-javaagent:{}", agent_jar.display()),
        ];

        if params.debug {
            args.push(format!(
                "-agentlib:jdwp=transport=dt_socket,server=y,suspend=y,address={}",
                params.debug_address
            ));
        }

        if let Some(jvm_args) = &params.jvm_args {
            args.extend(jvm_args.split_whitespace().map(String::from));
        }

        // .mvn/jvm.config, when the project carries one
        let jvm_config = params.jvm_config_path();
        if jvm_config.is_file() {
            let contents = fs::read_to_string(&jvm_config).map_err(|e| StartError::Config {
                reason: format!("failed to read {}: {e}", jvm_config.display()),
            })?;
            args.extend(contents.split_whitespace().map(String::from));
        }

        if let Some(min) = &params.min_heap_size {
            args.push(format!("-Xms{min}"));
        }
        if let Some(max) = &params.max_heap_size {
            args.push(format!("-Xmx{max}"));
        }

        args.push(format!("-Dmvnd.home={}", params.mvnd_home.display()));
        args.push(format!("-Dmvnd.java.home={}", params.java_home.display()));
        args.push(format!(
            "-Dlogback.configurationFile={}",
            params.log_config_path.display()
        ));
        args.push(format!("-Dmvnd.id={id}"));
        args.push(format!(
            "-Dmvnd.daemonStorage={}",
            params.storage_dir.display()
        ));
        args.push(format!("-Dmvnd.registry={}", params.registry_path.display()));
        for (key, value) in &params.daemon_opts {
            args.push(format!("-D{key}={value}"));
        }

        args.push(DAEMON_MAIN_CLASS.to_string());
        Ok(args)
    }
}

impl Launcher for ProcessLauncher {
    fn launch(&self, id: &DaemonId) -> Result<Box<dyn DaemonProcess>, StartError> {
        let params = &self.parameters;
        let args = self.daemon_args(id)?;
        let command = args.join(" ");
        tracing::debug!(
            daemon = %id,
            working_dir = %params.project_dir.display(),
            %command,
            "starting daemon process"
        );

        let spawn_err = |source: io::Error| StartError::Spawn {
            id: id.clone(),
            working_dir: params.project_dir.clone(),
            command: command.clone(),
            source,
        };

        let log_path = params.daemon_out_log(id);
        if let Some(dir) = log_path.parent() {
            fs::create_dir_all(dir).map_err(spawn_err)?;
        }
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(spawn_err)?;
        let log_err = log.try_clone().map_err(spawn_err)?;

        let child = Command::new(&args[0])
            .args(&args[1..])
            .current_dir(&params.project_dir)
            .stdin(Stdio::null())
            .stdout(log)
            .stderr(log_err)
            .spawn()
            .map_err(spawn_err)?;

        Ok(Box::new(child))
    }
}

/// Locate the common and agent jars in `<mvnd_home>/mvn/lib/ext` by filename
/// prefix. Both must be present.
fn find_daemon_artifacts(params: &DaemonParameters) -> Result<(PathBuf, PathBuf), StartError> {
    let lib_dir = params.mvnd_home.join("mvn").join("lib").join("ext");
    let entries = fs::read_dir(&lib_dir).map_err(|e| StartError::Config {
        reason: format!("failed to read {}: {e}", lib_dir.display()),
    })?;

    let mut common = None;
    let mut agent = None;
    for entry in entries.flatten() {
        let path = entry.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !name.ends_with(".jar") {
            continue;
        }
        if name.starts_with(COMMON_JAR_PREFIX) {
            common = Some(path);
        } else if name.starts_with(AGENT_JAR_PREFIX) {
            agent = Some(path);
        }
    }

    match (common, agent) {
        (Some(common), Some(agent)) => Ok((common, agent)),
        (None, _) => Err(StartError::MissingArtifact {
            prefix: COMMON_JAR_PREFIX,
            dir: lib_dir,
        }),
        (_, None) => Err(StartError::MissingArtifact {
            prefix: AGENT_JAR_PREFIX,
            dir: lib_dir,
        }),
    }
}

/// Subprocess spawn failed, or the launch configuration is unusable.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum StartError {
    #[error("could not find {prefix}*.jar in {}", dir.display())]
    MissingArtifact { prefix: &'static str, dir: PathBuf },

    #[error("invalid daemon configuration: {reason}")]
    Config { reason: String },

    #[error("error starting daemon: id = {id}, working dir = {}, args: {command}", working_dir.display())]
    Spawn {
        id: DaemonId,
        working_dir: PathBuf,
        command: String,
        #[source]
        source: io::Error,
    },
}
