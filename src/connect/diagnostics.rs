//! Daemon diagnostics rendered into handshake-failure messages: the tail of
//! the per-daemon log plus OS-level process state.

use std::fs;

use crate::config::DaemonParameters;
use crate::registry::{format_wall_ms, DaemonId};

const LOG_TAIL_LINES: usize = 50;

pub struct DaemonDiagnostics<'a> {
    id: &'a DaemonId,
    parameters: &'a DaemonParameters,
    pid: Option<u32>,
}

impl<'a> DaemonDiagnostics<'a> {
    pub fn new(id: &'a DaemonId, parameters: &'a DaemonParameters) -> Self {
        Self {
            id,
            parameters,
            pid: None,
        }
    }

    pub fn with_pid(mut self, pid: Option<u32>) -> Self {
        self.pid = pid;
        self
    }

    pub fn describe(&self, now_ms: u64) -> String {
        let log_path = self.parameters.daemon_out_log(self.id);
        let mut out = format!(
            "Daemon diagnostics: id = {}, captured at {}\n",
            self.id,
            format_wall_ms(now_ms)
        );

        out.push_str(&match self.pid {
            Some(pid) if process_alive(pid) => format!("  process {pid} is running\n"),
            Some(pid) => format!("  no process with pid {pid}\n"),
            None => "  process state unknown (daemon never registered itself)\n".to_string(),
        });

        match fs::read_to_string(&log_path) {
            Ok(contents) => {
                let lines: Vec<&str> = contents.lines().collect();
                let tail = &lines[lines.len().saturating_sub(LOG_TAIL_LINES)..];
                out.push_str(&format!(
                    "----- Last {} lines from daemon log file - {} -----\n",
                    tail.len(),
                    log_path.display()
                ));
                for line in tail {
                    out.push_str(line);
                    out.push('\n');
                }
                out.push_str("----- End of the daemon log -----");
            }
            Err(e) => {
                out.push_str(&format!(
                    "  daemon log {} is not readable: {e}",
                    log_path.display()
                ));
            }
        }
        out
    }
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    // Signal 0 checks existence without delivering anything.
    kill(Pid::from_raw(pid as i32), None).is_ok()
}

#[cfg(not(unix))]
fn process_alive(_pid: u32) -> bool {
    false
}
