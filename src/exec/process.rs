// src/exec/process.rs

//! Spawning step processes and stopping them together with their children.

use std::collections::BTreeMap;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;

use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// Host variables passed through to steps; everything else comes from the
/// run environment.
const INHERITED_VARS: &[&str] = &["PATH", "HOME"];

/// Build a shell command for `script` with exactly `env` (plus `PATH` and
/// `HOME` from the host) in `workdir`.
///
/// On unix the child leads its own process group so the whole tree can be
/// signalled.
pub fn shell_command(script: &str, env: &BTreeMap<String, String>, workdir: &Path) -> Command {
    let mut cmd = if cfg!(windows) {
        let mut c = Command::new("cmd");
        c.arg("/C").arg(script);
        c
    } else {
        let mut c = Command::new("sh");
        c.arg("-c").arg(script);
        c
    };

    cmd.env_clear();
    for name in INHERITED_VARS {
        if let Some(value) = std::env::var_os(name) {
            cmd.env(name, value);
        }
    }
    cmd.envs(env)
        .current_dir(workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    #[cfg(unix)]
    cmd.process_group(0);

    cmd
}

/// Ask the process tree to stop, escalating to a hard kill after `grace`.
#[cfg(unix)]
pub async fn terminate(child: &mut Child, grace: Duration) -> std::io::Result<ExitStatus> {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    let Some(pid) = child.id() else {
        // Already reaped.
        return child.wait().await;
    };
    let group = Pid::from_raw(pid as i32);

    if let Err(err) = killpg(group, Signal::SIGTERM) {
        debug!(pid, error = %err, "SIGTERM to process group failed");
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(status) => {
            // The leader is gone; make sure nothing it spawned outlives it.
            let _ = killpg(group, Signal::SIGKILL);
            status
        }
        Err(_) => {
            warn!(pid, grace_ms = grace.as_millis() as u64, "process ignored SIGTERM; sending SIGKILL");
            if let Err(err) = killpg(group, Signal::SIGKILL) {
                debug!(pid, error = %err, "SIGKILL to process group failed");
            }
            child.wait().await
        }
    }
}

#[cfg(not(unix))]
pub async fn terminate(child: &mut Child, _grace: Duration) -> std::io::Result<ExitStatus> {
    child.kill().await?;
    child.wait().await
}
